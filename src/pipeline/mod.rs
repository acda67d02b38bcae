//! Hourly run orchestration: the five pipeline stages and the run identity
//! that keys everything they write.

pub mod aggregate;
pub mod merge;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use futures::{stream, StreamExt};
use std::fmt;
use tracing::{info, warn};

use crate::database_ops::db::Db;
use crate::database_ops::steam::provider::SteamClient;
use crate::normalization::value::coerce_int;
use crate::util::env::env_parse;

/// One scheduled execution of the pipeline. The (date, hour) pair is the
/// join key across all raw tables and part of every persisted row's
/// uniqueness key; it never changes once derived from the trigger time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunIdentity {
    pub run_date: NaiveDate,
    pub run_hour: i32,
}

impl RunIdentity {
    pub fn new(run_date: NaiveDate, run_hour: i32) -> Result<Self> {
        if !(0..=23).contains(&run_hour) {
            anyhow::bail!("run_hour must be 0-23, got {run_hour}");
        }
        Ok(Self { run_date, run_hour })
    }

    /// Derive the run identity from the scheduler's trigger time.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            run_date: at.date_naive(),
            run_hour: at.hour() as i32,
        }
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hour {:02}", self.run_date, self.run_hour)
    }
}

fn fetch_concurrency() -> usize {
    env_parse("STEAM_FETCH_CONCURRENCY", 4usize).max(1)
}

/// Stage 1: fetch the trending top-100 and persist it as this run's seed
/// list. Everything downstream fans out from these appids.
pub async fn fetch_trending_stage(
    db: &Db,
    steam: &SteamClient,
    run: &RunIdentity,
) -> Result<usize> {
    let entries = steam
        .top100_trending()
        .await
        .context("fetching trending top 100")?;
    if entries.is_empty() {
        warn!(%run, "no trending games fetched");
        return Ok(0);
    }
    db.upsert_trending(run.run_date, run.run_hour, &entries).await
}

/// Stage 2: fetch store details for appids not yet in the catalog. The
/// catalog is slow-changing, so appids already present are skipped to keep
/// API volume down — created on first sighting, never updated here.
pub async fn fetch_catalog_stage(db: &Db, steam: &SteamClient, run: &RunIdentity) -> Result<usize> {
    let appids = db.trending_appids_for_run(run.run_date, run.run_hour).await?;
    if appids.is_empty() {
        warn!(%run, "no appids in trending_games for this run");
        return Ok(0);
    }
    let existing = db.catalog_existing_appids(&appids).await?;
    let new_appids: Vec<i64> = appids
        .into_iter()
        .filter(|id| !existing.contains(id))
        .collect();
    info!(new = new_appids.len(), existing = existing.len(), "catalog fan-out");
    if new_appids.is_empty() {
        return Ok(0);
    }

    let entries: Vec<_> = stream::iter(new_appids)
        .map(|appid| steam.game_details(appid))
        .buffer_unordered(fetch_concurrency())
        .filter_map(|detail| async move { detail })
        .collect()
        .await;
    db.insert_catalog_entries(&entries).await
}

/// Stage 3: fetch the live player count for each trending appid.
pub async fn fetch_player_count_stage(
    db: &Db,
    steam: &SteamClient,
    run: &RunIdentity,
) -> Result<usize> {
    let appids = db.trending_appids_for_run(run.run_date, run.run_hour).await?;
    if appids.is_empty() {
        warn!(%run, "no appids in trending_games for this run");
        return Ok(0);
    }
    let entries: Vec<_> = stream::iter(appids)
        .map(|appid| steam.player_count(appid))
        .buffer_unordered(fetch_concurrency())
        .filter_map(|count| async move { count })
        .collect()
        .await;
    db.upsert_player_counts(run.run_date, run.run_hour, &entries).await
}

/// Stage 4: fetch SteamSpy popularity stats for each trending appid.
pub async fn fetch_popularity_stage(
    db: &Db,
    steam: &SteamClient,
    run: &RunIdentity,
) -> Result<usize> {
    let appids = db.trending_appids_for_run(run.run_date, run.run_hour).await?;
    if appids.is_empty() {
        warn!(%run, "no appids in trending_games for this run");
        return Ok(0);
    }
    let entries: Vec<_> = stream::iter(appids)
        .map(|appid| steam.popularity_stats(appid))
        .buffer_unordered(fetch_concurrency())
        .filter_map(|stats| async move { stats })
        .collect()
        .await;
    db.upsert_popularity_stats(run.run_date, run.run_hour, &entries).await
}

/// Stage 5: load the run's four raw result sets, aggregate them into
/// canonical records, and write the batch in one keyed upsert. Safe to
/// re-run for an already-completed hour.
pub async fn merge_and_clean_stage(db: &Db, run: &RunIdentity) -> Result<usize> {
    let trending = db.load_trending_for_run(run.run_date, run.run_hour).await?;
    if trending.is_empty() {
        warn!(%run, "no trending games found for this run; nothing to merge");
        return Ok(0);
    }

    let appids: Vec<i64> = trending
        .iter()
        .filter_map(|t| coerce_int(&t.appid, None))
        .collect();
    let (catalog, players, popularity) = tokio::try_join!(
        db.load_catalog_for(&appids),
        db.load_player_counts_for_run(run.run_date, run.run_hour, &appids),
        db.load_popularity_for_run(run.run_date, run.run_hour, &appids),
    )?;
    info!(
        trending = trending.len(),
        catalog = catalog.len(),
        players = players.len(),
        popularity = popularity.len(),
        %run,
        "raw result sets loaded"
    );

    let records = aggregate::aggregate_run(&trending, &catalog, &players, &popularity, run);
    db.upsert_cleaned_records(&records).await
}

/// Drive one full hourly run: trending seeds the fan-out, the three
/// companion fetches run concurrently, then the merge closes the run.
pub async fn run_hourly_pipeline(db: &Db, steam: &SteamClient, run: &RunIdentity) -> Result<()> {
    info!(%run, "pipeline run starting");
    let seeded = fetch_trending_stage(db, steam, run)
        .await
        .context("trending stage")?;
    if seeded == 0 {
        warn!(%run, "trending stage produced no rows; skipping remaining stages");
        return Ok(());
    }

    tokio::try_join!(
        fetch_catalog_stage(db, steam, run),
        fetch_player_count_stage(db, steam, run),
        fetch_popularity_stage(db, steam, run),
    )
    .context("companion fetch stages")?;

    let cleaned = merge_and_clean_stage(db, run).await.context("merge stage")?;
    info!(%run, cleaned, "pipeline run complete");
    Ok(())
}
