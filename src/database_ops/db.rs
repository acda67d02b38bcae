use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, QueryBuilder, Row,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::normalization::value::{coerce_float, coerce_int};

/// Storage width of `games_cleaned.name`.
pub const NAME_MAX_CHARS: usize = 500;

/// One game from the SteamSpy top-100 trending feed.
///
/// `appid` and `median_2weeks` stay loosely typed: SteamSpy keys the feed by
/// appid *string* and has been observed flipping numeric fields between
/// numbers and strings. Coercion happens in one place (the normalizer), not
/// at decode time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrendingEntry {
    pub appid: Value,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub median_2weeks: Value,
}

/// Slow-changing per-game metadata from the Steam store appdetails endpoint.
/// Written once per appid, never updated by this pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub appid: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub developer: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub genres: String,
    /// `price_overview.final` passes through untouched; the store reports
    /// minor units, the unit inference lives in the normalizer.
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub platforms: String,
}

/// Live player count snapshot, one per (appid, run).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerCountEntry {
    pub appid: i64,
    #[serde(default)]
    pub current_players: Value,
}

/// SteamSpy popularity snapshot, one per (appid, run).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PopularityEntry {
    pub appid: i64,
    #[serde(default)]
    pub owners: Option<String>,
    #[serde(default)]
    pub ccu: Value,
    #[serde(default)]
    pub positive: Value,
    #[serde(default)]
    pub negative: Value,
    #[serde(default)]
    pub average_forever: Value,
    #[serde(default)]
    pub average_2weeks: Value,
    #[serde(default)]
    pub median_forever: Value,
    #[serde(default)]
    pub median_2weeks: Value,
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub tags: String,
}

/// The analytics-ready row for one game in one run; the unit written to
/// `games_cleaned` via keyed upsert on (appid, run_date, run_hour).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedRecord {
    pub run_date: NaiveDate,
    pub run_hour: i32,
    pub appid: i64,
    pub name: String,
    pub current_players: Option<i64>,
    pub ccu: Option<i64>,
    pub average_playtime_2weeks: Option<i64>,
    pub median_playtime_2weeks: Option<i64>,
    pub estimated_owners: Option<i32>,
    pub positive_reviews: Option<i64>,
    pub negative_reviews: Option<i64>,
    pub average_playtime_forever: Option<i64>,
    pub median_playtime_forever: Option<i64>,
    pub price_usd: Option<f64>,
    pub score_rank: i32,
    pub discount_percent: i32,
}

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");

        // Schema is applied explicitly (db_migrate) or via AUTO_MIGRATE=1;
        // default off so the hourly binary never pushes DDL at the database.
        if crate::util::env::env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            Self::run_migrations(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Apply `./migrations/<version>_<desc>.sql` files in version order,
    /// tracking applied versions in `_sqlx_migrations`. Files without a
    /// numeric prefix are ignored.
    pub async fn run_migrations(pool: &PgPool) -> Result<()> {
        use std::{fs, path::Path};
        let dir = Path::new("./migrations");
        if !dir.exists() {
            return Ok(());
        }
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;

        let applied_rows = sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
            .fetch_all(pool)
            .await?;
        let mut applied: HashSet<i64> = HashSet::new();
        for r in applied_rows {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut candidates: Vec<(i64, String, std::path::PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !fname.ends_with(".sql") {
                continue;
            }
            let num: String = fname.chars().take_while(|c| c.is_ascii_digit()).collect();
            let Ok(version) = num.parse::<i64>() else {
                continue;
            };
            let desc = fname[num.len()..]
                .trim_start_matches('_')
                .trim_end_matches(".sql")
                .to_string();
            candidates.push((version, desc, path));
        }
        candidates.sort_by_key(|(v, _, _)| *v);

        for (version, desc, path) in candidates {
            if applied.contains(&version) {
                continue;
            }
            let sql = fs::read_to_string(&path)?;
            info!(version, file = ?path, "applying migration");
            sqlx::raw_sql(sql.trim()).execute(pool).await?;
            sqlx::query("INSERT INTO _sqlx_migrations(version, description) VALUES ($1, $2)")
                .bind(version)
                .bind(&desc)
                .execute(pool)
                .await?;
            applied.insert(version);
        }
        Ok(())
    }
}

fn int_value(v: Option<i64>) -> Value {
    v.map(Value::from).unwrap_or(Value::Null)
}

fn float_value(v: Option<f64>) -> Value {
    v.map(Value::from).unwrap_or(Value::Null)
}

impl Db {
    /// Insert or replace the run's trending list. Entries whose appid does
    /// not coerce to an integer are skipped with a warning — they could
    /// never be joined downstream anyway.
    #[instrument(skip(self, entries))]
    pub async fn upsert_trending(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
        entries: &[TrendingEntry],
    ) -> Result<usize> {
        let rows: Vec<(i64, &TrendingEntry)> = entries
            .iter()
            .filter_map(|e| match coerce_int(&e.appid, None) {
                Some(appid) => Some((appid, e)),
                None => {
                    warn!(appid = %e.appid, name = %e.name, "trending entry with non-numeric appid skipped");
                    None
                }
            })
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO trending_games (run_date, run_hour, appid, name, median_2weeks) ",
        );
        qb.push_values(&rows, |mut b, (appid, e)| {
            b.push_bind(run_date)
                .push_bind(run_hour)
                .push_bind(*appid)
                .push_bind(&e.name)
                .push_bind(coerce_int(&e.median_2weeks, None));
        });
        qb.push(
            " ON CONFLICT (appid, run_date, run_hour)
              DO UPDATE SET name = EXCLUDED.name,
                            median_2weeks = EXCLUDED.median_2weeks",
        );
        qb.build().execute(&self.pool).await?;
        info!(rows = rows.len(), "trending_games upserted");
        Ok(rows.len())
    }

    /// Insert first-sighting catalog rows. Existing appids are left alone:
    /// the catalog is write-once from this pipeline's point of view.
    #[instrument(skip(self, entries))]
    pub async fn insert_catalog_entries(&self, entries: &[CatalogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO game_catalog (appid, name, developer, release_date, genres, price, description, platforms) ",
        );
        qb.push_values(entries, |mut b, e| {
            b.push_bind(e.appid)
                .push_bind(&e.name)
                .push_bind(&e.developer)
                .push_bind(&e.release_date)
                .push_bind(&e.genres)
                .push_bind(coerce_float(&e.price, None))
                .push_bind(&e.description)
                .push_bind(&e.platforms);
        });
        qb.push(" ON CONFLICT (appid) DO NOTHING");
        qb.build().execute(&self.pool).await?;
        info!(rows = entries.len(), "game_catalog rows inserted");
        Ok(entries.len())
    }

    #[instrument(skip(self, entries))]
    pub async fn upsert_player_counts(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
        entries: &[PlayerCountEntry],
    ) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO player_count (appid, run_date, run_hour, current_players) ",
        );
        qb.push_values(entries, |mut b, e| {
            b.push_bind(e.appid)
                .push_bind(run_date)
                .push_bind(run_hour)
                .push_bind(coerce_int(&e.current_players, None));
        });
        qb.push(
            " ON CONFLICT (appid, run_date, run_hour)
              DO UPDATE SET current_players = EXCLUDED.current_players,
                            recorded_at = now()",
        );
        qb.build().execute(&self.pool).await?;
        info!(rows = entries.len(), "player_count upserted");
        Ok(entries.len())
    }

    #[instrument(skip(self, entries))]
    pub async fn upsert_popularity_stats(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
        entries: &[PopularityEntry],
    ) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO popularity_stats \
             (appid, run_date, run_hour, owners, ccu, positive, negative, \
              average_forever, average_2weeks, median_forever, median_2weeks, price, tags) ",
        );
        qb.push_values(entries, |mut b, e| {
            b.push_bind(e.appid)
                .push_bind(run_date)
                .push_bind(run_hour)
                .push_bind(e.owners.as_deref())
                .push_bind(coerce_int(&e.ccu, None))
                .push_bind(coerce_int(&e.positive, None))
                .push_bind(coerce_int(&e.negative, None))
                .push_bind(coerce_int(&e.average_forever, None))
                .push_bind(coerce_int(&e.average_2weeks, None))
                .push_bind(coerce_int(&e.median_forever, None))
                .push_bind(coerce_int(&e.median_2weeks, None))
                .push_bind(coerce_float(&e.price, None))
                .push_bind(&e.tags);
        });
        qb.push(
            " ON CONFLICT (appid, run_date, run_hour)
              DO UPDATE SET owners = EXCLUDED.owners,
                            ccu = EXCLUDED.ccu,
                            positive = EXCLUDED.positive,
                            negative = EXCLUDED.negative,
                            average_forever = EXCLUDED.average_forever,
                            average_2weeks = EXCLUDED.average_2weeks,
                            median_forever = EXCLUDED.median_forever,
                            median_2weeks = EXCLUDED.median_2weeks,
                            price = EXCLUDED.price,
                            tags = EXCLUDED.tags,
                            recorded_at = now()",
        );
        qb.build().execute(&self.pool).await?;
        info!(rows = entries.len(), "popularity_stats upserted");
        Ok(entries.len())
    }

    /// Write the run's canonical records in one batched statement. On key
    /// collision every non-key column is overwritten, which is what makes
    /// re-running a completed hour safe.
    #[instrument(skip(self, records))]
    pub async fn upsert_cleaned_records(&self, records: &[CleanedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO games_cleaned \
             (run_date, run_hour, appid, name, current_players, ccu, average_playtime_2weeks, \
              median_playtime_2weeks, estimated_owners, positive_reviews, negative_reviews, \
              average_playtime_forever, median_playtime_forever, price_usd, score_rank, discount_percent) ",
        );
        qb.push_values(records, |mut b, r| {
            b.push_bind(r.run_date)
                .push_bind(r.run_hour)
                .push_bind(r.appid)
                .push_bind(&r.name)
                .push_bind(r.current_players)
                .push_bind(r.ccu)
                .push_bind(r.average_playtime_2weeks)
                .push_bind(r.median_playtime_2weeks)
                .push_bind(r.estimated_owners)
                .push_bind(r.positive_reviews)
                .push_bind(r.negative_reviews)
                .push_bind(r.average_playtime_forever)
                .push_bind(r.median_playtime_forever)
                .push_bind(r.price_usd)
                .push_bind(r.score_rank)
                .push_bind(r.discount_percent);
        });
        qb.push(
            " ON CONFLICT (appid, run_date, run_hour)
              DO UPDATE SET name = EXCLUDED.name,
                            current_players = EXCLUDED.current_players,
                            ccu = EXCLUDED.ccu,
                            average_playtime_2weeks = EXCLUDED.average_playtime_2weeks,
                            median_playtime_2weeks = EXCLUDED.median_playtime_2weeks,
                            estimated_owners = EXCLUDED.estimated_owners,
                            positive_reviews = EXCLUDED.positive_reviews,
                            negative_reviews = EXCLUDED.negative_reviews,
                            average_playtime_forever = EXCLUDED.average_playtime_forever,
                            median_playtime_forever = EXCLUDED.median_playtime_forever,
                            price_usd = EXCLUDED.price_usd,
                            score_rank = EXCLUDED.score_rank,
                            discount_percent = EXCLUDED.discount_percent,
                            created_at = now()",
        );
        qb.build().execute(&self.pool).await?;
        info!(rows = records.len(), "games_cleaned upserted");
        Ok(records.len())
    }
}

impl Db {
    /// The run's trending list, ordered by appid like the original merge
    /// query, reconstructed into the loose-typed entry shape.
    pub async fn load_trending_for_run(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
    ) -> Result<Vec<TrendingEntry>> {
        let rows = sqlx::query(
            "SELECT appid, name, median_2weeks
             FROM trending_games
             WHERE run_date = $1 AND run_hour = $2
             ORDER BY appid",
        )
        .bind(run_date)
        .bind(run_hour)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TrendingEntry {
                appid: Value::from(row.try_get::<i64, _>("appid")?),
                name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
                median_2weeks: int_value(row.try_get::<Option<i64>, _>("median_2weeks")?),
            });
        }
        Ok(out)
    }

    /// Distinct appids seeded by the run's trending fetch; the fan-out set
    /// for every companion stage.
    pub async fn trending_appids_for_run(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
    ) -> Result<Vec<i64>> {
        let appids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT appid FROM trending_games
             WHERE run_date = $1 AND run_hour = $2
             ORDER BY appid",
        )
        .bind(run_date)
        .bind(run_hour)
        .fetch_all(&self.pool)
        .await?;
        Ok(appids)
    }

    /// Which of the given appids already have a catalog row.
    pub async fn catalog_existing_appids(&self, appids: &[i64]) -> Result<HashSet<i64>> {
        if appids.is_empty() {
            return Ok(HashSet::new());
        }
        let found: Vec<i64> =
            sqlx::query_scalar("SELECT appid FROM game_catalog WHERE appid = ANY($1)")
                .bind(appids)
                .fetch_all(&self.pool)
                .await?;
        Ok(found.into_iter().collect())
    }

    pub async fn load_catalog_for(&self, appids: &[i64]) -> Result<HashMap<i64, CatalogEntry>> {
        if appids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT appid, name, developer, release_date, genres, price, description, platforms
             FROM game_catalog
             WHERE appid = ANY($1)",
        )
        .bind(appids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let appid: i64 = row.try_get("appid")?;
            out.insert(
                appid,
                CatalogEntry {
                    appid,
                    name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
                    developer: row
                        .try_get::<Option<String>, _>("developer")?
                        .unwrap_or_default(),
                    release_date: row
                        .try_get::<Option<String>, _>("release_date")?
                        .unwrap_or_default(),
                    genres: row
                        .try_get::<Option<String>, _>("genres")?
                        .unwrap_or_default(),
                    price: float_value(row.try_get::<Option<f64>, _>("price")?),
                    description: row
                        .try_get::<Option<String>, _>("description")?
                        .unwrap_or_default(),
                    platforms: row
                        .try_get::<Option<String>, _>("platforms")?
                        .unwrap_or_default(),
                },
            );
        }
        Ok(out)
    }

    pub async fn load_player_counts_for_run(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
        appids: &[i64],
    ) -> Result<HashMap<i64, PlayerCountEntry>> {
        if appids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT appid, current_players
             FROM player_count
             WHERE run_date = $1 AND run_hour = $2 AND appid = ANY($3)",
        )
        .bind(run_date)
        .bind(run_hour)
        .bind(appids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let appid: i64 = row.try_get("appid")?;
            out.insert(
                appid,
                PlayerCountEntry {
                    appid,
                    current_players: int_value(
                        row.try_get::<Option<i64>, _>("current_players")?,
                    ),
                },
            );
        }
        Ok(out)
    }

    pub async fn load_popularity_for_run(
        &self,
        run_date: NaiveDate,
        run_hour: i32,
        appids: &[i64],
    ) -> Result<HashMap<i64, PopularityEntry>> {
        if appids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT appid, owners, ccu, positive, negative, average_forever, average_2weeks,
                    median_forever, median_2weeks, price, tags
             FROM popularity_stats
             WHERE run_date = $1 AND run_hour = $2 AND appid = ANY($3)",
        )
        .bind(run_date)
        .bind(run_hour)
        .bind(appids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let appid: i64 = row.try_get("appid")?;
            out.insert(
                appid,
                PopularityEntry {
                    appid,
                    owners: row.try_get::<Option<String>, _>("owners")?,
                    ccu: int_value(row.try_get::<Option<i64>, _>("ccu")?),
                    positive: int_value(row.try_get::<Option<i64>, _>("positive")?),
                    negative: int_value(row.try_get::<Option<i64>, _>("negative")?),
                    average_forever: int_value(
                        row.try_get::<Option<i64>, _>("average_forever")?,
                    ),
                    average_2weeks: int_value(
                        row.try_get::<Option<i64>, _>("average_2weeks")?,
                    ),
                    median_forever: int_value(
                        row.try_get::<Option<i64>, _>("median_forever")?,
                    ),
                    median_2weeks: int_value(row.try_get::<Option<i64>, _>("median_2weeks")?),
                    price: float_value(row.try_get::<Option<f64>, _>("price")?),
                    tags: row.try_get::<Option<String>, _>("tags")?.unwrap_or_default(),
                },
            );
        }
        Ok(out)
    }
}
