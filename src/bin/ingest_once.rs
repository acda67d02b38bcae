use anyhow::{Context, Result};
use chrono::{NaiveDate, Timelike, Utc};
use clap::Parser;
use steam_trends::database_ops::db::Db;
use steam_trends::database_ops::steam::provider::SteamClient;
use steam_trends::pipeline::{run_hourly_pipeline, RunIdentity};
use steam_trends::util::env as env_util;

/// Run the full hourly ingestion pipeline once. Meant to be invoked by an
/// external scheduler (cron or similar); re-running an hour is safe.
#[derive(Parser, Debug)]
#[command(name = "ingest_once")]
struct Args {
    /// Run date (YYYY-MM-DD); defaults to the current UTC date
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Run hour (0-23); defaults to the current UTC hour
    #[arg(long)]
    hour: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    steam_trends::logging::init_tracing("info,sqlx=warn")?;
    let args = Args::parse();

    let now = Utc::now();
    let run = match (args.date, args.hour) {
        (None, None) => RunIdentity::from_datetime(now),
        (date, hour) => RunIdentity::new(
            date.unwrap_or_else(|| now.date_naive()),
            hour.unwrap_or(now.hour() as i32),
        )?,
    };

    let database_url = env_util::db_url()?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect(&database_url, max_conns)
        .await
        .context("Db::connect failed")?;
    let steam = SteamClient::from_env();

    run_hourly_pipeline(&db, &steam, &run).await
}
