use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use steam_trends::database_ops::db::Db;
use steam_trends::pipeline::{merge_and_clean_stage, RunIdentity};
use steam_trends::util::env as env_util;

/// Re-run the merge/clean stage for one run from the stored raw tables.
/// Useful after a partial failure: the cleaned-table upsert converges to the
/// same rows no matter how many times it runs.
#[derive(Parser, Debug)]
#[command(name = "merge_clean")]
struct Args {
    /// Run date (YYYY-MM-DD)
    #[arg(long)]
    date: NaiveDate,
    /// Run hour (0-23)
    #[arg(long)]
    hour: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    steam_trends::logging::init_tracing("info,sqlx=warn")?;
    let args = Args::parse();
    let run = RunIdentity::new(args.date, args.hour)?;

    let database_url = env_util::db_url()?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect(&database_url, max_conns)
        .await
        .context("Db::connect failed")?;

    let cleaned = merge_and_clean_stage(&db, &run).await?;
    println!("merged {cleaned} cleaned records for {run}");
    Ok(())
}
