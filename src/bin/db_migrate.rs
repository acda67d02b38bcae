use anyhow::{Context, Result};
use steam_trends::database_ops::db::Db;
use steam_trends::util::env as env_util;
use tracing::info;

/// Apply any pending migrations from ./migrations and exit.
#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    steam_trends::logging::init_tracing("info,sqlx=warn")?;

    let database_url = env_util::db_url()?;
    let db = Db::connect(&database_url, 2)
        .await
        .context("Db::connect failed")?;
    Db::run_migrations(&db.pool).await?;
    info!("migrations up to date");
    Ok(())
}
