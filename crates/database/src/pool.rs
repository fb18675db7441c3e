//! Connection pooling

use anyhow::Context;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::info;

pub type DbPool = Pool;

/// Build the deadpool pool and verify connectivity with one round-trip, so a
/// bad DSN fails at startup instead of mid-request.
pub async fn create_pool(db: &config::DatabaseConfig) -> anyhow::Result<DbPool> {
    let mut cfg = Config::new();
    cfg.host = Some(db.host.clone());
    cfg.port = Some(db.port);
    cfg.dbname = Some(db.database.clone());
    cfg.user = Some(db.username.clone());
    cfg.password = Some(db.password.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .context("Failed to create connection pool")?;

    pool.get()
        .await
        .context("Database is unreachable")?
        .simple_query("SELECT 1")
        .await
        .context("Database connectivity check failed")?;

    info!(
        host = %db.host,
        port = db.port,
        database = %db.database,
        "Database pool ready"
    );
    Ok(pool)
}
