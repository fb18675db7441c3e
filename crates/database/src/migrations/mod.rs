//! Embedded schema migrations

use crate::pool::DbPool;
use anyhow::{Context, Result};
use refinery::embed_migrations;
use tracing::info;

embed_migrations!("src/migrations/sql");

/// Apply any pending migrations on one pooled connection.
pub async fn run(pool: &DbPool) -> Result<()> {
    let mut client = pool
        .get()
        .await
        .context("No database connection for migrations")?;

    let report = migrations::runner()
        .run_async(&mut **client)
        .await
        .context("Migration run failed")?;

    let applied = report.applied_migrations();
    if applied.is_empty() {
        info!("Database schema is up to date");
    } else {
        for migration in applied {
            info!(migration = %migration.name(), "Applied migration");
        }
    }
    Ok(())
}
