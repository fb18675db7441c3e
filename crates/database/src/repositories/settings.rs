use crate::pool::DbPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use services::wakeword::SettingsRepository;

pub struct PgSettingsRepository {
    pool: DbPool,
}

impl PgSettingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsRepository for PgSettingsRepository {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt("SELECT value FROM system_settings WHERE key = $1", &[&key])
            .await
            .context("Failed to read setting")?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        client
            .execute(
                r#"
                INSERT INTO system_settings (key, value)
                VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
                "#,
                &[&key, &value],
            )
            .await
            .context("Failed to write setting")?;
        Ok(())
    }
}
