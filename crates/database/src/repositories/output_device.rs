use crate::pool::DbPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use services::output::ports::{OutputDeviceRecord, OutputDeviceRepository};

pub struct PgOutputDeviceRepository {
    pool: DbPool,
}

impl PgOutputDeviceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_output(row: tokio_postgres::Row) -> Result<OutputDeviceRecord> {
        Ok(OutputDeviceRecord {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            output_type: row.try_get("output_type")?,
            renfield_device_id: row.try_get("renfield_device_id")?,
            ha_entity_id: row.try_get("ha_entity_id")?,
            dlna_renderer_name: row.try_get("dlna_renderer_name")?,
            priority: row.try_get("priority")?,
            allow_interruption: row.try_get("allow_interruption")?,
            tts_volume: row.try_get("tts_volume")?,
            is_enabled: row.try_get("is_enabled")?,
            device_name: row.try_get("device_name")?,
        })
    }
}

#[async_trait]
impl OutputDeviceRepository for PgOutputDeviceRepository {
    async fn list_audio_for_room(&self, room_id: i32) -> Result<Vec<OutputDeviceRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let rows = client
            .query(
                r#"
                SELECT * FROM room_output_devices
                WHERE room_id = $1 AND output_type = 'audio' AND is_enabled
                ORDER BY priority ASC
                "#,
                &[&room_id],
            )
            .await
            .context("Failed to list output devices")?;

        rows.into_iter().map(Self::row_to_output).collect()
    }
}
