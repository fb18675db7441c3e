use crate::pool::DbPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use services::rooms::ports::{
    DeviceRecord, DeviceRepository, DeviceUpsert, RoomRecord, RoomRepository,
};
use tracing::debug;

pub struct PgRoomRepository {
    pool: DbPool,
}

impl PgRoomRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_room(row: tokio_postgres::Row) -> Result<RoomRecord> {
        Ok(RoomRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            alias: row.try_get("alias")?,
            external_area_id: row.try_get("external_area_id")?,
            icon: row.try_get("icon")?,
            source: row.try_get("source")?,
        })
    }
}

#[async_trait]
impl RoomRepository for PgRoomRepository {
    async fn create(
        &self,
        name: &str,
        alias: &str,
        source: &str,
        external_area_id: Option<&str>,
    ) -> Result<RoomRecord> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_one(
                r#"
                INSERT INTO rooms (name, alias, source, external_area_id)
                VALUES ($1, $2, $3, $4)
                RETURNING *
                "#,
                &[&name, &alias, &source, &external_area_id],
            )
            .await
            .context("Failed to create room")?;

        debug!("Created room: {}", name);
        Self::row_to_room(row)
    }

    async fn get_by_id(&self, id: i32) -> Result<Option<RoomRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt("SELECT * FROM rooms WHERE id = $1", &[&id])
            .await
            .context("Failed to query room")?;

        row.map(Self::row_to_room).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<RoomRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt("SELECT * FROM rooms WHERE name = $1", &[&name])
            .await
            .context("Failed to query room by name")?;

        row.map(Self::row_to_room).transpose()
    }

    async fn get_by_alias(&self, alias: &str) -> Result<Option<RoomRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt("SELECT * FROM rooms WHERE alias = $1", &[&alias])
            .await
            .context("Failed to query room by alias")?;

        row.map(Self::row_to_room).transpose()
    }

    async fn get_by_external_area(&self, area_id: &str) -> Result<Option<RoomRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt(
                "SELECT * FROM rooms WHERE external_area_id = $1",
                &[&area_id],
            )
            .await
            .context("Failed to query room by external area")?;

        row.map(Self::row_to_room).transpose()
    }

    async fn link_external_area(&self, id: i32, area_id: &str) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        client
            .execute(
                "UPDATE rooms SET external_area_id = $2, updated_at = $3 WHERE id = $1",
                &[&id, &area_id, &Utc::now()],
            )
            .await
            .context("Failed to link room to external area")?;
        Ok(())
    }
}

pub struct PgDeviceRepository {
    pool: DbPool,
}

impl PgDeviceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_device(row: tokio_postgres::Row) -> Result<DeviceRecord> {
        Ok(DeviceRecord {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            device_type: row.try_get("device_type")?,
            device_name: row.try_get("device_name")?,
            room_id: row.try_get("room_id")?,
            capabilities: row.try_get("capabilities")?,
            is_stationary: row.try_get("is_stationary")?,
            is_online: row.try_get("is_online")?,
            last_connected_at: row.try_get("last_connected_at")?,
            user_agent: row.try_get("user_agent")?,
            ip_address: row.try_get("ip_address")?,
        })
    }
}

#[async_trait]
impl DeviceRepository for PgDeviceRepository {
    async fn upsert(&self, device: DeviceUpsert) -> Result<DeviceRecord> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_one(
                r#"
                INSERT INTO room_devices
                    (device_id, device_type, device_name, room_id, capabilities,
                     is_stationary, is_online, last_connected_at, user_agent, ip_address)
                VALUES ($1, $2, $3, $4, $5, $6, true, $7, $8, $9)
                ON CONFLICT (device_id) DO UPDATE SET
                    device_type = EXCLUDED.device_type,
                    device_name = EXCLUDED.device_name,
                    room_id = EXCLUDED.room_id,
                    capabilities = EXCLUDED.capabilities,
                    is_stationary = EXCLUDED.is_stationary,
                    is_online = true,
                    last_connected_at = EXCLUDED.last_connected_at,
                    user_agent = EXCLUDED.user_agent,
                    ip_address = EXCLUDED.ip_address
                RETURNING *
                "#,
                &[
                    &device.device_id,
                    &device.device_type,
                    &device.device_name,
                    &device.room_id,
                    &device.capabilities,
                    &device.is_stationary,
                    &Utc::now(),
                    &device.user_agent,
                    &device.ip_address,
                ],
            )
            .await
            .context("Failed to upsert device")?;

        debug!("Registered device: {}", device.device_id);
        Self::row_to_device(row)
    }

    async fn get_by_device_id(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt(
                "SELECT * FROM room_devices WHERE device_id = $1",
                &[&device_id],
            )
            .await
            .context("Failed to query device")?;

        row.map(Self::row_to_device).transpose()
    }

    async fn set_online(
        &self,
        device_id: &str,
        is_online: bool,
        ip_address: Option<&str>,
    ) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        client
            .execute(
                r#"
                UPDATE room_devices
                SET is_online = $2,
                    last_connected_at = $3,
                    ip_address = COALESCE($4, ip_address)
                WHERE device_id = $1
                "#,
                &[&device_id, &is_online, &Utc::now(), &ip_address],
            )
            .await
            .context("Failed to update device online state")?;
        Ok(())
    }

    async fn get_stationary_by_ip(&self, ip_address: &str) -> Result<Option<DeviceRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let row = client
            .query_opt(
                r#"
                SELECT * FROM room_devices
                WHERE is_stationary AND is_online AND ip_address = $1
                ORDER BY last_connected_at DESC NULLS LAST
                LIMIT 1
                "#,
                &[&ip_address],
            )
            .await
            .context("Failed to query stationary device by IP")?;

        row.map(Self::row_to_device).transpose()
    }
}
