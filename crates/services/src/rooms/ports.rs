//! Room and device persistence ports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Persistent room row.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: i32,
    pub name: String,
    pub alias: String,
    pub external_area_id: Option<String>,
    pub icon: Option<String>,
    /// "manual", "ha_import" or "device_auto"
    pub source: String,
}

/// Persistent device row.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: i32,
    pub device_id: String,
    pub device_type: String,
    pub device_name: Option<String>,
    pub room_id: i32,
    pub capabilities: Value,
    pub is_stationary: bool,
    pub is_online: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Fields written on device registration.
#[derive(Debug, Clone)]
pub struct DeviceUpsert {
    pub device_id: String,
    pub device_type: String,
    pub device_name: Option<String>,
    pub room_id: i32,
    pub capabilities: Value,
    pub is_stationary: bool,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn create(
        &self,
        name: &str,
        alias: &str,
        source: &str,
        external_area_id: Option<&str>,
    ) -> anyhow::Result<RoomRecord>;
    async fn get_by_id(&self, id: i32) -> anyhow::Result<Option<RoomRecord>>;
    async fn get_by_name(&self, name: &str) -> anyhow::Result<Option<RoomRecord>>;
    async fn get_by_alias(&self, alias: &str) -> anyhow::Result<Option<RoomRecord>>;
    async fn get_by_external_area(&self, area_id: &str) -> anyhow::Result<Option<RoomRecord>>;
    async fn link_external_area(&self, id: i32, area_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Create or update a device row, refreshing `last_connected_at`, online
    /// flag, user agent and IP.
    async fn upsert(&self, device: DeviceUpsert) -> anyhow::Result<DeviceRecord>;
    async fn get_by_device_id(&self, device_id: &str) -> anyhow::Result<Option<DeviceRecord>>;
    async fn set_online(
        &self,
        device_id: &str,
        is_online: bool,
        ip_address: Option<&str>,
    ) -> anyhow::Result<()>;
    /// Stationary, online device most recently seen at this address.
    async fn get_stationary_by_ip(&self, ip_address: &str)
        -> anyhow::Result<Option<DeviceRecord>>;
}
