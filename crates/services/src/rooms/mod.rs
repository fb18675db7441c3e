//! Room management
//!
//! Rooms are the unit of spatial context: devices live in rooms, presence is
//! per room, output routing picks a device in the room. Room names are
//! matched by a normalized alias so voice input ("Wohnzimmer", "living
//! room!") resolves robustly.

pub mod ports;

use crate::protocol::DeviceType;
use integrations::HomeController;
use ports::{DeviceRecord, DeviceRepository, DeviceUpsert, RoomRecord, RoomRepository};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Room auto-creation is disabled")]
    AutoCreateDisabled,
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for RoomError {
    fn from(e: anyhow::Error) -> Self {
        RoomError::Storage(e.to_string())
    }
}

/// Normalize a room name for voice matching: lowercase, fold accented
/// letters (umlauts included) to their base letter, expand `ß` and drop
/// everything that is not `[a-z0-9]`.
pub fn normalize_room_name(name: &str) -> String {
    let mut folded = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        if c == 'ß' {
            folded.push_str("ss");
        } else {
            folded.push(c);
        }
    }

    folded
        .nfkd()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Generate a device id: `{type_prefix}-{room_alias}-{hex6}`.
pub fn generate_device_id(device_type: DeviceType, room_name: &str) -> String {
    let alias = normalize_room_name(room_name);
    let alias = &alias[..alias.len().min(20)];
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", device_type.id_prefix(), alias, &suffix[..6])
}

/// Spatial context attached to a session or chat connection.
#[derive(Debug, Clone, Default)]
pub struct RoomContext {
    pub room_id: Option<i32>,
    pub room_name: Option<String>,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub speaker_name: Option<String>,
    pub speaker_alias: Option<String>,
}

/// Result of registering a device: the persisted row and the room it landed
/// in.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub device: DeviceRecord,
    pub room: RoomRecord,
}

pub struct RoomService {
    rooms: Arc<dyn RoomRepository>,
    devices: Arc<dyn DeviceRepository>,
    auto_create: bool,
}

impl RoomService {
    pub fn new(
        rooms: Arc<dyn RoomRepository>,
        devices: Arc<dyn DeviceRepository>,
        config: &config::RoomsConfig,
    ) -> Self {
        Self {
            rooms,
            devices,
            auto_create: config.auto_create_from_device,
        }
    }

    /// Resolve a room by exact name first, then by normalized alias.
    pub async fn resolve_room(&self, name: &str) -> Result<Option<RoomRecord>, RoomError> {
        if let Some(room) = self.rooms.get_by_name(name).await? {
            return Ok(Some(room));
        }
        Ok(self.rooms.get_by_alias(&normalize_room_name(name)).await?)
    }

    /// Resolve a room, auto-creating it when policy permits.
    pub async fn get_or_create_room(&self, name: &str) -> Result<RoomRecord, RoomError> {
        if let Some(room) = self.resolve_room(name).await? {
            return Ok(room);
        }
        if !self.auto_create {
            return Err(RoomError::AutoCreateDisabled);
        }
        let alias = normalize_room_name(name);
        let room = self
            .rooms
            .create(name, &alias, "device_auto", None)
            .await?;
        info!(room = %room.name, room_id = room.id, "Room auto-created on device registration");
        Ok(room)
    }

    /// Persist a device registration: resolve (or create) the room, upsert
    /// the device row, refresh last-seen and IP.
    ///
    /// A stationary device changing its IP is logged; a mobile one is not.
    pub async fn register_device(
        &self,
        device_id: &str,
        device_type: DeviceType,
        room_name: &str,
        device_name: Option<&str>,
        capabilities: Value,
        is_stationary: bool,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<DeviceRegistration, RoomError> {
        let room = self.get_or_create_room(room_name).await?;

        if is_stationary {
            if let (Some(existing), Some(new_ip)) = (
                self.devices.get_by_device_id(device_id).await?,
                ip_address,
            ) {
                if let Some(old_ip) = existing.ip_address.as_deref() {
                    if old_ip != new_ip {
                        warn!(
                            device_id = %device_id,
                            old_ip = %old_ip,
                            new_ip = %new_ip,
                            "Stationary device changed IP address"
                        );
                    }
                }
            }
        }

        let device = self
            .devices
            .upsert(DeviceUpsert {
                device_id: device_id.to_string(),
                device_type: device_type.to_string(),
                device_name: device_name.map(String::from),
                room_id: room.id,
                capabilities,
                is_stationary,
                user_agent: user_agent.map(String::from),
                ip_address: ip_address.map(String::from),
            })
            .await?;

        Ok(DeviceRegistration { device, room })
    }

    pub async fn set_device_offline(&self, device_id: &str) -> Result<(), RoomError> {
        self.devices.set_online(device_id, false, None).await?;
        Ok(())
    }

    /// Room context for a connection identified only by its source IP:
    /// stationary devices pin an address to a room.
    pub async fn room_context_by_ip(&self, ip_address: &str) -> Result<Option<RoomContext>, RoomError> {
        let Some(device) = self.devices.get_stationary_by_ip(ip_address).await? else {
            return Ok(None);
        };
        let room = self.rooms.get_by_id(device.room_id).await?;
        debug!(
            ip = %ip_address,
            device_id = %device.device_id,
            "Room context derived from stationary device IP"
        );
        Ok(Some(RoomContext {
            room_id: Some(device.room_id),
            room_name: room.map(|r| r.name),
            device_id: Some(device.device_id),
            device_type: Some(device.device_type),
            speaker_name: None,
            speaker_alias: None,
        }))
    }

    /// Import controller areas as rooms. Existing rooms are matched by
    /// normalized alias and linked; new ones are created with source
    /// "ha_import". Returns (created, linked).
    pub async fn import_areas(
        &self,
        controller: &dyn HomeController,
    ) -> Result<(usize, usize), RoomError> {
        let areas = controller
            .list_areas()
            .await
            .map_err(|e| RoomError::Storage(e.to_string()))?;

        let mut created = 0;
        let mut linked = 0;
        for area in areas {
            if self.rooms.get_by_external_area(&area.area_id).await?.is_some() {
                continue;
            }
            let alias = normalize_room_name(&area.name);
            if let Some(existing) = self.rooms.get_by_alias(&alias).await? {
                self.rooms
                    .link_external_area(existing.id, &area.area_id)
                    .await?;
                linked += 1;
            } else {
                self.rooms
                    .create(&area.name, &alias, "ha_import", Some(&area.area_id))
                    .await?;
                created += 1;
            }
        }
        info!(created, linked, "Controller area import finished");
        Ok((created, linked))
    }
}
