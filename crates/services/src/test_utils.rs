//! Shared in-memory fakes for service tests

use crate::output::ports::{OutputDeviceRecord, OutputDeviceRepository};
use crate::rooms::ports::{DeviceRecord, DeviceRepository, DeviceUpsert, RoomRecord, RoomRepository};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;

/// In-memory room + device store.
#[derive(Default)]
pub struct MemoryRooms {
    pub rooms: Mutex<Vec<RoomRecord>>,
    pub devices: Mutex<Vec<DeviceRecord>>,
}

impl MemoryRooms {
    pub fn with_room(name: &str, alias: &str, id: i32) -> Self {
        let store = Self::default();
        store.rooms.lock().unwrap().push(RoomRecord {
            id,
            name: name.to_string(),
            alias: alias.to_string(),
            external_area_id: None,
            icon: None,
            source: "manual".to_string(),
        });
        store
    }
}

#[async_trait]
impl RoomRepository for MemoryRooms {
    async fn create(
        &self,
        name: &str,
        alias: &str,
        source: &str,
        external_area_id: Option<&str>,
    ) -> anyhow::Result<RoomRecord> {
        let mut rooms = self.rooms.lock().unwrap();
        let room = RoomRecord {
            id: rooms.len() as i32 + 1,
            name: name.to_string(),
            alias: alias.to_string(),
            external_area_id: external_area_id.map(String::from),
            icon: None,
            source: source.to_string(),
        };
        rooms.push(room.clone());
        Ok(room)
    }

    async fn get_by_id(&self, id: i32) -> anyhow::Result<Option<RoomRecord>> {
        Ok(self.rooms.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> anyhow::Result<Option<RoomRecord>> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn get_by_alias(&self, alias: &str) -> anyhow::Result<Option<RoomRecord>> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.alias == alias)
            .cloned())
    }

    async fn get_by_external_area(&self, area_id: &str) -> anyhow::Result<Option<RoomRecord>> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.external_area_id.as_deref() == Some(area_id))
            .cloned())
    }

    async fn link_external_area(&self, id: i32, area_id: &str) -> anyhow::Result<()> {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(room) = rooms.iter_mut().find(|r| r.id == id) {
            room.external_area_id = Some(area_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceRepository for MemoryRooms {
    async fn upsert(&self, upsert: DeviceUpsert) -> anyhow::Result<DeviceRecord> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices
            .iter_mut()
            .find(|d| d.device_id == upsert.device_id)
        {
            existing.device_type = upsert.device_type;
            existing.device_name = upsert.device_name;
            existing.room_id = upsert.room_id;
            existing.capabilities = upsert.capabilities;
            existing.is_stationary = upsert.is_stationary;
            existing.is_online = true;
            existing.last_connected_at = Some(Utc::now());
            existing.user_agent = upsert.user_agent;
            existing.ip_address = upsert.ip_address;
            return Ok(existing.clone());
        }
        let record = DeviceRecord {
            id: devices.len() as i32 + 1,
            device_id: upsert.device_id,
            device_type: upsert.device_type,
            device_name: upsert.device_name,
            room_id: upsert.room_id,
            capabilities: upsert.capabilities,
            is_stationary: upsert.is_stationary,
            is_online: true,
            last_connected_at: Some(Utc::now()),
            user_agent: upsert.user_agent,
            ip_address: upsert.ip_address,
        };
        devices.push(record.clone());
        Ok(record)
    }

    async fn get_by_device_id(&self, device_id: &str) -> anyhow::Result<Option<DeviceRecord>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned())
    }

    async fn set_online(
        &self,
        device_id: &str,
        is_online: bool,
        ip_address: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.iter_mut().find(|d| d.device_id == device_id) {
            device.is_online = is_online;
            if let Some(ip) = ip_address {
                device.ip_address = Some(ip.to_string());
            }
        }
        Ok(())
    }

    async fn get_stationary_by_ip(
        &self,
        ip_address: &str,
    ) -> anyhow::Result<Option<DeviceRecord>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| {
                d.is_stationary && d.is_online && d.ip_address.as_deref() == Some(ip_address)
            })
            .cloned())
    }
}

/// Fixed output-device rows.
pub struct FixedOutputs(pub Vec<OutputDeviceRecord>);

#[async_trait]
impl OutputDeviceRepository for FixedOutputs {
    async fn list_audio_for_room(&self, room_id: i32) -> anyhow::Result<Vec<OutputDeviceRecord>> {
        let mut rows: Vec<OutputDeviceRecord> = self
            .0
            .iter()
            .filter(|r| r.room_id == room_id && r.output_type == "audio" && r.is_enabled)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.priority);
        Ok(rows)
    }
}

pub fn ha_output_row(id: i32, room_id: i32, entity: &str, priority: i32) -> OutputDeviceRecord {
    OutputDeviceRecord {
        id,
        room_id,
        output_type: "audio".to_string(),
        renfield_device_id: None,
        ha_entity_id: Some(entity.to_string()),
        dlna_renderer_name: None,
        priority,
        allow_interruption: false,
        tts_volume: None,
        is_enabled: true,
        device_name: Some(format!("Speaker {id}")),
    }
}
