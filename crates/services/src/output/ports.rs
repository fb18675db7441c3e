//! Output routing ports

use async_trait::async_trait;

/// Persistent `room_output_devices` row.
#[derive(Debug, Clone)]
pub struct OutputDeviceRecord {
    pub id: i32,
    pub room_id: i32,
    /// Only "audio" is routed here; "display" rows are ignored.
    pub output_type: String,
    pub renfield_device_id: Option<String>,
    pub ha_entity_id: Option<String>,
    pub dlna_renderer_name: Option<String>,
    pub priority: i32,
    pub allow_interruption: bool,
    pub tts_volume: Option<f64>,
    pub is_enabled: bool,
    pub device_name: Option<String>,
}

#[async_trait]
pub trait OutputDeviceRepository: Send + Sync {
    /// Enabled audio output rows for a room, ordered by priority ascending.
    async fn list_audio_for_room(&self, room_id: i32)
        -> anyhow::Result<Vec<OutputDeviceRecord>>;
}

/// Where a response should be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// Ask the controller to play on an entity id.
    HaEntity,
    /// Forward bytes over the device's WebSocket.
    RenfieldDevice,
    /// Send to the originating input device.
    InputDevice,
}

/// Routing decision for a `(room, input device)` pair. The router never
/// plays audio itself; callers act on the decision.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub target: OutputTarget,
    pub target_id: Option<String>,
    pub output_device: Option<OutputDeviceRecord>,
    pub reason: &'static str,
    pub fallback_to_input: bool,
}

impl RoutingDecision {
    pub fn fallback(reason: &'static str) -> Self {
        Self {
            target: OutputTarget::InputDevice,
            target_id: None,
            output_device: None,
            reason,
            fallback_to_input: true,
        }
    }
}
