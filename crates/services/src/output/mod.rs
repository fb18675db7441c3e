//! Output routing (which speaker plays a response)
//!
//! For a `(room, input device)` pair the router walks the room's configured
//! audio outputs by ascending priority and returns the first one whose
//! availability check passes. Controller-attached players are checked
//! through the controller's state API; renfield devices through the live
//! registry. The router only decides; [`AudioOutputService`] acts on the
//! decision.

pub mod ports;

use crate::protocol::ServerFrame;
use crate::registry::DeviceRegistry;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use integrations::HomeController;
use ports::{OutputDeviceRecord, OutputDeviceRepository, OutputTarget, RoutingDecision};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Player states that mean "currently occupied".
const BUSY_STATES: [&str; 2] = ["playing", "buffering"];
/// Player states that mean "not reachable right now".
const DEAD_STATES: [&str; 3] = ["off", "unavailable", "unknown"];

pub struct OutputRouter {
    outputs: Arc<dyn OutputDeviceRepository>,
    controller: Arc<dyn HomeController>,
    registry: Arc<DeviceRegistry>,
}

impl OutputRouter {
    pub fn new(
        outputs: Arc<dyn OutputDeviceRepository>,
        controller: Arc<dyn HomeController>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            outputs,
            controller,
            registry,
        }
    }

    /// Pick the best audio output for the room.
    pub async fn route_audio(
        &self,
        room_id: i32,
        _input_device_id: Option<&str>,
    ) -> RoutingDecision {
        let rows = match self.outputs.list_audio_for_room(room_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(room_id, error = %e, "Failed to load output devices, falling back to input");
                return RoutingDecision::fallback("output_device_query_failed");
            }
        };

        if rows.is_empty() {
            return RoutingDecision::fallback("no_output_devices_configured");
        }

        for row in &rows {
            if self.is_available(row).await {
                let (target, target_id) = if let Some(entity) = &row.ha_entity_id {
                    (OutputTarget::HaEntity, Some(entity.clone()))
                } else if let Some(device_id) = &row.renfield_device_id {
                    (OutputTarget::RenfieldDevice, Some(device_id.clone()))
                } else {
                    continue;
                };
                debug!(
                    room_id,
                    target_id = target_id.as_deref().unwrap_or(""),
                    priority = row.priority,
                    "Output device selected"
                );
                return RoutingDecision {
                    target,
                    target_id,
                    output_device: Some(row.clone()),
                    reason: "selected_by_priority",
                    fallback_to_input: false,
                };
            }
        }

        RoutingDecision::fallback("all_devices_unavailable")
    }

    /// First enabled audio output row of the room regardless of
    /// availability. Used to report busy-device details to the agent.
    pub async fn first_configured(&self, room_id: i32) -> Option<OutputDeviceRecord> {
        self.outputs
            .list_audio_for_room(room_id)
            .await
            .ok()?
            .into_iter()
            .next()
    }

    async fn is_available(&self, row: &OutputDeviceRecord) -> bool {
        if let Some(entity) = &row.ha_entity_id {
            match self.controller.get_state(entity).await {
                Ok(Some(state)) => {
                    if DEAD_STATES.contains(&state.state.as_str()) {
                        return false;
                    }
                    if BUSY_STATES.contains(&state.state.as_str()) && !row.allow_interruption {
                        return false;
                    }
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(entity = %entity, error = %e, "Availability check failed");
                    false
                }
            }
        } else if let Some(device_id) = &row.renfield_device_id {
            match self.registry.get_device(device_id).await {
                Some(device) => device.capabilities.has_speaker,
                None => false,
            }
        } else {
            // dlna-only rows need a renderer integration we do not carry
            false
        }
    }
}

/// Short-lived in-memory store for synthesized audio the controller fetches
/// by URL.
pub struct TtsAudioCache {
    entries: std::sync::Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    ttl: Duration,
}

impl TtsAudioCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: std::sync::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Store audio and return its cache id.
    pub fn put(&self, audio: Vec<u8>) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut entries = self.entries.lock().unwrap();
        let ttl = self.ttl;
        entries.retain(|_, (_, at)| at.elapsed() < ttl);
        entries.insert(id.clone(), (audio, Instant::now()));
        id
    }

    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(id)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(audio, _)| audio.clone())
    }
}

/// Plays a routing decision: forwards bytes to a renfield device over its
/// WebSocket, or caches the audio and asks the controller to fetch it.
pub struct AudioOutputService {
    controller: Arc<dyn HomeController>,
    registry: Arc<DeviceRegistry>,
    cache: Arc<TtsAudioCache>,
    public_base_url: String,
    max_payload_bytes: usize,
}

impl AudioOutputService {
    pub fn new(
        controller: Arc<dyn HomeController>,
        registry: Arc<DeviceRegistry>,
        cache: Arc<TtsAudioCache>,
        server: &config::ServerConfig,
        audio: &config::AudioConfig,
    ) -> Self {
        Self {
            controller,
            registry,
            cache,
            public_base_url: server.resolved_public_base_url(),
            max_payload_bytes: audio.tts_max_payload_bytes,
        }
    }

    /// Play synthesized audio on the decided output device. Returns whether
    /// playback was handed off successfully.
    pub async fn play(
        &self,
        audio: &[u8],
        output_device: &OutputDeviceRecord,
        session_id: &str,
    ) -> bool {
        if let Some(device_id) = &output_device.renfield_device_id {
            return self.send_to_device(audio, device_id, session_id).await;
        }
        if let Some(entity_id) = &output_device.ha_entity_id {
            return self.play_via_controller(audio, entity_id, output_device.tts_volume).await;
        }
        warn!(output_id = output_device.id, "Output device has no playable target");
        false
    }

    /// Forward audio over a device's WebSocket, chunked under the payload
    /// cap; `is_final` marks the last chunk.
    pub async fn send_to_device(&self, audio: &[u8], device_id: &str, session_id: &str) -> bool {
        let Some(sender) = self.registry.device_sender(device_id).await else {
            warn!(device_id = %device_id, "Output device is not connected");
            return false;
        };

        let chunks: Vec<&[u8]> = if audio.is_empty() {
            vec![&[]]
        } else {
            audio.chunks(self.max_payload_bytes).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let frame = ServerFrame::TtsAudio {
                session_id: session_id.to_string(),
                audio: BASE64.encode(chunk),
                is_final: i == last,
            };
            if sender.try_send(frame).is_err() {
                warn!(device_id = %device_id, "Failed to enqueue tts_audio frame");
                return false;
            }
        }
        true
    }

    async fn play_via_controller(
        &self,
        audio: &[u8],
        entity_id: &str,
        tts_volume: Option<f64>,
    ) -> bool {
        let cache_id = self.cache.put(audio.to_vec());
        let url = format!("{}/api/audio/{}.wav", self.public_base_url, cache_id);

        if let Some(volume) = tts_volume {
            let result = self
                .controller
                .call_service(
                    "media_player",
                    "volume_set",
                    entity_id,
                    Some(serde_json::json!({ "volume_level": volume })),
                    None,
                )
                .await;
            if let Err(e) = result {
                warn!(entity = %entity_id, error = %e, "Failed to set TTS volume");
            }
        }

        let result = self
            .controller
            .call_service(
                "media_player",
                "play_media",
                entity_id,
                Some(serde_json::json!({
                    "media_content_id": url,
                    "media_content_type": "music",
                })),
                None,
            )
            .await;

        match result {
            Ok(()) => {
                info!(entity = %entity_id, "TTS handed to controller");
                true
            }
            Err(e) => {
                warn!(entity = %entity_id, error = %e, "Controller playback failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceType;
    use crate::registry::RegisterDevice;
    use crate::test_utils::FixedOutputs;
    use integrations::MockHomeController;
    use tokio::sync::mpsc;

    fn ha_output(id: i32, entity: &str, priority: i32, allow_interruption: bool) -> OutputDeviceRecord {
        OutputDeviceRecord {
            id,
            room_id: 1,
            output_type: "audio".to_string(),
            renfield_device_id: None,
            ha_entity_id: Some(entity.to_string()),
            dlna_renderer_name: None,
            priority,
            allow_interruption,
            tts_volume: None,
            is_enabled: true,
            device_name: Some(format!("Speaker {id}")),
        }
    }

    fn test_registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(
            &config::AudioConfig::default(),
            &config::SessionConfig::default(),
        ))
    }

    fn router(
        outputs: Vec<OutputDeviceRecord>,
        controller: Arc<MockHomeController>,
        registry: Arc<DeviceRegistry>,
    ) -> OutputRouter {
        OutputRouter::new(Arc::new(FixedOutputs(outputs)), controller, registry)
    }

    #[tokio::test]
    async fn test_no_outputs_falls_back_to_input() {
        let controller = Arc::new(MockHomeController::new());
        let decision = router(vec![], controller, test_registry())
            .route_audio(1, None)
            .await;
        assert_eq!(decision.reason, "no_output_devices_configured");
        assert!(decision.fallback_to_input);
        assert_eq!(decision.target, OutputTarget::InputDevice);
    }

    #[tokio::test]
    async fn test_priority_order_wins() {
        let controller = Arc::new(MockHomeController::new());
        controller.set_state("media_player.low", "idle");
        controller.set_state("media_player.high", "idle");

        let decision = router(
            vec![
                ha_output(1, "media_player.low", 10, false),
                ha_output(2, "media_player.high", 1, false),
            ],
            controller,
            test_registry(),
        )
        .route_audio(1, None)
        .await;

        assert_eq!(decision.target_id.as_deref(), Some("media_player.high"));
        assert!(!decision.fallback_to_input);
    }

    #[tokio::test]
    async fn test_busy_player_is_skipped_unless_interruptible() {
        let controller = Arc::new(MockHomeController::new());
        controller.set_state("media_player.busy", "playing");
        controller.set_state("media_player.free", "idle");

        let decision = router(
            vec![
                ha_output(1, "media_player.busy", 1, false),
                ha_output(2, "media_player.free", 2, false),
            ],
            controller.clone(),
            test_registry(),
        )
        .route_audio(1, None)
        .await;
        assert_eq!(decision.target_id.as_deref(), Some("media_player.free"));

        // With interruption allowed the busy one wins by priority
        let decision = router(
            vec![
                ha_output(1, "media_player.busy", 1, true),
                ha_output(2, "media_player.free", 2, false),
            ],
            controller,
            test_registry(),
        )
        .route_audio(1, None)
        .await;
        assert_eq!(decision.target_id.as_deref(), Some("media_player.busy"));
    }

    #[tokio::test]
    async fn test_all_unavailable_falls_back() {
        let controller = Arc::new(MockHomeController::new());
        controller.set_state("media_player.only", "off");

        let decision = router(
            vec![ha_output(1, "media_player.only", 1, false)],
            controller,
            test_registry(),
        )
        .route_audio(1, None)
        .await;
        assert_eq!(decision.reason, "all_devices_unavailable");
        assert!(decision.fallback_to_input);
    }

    #[tokio::test]
    async fn test_renfield_target_requires_online_speaker() {
        let registry = test_registry();
        let controller = Arc::new(MockHomeController::new());
        let output = OutputDeviceRecord {
            renfield_device_id: Some("panel-1".to_string()),
            ha_entity_id: None,
            ..ha_output(1, "", 1, false)
        };

        // Offline → unavailable
        let decision = router(vec![output.clone()], controller.clone(), registry.clone())
            .route_audio(1, None)
            .await;
        assert!(decision.fallback_to_input);

        // Online with a speaker → selected
        let (tx, _rx) = mpsc::channel(8);
        registry
            .register(
                RegisterDevice {
                    device_id: "panel-1".to_string(),
                    device_type: DeviceType::WebPanel,
                    room_name: "Kitchen".to_string(),
                    room_id: Some(1),
                    capabilities: DeviceType::WebPanel.default_capabilities(),
                    device_name: None,
                    is_stationary: true,
                    language: None,
                },
                tx,
            )
            .await;
        let decision = router(vec![output], controller, registry)
            .route_audio(1, None)
            .await;
        assert_eq!(decision.target, OutputTarget::RenfieldDevice);
        assert_eq!(decision.target_id.as_deref(), Some("panel-1"));
    }

    #[tokio::test]
    async fn test_tts_cache_roundtrip_and_expiry() {
        let cache = TtsAudioCache::new(Duration::from_secs(60));
        let id = cache.put(vec![1, 2, 3]);
        assert_eq!(cache.get(&id), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("missing"), None);

        let cache = TtsAudioCache::new(Duration::from_secs(0));
        let id = cache.put(vec![1]);
        assert_eq!(cache.get(&id), None);
    }

    #[tokio::test]
    async fn test_send_to_device_chunks_under_cap() {
        let registry = test_registry();
        let (tx, mut rx) = mpsc::channel(16);
        registry
            .register(
                RegisterDevice {
                    device_id: "sat-1".to_string(),
                    device_type: DeviceType::Satellite,
                    room_name: "Kitchen".to_string(),
                    room_id: Some(1),
                    capabilities: DeviceType::Satellite.default_capabilities(),
                    device_name: None,
                    is_stationary: true,
                    language: None,
                },
                tx,
            )
            .await;

        let controller = Arc::new(MockHomeController::new());
        let service = AudioOutputService::new(
            controller,
            registry,
            Arc::new(TtsAudioCache::new(Duration::from_secs(60))),
            &config::ServerConfig::default(),
            &config::AudioConfig {
                tts_max_payload_bytes: 4,
                ..Default::default()
            },
        );

        assert!(service.send_to_device(&[0u8; 10], "sat-1", "s1").await);

        let mut finals = Vec::new();
        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::TtsAudio { is_final, .. } = frame {
                count += 1;
                finals.push(is_final);
            }
        }
        assert_eq!(count, 3);
        assert_eq!(finals, vec![false, false, true]);
    }
}
