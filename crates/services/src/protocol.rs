//! WebSocket wire protocol
//!
//! Typed frames for the device, satellite and chat endpoints. Every frame is
//! a single JSON object discriminated by its `type` field; anything that does
//! not deserialize into [`ClientFrame`] is answered with one
//! `error {INVALID_MESSAGE}` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version string echoed in `register_ack`.
pub const PROTOCOL_VERSION: &str = "1.0";

// ==================== Shared types ====================

/// Session lifecycle states, ordered. Transitions are only ever monotonic;
/// any state may jump straight to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Listening,
    Processing,
    Speaking,
    Ended,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Device classes the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Satellite,
    WebPanel,
    WebTablet,
    WebBrowser,
    WebKiosk,
}

impl DeviceType {
    /// Short prefix used when generating device ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            DeviceType::Satellite => "sat",
            DeviceType::WebPanel => "panel",
            DeviceType::WebTablet => "tablet",
            DeviceType::WebBrowser => "web",
            DeviceType::WebKiosk => "kiosk",
        }
    }

    /// Default capability record for this device class, merged with
    /// client-supplied overrides at registration.
    pub fn default_capabilities(&self) -> DeviceCapabilities {
        match self {
            DeviceType::Satellite => DeviceCapabilities {
                has_microphone: true,
                has_speaker: true,
                has_display: false,
                has_wakeword: true,
                has_camera: false,
            },
            DeviceType::WebPanel | DeviceType::WebTablet | DeviceType::WebKiosk => {
                DeviceCapabilities {
                    has_microphone: true,
                    has_speaker: true,
                    has_display: true,
                    has_wakeword: false,
                    has_camera: false,
                }
            }
            DeviceType::WebBrowser => DeviceCapabilities {
                has_microphone: true,
                has_speaker: true,
                has_display: true,
                has_wakeword: false,
                has_camera: false,
            },
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceType::Satellite => "satellite",
            DeviceType::WebPanel => "web_panel",
            DeviceType::WebTablet => "web_tablet",
            DeviceType::WebBrowser => "web_browser",
            DeviceType::WebKiosk => "web_kiosk",
        };
        f.write_str(name)
    }
}

/// Media and I/O affordances of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub has_microphone: bool,
    pub has_speaker: bool,
    pub has_display: bool,
    pub has_wakeword: bool,
    pub has_camera: bool,
}

/// Client-supplied partial capability record; unset fields keep the
/// per-device-type default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapabilityOverrides {
    pub has_microphone: Option<bool>,
    pub has_speaker: Option<bool>,
    pub has_display: Option<bool>,
    pub has_wakeword: Option<bool>,
    pub has_camera: Option<bool>,
}

impl CapabilityOverrides {
    pub fn apply_to(&self, mut base: DeviceCapabilities) -> DeviceCapabilities {
        if let Some(v) = self.has_microphone {
            base.has_microphone = v;
        }
        if let Some(v) = self.has_speaker {
            base.has_speaker = v;
        }
        if let Some(v) = self.has_display {
            base.has_display = v;
        }
        if let Some(v) = self.has_wakeword {
            base.has_wakeword = v;
        }
        if let Some(v) = self.has_camera {
            base.has_camera = v;
        }
        base
    }
}

/// Error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    Unauthorized,
    AuthRequired,
    RateLimited,
    BufferFull,
    DeviceError,
    Internal,
}

/// WebSocket close codes used by the server.
pub mod close_codes {
    /// Authentication required or failed.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Connection limit exceeded.
    pub const CONNECTION_LIMIT: u16 = 4003;
    /// Internal error.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
}

/// Wake-word settings as shipped to devices in `register_ack` and
/// `config_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeWordClientConfig {
    pub wake_words: Vec<String>,
    pub threshold: f32,
    pub cooldown_ms: u64,
    pub enabled: bool,
}

/// Intent info echoed in `done` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentInfo {
    pub intent: String,
    pub confidence: f32,
}

// ==================== Inbound frames (device → server) ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        device_id: String,
        device_type: DeviceType,
        room: String,
        #[serde(default)]
        capabilities: Option<CapabilityOverrides>,
        #[serde(default)]
        device_name: Option<String>,
        #[serde(default)]
        is_stationary: Option<bool>,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        protocol_version: Option<String>,
    },
    WakewordDetected {
        keyword: String,
        confidence: f32,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Manual session start for devices without local wake-word.
    StartSession {},
    Audio {
        session_id: String,
        /// Base64-encoded PCM chunk.
        chunk: String,
        sequence: u32,
    },
    AudioEnd {
        session_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Text {
        #[serde(default)]
        session_id: Option<String>,
        content: String,
        #[serde(default)]
        use_rag: Option<bool>,
        #[serde(default)]
        knowledge_base_id: Option<i32>,
        #[serde(default)]
        attachment_ids: Option<Vec<i32>>,
    },
    Heartbeat {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        uptime_seconds: Option<u64>,
        #[serde(default)]
        metrics: Option<Value>,
        #[serde(default)]
        version: Option<String>,
    },
    ConfigAck {
        success: bool,
        #[serde(default)]
        active_keywords: Vec<String>,
        #[serde(default)]
        failed_keywords: Option<Vec<String>>,
        #[serde(default)]
        error: Option<String>,
    },
    UpdateProgress {
        stage: String,
        progress: f32,
        #[serde(default)]
        message: Option<String>,
    },
    UpdateComplete {
        #[serde(default)]
        version: Option<String>,
    },
    UpdateFailed {
        #[serde(default)]
        error: Option<String>,
    },
}

// ==================== Outbound frames (server → device) ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    RegisterAck {
        success: bool,
        device_id: String,
        config: WakeWordClientConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<i32>,
        capabilities: DeviceCapabilities,
        protocol_version: String,
    },
    State {
        state: SessionState,
    },
    SessionStarted {
        session_id: String,
    },
    SessionEnd {
        session_id: String,
        reason: String,
    },
    Transcription {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speaker_alias: Option<String>,
    },
    ToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool: String,
        args: Value,
    },
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        tool: String,
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Assistant-reply chunk.
    Stream {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        content: String,
    },
    ResponseText {
        session_id: String,
        text: String,
        is_final: bool,
    },
    TtsAudio {
        session_id: String,
        /// Base64-encoded audio payload.
        audio: String,
        is_final: bool,
    },
    /// Legacy single-intent path result.
    Action {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        intent: Value,
        success: bool,
    },
    Done {
        tts_handled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_steps: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        intent: Option<IntentInfo>,
    },
    ConfigUpdate {
        config: WakeWordClientConfig,
        config_version: u64,
    },
    HeartbeatAck {},
    IntentFeedbackRequest {
        message_text: String,
        detected_intent: String,
        confidence: f32,
        feedback_type: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    /// Session id this frame belongs to, if any. Used to gate frames of a
    /// cancelled session.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerFrame::SessionStarted { session_id }
            | ServerFrame::SessionEnd { session_id, .. }
            | ServerFrame::Transcription { session_id, .. }
            | ServerFrame::ResponseText { session_id, .. }
            | ServerFrame::TtsAudio { session_id, .. } => Some(session_id),
            ServerFrame::ToolCall { session_id, .. }
            | ServerFrame::ToolResult { session_id, .. }
            | ServerFrame::Stream { session_id, .. }
            | ServerFrame::Action { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_roundtrip_register() {
        let json = r#"{
            "type": "register",
            "device_id": "sat-kitchen-1",
            "device_type": "satellite",
            "room": "Kitchen",
            "is_stationary": true
        }"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Register {
                device_id,
                device_type,
                room,
                is_stationary,
                capabilities,
                ..
            } => {
                assert_eq!(device_id, "sat-kitchen-1");
                assert_eq!(device_type, DeviceType::Satellite);
                assert_eq!(room, "Kitchen");
                assert_eq!(is_stationary, Some(true));
                assert!(capabilities.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_type_fails() {
        let json = r#"{"type": "definitely_not_a_frame"}"#;
        assert!(serde_json::from_str::<ClientFrame>(json).is_err());
    }

    #[test]
    fn test_error_code_serialization() {
        let frame = ServerFrame::Error {
            code: ErrorCode::RateLimited,
            message: "slow down".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "RATE_LIMITED");
    }

    #[test]
    fn test_session_state_ordering() {
        assert!(SessionState::Listening < SessionState::Processing);
        assert!(SessionState::Processing < SessionState::Speaking);
        assert!(SessionState::Speaking < SessionState::Ended);
    }

    #[test]
    fn test_state_frame_serializes_lowercase() {
        let frame = ServerFrame::State {
            state: SessionState::Listening,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["state"], "listening");
    }

    #[test]
    fn test_capability_override_merge() {
        let base = DeviceType::Satellite.default_capabilities();
        let overrides = CapabilityOverrides {
            has_camera: Some(true),
            has_speaker: Some(false),
            ..Default::default()
        };
        let merged = overrides.apply_to(base);
        assert!(merged.has_camera);
        assert!(!merged.has_speaker);
        assert!(merged.has_wakeword);
    }

    #[test]
    fn test_frame_session_id_extraction() {
        let frame = ServerFrame::Stream {
            session_id: Some("s1".to_string()),
            content: "hi".to_string(),
        };
        assert_eq!(frame.session_id(), Some("s1"));

        let frame = ServerFrame::HeartbeatAck {};
        assert_eq!(frame.session_id(), None);
    }
}
