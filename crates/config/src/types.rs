use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration for the renfield server.
///
/// Every section has serde defaults so a minimal (or absent) config file
/// still yields a runnable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenfieldConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub wakeword: WakeWordDefaults,
    pub llm: LlmConfig,
    pub stt: SttConfig,
    pub tts: TtsConfig,
    pub home_assistant: HomeAssistantConfig,
    pub agent: AgentConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub presence: PresenceConfig,
    pub rooms: RoomsConfig,
    pub limits: LimitsConfig,
    pub tool_servers: Vec<ToolServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used when handing audio URLs to the
    /// home-automation controller. Defaults to `http://{host}:{port}`.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8100,
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn resolved_public_base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// Bearer-token authentication for WebSocket and settings endpoints.
///
/// Token issuance is external; the server only validates membership in the
/// configured set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Vec<String>,
    /// Tokens with admin rights (wake-word settings updates).
    pub admin_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Output format: "pretty", "compact" or "json"
    pub format: String,
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            modules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "renfield".to_string(),
            username: "renfield".to_string(),
            password: "renfield".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Hard cap on the per-session PCM buffer.
    pub max_buffer_bytes: usize,
    /// Expected sample rate of inbound PCM.
    pub sample_rate: u32,
    /// Hard cap on a single outbound tts_audio payload (decoded bytes).
    pub tts_max_payload_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 2 * 1024 * 1024,
            sample_rate: 16_000,
            tts_max_payload_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a session may stay in LISTENING before it is timed out.
    pub listening_timeout_secs: u64,
    /// Seconds a session may stay in PROCESSING before it is timed out.
    pub processing_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listening_timeout_secs: 15,
            processing_timeout_secs: 30,
        }
    }
}

/// Startup defaults for the wake-word configuration. The live values are
/// persisted in the settings store and managed by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordDefaults {
    pub keyword: String,
    pub allowed_keywords: Vec<String>,
    pub threshold: f32,
    pub cooldown_ms: u64,
    pub min_cooldown_ms: u64,
    pub enabled: bool,
}

impl Default for WakeWordDefaults {
    fn default() -> Self {
        Self {
            keyword: "hey_jarvis".to_string(),
            allowed_keywords: vec![
                "alexa".to_string(),
                "hey_jarvis".to_string(),
                "hey_mycroft".to_string(),
                "ok_nabu".to_string(),
            ],
            threshold: 0.5,
            cooldown_ms: 2000,
            min_cooldown_ms: 250,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Model used for replies and the agent loop.
    pub model: String,
    /// Smaller model used for JSON-mode classification calls.
    pub classifier_model: String,
    pub embedding_model: String,
    pub timeout_secs: u64,
    pub default_language: String,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5:14b".to_string(),
            classifier_model: "qwen2.5:3b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            timeout_secs: 120,
            default_language: "en".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a probe is allowed.
    pub cooloff_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooloff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub base_url: String,
    pub language: Option<String>,
    pub speaker_recognition_enabled: bool,
    pub timeout_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9001".to_string(),
            language: None,
            speaker_recognition_enabled: false,
            timeout_secs: 60,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub enabled: bool,
    pub base_url: String,
    pub voice: Option<String>,
    pub timeout_secs: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:9002".to_string(),
            voice: None,
            timeout_secs: 60,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub base_url: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8123".to_string(),
            token: String::new(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// When false the legacy ranked-intent path handles requests instead.
    pub enabled: bool,
    pub max_steps: u32,
    /// Per-tool execution timeout.
    pub tool_timeout_secs: u64,
    /// Wall-clock bound over the whole agent loop.
    pub wall_clock_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: 6,
            tool_timeout_secs: 30,
            wall_clock_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub hybrid_enabled: bool,
    pub top_k: usize,
    /// Minimum cosine similarity for dense-only results.
    pub min_similarity: f32,
    /// RRF constant k.
    pub rrf_k: f32,
    pub dense_weight: f32,
    pub lexical_weight: f32,
    /// Adjacent chunks fetched per direction around each hit.
    pub context_window: usize,
    pub context_window_max: usize,
    /// Postgres full-text search configuration name.
    pub fts_language: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hybrid_enabled: true,
            top_k: 5,
            min_similarity: 0.35,
            rrf_k: 60.0,
            dense_weight: 1.0,
            lexical_weight: 1.0,
            context_window: 1,
            context_window_max: 3,
            fts_language: "english".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub extraction_enabled: bool,
    /// Memories injected into a system prompt, at most.
    pub max_memories: usize,
    /// Exchanges shorter than this are not worth extracting from.
    pub min_exchange_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extraction_enabled: true,
            max_memories: 5,
            min_exchange_chars: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub enabled: bool,
    /// Presence records older than this are expired.
    pub ttl_secs: u64,
    /// Beacon sightings required within the window for a room assignment.
    pub beacon_min_observations: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 900,
            beacon_min_observations: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// Auto-create a room the first time a device registers with an unknown
    /// room name.
    pub auto_create_from_device: bool,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            auto_create_from_device: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections_per_ip: usize,
    pub max_connections_per_device: usize,
    /// Token-bucket burst size per device/IP.
    pub rate_burst: u32,
    /// Token-bucket refill rate (tokens per second).
    pub rate_per_sec: f64,
    /// Outbound frame queue depth per connection.
    pub send_queue_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 8,
            max_connections_per_device: 2,
            rate_burst: 20,
            rate_per_sec: 5.0,
            send_queue_depth: 64,
        }
    }
}

/// A remote tool-providing server. Tools are namespaced by `name`:
/// a tool call `media.search` dispatches to the server named `media`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_tool_server_timeout")]
    pub timeout_secs: u64,
}

fn default_tool_server_timeout() -> u64 {
    30
}
