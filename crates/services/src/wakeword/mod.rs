//! Wake-word configuration broadcaster
//!
//! Single source of truth for the fleet-wide wake-word settings. Updates are
//! validated, persisted to the settings store, stamped with a strictly
//! increasing version and fanned out to every subscribed connection. Each
//! subscribed device carries a sync record tracking which version it has
//! acknowledged; a device is `synced` only when its latest ack matches the
//! current version with `success=true`.
//!
//! Updates are serialized behind one lock so versions stay monotonic; the
//! actual sends happen after the lock is released, and subscribers whose
//! send fails are removed with their sync record marked errored.

use crate::protocol::{ServerFrame, WakeWordClientConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

const SETTINGS_KEY: &str = "wakeword_config";

/// Generic key-value settings persistence.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set(&self, key: &str, value: &Value) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum WakeWordError {
    #[error("Keyword '{0}' is not in the allowed set")]
    InvalidKeyword(String),
    #[error("Threshold {0} outside [0.1, 1.0]")]
    InvalidThreshold(f32),
    #[error("Cooldown {0}ms below the minimum of {1}ms")]
    InvalidCooldown(u64, u64),
    #[error("Failed to persist wake-word config: {0}")]
    Persistence(String),
}

/// The process-wide wake-word configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeWordConfig {
    pub keyword: String,
    pub threshold: f32,
    pub cooldown_ms: u64,
    pub enabled: bool,
}

impl WakeWordConfig {
    pub fn to_client_config(&self) -> WakeWordClientConfig {
        WakeWordClientConfig {
            wake_words: vec![self.keyword.clone()],
            threshold: self.threshold,
            cooldown_ms: self.cooldown_ms,
            enabled: self.enabled,
        }
    }
}

/// Partial update; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WakeWordUpdate {
    pub keyword: Option<String>,
    pub threshold: Option<f32>,
    pub cooldown_ms: Option<u64>,
    pub enabled: Option<bool>,
}

/// Per-device config sync state.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSyncStatus {
    pub device_id: String,
    pub device_type: Option<String>,
    pub last_ack_version: u64,
    pub active_keywords: Vec<String>,
    pub failed_keywords: Vec<String>,
    pub last_ack_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub pending: bool,
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub synced_count: usize,
    pub pending_count: usize,
    pub error_count: usize,
    pub devices: Vec<DeviceSyncStatus>,
}

#[derive(Serialize, Deserialize)]
struct PersistedConfig {
    #[serde(flatten)]
    config: WakeWordConfig,
    version: u64,
}

struct SyncRecord {
    device_type: Option<String>,
    last_ack_version: u64,
    success: bool,
    active_keywords: Vec<String>,
    failed_keywords: Vec<String>,
    last_ack_at: Option<DateTime<Utc>>,
    error: Option<String>,
    pending: bool,
}

struct Subscriber {
    sender: mpsc::Sender<ServerFrame>,
    device_id: Option<String>,
}

struct BroadcastState {
    config: WakeWordConfig,
    version: u64,
    subscribers: HashMap<u64, Subscriber>,
    sync: HashMap<String, SyncRecord>,
    next_key: u64,
}

pub struct WakeWordBroadcaster {
    settings: Arc<dyn SettingsRepository>,
    allowed_keywords: Vec<String>,
    min_cooldown_ms: u64,
    state: Mutex<BroadcastState>,
}

impl WakeWordBroadcaster {
    pub fn new(settings: Arc<dyn SettingsRepository>, defaults: &config::WakeWordDefaults) -> Self {
        Self {
            settings,
            allowed_keywords: defaults.allowed_keywords.clone(),
            min_cooldown_ms: defaults.min_cooldown_ms,
            state: Mutex::new(BroadcastState {
                config: WakeWordConfig {
                    keyword: defaults.keyword.clone(),
                    threshold: defaults.threshold,
                    cooldown_ms: defaults.cooldown_ms,
                    enabled: defaults.enabled,
                },
                version: 1,
                subscribers: HashMap::new(),
                sync: HashMap::new(),
                next_key: 1,
            }),
        }
    }

    /// Load the persisted configuration, keeping startup defaults when the
    /// store has none.
    pub async fn load(&self) -> anyhow::Result<()> {
        if let Some(value) = self.settings.get(SETTINGS_KEY).await? {
            match serde_json::from_value::<PersistedConfig>(value) {
                Ok(persisted) => {
                    let mut state = self.state.lock().await;
                    state.config = persisted.config;
                    state.version = persisted.version;
                    info!(
                        version = persisted.version,
                        "Wake-word config loaded from settings store"
                    );
                }
                Err(e) => warn!(error = %e, "Stored wake-word config unreadable, using defaults"),
            }
        }
        Ok(())
    }

    pub async fn get_config(&self) -> (WakeWordConfig, u64) {
        let state = self.state.lock().await;
        (state.config.clone(), state.version)
    }

    pub fn available_keywords(&self) -> &[String] {
        &self.allowed_keywords
    }

    /// Validate, persist, bump the version and broadcast to all subscribers.
    pub async fn update_config(
        &self,
        update: WakeWordUpdate,
    ) -> Result<(WakeWordConfig, u64), WakeWordError> {
        if let Some(keyword) = &update.keyword {
            if !self.allowed_keywords.contains(keyword) {
                return Err(WakeWordError::InvalidKeyword(keyword.clone()));
            }
        }
        if let Some(threshold) = update.threshold {
            if !(0.1..=1.0).contains(&threshold) {
                return Err(WakeWordError::InvalidThreshold(threshold));
            }
        }
        if let Some(cooldown) = update.cooldown_ms {
            if cooldown < self.min_cooldown_ms {
                return Err(WakeWordError::InvalidCooldown(cooldown, self.min_cooldown_ms));
            }
        }

        // Apply + persist + collect the sends under the state lock, so
        // concurrent updates keep versions monotonic; sends run after.
        let (config, version, sends) = {
            let mut state = self.state.lock().await;
            let mut config = state.config.clone();
            if let Some(keyword) = update.keyword {
                config.keyword = keyword;
            }
            if let Some(threshold) = update.threshold {
                config.threshold = threshold;
            }
            if let Some(cooldown) = update.cooldown_ms {
                config.cooldown_ms = cooldown;
            }
            if let Some(enabled) = update.enabled {
                config.enabled = enabled;
            }

            let version = state.version + 1;
            let persisted = PersistedConfig {
                config: config.clone(),
                version,
            };
            let value = serde_json::to_value(&persisted)
                .map_err(|e| WakeWordError::Persistence(e.to_string()))?;
            self.settings
                .set(SETTINGS_KEY, &value)
                .await
                .map_err(|e| WakeWordError::Persistence(e.to_string()))?;

            state.config = config.clone();
            state.version = version;

            // Every subscribed device goes back to pending for the new version
            for record in state.sync.values_mut() {
                record.pending = true;
            }

            let frame = ServerFrame::ConfigUpdate {
                config: config.to_client_config(),
                config_version: version,
            };
            let sends: Vec<(u64, Option<String>, mpsc::Sender<ServerFrame>, ServerFrame)> = state
                .subscribers
                .iter()
                .map(|(key, sub)| {
                    (*key, sub.device_id.clone(), sub.sender.clone(), frame.clone())
                })
                .collect();
            (config, version, sends)
        };

        info!(
            version,
            keyword = %config.keyword,
            subscriber_count = sends.len(),
            "Broadcasting wake-word config"
        );

        // Send outside the lock; a failed subscriber never aborts the rest.
        let mut failed: Vec<(u64, Option<String>)> = Vec::new();
        for (key, device_id, sender, frame) in sends {
            if sender.try_send(frame).is_err() {
                failed.push((key, device_id));
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            for (key, device_id) in failed {
                state.subscribers.remove(&key);
                if let Some(device_id) = device_id {
                    warn!(device_id = %device_id, "Subscriber send failed, removing");
                    if let Some(record) = state.sync.get_mut(&device_id) {
                        record.error = Some("config_update send failed".to_string());
                        record.pending = false;
                        record.success = false;
                    }
                }
            }
        }

        Ok((config, version))
    }

    /// Add a subscriber. A device id creates its sync record, initially
    /// pending. Returns a key for [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        sender: mpsc::Sender<ServerFrame>,
        device_id: Option<String>,
        device_type: Option<String>,
    ) -> u64 {
        let mut state = self.state.lock().await;
        let key = state.next_key;
        state.next_key += 1;
        if let Some(device_id) = &device_id {
            state.sync.insert(
                device_id.clone(),
                SyncRecord {
                    device_type,
                    last_ack_version: 0,
                    success: false,
                    active_keywords: Vec::new(),
                    failed_keywords: Vec::new(),
                    last_ack_at: None,
                    error: None,
                    pending: true,
                },
            );
        }
        state.subscribers.insert(key, Subscriber { sender, device_id });
        key
    }

    pub async fn unsubscribe(&self, key: u64) {
        let mut state = self.state.lock().await;
        state.subscribers.remove(&key);
    }

    /// Record a device's `config_ack`.
    pub async fn handle_ack(
        &self,
        device_id: &str,
        success: bool,
        active_keywords: Vec<String>,
        failed_keywords: Vec<String>,
        error: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        let version = state.version;
        let Some(record) = state.sync.get_mut(device_id) else {
            warn!(device_id = %device_id, "config_ack from device without sync record");
            return;
        };
        record.last_ack_version = version;
        record.success = success;
        record.active_keywords = active_keywords;
        record.failed_keywords = failed_keywords;
        record.last_ack_at = Some(Utc::now());
        record.error = error;
        record.pending = false;
    }

    pub async fn sync_status(&self) -> SyncSummary {
        let state = self.state.lock().await;
        let current = state.version;
        let devices: Vec<DeviceSyncStatus> = state
            .sync
            .iter()
            .map(|(device_id, r)| DeviceSyncStatus {
                device_id: device_id.clone(),
                device_type: r.device_type.clone(),
                last_ack_version: r.last_ack_version,
                active_keywords: r.active_keywords.clone(),
                failed_keywords: r.failed_keywords.clone(),
                last_ack_at: r.last_ack_at,
                error: r.error.clone(),
                pending: r.pending,
                synced: r.last_ack_version >= current
                    && r.success
                    && r.error.is_none()
                    && !r.pending,
            })
            .collect();

        SyncSummary {
            synced_count: devices.iter().filter(|d| d.synced).count(),
            pending_count: devices.iter().filter(|d| d.pending).count(),
            error_count: devices.iter().filter(|d| d.error.is_some()).count(),
            devices,
        }
    }

    pub async fn device_sync_status(&self, device_id: &str) -> Option<DeviceSyncStatus> {
        self.sync_status()
            .await
            .devices
            .into_iter()
            .find(|d| d.device_id == device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemorySettings(Mutex<HashMap<String, Value>>);

    impl MemorySettings {
        fn new() -> Self {
            Self(Mutex::new(HashMap::new()))
        }
    }

    #[async_trait]
    impl SettingsRepository for MemorySettings {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
            Ok(self.0.lock().await.get(key).cloned())
        }

        async fn set(&self, key: &str, value: &Value) -> anyhow::Result<()> {
            self.0.lock().await.insert(key.to_string(), value.clone());
            Ok(())
        }
    }

    fn broadcaster() -> WakeWordBroadcaster {
        WakeWordBroadcaster::new(
            Arc::new(MemorySettings::new()),
            &config::WakeWordDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_defaults_when_store_empty() {
        let b = broadcaster();
        b.load().await.unwrap();
        let (config, version) = b.get_config().await;
        assert_eq!(config.keyword, "hey_jarvis");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let settings = Arc::new(MemorySettings::new());
        let defaults = config::WakeWordDefaults::default();

        let b = WakeWordBroadcaster::new(settings.clone(), &defaults);
        b.update_config(WakeWordUpdate {
            keyword: Some("alexa".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        // A fresh broadcaster over the same store picks the update up
        let b2 = WakeWordBroadcaster::new(settings, &defaults);
        b2.load().await.unwrap();
        let (config, version) = b2.get_config().await;
        assert_eq!(config.keyword, "alexa");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_values() {
        let b = broadcaster();
        assert!(matches!(
            b.update_config(WakeWordUpdate {
                keyword: Some("computer".to_string()),
                ..Default::default()
            })
            .await,
            Err(WakeWordError::InvalidKeyword(_))
        ));
        assert!(matches!(
            b.update_config(WakeWordUpdate {
                threshold: Some(0.05),
                ..Default::default()
            })
            .await,
            Err(WakeWordError::InvalidThreshold(_))
        ));
        assert!(matches!(
            b.update_config(WakeWordUpdate {
                cooldown_ms: Some(1),
                ..Default::default()
            })
            .await,
            Err(WakeWordError::InvalidCooldown(_, _))
        ));
        // Failed updates never bump the version
        assert_eq!(b.get_config().await.1, 1);
    }

    #[tokio::test]
    async fn test_version_strictly_increases() {
        let b = broadcaster();
        let (_, v1) = b
            .update_config(WakeWordUpdate {
                threshold: Some(0.6),
                ..Default::default()
            })
            .await
            .unwrap();
        let (_, v2) = b
            .update_config(WakeWordUpdate {
                threshold: Some(0.7),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_with_new_version() {
        let b = broadcaster();
        let (tx, mut rx) = mpsc::channel(4);
        b.subscribe(tx, Some("sat-a".to_string()), Some("satellite".to_string()))
            .await;

        let (_, version) = b
            .update_config(WakeWordUpdate {
                keyword: Some("alexa".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            ServerFrame::ConfigUpdate {
                config,
                config_version,
            } => {
                assert_eq!(config_version, version);
                assert_eq!(config.wake_words, vec!["alexa".to_string()]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_removed_and_marked_errored() {
        let b = broadcaster();

        // Healthy subscriber
        let (tx_a, mut rx_a) = mpsc::channel(4);
        b.subscribe(tx_a, Some("sat-a".to_string()), None).await;

        // Dead subscriber: zero-capacity queue simulated by dropping the
        // receiver after filling the buffer
        let (tx_b, rx_b) = mpsc::channel(1);
        tx_b.try_send(ServerFrame::HeartbeatAck {}).unwrap();
        drop(rx_b);
        b.subscribe(tx_b, Some("sat-b".to_string()), None).await;

        b.update_config(WakeWordUpdate {
            keyword: Some("alexa".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(rx_a.try_recv().is_ok());
        b.handle_ack("sat-a", true, vec!["alexa".to_string()], vec![], None)
            .await;

        let summary = b.sync_status().await;
        assert_eq!(summary.synced_count, 1);
        assert_eq!(summary.pending_count, 0);
        assert_eq!(summary.error_count, 1);

        let b_status = b.device_sync_status("sat-b").await.unwrap();
        assert!(!b_status.synced);
        assert!(b_status.error.is_some());
    }

    #[tokio::test]
    async fn test_new_broadcast_resets_sync_to_pending() {
        let b = broadcaster();
        let (tx, mut rx) = mpsc::channel(8);
        b.subscribe(tx, Some("sat-a".to_string()), None).await;

        b.update_config(WakeWordUpdate {
            threshold: Some(0.6),
            ..Default::default()
        })
        .await
        .unwrap();
        b.handle_ack("sat-a", true, vec!["hey_jarvis".to_string()], vec![], None)
            .await;
        assert!(b.device_sync_status("sat-a").await.unwrap().synced);

        // Next broadcast: device is pending again until it acks V+1
        b.update_config(WakeWordUpdate {
            threshold: Some(0.7),
            ..Default::default()
        })
        .await
        .unwrap();
        let status = b.device_sync_status("sat-a").await.unwrap();
        assert!(status.pending);
        assert!(!status.synced);

        b.handle_ack("sat-a", true, vec!["hey_jarvis".to_string()], vec![], None)
            .await;
        assert!(b.device_sync_status("sat-a").await.unwrap().synced);
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn test_failed_ack_is_not_synced() {
        let b = broadcaster();
        let (tx, _rx) = mpsc::channel(8);
        b.subscribe(tx, Some("sat-a".to_string()), None).await;

        b.update_config(WakeWordUpdate {
            threshold: Some(0.8),
            ..Default::default()
        })
        .await
        .unwrap();
        b.handle_ack(
            "sat-a",
            false,
            vec![],
            vec!["hey_jarvis".to_string()],
            Some("model download failed".to_string()),
        )
        .await;

        let status = b.device_sync_status("sat-a").await.unwrap();
        assert!(!status.synced);
        assert_eq!(status.failed_keywords, vec!["hey_jarvis".to_string()]);
    }
}
