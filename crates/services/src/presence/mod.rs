//! Presence service
//!
//! Answers "where is X" and "who is home" from two sources: voice-auth
//! presence (an authenticated turn places the user in the input device's
//! room, high confidence) and beacon presence (satellites report RSSI
//! sightings of known user devices; consistent sightings yield a lower
//! confidence room assignment). Records expire after a TTL.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceSource {
    Voice,
    Beacon,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceRecord {
    pub user: String,
    pub room_id: Option<i32>,
    pub room_name: Option<String>,
    pub confidence: f32,
    pub last_seen: DateTime<Utc>,
    pub source: PresenceSource,
}

const VOICE_CONFIDENCE: f32 = 0.9;
const BEACON_CONFIDENCE: f32 = 0.6;
/// Window within which beacon sightings must repeat to count.
const BEACON_WINDOW_SECS: i64 = 120;

struct BeaconSightings {
    room_id: i32,
    timestamps: Vec<DateTime<Utc>>,
}

struct PresenceState {
    records: HashMap<String, PresenceRecord>,
    sightings: HashMap<String, BeaconSightings>,
}

pub struct PresenceService {
    state: Arc<RwLock<PresenceState>>,
    ttl: ChronoDuration,
    min_observations: usize,
    enabled: bool,
}

impl PresenceService {
    pub fn new(config: &config::PresenceConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(PresenceState {
                records: HashMap::new(),
                sightings: HashMap::new(),
            })),
            ttl: ChronoDuration::seconds(config.ttl_secs as i64),
            min_observations: config.beacon_min_observations,
            enabled: config.enabled,
        }
    }

    /// Mark a user present in a room because they just spoke or typed there.
    pub async fn register_voice_presence(
        &self,
        user: &str,
        room_id: Option<i32>,
        room_name: Option<&str>,
    ) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write().await;
        state.records.insert(
            user.to_lowercase(),
            PresenceRecord {
                user: user.to_string(),
                room_id,
                room_name: room_name.map(String::from),
                confidence: VOICE_CONFIDENCE,
                last_seen: Utc::now(),
                source: PresenceSource::Voice,
            },
        );
        debug!(user = %user, room = room_name.unwrap_or(""), "Voice presence registered");
    }

    /// Record one beacon sighting; consistent sightings in the same room
    /// within the window produce a presence record.
    pub async fn register_beacon_observation(
        &self,
        user: &str,
        room_id: i32,
        room_name: &str,
        _rssi: i32,
    ) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let key = user.to_lowercase();
        let mut state = self.state.write().await;

        let sightings = state
            .sightings
            .entry(key.clone())
            .or_insert_with(|| BeaconSightings {
                room_id,
                timestamps: Vec::new(),
            });
        // A room change resets the streak
        if sightings.room_id != room_id {
            sightings.room_id = room_id;
            sightings.timestamps.clear();
        }
        let window_start = now - ChronoDuration::seconds(BEACON_WINDOW_SECS);
        sightings.timestamps.retain(|t| *t >= window_start);
        sightings.timestamps.push(now);
        let consistent = sightings.timestamps.len() >= self.min_observations;

        if consistent {
            // Voice presence is fresher evidence; never downgrade it
            let keep_voice = state
                .records
                .get(&key)
                .map(|r| r.source == PresenceSource::Voice && now - r.last_seen < self.ttl)
                .unwrap_or(false);
            if !keep_voice {
                state.records.insert(
                    key,
                    PresenceRecord {
                        user: user.to_string(),
                        room_id: Some(room_id),
                        room_name: Some(room_name.to_string()),
                        confidence: BEACON_CONFIDENCE,
                        last_seen: now,
                        source: PresenceSource::Beacon,
                    },
                );
                debug!(user = %user, room = %room_name, "Beacon presence registered");
            }
        }
    }

    /// Find a user's presence. Matching is loose: exact username, then
    /// first-name token, then last-name token (case-insensitive).
    pub async fn where_is(&self, name: &str) -> Option<PresenceRecord> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - self.ttl;
        let needle = name.to_lowercase();

        let fresh = |record: &&PresenceRecord| record.last_seen >= cutoff;

        if let Some(record) = state.records.get(&needle).filter(fresh) {
            return Some((*record).clone());
        }

        let first_match = state
            .records
            .values()
            .filter(fresh)
            .find(|r| {
                r.user
                    .split_whitespace()
                    .next()
                    .map(|t| t.to_lowercase() == needle)
                    .unwrap_or(false)
            })
            .cloned();
        if first_match.is_some() {
            return first_match;
        }

        state
            .records
            .values()
            .filter(fresh)
            .find(|r| {
                r.user
                    .split_whitespace()
                    .next_back()
                    .map(|t| t.to_lowercase() == needle)
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// All non-expired presence records.
    pub async fn everyone(&self) -> Vec<PresenceRecord> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - self.ttl;
        state
            .records
            .values()
            .filter(|r| r.last_seen >= cutoff)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> PresenceService {
        PresenceService::new(&config::PresenceConfig::default())
    }

    #[tokio::test]
    async fn test_voice_presence_and_lookup() {
        let p = service();
        p.register_voice_presence("Jan Smith", Some(1), Some("Kitchen"))
            .await;

        let record = p.where_is("jan smith").await.unwrap();
        assert_eq!(record.room_name.as_deref(), Some("Kitchen"));
        assert_eq!(record.source, PresenceSource::Voice);
        assert!(record.confidence > 0.8);
    }

    #[tokio::test]
    async fn test_loose_name_matching() {
        let p = service();
        p.register_voice_presence("Jan Smith", Some(1), Some("Kitchen"))
            .await;

        assert!(p.where_is("Jan").await.is_some());
        assert!(p.where_is("smith").await.is_some());
        assert!(p.where_is("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_beacon_requires_consistent_sightings() {
        let p = service();
        p.register_beacon_observation("Jan", 2, "Office", -60).await;
        assert!(p.where_is("Jan").await.is_none());

        p.register_beacon_observation("Jan", 2, "Office", -58).await;
        let record = p.where_is("Jan").await.unwrap();
        assert_eq!(record.source, PresenceSource::Beacon);
        assert_eq!(record.room_id, Some(2));
    }

    #[tokio::test]
    async fn test_room_change_resets_beacon_streak() {
        let p = service();
        p.register_beacon_observation("Jan", 2, "Office", -60).await;
        p.register_beacon_observation("Jan", 3, "Kitchen", -60).await;
        // One sighting in the new room is not yet consistent
        assert!(p.where_is("Jan").await.is_none());
    }

    #[tokio::test]
    async fn test_beacon_does_not_downgrade_fresh_voice() {
        let p = service();
        p.register_voice_presence("Jan", Some(1), Some("Kitchen"))
            .await;
        p.register_beacon_observation("Jan", 2, "Office", -60).await;
        p.register_beacon_observation("Jan", 2, "Office", -60).await;

        let record = p.where_is("Jan").await.unwrap();
        assert_eq!(record.source, PresenceSource::Voice);
        assert_eq!(record.room_id, Some(1));
    }

    #[tokio::test]
    async fn test_expired_presence_disappears() {
        let p = PresenceService::new(&config::PresenceConfig {
            ttl_secs: 0,
            ..Default::default()
        });
        p.register_voice_presence("Jan", Some(1), Some("Kitchen"))
            .await;
        // TTL of zero: immediately stale
        assert!(p.where_is("Jan").await.is_none());
        assert!(p.everyone().await.is_empty());
    }
}
