//! Device registry and session lifecycle
//!
//! The registry owns the two in-memory tables everything else borrows from:
//! connected devices keyed by `device_id` and live sessions keyed by
//! `session_id`, plus the reverse index from device to its single active
//! session. All mutations for one device are serialized through a per-device
//! mutex; no lock is ever held across an await of collaborator I/O.
//!
//! Session state is monotonic along
//! `listening → processing → speaking → ended`; every state may jump
//! straight to `ended`. Ending a session triggers its cancellation token
//! before the `session_end` frame is written, so no session-scoped frame can
//! be observed after `session_end`.

use crate::protocol::{DeviceCapabilities, DeviceType, ServerFrame, SessionState};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Device {0} already has an active session")]
    SessionActive(String),
    #[error("No such session: {0}")]
    NoSession(String),
    #[error("Session {0} is not in the required state")]
    WrongState(String),
    #[error("Audio buffer full for session {0}")]
    BufferFull(String),
    #[error("Illegal state transition for session {session_id}: {from} → {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
    #[error("Transcript already set for session {0}")]
    TranscriptAlreadySet(String),
}

/// Registration parameters after capability merging and room resolution.
#[derive(Debug, Clone)]
pub struct RegisterDevice {
    pub device_id: String,
    pub device_type: DeviceType,
    pub room_name: String,
    pub room_id: Option<i32>,
    pub capabilities: DeviceCapabilities,
    pub device_name: Option<String>,
    pub is_stationary: bool,
    pub language: Option<String>,
}

/// A connected device row.
struct DeviceEntry {
    device_id: String,
    device_type: DeviceType,
    room_name: String,
    room_id: Option<i32>,
    capabilities: DeviceCapabilities,
    device_name: Option<String>,
    is_stationary: bool,
    language: Option<String>,
    sender: mpsc::Sender<ServerFrame>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    active_session: Option<String>,
}

/// Cloned read-only view of a device row.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub device_type: DeviceType,
    pub room_name: String,
    pub room_id: Option<i32>,
    pub capabilities: DeviceCapabilities,
    pub device_name: Option<String>,
    pub is_stationary: bool,
    pub language: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active_session: Option<String>,
}

/// A live session row.
struct SessionEntry {
    session_id: String,
    device_id: String,
    state: SessionState,
    created_at: DateTime<Utc>,
    keyword: Option<String>,
    confidence: f32,
    /// Chunks keyed by sequence; duplicate sequences resolve last-writer-wins.
    chunks: BTreeMap<u32, Vec<u8>>,
    buffered_bytes: usize,
    transcript: Option<String>,
    cancel: CancellationToken,
}

/// Cloned read-only view of a session row.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub device_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub keyword: Option<String>,
    pub confidence: f32,
    pub buffered_bytes: usize,
    pub max_sequence: Option<u32>,
    pub transcript: Option<String>,
}

/// Handle for emitting session-scoped frames to the owning device.
///
/// Frames are dropped once the session's cancellation token fires, which is
/// what enforces "no frames after `session_end`".
#[derive(Clone)]
pub struct SessionSink {
    pub session_id: String,
    pub device_id: String,
    sender: mpsc::Sender<ServerFrame>,
    cancel: CancellationToken,
}

impl SessionSink {
    /// Send a frame unless the session has been cancelled. Returns whether
    /// the frame was accepted into the device's send queue.
    ///
    /// A closed queue means the connection's writer task is gone (the socket
    /// died); that cancels the session so in-flight work stops at its next
    /// suspension point.
    pub fn send(&self, frame: ServerFrame) -> bool {
        if self.cancel.is_cancelled() {
            debug!(
                session_id = %self.session_id,
                "Dropping frame for cancelled session"
            );
            return false;
        }
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    session_id = %self.session_id,
                    device_id = %self.device_id,
                    "Device connection gone, cancelling session"
                );
                self.cancel.cancel();
                false
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    device_id = %self.device_id,
                    error = %e,
                    "Failed to enqueue frame for device"
                );
                false
            }
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct Inner {
    devices: HashMap<String, DeviceEntry>,
    sessions: HashMap<String, SessionEntry>,
}

/// The registry singleton. Constructed once at startup and shared by
/// reference with every connection handler.
pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    /// Per-device mutation locks; multi-step operations on one device are
    /// serialized here while the table lock stays short-lived.
    device_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_buffer_bytes: usize,
    listening_timeout: Duration,
    processing_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(audio: &config::AudioConfig, session: &config::SessionConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                devices: HashMap::new(),
                sessions: HashMap::new(),
            }),
            device_locks: std::sync::Mutex::new(HashMap::new()),
            max_buffer_bytes: audio.max_buffer_bytes,
            listening_timeout: Duration::from_secs(session.listening_timeout_secs),
            processing_timeout: Duration::from_secs(session.processing_timeout_secs),
        }
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().unwrap();
        locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create or update a device row and attach the WebSocket send handle.
    ///
    /// Idempotent: re-registering the same `device_id` replaces the prior
    /// handle (dropping it lets the old connection's writer task wind down)
    /// and ends any session that was still attached to it.
    pub async fn register(
        self: &Arc<Self>,
        params: RegisterDevice,
        sender: mpsc::Sender<ServerFrame>,
    ) {
        let lock = self.device_lock(&params.device_id);
        let _guard = lock.lock().await;

        let stale_session = {
            let mut inner = self.inner.write().await;
            let now = Utc::now();
            let stale = inner
                .devices
                .get(&params.device_id)
                .and_then(|d| d.active_session.clone());

            let entry = DeviceEntry {
                device_id: params.device_id.clone(),
                device_type: params.device_type,
                room_name: params.room_name,
                room_id: params.room_id,
                capabilities: params.capabilities,
                device_name: params.device_name,
                is_stationary: params.is_stationary,
                language: params.language,
                sender,
                connected_at: now,
                last_seen: now,
                active_session: None,
            };
            if inner
                .devices
                .insert(params.device_id.clone(), entry)
                .is_some()
            {
                info!(device_id = %params.device_id, "Device re-registered, replacing handle");
            } else {
                info!(
                    device_id = %params.device_id,
                    device_type = %params.device_type,
                    "Device registered"
                );
            }
            stale
        };

        if let Some(session_id) = stale_session {
            self.end_session(&session_id, "reconnected").await;
        }
    }

    /// End the active session, drop the handle and remove the device row.
    pub async fn unregister(self: &Arc<Self>, device_id: &str) {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let active = {
            let inner = self.inner.read().await;
            inner
                .devices
                .get(device_id)
                .and_then(|d| d.active_session.clone())
        };
        if let Some(session_id) = active {
            self.end_session(&session_id, "disconnected").await;
        }

        let mut inner = self.inner.write().await;
        if inner.devices.remove(device_id).is_some() {
            info!(device_id = %device_id, "Device unregistered");
        }
    }

    /// Allocate a new session in state `listening`.
    ///
    /// Fails if the device is unknown or already has an active session. A
    /// client-supplied session id is honored when present.
    pub async fn start_session(
        self: &Arc<Self>,
        device_id: &str,
        keyword: Option<String>,
        confidence: f32,
        client_session_id: Option<String>,
    ) -> Result<String, RegistryError> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let session_id = {
            let mut inner = self.inner.write().await;
            let device = inner
                .devices
                .get(device_id)
                .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
            if let Some(active) = &device.active_session {
                return Err(RegistryError::SessionActive(format!(
                    "{device_id} (session {active})"
                )));
            }

            let session_id = client_session_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let entry = SessionEntry {
                session_id: session_id.clone(),
                device_id: device_id.to_string(),
                state: SessionState::Listening,
                created_at: Utc::now(),
                keyword,
                confidence,
                chunks: BTreeMap::new(),
                buffered_bytes: 0,
                transcript: None,
                cancel: CancellationToken::new(),
            };
            inner.sessions.insert(session_id.clone(), entry);
            if let Some(device) = inner.devices.get_mut(device_id) {
                device.active_session = Some(session_id.clone());
                let _ = device.sender.try_send(ServerFrame::SessionStarted {
                    session_id: session_id.clone(),
                });
                Self::notify_state(device, SessionState::Listening);
            }
            session_id
        };

        info!(device_id = %device_id, session_id = %session_id, "Session started");
        self.spawn_watchdog(
            session_id.clone(),
            SessionState::Listening,
            self.listening_timeout,
        );
        Ok(session_id)
    }

    /// Append an audio chunk to a listening session's buffer.
    pub async fn buffer_audio(
        &self,
        session_id: &str,
        chunk: Vec<u8>,
        sequence: u32,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NoSession(session_id.to_string()))?;

        if session.state != SessionState::Listening {
            return Err(RegistryError::WrongState(session_id.to_string()));
        }

        // Duplicate sequences replace the earlier payload (last-writer-wins),
        // so account for the displaced bytes before checking the bound.
        let displaced = session.chunks.get(&sequence).map(Vec::len).unwrap_or(0);
        let projected = session.buffered_bytes - displaced + chunk.len();
        if projected > self.max_buffer_bytes {
            return Err(RegistryError::BufferFull(session_id.to_string()));
        }

        session.buffered_bytes = projected;
        session.chunks.insert(sequence, chunk);
        Ok(())
    }

    /// Assemble the buffered audio in ascending sequence order.
    ///
    /// Returns the joined bytes plus a flag reporting sequence gaps; gaps are
    /// never zero-filled, the data is joined best-effort.
    pub async fn get_audio(&self, session_id: &str) -> Result<(Vec<u8>, bool), RegistryError> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::NoSession(session_id.to_string()))?;

        let mut joined = Vec::with_capacity(session.buffered_bytes);
        for chunk in session.chunks.values() {
            joined.extend_from_slice(chunk);
        }

        let has_gaps = match (
            session.chunks.keys().next(),
            session.chunks.keys().next_back(),
        ) {
            (Some(first), Some(last)) => {
                (*last - *first + 1) as usize != session.chunks.len()
            }
            _ => false,
        };
        if has_gaps {
            warn!(session_id = %session_id, "Audio buffer has sequence gaps");
        }
        Ok((joined, has_gaps))
    }

    /// Advance a session's state. Rejects non-monotonic transitions and
    /// notifies the owning device when it has a visible state surface.
    pub async fn set_session_state(
        self: &Arc<Self>,
        session_id: &str,
        new_state: SessionState,
    ) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write().await;
            let session = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RegistryError::NoSession(session_id.to_string()))?;

            if new_state < session.state || new_state == session.state {
                return Err(RegistryError::InvalidTransition {
                    session_id: session_id.to_string(),
                    from: session.state,
                    to: new_state,
                });
            }
            session.state = new_state;

            let device_id = session.device_id.clone();
            if let Some(device) = inner.devices.get(&device_id) {
                Self::notify_state(device, new_state);
            }
        }

        debug!(session_id = %session_id, state = %new_state, "Session state changed");
        if new_state == SessionState::Processing {
            self.spawn_watchdog(
                session_id.to_string(),
                SessionState::Processing,
                self.processing_timeout,
            );
        }
        Ok(())
    }

    /// Record the assembled transcript. Set exactly once per session.
    pub async fn set_transcript(
        &self,
        session_id: &str,
        transcript: String,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NoSession(session_id.to_string()))?;
        if session.transcript.is_some() {
            return Err(RegistryError::TranscriptAlreadySet(session_id.to_string()));
        }
        session.transcript = Some(transcript);
        Ok(())
    }

    /// End a session: trigger its cancellation token, free the buffer,
    /// detach it from the device and notify the device. Idempotent.
    pub async fn end_session(&self, session_id: &str, reason: &str) {
        let mut inner = self.inner.write().await;
        let Some(mut session) = inner.sessions.remove(session_id) else {
            return;
        };

        session.state = SessionState::Ended;
        // Cancel before the session_end frame goes out so that any frame a
        // concurrent task tries to emit through a SessionSink is dropped.
        session.cancel.cancel();
        session.chunks.clear();

        if let Some(device) = inner.devices.get_mut(&session.device_id) {
            if device.active_session.as_deref() == Some(session_id) {
                device.active_session = None;
            }
            let _ = device.sender.try_send(ServerFrame::SessionEnd {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            });
            Self::notify_state(device, SessionState::Ended);
        }

        info!(session_id = %session_id, reason = %reason, "Session ended");
    }

    /// Refresh a device's last-seen timestamp (heartbeat).
    pub async fn touch(&self, device_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(device) = inner.devices.get_mut(device_id) {
            device.last_seen = Utc::now();
        }
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let inner = self.inner.read().await;
        inner.devices.get(device_id).map(Self::device_snapshot)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        let inner = self.inner.read().await;
        inner.sessions.get(session_id).map(|s| SessionSnapshot {
            session_id: s.session_id.clone(),
            device_id: s.device_id.clone(),
            state: s.state,
            created_at: s.created_at,
            keyword: s.keyword.clone(),
            confidence: s.confidence,
            buffered_bytes: s.buffered_bytes,
            max_sequence: s.chunks.keys().next_back().copied(),
            transcript: s.transcript.clone(),
        })
    }

    /// Whether a device is currently connected.
    pub async fn is_online(&self, device_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.devices.contains_key(device_id)
    }

    /// Frame sink scoped to a session, gated on its cancellation token.
    pub async fn session_sink(&self, session_id: &str) -> Option<SessionSink> {
        let inner = self.inner.read().await;
        let session = inner.sessions.get(session_id)?;
        let device = inner.devices.get(&session.device_id)?;
        Some(SessionSink {
            session_id: session.session_id.clone(),
            device_id: session.device_id.clone(),
            sender: device.sender.clone(),
            cancel: session.cancel.clone(),
        })
    }

    /// Raw frame sender for a device (config updates, heartbeat acks).
    pub async fn device_sender(&self, device_id: &str) -> Option<mpsc::Sender<ServerFrame>> {
        let inner = self.inner.read().await;
        inner.devices.get(device_id).map(|d| d.sender.clone())
    }

    fn device_snapshot(device: &DeviceEntry) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: device.device_id.clone(),
            device_type: device.device_type,
            room_name: device.room_name.clone(),
            room_id: device.room_id,
            capabilities: device.capabilities,
            device_name: device.device_name.clone(),
            is_stationary: device.is_stationary,
            language: device.language.clone(),
            connected_at: device.connected_at,
            last_seen: device.last_seen,
            active_session: device.active_session.clone(),
        }
    }

    fn notify_state(device: &DeviceEntry, state: SessionState) {
        // Satellites drive an LED from state frames, display devices a UI.
        if device.device_type == DeviceType::Satellite || device.capabilities.has_display {
            let _ = device.sender.try_send(ServerFrame::State { state });
        }
    }

    /// Watchdog ending the session if it is still in `watched` after
    /// `timeout`.
    fn spawn_watchdog(self: &Arc<Self>, session_id: String, watched: SessionState, timeout: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_there = {
                let inner = registry.inner.read().await;
                inner
                    .sessions
                    .get(&session_id)
                    .map(|s| s.state == watched)
                    .unwrap_or(false)
            };
            if still_there {
                warn!(session_id = %session_id, state = %watched, "Session timed out");
                registry.end_session(&session_id, "timeout").await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Arc<DeviceRegistry> {
        test_registry_with_buffer(1024)
    }

    fn test_registry_with_buffer(max_buffer_bytes: usize) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(
            &config::AudioConfig {
                max_buffer_bytes,
                ..Default::default()
            },
            &config::SessionConfig::default(),
        ))
    }

    fn satellite(device_id: &str) -> RegisterDevice {
        RegisterDevice {
            device_id: device_id.to_string(),
            device_type: DeviceType::Satellite,
            room_name: "Kitchen".to_string(),
            room_id: Some(1),
            capabilities: DeviceType::Satellite.default_capabilities(),
            device_name: None,
            is_stationary: true,
            language: None,
        }
    }

    fn channel() -> (mpsc::Sender<ServerFrame>, mpsc::Receiver<ServerFrame>) {
        mpsc::channel(64)
    }

    async fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_start_session_requires_registration() {
        let registry = test_registry();
        let result = registry.start_session("ghost", None, 0.0, None).await;
        assert!(matches!(result, Err(RegistryError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_single_active_session_per_device() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;

        let first = registry
            .start_session("sat-1", Some("alexa".into()), 0.9, None)
            .await
            .unwrap();
        let second = registry.start_session("sat-1", None, 0.0, None).await;
        assert!(matches!(second, Err(RegistryError::SessionActive(_))));

        registry.end_session(&first, "completed").await;
        assert!(registry.start_session("sat-1", None, 0.0, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_session_id_is_honored() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;

        let id = registry
            .start_session("sat-1", None, 0.0, Some("sat-1-42".to_string()))
            .await
            .unwrap();
        assert_eq!(id, "sat-1-42");
    }

    #[tokio::test]
    async fn test_audio_join_order_and_duplicates() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry.buffer_audio(&sid, vec![3, 3], 3).await.unwrap();
        registry.buffer_audio(&sid, vec![1, 1], 1).await.unwrap();
        registry.buffer_audio(&sid, vec![2, 2], 2).await.unwrap();
        // Duplicate sequence: last writer wins
        registry.buffer_audio(&sid, vec![9, 9], 2).await.unwrap();

        let (audio, has_gaps) = registry.get_audio(&sid).await.unwrap();
        assert_eq!(audio, vec![1, 1, 9, 9, 3, 3]);
        assert!(!has_gaps);
    }

    #[tokio::test]
    async fn test_audio_gap_is_flagged_not_filled() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry.buffer_audio(&sid, vec![1], 1).await.unwrap();
        registry.buffer_audio(&sid, vec![4], 4).await.unwrap();

        let (audio, has_gaps) = registry.get_audio(&sid).await.unwrap();
        assert_eq!(audio, vec![1, 4]);
        assert!(has_gaps);
    }

    #[tokio::test]
    async fn test_buffer_bound_enforced() {
        let registry = test_registry_with_buffer(8);
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry.buffer_audio(&sid, vec![0; 6], 1).await.unwrap();
        let result = registry.buffer_audio(&sid, vec![0; 6], 2).await;
        assert!(matches!(result, Err(RegistryError::BufferFull(_))));

        // Replacing an existing sequence frees its bytes first
        registry.buffer_audio(&sid, vec![0; 8], 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_rejected_outside_listening() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry
            .set_session_state(&sid, SessionState::Processing)
            .await
            .unwrap();
        let result = registry.buffer_audio(&sid, vec![1], 1).await;
        assert!(matches!(result, Err(RegistryError::WrongState(_))));
    }

    #[tokio::test]
    async fn test_state_transitions_are_monotonic() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry
            .set_session_state(&sid, SessionState::Processing)
            .await
            .unwrap();
        registry
            .set_session_state(&sid, SessionState::Speaking)
            .await
            .unwrap();

        let back = registry
            .set_session_state(&sid, SessionState::Listening)
            .await;
        assert!(matches!(back, Err(RegistryError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_transcript_set_exactly_once() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry.set_transcript(&sid, "hello".into()).await.unwrap();
        let again = registry.set_transcript(&sid, "world".into()).await;
        assert!(matches!(again, Err(RegistryError::TranscriptAlreadySet(_))));
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent_and_cancels() {
        let registry = test_registry();
        let (tx, mut rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();
        let sink = registry.session_sink(&sid).await.unwrap();

        registry.end_session(&sid, "cancel").await;
        registry.end_session(&sid, "cancel").await;

        assert!(sink.is_cancelled());
        assert!(!sink.send(ServerFrame::Stream {
            session_id: Some(sid.clone()),
            content: "late".into()
        }));

        let frames = drain(&mut rx).await;
        // session_started, state listening, session_end, state ended:
        // exactly one session_end despite the double call
        let ends = frames
            .iter()
            .filter(|f| matches!(f, ServerFrame::SessionEnd { .. }))
            .count();
        assert_eq!(ends, 1);
        // No frame after session_end is session-scoped output
        let end_pos = frames
            .iter()
            .position(|f| matches!(f, ServerFrame::SessionEnd { .. }))
            .unwrap();
        assert!(frames[end_pos + 1..]
            .iter()
            .all(|f| matches!(f, ServerFrame::State { .. })));
    }

    #[tokio::test]
    async fn test_reregister_replaces_handle_and_ends_session() {
        let registry = test_registry();
        let (tx1, _rx1) = channel();
        registry.register(satellite("sat-1"), tx1).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        let (tx2, _rx2) = channel();
        registry.register(satellite("sat-1"), tx2).await;

        assert!(registry.get_session(&sid).await.is_none());
        let device = registry.get_device("sat-1").await.unwrap();
        assert!(device.active_session.is_none());
    }

    #[tokio::test]
    async fn test_unregister_ends_active_session() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        registry.unregister("sat-1").await;
        assert!(registry.get_session(&sid).await.is_none());
        assert!(!registry.is_online("sat-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listening_timeout_ends_session() {
        let registry = test_registry();
        let (tx, _rx) = channel();
        registry.register(satellite("sat-1"), tx).await;
        let sid = registry.start_session("sat-1", None, 0.0, None).await.unwrap();

        // Let the spawned watchdog task get its first poll (and thus
        // register its sleep deadline against the current time) before we
        // advance the clock.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(16)).await;
        // Yield so the watchdog task runs to completion
        tokio::task::yield_now().await;

        assert!(registry.get_session(&sid).await.is_none());
    }
}
