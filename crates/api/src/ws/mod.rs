//! WebSocket multiplexer plumbing
//!
//! Shared pieces of the three endpoints: the bearer-token auth gate, per-IP
//! and per-device connection caps, the token-bucket rate limiter, and the
//! per-connection writer task draining the bounded outbound frame queue.

pub mod chat;
pub mod device;

use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use futures::stream::SplitSink;
use futures::SinkExt;
use moka::sync::Cache;
use services::protocol::ServerFrame;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Inactive rate-limiter buckets are evicted after this idle period.
const RATE_BUCKET_TTI_SECS: u64 = 300;

// ==================== Auth gate ====================

/// Outcome of the bearer-token check. The token comes from the
/// `Authorization` header (preferred) or the `token` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Allowed,
    AllowedAdmin,
    Denied,
}

pub fn authenticate(
    auth: &config::AuthConfig,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> AuthOutcome {
    if !auth.enabled {
        return AuthOutcome::AllowedAdmin;
    }

    let header_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = header_token.or(query_token);

    match token {
        Some(token) if auth.admin_tokens.iter().any(|t| t == token) => AuthOutcome::AllowedAdmin,
        Some(token) if auth.tokens.iter().any(|t| t == token) => AuthOutcome::Allowed,
        _ => AuthOutcome::Denied,
    }
}

// ==================== Connection caps ====================

/// Tracks live connection counts per IP and per device id.
pub struct ConnectionLimiter {
    per_ip: Mutex<HashMap<String, usize>>,
    per_device: Mutex<HashMap<String, usize>>,
    max_per_ip: usize,
    max_per_device: usize,
}

impl ConnectionLimiter {
    pub fn new(limits: &config::LimitsConfig) -> Self {
        Self {
            per_ip: Mutex::new(HashMap::new()),
            per_device: Mutex::new(HashMap::new()),
            max_per_ip: limits.max_connections_per_ip,
            max_per_device: limits.max_connections_per_device,
        }
    }

    /// Reserve an IP slot. Returns false when the cap is reached.
    pub fn try_acquire_ip(&self, ip: &str) -> bool {
        let mut per_ip = self.per_ip.lock().unwrap();
        let count = per_ip.entry(ip.to_string()).or_insert(0);
        if *count >= self.max_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release_ip(&self, ip: &str) {
        let mut per_ip = self.per_ip.lock().unwrap();
        if let Some(count) = per_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(ip);
            }
        }
    }

    /// Reserve a device-id slot at registration time.
    pub fn try_acquire_device(&self, device_id: &str) -> bool {
        let mut per_device = self.per_device.lock().unwrap();
        let count = per_device.entry(device_id.to_string()).or_insert(0);
        if *count >= self.max_per_device {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release_device(&self, device_id: &str) {
        let mut per_device = self.per_device.lock().unwrap();
        if let Some(count) = per_device.get_mut(device_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_device.remove(device_id);
            }
        }
    }
}

// ==================== Rate limiter ====================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per device id (per IP before registration). Exceeding the
/// bucket costs the frame, not the connection.
pub struct RateLimiter {
    buckets: Cache<String, Arc<Mutex<Bucket>>>,
    burst: f64,
    per_sec: f64,
}

impl RateLimiter {
    pub fn new(limits: &config::LimitsConfig) -> Self {
        Self {
            buckets: Cache::builder()
                .time_to_idle(Duration::from_secs(RATE_BUCKET_TTI_SECS))
                .max_capacity(50_000)
                .build(),
            burst: f64::from(limits.rate_burst),
            per_sec: limits.rate_per_sec,
        }
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let burst = self.burst;
        let bucket = self.buckets.get_with(key.to_string(), || {
            Arc::new(Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }))
        });
        let mut bucket = bucket.lock().unwrap();

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.burst);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ==================== Outbound writer ====================

/// Spawn the writer task draining a connection's bounded frame queue into
/// the socket. The task ends when the queue closes (all senders dropped) or
/// the socket errors.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                debug!(error = %e, "WebSocket send failed, stopping writer");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Enqueue an error frame; slow clients just lose it.
pub fn send_error(
    tx: &mpsc::Sender<ServerFrame>,
    code: services::protocol::ErrorCode,
    message: impl Into<String>,
) {
    let _ = tx.try_send(ServerFrame::Error {
        code,
        message: message.into(),
    });
}

pub fn peer_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}
