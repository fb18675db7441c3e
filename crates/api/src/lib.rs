//! HTTP/WebSocket surface of the renfield server
//!
//! Three WebSocket endpoints carry all device traffic; a small HTTP surface
//! drives the wake-word broadcaster and serves cached TTS audio to the
//! home-automation controller. Every handler receives the explicit
//! [`AppContext`] with the singletons constructed once in `main`.

pub mod routes;
pub mod ws;

use axum::routing::get;
use axum::Router;
use services::output::TtsAudioCache;
use services::rooms::RoomService;
use services::{DeviceRegistry, PresenceService, TurnCoordinator, WakeWordBroadcaster};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use ws::{ConnectionLimiter, RateLimiter};

/// Shared handles threaded through every handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<config::RenfieldConfig>,
    pub registry: Arc<DeviceRegistry>,
    pub rooms: Arc<RoomService>,
    pub turns: Arc<TurnCoordinator>,
    pub broadcaster: Arc<WakeWordBroadcaster>,
    pub presence: Arc<PresenceService>,
    pub tts_cache: Arc<TtsAudioCache>,
    pub connection_limiter: Arc<ConnectionLimiter>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Build the application router.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/ws", get(ws::chat::chat_handler))
        .route("/ws/satellite", get(ws::device::satellite_handler))
        .route("/ws/device", get(ws::device::device_handler))
        .route(
            "/api/settings/wakeword",
            get(routes::settings::get_wakeword).put(routes::settings::put_wakeword),
        )
        .route(
            "/api/settings/wakeword/sync",
            get(routes::settings::get_sync_status),
        )
        .route(
            "/api/settings/wakeword/sync/{device_id}",
            get(routes::settings::get_device_sync_status),
        )
        .route("/api/audio/{id}", get(routes::audio::get_cached_audio))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
