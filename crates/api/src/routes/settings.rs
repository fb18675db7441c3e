//! Wake-word settings endpoints
//!
//! The admin surface driving the config broadcaster: read the current
//! config, apply a partial update (validated, persisted, versioned,
//! broadcast) and inspect per-device sync state.

use crate::ws::{authenticate, AuthOutcome};
use crate::AppContext;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use services::wakeword::{WakeWordError, WakeWordUpdate};
use tracing::info;

fn require_admin(ctx: &AppContext, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    match authenticate(&ctx.config.auth, headers, None) {
        AuthOutcome::AllowedAdmin => Ok(()),
        AuthOutcome::Allowed => Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "admin token required" })),
        )),
        AuthOutcome::Denied => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "authentication required" })),
        )),
    }
}

pub async fn get_wakeword(State(ctx): State<AppContext>) -> Json<Value> {
    let (config, version) = ctx.broadcaster.get_config().await;
    Json(json!({
        "keyword": config.keyword,
        "threshold": config.threshold,
        "cooldown_ms": config.cooldown_ms,
        "enabled": config.enabled,
        "version": version,
        "available_keywords": ctx.broadcaster.available_keywords(),
    }))
}

pub async fn put_wakeword(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(update): Json<WakeWordUpdate>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    require_admin(&ctx, &headers)?;

    match ctx.broadcaster.update_config(update).await {
        Ok((config, version)) => {
            info!(version, keyword = %config.keyword, "Wake-word settings updated");
            Ok(Json(json!({
                "keyword": config.keyword,
                "threshold": config.threshold,
                "cooldown_ms": config.cooldown_ms,
                "enabled": config.enabled,
                "version": version,
            })))
        }
        Err(e @ (WakeWordError::InvalidKeyword(_)
        | WakeWordError::InvalidThreshold(_)
        | WakeWordError::InvalidCooldown(_, _))) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

pub async fn get_sync_status(State(ctx): State<AppContext>) -> Json<Value> {
    let summary = ctx.broadcaster.sync_status().await;
    Json(serde_json::to_value(summary).unwrap_or(Value::Null))
}

pub async fn get_device_sync_status(
    State(ctx): State<AppContext>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match ctx.broadcaster.device_sync_status(&device_id).await {
        Some(status) => Ok(Json(serde_json::to_value(status).unwrap_or(Value::Null))),
        None => Err(StatusCode::NOT_FOUND),
    }
}
