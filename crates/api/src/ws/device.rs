//! Device and satellite WebSocket endpoints
//!
//! One receive loop serves both `/ws/device` and `/ws/satellite`; frames
//! from a single connection are processed strictly in receive order, and the
//! voice turn triggered by `audio_end` runs inline in the connection task.

use crate::ws::{
    authenticate, peer_ip, send_error, spawn_writer, AuthOutcome,
};
use crate::AppContext;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::StreamExt;
use serde_json::Value;
use services::protocol::{
    close_codes, ClientFrame, DeviceType, ErrorCode, ServerFrame, PROTOCOL_VERSION,
};
use services::registry::{RegisterDevice, RegistryError};
use services::rooms::RoomContext;
use services::router::SessionMemo;
use services::turn::TextTurnParams;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn device_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    handle_upgrade(ws, ctx, addr, params, headers, "device")
}

pub async fn satellite_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    handle_upgrade(ws, ctx, addr, params, headers, "satellite")
}

fn handle_upgrade(
    ws: WebSocketUpgrade,
    ctx: AppContext,
    addr: SocketAddr,
    params: HashMap<String, String>,
    headers: HeaderMap,
    endpoint: &'static str,
) -> axum::response::Response {
    let auth = authenticate(
        &ctx.config.auth,
        &headers,
        params.get("token").map(String::as_str),
    );
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    ws.on_upgrade(move |socket| async move {
        let ip = peer_ip(&addr);
        if auth == AuthOutcome::Denied {
            close_with(socket, close_codes::UNAUTHORIZED, "Authentication required").await;
            return;
        }
        if !ctx.connection_limiter.try_acquire_ip(&ip) {
            close_with(socket, close_codes::CONNECTION_LIMIT, "Connection limit exceeded").await;
            return;
        }

        info!(endpoint, ip = %ip, "Device WebSocket connected");
        run_connection(socket, ctx.clone(), ip.clone(), user_agent, endpoint).await;
        ctx.connection_limiter.release_ip(&ip);
    })
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

struct Connection {
    device_id: Option<String>,
    device_slot_held: bool,
    subscriber_key: Option<u64>,
    memo: SessionMemo,
}

async fn run_connection(
    socket: WebSocket,
    ctx: AppContext,
    ip: String,
    user_agent: Option<String>,
    endpoint: &'static str,
) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerFrame>(ctx.config.limits.send_queue_depth);
    let writer = spawn_writer(sink, rx);

    let mut conn = Connection {
        device_id: None,
        device_slot_held: false,
        subscriber_key: None,
        memo: SessionMemo::new(),
    };

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(endpoint, error = %e, "WebSocket receive error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                let rate_key = conn.device_id.clone().unwrap_or_else(|| ip.clone());
                if !ctx.rate_limiter.check(&rate_key) {
                    send_error(&tx, ErrorCode::RateLimited, "Too many messages");
                    continue;
                }

                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        send_error(&tx, ErrorCode::InvalidMessage, format!("Invalid frame: {e}"));
                        continue;
                    }
                };
                handle_frame(&ctx, &mut conn, &tx, frame, &ip, user_agent.as_deref()).await;
            }
            Message::Close(_) => {
                debug!(endpoint, "WebSocket closed by client");
                break;
            }
            // axum answers pings automatically; binary frames are not part
            // of the protocol
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                send_error(&tx, ErrorCode::InvalidMessage, "Binary frames are not supported");
            }
        }
    }

    // Disconnect: end the session, mark offline, drop subscriptions
    if let Some(device_id) = &conn.device_id {
        info!(device_id = %device_id, "Device disconnected");
        if let Some(key) = conn.subscriber_key {
            ctx.broadcaster.unsubscribe(key).await;
        }
        ctx.registry.unregister(device_id).await;
        if let Err(e) = ctx.rooms.set_device_offline(device_id).await {
            warn!(device_id = %device_id, error = %e, "Failed to mark device offline");
        }
        if conn.device_slot_held {
            ctx.connection_limiter.release_device(device_id);
        }
    }
    drop(tx);
    let _ = writer.await;
}

async fn handle_frame(
    ctx: &AppContext,
    conn: &mut Connection,
    tx: &mpsc::Sender<ServerFrame>,
    frame: ClientFrame,
    ip: &str,
    user_agent: Option<&str>,
) {
    match frame {
        ClientFrame::Register {
            device_id,
            device_type,
            room,
            capabilities,
            device_name,
            is_stationary,
            language,
            version,
            protocol_version,
        } => {
            debug!(
                device_id = %device_id,
                device_type = %device_type,
                client_version = version.as_deref().unwrap_or(""),
                client_protocol = protocol_version.as_deref().unwrap_or(""),
                "Registration"
            );
            register_device(
                ctx,
                conn,
                tx,
                RegisterParams {
                    device_id,
                    device_type,
                    room,
                    capabilities,
                    device_name,
                    is_stationary,
                    language,
                    ip,
                    user_agent,
                },
            )
            .await;
        }

        ClientFrame::WakewordDetected {
            keyword,
            confidence,
            session_id,
        } => {
            let Some(device_id) = conn.device_id.clone() else {
                send_error(tx, ErrorCode::DeviceError, "Register first");
                return;
            };
            match ctx
                .registry
                .start_session(&device_id, Some(keyword.clone()), confidence, session_id)
                .await
            {
                Ok(session_id) => {
                    info!(
                        device_id = %device_id,
                        keyword = %keyword,
                        session_id = %session_id,
                        "Wake word detected"
                    );
                }
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Could not start session");
                }
            }
        }

        ClientFrame::StartSession {} => {
            let Some(device_id) = conn.device_id.clone() else {
                send_error(tx, ErrorCode::DeviceError, "Register first");
                return;
            };
            if let Err(e) = ctx.registry.start_session(&device_id, None, 0.0, None).await {
                warn!(device_id = %device_id, error = %e, "Manual session start failed");
                send_error(tx, ErrorCode::DeviceError, e.to_string());
            }
        }

        ClientFrame::Audio {
            session_id,
            chunk,
            sequence,
        } => {
            let bytes = match BASE64.decode(chunk.as_bytes()) {
                Ok(bytes) => bytes,
                Err(_) => {
                    send_error(tx, ErrorCode::InvalidMessage, "Invalid audio encoding");
                    return;
                }
            };
            match ctx.registry.buffer_audio(&session_id, bytes, sequence).await {
                Ok(()) => {}
                Err(RegistryError::BufferFull(_)) => {
                    send_error(tx, ErrorCode::BufferFull, "Audio buffer full");
                    ctx.registry.end_session(&session_id, "buffer_full").await;
                }
                // Late chunks for an ended session are expected noise
                Err(e) => debug!(session_id = %session_id, error = %e, "Audio chunk dropped"),
            }
        }

        ClientFrame::AudioEnd { session_id, reason } => {
            let reason = reason.unwrap_or_default();
            info!(session_id = %session_id, reason = %reason, "Audio ended");
            if matches!(reason.as_str(), "cancel" | "cancelled") {
                ctx.registry.end_session(&session_id, "cancelled").await;
                return;
            }
            ctx.turns.run_voice_turn(&session_id).await;
        }

        ClientFrame::Text {
            session_id,
            content,
            use_rag,
            knowledge_base_id,
            attachment_ids,
        } => {
            let room = match &conn.device_id {
                Some(device_id) => match ctx.registry.get_device(device_id).await {
                    Some(device) => RoomContext {
                        room_id: device.room_id,
                        room_name: Some(device.room_name.clone()),
                        device_id: Some(device.device_id.clone()),
                        device_type: Some(device.device_type.to_string()),
                        speaker_name: None,
                        speaker_alias: None,
                    },
                    None => RoomContext::default(),
                },
                None => RoomContext::default(),
            };
            let params = TextTurnParams {
                content,
                session_id,
                use_rag: use_rag.unwrap_or(false),
                knowledge_base_id,
                attachment_ids: attachment_ids.unwrap_or_default(),
                room,
                user_id: None,
                permissions: None,
            };
            let cancel = tokio_util::sync::CancellationToken::new();
            ctx.turns
                .run_text_turn(params, &mut conn.memo, tx.clone(), &cancel)
                .await;
        }

        ClientFrame::Heartbeat {
            status,
            uptime_seconds,
            metrics,
            version: _,
        } => {
            if let Some(device_id) = &conn.device_id {
                ctx.registry.touch(device_id).await;
                debug!(
                    device_id = %device_id,
                    status = status.as_deref().unwrap_or(""),
                    uptime = uptime_seconds.unwrap_or(0),
                    "Heartbeat"
                );
                if let Some(metrics) = metrics {
                    record_beacon_observations(ctx, device_id, &metrics).await;
                }
            }
            let _ = tx.try_send(ServerFrame::HeartbeatAck {});
        }

        ClientFrame::ConfigAck {
            success,
            active_keywords,
            failed_keywords,
            error,
        } => {
            if let Some(device_id) = &conn.device_id {
                ctx.broadcaster
                    .handle_ack(
                        device_id,
                        success,
                        active_keywords,
                        failed_keywords.unwrap_or_default(),
                        error,
                    )
                    .await;
            }
        }

        ClientFrame::UpdateProgress {
            stage,
            progress,
            message,
        } => {
            info!(
                device_id = conn.device_id.as_deref().unwrap_or(""),
                stage = %stage,
                progress,
                message = message.as_deref().unwrap_or(""),
                "Device update progress"
            );
        }

        ClientFrame::UpdateComplete { version } => {
            info!(
                device_id = conn.device_id.as_deref().unwrap_or(""),
                version = version.as_deref().unwrap_or(""),
                "Device update complete"
            );
        }

        ClientFrame::UpdateFailed { error } => {
            warn!(
                device_id = conn.device_id.as_deref().unwrap_or(""),
                error = error.as_deref().unwrap_or(""),
                "Device update failed"
            );
        }
    }
}

struct RegisterParams<'a> {
    device_id: String,
    device_type: DeviceType,
    room: String,
    capabilities: Option<services::protocol::CapabilityOverrides>,
    device_name: Option<String>,
    is_stationary: Option<bool>,
    language: Option<String>,
    ip: &'a str,
    user_agent: Option<&'a str>,
}

async fn register_device(
    ctx: &AppContext,
    conn: &mut Connection,
    tx: &mpsc::Sender<ServerFrame>,
    mut params: RegisterParams<'_>,
) {
    // Clients without a stored identity register with an empty id and learn
    // the generated one from register_ack
    if params.device_id.trim().is_empty() {
        params.device_id =
            services::rooms::generate_device_id(params.device_type, &params.room);
        info!(device_id = %params.device_id, "Generated device id for new device");
    }

    // Re-registering under a different id releases the old slot
    if let Some(previous) = &conn.device_id {
        if previous != &params.device_id && conn.device_slot_held {
            ctx.connection_limiter.release_device(previous);
            conn.device_slot_held = false;
        }
    }
    if !conn.device_slot_held {
        if !ctx.connection_limiter.try_acquire_device(&params.device_id) {
            send_error(
                tx,
                ErrorCode::DeviceError,
                "Too many connections for this device id",
            );
            return;
        }
        conn.device_slot_held = true;
    }

    let capabilities = params
        .capabilities
        .unwrap_or_default()
        .apply_to(params.device_type.default_capabilities());
    let is_stationary = params
        .is_stationary
        .unwrap_or(params.device_type == DeviceType::Satellite);

    // Persist the device row and resolve the room (auto-create per policy)
    let room_id = match ctx
        .rooms
        .register_device(
            &params.device_id,
            params.device_type,
            &params.room,
            params.device_name.as_deref(),
            serde_json::to_value(capabilities).unwrap_or(Value::Null),
            is_stationary,
            params.user_agent,
            Some(params.ip),
        )
        .await
    {
        Ok(registration) => Some(registration.room.id),
        Err(e) => {
            warn!(
                device_id = %params.device_id,
                room = %params.room,
                error = %e,
                "Device persistence failed, continuing in-memory"
            );
            None
        }
    };

    ctx.registry
        .register(
            RegisterDevice {
                device_id: params.device_id.clone(),
                device_type: params.device_type,
                room_name: params.room.clone(),
                room_id,
                capabilities,
                device_name: params.device_name.clone(),
                is_stationary,
                language: params.language.clone(),
            },
            tx.clone(),
        )
        .await;

    // Wake-word-capable devices track the config broadcast
    if capabilities.has_wakeword {
        if let Some(previous) = conn.subscriber_key.take() {
            ctx.broadcaster.unsubscribe(previous).await;
        }
        let key = ctx
            .broadcaster
            .subscribe(
                tx.clone(),
                Some(params.device_id.clone()),
                Some(params.device_type.to_string()),
            )
            .await;
        conn.subscriber_key = Some(key);
    }

    conn.device_id = Some(params.device_id.clone());

    let (config, _version) = ctx.broadcaster.get_config().await;
    let _ = tx.try_send(ServerFrame::RegisterAck {
        success: true,
        device_id: params.device_id,
        config: config.to_client_config(),
        room_id,
        capabilities,
        protocol_version: PROTOCOL_VERSION.to_string(),
    });
}

/// Satellites report BLE sightings of known user devices inside heartbeat
/// metrics: `{"ble_observations": [{"user": "...", "rssi": -60}]}`.
async fn record_beacon_observations(ctx: &AppContext, device_id: &str, metrics: &Value) {
    let Some(observations) = metrics.get("ble_observations").and_then(Value::as_array) else {
        return;
    };
    let Some(device) = ctx.registry.get_device(device_id).await else {
        return;
    };
    let Some(room_id) = device.room_id else {
        return;
    };

    for observation in observations {
        let Some(user) = observation.get("user").and_then(Value::as_str) else {
            continue;
        };
        let rssi = observation
            .get("rssi")
            .and_then(Value::as_i64)
            .unwrap_or(-100) as i32;
        ctx.presence
            .register_beacon_observation(user, room_id, &device.room_name, rssi)
            .await;
    }
}
