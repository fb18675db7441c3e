//! Browser chat WebSocket endpoint
//!
//! Text in, streamed assistant replies out. Connections are mapped to a room
//! through the stationary-device IP table when possible, which feeds
//! presence and lets replies play on the room's speaker. A turn's frames
//! stop at the next suspension point once the client disconnects.

use crate::ws::{authenticate, peer_ip, send_error, spawn_writer, AuthOutcome};
use crate::AppContext;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::StreamExt;
use services::protocol::{close_codes, ClientFrame, ErrorCode, ServerFrame};
use services::rooms::RoomContext;
use services::router::SessionMemo;
use services::turn::TextTurnParams;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn chat_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<AppContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth = authenticate(
        &ctx.config.auth,
        &headers,
        params.get("token").map(String::as_str),
    );
    // Lightweight identity for presence and memory binding
    let user_id = params.get("user").cloned();

    ws.on_upgrade(move |socket| async move {
        let ip = peer_ip(&addr);
        if auth == AuthOutcome::Denied {
            let _ = close_socket(socket, close_codes::UNAUTHORIZED, "Authentication required").await;
            return;
        }
        if !ctx.connection_limiter.try_acquire_ip(&ip) {
            let _ = close_socket(
                socket,
                close_codes::CONNECTION_LIMIT,
                "Connection limit exceeded",
            )
            .await;
            return;
        }

        info!(ip = %ip, "Chat WebSocket connected");
        run_chat_connection(socket, ctx.clone(), ip.clone(), user_id).await;
        ctx.connection_limiter.release_ip(&ip);
    })
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn run_chat_connection(
    socket: WebSocket,
    ctx: AppContext,
    ip: String,
    user_id: Option<String>,
) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<ServerFrame>(ctx.config.limits.send_queue_depth);
    let writer = spawn_writer(sink, rx);
    let cancel = CancellationToken::new();

    // Stationary devices pin this address to a room
    let room = match ctx.rooms.room_context_by_ip(&ip).await {
        Ok(Some(room)) => {
            info!(
                ip = %ip,
                room = room.room_name.as_deref().unwrap_or(""),
                "Chat connection mapped to room"
            );
            room
        }
        Ok(None) => RoomContext::default(),
        Err(e) => {
            warn!(ip = %ip, error = %e, "Room context lookup failed");
            RoomContext::default()
        }
    };

    let mut memo = SessionMemo::new();

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Chat receive error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                debug!("Chat closed by client");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                send_error(&tx, ErrorCode::InvalidMessage, "Binary frames are not supported");
                continue;
            }
        };

        if !ctx.rate_limiter.check(&ip) {
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

        match frame {
            ClientFrame::Text {
                session_id,
                content,
                use_rag,
                knowledge_base_id,
                attachment_ids,
            } => {
                let params = TextTurnParams {
                    content,
                    session_id,
                    use_rag: use_rag.unwrap_or(false),
                    knowledge_base_id,
                    attachment_ids: attachment_ids.unwrap_or_default(),
                    room: room.clone(),
                    user_id: user_id.clone(),
                    permissions: None,
                };
                ctx.turns
                    .run_text_turn(params, &mut memo, tx.clone(), &cancel)
                    .await;
            }
            ClientFrame::Heartbeat { .. } => {
                let _ = tx.try_send(ServerFrame::HeartbeatAck {});
            }
            other => {
                debug!(frame = ?other, "Unsupported frame on chat endpoint");
                send_error(
                    &tx,
                    ErrorCode::InvalidMessage,
                    "Only text frames are accepted here",
                );
            }
        }

        // A dead writer means the socket is gone; stop in-flight work
        if tx.is_closed() {
            cancel.cancel();
            break;
        }
    }

    cancel.cancel();
    drop(tx);
    let _ = writer.await;
    info!(ip = %ip, "Chat WebSocket closed");
}
