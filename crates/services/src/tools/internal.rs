//! In-process tools
//!
//! Room resolution, room media playback, media transport control, presence
//! queries and knowledge-base search. Playback carries the full semantics
//! the agent relies on: busy detection with a force-retry hint, a grace
//! period with state polling instead of trusting the controller's return
//! code, a one-shot transcode fallback for stubborn stream formats, and
//! queueing of additional tracks.

use super::executor::{ParamSpec, ParamType, ToolCall, ToolContext, ToolExecutor, ToolSpec};
use crate::output::OutputRouter;
use crate::presence::PresenceService;
use crate::retrieval::RetrievalEngine;
use crate::rooms::RoomService;
use async_trait::async_trait;
use chrono::Utc;
use integrations::{HomeController, ToolCallResult};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Settle time before polling the player state. AirPlay targets need up to
/// ~6 s to set up the stream from a network URL.
const PLAYBACK_GRACE: Duration = Duration::from_secs(6);
/// Longer settle time after the transcode retry.
const TRANSCODE_GRACE: Duration = Duration::from_secs(8);
/// Marker in stream URLs that indicates a direct (possibly incompatible)
/// stream, and its transcoding replacement.
const STATIC_STREAM_MARKER: &str = "static=true";
const TRANSCODE_SUFFIX: &str = "audioCodec=mp3&audioBitRate=320000";

const PLAYING_STATES: [&str; 3] = ["playing", "buffering", "paused"];

pub struct InternalTools {
    rooms: Arc<RoomService>,
    output_router: Arc<OutputRouter>,
    controller: Arc<dyn HomeController>,
    presence: Arc<PresenceService>,
    retrieval: Arc<RetrievalEngine>,
}

impl InternalTools {
    pub fn new(
        rooms: Arc<RoomService>,
        output_router: Arc<OutputRouter>,
        controller: Arc<dyn HomeController>,
        presence: Arc<PresenceService>,
        retrieval: Arc<RetrievalEngine>,
    ) -> Self {
        Self {
            rooms,
            output_router,
            controller,
            presence,
            retrieval,
        }
    }

    /// room_name → (entity_id, room_name, device_name), reporting busy
    /// devices with enough detail for the agent to offer an interruption.
    async fn resolve_room_player(&self, args: &Value) -> ToolCallResult {
        let room_name = str_arg(args, "room_name");
        let Some(room) = self
            .rooms
            .resolve_room(&room_name)
            .await
            .ok()
            .flatten()
        else {
            return ToolCallResult::failure(format!("Room '{room_name}' not found"));
        };

        let decision = self.output_router.route_audio(room.id, None).await;

        match decision.reason {
            "no_output_devices_configured" => ToolCallResult::failure(format!(
                "No audio output device configured for room '{}'",
                room.name
            )),
            "all_devices_unavailable" => {
                // Report the busy device so the agent can ask the user
                // whether to interrupt and retry with force=true.
                let busy = self.output_router.first_configured(room.id).await;
                let device_name = busy
                    .as_ref()
                    .and_then(|d| d.device_name.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                ToolCallResult::failure(format!(
                    "The audio device '{}' in room '{}' is currently busy (playing). \
                     Ask the user if they want to interrupt the current playback.",
                    device_name, room.name
                ))
                .with_data(json!({
                    "entity_id": busy.as_ref().and_then(|d| d.ha_entity_id.clone()),
                    "room_name": room.name,
                    "device_name": device_name,
                    "status": "busy",
                }))
            }
            _ => {
                let Some(output) = decision.output_device else {
                    return ToolCallResult::failure(format!(
                        "No audio output device available for room '{}'",
                        room.name
                    ));
                };
                let Some(entity_id) = output.ha_entity_id else {
                    return ToolCallResult::failure(format!(
                        "Room '{}' has no Home Assistant media player configured",
                        room.name
                    ));
                };
                let device_name = output.device_name.unwrap_or_else(|| entity_id.clone());
                ToolCallResult::success(format!(
                    "Found media player for {}: {entity_id}",
                    room.name
                ))
                .with_data(json!({
                    "entity_id": entity_id,
                    "room_name": room.name,
                    "device_name": device_name,
                }))
            }
        }
    }

    async fn play_in_room(&self, args: &Value) -> ToolCallResult {
        let media_url = str_arg(args, "media_url");
        let room_name = str_arg(args, "room_name");
        let media_type = {
            let t = str_arg(args, "media_type");
            if t.is_empty() {
                "music".to_string()
            } else {
                t
            }
        };
        let force = bool_arg(args, "force");
        let title = opt_str_arg(args, "title");
        let thumb = opt_str_arg(args, "thumb");
        let queue_tracks = parse_queue(args.get("queue"));

        // Step 1: resolve the room's player
        let resolved = self
            .resolve_room_player(&json!({ "room_name": room_name }))
            .await;
        let resolved = if resolved.success {
            resolved
        } else if force
            && resolved
                .data
                .as_ref()
                .and_then(|d| d.get("status"))
                .and_then(Value::as_str)
                == Some("busy")
            && resolved
                .data
                .as_ref()
                .and_then(|d| d.get("entity_id"))
                .and_then(Value::as_str)
                .is_some()
        {
            info!(room = %room_name, "Force-playing on busy device");
            resolved
        } else {
            return resolved;
        };

        let Some(data) = resolved.data.as_ref() else {
            return ToolCallResult::failure("Room resolution returned no player data");
        };
        let Some(entity_id) = data.get("entity_id").and_then(Value::as_str).map(String::from)
        else {
            return ToolCallResult::failure("Room resolution returned no player entity");
        };
        let resolved_room = data
            .get("room_name")
            .and_then(Value::as_str)
            .unwrap_or(&room_name)
            .to_string();
        let device_name = data
            .get("device_name")
            .and_then(Value::as_str)
            .unwrap_or(&entity_id)
            .to_string();

        // Step 2: fire play_media. Some integrations time out or return 500
        // even though the action succeeds, so the call result is ignored and
        // playback is verified by polling the player state.
        let service_data = build_play_data(
            &media_url,
            &media_type,
            title.as_deref(),
            thumb.as_deref(),
            !queue_tracks.is_empty(),
        );
        if let Err(e) = self
            .controller
            .call_service(
                "media_player",
                "play_media",
                &entity_id,
                Some(service_data),
                Some(Duration::from_secs(15)),
            )
            .await
        {
            info!(entity = %entity_id, error = %e, "play_media raised, checking player state anyway");
        }

        tokio::time::sleep(PLAYBACK_GRACE).await;
        let mut player_state = self.player_state(&entity_id).await;

        if PLAYING_STATES.contains(&player_state.as_str()) {
            let queued = self
                .enqueue_tracks(&entity_id, &media_type, &queue_tracks, false)
                .await;
            return playback_success(
                &device_name,
                &resolved_room,
                &entity_id,
                &media_url,
                &media_type,
                queued,
                false,
            );
        }

        // Transcode fallback: a direct stream the player cannot decode stays
        // idle; retry once with server-side transcoding.
        if player_state == "idle" && media_url.contains(STATIC_STREAM_MARKER) {
            let transcode_url = media_url.replace(STATIC_STREAM_MARKER, TRANSCODE_SUFFIX);
            info!(entity = %entity_id, "Playback idle with static URL, retrying with transcode");

            let service_data = build_play_data(
                &transcode_url,
                &media_type,
                title.as_deref(),
                thumb.as_deref(),
                !queue_tracks.is_empty(),
            );
            let _ = self
                .controller
                .call_service(
                    "media_player",
                    "play_media",
                    &entity_id,
                    Some(service_data),
                    Some(Duration::from_secs(15)),
                )
                .await;

            tokio::time::sleep(TRANSCODE_GRACE).await;
            player_state = self.player_state(&entity_id).await;
            if PLAYING_STATES.contains(&player_state.as_str()) {
                let queued = self
                    .enqueue_tracks(&entity_id, &media_type, &queue_tracks, true)
                    .await;
                return playback_success(
                    &device_name,
                    &resolved_room,
                    &entity_id,
                    &transcode_url,
                    &media_type,
                    queued,
                    true,
                );
            }
        }

        ToolCallResult::failure(format!(
            "Playback failed, player state is '{player_state}'"
        ))
    }

    /// Enqueue additional tracks on an already-playing player. Returns the
    /// number of tracks accepted; individual failures are logged and
    /// skipped.
    async fn enqueue_tracks(
        &self,
        entity_id: &str,
        content_type: &str,
        tracks: &[Value],
        transcode: bool,
    ) -> usize {
        let mut enqueued = 0;
        for track in tracks {
            let url = track
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if url.is_empty() {
                continue;
            }
            let url = if transcode && url.contains(STATIC_STREAM_MARKER) {
                url.replace(STATIC_STREAM_MARKER, TRANSCODE_SUFFIX)
            } else {
                url
            };

            let mut extra = json!({ "enqueue": "add" });
            if let Some(title) = track.get("title").and_then(Value::as_str) {
                if !title.trim().is_empty() {
                    extra["title"] = json!(title.trim());
                }
            }
            if let Some(thumb) = track.get("thumb").and_then(Value::as_str) {
                if !thumb.trim().is_empty() {
                    extra["thumb"] = json!(thumb.trim());
                }
            }

            let result = self
                .controller
                .call_service(
                    "media_player",
                    "play_media",
                    entity_id,
                    Some(json!({
                        "media_content_id": url,
                        "media_content_type": content_type,
                        "extra": extra,
                    })),
                    Some(Duration::from_secs(10)),
                )
                .await;
            match result {
                Ok(()) => enqueued += 1,
                Err(e) => warn!(entity = %entity_id, error = %e, "Failed to enqueue track"),
            }
        }
        enqueued
    }

    async fn media_control(&self, args: &Value) -> ToolCallResult {
        let action = str_arg(args, "action");
        let room_name = str_arg(args, "room_name");
        let service = match action.as_str() {
            "stop" => "media_stop",
            "pause" => "media_pause",
            "resume" => "media_play",
            "next" => "media_next_track",
            "previous" => "media_previous_track",
            other => {
                return ToolCallResult::failure(format!("Unknown media action: {other}"));
            }
        };

        let Some(room) = self
            .rooms
            .resolve_room(&room_name)
            .await
            .ok()
            .flatten()
        else {
            return ToolCallResult::failure(format!("Room '{room_name}' not found"));
        };

        // Transport control targets the room's player even when it is
        // busy; stopping a busy player is the point.
        let decision = self.output_router.route_audio(room.id, None).await;
        let output = match decision.output_device {
            Some(output) => Some(output),
            None => self.output_router.first_configured(room.id).await,
        };
        let Some(output) = output else {
            return ToolCallResult::failure(format!(
                "No audio output device configured for room '{}'",
                room.name
            ));
        };
        let Some(entity_id) = output.ha_entity_id else {
            return ToolCallResult::failure(format!(
                "Room '{}' has no Home Assistant media player configured",
                room.name
            ));
        };

        match self
            .controller
            .call_service("media_player", service, &entity_id, None, None)
            .await
        {
            Ok(()) => {
                let device_name = output.device_name.unwrap_or_else(|| entity_id.clone());
                ToolCallResult::success(format!("Media {action} on {device_name} in {}", room.name))
                    .with_data(json!({ "entity_id": entity_id, "action": action }))
            }
            Err(e) => ToolCallResult::failure(format!("Media control failed: {e}")),
        }
    }

    async fn get_user_location(&self, args: &Value) -> ToolCallResult {
        let name = str_arg(args, "name");
        match self.presence.where_is(&name).await {
            Some(record) => {
                let room = record
                    .room_name
                    .clone()
                    .unwrap_or_else(|| "an unknown room".to_string());
                ToolCallResult::success(format!(
                    "{} is in {} ({})",
                    record.user,
                    room,
                    format_last_seen(record.last_seen)
                ))
                .with_data(serde_json::to_value(&record).unwrap_or(Value::Null))
            }
            None => {
                let mut result =
                    ToolCallResult::failure(format!("No recent presence for '{name}'"));
                result.empty_result = true;
                result
            }
        }
    }

    async fn get_all_presence(&self) -> ToolCallResult {
        let everyone = self.presence.everyone().await;
        if everyone.is_empty() {
            let mut result = ToolCallResult::failure("Nobody is currently registered as home");
            result.empty_result = true;
            return result;
        }
        let summary: Vec<String> = everyone
            .iter()
            .map(|r| {
                format!(
                    "{} in {}",
                    r.user,
                    r.room_name.as_deref().unwrap_or("unknown")
                )
            })
            .collect();
        ToolCallResult::success(summary.join("; "))
            .with_data(serde_json::to_value(&everyone).unwrap_or(Value::Null))
    }

    async fn knowledge_search(&self, args: &Value) -> ToolCallResult {
        let query = str_arg(args, "query");
        let knowledge_base_id = args
            .get("knowledge_base_id")
            .and_then(Value::as_i64)
            .map(|v| v as i32);

        match self.retrieval.get_context(&query, knowledge_base_id).await {
            Ok(Some(context)) => {
                ToolCallResult::success("Found relevant passages in the knowledge base")
                    .with_data(json!({ "context": context }))
            }
            Ok(None) => {
                let mut result = ToolCallResult::failure("No matching documents found");
                result.empty_result = true;
                result
            }
            Err(e) => ToolCallResult::failure(format!("Knowledge search failed: {e}")),
        }
    }

    async fn player_state(&self, entity_id: &str) -> String {
        match self.controller.get_state(entity_id).await {
            Ok(Some(state)) => state.state,
            _ => "unknown".to_string(),
        }
    }
}

fn str_arg(args: &Value, name: &str) -> String {
    args.get(name)
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn opt_str_arg(args: &Value, name: &str) -> Option<String> {
    let value = str_arg(args, name);
    (!value.is_empty()).then_some(value)
}

fn bool_arg(args: &Value, name: &str) -> bool {
    match args.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// The `queue` argument arrives either as a JSON array or as a stringified
/// one (LLMs produce both).
fn parse_queue(raw: Option<&Value>) -> Vec<Value> {
    match raw {
        Some(Value::Array(tracks)) => tracks.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(Value::Array(tracks)) => tracks,
            _ => {
                warn!("Invalid queue JSON, ignoring");
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

fn build_play_data(
    media_url: &str,
    media_type: &str,
    title: Option<&str>,
    thumb: Option<&str>,
    has_queue: bool,
) -> Value {
    let mut data = json!({
        "media_content_id": media_url,
        "media_content_type": media_type,
    });
    let mut extra = serde_json::Map::new();
    if let Some(title) = title {
        extra.insert("title".to_string(), json!(title));
    }
    if let Some(thumb) = thumb {
        extra.insert("thumb".to_string(), json!(thumb));
    }
    if has_queue {
        extra.insert("enqueue".to_string(), json!("play"));
    }
    if !extra.is_empty() {
        data["extra"] = Value::Object(extra);
    }
    data
}

#[allow(clippy::too_many_arguments)]
fn playback_success(
    device_name: &str,
    room_name: &str,
    entity_id: &str,
    media_url: &str,
    media_type: &str,
    queued: usize,
    transcoded: bool,
) -> ToolCallResult {
    let suffix = if transcoded { " (transcoded)" } else { "" };
    let message = if queued > 0 {
        format!(
            "Playing {} track(s){suffix} on {device_name} in {room_name}",
            queued + 1
        )
    } else {
        format!("Playing{suffix} on {device_name} in {room_name}")
    };
    ToolCallResult::success(message).with_data(json!({
        "entity_id": entity_id,
        "room_name": room_name,
        "device_name": device_name,
        "media_url": media_url,
        "media_type": media_type,
    }))
}

fn format_last_seen(at: chrono::DateTime<Utc>) -> String {
    let elapsed = Utc::now() - at;
    if elapsed.num_seconds() < 60 {
        "seen just now".to_string()
    } else if elapsed.num_minutes() < 60 {
        format!("seen {} minutes ago", elapsed.num_minutes())
    } else if elapsed.num_hours() < 24 {
        format!("seen {} hours ago", elapsed.num_hours())
    } else {
        format!("last seen {}", at.format("%Y-%m-%d"))
    }
}

#[async_trait]
impl ToolExecutor for InternalTools {
    fn name(&self) -> &str {
        "internal"
    }

    fn can_handle(&self, tool_name: &str) -> bool {
        matches!(
            tool_name,
            "internal.resolve_room_player"
                | "internal.play_in_room"
                | "internal.media_control"
                | "internal.get_user_location"
                | "internal.get_all_presence"
                | "internal.knowledge_search"
        )
    }

    async fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "internal.resolve_room_player".to_string(),
                description: "Find the audio player entity for a room".to_string(),
                params: vec![ParamSpec::required_string("room_name")],
                required_permission: None,
                rate_limit_per_min: None,
            },
            ToolSpec {
                name: "internal.play_in_room".to_string(),
                description: "Play a media URL on the speaker in a room. Set force=true only \
                              after the user confirmed interrupting current playback. Optional \
                              queue: array of {url, title, thumb} to enqueue after the first track"
                    .to_string(),
                params: vec![
                    ParamSpec::required_string("media_url"),
                    ParamSpec::required_string("room_name"),
                    ParamSpec::optional("media_type", ParamType::String),
                    ParamSpec::optional("force", ParamType::Boolean),
                    ParamSpec::optional("title", ParamType::String),
                    ParamSpec::optional("thumb", ParamType::String),
                    ParamSpec::optional("queue", ParamType::Array),
                ],
                required_permission: Some("media.play"),
                rate_limit_per_min: None,
            },
            ToolSpec {
                name: "internal.media_control".to_string(),
                description: "Control playback in a room".to_string(),
                params: vec![
                    ParamSpec {
                        name: "action",
                        param_type: ParamType::String,
                        required: true,
                        allowed_values: Some(vec!["stop", "pause", "resume", "next", "previous"]),
                        pattern: None,
                    },
                    ParamSpec::required_string("room_name"),
                ],
                required_permission: Some("media.control"),
                rate_limit_per_min: None,
            },
            ToolSpec {
                name: "internal.get_user_location".to_string(),
                description: "Look up which room a person is currently in".to_string(),
                params: vec![ParamSpec::required_string("name")],
                required_permission: None,
                rate_limit_per_min: None,
            },
            ToolSpec {
                name: "internal.get_all_presence".to_string(),
                description: "List everyone currently detected at home".to_string(),
                params: vec![],
                required_permission: None,
                rate_limit_per_min: None,
            },
            ToolSpec {
                name: "internal.knowledge_search".to_string(),
                description: "Search the knowledge base for relevant document passages"
                    .to_string(),
                params: vec![
                    ParamSpec::required_string("query"),
                    ParamSpec::optional("knowledge_base_id", ParamType::Number),
                ],
                required_permission: None,
                rate_limit_per_min: None,
            },
        ]
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolCallResult {
        match call.tool.as_str() {
            "internal.resolve_room_player" => self.resolve_room_player(&call.args).await,
            "internal.play_in_room" => self.play_in_room(&call.args).await,
            "internal.media_control" => self.media_control(&call.args).await,
            "internal.get_user_location" => self.get_user_location(&call.args).await,
            "internal.get_all_presence" => self.get_all_presence().await,
            "internal.knowledge_search" => self.knowledge_search(&call.args).await,
            other => ToolCallResult::failure(format!("Unknown internal tool: {other}")),
        }
    }
}
