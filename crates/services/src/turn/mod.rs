//! Turn coordination
//!
//! Drives one complete user turn from trigger to `done`: the voice path
//! (audio_end → STT → router → persistence → TTS → output routing) and the
//! text path (chat or device text frames, which skip the audio pipeline).
//! The session is the error boundary here; every failure becomes a
//! `session_end` reason or a degraded reply, never an escaping error.

use crate::common::CircuitBreaker;
use crate::conversations::ConversationStore;
use crate::memory::MemoryService;
use crate::output::{AudioOutputService, OutputRouter};
use crate::pipeline::{AudioPipeline, PipelineFailure};
use crate::presence::PresenceService;
use crate::protocol::ServerFrame;
use crate::registry::{DeviceRegistry, DeviceSnapshot, SessionSink};
use crate::rooms::RoomContext;
use crate::router::{IntentRouter, RouterEvent, RouterOutcome, RouterRequest, SessionMemo};
use crate::retrieval::RetrievalEngine;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use integrations::TtsClient;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many past messages feed the prompt.
const HISTORY_LIMIT: i64 = 10;

/// Parameters of a text turn (chat endpoint or a device `text` frame).
pub struct TextTurnParams {
    pub content: String,
    pub session_id: Option<String>,
    pub use_rag: bool,
    pub knowledge_base_id: Option<i32>,
    pub attachment_ids: Vec<i32>,
    pub room: RoomContext,
    pub user_id: Option<String>,
    pub permissions: Option<Vec<String>>,
}

pub struct TurnCoordinator {
    registry: Arc<DeviceRegistry>,
    pipeline: Arc<AudioPipeline>,
    router: Arc<IntentRouter>,
    retrieval: Arc<RetrievalEngine>,
    conversations: Arc<ConversationStore>,
    memory: Arc<MemoryService>,
    presence: Arc<PresenceService>,
    tts: Arc<dyn TtsClient>,
    tts_breaker: Arc<CircuitBreaker>,
    output_router: Arc<OutputRouter>,
    audio_output: Arc<AudioOutputService>,
    tts_enabled: bool,
    tts_max_payload_bytes: usize,
    language: String,
}

impl TurnCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        pipeline: Arc<AudioPipeline>,
        router: Arc<IntentRouter>,
        retrieval: Arc<RetrievalEngine>,
        conversations: Arc<ConversationStore>,
        memory: Arc<MemoryService>,
        presence: Arc<PresenceService>,
        tts: Arc<dyn TtsClient>,
        tts_breaker: Arc<CircuitBreaker>,
        output_router: Arc<OutputRouter>,
        audio_output: Arc<AudioOutputService>,
        config: &config::RenfieldConfig,
    ) -> Self {
        Self {
            registry,
            pipeline,
            router,
            retrieval,
            conversations,
            memory,
            presence,
            tts,
            tts_breaker,
            output_router,
            audio_output,
            tts_enabled: config.tts.enabled,
            tts_max_payload_bytes: config.audio.tts_max_payload_bytes,
            language: config.llm.default_language.clone(),
        }
    }

    // ==================== Voice path ====================

    /// Run the full voice turn for a session whose client sent `audio_end`.
    pub async fn run_voice_turn(&self, session_id: &str) {
        if self
            .registry
            .set_session_state(session_id, crate::protocol::SessionState::Processing)
            .await
            .is_err()
        {
            debug!(session_id = %session_id, "Session gone before processing");
            return;
        }
        let Some(sink) = self.registry.session_sink(session_id).await else {
            return;
        };
        let cancel = sink.cancellation_token();

        let transcription = match self
            .pipeline
            .transcribe_session(session_id, &sink, &cancel)
            .await
        {
            Ok(transcription) => transcription,
            Err(PipelineFailure::Cancelled) => return,
            Err(failure) => {
                self.registry.end_session(session_id, failure.reason()).await;
                return;
            }
        };

        if is_stop_utterance(&transcription.text) {
            info!(session_id = %session_id, "Stop word heard, cancelling turn");
            self.registry.end_session(session_id, "cancelled").await;
            return;
        }

        let Some(session) = self.registry.get_session(session_id).await else {
            return;
        };
        let Some(device) = self.registry.get_device(&session.device_id).await else {
            return;
        };

        let room = RoomContext {
            room_id: device.room_id,
            room_name: Some(device.room_name.clone()),
            device_id: Some(device.device_id.clone()),
            device_type: Some(device.device_type.to_string()),
            speaker_name: transcription.speaker_name.clone(),
            speaker_alias: transcription.speaker_alias.clone(),
        };
        let user_id = transcription.speaker_alias.clone();

        if let Some(user) = &user_id {
            self.presence
                .register_voice_presence(user, device.room_id, Some(&device.room_name))
                .await;
        }

        let utterance = transcription.text.clone();
        let history = self
            .conversations
            .load_chat_history(session_id, HISTORY_LIMIT)
            .await;

        let request = RouterRequest {
            utterance: utterance.clone(),
            history,
            room: room.clone(),
            user_id: user_id.clone(),
            permissions: None,
            use_rag: false,
            knowledge_base_id: None,
            document_context: None,
        };

        let emit_sink = sink.clone();
        let emit_session = session_id.to_string();
        let emit = move |event: RouterEvent| {
            emit_sink.send(router_event_frame(event, Some(emit_session.clone())));
        };

        let mut memo = SessionMemo::new();
        let outcome = self.router.respond(&request, &mut memo, &cancel, &emit).await;
        if outcome.cancelled || cancel.is_cancelled() {
            info!(session_id = %session_id, "Voice turn cancelled");
            return;
        }

        self.persist_turn(session_id, &utterance, &outcome, &room, user_id.clone())
            .await;

        // Display devices render the complete reply besides the stream
        if device.capabilities.has_display && !outcome.reply.is_empty() {
            sink.send(ServerFrame::ResponseText {
                session_id: session_id.to_string(),
                text: outcome.reply.clone(),
                is_final: true,
            });
        }

        if outcome.action_failed {
            self.send_feedback_request(&sink, &utterance, &outcome);
        }

        let tts_handled = self
            .speak_voice_reply(session_id, &outcome.reply, &device, &sink, &cancel)
            .await;
        if cancel.is_cancelled() {
            return;
        }

        sink.send(ServerFrame::Done {
            tts_handled,
            agent_steps: outcome.agent_used.then_some(outcome.agent_steps),
            intent: outcome.intent.clone(),
        });
        self.registry.end_session(session_id, "completed").await;
    }

    /// Synthesize the reply and route it: a configured room output first,
    /// the originating device's speaker as fallback. Returns whether the
    /// audio was handled server-side.
    async fn speak_voice_reply(
        &self,
        session_id: &str,
        reply: &str,
        device: &DeviceSnapshot,
        sink: &SessionSink,
        cancel: &CancellationToken,
    ) -> bool {
        if reply.trim().is_empty() || !self.tts_enabled {
            return false;
        }
        let _ = self
            .registry
            .set_session_state(session_id, crate::protocol::SessionState::Speaking)
            .await;

        let Some(audio) = self.synthesize(reply, cancel).await else {
            return false;
        };

        if let Some(room_id) = device.room_id {
            let decision = self
                .output_router
                .route_audio(room_id, Some(&device.device_id))
                .await;
            if let (Some(output), false) = (&decision.output_device, decision.fallback_to_input) {
                // Routing back to the input device goes through the sink so
                // cancellation gating still applies
                let is_input = output.renfield_device_id.as_deref() == Some(&device.device_id);
                if !is_input {
                    if self.audio_output.play(&audio, output, session_id).await {
                        info!(
                            session_id = %session_id,
                            reason = decision.reason,
                            "TTS routed to room output"
                        );
                        return true;
                    }
                    warn!(session_id = %session_id, "Room output failed, falling back to input");
                }
            }
        }

        if device.capabilities.has_speaker {
            self.send_tts_to_sink(&audio, session_id, sink);
        }
        false
    }

    async fn synthesize(&self, reply: &str, cancel: &CancellationToken) -> Option<Vec<u8>> {
        if !self.tts_breaker.check() {
            warn!("TTS circuit breaker open, skipping synthesis");
            return None;
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = self.tts.synthesize(reply, Some(&self.language)) => result,
        };
        match result {
            Ok(audio) => {
                self.tts_breaker.record_success();
                Some(audio)
            }
            Err(e) => {
                warn!(error = %e, "TTS synthesis failed");
                self.tts_breaker.record_failure();
                None
            }
        }
    }

    /// Chunked `tts_audio` frames through the session sink (cancellation
    /// gated), `is_final` on the last chunk.
    fn send_tts_to_sink(&self, audio: &[u8], session_id: &str, sink: &SessionSink) {
        let chunks: Vec<&[u8]> = if audio.is_empty() {
            vec![&[]]
        } else {
            audio.chunks(self.tts_max_payload_bytes).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            sink.send(ServerFrame::TtsAudio {
                session_id: session_id.to_string(),
                audio: BASE64.encode(chunk),
                is_final: i == last,
            });
        }
    }

    // ==================== Text path ====================

    /// Run a chat/text turn. Frames go straight to the connection's send
    /// queue; `cancel` is the connection-lifetime token.
    pub async fn run_text_turn(
        &self,
        params: TextTurnParams,
        memo: &mut SessionMemo,
        sender: mpsc::Sender<ServerFrame>,
        cancel: &CancellationToken,
    ) {
        if let (Some(user), Some(_)) = (&params.user_id, params.room.room_id.as_ref()) {
            self.presence
                .register_voice_presence(user, params.room.room_id, params.room.room_name.as_deref())
                .await;
        }

        let history = match &params.session_id {
            Some(session_id) => {
                self.conversations
                    .load_chat_history(session_id, HISTORY_LIMIT)
                    .await
            }
            None => Vec::new(),
        };

        let document_context = if params.attachment_ids.is_empty() {
            None
        } else {
            self.retrieval.attachment_context(&params.attachment_ids).await
        };

        let request = RouterRequest {
            utterance: params.content.clone(),
            history,
            room: params.room.clone(),
            user_id: params.user_id.clone(),
            permissions: params.permissions.clone(),
            use_rag: params.use_rag,
            knowledge_base_id: params.knowledge_base_id,
            document_context,
        };

        let emit_sender = sender.clone();
        let emit_session = params.session_id.clone();
        let emit_cancel = cancel.clone();
        let emit = move |event: RouterEvent| {
            let frame = router_event_frame(event, emit_session.clone());
            match emit_sender.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The connection's writer is gone; stop the turn at its
                    // next suspension point
                    emit_cancel.cancel();
                }
                Err(_) => debug!("Chat send queue rejected frame"),
            }
        };

        let outcome = self.router.respond(&request, memo, cancel, &emit).await;
        if outcome.cancelled || cancel.is_cancelled() {
            info!("Text turn cancelled");
            return;
        }

        if let Some(session_id) = &params.session_id {
            self.persist_turn(
                session_id,
                &params.content,
                &outcome,
                &params.room,
                params.user_id.clone(),
            )
            .await;
        } else {
            // No session id: still extract memories, just skip persistence
            if !outcome.reply.is_empty() {
                self.memory.spawn_extraction(
                    params.content.clone(),
                    outcome.reply.clone(),
                    params.user_id.clone(),
                );
            }
        }

        if outcome.action_failed {
            let _ = sender.try_send(feedback_frame(&params.content, &outcome));
        }

        // Server-side TTS only when the chat connection maps to a room with
        // a configured output; browsers otherwise speak locally.
        let tts_handled = self.speak_into_room(&outcome.reply, &params.room, cancel).await;

        let _ = sender.try_send(ServerFrame::Done {
            tts_handled,
            agent_steps: outcome.agent_used.then_some(outcome.agent_steps),
            intent: outcome.intent.clone(),
        });
    }

    async fn speak_into_room(
        &self,
        reply: &str,
        room: &RoomContext,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(room_id) = room.room_id else {
            return false;
        };
        if reply.trim().is_empty() || !self.tts_enabled {
            return false;
        }

        let decision = self
            .output_router
            .route_audio(room_id, room.device_id.as_deref())
            .await;
        let (Some(output), false) = (&decision.output_device, decision.fallback_to_input) else {
            return false;
        };

        let Some(audio) = self.synthesize(reply, cancel).await else {
            return false;
        };
        let session_id = room.device_id.as_deref().unwrap_or("chat");
        self.audio_output.play(&audio, output, session_id).await
    }

    // ==================== Shared ====================

    async fn persist_turn(
        &self,
        session_id: &str,
        utterance: &str,
        outcome: &RouterOutcome,
        room: &RoomContext,
        user_id: Option<String>,
    ) {
        if outcome.reply.is_empty() {
            return;
        }

        let mut user_metadata = serde_json::Map::new();
        if let Some(room_id) = room.room_id {
            user_metadata.insert("room_id".to_string(), json!(room_id));
        }
        if let Some(room_name) = &room.room_name {
            user_metadata.insert("room_name".to_string(), json!(room_name));
        }
        self.conversations
            .save(
                session_id,
                "user",
                utterance,
                (!user_metadata.is_empty()).then(|| serde_json::Value::Object(user_metadata)),
            )
            .await;

        let assistant_metadata = outcome.intent.as_ref().map(|intent| {
            json!({
                "intent": intent.intent,
                "confidence": intent.confidence,
            })
        });
        self.conversations
            .save(
                session_id,
                "assistant",
                &outcome.history_entry,
                assistant_metadata,
            )
            .await;

        self.memory
            .spawn_extraction(utterance.to_string(), outcome.reply.clone(), user_id);
    }

    fn send_feedback_request(&self, sink: &SessionSink, utterance: &str, outcome: &RouterOutcome) {
        sink.send(feedback_frame(utterance, outcome));
    }

    /// Wait for background work (memory extraction) on shutdown.
    pub async fn drain_background(&self) {
        self.memory.drain().await;
    }
}

/// Utterances that abort the turn instead of being answered.
const STOP_WORDS: [&str; 6] = [
    "stop",
    "cancel",
    "never mind",
    "nevermind",
    "stopp",
    "abbrechen",
];

fn is_stop_utterance(text: &str) -> bool {
    let trimmed = text
        .trim()
        .trim_end_matches(['.', '!', ','])
        .to_lowercase();
    STOP_WORDS.contains(&trimmed.as_str())
}

fn feedback_frame(utterance: &str, outcome: &RouterOutcome) -> ServerFrame {
    let (intent, confidence) = outcome
        .intent
        .as_ref()
        .map(|i| (i.intent.clone(), i.confidence))
        .unwrap_or_else(|| ("general.unresolved".to_string(), 0.0));
    ServerFrame::IntentFeedbackRequest {
        message_text: utterance.to_string(),
        detected_intent: intent,
        confidence,
        feedback_type: "intent".to_string(),
    }
}

fn router_event_frame(event: RouterEvent, session_id: Option<String>) -> ServerFrame {
    match event {
        RouterEvent::Stream(content) => ServerFrame::Stream {
            session_id,
            content,
        },
        RouterEvent::ToolCall { tool, args } => ServerFrame::ToolCall {
            session_id,
            tool,
            args,
        },
        RouterEvent::ToolResult {
            tool,
            success,
            message,
            data,
        } => ServerFrame::ToolResult {
            session_id,
            tool,
            success,
            message,
            data,
        },
        RouterEvent::Action { intent, success } => ServerFrame::Action {
            session_id,
            intent,
            success,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::protocol::DeviceType;
    use crate::registry::RegisterDevice;
    use crate::retrieval::ports::{AdjacentChunk, ChunkHit, ChunkSearchRepository};
    use crate::test_utils::FixedOutputs;
    use crate::tools::executor::{ToolExecutor, ToolSpec};
    use crate::tools::{ParamSpec, ToolCall, ToolContext, ToolRegistry};
    use async_trait::async_trait;
    use integrations::{
        MockHomeController, MockLlm, MockStt, MockTts, ToolCallResult,
    };
    use std::time::Duration;

    struct NoMemories;

    #[async_trait]
    impl MemoryRepository for NoMemories {
        async fn insert(
            &self,
            _user_id: Option<&str>,
            _content: &str,
            _category: &str,
            _embedding: &[f32],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn top_by_embedding(
            &self,
            _user_id: Option<&str>,
            _embedding: &[f32],
            _limit: usize,
        ) -> anyhow::Result<Vec<crate::memory::MemoryRecord>> {
            Ok(vec![])
        }
    }

    struct NoChunks;

    #[async_trait]
    impl ChunkSearchRepository for NoChunks {
        async fn dense_search(
            &self,
            _embedding: &[f32],
            _limit: usize,
            _knowledge_base_id: Option<i32>,
            _min_similarity: Option<f32>,
        ) -> anyhow::Result<Vec<ChunkHit>> {
            Ok(vec![])
        }

        async fn lexical_search(
            &self,
            _query: &str,
            _limit: usize,
            _knowledge_base_id: Option<i32>,
        ) -> anyhow::Result<Vec<ChunkHit>> {
            Ok(vec![])
        }

        async fn adjacent_chunks(
            &self,
            _document_id: i32,
            _min_index: i32,
            _max_index: i32,
        ) -> anyhow::Result<Vec<AdjacentChunk>> {
            Ok(vec![])
        }
    }

    struct LightTool;

    #[async_trait]
    impl ToolExecutor for LightTool {
        fn name(&self) -> &str {
            "homeassistant"
        }

        fn can_handle(&self, tool_name: &str) -> bool {
            tool_name == "homeassistant.turn_on"
        }

        async fn specs(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "homeassistant.turn_on".to_string(),
                description: "turn an entity on".to_string(),
                params: vec![ParamSpec::required_string("entity_id")],
                required_permission: None,
                rate_limit_per_min: None,
            }]
        }

        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolCallResult {
            ToolCallResult::success(format!(
                "Turned on {}",
                call.args["entity_id"].as_str().unwrap_or("?")
            ))
            .with_data(serde_json::json!({"entity_id": call.args["entity_id"]}))
        }
    }

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        coordinator: TurnCoordinator,
        conversations_repo: Arc<MemoryConversationsRepo>,
    }

    #[derive(Default)]
    struct MemoryConversationsRepo {
        messages: std::sync::Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl crate::conversations::ports::ConversationRepository for MemoryConversationsRepo {
        async fn save_message(
            &self,
            session_id: &str,
            role: &str,
            content: &str,
            _metadata: Option<serde_json::Value>,
        ) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push((
                session_id.to_string(),
                role.to_string(),
                content.to_string(),
            ));
            Ok(())
        }

        async fn load_messages(
            &self,
            session_id: &str,
            max_messages: i64,
        ) -> anyhow::Result<Vec<crate::conversations::ports::MessageRecord>> {
            let messages = self.messages.lock().unwrap();
            let matching: Vec<_> = messages
                .iter()
                .filter(|(sid, _, _)| sid == session_id)
                .enumerate()
                .map(|(i, (_, role, content))| crate::conversations::ports::MessageRecord {
                    id: i as i64,
                    role: role.clone(),
                    content: content.clone(),
                    metadata: None,
                    timestamp: chrono::Utc::now(),
                })
                .collect();
            let skip = matching.len().saturating_sub(max_messages as usize);
            Ok(matching.into_iter().skip(skip).collect())
        }
    }

    fn fixture(llm: Arc<MockLlm>, stt: Arc<MockStt>) -> Fixture {
        let config = config::RenfieldConfig::default();
        let registry = Arc::new(DeviceRegistry::new(&config.audio, &config.session));
        let controller = Arc::new(MockHomeController::new());

        let output_router = Arc::new(OutputRouter::new(
            Arc::new(FixedOutputs(vec![])),
            controller.clone(),
            registry.clone(),
        ));
        let cache = Arc::new(crate::output::TtsAudioCache::new(Duration::from_secs(60)));
        let audio_output = Arc::new(AudioOutputService::new(
            controller.clone(),
            registry.clone(),
            cache,
            &config.server,
            &config.audio,
        ));

        let retrieval = Arc::new(RetrievalEngine::new(
            llm.clone(),
            Arc::new(NoChunks),
            &config.retrieval,
        ));
        let memory = Arc::new(MemoryService::new(
            llm.clone(),
            Arc::new(NoMemories),
            &config::MemoryConfig {
                enabled: false,
                ..Default::default()
            },
            &config.llm,
        ));

        let mut tool_registry = ToolRegistry::new();
        tool_registry.register(Arc::new(LightTool));
        let tools = Arc::new(tool_registry);

        let router = Arc::new(IntentRouter::new(
            llm.clone(),
            tools,
            retrieval.clone(),
            memory.clone(),
            Arc::new(CircuitBreaker::new(
                "llm",
                &config.llm.circuit_breaker,
            )),
            &config.llm,
            &config.agent,
            &config.retrieval,
        ));

        let pipeline = Arc::new(AudioPipeline::new(
            registry.clone(),
            stt,
            Arc::new(CircuitBreaker::new("stt", &config.stt.circuit_breaker)),
            &config.stt,
            &config.audio,
        ));

        let conversations_repo = Arc::new(MemoryConversationsRepo::default());
        let conversations = Arc::new(ConversationStore::new(conversations_repo.clone()));
        let presence = Arc::new(PresenceService::new(&config.presence));

        let coordinator = TurnCoordinator::new(
            registry.clone(),
            pipeline,
            router,
            retrieval,
            conversations,
            memory,
            presence,
            Arc::new(MockTts::returning(vec![7u8; 64])),
            Arc::new(CircuitBreaker::new("tts", &config.tts.circuit_breaker)),
            output_router,
            audio_output,
            &config,
        );

        Fixture {
            registry,
            coordinator,
            conversations_repo,
        }
    }

    async fn registered_session(registry: &Arc<DeviceRegistry>) -> (String, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(128);
        registry
            .register(
                RegisterDevice {
                    device_id: "sat-k1".to_string(),
                    device_type: DeviceType::Satellite,
                    room_name: "Kitchen".to_string(),
                    room_id: Some(1),
                    capabilities: DeviceType::Satellite.default_capabilities(),
                    device_name: None,
                    is_stationary: true,
                    language: None,
                },
                tx,
            )
            .await;
        let sid = registry
            .start_session("sat-k1", Some("alexa".into()), 0.9, Some("sat-k1-1".into()))
            .await
            .unwrap();
        registry.buffer_audio(&sid, vec![0u8; 16000], 1).await.unwrap();
        registry.buffer_audio(&sid, vec![0u8; 16000], 2).await.unwrap();
        registry.buffer_audio(&sid, vec![0u8; 16000], 3).await.unwrap();
        (sid, rx)
    }

    fn frame_types(frames: &[ServerFrame]) -> Vec<&'static str> {
        frames
            .iter()
            .map(|f| match f {
                ServerFrame::State { .. } => "state",
                ServerFrame::SessionStarted { .. } => "session_started",
                ServerFrame::SessionEnd { .. } => "session_end",
                ServerFrame::Transcription { .. } => "transcription",
                ServerFrame::ToolCall { .. } => "tool_call",
                ServerFrame::ToolResult { .. } => "tool_result",
                ServerFrame::Stream { .. } => "stream",
                ServerFrame::TtsAudio { .. } => "tts_audio",
                ServerFrame::Done { .. } => "done",
                _ => "other",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_happy_voice_path_with_agent_action() {
        // The classifier routes to smart_home, the agent turns on the light,
        // then answers; TTS falls back to the satellite's own speaker.
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "smart_home"}"#,
            r#"{"tool": "homeassistant.turn_on", "args": {"entity_id": "light.kitchen"}}"#,
            "The kitchen light is on.",
        ]));
        let stt = Arc::new(MockStt::returning("turn on the kitchen light"));
        let fixture = fixture(llm, stt);
        let (sid, mut rx) = registered_session(&fixture.registry).await;

        fixture.coordinator.run_voice_turn(&sid).await;

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let types = frame_types(&frames);

        // Ordering: transcription before tool activity, tool_call before
        // tool_result, stream before tts_audio, done before session_end
        let pos = |t: &str| types.iter().position(|x| *x == t).unwrap_or(usize::MAX);
        assert!(pos("transcription") < pos("tool_call"), "{types:?}");
        assert!(pos("tool_call") < pos("tool_result"), "{types:?}");
        assert!(pos("tool_result") < pos("stream"), "{types:?}");
        assert!(pos("stream") < pos("tts_audio"), "{types:?}");
        assert!(pos("tts_audio") < pos("done"), "{types:?}");
        assert!(pos("done") < pos("session_end"), "{types:?}");

        // done carries the agent metadata and client-side TTS
        let done = frames
            .iter()
            .find_map(|f| match f {
                ServerFrame::Done {
                    tts_handled,
                    agent_steps,
                    intent,
                } => Some((*tts_handled, *agent_steps, intent.clone())),
                _ => None,
            })
            .unwrap();
        assert!(!done.0);
        assert_eq!(done.1, Some(2));
        assert_eq!(done.2.unwrap().intent, "agent.smart_home");

        // session_end with reason completed
        let end_reason = frames
            .iter()
            .find_map(|f| match f {
                ServerFrame::SessionEnd { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(end_reason, "completed");

        // Both turns were persisted, the assistant one with the action marker
        let messages = fixture.conversations_repo.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].1, "user");
        assert_eq!(messages[0].2, "turn on the kitchen light");
        assert_eq!(messages[1].1, "assistant");
        assert!(messages[1].2.contains("[action-result"));
        assert!(messages[1].2.ends_with("The kitchen light is on."));
    }

    #[tokio::test]
    async fn test_empty_transcription_ends_session() {
        let llm = Arc::new(MockLlm::new());
        let stt = Arc::new(MockStt::returning("  "));
        let fixture = fixture(llm, stt);
        let (sid, mut rx) = registered_session(&fixture.registry).await;

        fixture.coordinator.run_voice_turn(&sid).await;

        let mut end_reason = None;
        let mut saw_done = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                ServerFrame::SessionEnd { reason, .. } => end_reason = Some(reason),
                ServerFrame::Done { .. } => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(end_reason.as_deref(), Some("empty_transcription"));
        assert!(!saw_done);
        assert!(fixture.registry.get_session(&sid).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_word_cancels_turn() {
        let llm = Arc::new(MockLlm::new());
        let stt = Arc::new(MockStt::returning("Stop."));
        let fixture = fixture(llm.clone(), stt);
        let (sid, mut rx) = registered_session(&fixture.registry).await;

        fixture.coordinator.run_voice_turn(&sid).await;

        let mut end_reason = None;
        let mut saw_done = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                ServerFrame::SessionEnd { reason, .. } => end_reason = Some(reason),
                ServerFrame::Done { .. } => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(end_reason.as_deref(), Some("cancelled"));
        assert!(!saw_done);
        // The router was never consulted
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_session_emits_nothing_after_session_end() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "conversation"}"#,
            "a reply nobody will hear",
        ]));
        let stt = Arc::new(MockStt::returning("tell me a story"));
        let fixture = fixture(llm, stt);
        let (sid, mut rx) = registered_session(&fixture.registry).await;

        // Client disconnect mid-turn: end the session before processing
        fixture.registry.end_session(&sid, "disconnected").await;
        fixture.coordinator.run_voice_turn(&sid).await;

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let types = frame_types(&frames);
        let end_pos = types.iter().position(|t| *t == "session_end").unwrap();
        // Only the ended state notification may follow session_end
        assert!(types[end_pos + 1..].iter().all(|t| *t == "state"), "{types:?}");
        assert!(!types.contains(&"done"));
        assert!(!types.contains(&"stream"));
    }

    #[tokio::test]
    async fn test_text_turn_streams_and_persists() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "conversation"}"#,
            "Hello! How can I help?",
        ]));
        let fixture = fixture(llm, Arc::new(MockStt::default()));
        let (tx, mut rx) = mpsc::channel(64);

        let params = TextTurnParams {
            content: "hello".to_string(),
            session_id: Some("chat-1".to_string()),
            use_rag: false,
            knowledge_base_id: None,
            attachment_ids: vec![],
            room: RoomContext::default(),
            user_id: Some("jan".to_string()),
            permissions: None,
        };
        let mut memo = SessionMemo::new();
        fixture
            .coordinator
            .run_text_turn(params, &mut memo, tx, &CancellationToken::new())
            .await;

        let mut streamed = String::new();
        let mut saw_done = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                ServerFrame::Stream { content, .. } => streamed.push_str(&content),
                ServerFrame::Done { tts_handled, .. } => {
                    saw_done = true;
                    assert!(!tts_handled);
                }
                _ => {}
            }
        }
        assert_eq!(streamed, "Hello! How can I help?");
        assert!(saw_done);

        let messages = fixture.conversations_repo.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, "chat-1");
    }
}
