//! Intent router
//!
//! Resolves one user utterance into a reply and, usually, an action. Stage A
//! classifies the utterance into a role; stage B either streams a plain
//! conversational reply, answers from the knowledge base, or runs the
//! bounded agent loop with the role's tool whitelist. The legacy
//! ranked-intent path replaces stages A/B when the agent is disabled.

pub mod agent;
pub mod intents;
pub mod roles;

use crate::common::CircuitBreaker;
use crate::memory::MemoryService;
use crate::protocol::IntentInfo;
use crate::retrieval::RetrievalEngine;
use crate::rooms::RoomContext;
use crate::tools::{ToolCall, ToolContext, ToolRegistry};
use agent::{AgentRequest, AgentService, AgentStep};
use futures_util::StreamExt;
use integrations::{ChatMessage, ChatOptions, LlmClient};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Canned degradation reply while the LLM breaker is open.
pub const LLM_UNAVAILABLE: &str =
    "The language model is temporarily unavailable. Please try again in a moment.";
/// Canned apology for a failed reply generation.
pub const LLM_APOLOGY: &str = "Sorry, something went wrong while generating a reply.";

/// Marker prefix guarding action summaries stored in conversation history.
const ACTION_RESULT_MARKER: &str = "[action-result";
/// Bound on a stored action summary.
const ACTION_SUMMARY_MAX_CHARS: usize = 2000;

/// Observable router step, forwarded to the device as a frame.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    Stream(String),
    ToolCall {
        tool: String,
        args: Value,
    },
    ToolResult {
        tool: String,
        success: bool,
        message: String,
        data: Option<Value>,
    },
    /// Legacy single-intent path result.
    Action {
        intent: Value,
        success: bool,
    },
}

/// Per-connection state for follow-up detection: the previous utterance and
/// its retrieval context.
#[derive(Debug, Default)]
pub struct SessionMemo {
    last_utterance: Option<String>,
    last_context: Option<String>,
}

impl SessionMemo {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct RouterRequest {
    pub utterance: String,
    pub history: Vec<ChatMessage>,
    pub room: RoomContext,
    pub user_id: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub use_rag: bool,
    pub knowledge_base_id: Option<i32>,
    pub document_context: Option<String>,
}

#[derive(Debug, Default)]
pub struct RouterOutcome {
    /// The reply as shown/spoken to the user.
    pub reply: String,
    /// What goes into conversation history: the reply, prefixed with the
    /// action summary when an action succeeded.
    pub history_entry: String,
    pub intent: Option<IntentInfo>,
    pub agent_steps: u32,
    pub agent_used: bool,
    /// A non-conversation intent was tried and failed or came back empty;
    /// the client may ask the user for correction feedback.
    pub action_failed: bool,
    pub cancelled: bool,
}

enum StreamEnd {
    Complete(String),
    Cancelled(String),
}

pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    classifier_model: String,
    roles: roles::RoleSet,
    agent: AgentService,
    tools: Arc<ToolRegistry>,
    retrieval: Arc<RetrievalEngine>,
    memory: Arc<MemoryService>,
    llm_breaker: Arc<CircuitBreaker>,
    agent_enabled: bool,
    retrieval_enabled: bool,
}

impl IntentRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        retrieval: Arc<RetrievalEngine>,
        memory: Arc<MemoryService>,
        llm_breaker: Arc<CircuitBreaker>,
        llm_config: &config::LlmConfig,
        agent_config: &config::AgentConfig,
        retrieval_config: &config::RetrievalConfig,
    ) -> Self {
        Self {
            llm: llm.clone(),
            classifier_model: llm_config.classifier_model.clone(),
            roles: roles::RoleSet::builtin(),
            agent: AgentService::new(llm, tools.clone(), agent_config),
            tools,
            retrieval,
            memory,
            llm_breaker,
            agent_enabled: agent_config.enabled,
            retrieval_enabled: retrieval_config.enabled,
        }
    }

    /// Resolve one utterance into a reply, emitting intermediate events.
    pub async fn respond(
        &self,
        request: &RouterRequest,
        memo: &mut SessionMemo,
        cancel: &CancellationToken,
        emit: &(dyn Fn(RouterEvent) + Send + Sync),
    ) -> RouterOutcome {
        if !self.llm_breaker.check() {
            emit(RouterEvent::Stream(LLM_UNAVAILABLE.to_string()));
            return RouterOutcome {
                reply: LLM_UNAVAILABLE.to_string(),
                history_entry: LLM_UNAVAILABLE.to_string(),
                ..Default::default()
            };
        }

        let memory_context = {
            let memories = self
                .memory
                .retrieve(&request.utterance, request.user_id.as_deref())
                .await;
            MemoryService::format_context(&memories)
        };

        let mut outcome = if self.agent_enabled {
            self.routed_response(request, memory_context.as_deref(), memo, cancel, emit)
                .await
        } else {
            self.legacy_response(request, memory_context.as_deref(), memo, cancel, emit)
                .await
        };

        memo.last_utterance = Some(request.utterance.clone());
        if outcome.history_entry.is_empty() {
            outcome.history_entry = outcome.reply.clone();
        }
        outcome
    }

    // ==================== Router path ====================

    async fn routed_response(
        &self,
        request: &RouterRequest,
        memory_context: Option<&str>,
        memo: &mut SessionMemo,
        cancel: &CancellationToken,
        emit: &(dyn Fn(RouterEvent) + Send + Sync),
    ) -> RouterOutcome {
        let role = roles::classify(
            self.llm.as_ref(),
            &self.classifier_model,
            &self.roles,
            &request.utterance,
            &request.history,
        )
        .await;
        info!(role = role.name, "Request routed");

        match role.name {
            "conversation" => {
                let rag_context = if request.use_rag && self.retrieval_enabled {
                    self.retrieval_context(request, memo).await
                } else {
                    None
                };
                self.conversation_outcome(request, memory_context, rag_context, cancel, emit)
                    .await
            }
            "knowledge" => {
                let rag_context = if self.retrieval_enabled {
                    self.retrieval_context(request, memo).await
                } else {
                    None
                };
                // No hits: fall back to plain conversation
                let mut outcome = self
                    .conversation_outcome(request, memory_context, rag_context, cancel, emit)
                    .await;
                if outcome.intent.is_none() {
                    outcome.intent = Some(IntentInfo {
                        intent: "knowledge.ask".to_string(),
                        confidence: 1.0,
                    });
                }
                outcome
            }
            _ => {
                self.agent_outcome(role, request, memory_context, cancel, emit)
                    .await
            }
        }
    }

    async fn agent_outcome(
        &self,
        role: &roles::Role,
        request: &RouterRequest,
        memory_context: Option<&str>,
        cancel: &CancellationToken,
        emit: &(dyn Fn(RouterEvent) + Send + Sync),
    ) -> RouterOutcome {
        let tool_ctx = ToolContext {
            room: request.room.clone(),
            user_id: request.user_id.clone(),
            permissions: request.permissions.clone(),
        };
        let agent_request = AgentRequest {
            utterance: &request.utterance,
            role,
            history: &request.history,
            room: &request.room,
            memory_context,
            document_context: request.document_context.as_deref(),
            tool_ctx: &tool_ctx,
        };

        let forward = |step: AgentStep| match step {
            AgentStep::ToolCall { tool, args } => emit(RouterEvent::ToolCall { tool, args }),
            AgentStep::ToolResult {
                tool,
                success,
                message,
                data,
            } => emit(RouterEvent::ToolResult {
                tool,
                success,
                message,
                data,
            }),
            AgentStep::FinalChunk(chunk) => emit(RouterEvent::Stream(chunk)),
        };

        let result = self.agent.run(agent_request, cancel, &forward).await;
        match result {
            Ok(agent_outcome) => {
                self.llm_breaker.record_success();
                let intent = IntentInfo {
                    intent: format!("agent.{}", role.name),
                    confidence: 1.0,
                };
                let history_entry = match build_action_summary(&agent_outcome.tool_results) {
                    Some(summary) if !agent_outcome.final_answer.is_empty() => {
                        format!("{summary}\n\n{}", agent_outcome.final_answer)
                    }
                    _ => agent_outcome.final_answer.clone(),
                };
                info!(
                    role = role.name,
                    steps = agent_outcome.steps,
                    "Agent finished"
                );
                RouterOutcome {
                    reply: agent_outcome.final_answer,
                    history_entry,
                    intent: Some(intent),
                    agent_steps: agent_outcome.steps,
                    agent_used: true,
                    action_failed: false,
                    cancelled: agent_outcome.cancelled,
                }
            }
            Err(e) => {
                warn!(error = %e, "Agent loop failed");
                self.llm_breaker.record_failure();
                emit(RouterEvent::Stream(LLM_APOLOGY.to_string()));
                RouterOutcome {
                    reply: LLM_APOLOGY.to_string(),
                    history_entry: LLM_APOLOGY.to_string(),
                    agent_used: true,
                    ..Default::default()
                }
            }
        }
    }

    // ==================== Legacy ranked-intent path ====================

    async fn legacy_response(
        &self,
        request: &RouterRequest,
        memory_context: Option<&str>,
        _memo: &mut SessionMemo,
        cancel: &CancellationToken,
        emit: &(dyn Fn(RouterEvent) + Send + Sync),
    ) -> RouterOutcome {
        let specs = self
            .tools
            .specs_filtered(&["*".to_string()], &["*".to_string()])
            .await;
        let ranked = intents::extract_ranked_intents(
            self.llm.as_ref(),
            &self.classifier_model,
            &request.utterance,
            &specs,
            &request.history,
        )
        .await;

        let tool_ctx = ToolContext {
            room: request.room.clone(),
            user_id: request.user_id.clone(),
            permissions: request.permissions.clone(),
        };

        let mut chosen: Option<(intents::RankedIntent, integrations::ToolCallResult)> = None;
        let mut tried_action = false;

        for candidate in ranked {
            if cancel.is_cancelled() {
                return RouterOutcome {
                    cancelled: true,
                    ..Default::default()
                };
            }
            if candidate.intent == intents::UNRESOLVED_INTENT {
                continue;
            }
            if candidate.intent == intents::CONVERSATION_INTENT {
                break;
            }

            tried_action = true;
            debug!(
                intent = %candidate.intent,
                confidence = candidate.confidence,
                "Trying ranked intent"
            );
            let call = ToolCall {
                tool: candidate.intent.clone(),
                args: candidate.parameters.clone(),
            };
            let result = self.tools.execute(&call, &tool_ctx).await;

            if result.success && !result.empty_result {
                emit(RouterEvent::Action {
                    intent: json!({
                        "intent": candidate.intent,
                        "parameters": candidate.parameters,
                        "confidence": candidate.confidence,
                    }),
                    success: true,
                });
                chosen = Some((candidate, result));
                break;
            }
            debug!(intent = %candidate.intent, "Intent produced no result, trying next");
        }

        match chosen {
            Some((candidate, result)) => {
                let intent_info = IntentInfo {
                    intent: candidate.intent.clone(),
                    confidence: candidate.confidence,
                };
                // Short LLM confirmation grounded in the sanitized result
                let mut action_report = result.message.clone();
                if let Some(data) = &result.data {
                    action_report.push_str(&format!(
                        "\n\nData:\n{}",
                        crate::common::redact_credentials(&data.to_string())
                    ));
                }
                let prompt = format!(
                    "The user asked: \"{}\"\n\nThe action was executed:\n{}\n\nGive one short, \
                     natural confirmation based on the real data. No JSON.",
                    request.utterance, action_report
                );
                let reply = match self
                    .stream_llm(
                        "You confirm completed actions in one short sentence.",
                        &request.history,
                        &prompt,
                        cancel,
                        emit,
                    )
                    .await
                {
                    StreamEnd::Complete(reply) => reply,
                    StreamEnd::Cancelled(partial) => {
                        return RouterOutcome {
                            reply: partial,
                            cancelled: true,
                            ..Default::default()
                        }
                    }
                };

                let results = vec![(candidate.intent.clone(), result.data.unwrap_or(Value::Null))];
                let history_entry = match build_action_summary(&results) {
                    Some(summary) => format!("{summary}\n\n{reply}"),
                    None => reply.clone(),
                };
                RouterOutcome {
                    reply,
                    history_entry,
                    intent: Some(intent_info),
                    ..Default::default()
                }
            }
            None => {
                let mut outcome = self
                    .conversation_outcome(request, memory_context, None, cancel, emit)
                    .await;
                outcome.action_failed = tried_action;
                if tried_action {
                    outcome.intent = Some(IntentInfo {
                        intent: intents::UNRESOLVED_INTENT.to_string(),
                        confidence: 0.0,
                    });
                }
                outcome
            }
        }
    }

    // ==================== Shared reply plumbing ====================

    async fn conversation_outcome(
        &self,
        request: &RouterRequest,
        memory_context: Option<&str>,
        rag_context: Option<String>,
        cancel: &CancellationToken,
        emit: &(dyn Fn(RouterEvent) + Send + Sync),
    ) -> RouterOutcome {
        let mut system = String::from(
            "You are a friendly, concise voice assistant. Replies are read aloud, so keep \
             them short and natural.",
        );
        if let Some(memory) = memory_context {
            system.push_str(&format!("\n\n{memory}"));
        }
        if let Some(document) = &request.document_context {
            system.push_str(&format!("\n\nAttached document context:\n{document}"));
        }
        let has_rag = rag_context.is_some();
        if let Some(context) = rag_context {
            system.push_str(&format!(
                "\n\nAnswer using this context from the user's documents:\n{context}"
            ));
        }

        match self
            .stream_llm(&system, &request.history, &request.utterance, cancel, emit)
            .await
        {
            StreamEnd::Complete(reply) => RouterOutcome {
                reply: reply.clone(),
                history_entry: reply,
                intent: has_rag.then(|| IntentInfo {
                    intent: "knowledge.ask".to_string(),
                    confidence: 1.0,
                }),
                ..Default::default()
            },
            StreamEnd::Cancelled(partial) => RouterOutcome {
                reply: partial,
                cancelled: true,
                ..Default::default()
            },
        }
    }

    /// Stream a reply, emitting each chunk, honoring cancellation at every
    /// chunk boundary. LLM failures degrade to the canned apology.
    async fn stream_llm(
        &self,
        system: &str,
        history: &[ChatMessage],
        user_message: &str,
        cancel: &CancellationToken,
        emit: &(dyn Fn(RouterEvent) + Send + Sync),
    ) -> StreamEnd {
        let mut messages = vec![ChatMessage::system(system.to_string())];
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(user_message.to_string()));

        let chat_options = ChatOptions::default();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled(String::new()),
            result = self.llm.chat_stream(&messages, &chat_options) => result,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "LLM stream failed to start");
                self.llm_breaker.record_failure();
                emit(RouterEvent::Stream(LLM_APOLOGY.to_string()));
                return StreamEnd::Complete(LLM_APOLOGY.to_string());
            }
        };

        let mut reply = String::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Reply stream cancelled");
                    return StreamEnd::Cancelled(reply);
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(chunk)) => {
                    reply.push_str(&chunk);
                    emit(RouterEvent::Stream(chunk));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "LLM stream broke mid-reply");
                    self.llm_breaker.record_failure();
                    if reply.is_empty() {
                        emit(RouterEvent::Stream(LLM_APOLOGY.to_string()));
                        reply = LLM_APOLOGY.to_string();
                    }
                    return StreamEnd::Complete(reply);
                }
                None => break,
            }
        }
        self.llm_breaker.record_success();
        StreamEnd::Complete(reply)
    }

    async fn retrieval_context(
        &self,
        request: &RouterRequest,
        memo: &mut SessionMemo,
    ) -> Option<String> {
        // Follow-up: reuse the previous turn's context instead of searching
        if let (Some(last), Some(context)) = (&memo.last_utterance, &memo.last_context) {
            if is_follow_up(&request.utterance, last) {
                debug!("Follow-up detected, reusing retrieval context");
                return Some(context.clone());
            }
        }

        match self
            .retrieval
            .get_context(&request.utterance, request.knowledge_base_id)
            .await
        {
            Ok(context) => {
                memo.last_context = context.clone();
                context
            }
            Err(e) => {
                warn!(error = %e, "Retrieval failed");
                None
            }
        }
    }
}

/// Lightweight textual follow-up heuristic: short utterances and utterances
/// opening with an anaphoric marker continue the previous topic.
pub fn is_follow_up(current: &str, _previous: &str) -> bool {
    let lowered = current.trim().to_lowercase();
    const MARKERS: [&str; 12] = [
        "and ", "what about", "how about", "also ", "the last one", "that one", "this one",
        "und ", "was ist mit", "der letzte", "die letzte", "das auch",
    ];
    if MARKERS.iter().any(|m| lowered.starts_with(m)) {
        return true;
    }
    lowered.split_whitespace().count() <= 4
}

/// Compress successful tool results into the marker-guarded summary that is
/// prepended to the stored assistant turn. Keeps the structured fields
/// follow-ups need (ids, titles, names, dates, counts) and drops the rest.
pub fn build_action_summary(results: &[(String, Value)]) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    const KEEP_KEYS: [&str; 16] = [
        "id", "ids", "title", "name", "device_name", "room_name", "entity_id", "url", "media_url",
        "date", "count", "total", "filename", "status", "artist", "album",
    ];

    fn filter(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let kept: serde_json::Map<String, Value> = map
                    .iter()
                    .filter(|(k, v)| {
                        KEEP_KEYS.contains(&k.as_str()) || v.is_object() || v.is_array()
                    })
                    .map(|(k, v)| (k.clone(), filter(v)))
                    .filter(|(_, v)| !matches!(v, Value::Object(m) if m.is_empty()))
                    .collect();
                Value::Object(kept)
            }
            Value::Array(items) => {
                Value::Array(items.iter().take(5).map(filter).collect())
            }
            other => other.clone(),
        }
    }

    let mut parts = Vec::new();
    for (tool, data) in results {
        let filtered = filter(data);
        if matches!(&filtered, Value::Object(m) if m.is_empty()) || filtered.is_null() {
            continue;
        }
        parts.push(format!("{tool}: {filtered}"));
    }
    if parts.is_empty() {
        return None;
    }

    let mut summary = parts.join("\n");
    if summary.len() > ACTION_SUMMARY_MAX_CHARS {
        summary.truncate(ACTION_SUMMARY_MAX_CHARS);
    }
    Some(format!(
        "{ACTION_RESULT_MARKER} - use these values for follow-up requests:\n{summary}]"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::retrieval::ports::{AdjacentChunk, ChunkHit, ChunkSearchRepository};
    use crate::tools::executor::{ToolExecutor, ToolSpec};
    use crate::tools::ParamSpec;
    use async_trait::async_trait;
    use integrations::{MockLlm, ToolCallResult};
    use std::sync::Mutex;

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

    struct OneChunk;

    #[async_trait]
    impl ChunkSearchRepository for OneChunk {
        async fn dense_search(
            &self,
            _embedding: &[f32],
            _limit: usize,
            _knowledge_base_id: Option<i32>,
            _min_similarity: Option<f32>,
        ) -> anyhow::Result<Vec<ChunkHit>> {
            Ok(vec![ChunkHit {
                chunk_id: 1,
                document_id: 1,
                content: "The boiler is serviced every March.".to_string(),
                chunk_index: 0,
                page_number: None,
                section_title: None,
                filename: "house.pdf".to_string(),
                similarity: 0.9,
            }])
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

    struct ScriptedTool {
        result: Mutex<Option<ToolCallResult>>,
    }

    #[async_trait]
    impl ToolExecutor for ScriptedTool {
        fn name(&self) -> &str {
            "internal"
        }

        fn can_handle(&self, tool_name: &str) -> bool {
            tool_name == "internal.play_in_room"
        }

        async fn specs(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "internal.play_in_room".to_string(),
                description: "play".to_string(),
                params: vec![ParamSpec::required_string("room_name")],
                required_permission: None,
                rate_limit_per_min: None,
            }]
        }

        async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> ToolCallResult {
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| ToolCallResult::failure("exhausted"))
        }
    }

    fn router(
        llm: Arc<MockLlm>,
        tool_result: Option<ToolCallResult>,
        agent_enabled: bool,
    ) -> IntentRouter {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool {
            result: Mutex::new(tool_result),
        }));
        let tools = Arc::new(registry);
        let retrieval = Arc::new(RetrievalEngine::new(
            llm.clone(),
            Arc::new(OneChunk),
            &config::RetrievalConfig::default(),
        ));
        let memory = Arc::new(MemoryService::new(
            llm.clone(),
            Arc::new(NoMemories),
            &config::MemoryConfig {
                enabled: false,
                ..Default::default()
            },
            &config::LlmConfig::default(),
        ));
        IntentRouter::new(
            llm,
            tools,
            retrieval,
            memory,
            Arc::new(CircuitBreaker::new(
                "llm",
                &config::CircuitBreakerConfig::default(),
            )),
            &config::LlmConfig::default(),
            &config::AgentConfig {
                enabled: agent_enabled,
                ..Default::default()
            },
            &config::RetrievalConfig::default(),
        )
    }

    fn request(utterance: &str) -> RouterRequest {
        RouterRequest {
            utterance: utterance.to_string(),
            history: vec![],
            room: RoomContext::default(),
            user_id: None,
            permissions: None,
            use_rag: false,
            knowledge_base_id: None,
            document_context: None,
        }
    }

    fn collect() -> (Arc<Mutex<Vec<RouterEvent>>>, impl Fn(RouterEvent) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, move |event| sink.lock().unwrap().push(event))
    }

    #[tokio::test]
    async fn test_conversation_role_streams_directly() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "conversation"}"#,
            "Hello there, how can I help?",
        ]));
        let router = router(llm, None, true);
        let (events, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(&request("hi"), &mut memo, &CancellationToken::new(), &emit)
            .await;
        assert_eq!(outcome.reply, "Hello there, how can I help?");
        assert!(!outcome.agent_used);
        // The reply arrived as multiple stream chunks
        let events = events.lock().unwrap();
        assert!(events.len() >= 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, RouterEvent::Stream(_))));
    }

    #[tokio::test]
    async fn test_agent_role_runs_tools() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "media"}"#,
            r#"{"tool": "internal.play_in_room", "args": {"room_name": "Kitchen", "media_url": "http://x"}}"#,
            "Music is playing.",
        ]));
        let router = router(
            llm,
            Some(ToolCallResult::success("Playing").with_data(json!({"entity_id": "m.x"}))),
            true,
        );
        let (events, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(
                &request("play music in the kitchen"),
                &mut memo,
                &CancellationToken::new(),
                &emit,
            )
            .await;
        assert!(outcome.agent_used);
        assert_eq!(outcome.agent_steps, 2);
        assert_eq!(outcome.intent.unwrap().intent, "agent.media");
        assert!(outcome.history_entry.starts_with(ACTION_RESULT_MARKER));
        assert!(outcome.history_entry.ends_with("Music is playing."));

        let events = events.lock().unwrap();
        assert!(matches!(events[0], RouterEvent::ToolCall { .. }));
        assert!(matches!(events[1], RouterEvent::ToolResult { .. }));
    }

    #[tokio::test]
    async fn test_knowledge_role_injects_context() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "knowledge"}"#,
            "The boiler is serviced every March.",
        ]));
        let router = router(llm.clone(), None, true);
        let (_, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(
                &request("when is the boiler serviced?"),
                &mut memo,
                &CancellationToken::new(),
                &emit,
            )
            .await;
        assert_eq!(outcome.intent.unwrap().intent, "knowledge.ask");
        // The reply request carried the retrieved context in its system turn
        let requests = llm.requests();
        let reply_request = requests.last().unwrap();
        assert!(reply_request[0].content.contains("house.pdf"));
    }

    #[tokio::test]
    async fn test_legacy_path_executes_ranked_intent() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"intents": [{"intent": "internal.play_in_room", "parameters": {"room_name": "Kitchen"}, "confidence": 0.9}]}"#,
            "Done, music is on.",
        ]));
        let router = router(
            llm,
            Some(ToolCallResult::success("Playing").with_data(json!({"room_name": "Kitchen"}))),
            false,
        );
        let (events, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(
                &request("play music in the kitchen"),
                &mut memo,
                &CancellationToken::new(),
                &emit,
            )
            .await;
        assert_eq!(outcome.intent.as_ref().unwrap().intent, "internal.play_in_room");
        assert!(outcome.history_entry.starts_with(ACTION_RESULT_MARKER));

        let events = events.lock().unwrap();
        assert!(matches!(events[0], RouterEvent::Action { success: true, .. }));
    }

    #[tokio::test]
    async fn test_legacy_path_falls_back_to_conversation() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"intents": [{"intent": "internal.play_in_room", "parameters": {"room_name": "Kitchen"}, "confidence": 0.9}]}"#,
            "I could not do that, sorry.",
        ]));
        // The tool fails → fallback to conversation + feedback flag
        let router = router(llm, Some(ToolCallResult::failure("boom")), false);
        let (_, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(
                &request("play music in the kitchen"),
                &mut memo,
                &CancellationToken::new(),
                &emit,
            )
            .await;
        assert!(outcome.action_failed);
        assert_eq!(outcome.reply, "I could not do that, sorry.");
    }

    #[tokio::test]
    async fn test_open_breaker_degrades_to_canned_reply() {
        let llm = Arc::new(MockLlm::new());
        let router = router(llm.clone(), None, true);
        for _ in 0..5 {
            router.llm_breaker.record_failure();
        }
        let (events, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(&request("hi"), &mut memo, &CancellationToken::new(), &emit)
            .await;
        assert_eq!(outcome.reply, LLM_UNAVAILABLE);
        assert!(llm.requests().is_empty());
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_streaming() {
        let llm = Arc::new(MockLlm::with_replies(vec![
            r#"{"role": "conversation"}"#,
            "this reply will be cut off",
        ]));
        let router = router(llm, None, true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_, emit) = collect();
        let mut memo = SessionMemo::new();

        let outcome = router
            .respond(&request("hi"), &mut memo, &cancel, &emit)
            .await;
        assert!(outcome.cancelled);
    }

    #[test]
    fn test_follow_up_heuristic() {
        assert!(is_follow_up("and the second one?", "show my invoices"));
        assert!(is_follow_up("what about March", "show my invoices"));
        assert!(is_follow_up("open it", "show my invoices"));
        assert!(!is_follow_up(
            "what is the weather in Berlin tomorrow morning",
            "show my invoices"
        ));
    }

    #[test]
    fn test_action_summary_keeps_structured_fields() {
        let results = vec![(
            "media.search".to_string(),
            json!({
                "title": "Kind of Blue",
                "id": 42,
                "debug_blob": "x".repeat(50),
                "tracks": [{"title": "So What", "internal": true}],
            }),
        )];
        let summary = build_action_summary(&results).unwrap();
        assert!(summary.starts_with(ACTION_RESULT_MARKER));
        assert!(summary.contains("Kind of Blue"));
        assert!(summary.contains("42"));
        assert!(!summary.contains("debug_blob"));

        assert!(build_action_summary(&[]).is_none());
    }
}
