//! Mock collaborators for tests
//!
//! Scripted implementations of every collaborator trait. Replies are queued
//! ahead of time; calls are recorded so tests can assert on what the core
//! sent out.

use crate::home_assistant::{EntityState, HaArea, HomeController, HomeError};
use crate::llm::{ChatMessage, ChatOptions, ChatStream, LlmClient, LlmError};
use crate::stt::{SttClient, SttError, Transcription};
use crate::tool_server::{RemoteToolSpec, ToolCallResult, ToolServerClient, ToolServerError};
use crate::tts::{TtsClient, TtsError};
use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted LLM. Replies are popped in FIFO order; when the queue is empty
/// the fallback reply is returned. Every request's messages are recorded.
#[derive(Default)]
pub struct MockLlm {
    replies: Mutex<VecDeque<String>>,
    pub fallback: String,
    fail: Mutex<bool>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            fallback: "ok".to_string(),
            ..Default::default()
        }
    }

    pub fn with_replies(replies: Vec<&str>) -> Self {
        let mock = Self::new();
        {
            let mut queue = mock.replies.lock().unwrap();
            queue.extend(replies.into_iter().map(String::from));
        }
        mock
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(reply.into());
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }

    /// All message lists this mock has been called with.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        if *self.fail.lock().unwrap() {
            return Err(LlmError::RequestFailed("mock failure".to_string()));
        }
        self.requests.lock().unwrap().push(messages.to_vec());
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<String, LlmError> {
        self.next_reply(messages)
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatStream, LlmError> {
        let reply = self.next_reply(messages)?;
        // Split into word-sized chunks to exercise streaming consumers.
        let chunks: Vec<Result<String, LlmError>> = reply
            .split_inclusive(' ')
            .map(|part| Ok(part.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn embeddings(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        if *self.fail.lock().unwrap() {
            return Err(LlmError::RequestFailed("mock failure".to_string()));
        }
        // Deterministic pseudo-embedding so similarity comparisons are stable.
        let seed = text.bytes().fold(0u32, |acc, b| {
            acc.wrapping_mul(31).wrapping_add(b as u32)
        });
        Ok((0..8)
            .map(|i: u32| ((seed.wrapping_add(i.wrapping_mul(2654435761))) % 1000) as f32 / 1000.0)
            .collect())
    }
}

/// Scripted STT engine.
#[derive(Default)]
pub struct MockStt {
    result: Mutex<Option<Transcription>>,
    fail: Mutex<bool>,
    pub calls: Mutex<Vec<usize>>,
}

impl MockStt {
    pub fn returning(text: &str) -> Self {
        let mock = Self::default();
        *mock.result.lock().unwrap() = Some(Transcription {
            text: text.to_string(),
            ..Default::default()
        });
        mock
    }

    pub fn returning_with_speaker(text: &str, name: &str, alias: &str) -> Self {
        let mock = Self::default();
        *mock.result.lock().unwrap() = Some(Transcription {
            text: text.to_string(),
            speaker_name: Some(name.to_string()),
            speaker_alias: Some(alias.to_string()),
            speaker_confidence: 0.9,
            ..Default::default()
        });
        mock
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl SttClient for MockStt {
    async fn transcribe(
        &self,
        wav_bytes: Vec<u8>,
        _language: Option<&str>,
    ) -> Result<Transcription, SttError> {
        if *self.fail.lock().unwrap() {
            return Err(SttError::RequestFailed("mock failure".to_string()));
        }
        self.calls.lock().unwrap().push(wav_bytes.len());
        Ok(self.result.lock().unwrap().clone().unwrap_or_default())
    }
}

/// Scripted TTS engine.
#[derive(Default)]
pub struct MockTts {
    pub audio: Vec<u8>,
    fail: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
}

impl MockTts {
    pub fn returning(audio: Vec<u8>) -> Self {
        Self {
            audio,
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl TtsClient for MockTts {
    async fn synthesize(&self, text: &str, _language: Option<&str>) -> Result<Vec<u8>, TtsError> {
        if *self.fail.lock().unwrap() {
            return Err(TtsError::RequestFailed("mock failure".to_string()));
        }
        self.calls.lock().unwrap().push(text.to_string());
        Ok(self.audio.clone())
    }
}

/// Recorded service call against the mock controller.
#[derive(Debug, Clone)]
pub struct RecordedServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    pub data: Option<Value>,
}

/// Scripted home-automation controller with a mutable entity-state map.
#[derive(Default)]
pub struct MockHomeController {
    states: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<RecordedServiceCall>>,
    areas: Mutex<Vec<HaArea>>,
    fail_services: Mutex<bool>,
    play_transitions: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MockHomeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), state.to_string());
    }

    /// Queue the state an entity moves to when the next `play_media` call
    /// targets it. Queued transitions are consumed in order.
    pub fn queue_state_on_play(&self, entity_id: &str, state: &str) {
        self.play_transitions
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(state.to_string());
    }

    pub fn set_areas(&self, areas: Vec<HaArea>) {
        *self.areas.lock().unwrap() = areas;
    }

    pub fn set_failing_services(&self, failing: bool) {
        *self.fail_services.lock().unwrap() = failing;
    }

    pub fn recorded_calls(&self) -> Vec<RecordedServiceCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HomeController for MockHomeController {
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        entity_id: &str,
        data: Option<Value>,
        _timeout: Option<Duration>,
    ) -> Result<(), HomeError> {
        self.calls.lock().unwrap().push(RecordedServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            entity_id: entity_id.to_string(),
            data,
        });
        if *self.fail_services.lock().unwrap() {
            return Err(HomeError::RequestFailed("mock failure".to_string()));
        }
        if service == "play_media" {
            if let Some(next) = self
                .play_transitions
                .lock()
                .unwrap()
                .get_mut(entity_id)
                .and_then(VecDeque::pop_front)
            {
                self.set_state(entity_id, &next);
            }
        }
        Ok(())
    }

    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HomeError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(entity_id)
            .map(|state| EntityState {
                entity_id: entity_id.to_string(),
                state: state.clone(),
                attributes: Value::Null,
            }))
    }

    async fn list_areas(&self) -> Result<Vec<HaArea>, HomeError> {
        Ok(self.areas.lock().unwrap().clone())
    }

    async fn list_media_players(&self) -> Result<Vec<EntityState>, HomeError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.starts_with("media_player."))
            .map(|(id, state)| EntityState {
                entity_id: id.clone(),
                state: state.clone(),
                attributes: Value::Null,
            })
            .collect())
    }
}

/// Scripted remote tool server.
pub struct MockToolServer {
    name: String,
    tools: Vec<RemoteToolSpec>,
    results: Mutex<HashMap<String, ToolCallResult>>,
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl MockToolServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            results: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(RemoteToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        });
        self
    }

    pub fn set_result(&self, tool: &str, result: ToolCallResult) {
        self.results
            .lock()
            .unwrap()
            .insert(tool.to_string(), result);
    }
}

#[async_trait]
impl ToolServerClient for MockToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolServerError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, tool: &str, args: &Value) -> Result<ToolCallResult, ToolServerError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), args.clone()));
        self.results
            .lock()
            .unwrap()
            .get(tool)
            .cloned()
            .ok_or_else(|| ToolServerError::RequestFailed(format!("no scripted result for {tool}")))
    }
}
