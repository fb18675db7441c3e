//! Collaborator clients for the renfield server
//!
//! Every external system the orchestrator talks to lives behind a trait in
//! this crate: the LLM backend, speech-to-text, text-to-speech, the
//! home-automation controller and remote tool-providing servers. The server
//! core only ever sees `Arc<dyn Trait>` handles, so tests swap in the mocks
//! from [`mock`] without touching any network.
//!
//! # Streaming-first LLM interface
//!
//! Chat completions are exposed both as a single response and as a stream of
//! text chunks. Streams are plain `futures` streams: dropping the stream (or
//! racing it against a cancellation token with `tokio::select!`) abandons the
//! underlying HTTP response, which is how the session layer enforces
//! cancellation at every suspension point.

pub mod home_assistant;
pub mod llm;
pub mod mock;
pub mod stt;
pub mod tool_server;
pub mod tts;

pub use home_assistant::{EntityState, HaArea, HomeAssistantClient, HomeController, HomeError};
pub use llm::{ChatMessage, ChatOptions, ChatStream, LlmClient, LlmError, OllamaClient};
pub use mock::{MockHomeController, MockLlm, MockStt, MockToolServer, MockTts};
pub use stt::{HttpSttClient, SttClient, SttError, Transcription};
pub use tool_server::{
    HttpToolServer, RemoteToolSpec, ToolCallResult, ToolServerClient, ToolServerError,
};
pub use tts::{HttpTtsClient, TtsClient, TtsError};
