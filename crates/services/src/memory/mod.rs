//! Long-term memory service
//!
//! After each exchange a background task asks the LLM (JSON mode) to extract
//! durable user facts, which are stored with an embedding and a category.
//! Retrieval embeds the query and returns the nearest memories, which the
//! router injects into system prompts as a bounded section. Extraction is
//! fire-and-forget and must never block the reply path; its task handles are
//! tracked so shutdown can wait for them.

use integrations::{ChatMessage, ChatOptions, LlmClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A stored user fact.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: i64,
    pub user_id: Option<String>,
    pub content: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn insert(
        &self,
        user_id: Option<&str>,
        content: &str,
        category: &str,
        embedding: &[f32],
    ) -> anyhow::Result<()>;

    /// Nearest memories for a user by embedding similarity.
    async fn top_by_embedding(
        &self,
        user_id: Option<&str>,
        embedding: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<MemoryRecord>>;
}

#[derive(Deserialize)]
struct ExtractedMemory {
    content: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    memories: Vec<ExtractedMemory>,
}

const EXTRACTION_PROMPT: &str = "You extract durable personal facts from a conversation \
exchange. Return JSON: {\"memories\": [{\"content\": \"...\", \"category\": \
\"preference|fact|relationship|schedule\"}]}. Only include facts worth remembering weeks \
later (preferences, names, recurring plans). Return {\"memories\": []} when there is \
nothing durable.";

pub struct MemoryService {
    llm: Arc<dyn LlmClient>,
    repo: Arc<dyn MemoryRepository>,
    classifier_model: String,
    max_memories: usize,
    min_exchange_chars: usize,
    extraction_enabled: bool,
    enabled: bool,
    tracker: TaskTracker,
}

impl MemoryService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        repo: Arc<dyn MemoryRepository>,
        memory: &config::MemoryConfig,
        llm_config: &config::LlmConfig,
    ) -> Self {
        Self {
            llm,
            repo,
            classifier_model: llm_config.classifier_model.clone(),
            max_memories: memory.max_memories,
            min_exchange_chars: memory.min_exchange_chars,
            extraction_enabled: memory.extraction_enabled,
            enabled: memory.enabled,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn fact extraction for one exchange in the background.
    pub fn spawn_extraction(
        self: &Arc<Self>,
        user_message: String,
        assistant_response: String,
        user_id: Option<String>,
    ) {
        if !self.enabled || !self.extraction_enabled {
            return;
        }
        if user_message.len() + assistant_response.len() < self.min_exchange_chars {
            return;
        }
        let service = Arc::clone(self);
        self.tracker.spawn(async move {
            if let Err(e) = service
                .extract(&user_message, &assistant_response, user_id.as_deref())
                .await
            {
                warn!(error = %e, "Memory extraction failed");
            }
        });
    }

    /// Wait for in-flight extraction tasks (shutdown).
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn extract(
        &self,
        user_message: &str,
        assistant_response: &str,
        user_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let messages = vec![
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(format!(
                "User: {user_message}\nAssistant: {assistant_response}"
            )),
        ];
        let options = ChatOptions {
            model: Some(self.classifier_model.clone()),
            temperature: Some(0.0),
            json_mode: true,
        };
        let raw = self.llm.chat(&messages, &options).await?;
        let parsed: ExtractionResponse = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Unparseable extraction response, skipping");
                return Ok(());
            }
        };

        for memory in parsed.memories {
            let content = memory.content.trim();
            if content.is_empty() {
                continue;
            }
            let category = memory.category.as_deref().unwrap_or("fact");
            let embedding = self.llm.embeddings(content).await?;
            self.repo
                .insert(user_id, content, category, &embedding)
                .await?;
            debug!(category = %category, "Memory stored");
        }
        Ok(())
    }

    /// Top memories for a query, for system-prompt injection.
    pub async fn retrieve(&self, query: &str, user_id: Option<&str>) -> Vec<MemoryRecord> {
        if !self.enabled {
            return Vec::new();
        }
        let embedding = match self.llm.embeddings(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Memory retrieval embedding failed");
                return Vec::new();
            }
        };
        match self
            .repo
            .top_by_embedding(user_id, &embedding, self.max_memories)
            .await
        {
            Ok(memories) => memories,
            Err(e) => {
                warn!(error = %e, "Memory retrieval failed");
                Vec::new()
            }
        }
    }

    /// Format retrieved memories as a bounded prompt section.
    pub fn format_context(memories: &[MemoryRecord]) -> Option<String> {
        if memories.is_empty() {
            return None;
        }
        let mut block = String::from("Known facts about the user:\n");
        for memory in memories {
            block.push_str(&format!("- [{}] {}\n", memory.category, memory.content));
        }
        Some(block)
    }
}
