//! Conversation store (dialogue persistence)
//!
//! Persists per-turn messages keyed by the session-id string and serves
//! bounded history for prompt assembly. Persistence failures on this path
//! are non-critical: they are logged and swallowed so a dead database never
//! blocks a reply.

pub mod ports;

use integrations::ChatMessage;
use ports::{ConversationRepository, MessageRecord};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub struct ConversationStore {
    repo: Arc<dyn ConversationRepository>,
}

impl ConversationStore {
    pub fn new(repo: Arc<dyn ConversationRepository>) -> Self {
        Self { repo }
    }

    /// Persist one turn; failures are logged, never propagated.
    pub async fn save(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Value>,
    ) {
        if let Err(e) = self
            .repo
            .save_message(session_id, role, content, metadata)
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to persist message");
        }
    }

    /// Load bounded history, oldest first. Failures yield an empty history.
    pub async fn load(&self, session_id: &str, max_messages: i64) -> Vec<MessageRecord> {
        match self.repo.load_messages(session_id, max_messages).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load history");
                Vec::new()
            }
        }
    }

    /// History as chat messages ready for prompt assembly.
    pub async fn load_chat_history(&self, session_id: &str, max_messages: i64) -> Vec<ChatMessage> {
        self.load(session_id, max_messages)
            .await
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryConversations {
        messages: Mutex<Vec<(String, MessageRecord)>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl ConversationRepository for MemoryConversations {
        async fn save_message(
            &self,
            session_id: &str,
            role: &str,
            content: &str,
            metadata: Option<Value>,
        ) -> anyhow::Result<()> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("db down");
            }
            let mut messages = self.messages.lock().unwrap();
            let id = messages.len() as i64 + 1;
            messages.push((
                session_id.to_string(),
                MessageRecord {
                    id,
                    role: role.to_string(),
                    content: content.to_string(),
                    metadata,
                    timestamp: Utc::now(),
                },
            ));
            Ok(())
        }

        async fn load_messages(
            &self,
            session_id: &str,
            max_messages: i64,
        ) -> anyhow::Result<Vec<MessageRecord>> {
            if *self.fail.lock().unwrap() {
                anyhow::bail!("db down");
            }
            let messages = self.messages.lock().unwrap();
            let matching: Vec<MessageRecord> = messages
                .iter()
                .filter(|(sid, _)| sid == session_id)
                .map(|(_, m)| m.clone())
                .collect();
            let skip = matching.len().saturating_sub(max_messages as usize);
            Ok(matching.into_iter().skip(skip).collect())
        }
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let store = ConversationStore::new(Arc::new(MemoryConversations::default()));
        store.save("s1", "user", "hi", None).await;
        store.save("s1", "assistant", "hello", None).await;
        store.save("other", "user", "unrelated", None).await;

        let messages = store.load("s1", 10).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_load_respects_bound_oldest_first() {
        let store = ConversationStore::new(Arc::new(MemoryConversations::default()));
        for i in 0..5 {
            store.save("s1", "user", &format!("m{i}"), None).await;
        }
        let messages = store.load("s1", 2).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "m3");
        assert_eq!(messages[1].content, "m4");
    }

    #[tokio::test]
    async fn test_storage_failure_is_swallowed() {
        let repo = Arc::new(MemoryConversations::default());
        *repo.fail.lock().unwrap() = true;
        let store = ConversationStore::new(repo);
        // Must not panic or propagate
        store.save("s1", "user", "hi", None).await;
        assert!(store.load("s1", 10).await.is_empty());
    }
}
