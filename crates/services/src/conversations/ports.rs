//! Conversation persistence ports

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// One persisted dialogue turn.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Persist one message, creating the parent conversation row keyed by
    /// `session_id` on first save.
    async fn save_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Value>,
    ) -> anyhow::Result<()>;

    /// The last `max_messages` messages of a conversation, oldest first.
    async fn load_messages(
        &self,
        session_id: &str,
        max_messages: i64,
    ) -> anyhow::Result<Vec<MessageRecord>>;
}
