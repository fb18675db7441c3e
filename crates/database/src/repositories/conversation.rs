use crate::pool::DbPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use services::conversations::ports::{ConversationRepository, MessageRecord};
use tracing::debug;

pub struct PgConversationRepository {
    pool: DbPool,
}

impl PgConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn save_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        // Create the parent conversation on first save, refresh updated_at
        // on subsequent ones
        let row = client
            .query_one(
                r#"
                INSERT INTO conversations (session_id)
                VALUES ($1)
                ON CONFLICT (session_id) DO UPDATE SET updated_at = $2
                RETURNING id
                "#,
                &[&session_id, &Utc::now()],
            )
            .await
            .context("Failed to upsert conversation")?;
        let conversation_id: i32 = row.get(0);

        client
            .execute(
                r#"
                INSERT INTO messages (conversation_id, role, content, metadata)
                VALUES ($1, $2, $3, $4)
                "#,
                &[&conversation_id, &role, &content, &metadata],
            )
            .await
            .context("Failed to insert message")?;

        debug!("Saved {} message for session {}", role, session_id);
        Ok(())
    }

    async fn load_messages(&self, session_id: &str, max_messages: i64) -> Result<Vec<MessageRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        // Last N by insertion order, returned oldest first
        let rows = client
            .query(
                r#"
                SELECT * FROM (
                    SELECT m.id, m.role, m.content, m.metadata, m.timestamp
                    FROM messages m
                    JOIN conversations c ON c.id = m.conversation_id
                    WHERE c.session_id = $1
                    ORDER BY m.id DESC
                    LIMIT $2
                ) recent
                ORDER BY id ASC
                "#,
                &[&session_id, &max_messages],
            )
            .await
            .context("Failed to load messages")?;

        rows.into_iter()
            .map(|row| {
                Ok(MessageRecord {
                    id: row.try_get("id")?,
                    role: row.try_get("role")?,
                    content: row.try_get("content")?,
                    metadata: row.try_get("metadata")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }
}
