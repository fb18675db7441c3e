use crate::pool::DbPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pgvector::Vector;
use services::memory::{MemoryRecord, MemoryRepository};

pub struct PgMemoryRepository {
    pool: DbPool,
}

impl PgMemoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemoryRepository for PgMemoryRepository {
    async fn insert(
        &self,
        user_id: Option<&str>,
        content: &str,
        category: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let vector = Vector::from(embedding.to_vec());
        client
            .execute(
                r#"
                INSERT INTO memories (user_id, content, category, embedding)
                VALUES ($1, $2, $3, $4)
                "#,
                &[&user_id, &content, &category, &vector],
            )
            .await
            .context("Failed to insert memory")?;
        Ok(())
    }

    async fn top_by_embedding(
        &self,
        user_id: Option<&str>,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let vector = Vector::from(embedding.to_vec());
        let limit = limit as i64;
        let rows = client
            .query(
                r#"
                SELECT id, user_id, content, category, created_at
                FROM memories
                WHERE ($1::text IS NULL OR user_id = $1)
                ORDER BY embedding <=> $2
                LIMIT $3
                "#,
                &[&user_id, &vector, &limit],
            )
            .await
            .context("Memory retrieval failed")?;

        rows.into_iter()
            .map(|row| {
                Ok(MemoryRecord {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    content: row.try_get("content")?,
                    category: row.try_get("category")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
