use crate::pool::DbPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pgvector::Vector;
use services::retrieval::ports::{AdjacentChunk, ChunkHit, ChunkSearchRepository};

pub struct PgChunkSearchRepository {
    pool: DbPool,
    /// Postgres text-search configuration used for the lexical branch.
    fts_language: String,
}

impl PgChunkSearchRepository {
    pub fn new(pool: DbPool, retrieval: &config::RetrievalConfig) -> Self {
        Self {
            pool,
            fts_language: retrieval.fts_language.clone(),
        }
    }

    fn row_to_hit(row: tokio_postgres::Row) -> Result<ChunkHit> {
        let similarity: f64 = row.try_get("similarity")?;
        Ok(ChunkHit {
            chunk_id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            content: row.try_get("content")?,
            chunk_index: row.try_get("chunk_index")?,
            page_number: row.try_get("page_number")?,
            section_title: row.try_get("section_title")?,
            filename: row.try_get("filename")?,
            similarity: similarity as f32,
        })
    }
}

#[async_trait]
impl ChunkSearchRepository for PgChunkSearchRepository {
    async fn dense_search(
        &self,
        embedding: &[f32],
        limit: usize,
        knowledge_base_id: Option<i32>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<ChunkHit>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let vector = Vector::from(embedding.to_vec());
        let min_similarity = min_similarity.map(f64::from);
        let limit = limit as i64;

        let rows = client
            .query(
                r#"
                SELECT c.id, c.document_id, c.content, c.chunk_index, c.page_number,
                       c.section_title, d.filename,
                       1 - (c.embedding <=> $1) AS similarity
                FROM document_chunks c
                JOIN documents d ON d.id = c.document_id
                WHERE d.status = 'completed'
                  AND c.embedding IS NOT NULL
                  AND ($2::int IS NULL OR d.knowledge_base_id = $2)
                  AND ($3::float8 IS NULL OR 1 - (c.embedding <=> $1) >= $3)
                ORDER BY c.embedding <=> $1
                LIMIT $4
                "#,
                &[&vector, &knowledge_base_id, &min_similarity, &limit],
            )
            .await
            .context("Dense search failed")?;

        rows.into_iter().map(Self::row_to_hit).collect()
    }

    async fn lexical_search(
        &self,
        query: &str,
        limit: usize,
        knowledge_base_id: Option<i32>,
    ) -> Result<Vec<ChunkHit>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let limit = limit as i64;
        // Cover-density ranking over the generated tsvector column
        let rows = client
            .query(
                r#"
                SELECT c.id, c.document_id, c.content, c.chunk_index, c.page_number,
                       c.section_title, d.filename,
                       ts_rank_cd(c.search_vector, websearch_to_tsquery($4::regconfig, $1))::float8
                           AS similarity
                FROM document_chunks c
                JOIN documents d ON d.id = c.document_id
                WHERE d.status = 'completed'
                  AND c.search_vector @@ websearch_to_tsquery($4::regconfig, $1)
                  AND ($2::int IS NULL OR d.knowledge_base_id = $2)
                ORDER BY similarity DESC
                LIMIT $3
                "#,
                &[&query, &knowledge_base_id, &limit, &self.fts_language],
            )
            .await
            .context("Lexical search failed")?;

        rows.into_iter().map(Self::row_to_hit).collect()
    }

    async fn adjacent_chunks(
        &self,
        document_id: i32,
        min_index: i32,
        max_index: i32,
    ) -> Result<Vec<AdjacentChunk>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let rows = client
            .query(
                r#"
                SELECT id, chunk_index, content
                FROM document_chunks
                WHERE document_id = $1 AND chunk_index >= $2 AND chunk_index <= $3
                ORDER BY chunk_index ASC
                "#,
                &[&document_id, &min_index, &max_index],
            )
            .await
            .context("Adjacent chunk fetch failed")?;

        rows.into_iter()
            .map(|row| {
                Ok(AdjacentChunk {
                    chunk_id: row.try_get("id")?,
                    chunk_index: row.try_get("chunk_index")?,
                    content: row.try_get("content")?,
                })
            })
            .collect()
    }

    async fn document_content(&self, document_id: i32) -> Result<Option<(String, String)>> {
        let client = self
            .pool
            .get()
            .await
            .context("Failed to get database connection")?;

        let Some(doc_row) = client
            .query_opt(
                "SELECT filename FROM documents WHERE id = $1",
                &[&document_id],
            )
            .await
            .context("Document lookup failed")?
        else {
            return Ok(None);
        };
        let filename: String = doc_row.try_get("filename")?;

        let rows = client
            .query(
                r#"
                SELECT content FROM document_chunks
                WHERE document_id = $1
                ORDER BY chunk_index ASC
                "#,
                &[&document_id],
            )
            .await
            .context("Document content fetch failed")?;

        let parts: Vec<String> = rows
            .into_iter()
            .map(|row| row.try_get::<_, String>("content"))
            .collect::<std::result::Result<_, _>>()?;
        Ok(Some((filename, parts.join("\n\n"))))
    }
}
