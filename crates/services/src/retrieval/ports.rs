//! Retrieval engine ports

use async_trait::async_trait;

/// A document chunk returned by either search branch.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: i64,
    pub document_id: i32,
    pub content: String,
    pub chunk_index: i32,
    pub page_number: Option<i32>,
    pub section_title: Option<String>,
    pub filename: String,
    /// Branch-specific score: cosine similarity for the dense branch,
    /// cover-density rank for the lexical one. Rewritten to the fused RRF
    /// score after fusion.
    pub similarity: f32,
}

/// Adjacent chunk fetched during context-window expansion.
#[derive(Debug, Clone)]
pub struct AdjacentChunk {
    pub chunk_id: i64,
    pub chunk_index: i32,
    pub content: String,
}

#[async_trait]
pub trait ChunkSearchRepository: Send + Sync {
    /// Nearest chunks by cosine distance, best first.
    async fn dense_search(
        &self,
        embedding: &[f32],
        limit: usize,
        knowledge_base_id: Option<i32>,
        min_similarity: Option<f32>,
    ) -> anyhow::Result<Vec<ChunkHit>>;

    /// Full-text search with cover-density ranking, best first.
    async fn lexical_search(
        &self,
        query: &str,
        limit: usize,
        knowledge_base_id: Option<i32>,
    ) -> anyhow::Result<Vec<ChunkHit>>;

    /// Chunks of a document within an index range, ascending.
    async fn adjacent_chunks(
        &self,
        document_id: i32,
        min_index: i32,
        max_index: i32,
    ) -> anyhow::Result<Vec<AdjacentChunk>>;

    /// Full text of a document (chunks joined in index order), with its
    /// filename. Used for chat attachments.
    async fn document_content(
        &self,
        _document_id: i32,
    ) -> anyhow::Result<Option<(String, String)>> {
        Ok(None)
    }
}
