//! Hybrid retrieval engine
//!
//! Dense (embedding cosine) and lexical (full-text) search over document
//! chunks, fused with Reciprocal Rank Fusion, then expanded with adjacent
//! chunks of the same document so the LLM sees enough surrounding context.
//!
//! Fusion is rank-based, not score-based: each branch contributes
//! `weight / (rrf_k + rank + 1)` per chunk, which is robust to the two
//! branches' incomparable score scales. Ties break toward the better dense
//! rank.

pub mod ports;

use integrations::LlmClient;
use ports::{ChunkHit, ChunkSearchRepository};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Embedding failed: {0}")]
    Embedding(String),
    #[error("Search failed: {0}")]
    Search(String),
}

pub struct RetrievalEngine {
    llm: Arc<dyn LlmClient>,
    chunks: Arc<dyn ChunkSearchRepository>,
    hybrid_enabled: bool,
    top_k: usize,
    min_similarity: f32,
    rrf_k: f32,
    dense_weight: f32,
    lexical_weight: f32,
    context_window: usize,
}

impl RetrievalEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        chunks: Arc<dyn ChunkSearchRepository>,
        config: &config::RetrievalConfig,
    ) -> Self {
        Self {
            llm,
            chunks,
            hybrid_enabled: config.hybrid_enabled,
            top_k: config.top_k,
            min_similarity: config.min_similarity,
            rrf_k: config.rrf_k,
            dense_weight: config.dense_weight,
            lexical_weight: config.lexical_weight,
            context_window: config.context_window.min(config.context_window_max),
        }
    }

    /// Run the full pipeline: embed → search both branches → fuse → expand.
    pub async fn search(
        &self,
        query: &str,
        knowledge_base_id: Option<i32>,
    ) -> Result<Vec<ChunkHit>, RetrievalError> {
        let embedding = self
            .llm
            .embeddings(query)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        let fused = if self.hybrid_enabled {
            // Over-fetch both branches so fusion has material to work with
            let candidate_pool = self.top_k * 3;
            let dense = self
                .chunks
                .dense_search(&embedding, candidate_pool, knowledge_base_id, None)
                .await
                .map_err(|e| RetrievalError::Search(e.to_string()))?;
            let lexical = self
                .chunks
                .lexical_search(query, candidate_pool, knowledge_base_id)
                .await
                .map_err(|e| RetrievalError::Search(e.to_string()))?;
            debug!(
                dense = dense.len(),
                lexical = lexical.len(),
                "Hybrid retrieval branches"
            );
            self.reciprocal_rank_fusion(dense, lexical)
        } else {
            self.chunks
                .dense_search(
                    &embedding,
                    self.top_k,
                    knowledge_base_id,
                    Some(self.min_similarity),
                )
                .await
                .map_err(|e| RetrievalError::Search(e.to_string()))?
        };

        Ok(self.expand_context_window(fused).await)
    }

    /// Context block for explicitly attached documents, bounded per
    /// document so a large upload cannot swallow the prompt.
    pub async fn attachment_context(&self, document_ids: &[i32]) -> Option<String> {
        const MAX_CHARS_PER_DOCUMENT: usize = 8000;
        let mut parts = Vec::new();
        for id in document_ids {
            match self.chunks.document_content(*id).await {
                Ok(Some((filename, mut text))) => {
                    if text.len() > MAX_CHARS_PER_DOCUMENT {
                        text.truncate(MAX_CHARS_PER_DOCUMENT);
                        text.push_str("\n[truncated]");
                    }
                    parts.push(format!("[Attachment: {filename}]\n{text}"));
                }
                Ok(None) => warn!(document_id = id, "Attachment not found"),
                Err(e) => warn!(document_id = id, error = %e, "Attachment load failed"),
            }
        }
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    /// Formatted context block for LLM consumption, or `None` without hits.
    pub async fn get_context(
        &self,
        query: &str,
        knowledge_base_id: Option<i32>,
    ) -> Result<Option<String>, RetrievalError> {
        let hits = self.search(query, knowledge_base_id).await?;
        if hits.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::format_context(&hits)))
    }

    /// Combine both branches: `score(chunk) = Σ weight / (k + rank + 1)`.
    /// Ties break toward the better dense rank.
    fn reciprocal_rank_fusion(&self, dense: Vec<ChunkHit>, lexical: Vec<ChunkHit>) -> Vec<ChunkHit> {
        let mut scores: HashMap<i64, f32> = HashMap::new();
        let mut dense_rank: HashMap<i64, usize> = HashMap::new();
        let mut by_id: HashMap<i64, ChunkHit> = HashMap::new();

        for (rank, hit) in dense.into_iter().enumerate() {
            *scores.entry(hit.chunk_id).or_default() +=
                self.dense_weight / (self.rrf_k + rank as f32 + 1.0);
            dense_rank.insert(hit.chunk_id, rank);
            by_id.entry(hit.chunk_id).or_insert(hit);
        }
        for (rank, hit) in lexical.into_iter().enumerate() {
            *scores.entry(hit.chunk_id).or_default() +=
                self.lexical_weight / (self.rrf_k + rank as f32 + 1.0);
            by_id.entry(hit.chunk_id).or_insert(hit);
        }

        let mut ordered: Vec<i64> = scores.keys().copied().collect();
        ordered.sort_by(|a, b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ra = dense_rank.get(a).copied().unwrap_or(usize::MAX);
                    let rb = dense_rank.get(b).copied().unwrap_or(usize::MAX);
                    ra.cmp(&rb)
                })
        });

        ordered
            .into_iter()
            .take(self.top_k)
            .filter_map(|id| {
                by_id.remove(&id).map(|mut hit| {
                    hit.similarity = scores[&id];
                    hit
                })
            })
            .collect()
    }

    /// Merge each hit with its ±window adjacent chunks; chunks already part
    /// of an earlier hit's window are deduplicated away.
    async fn expand_context_window(&self, hits: Vec<ChunkHit>) -> Vec<ChunkHit> {
        if self.context_window == 0 || hits.is_empty() {
            return hits;
        }

        let mut seen: HashSet<i64> = HashSet::new();
        let mut expanded = Vec::with_capacity(hits.len());

        for mut hit in hits {
            if seen.contains(&hit.chunk_id) {
                continue;
            }

            let min_index = hit.chunk_index - self.context_window as i32;
            let max_index = hit.chunk_index + self.context_window as i32;
            match self
                .chunks
                .adjacent_chunks(hit.document_id, min_index.max(0), max_index)
                .await
            {
                Ok(adjacent) if !adjacent.is_empty() => {
                    let mut parts = Vec::with_capacity(adjacent.len());
                    for chunk in adjacent {
                        if !chunk.content.is_empty() {
                            parts.push(chunk.content);
                        }
                        seen.insert(chunk.chunk_id);
                    }
                    if !parts.is_empty() {
                        hit.content = parts.join("\n\n");
                    }
                }
                Ok(_) => {
                    seen.insert(hit.chunk_id);
                }
                Err(e) => {
                    warn!(error = %e, "Context-window expansion failed, keeping bare chunk");
                    seen.insert(hit.chunk_id);
                }
            }
            expanded.push(hit);
        }
        expanded
    }

    /// Quote each hit with its source annotation.
    pub fn format_context(hits: &[ChunkHit]) -> String {
        let mut block = String::new();
        for hit in hits {
            let mut source = format!("[Source: {}", hit.filename);
            if let Some(page) = hit.page_number {
                source.push_str(&format!(", page {page}"));
            }
            if let Some(section) = &hit.section_title {
                source.push_str(&format!(", section \"{section}\""));
            }
            source.push(']');
            block.push_str(&format!("{}\n\"{}\"\n\n", source, hit.content.trim()));
        }
        block.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use integrations::MockLlm;
    use ports::AdjacentChunk;

    struct ScriptedChunks {
        dense: Vec<ChunkHit>,
        lexical: Vec<ChunkHit>,
        adjacent: HashMap<i32, Vec<AdjacentChunk>>,
    }

    #[async_trait]
    impl ChunkSearchRepository for ScriptedChunks {
        async fn dense_search(
            &self,
            _embedding: &[f32],
            limit: usize,
            _knowledge_base_id: Option<i32>,
            min_similarity: Option<f32>,
        ) -> anyhow::Result<Vec<ChunkHit>> {
            let min = min_similarity.unwrap_or(f32::MIN);
            Ok(self
                .dense
                .iter()
                .filter(|h| h.similarity >= min)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn lexical_search(
            &self,
            _query: &str,
            limit: usize,
            _knowledge_base_id: Option<i32>,
        ) -> anyhow::Result<Vec<ChunkHit>> {
            Ok(self.lexical.iter().take(limit).cloned().collect())
        }

        async fn adjacent_chunks(
            &self,
            document_id: i32,
            min_index: i32,
            max_index: i32,
        ) -> anyhow::Result<Vec<AdjacentChunk>> {
            Ok(self
                .adjacent
                .get(&document_id)
                .map(|chunks| {
                    chunks
                        .iter()
                        .filter(|c| c.chunk_index >= min_index && c.chunk_index <= max_index)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn hit(chunk_id: i64, document_id: i32, chunk_index: i32, similarity: f32) -> ChunkHit {
        ChunkHit {
            chunk_id,
            document_id,
            content: format!("chunk {chunk_id}"),
            chunk_index,
            page_number: None,
            section_title: None,
            filename: "manual.pdf".to_string(),
            similarity,
        }
    }

    fn engine(chunks: ScriptedChunks, window: usize) -> RetrievalEngine {
        RetrievalEngine::new(
            Arc::new(MockLlm::new()),
            Arc::new(chunks),
            &config::RetrievalConfig {
                top_k: 3,
                context_window: window,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_empty_lexical_branch_preserves_dense_order() {
        // With an empty lexical branch the result must equal the dense
        // top-k in dense order, with similarity rewritten as RRF scores
        let dense: Vec<ChunkHit> = (0..15)
            .map(|i| hit(i as i64, 1, i, 1.0 - i as f32 * 0.01))
            .collect();
        let engine = engine(
            ScriptedChunks {
                dense,
                lexical: vec![],
                adjacent: HashMap::new(),
            },
            0,
        );

        let results = engine.search("query", None).await.unwrap();
        assert_eq!(results.len(), 3);
        let ids: Vec<i64> = results.iter().map(|h| h.chunk_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        // RRF scores strictly decrease with dense rank
        assert!(results[0].similarity > results[1].similarity);
        assert!(results[1].similarity > results[2].similarity);
    }

    #[tokio::test]
    async fn test_chunk_in_both_branches_wins() {
        let engine = engine(
            ScriptedChunks {
                dense: vec![hit(1, 1, 0, 0.9), hit(2, 1, 1, 0.8)],
                lexical: vec![hit(3, 1, 2, 0.0), hit(2, 1, 1, 0.0)],
                adjacent: HashMap::new(),
            },
            0,
        );

        let results = engine.search("query", None).await.unwrap();
        // Chunk 2 appears in both branches and accumulates both
        // contributions, overtaking the dense-only leader
        assert_eq!(results[0].chunk_id, 2);
    }

    #[tokio::test]
    async fn test_context_window_merges_adjacent_chunks() {
        let adjacent = HashMap::from([(
            1,
            vec![
                AdjacentChunk {
                    chunk_id: 10,
                    chunk_index: 4,
                    content: "before".to_string(),
                },
                AdjacentChunk {
                    chunk_id: 11,
                    chunk_index: 5,
                    content: "hit".to_string(),
                },
                AdjacentChunk {
                    chunk_id: 12,
                    chunk_index: 6,
                    content: "after".to_string(),
                },
            ],
        )]);
        let engine = engine(
            ScriptedChunks {
                dense: vec![hit(11, 1, 5, 0.9)],
                lexical: vec![],
                adjacent,
            },
            1,
        );

        let results = engine.search("query", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "before\n\nhit\n\nafter");
    }

    #[tokio::test]
    async fn test_expansion_deduplicates_overlapping_hits() {
        // Two hits whose windows overlap: the second hit is swallowed by the
        // first one's expansion
        let adjacent = HashMap::from([(
            1,
            (0..4)
                .map(|i| AdjacentChunk {
                    chunk_id: i as i64,
                    chunk_index: i,
                    content: format!("c{i}"),
                })
                .collect::<Vec<_>>(),
        )]);
        let engine = engine(
            ScriptedChunks {
                dense: vec![hit(1, 1, 1, 0.9), hit(2, 1, 2, 0.8)],
                lexical: vec![],
                adjacent,
            },
            1,
        );

        let results = engine.search("query", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, 1);
    }

    #[tokio::test]
    async fn test_format_context_includes_source_annotations() {
        let mut h = hit(1, 1, 0, 0.9);
        h.page_number = Some(12);
        h.section_title = Some("Setup".to_string());
        let block = RetrievalEngine::format_context(&[h]);
        assert!(block.contains("[Source: manual.pdf, page 12, section \"Setup\"]"));
        assert!(block.contains("\"chunk 1\""));
    }

    #[tokio::test]
    async fn test_get_context_returns_none_without_hits() {
        let engine = engine(
            ScriptedChunks {
                dense: vec![],
                lexical: vec![],
                adjacent: HashMap::new(),
            },
            0,
        );
        assert!(engine.get_context("query", None).await.unwrap().is_none());
    }
}
