//! Semantic recall over stored memory entries
//!
//! Builds an ephemeral cosine index over entry embeddings per query. Entry
//! counts stay small enough that exact scoring beats maintaining a persistent
//! approximate index. Falls back to keyword matching whenever the query
//! cannot be embedded, never to mask low similarity.

use crate::llm::Embedder;
use crate::models::{MemoryEntry, RecalledMemory};
use crate::ranking::dot;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Recall past interactions relevant to `query`. `document` is the current
/// source document; it only matters for the keyword fallback, where entries
/// from the same document get priority.
pub async fn recall_similar(
    embedder: &dyn Embedder,
    query: &str,
    document: &str,
    entries: &[MemoryEntry],
    top_k: usize,
    threshold: f32,
) -> Vec<RecalledMemory> {
    if entries.is_empty() || top_k == 0 {
        return Vec::new();
    }

    let q_vec = match embedder.embed(query).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Query embedding failed, keyword recall fallback");
            return keyword_fallback(query, document, entries, top_k);
        }
    };

    let mut recalled: Vec<RecalledMemory> = entries
        .iter()
        .filter_map(|entry| {
            let emb = entry.embedding.as_ref()?;
            let sim = dot(&q_vec, emb);
            (sim >= threshold).then(|| RecalledMemory {
                entry: entry.clone(),
                similarity: sim,
            })
        })
        .collect();

    recalled.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    recalled.truncate(top_k);
    debug!(count = recalled.len(), "Memories recalled");
    recalled
}

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Keyword recall for when embeddings are unavailable. Scores by token
/// overlap against the stored question, with a large bonus for entries from
/// the same document so they always outrank cross-document matches.
fn keyword_fallback(
    query: &str,
    document: &str,
    entries: &[MemoryEntry],
    top_k: usize,
) -> Vec<RecalledMemory> {
    let q_tokens = tokens(query);
    if q_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<RecalledMemory> = entries
        .iter()
        .filter_map(|entry| {
            let overlap = q_tokens.intersection(&tokens(&entry.question)).count() as f32;
            let bonus = if entry.document == document { 100.0 } else { 0.0 };
            let score = overlap + bonus;
            (overlap > 0.0).then(|| RecalledMemory {
                entry: entry.clone(),
                similarity: score,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingEmbedder, HashEmbedder};
    use crate::llm::Embedder;
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    /// Embedder behaving like a client with no endpoint configured.
    struct UnconfiguredEmbedder;

    #[async_trait]
    impl Embedder for UnconfiguredEmbedder {
        async fn embed(&self, _text: &str) -> crate::Result<Vec<f32>> {
            Err(crate::error::OrchestrationError::Unconfigured(
                "embedding endpoint not configured".to_string(),
            ))
        }
    }

    async fn entry_with_embedding(document: &str, question: &str) -> MemoryEntry {
        let embedding = HashEmbedder.embed(question).await.ok();
        MemoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            document: document.to_string(),
            question: question.to_string(),
            answer: format!("answer about {}", question),
            partials: vec![],
            evidence: vec![],
            embedding,
            confidence: Some(0.9),
            flags: vec![],
            model_id: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_semantic_recall_ranks_and_filters() {
        let entries = vec![
            entry_with_embedding("/a.pdf", "what was the quarterly revenue growth").await,
            entry_with_embedding("/a.pdf", "completely unrelated weather patterns").await,
        ];
        let recalled = recall_similar(
            &HashEmbedder,
            "what was the quarterly revenue growth",
            "/a.pdf",
            &entries,
            5,
            0.7,
        )
        .await;
        assert_eq!(recalled.len(), 1);
        assert!(recalled[0].entry.question.contains("revenue"));
        assert!(recalled[0].similarity >= 0.7);
    }

    #[tokio::test]
    async fn test_entries_without_embedding_skipped() {
        let mut e = entry_with_embedding("/a.pdf", "quarterly revenue growth").await;
        e.embedding = None;
        let recalled = recall_similar(
            &HashEmbedder,
            "quarterly revenue growth",
            "/a.pdf",
            &[e],
            5,
            0.0,
        )
        .await;
        assert!(recalled.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_fallback_prefers_same_document() {
        let entries = vec![
            entry_with_embedding("/other.pdf", "revenue growth details").await,
            entry_with_embedding("/current.pdf", "revenue growth details").await,
        ];
        let recalled = recall_similar(
            &FailingEmbedder,
            "revenue growth",
            "/current.pdf",
            &entries,
            5,
            0.7,
        )
        .await;
        assert_eq!(recalled.len(), 2);
        assert_eq!(recalled[0].entry.document, "/current.pdf");
        assert!(recalled[0].similarity > recalled[1].similarity);
    }

    #[tokio::test]
    async fn test_unconfigured_embedder_still_gets_keyword_recall() {
        let entries = vec![entry_with_embedding("/a.pdf", "revenue growth details").await];
        let recalled = recall_similar(
            &UnconfiguredEmbedder,
            "revenue growth",
            "/a.pdf",
            &entries,
            5,
            0.7,
        )
        .await;
        assert_eq!(recalled.len(), 1);
        assert!(recalled[0].entry.question.contains("revenue"));
    }

    #[tokio::test]
    async fn test_keyword_fallback_requires_overlap() {
        let entries = vec![entry_with_embedding("/a.pdf", "weather report sunny").await];
        let recalled =
            recall_similar(&FailingEmbedder, "revenue growth", "/a.pdf", &entries, 5, 0.7).await;
        assert!(recalled.is_empty());
    }

    #[tokio::test]
    async fn test_empty_entries() {
        let recalled = recall_similar(&HashEmbedder, "anything", "/a.pdf", &[], 5, 0.7).await;
        assert!(recalled.is_empty());
    }
}
