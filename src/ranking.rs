//! Chunk relevance engine
//!
//! Two interchangeable rankers over the same input shape: a zero-cost
//! token-overlap ranker (no network, deterministic) and a cost-bearing
//! embedding ranker capped at a fixed number of embedding calls per query.

use crate::llm::Embedder;
use crate::models::{Chunk, RankedChunk};
use std::collections::HashSet;
use tracing::debug;

/// Tokens longer than 2 chars, lower-cased.
fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Fast local token-overlap relevance. No API calls.
/// Similarity = |query_tokens ∩ chunk_tokens| / max(1, |query_tokens|).
pub fn rank_by_token_overlap(
    query: &str,
    chunks: &[Chunk],
    top_k: usize,
    threshold: f32,
) -> Vec<RankedChunk> {
    if chunks.is_empty() {
        return Vec::new();
    }
    let q_tokens = tokenize(query);
    if q_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<RankedChunk> = chunks
        .iter()
        .filter_map(|chunk| {
            let c_tokens = tokenize(&chunk.text);
            let overlap = q_tokens.intersection(&c_tokens).count();
            let sim = (overlap as f32 / q_tokens.len().max(1) as f32).clamp(0.0, 1.0);
            (sim >= threshold).then(|| RankedChunk {
                index: chunk.index,
                text: chunk.text.clone(),
                similarity: sim,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(top_k);
    scored
}

/// Semantic relevance via the embedding service. Embeds the query once and at
/// most `max_embed` chunks (cost cap), scores by dot product of normalized
/// vectors, filters below `threshold`, returns the top_k.
///
/// Infrastructure failure on a single chunk is logged and skipped; failure to
/// embed the query yields an empty ranking.
pub async fn rank_by_embedding(
    embedder: &dyn Embedder,
    query: &str,
    chunks: &[Chunk],
    top_k: usize,
    threshold: f32,
    max_embed: usize,
) -> Vec<RankedChunk> {
    if chunks.is_empty() {
        return Vec::new();
    }
    let q_vec = match embedder.embed(query).await {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Query embedding failed");
            return Vec::new();
        }
    };

    let mut scored = Vec::new();
    for chunk in chunks.iter().take(max_embed.min(chunks.len())) {
        let snippet: String = chunk.text.chars().take(2000).collect();
        let c_vec = match embedder.embed(&snippet).await {
            Ok(v) => v,
            Err(e) => {
                debug!(chunk = chunk.index, error = %e, "Chunk embedding failed");
                continue;
            }
        };
        let sim = dot(&q_vec, &c_vec).clamp(0.0, 1.0);
        if sim >= threshold {
            scored.push(RankedChunk {
                index: chunk.index,
                text: chunk.text.clone(),
                similarity: sim,
            });
        }
    }

    scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    scored.truncate(top_k);
    scored
}

/// Dot product over the shared prefix of two vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
