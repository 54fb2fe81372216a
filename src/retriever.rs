//! Internal evidence retriever
//!
//! Ranks chunks with the embedding ranker, then issues one extraction call
//! per candidate chunk. Responses matching the relevance-negative sentinel
//! are dropped. One chunk failing never aborts the others.

use crate::llm::{Embedder, LanguageModel};
use crate::models::{DocumentContext, EvidenceItem};
use crate::ranking::rank_by_embedding;
use crate::synthesizer::{build_chunk_prompt, NOT_RELEVANT_SENTINEL};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Retriever {
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    threshold: f32,
    max_embed: usize,
}

impl Retriever {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
        threshold: f32,
        max_embed: usize,
    ) -> Self {
        Self {
            model,
            embedder,
            top_k,
            threshold,
            max_embed,
        }
    }

    /// Extract internal evidence for the query. Infrastructure failures are
    /// logged and skipped; the result is simply whatever survived.
    pub async fn retrieve(&self, query: &str, document: &DocumentContext) -> Vec<EvidenceItem> {
        let ranked = rank_by_embedding(
            self.embedder.as_ref(),
            query,
            &document.chunks,
            self.top_k,
            self.threshold,
            self.max_embed,
        )
        .await;

        if ranked.is_empty() {
            debug!("No chunks passed the embedding threshold");
            return Vec::new();
        }

        let source = document.source_name();
        let total = ranked.len();
        let mut evidence = Vec::new();

        for (i, candidate) in ranked.iter().enumerate() {
            let prompt = build_chunk_prompt(&candidate.text, query, i + 1, total);
            let response = match self.model.generate(&prompt).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(chunk = candidate.index, error = %e, "Chunk extraction failed");
                    continue;
                }
            };
            let response = response.trim();
            if response.is_empty() {
                continue;
            }
            if response
                .to_uppercase()
                .starts_with(NOT_RELEVANT_SENTINEL)
            {
                continue;
            }
            evidence.push(EvidenceItem::internal(
                response.to_string(),
                source.clone(),
                candidate.index + 1,
                Some(candidate.similarity),
            ));
        }

        debug!(count = evidence.len(), "Internal evidence extracted");
        evidence
    }
}
