//! Query classifier
//!
//! Cheap gate deciding whether the document alone is likely to answer the
//! query. Uses only the token-overlap ranker so it completes in well under
//! 100ms — calling a network service here violates the design.

use crate::models::{Chunk, Classification};
use crate::ranking::rank_by_token_overlap;

/// Sufficiency classifier over token-overlap similarity.
pub struct Classifier {
    threshold: f32,
}

impl Classifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Classify whether internal evidence should suffice for this query.
    pub fn classify(&self, query: &str, chunks: &[Chunk]) -> Classification {
        if chunks.is_empty() {
            return Classification {
                internal_sufficient: false,
                external_needed: true,
                reason: "no chunks extracted from document".to_string(),
            };
        }

        let top = rank_by_token_overlap(query, chunks, 3, 0.0);
        let max_similarity = top.first().map(|r| r.similarity).unwrap_or(0.0);
        let internal_sufficient = max_similarity >= self.threshold;

        Classification {
            internal_sufficient,
            external_needed: !internal_sufficient,
            reason: format!(
                "max token-overlap similarity {:.2} over top-{} chunks (threshold {:.2})",
                max_similarity,
                top.len(),
                self.threshold
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                index: i,
                text: t.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_internal_sufficient_high_overlap() {
        let cs = chunks(&[
            "The budget allocation for fiscal year 2024 shows increases.",
            "Fiscal year planning involves budget allocation decisions.",
        ]);
        let classifier = Classifier::new(0.72);

        let start = Instant::now();
        let result = classifier.classify("budget allocation fiscal year", &cs);
        let elapsed = start.elapsed();

        assert!(result.internal_sufficient);
        assert!(!result.external_needed);
        assert!(
            elapsed.as_millis() < 100,
            "classifier took {:?}, must stay under 100ms",
            elapsed
        );
    }

    #[test]
    fn test_external_needed_low_overlap() {
        let cs = chunks(&["The budget was approved. Tax rates increased."]);
        let classifier = Classifier::new(0.72);
        let result = classifier.classify("quantum computing algorithms", &cs);
        assert!(!result.internal_sufficient);
        assert!(result.external_needed);
    }

    #[test]
    fn test_no_chunks_always_external() {
        let classifier = Classifier::new(0.72);
        let result = classifier.classify("any query", &[]);
        assert!(!result.internal_sufficient);
        assert!(result.external_needed);
    }

    #[test]
    fn test_idempotent() {
        let cs = chunks(&["budget allocation decisions for the year"]);
        let classifier = Classifier::new(0.72);
        let a = classifier.classify("budget allocation", &cs);
        let b = classifier.classify("budget allocation", &cs);
        assert_eq!(a.internal_sufficient, b.internal_sufficient);
        assert_eq!(a.external_needed, b.external_needed);
    }
}
