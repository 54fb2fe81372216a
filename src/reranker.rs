//! Preference-based answer reranking
//!
//! Optional last stage: synthesize several candidate answers under different
//! style preferences, then keep the one scoring best on verifier confidence,
//! query similarity and relative length. A single candidate is returned as-is
//! without spending any scoring calls.

use crate::llm::Embedder;
use crate::models::EvidenceItem;
use crate::ranking::dot;
use crate::synthesizer::Synthesizer;
use crate::verifier::Verifier;
use tracing::{debug, warn};

/// Style preferences cycled across candidate generations.
pub const STYLE_VARIATIONS: [&str; 3] = [
    "Prefer concise, bullet-point style.",
    "Prefer detailed narrative with full sentences.",
    "Focus on key metrics and numbers.",
];

/// Synthesize up to `n` candidates, one per style variation. Failed or empty
/// generations are skipped; if fewer than `n` distinct answers come back, the
/// first is repeated so downstream indexing stays simple.
pub async fn generate_candidates(
    synthesizer: &Synthesizer,
    internal_facts: &[String],
    external_facts: &[String],
    memory_facts: &[String],
    question: &str,
    n: usize,
) -> Vec<String> {
    let mut candidates = Vec::new();
    for i in 0..n {
        let style = STYLE_VARIATIONS.get(i).copied();
        match synthesizer
            .synthesize(internal_facts, external_facts, memory_facts, question, style)
            .await
        {
            Ok(answer) if !answer.is_empty() => candidates.push(answer),
            Ok(_) => {}
            Err(e) => warn!(candidate = i, error = %e, "Candidate generation failed"),
        }
        if candidates.len() >= n {
            break;
        }
    }
    if let Some(first) = candidates.first().cloned() {
        while candidates.len() < n {
            candidates.push(first.clone());
        }
    }
    candidates.truncate(n);
    candidates
}

/// Pick the best candidate: 0.5 × verifier confidence + 0.3 × embedding
/// similarity to the query + 0.2 × relative length. Embedding failures fall
/// back to a neutral 0.5 similarity so scoring stays comparable.
pub async fn select_best(
    embedder: &dyn Embedder,
    query: &str,
    candidates: &[String],
    provenance: &[EvidenceItem],
    partials: &[String],
    external_texts: &[String],
) -> String {
    match candidates {
        [] => return String::new(),
        [only] => return only.clone(),
        _ => {}
    }

    let q_vec = embedder.embed(query).await.ok();
    let max_len = candidates
        .iter()
        .map(|c| c.chars().count())
        .max()
        .unwrap_or(1)
        .max(1);

    let mut best: Option<(f32, &String)> = None;
    for candidate in candidates {
        let report = Verifier::verify(candidate, provenance, partials, external_texts, vec![]);

        let emb_sim = match &q_vec {
            Some(qv) => match embedder.embed(candidate).await {
                Ok(cv) => dot(qv, &cv).clamp(0.0, 1.0),
                Err(_) => 0.5,
            },
            None => 0.5,
        };
        let length = (candidate.chars().count() as f32 / max_len as f32).min(1.0);
        let score = 0.5 * report.confidence + 0.3 * emb_sim + 0.2 * length;
        debug!(score, confidence = report.confidence, "Candidate scored");

        if best.map(|(s, _)| score > s).unwrap_or(true) {
            best = Some((score, candidate));
        }
    }
    best.map(|(_, c)| c.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingEmbedder, HashEmbedder, ScriptedModel};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_candidates_get_distinct_styles() {
        let model = Arc::new(ScriptedModel::new(vec![
            "- bullet answer",
            "A detailed narrative answer.",
            "Metrics: 12.5%",
        ]));
        let synth = Synthesizer::new(model.clone());
        let facts = vec!["revenue grew 12.5%".to_string()];
        let candidates = generate_candidates(&synth, &facts, &[], &[], "q?", 3).await;
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0], "- bullet answer");

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains(STYLE_VARIATIONS[0]));
        assert!(prompts[1].contains(STYLE_VARIATIONS[1]));
        assert!(prompts[2].contains(STYLE_VARIATIONS[2]));
    }

    #[tokio::test]
    async fn test_candidates_padded_when_generation_repeats() {
        let model = Arc::new(ScriptedModel::new(vec!["same answer"]));
        let synth = Synthesizer::new(model);
        let facts = vec!["a fact".to_string()];
        let candidates = generate_candidates(&synth, &facts, &[], &[], "q?", 3).await;
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c == "same answer"));
    }

    #[tokio::test]
    async fn test_single_candidate_returned_unscored() {
        // A failing embedder proves no scoring happens for one candidate.
        let only = vec!["the only answer".to_string()];
        let best = select_best(&FailingEmbedder, "q", &only, &[], &[], &[]).await;
        assert_eq!(best, "the only answer");
    }

    #[tokio::test]
    async fn test_selection_prefers_grounded_candidate() {
        let provenance = vec![EvidenceItem::internal(
            "Revenue grew 12.5% in the quarter".to_string(),
            "report.pdf".to_string(),
            1,
            Some(0.9),
        )];
        let candidates = vec![
            "Revenue grew 12.5% in the quarter.".to_string(),
            "Insufficient information available.".to_string(),
        ];
        let best = select_best(
            &HashEmbedder,
            "How much did revenue grow in the quarter?",
            &candidates,
            &provenance,
            &[],
            &[],
        )
        .await;
        assert_eq!(best, candidates[0]);
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let best = select_best(&HashEmbedder, "q", &[], &[], &[], &[]).await;
        assert!(best.is_empty());
    }
}
