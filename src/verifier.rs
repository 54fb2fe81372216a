//! Answer verification and confidence scoring
//!
//! Computes a confidence score and integrity flags from provenance structure
//! alone. Deterministic; no model calls.

use crate::models::{EvidenceItem, FlagKind, KnowledgeCategory, SourceKind, VerificationReport};
use chrono::{Datelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Percentage-suffixed numbers, e.g. "12.5%", "1,234%".
    static ref PERCENT_RE: Regex =
        Regex::new(r"\b(\d{1,3}(?:,\d{3})*(?:\.\d+)?)\s*%").unwrap();
    /// Decimal numbers. Plain integers are ignored on purpose so labels like
    /// "CET1" never read as values.
    static ref DECIMAL_RE: Regex =
        Regex::new(r"\b(\d{1,3}(?:,\d{3})*\.\d+)\b").unwrap();
    static ref YEAR_RE: Regex = Regex::new(r"\b(20[0-9]{2})\b").unwrap();
}

/// Source-quality weight per provenance item.
fn source_weight(item: &EvidenceItem) -> f32 {
    match item.source_kind {
        SourceKind::Internal => 1.0,
        SourceKind::External => match item.category.unwrap_or(KnowledgeCategory::Generic) {
            KnowledgeCategory::Regulatory => 0.9,
            KnowledgeCategory::Macro | KnowledgeCategory::Credit => 0.85,
            KnowledgeCategory::Financials | KnowledgeCategory::Market => 0.8,
            KnowledgeCategory::News => 0.7,
            KnowledgeCategory::Generic => 0.5,
        },
    }
}

/// Extract numeric values from text. Percentage-suffixed numbers win; decimal
/// numbers are the fallback.
fn extract_numbers(text: &str) -> Vec<f64> {
    let parse = |re: &Regex| -> Vec<f64> {
        re.captures_iter(text)
            .filter_map(|c| c[1].replace(',', "").parse::<f64>().ok())
            .collect()
    };
    let percents = parse(&PERCENT_RE);
    if !percents.is_empty() {
        return percents;
    }
    parse(&DECIMAL_RE)
}

/// Conflicting numeric values across provenance items. Compares only the
/// first extracted number of each item; later numbers are deliberately left
/// out of the comparison.
fn has_numeric_contradiction(provenance: &[EvidenceItem]) -> bool {
    if provenance.len() < 2 {
        return false;
    }
    let first_values: Vec<f64> = provenance
        .iter()
        .filter_map(|p| extract_numbers(&p.text).first().copied())
        .collect();
    if first_values.len() < 2 {
        return false;
    }
    let max = first_values.iter().cloned().fold(f64::MIN, f64::max);
    let min = first_values.iter().cloned().fold(f64::MAX, f64::min);
    max - min > 0.5
}

/// Future years or stats more than five years old.
fn has_outdated_dates(text: &str) -> bool {
    let current_year = Utc::now().year();
    YEAR_RE
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<i32>().ok())
        .any(|y| y > current_year || y < current_year - 5)
}

/// Fraction of answer sentences whose leading tokens appear somewhere in the
/// concatenated provenance text.
fn coverage_score(answer: &str, provenance: &[EvidenceItem]) -> f32 {
    if answer.is_empty() || provenance.is_empty() {
        return 0.0;
    }
    let sentences: Vec<&str> = answer
        .split(|c| matches!(c, '.' | '!' | '?'))
        .map(str::trim)
        .filter(|s| s.len() > 10)
        .collect();
    if sentences.is_empty() {
        return 1.0;
    }
    let prov_text = provenance
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let covered = sentences
        .iter()
        .filter(|s| {
            s.to_lowercase()
                .split_whitespace()
                .take(3)
                .any(|w| prov_text.contains(w))
        })
        .count();
    covered as f32 / sentences.len() as f32
}

fn states_insufficiency(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    lower.contains("insufficient") || lower.contains("not found")
}

pub struct Verifier;

impl Verifier {
    /// Evaluate answer quality and compute confidence. `seed_flags` carries
    /// flags the orchestrator already raised (e.g. partial completion).
    pub fn verify(
        answer: &str,
        provenance: &[EvidenceItem],
        _partials: &[String],
        _external_snippets: &[String],
        seed_flags: Vec<FlagKind>,
    ) -> VerificationReport {
        let mut flags = seed_flags;
        let mut push_flag = |flags: &mut Vec<FlagKind>, f: FlagKind| {
            if !flags.contains(&f) {
                flags.push(f);
            }
        };

        let mut max_internal_sim: f32 = 0.0;
        let mut internal_count = 0usize;
        let mut external_count = 0usize;
        let mut source_scores: Vec<f32> = Vec::with_capacity(provenance.len());

        for p in provenance {
            match p.source_kind {
                SourceKind::Internal => {
                    internal_count += 1;
                    if let Some(sim) = p.similarity {
                        max_internal_sim = max_internal_sim.max(sim);
                    }
                }
                SourceKind::External => external_count += 1,
            }
            source_scores.push(source_weight(p));
        }

        if external_count > 0
            && source_scores
                .iter()
                .filter(|&&s| s < 1.0)
                .all(|&s| s <= 0.5)
        {
            push_flag(&mut flags, FlagKind::OnlyGenericWeb);
        }

        if has_numeric_contradiction(provenance) {
            push_flag(&mut flags, FlagKind::NumericContradiction);
        }

        if provenance.iter().any(|p| has_outdated_dates(&p.text)) {
            push_flag(&mut flags, FlagKind::OutdatedExternalData);
        }

        let coverage = coverage_score(answer, provenance);
        if coverage < 0.5 && !provenance.is_empty() {
            push_flag(&mut flags, FlagKind::LowEvidenceCoverage);
        }

        if !states_insufficiency(answer) {
            if internal_count == 0 && external_count == 0 {
                push_flag(&mut flags, FlagKind::PotentialHallucination);
            } else if coverage < 0.3 {
                push_flag(&mut flags, FlagKind::PotentialHallucination);
            }
        }

        let source_quality = if source_scores.is_empty() {
            0.0
        } else {
            source_scores.iter().sum::<f32>() / source_scores.len() as f32
        };

        let mut consistency: f32 = 1.0;
        if flags.contains(&FlagKind::NumericContradiction) {
            consistency -= 0.5;
        }
        if flags.contains(&FlagKind::OutdatedExternalData) {
            consistency -= 0.3;
        }
        if flags.contains(&FlagKind::PotentialHallucination) {
            consistency -= 0.4;
        }
        consistency = consistency.max(0.0);

        let mut confidence = 0.4 * max_internal_sim
            + 0.3 * source_quality
            + 0.2 * coverage
            + 0.1 * consistency;
        confidence = confidence.clamp(0.0, 1.0);

        // Corroboration: internal and external agreeing is worth at least 0.6.
        if internal_count > 0 && external_count > 0 {
            confidence = confidence.max(0.6);
        }
        if states_insufficiency(answer) {
            confidence = confidence.min(0.4);
        }

        let mut explanation_parts = Vec::new();
        if internal_count > 0 {
            explanation_parts.push(format!(
                "{} internal source(s), max similarity {:.2}",
                internal_count, max_internal_sim
            ));
        }
        if external_count > 0 {
            explanation_parts.push(format!("{} external corroboration(s)", external_count));
        }
        if flags.contains(&FlagKind::PartialExternalCompletion) {
            explanation_parts.push("Partial external completion used".to_string());
        }
        if !flags.is_empty() {
            explanation_parts.push(format!(
                "Flags: {}",
                flags
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        let explanation = if explanation_parts.is_empty() {
            "No provenance.".to_string()
        } else {
            explanation_parts.join(". ")
        };

        VerificationReport {
            confidence,
            flags,
            explanation,
        }
    }
}
