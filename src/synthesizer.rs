//! Answer synthesis
//!
//! Builds one prompt from three delimited fact sections plus the question and
//! runs a single model call. Provenance is never requested from the model;
//! the orchestrator reconstructs it from the facts it passed in.

use crate::llm::LanguageModel;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Fixed answer when no evidence of any kind is available.
pub const INSUFFICIENT_EVIDENCE_ANSWER: &str = "Not found in document";

/// Exact sentinel a chunk-extraction call replies with when the chunk does
/// not bear on the question. Matched case-insensitively as a prefix.
pub const NOT_RELEVANT_SENTINEL: &str = "NOT RELEVANT";

pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
}

impl Synthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Blocking synthesis. Returns the insufficiency sentinel without a model
    /// call when every fact list is empty.
    pub async fn synthesize(
        &self,
        internal_facts: &[String],
        external_facts: &[String],
        memory_facts: &[String],
        question: &str,
        style: Option<&str>,
    ) -> Result<String> {
        if internal_facts.is_empty() && external_facts.is_empty() && memory_facts.is_empty() {
            return Ok(INSUFFICIENT_EVIDENCE_ANSWER.to_string());
        }
        let prompt =
            build_synthesis_prompt(internal_facts, external_facts, memory_facts, question, style);
        let answer = self.model.generate(&prompt).await?;
        if answer.trim().is_empty() {
            return Ok(INSUFFICIENT_EVIDENCE_ANSWER.to_string());
        }
        info!(answer_len = answer.len(), "Synthesis complete");
        Ok(answer.trim().to_string())
    }

    /// Token-by-token variant. Identical prompt construction; only the
    /// consumption mode differs.
    pub async fn synthesize_stream(
        &self,
        internal_facts: &[String],
        external_facts: &[String],
        memory_facts: &[String],
        question: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        if internal_facts.is_empty() && external_facts.is_empty() && memory_facts.is_empty() {
            let _ = tx.send(INSUFFICIENT_EVIDENCE_ANSWER.to_string()).await;
            return Ok(INSUFFICIENT_EVIDENCE_ANSWER.to_string());
        }
        let prompt =
            build_synthesis_prompt(internal_facts, external_facts, memory_facts, question, None);
        let answer = self.model.generate_stream(&prompt, tx).await?;
        if answer.trim().is_empty() {
            return Ok(INSUFFICIENT_EVIDENCE_ANSWER.to_string());
        }
        Ok(answer.trim().to_string())
    }

    /// Completion synthesis: internal facts answer first, external facts fill
    /// only the missing fields. Used when internal evidence is partial.
    pub async fn synthesize_completion(
        &self,
        internal_facts: &[String],
        external_facts: &[String],
        memory_facts: &[String],
        question: &str,
    ) -> Result<String> {
        let prompt =
            build_completion_prompt(internal_facts, external_facts, memory_facts, question);
        let answer = self.model.generate(&prompt).await?;
        Ok(answer.trim().to_string())
    }
}

fn section(title: &str, facts: &[String]) -> String {
    if facts.is_empty() {
        return String::new();
    }
    let body = facts
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} {}: {}", title_label(title), i + 1, f))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{}:\n{}\n\n", title, body)
}

fn title_label(title: &str) -> &str {
    match title {
        "INTERNAL FACTS" => "FACT",
        "EXTERNAL FACTS" => "EXTERNAL",
        _ => "ITEM",
    }
}

/// One prompt, three clearly delimited fact sections, one question. The model
/// is told not to emit provenance tags — the orchestrator owns provenance.
pub fn build_synthesis_prompt(
    internal_facts: &[String],
    external_facts: &[String],
    memory_facts: &[String],
    question: &str,
    style: Option<&str>,
) -> String {
    let mem = if memory_facts.is_empty() {
        String::new()
    } else {
        format!("PAST INTERACTIONS:\n{}\n\n", memory_facts.join("\n"))
    };
    let style_line = style
        .map(|s| format!("- {}\n", s))
        .unwrap_or_default();

    format!(
        "You are a senior researcher combining partial answers into one clear answer.\n\n\
        {mem}{ext}{int}INSTRUCTIONS:\n\
        - Merge into one final answer. If facts disagree, explain the uncertainty.\n\
        - If none contain an answer, say '{sentinel}'.\n\
        - Do not emit citations, source tags, or provenance markers; sources are tracked separately.\n\
        - Respect any length or format requested in the question (e.g. 'in 3 lines', 'briefly').\n\
        {style_line}\n\
        FINAL QUESTION:\n{question}\n\nFINAL ANSWER:\n",
        mem = mem,
        ext = section("EXTERNAL FACTS", external_facts),
        int = section("INTERNAL FACTS", internal_facts),
        sentinel = INSUFFICIENT_EVIDENCE_ANSWER,
        style_line = style_line,
        question = question,
    )
}

/// Prompt for merging partial internal facts with external completion facts.
pub fn build_completion_prompt(
    internal_facts: &[String],
    external_facts: &[String],
    memory_facts: &[String],
    question: &str,
) -> String {
    let mem = if memory_facts.is_empty() {
        String::new()
    } else {
        format!("PAST INTERACTIONS:\n{}\n\n", memory_facts.join("\n"))
    };
    format!(
        "You are a senior researcher completing a partial answer using internal and external facts.\n\n\
        {mem}INTERNAL FACTS:\n{int}\n\nEXTERNAL FACTS (COMPLETION):\n{ext}\n\n\
        INSTRUCTIONS:\n\
        - Complete the answer using internal facts first.\n\
        - Use external facts only for missing fields.\n\
        - Do NOT hallucinate.\n\
        - Do not emit citations, source tags, or provenance markers.\n\
        - Merge into one clear, complete answer.\n\n\
        FINAL QUESTION:\n{question}\n\nFINAL ANSWER:\n",
        mem = mem,
        int = internal_facts.join("\n"),
        ext = external_facts.join("\n"),
        question = question,
    )
}

/// Prompt for extracting a partial answer from a single chunk. The model must
/// answer only from the chunk or reply with the relevance-negative sentinel.
pub fn build_chunk_prompt(chunk: &str, question: &str, idx: usize, total: usize) -> String {
    format!(
        "You are an expert analyst. Answer the question using ONLY the text in this chunk.\n\n\
        CHUNK {idx}/{total}:\n{chunk}\n\nQUESTION:\n{question}\n\n\
        INSTRUCTIONS:\n\
        - If the chunk does not contain information that answers the question, reply exactly: {sentinel}\n\
        - Otherwise: give a short partial answer (1-3 sentences) and one-line rationale.\n",
        idx = idx,
        total = total,
        chunk = chunk,
        question = question,
        sentinel = NOT_RELEVANT_SENTINEL,
    )
}
