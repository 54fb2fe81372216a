//! Stream orchestrator
//!
//! Sequences the full pipeline: classification, memory recall, retrieval,
//! optional external completion, synthesis, verification, optional reranking
//! and memory write-back. Every network-bound stage runs under its own
//! timeout, a global watchdog bounds the whole query, and the streaming
//! surface emits exactly one terminal event no matter what fails in between.
//!
//! Provenance is assembled here, from the facts this module passed around.
//! Nothing is ever parsed back out of model answer text.

use crate::classifier::Classifier;
use crate::config::Settings;
use crate::llm::{Embedder, EmbeddingClient, InferenceClient, LanguageModel};
use crate::memory::{recall_similar, MemoryStore};
use crate::models::{
    DocumentContext, EvidenceItem, ExternalSnippet, FlagKind, QueryResult, StageStatus,
    StreamEvent, TraceRecord,
};
use crate::retriever::Retriever;
use crate::reranker::{generate_candidates, select_best};
use crate::synthesizer::{Synthesizer, INSUFFICIENT_EVIDENCE_ANSWER};
use crate::tools::ToolLayer;
use crate::verifier::Verifier;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal answer when no stage completed at all.
pub const FAILSAFE_ANSWER: &str = "System could not retrieve an answer for this query.";

const PARTIAL_PHRASES: [&str; 4] = [
    "not provided",
    "no information available",
    "cannot compare",
    "not found",
];

lazy_static! {
    /// Simple proper-noun shape: one capitalized word.
    static ref ENTITY_RE: Regex = Regex::new(r"\b[A-Z][a-z]+\b").unwrap();
}

/// Internal evidence counts as partial when there is none, when the answer
/// admits a gap, or when the best internal similarity stays below 0.8.
pub fn is_internal_partial(partials: &[String], answer: &str, evidence: &[EvidenceItem]) -> bool {
    if partials.is_empty() {
        return true;
    }
    let answer_lower = answer.to_lowercase();
    if PARTIAL_PHRASES.iter().any(|p| answer_lower.contains(p)) {
        return true;
    }
    let max_sim = evidence
        .iter()
        .filter_map(|e| e.similarity)
        .fold(f32::MIN, f32::max);
    max_sim != f32::MIN && max_sim < 0.8
}

/// Capitalized words in the query that appear nowhere in the internal
/// partial answers.
pub fn missing_entities(query: &str, partials: &[String]) -> Vec<String> {
    let partials_text = partials.join(" ").to_lowercase();
    ENTITY_RE
        .find_iter(query)
        .map(|m| m.as_str().to_string())
        .filter(|e| !partials_text.contains(&e.to_lowercase()))
        .collect()
}

pub struct Orchestrator {
    settings: Settings,
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    classifier: Classifier,
    retriever: Retriever,
    synthesizer: Synthesizer,
    tools: ToolLayer,
    memory: MemoryStore,
}

impl Orchestrator {
    /// Wire up against the configured inference and embedding services.
    pub async fn new(settings: Settings) -> Self {
        let model: Arc<dyn LanguageModel> = Arc::new(InferenceClient::new(&settings));
        let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(&settings));
        let tools = ToolLayer::load(&settings).await;
        Self::with_components(settings, model, embedder, tools)
    }

    /// Assemble from explicit parts. Used when callers bring their own model
    /// or tool layer.
    pub fn with_components(
        settings: Settings,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        tools: ToolLayer,
    ) -> Self {
        let classifier = Classifier::new(settings.classifier_threshold);
        let retriever = Retriever::new(
            Arc::clone(&model),
            Arc::clone(&embedder),
            settings.retriever_top_k,
            settings.retriever_threshold,
            settings.max_chunks_to_embed,
        );
        let synthesizer = Synthesizer::new(Arc::clone(&model));
        let memory = MemoryStore::new(&settings.memory_dir);
        Self {
            settings,
            model,
            embedder,
            classifier,
            retriever,
            synthesizer,
            tools,
            memory,
        }
    }

    /// Blocking variant: run the pipeline and return only the terminal
    /// result. Intermediate events are discarded.
    pub async fn run(&self, question: &str, document: &DocumentContext) -> QueryResult {
        let (tx, mut rx) = mpsc::channel(64);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = match timeout(
            self.settings.total_budget,
            self.pipeline(question, document, &tx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Self::failsafe_result(vec![watchdog_record()]),
        };
        drop(tx);
        let _ = drain.await;
        result
    }

    /// Streaming variant. The returned channel yields log, token and error
    /// events followed by exactly one `Final`, regardless of which stages
    /// fail or whether the global budget runs out.
    pub fn run_stream(
        self: Arc<Self>,
        question: String,
        document: DocumentContext,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let result = match timeout(
                self.settings.total_budget,
                self.pipeline(&question, &document, &tx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: "query exceeded the global time budget".to_string(),
                        })
                        .await;
                    Self::failsafe_result(vec![watchdog_record()])
                }
            };
            let _ = tx.send(StreamEvent::Final(result)).await;
        });
        rx
    }

    fn failsafe_result(trace: Vec<TraceRecord>) -> QueryResult {
        QueryResult {
            answer: FAILSAFE_ANSWER.to_string(),
            confidence: 0.0,
            flags: Vec::new(),
            provenance: Vec::new(),
            trace,
        }
    }

    async fn pipeline(
        &self,
        question: &str,
        document: &DocumentContext,
        events: &mpsc::Sender<StreamEvent>,
    ) -> QueryResult {
        let query_start = Instant::now();
        let mut trace = Vec::new();
        let mut provenance: Vec<EvidenceItem> = Vec::new();

        // Classification is local and cheap; it never gets a timeout.
        let started = Instant::now();
        let classification = self.classifier.classify(question, &document.chunks);
        record(&mut trace, "classifier", StageStatus::Completed, started);
        log_event(
            events,
            format!(
                "classifier: internal_sufficient={} ({})",
                classification.internal_sufficient, classification.reason
            ),
        )
        .await;

        let document_key = document.path.display().to_string();
        let (memory_facts, memory_evidence) = self
            .recall_stage(question, &document_key, document, &mut trace)
            .await;
        provenance.extend(memory_evidence);

        // Retrieval: embedding-ranked chunks, one extraction call each.
        let started = Instant::now();
        let evidence = match timeout(
            self.settings.stage_timeout,
            self.retriever.retrieve(question, document),
        )
        .await
        {
            Ok(evidence) => {
                record(&mut trace, "retriever", StageStatus::Completed, started);
                evidence
            }
            Err(_) => {
                record(&mut trace, "retriever", StageStatus::TimedOut, started);
                Vec::new()
            }
        };
        let partials: Vec<String> = evidence.iter().map(|e| e.text.clone()).collect();
        provenance.extend(evidence.iter().cloned());
        log_event(
            events,
            format!("retriever: {} internal evidence item(s)", partials.len()),
        )
        .await;

        if partials.is_empty() {
            return self
                .no_internal_evidence(question, &memory_facts, provenance, trace, events)
                .await;
        }

        if self.over_budget(query_start) {
            return Self::failsafe_result(with_watchdog(trace));
        }

        // Internal synthesis, streamed token by token.
        let started = Instant::now();
        let mut answer = match self
            .stream_synthesis(&partials, &[], &memory_facts, question, events)
            .await
        {
            Ok(answer) => {
                record(&mut trace, "synthesizer", StageStatus::Completed, started);
                answer
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed");
                record(&mut trace, "synthesizer", StageStatus::Failed, started);
                INSUFFICIENT_EVIDENCE_ANSWER.to_string()
            }
        };

        let internal_partial = is_internal_partial(&partials, &answer, &evidence);
        let missing = missing_entities(question, &partials);
        debug!(
            internal_partial,
            missing = ?missing,
            "Completeness check"
        );

        let mut seed_flags = Vec::new();
        let mut external_snippets: Vec<ExternalSnippet> = Vec::new();

        if (internal_partial || !missing.is_empty())
            && self.settings.enable_tool_planner
            && !self.over_budget(query_start)
        {
            log_event(events, "internal evidence partial, fetching external data".to_string())
                .await;
            let started = Instant::now();
            match timeout(
                self.settings.stage_timeout,
                self.tools.run_search(self.model.as_ref(), question),
            )
            .await
            {
                Ok((external_text, snippets)) if !external_text.trim().is_empty() => {
                    record(&mut trace, "tool_executor", StageStatus::Completed, started);
                    let external_facts = vec![external_text];
                    match timeout(
                        self.settings.stage_timeout,
                        self.synthesizer.synthesize_completion(
                            &partials,
                            &external_facts,
                            &memory_facts,
                            question,
                        ),
                    )
                    .await
                    {
                        Ok(Ok(completed)) if !completed.is_empty() => {
                            answer = completed;
                            seed_flags.push(FlagKind::PartialExternalCompletion);
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Completion synthesis failed"),
                        Err(_) => warn!("Completion synthesis timed out, keeping internal answer"),
                    }
                    provenance.extend(snippets.iter().filter(|s| !s.error).map(snippet_evidence));
                    external_snippets = snippets;
                }
                Ok((_, snippets)) => {
                    record(&mut trace, "tool_executor", StageStatus::Completed, started);
                    external_snippets = snippets;
                }
                Err(_) => {
                    record(&mut trace, "tool_executor", StageStatus::TimedOut, started);
                }
            }
        } else {
            record_skip(&mut trace, "tool_executor");
        }

        let external_texts: Vec<String> = external_snippets
            .iter()
            .filter(|s| !s.error)
            .map(|s| s.text.clone())
            .collect();

        let started = Instant::now();
        let mut report = Verifier::verify(
            &answer,
            &provenance,
            &partials,
            &external_texts,
            seed_flags.clone(),
        );
        record(&mut trace, "verifier", StageStatus::Completed, started);
        log_event(events, format!("verifier: confidence {:.2}", report.confidence)).await;

        // Optional multi-candidate pass.
        if self.settings.rerank_candidates > 1 && !self.over_budget(query_start) {
            let started = Instant::now();
            let reranked = timeout(self.settings.stage_timeout, async {
                let candidates = generate_candidates(
                    &self.synthesizer,
                    &partials,
                    &external_texts,
                    &memory_facts,
                    question,
                    self.settings.rerank_candidates,
                )
                .await;
                select_best(
                    self.embedder.as_ref(),
                    question,
                    &candidates,
                    &provenance,
                    &partials,
                    &external_texts,
                )
                .await
            })
            .await;
            match reranked {
                Ok(best) => {
                    if !best.is_empty() && best != answer {
                        answer = best;
                        report = Verifier::verify(
                            &answer,
                            &provenance,
                            &partials,
                            &external_texts,
                            seed_flags,
                        );
                    }
                    record(&mut trace, "reranker", StageStatus::Completed, started);
                }
                Err(_) => record(&mut trace, "reranker", StageStatus::TimedOut, started),
            }
        }

        self.write_memory(
            question,
            &document_key,
            &answer,
            &partials,
            &provenance,
            &report,
            &mut trace,
        )
        .await;

        info!(confidence = report.confidence, flags = ?report.flags, "Query complete");
        QueryResult {
            answer,
            confidence: report.confidence,
            flags: report.flags,
            provenance,
            trace,
        }
    }

    /// No internal evidence at all: bypass the planner and force the search
    /// provider directly, or concede with the insufficiency sentinel. Runs
    /// whenever the tool layer is enabled, even if the classifier expected
    /// the document to suffice.
    async fn no_internal_evidence(
        &self,
        question: &str,
        memory_facts: &[String],
        mut provenance: Vec<EvidenceItem>,
        mut trace: Vec<TraceRecord>,
        events: &mpsc::Sender<StreamEvent>,
    ) -> QueryResult {
        if self.settings.enable_tool_planner {
            log_event(events, "no internal evidence, forcing external search".to_string()).await;
            let started = Instant::now();
            let forced = timeout(
                self.settings.stage_timeout,
                self.tools.run_search_forced(question),
            )
            .await;
            match forced {
                Ok((external_text, snippets)) if !external_text.trim().is_empty() => {
                    record(&mut trace, "tool_executor", StageStatus::Completed, started);
                    let external_facts = vec![external_text];
                    let started = Instant::now();
                    match self
                        .stream_synthesis(&[], &external_facts, memory_facts, question, events)
                        .await
                    {
                        Ok(answer) if answer != INSUFFICIENT_EVIDENCE_ANSWER => {
                            record(&mut trace, "synthesizer", StageStatus::Completed, started);
                            provenance
                                .extend(snippets.iter().filter(|s| !s.error).map(snippet_evidence));
                            let external_texts: Vec<String> = snippets
                                .iter()
                                .filter(|s| !s.error)
                                .map(|s| s.text.clone())
                                .collect();
                            let verify_started = Instant::now();
                            let mut report = Verifier::verify(
                                &answer,
                                &provenance,
                                &[],
                                &external_texts,
                                Vec::new(),
                            );
                            // External-only answers still carry usable signal.
                            report.confidence = report.confidence.max(0.6);
                            record(&mut trace, "verifier", StageStatus::Completed, verify_started);
                            return QueryResult {
                                answer,
                                confidence: report.confidence,
                                flags: report.flags,
                                provenance,
                                trace,
                            };
                        }
                        Ok(_) => {
                            record(&mut trace, "synthesizer", StageStatus::Completed, started)
                        }
                        Err(e) => {
                            warn!(error = %e, "External-only synthesis failed");
                            record(&mut trace, "synthesizer", StageStatus::Failed, started);
                        }
                    }
                }
                Ok(_) => record(&mut trace, "tool_executor", StageStatus::Completed, started),
                Err(_) => record(&mut trace, "tool_executor", StageStatus::TimedOut, started),
            }
        } else {
            record_skip(&mut trace, "tool_executor");
        }

        QueryResult {
            answer: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
            confidence: 0.0,
            flags: vec![FlagKind::NoInternalEvidence],
            provenance,
            trace,
        }
    }

    async fn recall_stage(
        &self,
        question: &str,
        document_key: &str,
        document: &DocumentContext,
        trace: &mut Vec<TraceRecord>,
    ) -> (Vec<String>, Vec<EvidenceItem>) {
        let started = Instant::now();
        let entries = self.memory.load(document_key).await;
        let recalled = match timeout(
            self.settings.stage_timeout,
            recall_similar(
                self.embedder.as_ref(),
                question,
                document_key,
                &entries,
                self.settings.memory_top_k,
                self.settings.memory_threshold,
            ),
        )
        .await
        {
            Ok(recalled) => {
                record(trace, "memory_recall", StageStatus::Completed, started);
                recalled
            }
            Err(_) => {
                record(trace, "memory_recall", StageStatus::TimedOut, started);
                Vec::new()
            }
        };

        let source = document.source_name();
        let facts = recalled
            .iter()
            .map(|m| format!("Q: {}\nA: {}", m.entry.question, m.entry.answer))
            .collect();
        let evidence = recalled
            .iter()
            .map(|m| EvidenceItem::recalled(m.entry.answer.clone(), source.clone(), m.similarity))
            .collect();
        (facts, evidence)
    }

    /// Run streaming synthesis, forwarding each piece as a Token event.
    async fn stream_synthesis(
        &self,
        internal_facts: &[String],
        external_facts: &[String],
        memory_facts: &[String],
        question: &str,
        events: &mpsc::Sender<StreamEvent>,
    ) -> crate::Result<String> {
        let (piece_tx, mut piece_rx) = mpsc::channel::<String>(32);
        let events = events.clone();
        let forward = tokio::spawn(async move {
            while let Some(text) = piece_rx.recv().await {
                let _ = events.send(StreamEvent::Token { text }).await;
            }
        });
        let result = timeout(
            self.settings.stage_timeout,
            self.synthesizer.synthesize_stream(
                internal_facts,
                external_facts,
                memory_facts,
                question,
                piece_tx,
            ),
        )
        .await
        .map_err(|_| crate::error::OrchestrationError::Timeout("synthesis".to_string()))?;
        let _ = forward.await;
        result
    }

    async fn write_memory(
        &self,
        question: &str,
        document_key: &str,
        answer: &str,
        partials: &[String],
        provenance: &[EvidenceItem],
        report: &crate::models::VerificationReport,
        trace: &mut Vec<TraceRecord>,
    ) {
        if !self.settings.save_memory {
            record_skip(trace, "memory_write");
            return;
        }
        let started = Instant::now();
        let embedding = match timeout(self.settings.stage_timeout, self.embedder.embed(answer)).await
        {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                debug!(error = %e, "Answer embedding failed, storing without one");
                None
            }
            Err(_) => {
                debug!("Answer embedding timed out, storing without one");
                None
            }
        };
        let entry = crate::models::MemoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            document: document_key.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            partials: partials.to_vec(),
            evidence: provenance.to_vec(),
            embedding,
            confidence: Some(report.confidence),
            flags: report.flags.clone(),
            model_id: self.settings.model_id.clone(),
        };
        match self.memory.append(entry).await {
            Ok(()) => record(trace, "memory_write", StageStatus::Completed, started),
            Err(e) => {
                warn!(error = %e, "Memory write failed");
                record(trace, "memory_write", StageStatus::Failed, started);
            }
        }
    }

    fn over_budget(&self, query_start: Instant) -> bool {
        query_start.elapsed() >= self.settings.total_budget
    }
}

fn snippet_evidence(snippet: &ExternalSnippet) -> EvidenceItem {
    EvidenceItem::external(
        snippet.text.clone(),
        snippet.provider.clone(),
        snippet.category,
        snippet.url.clone(),
    )
}

fn record(trace: &mut Vec<TraceRecord>, stage: &str, status: StageStatus, started: Instant) {
    trace.push(TraceRecord {
        stage: stage.to_string(),
        status,
        latency_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    });
}

fn record_skip(trace: &mut Vec<TraceRecord>, stage: &str) {
    trace.push(TraceRecord {
        stage: stage.to_string(),
        status: StageStatus::Skipped,
        latency_ms: 0,
        timestamp: Utc::now(),
    });
}

fn watchdog_record() -> TraceRecord {
    TraceRecord {
        stage: "watchdog".to_string(),
        status: StageStatus::TimedOut,
        latency_ms: 0,
        timestamp: Utc::now(),
    }
}

fn with_watchdog(mut trace: Vec<TraceRecord>) -> Vec<TraceRecord> {
    trace.push(watchdog_record());
    trace
}

async fn log_event(events: &mpsc::Sender<StreamEvent>, message: String) {
    debug!("{}", message);
    let _ = events.send(StreamEvent::Log { message }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{FailingModel, HashEmbedder, ScriptedModel};
    use crate::models::{Chunk, Locator, SourceKind};
    use crate::tools::{CredentialStore, ProviderRegistry, ToolLayer};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Model that never answers within any reasonable budget.
    struct HangingModel;

    #[async_trait]
    impl LanguageModel for HangingModel {
        async fn generate(&self, _prompt: &str) -> crate::Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    /// Answers from a script, then hangs once the script runs out.
    struct ScriptedThenHang {
        responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    }

    impl ScriptedThenHang {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: std::sync::Mutex::new(
                    responses.into_iter().map(String::from).collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedThenHang {
        async fn generate(&self, _prompt: &str) -> crate::Result<String> {
            let next = self.responses.lock().unwrap().pop_front();
            match next {
                Some(r) => Ok(r),
                None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
            }
        }
    }

    /// Embeds normally for a fixed number of calls, then hangs.
    struct SlowTailEmbedder {
        budget: std::sync::Mutex<usize>,
    }

    #[async_trait]
    impl Embedder for SlowTailEmbedder {
        async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
            let allowed = {
                let mut budget = self.budget.lock().unwrap();
                if *budget > 0 {
                    *budget -= 1;
                    true
                } else {
                    false
                }
            };
            if allowed {
                HashEmbedder.embed(text).await
            } else {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }

    /// Minimal local HTTP endpoint serving one fixed JSON body.
    async fn spawn_json_server(body: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    fn test_settings(dir: &std::path::Path) -> Settings {
        let mut s = Settings::from_env();
        s.memory_dir = dir.join("memories");
        s.tool_config_path = dir.join("tool_config.json");
        s.credentials_path = dir.join(".creds.json");
        s.enable_tool_planner = false;
        s.save_memory = false;
        s.rerank_candidates = 1;
        s.retriever_threshold = 0.0;
        s.stage_timeout = Duration::from_secs(5);
        s.total_budget = Duration::from_secs(10);
        s
    }

    fn orchestrator(settings: Settings, model: Arc<dyn LanguageModel>) -> Orchestrator {
        let tools = ToolLayer::with_parts(
            ProviderRegistry::default(),
            CredentialStore::new(&settings.credentials_path),
            &settings,
        );
        Orchestrator::with_components(settings, model, Arc::new(HashEmbedder), tools)
    }

    fn document() -> DocumentContext {
        DocumentContext::new(
            "/docs/annual_report.pdf",
            vec![
                Chunk {
                    index: 0,
                    text: "Revenue grew 12.5% year over year in the retail segment.".to_string(),
                },
                Chunk {
                    index: 1,
                    text: "The board declared a dividend of 2.0 per share.".to_string(),
                },
            ],
        )
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn finals(events: &[StreamEvent]) -> Vec<&QueryResult> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Final(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_produces_answer_with_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            "Revenue grew 12.5% year over year.",
            "NOT RELEVANT",
            "Revenue grew 12.5% year over year in the retail segment.",
        ]));
        let orch = Arc::new(orchestrator(test_settings(dir.path()), model));

        let events = drain(orch.run_stream(
            "How much did revenue grow year over year?".to_string(),
            document(),
        ))
        .await;

        let finals = finals(&events);
        assert_eq!(finals.len(), 1);
        let result = finals[0];
        assert!(result.answer.contains("12.5%"));
        assert!(!result.provenance.is_empty());
        assert!(result
            .provenance
            .iter()
            .all(|p| p.source_kind == SourceKind::Internal));
        assert!(result.confidence > 0.0);

        let stages: Vec<&str> = result.trace.iter().map(|t| t.stage.as_str()).collect();
        assert!(stages.contains(&"classifier"));
        assert!(stages.contains(&"retriever"));
        assert!(stages.contains(&"synthesizer"));
        assert!(stages.contains(&"verifier"));

        // Tokens arrive before the terminal event.
        let token_idx = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Token { .. }));
        let final_idx = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Final(_)));
        assert!(token_idx.unwrap() < final_idx.unwrap());
    }

    #[tokio::test]
    async fn test_exactly_one_final_when_everything_fails() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Arc::new(orchestrator(test_settings(dir.path()), Arc::new(FailingModel)));
        let events = drain(orch.run_stream("any question?".to_string(), document())).await;
        let finals = finals(&events);
        assert_eq!(finals.len(), 1);
        // Model failure leaves no internal evidence; planner is disabled.
        assert_eq!(finals[0].answer, INSUFFICIENT_EVIDENCE_ANSWER);
        assert_eq!(finals[0].confidence, 0.0);
        assert!(finals[0].flags.contains(&FlagKind::NoInternalEvidence));
    }

    #[tokio::test]
    async fn test_global_budget_yields_failsafe() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.total_budget = Duration::from_millis(50);
        settings.stage_timeout = Duration::from_secs(60);
        let orch = Arc::new(orchestrator(settings, Arc::new(HangingModel)));

        let events = drain(orch.run_stream("slow question".to_string(), document())).await;
        let finals = finals(&events);
        assert_eq!(finals.len(), 1);
        assert!(finals[0].answer.contains("System could not retrieve"));
        assert_eq!(finals[0].confidence, 0.0);
        assert!(finals[0].provenance.is_empty());
    }

    #[tokio::test]
    async fn test_empty_document_no_internal_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new(vec!["unused"]));
        let orch = orchestrator(test_settings(dir.path()), model);
        let doc = DocumentContext::new("/docs/empty.pdf", vec![]);
        let result = orch.run("anything?", &doc).await;
        assert_eq!(result.answer, INSUFFICIENT_EVIDENCE_ANSWER);
        assert_eq!(result.confidence, 0.0);
        assert!(result.flags.contains(&FlagKind::NoInternalEvidence));
        assert!(result.provenance.is_empty());
    }

    #[tokio::test]
    async fn test_memory_written_and_recalled() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.save_memory = true;
        let memory_dir = settings.memory_dir.clone();

        let model = Arc::new(ScriptedModel::new(vec![
            "Revenue grew 12.5% year over year.",
            "Dividend of 2.0 per share declared.",
            "Revenue grew 12.5%; dividend 2.0 per share.",
        ]));
        let orch = orchestrator(settings, model);
        let doc = document();
        let result = orch.run("What were revenue growth and dividend?", &doc).await;
        assert!(!result.answer.is_empty());

        let store = MemoryStore::new(&memory_dir);
        let entries = store.load(&doc.path.display().to_string()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].answer, result.answer);
        assert!(entries[0].embedding.is_some());
        assert!(result
            .trace
            .iter()
            .any(|t| t.stage == "memory_write" && t.status == StageStatus::Completed));
    }

    #[tokio::test]
    async fn test_forced_search_failure_degrades_to_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.enable_tool_planner = true;
        // Generic provider pointed at an unreachable local endpoint.
        let mut providers = std::collections::HashMap::new();
        providers.insert(
            "web_search_generic".to_string(),
            crate::models::ProviderDescriptor {
                category: crate::models::KnowledgeCategory::Generic,
                endpoint_template: Some("http://127.0.0.1:9/ia?q={q}".to_string()),
                required_fields: vec![],
            },
        );
        let tools = ToolLayer::with_parts(
            ProviderRegistry::from_providers(providers),
            CredentialStore::new(&settings.credentials_path),
            &settings,
        );
        let orch = Orchestrator::with_components(
            settings,
            Arc::new(FailingModel),
            Arc::new(HashEmbedder),
            tools,
        );
        let result = orch.run("external question?", &document()).await;
        assert_eq!(result.answer, INSUFFICIENT_EVIDENCE_ANSWER);
        assert!(result.flags.contains(&FlagKind::NoInternalEvidence));
    }

    #[tokio::test]
    async fn test_forced_search_runs_even_when_classifier_trusts_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.enable_tool_planner = true;
        let mut providers = std::collections::HashMap::new();
        providers.insert(
            "web_search_generic".to_string(),
            crate::models::ProviderDescriptor {
                category: crate::models::KnowledgeCategory::Generic,
                endpoint_template: Some("http://127.0.0.1:9/ia?q={q}".to_string()),
                required_fields: vec![],
            },
        );
        let tools = ToolLayer::with_parts(
            ProviderRegistry::from_providers(providers),
            CredentialStore::new(&settings.credentials_path),
            &settings,
        );
        // Extraction fails on every chunk, so no internal evidence survives
        // even though the query overlaps the document heavily.
        let orch = Orchestrator::with_components(
            settings,
            Arc::new(FailingModel),
            Arc::new(HashEmbedder),
            tools,
        );
        let doc = document();
        let question = "Revenue grew year over year in the retail segment";
        assert!(orch.classifier.classify(question, &doc.chunks).internal_sufficient);

        let result = orch.run(question, &doc).await;
        assert!(result
            .trace
            .iter()
            .any(|t| t.stage == "tool_executor" && t.status != StageStatus::Skipped));
        assert_eq!(result.answer, INSUFFICIENT_EVIDENCE_ANSWER);
    }

    #[tokio::test]
    async fn test_reranker_hang_times_out_without_losing_answer() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.rerank_candidates = 2;
        settings.stage_timeout = Duration::from_millis(200);
        let model = Arc::new(ScriptedThenHang::new(vec![
            "Revenue grew 12.5% year over year.",
            "Dividend of 2.0 per share declared.",
            "Revenue grew 12.5%; the dividend was 2.0 per share.",
        ]));
        let orch = orchestrator(settings, model);

        let result = orch
            .run("What were revenue growth and dividend?", &document())
            .await;
        assert_eq!(result.answer, "Revenue grew 12.5%; the dividend was 2.0 per share.");
        assert!(result
            .trace
            .iter()
            .any(|t| t.stage == "reranker" && t.status == StageStatus::TimedOut));
    }

    #[tokio::test]
    async fn test_memory_write_survives_hanging_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.save_memory = true;
        settings.stage_timeout = Duration::from_millis(200);
        let memory_dir = settings.memory_dir.clone();
        let model = Arc::new(ScriptedModel::new(vec![
            "Revenue grew 12.5% year over year.",
            "Dividend of 2.0 per share declared.",
            "Revenue grew 12.5%; dividend 2.0 per share.",
        ]));
        let tools = ToolLayer::with_parts(
            ProviderRegistry::default(),
            CredentialStore::new(&settings.credentials_path),
            &settings,
        );
        // Query plus two chunk embeddings succeed; the answer embedding hangs.
        let embedder = Arc::new(SlowTailEmbedder {
            budget: std::sync::Mutex::new(3),
        });
        let orch = Orchestrator::with_components(settings, model, embedder, tools);

        let doc = document();
        let result = orch.run("What were revenue growth and dividend?", &doc).await;
        assert!(!result.answer.contains("System could not retrieve"));

        let entries = MemoryStore::new(&memory_dir)
            .load(&doc.path.display().to_string())
            .await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].embedding.is_none());
        assert!(result
            .trace
            .iter()
            .any(|t| t.stage == "memory_write" && t.status == StageStatus::Completed));
    }

    #[tokio::test]
    async fn test_completion_hang_times_out_keeping_internal_answer() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.enable_tool_planner = true;
        settings.stage_timeout = Duration::from_millis(500);

        let addr = spawn_json_server(r#"{"AbstractText": "Peer revenue grew 10% in 2024."}"#).await;
        let mut providers = std::collections::HashMap::new();
        providers.insert(
            "web_search_generic".to_string(),
            crate::models::ProviderDescriptor {
                category: crate::models::KnowledgeCategory::Generic,
                endpoint_template: Some(format!("http://{}/search?q={{q}}", addr)),
                required_fields: vec![],
            },
        );
        let tools = ToolLayer::with_parts(
            ProviderRegistry::from_providers(providers),
            CredentialStore::new(&settings.credentials_path),
            &settings,
        );

        // Script covers extraction, synthesis and the planner; the completion
        // call after external retrieval hangs.
        let model = Arc::new(ScriptedThenHang::new(vec![
            "Revenue figures cover only the company itself.",
            "NOT RELEVANT",
            "Peer comparison data is not provided in the document.",
            r#"{"category": "generic", "recommended_providers": ["web_search_generic"], "reason": "peer data"}"#,
        ]));
        let orch =
            Orchestrator::with_components(settings, model, Arc::new(HashEmbedder), tools);

        let result = orch.run("How did revenue compare with peers?", &document()).await;
        assert_eq!(
            result.answer,
            "Peer comparison data is not provided in the document."
        );
        assert!(result
            .trace
            .iter()
            .any(|t| t.stage == "tool_executor" && t.status == StageStatus::Completed));
        assert!(result
            .provenance
            .iter()
            .any(|p| p.source_kind == SourceKind::External));
        assert!(!result.flags.contains(&FlagKind::PartialExternalCompletion));
    }

    #[tokio::test]
    async fn test_recall_is_scoped_to_the_current_document() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let memory_dir = settings.memory_dir.clone();
        let question = "How much did revenue grow year over year?";

        async fn seeded(question: &str, doc: &str) -> crate::models::MemoryEntry {
            crate::models::MemoryEntry {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                document: doc.to_string(),
                question: question.to_string(),
                answer: "Revenue grew 12.5% year over year.".to_string(),
                partials: vec![],
                evidence: vec![],
                embedding: HashEmbedder.embed(question).await.ok(),
                confidence: Some(0.9),
                flags: vec![],
                model_id: "test".to_string(),
            }
        }

        // A near-identical interaction recorded for a different document must
        // not enter this query's memory facts.
        let store = MemoryStore::new(&memory_dir);
        store
            .append(seeded(question, "/docs/other_report.pdf").await)
            .await
            .unwrap();

        let model = Arc::new(ScriptedModel::new(vec![
            "Revenue grew 12.5% year over year.",
            "The board declared a dividend of 2.0 per share.",
            "Revenue grew 12.5% year over year.",
        ]));
        let orch = orchestrator(settings, model);
        let result = orch.run(question, &document()).await;
        assert!(result.provenance.iter().all(|p| p.locator != Locator::Memory));

        // The same interaction recorded for this document is recalled.
        store
            .append(seeded(question, "/docs/annual_report.pdf").await)
            .await
            .unwrap();
        let result = orch.run(question, &document()).await;
        assert!(result.provenance.iter().any(|p| p.locator == Locator::Memory));
    }

    #[test]
    fn test_is_internal_partial_rules() {
        let good = vec!["Revenue grew 12.5%".to_string()];
        let strong = vec![EvidenceItem::internal(
            "Revenue grew 12.5%".to_string(),
            "r.pdf".to_string(),
            1,
            Some(0.9),
        )];
        assert!(!is_internal_partial(&good, "Revenue grew 12.5%.", &strong));

        assert!(is_internal_partial(&[], "anything", &[]));
        assert!(is_internal_partial(
            &good,
            "The dividend is not provided in the document.",
            &strong
        ));

        let weak = vec![EvidenceItem::internal(
            "Revenue grew".to_string(),
            "r.pdf".to_string(),
            1,
            Some(0.5),
        )];
        assert!(is_internal_partial(&good, "Revenue grew.", &weak));
    }

    #[test]
    fn test_missing_entities() {
        let partials = vec!["Infosys revenue grew 12.5%".to_string()];
        let missing = missing_entities("Compare Infosys and Wipro revenue", &partials);
        assert_eq!(missing, vec!["Wipro".to_string()]);
        assert!(missing_entities("compare revenue growth", &partials).is_empty());
    }
}
