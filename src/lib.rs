//! Financial-document research orchestrator
//!
//! Answers natural-language questions about a financial document by combining
//! evidence extracted from the document with, when needed, evidence fetched
//! from external knowledge providers, producing an answer together with
//! machine-checkable provenance and a confidence score.
//!
//! Pipeline: classifier → retriever → (conditional) tool planner/executor →
//! synthesizer → verifier → optional reranker → memory write, coordinated by
//! the [`orchestrator::Orchestrator`] with per-stage timeouts, a global
//! watchdog and a guaranteed single terminal event on the streaming surface.

pub mod classifier;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod ranking;
pub mod reranker;
pub mod retriever;
pub mod synthesizer;
pub mod tools;
pub mod verifier;

pub use config::Settings;
pub use error::{OrchestrationError, Result};
pub use models::{
    Chunk, DocumentContext, EvidenceItem, FlagKind, QueryResult, StreamEvent, VerificationReport,
};
pub use orchestrator::Orchestrator;

/// Install the global tracing subscriber, filtered by `RUST_LOG`. Safe to
/// call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
