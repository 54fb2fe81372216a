//! Core data models for the research orchestrator
//!
//! Every record that crosses a stage boundary is an explicit tagged type;
//! stages exchange these instead of untyped JSON objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

//
// ================= Enums =================
//

/// Who produced a piece of evidence: the document itself or a provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Internal,
    External,
}

/// Fixed taxonomy of external knowledge categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeCategory {
    Regulatory,
    Financials,
    Market,
    Macro,
    Credit,
    News,
    Generic,
}

impl KnowledgeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeCategory::Regulatory => "regulatory",
            KnowledgeCategory::Financials => "financials",
            KnowledgeCategory::Market => "market",
            KnowledgeCategory::Macro => "macro",
            KnowledgeCategory::Credit => "credit",
            KnowledgeCategory::News => "news",
            KnowledgeCategory::Generic => "generic",
        }
    }

    /// Lenient parse; anything unrecognized maps to `Generic`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "regulatory" => KnowledgeCategory::Regulatory,
            "financials" => KnowledgeCategory::Financials,
            "market" => KnowledgeCategory::Market,
            "macro" => KnowledgeCategory::Macro,
            "credit" => KnowledgeCategory::Credit,
            "news" => KnowledgeCategory::News,
            _ => KnowledgeCategory::Generic,
        }
    }
}

impl fmt::Display for KnowledgeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Integrity warnings attached to a verification report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagKind {
    NumericContradiction,
    OutdatedExternalData,
    LowEvidenceCoverage,
    PotentialHallucination,
    OnlyGenericWeb,
    PartialExternalCompletion,
    NoInternalEvidence,
}

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagKind::NumericContradiction => "NUMERIC_CONTRADICTION",
            FlagKind::OutdatedExternalData => "OUTDATED_EXTERNAL_DATA",
            FlagKind::LowEvidenceCoverage => "LOW_EVIDENCE_COVERAGE",
            FlagKind::PotentialHallucination => "POTENTIAL_HALLUCINATION",
            FlagKind::OnlyGenericWeb => "ONLY_GENERIC_WEB",
            FlagKind::PartialExternalCompletion => "PARTIAL_EXTERNAL_COMPLETION",
            FlagKind::NoInternalEvidence => "NO_INTERNAL_EVIDENCE",
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Completed,
    Failed,
    TimedOut,
    Skipped,
}

//
// ================= Document =================
//

/// A bounded slice of document text with a stable index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

/// Pre-chunked document handed to the pipeline. Text extraction and chunking
/// happen upstream.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub path: PathBuf,
    pub chunks: Vec<Chunk>,
}

impl DocumentContext {
    pub fn new(path: impl Into<PathBuf>, chunks: Vec<Chunk>) -> Self {
        Self {
            path: path.into(),
            chunks,
        }
    }

    /// Display name used as the internal-evidence source label.
    pub fn source_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Ranker output: a chunk with its relevance score.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub index: usize,
    pub text: String,
    pub similarity: f32,
}

//
// ================= Evidence =================
//

/// Where an evidence item can be located for a human reader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Locator {
    Page(usize),
    Url(String),
    /// Recalled from the per-document memory log rather than a page.
    Memory,
}

/// A system-attributed fact. Always constructed by the orchestration core,
/// never parsed out of model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub text: String,
    pub source_kind: SourceKind,
    pub source: String,
    pub locator: Locator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<KnowledgeCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl EvidenceItem {
    pub fn internal(text: String, source: String, page: usize, similarity: Option<f32>) -> Self {
        Self {
            text,
            source_kind: SourceKind::Internal,
            source,
            locator: Locator::Page(page),
            similarity,
            category: None,
            provider: None,
        }
    }

    pub fn recalled(text: String, source: String, similarity: f32) -> Self {
        Self {
            text,
            source_kind: SourceKind::Internal,
            source,
            locator: Locator::Memory,
            similarity: Some(similarity),
            category: None,
            provider: None,
        }
    }

    pub fn external(
        text: String,
        provider: String,
        category: KnowledgeCategory,
        url: String,
    ) -> Self {
        Self {
            text,
            source_kind: SourceKind::External,
            source: provider.clone(),
            locator: Locator::Url(url),
            similarity: None,
            category: Some(category),
            provider: Some(provider),
        }
    }
}

//
// ================= Providers & Credentials =================
//

/// A configured external knowledge provider. Absence from the registry means
/// "unconfigured", not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    #[serde(default)]
    pub category: KnowledgeCategory,
    #[serde(default)]
    pub endpoint_template: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl Default for KnowledgeCategory {
    fn default() -> Self {
        KnowledgeCategory::Generic
    }
}

/// Resolved credential fields for one provider.
pub type CredentialRecord = HashMap<String, String>;

/// Tool planner output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPlan {
    pub category: KnowledgeCategory,
    pub recommended_providers: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// Credential-resolution outcome: providers ready to call, providers skipped.
/// `ready` is never empty after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProviders {
    pub ready: Vec<String>,
    pub skipped: Vec<String>,
}

/// One provider execution outcome. Failures become records with `error: true`
/// instead of propagating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSnippet {
    pub provider: String,
    pub category: KnowledgeCategory,
    pub text: String,
    pub url: String,
    #[serde(default)]
    pub error: bool,
    pub fetched_at: DateTime<Utc>,
}

//
// ================= Memory =================
//

/// A persisted record of one past question/answer interaction.
/// Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub document: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub partials: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub flags: Vec<FlagKind>,
    #[serde(default)]
    pub model_id: String,
}

/// A memory entry together with its recall similarity.
#[derive(Debug, Clone)]
pub struct RecalledMemory {
    pub entry: MemoryEntry,
    pub similarity: f32,
}

//
// ================= Classification & Verification =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    pub internal_sufficient: bool,
    pub external_needed: bool,
    pub reason: String,
}

/// Verifier output. Computed fresh per answer; never treated as authoritative
/// once the evidence set changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub confidence: f32,
    pub flags: Vec<FlagKind>,
    pub explanation: String,
}

//
// ================= Trace & Results =================
//

/// Diagnostic record for one pipeline stage. Append-only; never consulted for
/// control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub stage: String,
    pub status: StageStatus,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// The single terminal result of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub confidence: f32,
    pub flags: Vec<FlagKind>,
    pub provenance: Vec<EvidenceItem>,
    pub trace: Vec<TraceRecord>,
}

/// Events yielded by the streaming variant. Exactly one `Final` per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Log { message: String },
    Token { text: String },
    Error { message: String },
    Final(QueryResult),
}
