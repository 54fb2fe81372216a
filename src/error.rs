//! Error types for the research orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // External-call boundary errors
    // =============================

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Parse failure: {0}")]
    ParseFailure(String),

    #[error("Not configured: {0}")]
    Unconfigured(String),

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Memory store error: {0}")]
    MemoryError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Verification error: {0}")]
    VerificationError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
