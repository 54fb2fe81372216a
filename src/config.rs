//! Runtime settings, read once from the process environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// All tunables for one orchestrator instance. Built from env vars with
/// defaults; passed by reference, never re-read mid-query.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Inference service base URL (empty means unconfigured).
    pub inference_endpoint: String,
    pub model_id: String,
    pub embedding_model_id: String,
    pub max_gen_len: u32,

    /// Classifier sufficiency threshold over token-overlap similarity.
    pub classifier_threshold: f32,

    /// Retriever embedding-ranker parameters.
    pub retriever_top_k: usize,
    pub retriever_threshold: f32,
    /// Cost cap: embed at most this many chunks per query.
    pub max_chunks_to_embed: usize,

    /// Semantic memory recall parameters.
    pub memory_top_k: usize,
    pub memory_threshold: f32,
    pub memory_dir: PathBuf,
    pub save_memory: bool,

    /// External tool layer.
    pub enable_tool_planner: bool,
    pub tool_config_path: PathBuf,
    pub credentials_path: PathBuf,
    /// Cap on extracted provider text, bounds downstream prompt size.
    pub snippet_char_cap: usize,

    /// Reranker candidate count; 0 or 1 disables reranking.
    pub rerank_candidates: usize,

    /// Per-stage timeout for network-bound stages.
    pub stage_timeout: Duration,
    /// Global wall-clock budget for one query.
    pub total_budget: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v != "0" && !v.eq_ignore_ascii_case("false"),
        Err(_) => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            inference_endpoint: env_or("INFERENCE_ENDPOINT", ""),
            model_id: env_or("MODEL_ID", "us.meta.llama3-3-70b-instruct-v1:0"),
            embedding_model_id: env_or("EMBEDDING_MODEL_ID", "amazon.titan-embed-text-v1"),
            max_gen_len: env_parse("MAX_GEN_LEN", 800),
            classifier_threshold: env_parse("CLASSIFIER_THRESHOLD", 0.72),
            retriever_top_k: env_parse("RETRIEVER_TOP_K", 10),
            retriever_threshold: env_parse("RETRIEVER_THRESHOLD", 0.3),
            max_chunks_to_embed: env_parse("MAX_CHUNKS_TO_EMBED", 15),
            memory_top_k: env_parse("MAX_MEMORY_TO_LOAD", 5),
            memory_threshold: env_parse("MEMORY_THRESHOLD", 0.7),
            memory_dir: PathBuf::from(env_or("MEMORY_DIR", "memories")),
            save_memory: env_flag("SAVE_MEMORY", true),
            enable_tool_planner: env_flag("ENABLE_TOOL_PLANNER", false),
            tool_config_path: PathBuf::from(env_or("TOOL_CONFIG_PATH", "tool_config.json")),
            credentials_path: PathBuf::from(env_or(
                "CREDENTIALS_STORE_PATH",
                ".tool_credentials.json",
            )),
            snippet_char_cap: env_parse("SNIPPET_CHAR_CAP", 4000),
            rerank_candidates: env_parse("RERANK_CANDIDATES", 1),
            stage_timeout: Duration::from_secs(env_parse("STAGE_TIMEOUT_SECS", 20)),
            total_budget: Duration::from_secs(env_parse("MAX_TOTAL_TIME_SECS", 30)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let s = Settings::from_env();
        assert!(s.classifier_threshold > 0.5);
        assert_eq!(s.max_chunks_to_embed, 15);
        assert_eq!(s.snippet_char_cap, 4000);
        assert!(s.total_budget >= s.stage_timeout);
    }
}
