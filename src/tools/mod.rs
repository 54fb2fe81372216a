//! External tool intelligence layer
//!
//! Two distinct notions kept apart on purpose:
//! - Conceptual tools: categories of external knowledge the planner may
//!   recommend even when nothing is configured for them.
//! - Configured providers: concrete endpoints in `tool_config.json` with
//!   credential requirements. Only these can be executed.
//!
//! Credential handshake: when a recommended provider has no resolvable
//! credentials, an injectable prompt callback is consulted (JSON or
//! key=value input, or the literal SKIP). Skipping every provider still
//! leaves the zero-credential generic search ready, so resolution never
//! ends with nothing to call.

use crate::config::Settings;
use crate::error::OrchestrationError;
use crate::llm::LanguageModel;
use crate::models::{
    CredentialRecord, ExternalSnippet, KnowledgeCategory, ProviderDescriptor, ResolvedProviders,
    ToolPlan,
};
use crate::Result;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Always-available provider id; needs no credentials.
pub const GENERIC_PROVIDER: &str = "web_search_generic";

const USER_AGENT: &str = "bfsi-research-orchestrator/1.0";

lazy_static! {
    /// Balanced-brace JSON object scan, one nesting level deep. Enough to dig
    /// a planner object out of surrounding prose.
    static ref JSON_OBJECT_RE: Regex =
        Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap();
}

//
// ================= Conceptual tool universe =================
//

/// A category of external knowledge the planner can reason about,
/// independent of whether any provider for it is configured.
pub struct ConceptualTool {
    pub name: &'static str,
    pub category: KnowledgeCategory,
    pub purpose: &'static str,
    pub example_providers: &'static [&'static str],
}

/// Fixed taxonomy rendered into the planner prompt.
pub const TOOL_KNOWLEDGE_BASE: &[ConceptualTool] = &[
    ConceptualTool {
        name: "web_search",
        category: KnowledgeCategory::Generic,
        purpose: "Search authoritative websites for latest info",
        example_providers: &["SerpAPI", "Bing API", "DuckDuckGo"],
    },
    ConceptualTool {
        name: "regulatory_filings",
        category: KnowledgeCategory::Regulatory,
        purpose: "Fetch official filings and disclosures",
        example_providers: &["SEC EDGAR", "SEBI", "Companies House"],
    },
    ConceptualTool {
        name: "company_financials",
        category: KnowledgeCategory::Financials,
        purpose: "Company metrics, balance sheets, ratios",
        example_providers: &["Yahoo Finance", "Alpha Vantage"],
    },
    ConceptualTool {
        name: "market_prices",
        category: KnowledgeCategory::Market,
        purpose: "Real-time and historical market prices",
        example_providers: &["Yahoo Finance", "Alpha Vantage", "NSE", "BSE"],
    },
    ConceptualTool {
        name: "macroeconomic",
        category: KnowledgeCategory::Macro,
        purpose: "GDP, inflation, policy rates",
        example_providers: &["World Bank", "IMF", "RBI"],
    },
    ConceptualTool {
        name: "credit_ratings",
        category: KnowledgeCategory::Credit,
        purpose: "Issuer credit ratings",
        example_providers: &["Moody's", "S&P"],
    },
    ConceptualTool {
        name: "financial_news",
        category: KnowledgeCategory::News,
        purpose: "Market and company news",
        example_providers: &["Reuters", "Bloomberg"],
    },
];

//
// ================= Provider registry =================
//

#[derive(Debug, Default, Deserialize)]
struct ToolConfigFile {
    #[serde(default)]
    providers: HashMap<String, ProviderDescriptor>,
}

/// Configured providers loaded from `tool_config.json`. Absence of a
/// provider means "unconfigured", never an error.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Load from disk. Missing or corrupt files yield an empty registry.
    pub async fn load(path: &Path) -> Self {
        let raw = match fs::read(path).await {
            Ok(r) => r,
            Err(_) => return Self::default(),
        };
        match serde_json::from_slice::<ToolConfigFile>(&raw) {
            Ok(cfg) => Self {
                providers: cfg.providers,
            },
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Tool config unreadable, ignoring");
                Self::default()
            }
        }
    }

    pub fn from_providers(providers: HashMap<String, ProviderDescriptor>) -> Self {
        Self { providers }
    }

    pub fn get(&self, provider_id: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(provider_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn for_category(&self, category: KnowledgeCategory) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .providers
            .iter()
            .filter(|(_, p)| p.category == category)
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

//
// ================= Credential store =================
//

/// Interactive credential input. Given the provider id and its required
/// fields, returns the raw user response or None on end-of-input.
pub type CredentialPrompt = Arc<dyn Fn(&str, &[String]) -> Option<String> + Send + Sync>;

/// Credential resolution: explicit in-memory cache, durable JSON store,
/// environment variables, interactive prompt, in that order. The cache is
/// best-effort and always falls back to the durable store. Credential
/// values never appear in logs.
pub struct CredentialStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, CredentialRecord>>,
    prompt: Option<CredentialPrompt>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(HashMap::new()),
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: CredentialPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Register credentials programmatically: primes the cache and persists
    /// to the durable store.
    pub async fn register(&self, provider_id: &str, creds: CredentialRecord) -> Result<()> {
        self.cache
            .lock()
            .expect("credential cache lock")
            .insert(provider_id.to_string(), creds.clone());

        let mut store = self.read_store().await;
        store.insert(provider_id.to_string(), creds);
        let serialized = serde_json::to_vec_pretty(&store)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(&self.path, serialized).await?;
        info!(provider = provider_id, "Credentials registered");
        Ok(())
    }

    /// Cache first, then the durable store (which also re-primes the cache).
    pub async fn get(&self, provider_id: &str) -> Option<CredentialRecord> {
        if let Some(creds) = self
            .cache
            .lock()
            .expect("credential cache lock")
            .get(provider_id)
        {
            return Some(creds.clone());
        }
        let store = self.read_store().await;
        let creds = store.get(provider_id)?.clone();
        self.cache
            .lock()
            .expect("credential cache lock")
            .insert(provider_id.to_string(), creds.clone());
        Some(creds)
    }

    /// Full resolution chain minus the interactive prompt: cache/store, then
    /// environment variables named `{PROVIDER}_{FIELD}` (upper-cased, dashes
    /// mapped to underscores). Returns Some only when every required field
    /// is present and non-empty.
    pub async fn resolve(
        &self,
        provider_id: &str,
        required_fields: &[String],
    ) -> Option<CredentialRecord> {
        if let Some(creds) = self.get(provider_id).await {
            if required_fields
                .iter()
                .all(|f| creds.get(f).map(|v| !v.is_empty()).unwrap_or(false))
            {
                return Some(creds);
            }
        }

        let prefix = provider_id.to_uppercase().replace('-', "_");
        let mut env_creds = CredentialRecord::new();
        for field in required_fields {
            let key = format!("{}_{}", prefix, field.to_uppercase());
            match std::env::var(&key) {
                Ok(v) if !v.is_empty() => {
                    env_creds.insert(field.clone(), v);
                }
                _ => return None,
            }
        }
        Some(env_creds)
    }

    /// Interactive leg of the handshake. Returns the registered credentials,
    /// or None when the user skipped or input could not be parsed.
    pub async fn prompt_for(
        &self,
        provider_id: &str,
        required_fields: &[String],
    ) -> Option<CredentialRecord> {
        let prompt = self.prompt.as_ref()?;
        let raw = prompt(provider_id, required_fields)?;
        let creds = parse_credential_input(&raw, required_fields)?;
        if let Err(e) = self.register(provider_id, creds.clone()).await {
            warn!(provider = provider_id, error = %e, "Failed to persist credentials");
        }
        Some(creds)
    }

    async fn read_store(&self) -> HashMap<String, CredentialRecord> {
        let raw = match fs::read(&self.path).await {
            Ok(r) => r,
            Err(_) => return HashMap::new(),
        };
        serde_json::from_slice(&raw).unwrap_or_default()
    }
}

/// Parse interactive credential input: the literal SKIP, a JSON object, or
/// comma-separated key=value pairs. All required fields must come out
/// non-empty or the input is rejected.
pub fn parse_credential_input(input: &str, required_fields: &[String]) -> Option<CredentialRecord> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("skip") {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(input) {
        let creds: CredentialRecord = map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect();
        if complete(&creds, required_fields) {
            return Some(creds);
        }
        return None;
    }

    let creds: CredentialRecord = input
        .split(',')
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    if complete(&creds, required_fields) {
        return Some(creds);
    }
    None
}

fn complete(creds: &CredentialRecord, required_fields: &[String]) -> bool {
    !creds.is_empty()
        && required_fields
            .iter()
            .all(|f| creds.get(f).map(|v| !v.is_empty()).unwrap_or(false))
}

//
// ================= Tool planner =================
//

fn knowledge_base_description() -> String {
    TOOL_KNOWLEDGE_BASE
        .iter()
        .map(|t| {
            format!(
                "- {}: category={}, purpose={}, example_providers={:?}",
                t.name, t.category, t.purpose, t.example_providers
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_planner_prompt(query: &str, registry: &ProviderRegistry) -> String {
    let configured = registry
        .ids()
        .iter()
        .map(|id| {
            let cat = registry
                .get(id)
                .map(|p| p.category)
                .unwrap_or(KnowledgeCategory::Generic);
            format!("- {}: category={}", id, cat)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let configured = if configured.is_empty() {
        "(none)".to_string()
    } else {
        configured
    };

    format!(
        "You are a tool planner for a financial research assistant.\n\
        Decide which external knowledge sources are most reliable for the question.\n\n\
        Categories: regulatory, financials, market, macro, credit, news, generic.\n\n\
        TOOL KNOWLEDGE BASE:\n{kb}\n\n\
        CONFIGURED PROVIDERS (currently available):\n{cfg}\n\n\
        If the answer is likely available internally (e.g. in the report itself), \
        return recommended_providers: [].\n\n\
        Given the question, output a JSON object strictly in this format:\n\
        {{\n  \"category\": \"<one of the categories>\",\n  \
        \"recommended_providers\": [\"provider1\", \"provider2\"],\n  \
        \"reason\": \"why these providers are suitable\"\n}}\n\n\
        Question: {query}\n\nOutput only valid JSON, no other text.\n",
        kb = knowledge_base_description(),
        cfg = configured,
        query = query,
    )
}

fn plan_from_value(value: &Value) -> Option<ToolPlan> {
    let obj = value.as_object()?;
    let category = obj.get("category")?.as_str()?;
    let providers = obj.get("recommended_providers")?.as_array()?;
    Some(ToolPlan {
        category: KnowledgeCategory::parse_lenient(category),
        recommended_providers: providers
            .iter()
            .filter_map(|p| p.as_str().map(String::from))
            .collect(),
        reason: obj
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string(),
    })
}

fn fallback_plan(registry: &ProviderRegistry) -> ToolPlan {
    let provider = if registry.get("serpapi").is_some() {
        "serpapi"
    } else {
        GENERIC_PROVIDER
    };
    ToolPlan {
        category: KnowledgeCategory::Generic,
        recommended_providers: vec![provider.to_string()],
        reason: "fallback".to_string(),
    }
}

/// One model call mapping the query to a knowledge category and provider
/// recommendations. Parsing is resilient: balanced-brace objects are dug out
/// of prose-wrapped responses, and any failure yields the deterministic
/// fallback plan rather than an error. An empty recommendation list is a
/// valid signal that internal evidence should suffice.
pub async fn plan_tools(
    model: &dyn LanguageModel,
    query: &str,
    registry: &ProviderRegistry,
) -> ToolPlan {
    let prompt = build_planner_prompt(query, registry);
    let raw = match model.generate(&prompt).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Planner model call failed, using fallback plan");
            return fallback_plan(registry);
        }
    };

    let text = raw.trim();
    for m in JSON_OBJECT_RE.find_iter(text) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            if let Some(plan) = plan_from_value(&value) {
                debug!(category = %plan.category, providers = ?plan.recommended_providers, "Tool plan");
                return plan;
            }
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(plan) = plan_from_value(&value) {
            return plan;
        }
    }

    debug!("Planner output unparseable, using fallback plan");
    fallback_plan(registry)
}

//
// ================= Execution =================
//

fn truncate_chars(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}

fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Parse a named-search-API JSON response: organic results as
/// "title: snippet" lines, then the answer box, then raw text.
fn parse_search_api_response(raw: &str, cap: usize) -> String {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return truncate_chars(raw, cap),
    };
    let lines: Vec<String> = parsed["organic_results"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .take(5)
                .filter_map(|r| {
                    let title = r["title"].as_str().unwrap_or("");
                    let snippet = r["snippet"].as_str().unwrap_or("");
                    (!snippet.is_empty()).then(|| format!("{}: {}", title, snippet))
                })
                .collect()
        })
        .unwrap_or_default();
    if !lines.is_empty() {
        return truncate_chars(&lines.join("\n"), cap);
    }
    if let Some(answer) = parsed["answer_box"]["answer"].as_str() {
        return truncate_chars(answer, cap);
    }
    truncate_chars(raw, cap.min(2000))
}

/// Generic JSON response parser: scans common result-bearing keys, joining
/// list values. Non-JSON bodies pass through truncated.
fn parse_generic_response(raw: &str, cap: usize) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        for key in ["snippet", "snippets", "results", "organic_results", "items"] {
            match map.get(key) {
                Some(Value::Array(arr)) if !arr.is_empty() => {
                    let parts: Vec<String> = arr
                        .iter()
                        .take(5)
                        .map(|x| match x {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    return truncate_chars(&parts.join("\n"), cap);
                }
                Some(Value::String(s)) if !s.is_empty() => return truncate_chars(s, cap),
                _ => continue,
            }
        }
        // Instant-answer shape from the zero-credential provider.
        if let Some(abstract_text) = map.get("AbstractText").and_then(|v| v.as_str()) {
            if !abstract_text.is_empty() {
                return truncate_chars(abstract_text, cap);
            }
        }
        if let Some(topics) = map.get("RelatedTopics").and_then(|v| v.as_array()) {
            let parts: Vec<&str> = topics
                .iter()
                .take(5)
                .filter_map(|t| t["Text"].as_str())
                .filter(|s| !s.is_empty())
                .collect();
            if !parts.is_empty() {
                return truncate_chars(&parts.join("\n"), cap);
            }
        }
    }
    truncate_chars(raw, cap)
}

fn error_snippet(provider: &str, category: KnowledgeCategory) -> ExternalSnippet {
    ExternalSnippet {
        provider: provider.to_string(),
        category,
        text: "Tool failed or unavailable".to_string(),
        url: String::new(),
        error: true,
        fetched_at: Utc::now(),
    }
}

/// The whole external layer: registry + credentials + HTTP execution.
pub struct ToolLayer {
    registry: ProviderRegistry,
    credentials: CredentialStore,
    client: Client,
    snippet_cap: usize,
}

impl ToolLayer {
    pub async fn load(settings: &Settings) -> Self {
        let registry = ProviderRegistry::load(&settings.tool_config_path).await;
        let credentials = CredentialStore::new(&settings.credentials_path);
        Self::with_parts(registry, credentials, settings)
    }

    pub fn with_parts(
        registry: ProviderRegistry,
        credentials: CredentialStore,
        settings: &Settings,
    ) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            registry,
            credentials,
            client,
            snippet_cap: settings.snippet_char_cap,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Credential handshake over a plan. Skipped providers are recorded, and
    /// the ready list is never left empty.
    pub async fn resolve(&self, plan: &ToolPlan) -> ResolvedProviders {
        let mut ready = Vec::new();
        let mut skipped = Vec::new();

        for provider in &plan.recommended_providers {
            if provider == GENERIC_PROVIDER {
                ready.push(provider.clone());
                continue;
            }
            let Some(descriptor) = self.registry.get(provider) else {
                info!(provider = %provider, category = %plan.category, "Recommended provider not configured, skipping");
                skipped.push(provider.clone());
                continue;
            };

            let required = descriptor.required_fields.clone();
            if required.is_empty() || self.credentials.resolve(provider, &required).await.is_some()
            {
                ready.push(provider.clone());
                continue;
            }

            info!(provider = %provider, "Credentials missing, starting handshake");
            if self.credentials.prompt_for(provider, &required).await.is_some() {
                ready.push(provider.clone());
            } else {
                skipped.push(provider.clone());
            }
        }

        if ready.is_empty() {
            debug!("All providers skipped, falling back to generic search");
            ready.push(GENERIC_PROVIDER.to_string());
        }
        ResolvedProviders { ready, skipped }
    }

    /// Call ready providers in priority order, stopping at the first one
    /// returning usable text. Failures become structured error records; if
    /// every provider errors, the generic search runs as a last resort.
    pub async fn execute(
        &self,
        ready: &[String],
        query: &str,
        category: KnowledgeCategory,
    ) -> Vec<ExternalSnippet> {
        let mut results = Vec::new();

        for provider in ready {
            let cat = self
                .registry
                .get(provider)
                .map(|d| d.category)
                .unwrap_or(category);
            match self.call_provider(provider, query).await {
                Ok((text, url)) if !text.trim().is_empty() => {
                    debug!(provider = %provider, chars = text.len(), "Provider returned text");
                    results.push(ExternalSnippet {
                        provider: provider.clone(),
                        category: cat,
                        text,
                        url,
                        error: false,
                        fetched_at: Utc::now(),
                    });
                    break;
                }
                Ok(_) => {
                    debug!(provider = %provider, "Provider returned empty text");
                    results.push(error_snippet(provider, cat));
                }
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Provider call failed");
                    results.push(error_snippet(provider, cat));
                }
            }
        }

        let all_failed = results.is_empty() || results.iter().all(|r| r.error);
        if all_failed && !ready.iter().any(|p| p == GENERIC_PROVIDER) {
            match self.generic_search(query).await {
                Ok((text, url)) if !text.trim().is_empty() => {
                    results = vec![ExternalSnippet {
                        provider: GENERIC_PROVIDER.to_string(),
                        category: KnowledgeCategory::Generic,
                        text,
                        url,
                        error: false,
                        fetched_at: Utc::now(),
                    }];
                }
                _ => {
                    results.push(error_snippet(GENERIC_PROVIDER, KnowledgeCategory::Generic));
                }
            }
        }
        results
    }

    /// Plan, resolve, execute. Returns the combined external text and the
    /// provenance-tagged snippets. An empty recommendation list means
    /// internal evidence is expected to suffice, so no search runs.
    pub async fn run_search(
        &self,
        model: &dyn LanguageModel,
        query: &str,
    ) -> (String, Vec<ExternalSnippet>) {
        let plan = plan_tools(model, query, &self.registry).await;
        if plan.recommended_providers.is_empty() {
            return (String::new(), Vec::new());
        }
        let resolved = self.resolve(&plan).await;
        let snippets = self.execute(&resolved.ready, query, plan.category).await;
        (combined_text(&snippets), snippets)
    }

    /// Bypass the planner entirely: run the configured search provider (or
    /// the generic fallback) directly. Used when the document yields no
    /// internal evidence at all.
    pub async fn run_search_forced(&self, query: &str) -> (String, Vec<ExternalSnippet>) {
        let ready = if self.registry.get("serpapi").is_some() {
            vec!["serpapi".to_string()]
        } else {
            vec![GENERIC_PROVIDER.to_string()]
        };
        let snippets = self.execute(&ready, query, KnowledgeCategory::Generic).await;
        (combined_text(&snippets), snippets)
    }

    async fn call_provider(&self, provider: &str, query: &str) -> Result<(String, String)> {
        if provider == GENERIC_PROVIDER {
            return self.generic_search(query).await;
        }
        let descriptor = self.registry.get(provider).ok_or_else(|| {
            OrchestrationError::Unconfigured(format!("provider '{}' not configured", provider))
        })?;
        let template = descriptor.endpoint_template.clone().ok_or_else(|| {
            OrchestrationError::Unconfigured(format!("provider '{}' has no endpoint", provider))
        })?;

        let required = descriptor.required_fields.clone();
        let creds = if required.is_empty() {
            CredentialRecord::new()
        } else {
            self.credentials
                .resolve(provider, &required)
                .await
                .ok_or_else(|| {
                    OrchestrationError::ProviderError(format!(
                        "missing credentials for '{}'",
                        provider
                    ))
                })?
        };

        let mut url = template.replace("{q}", &url_encode(query));
        for (k, v) in &creds {
            url = url.replace(&format!("{{{}}}", k), v);
        }

        let raw = self.fetch(&url).await?;
        let text = if provider.to_lowercase().contains("serpapi") {
            parse_search_api_response(&raw, self.snippet_cap)
        } else {
            parse_generic_response(&raw, self.snippet_cap)
        };
        Ok((text, url))
    }

    /// Zero-credential generic web search. Uses the instant-answer JSON API
    /// unless the registry overrides the endpoint.
    async fn generic_search(&self, query: &str) -> Result<(String, String)> {
        let url = match self
            .registry
            .get(GENERIC_PROVIDER)
            .and_then(|d| d.endpoint_template.clone())
        {
            Some(template) => template.replace("{q}", &url_encode(query)),
            None => format!(
                "https://api.duckduckgo.com/?q={}&format=json&no_html=1",
                url_encode(query)
            ),
        };
        let raw = self.fetch(&url).await?;
        Ok((parse_generic_response(&raw, self.snippet_cap), url))
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| OrchestrationError::Unavailable(format!("provider request: {}", e)))?;
        if !response.status().is_success() {
            return Err(OrchestrationError::Unavailable(format!(
                "provider returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| OrchestrationError::Unavailable(format!("provider body: {}", e)))
    }
}

fn combined_text(snippets: &[ExternalSnippet]) -> String {
    snippets
        .iter()
        .filter(|s| !s.error && !s.text.is_empty())
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
