//! TOML configuration.
//!
//! One immutable [`Config`] tree is loaded at startup and each component
//! receives the section it needs at construction. Every field has a default,
//! so an empty file is a valid (hashing-embedder, no-LLM) configuration.
//!
//! ```toml
//! [storage]
//! documents_dir = "./data/documents"   # one subdirectory per tenant
//! index_dir = "./data/index"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [llm]
//! provider = "openai"
//! model = "llama-3.1-8b-instant"
//! base_url = "https://api.groq.com/openai/v1"
//! api_key_env = "GROQ_API_KEY"
//!
//! [tenants.RC]
//! aliases = ["review contractor", "review contractors"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Per-tenant settings keyed by tenant id.
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root holding one directory of documents per tenant.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
    /// Where index snapshots are persisted, one directory per tenant.
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            documents_dir: default_documents_dir(),
            index_dir: default_index_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_documents_dir() -> PathBuf {
    PathBuf::from("./data/documents")
}
fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/index")
}
fn default_include_globs() -> Vec<String> {
    ["txt", "md", "csv", "json", "xml", "log", "html", "htm", "pdf", "docx", "pptx", "xlsx"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hashing`, `openai`, `ollama`, `local`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    /// `disabled`, `http`, or `local`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            api_key_env: None,
            top_n: default_top_n(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_top_n() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `openai` (any OpenAI-compatible endpoint), `ollama`, or `disabled`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// API base, e.g. `https://api.openai.com/v1` or `http://localhost:11434`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: None,
            api_key_env: default_openai_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    /// Weight of descriptor cosine versus keyword overlap.
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Fan out to all tenants below `min_confidence` instead of asking.
    #[serde(default)]
    pub low_confidence_fanout: bool,
    /// Corpus terms kept per tenant for keyword overlap.
    #[serde(default = "default_descriptor_terms")]
    pub descriptor_terms: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            high_confidence: default_high_confidence(),
            min_confidence: default_min_confidence(),
            low_confidence_fanout: false,
            descriptor_terms: default_descriptor_terms(),
        }
    }
}

fn default_semantic_weight() -> f32 {
    0.7
}
fn default_high_confidence() -> f32 {
    0.75
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_descriptor_terms() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenantConfig {
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Human-readable description folded into the routing descriptor.
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_cutoff")]
    pub similarity_cutoff: f32,
    #[serde(default = "default_true")]
    pub keyword_preamble: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_cutoff: default_similarity_cutoff(),
            keyword_preamble: true,
        }
    }
}

fn default_top_k() -> usize {
    15
}
fn default_similarity_cutoff() -> f32 {
    0.5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EvidenceConfig {
    /// Extra classification-code regexes on top of the built-in ones.
    #[serde(default)]
    pub code_patterns: Vec<String>,
    /// Keep only chunks containing a query literal, instead of reordering.
    #[serde(default)]
    pub drop_unmatched: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_token_budget() -> usize {
    3500
}
fn default_chars_per_token() -> f32 {
    4.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// JSON file to persist entries across restarts.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Re-hash dependent documents on every hit, not just compare size and mtime.
    #[serde(default)]
    pub verify_hash: bool,
    /// Minimum seconds between cache file writes. 0 writes on every change.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: default_ttl_hours(),
            max_entries: default_max_entries(),
            path: None,
            verify_hash: false,
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_flush_interval_secs() -> u64 {
    30
}
fn default_ttl_hours() -> u64 {
    24
}
fn default_max_entries() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_true")]
    pub cleaning: bool,
    /// Hosts `ingest-url` may fetch from (exact or parent domain).
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Reconcile every tenant with storage when the engine opens.
    #[serde(default = "default_true")]
    pub reconcile_on_open: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            cleaning: true,
            allowed_domains: Vec::new(),
            fetch_timeout_secs: default_timeout_secs(),
            reconcile_on_open: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkersConfig {
    /// Worker threads for batch queries; defaults to available parallelism.
    #[serde(default)]
    pub threads: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Aliases for routing: every tenant id plus its configured aliases.
    pub fn alias_pairs<'a>(&self, tenants: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
        alias_pairs(&self.tenants, tenants)
    }
}

/// `(alias, tenant)` pairs for `tenants`, ids included.
pub fn alias_pairs<'a>(
    tenant_configs: &BTreeMap<String, TenantConfig>,
    tenants: impl IntoIterator<Item = &'a str>,
) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for tenant in tenants {
        pairs.push((tenant.to_string(), tenant.to_string()));
        if let Some(tc) = tenant_configs.get(tenant) {
            for alias in &tc.aliases {
                pairs.push((alias.clone(), tenant.to_string()));
            }
        }
    }
    pairs
}

/// Read, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Routing
    let r = &config.routing;
    if !(0.0..=1.0).contains(&r.semantic_weight) {
        bail!("routing.semantic_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&r.min_confidence) || !(0.0..=1.0).contains(&r.high_confidence) {
        bail!("routing thresholds must be in [0.0, 1.0]");
    }
    if r.min_confidence > r.high_confidence {
        bail!("routing.min_confidence must be <= routing.high_confidence");
    }

    // Retrieval, rerank, context
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_cutoff) {
        bail!("retrieval.similarity_cutoff must be in [-1.0, 1.0]");
    }
    if config.reranker.top_n < 1 {
        bail!("reranker.top_n must be >= 1");
    }
    if config.context.token_budget == 0 {
        bail!("context.token_budget must be > 0");
    }
    if config.context.chars_per_token <= 0.0 {
        bail!("context.chars_per_token must be > 0");
    }

    // Providers
    match config.embedding.provider.as_str() {
        "hashing" | "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, local, or disabled.",
            other
        ),
    }
    match config.reranker.provider.as_str() {
        "disabled" | "local" => {}
        "http" => {
            if config.reranker.url.is_none() {
                bail!("reranker.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown reranker provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }
    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.llm.model.is_none() {
                bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be openai, ollama, or disabled.",
            other
        ),
    }

    // Evidence patterns must compile
    for pattern in &config.evidence.code_patterns {
        regex::Regex::new(pattern)
            .with_context(|| format!("evidence.code_patterns: invalid regex '{}'", pattern))?;
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => bail!("logging.format must be pretty or json, got '{}'", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let c = parse_config("").unwrap();
        assert_eq!(c.chunking.chunk_size, 1024);
        assert_eq!(c.chunking.chunk_overlap, 100);
        assert_eq!(c.embedding.provider, "hashing");
        assert_eq!(c.reranker.provider, "disabled");
        assert_eq!(c.retrieval.top_k, 15);
        assert!((c.routing.semantic_weight - 0.7).abs() < 1e-6);
        assert_eq!(c.context.token_budget, 3500);
        assert_eq!(c.cache.max_entries, 1000);
    }

    #[test]
    fn tenant_aliases_parse() {
        let c = parse_config(
            r#"
[tenants.RC]
aliases = ["review contractor", "review contractors"]

[tenants.HIH]
aliases = ["health information handler", "handler"]
"#,
        )
        .unwrap();
        let pairs = c.alias_pairs(["HIH", "RC"]);
        assert!(pairs.contains(&("RC".into(), "RC".into())));
        assert!(pairs.contains(&("handler".into(), "HIH".into())));
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn rejects_overlap_not_below_size() {
        let err = parse_config("[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err =
            parse_config("[routing]\nmin_confidence = 0.8\nhigh_confidence = 0.6\n").unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn rejects_unknown_provider_and_missing_model() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse_config("[embedding]\nprovider = \"openai\"\ndims = 8\n").is_err());
        assert!(parse_config("[llm]\nprovider = \"ollama\"\n").is_err());
        assert!(parse_config("[reranker]\nprovider = \"http\"\n").is_err());
    }

    #[test]
    fn rejects_bad_code_pattern() {
        let err = parse_config("[evidence]\ncode_patterns = [\"(\"]\n").unwrap_err();
        assert!(format!("{:#}", err).contains("code_patterns"));
    }
}
