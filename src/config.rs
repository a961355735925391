//! Configuration parsing and validation.
//!
//! Voltline is configured with a single TOML file (default
//! `./config/voltline.toml`). Only `[db]` is required; every other section
//! and key falls back to a serde default.
//!
//! ```toml
//! [db]
//! path = "./data/voltline.sqlite"
//!
//! [retrieval]
//! vector_weight = 0.6
//! text_weight = 0.4
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [sources.documents]
//! root = "./knowledge"
//! ```
//!
//! [`load_config`] rejects configurations that would make retrieval
//! misbehave (weights that do not sum to one, a per-surface timeout longer
//! than the overall budget, an enabled provider without model or dims).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use voltline_core::search::RetrievalParams;

use crate::vector_index::AnnParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long to wait for a pooled connection before the store is
    /// reported unavailable.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_ms() -> u64 {
    3000
}

/// In-memory vector index. From `ann_threshold` embedded items up, vector
/// search walks an HNSW graph instead of scanning every vector.
#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    #[serde(default = "default_ann_threshold")]
    pub ann_threshold: usize,
    #[serde(default = "default_hnsw_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            ann_threshold: default_ann_threshold(),
            m: default_hnsw_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

impl VectorIndexConfig {
    pub fn to_params(&self) -> AnnParams {
        AnnParams {
            threshold: self.ann_threshold,
            max_nb_connection: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
        }
    }
}

fn default_ann_threshold() -> usize {
    AnnParams::default().threshold
}
fn default_hnsw_m() -> usize {
    AnnParams::default().max_nb_connection
}
fn default_ef_construction() -> usize {
    AnnParams::default().ef_construction
}
fn default_ef_search() -> usize {
    AnnParams::default().ef_search
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Threshold for standalone vector search.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Threshold for the vector surface inside hybrid fusion.
    #[serde(default)]
    pub hybrid_min_similarity: f32,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_surface_timeout_ms")]
    pub surface_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
            rrf_k: default_rrf_k(),
            candidate_multiplier: default_candidate_multiplier(),
            final_limit: default_final_limit(),
            max_limit: default_max_limit(),
            min_similarity: default_min_similarity(),
            hybrid_min_similarity: 0.0,
            max_query_chars: default_max_query_chars(),
            timeout_ms: default_timeout_ms(),
            surface_timeout_ms: default_surface_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    /// Tuning parameters for the core ranker.
    pub fn to_params(&self) -> RetrievalParams {
        RetrievalParams {
            vector_weight: self.vector_weight,
            text_weight: self.text_weight,
            rrf_k: self.rrf_k,
            candidate_multiplier: self.candidate_multiplier,
            default_limit: self.final_limit,
            max_limit: self.max_limit,
            min_similarity: self.min_similarity,
            hybrid_min_similarity: self.hybrid_min_similarity,
            max_query_chars: self.max_query_chars,
            timeout: Duration::from_millis(self.timeout_ms),
            surface_timeout: Duration::from_millis(self.surface_timeout_ms),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.6
}
fn default_text_weight() -> f64 {
    0.4
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_final_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    100
}
fn default_min_similarity() -> f32 {
    0.5
}
fn default_max_query_chars() -> usize {
    1000
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_surface_timeout_ms() -> u64 {
    2000
}

/// Optional override of the built-in term vocabulary.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct VocabularyConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: default_target_chars(),
        }
    }
}

fn default_target_chars() -> usize {
    voltline_core::chunk::DEFAULT_TARGET_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of the provider API. Each provider has its own default.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Lifetime of cached query embeddings.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_cache_capacity() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub products: Option<ProductsSourceConfig>,
    pub documents: Option<DocumentsSourceConfig>,
}

/// WooCommerce product export (JSON array of products).
#[derive(Debug, Deserialize, Clone)]
pub struct ProductsSourceConfig {
    pub path: PathBuf,
}

/// Directory of markdown knowledge documents.
#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

/// Read, parse and validate the config file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        bail!("db.max_connections must be >= 1");
    }

    if config.chunking.target_chars == 0 {
        bail!("chunking.target_chars must be > 0");
    }

    let v = &config.vector_index;
    if v.m < 2 {
        bail!("vector_index.m must be >= 2");
    }
    if v.ef_construction == 0 || v.ef_search == 0 {
        bail!("vector_index.ef_construction and vector_index.ef_search must be >= 1");
    }

    let r = &config.retrieval;
    for (name, w) in [
        ("vector_weight", r.vector_weight),
        ("text_weight", r.text_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if (r.vector_weight + r.text_weight - 1.0).abs() > 1e-6 {
        bail!(
            "retrieval.vector_weight + retrieval.text_weight must equal 1.0 (got {})",
            r.vector_weight + r.text_weight
        );
    }
    if r.rrf_k < 1.0 {
        bail!("retrieval.rrf_k must be >= 1");
    }
    if r.candidate_multiplier < 1 {
        bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if r.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if r.max_limit < r.final_limit {
        bail!("retrieval.max_limit must be >= retrieval.final_limit");
    }
    for (name, s) in [
        ("min_similarity", r.min_similarity),
        ("hybrid_min_similarity", r.hybrid_min_similarity),
    ] {
        if !(-1.0..=1.0).contains(&s) {
            bail!("retrieval.{} must be in [-1.0, 1.0]", name);
        }
    }
    if r.max_query_chars == 0 {
        bail!("retrieval.max_query_chars must be > 0");
    }
    if r.surface_timeout_ms == 0 || r.surface_timeout_ms >= r.timeout_ms {
        bail!("retrieval.surface_timeout_ms must be > 0 and < retrieval.timeout_ms");
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if e.is_enabled() {
        if e.dims.is_none() || e.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                e.provider
            );
        }
        if e.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "[db]\npath = \"./data/voltline.sqlite\"\n";

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.db.max_connections, 5);
        assert_eq!(cfg.retrieval.final_limit, 10);
        assert_eq!(cfg.chunking.target_chars, 1500);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.server.bind, "127.0.0.1:8080");
        assert!(cfg.sources.products.is_none());

        let params = cfg.retrieval.to_params();
        assert_eq!(params.rrf_k, 60.0);
        assert_eq!(params.candidate_multiplier, 4);
        assert_eq!(params.timeout, Duration::from_secs(5));
        assert_eq!(params.surface_timeout, Duration::from_secs(2));
    }

    #[test]
    fn weights_must_sum_to_one() {
        let cfg = format!("{}[retrieval]\nvector_weight = 0.7\ntext_weight = 0.4\n", MINIMAL);
        let err = parse_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("must equal 1.0"));

        let cfg = format!("{}[retrieval]\nvector_weight = 0.3\ntext_weight = 0.7\n", MINIMAL);
        assert!(parse_config(&cfg).is_ok());
    }

    #[test]
    fn surface_timeout_must_fit_in_overall_timeout() {
        let cfg = format!(
            "{}[retrieval]\ntimeout_ms = 1000\nsurface_timeout_ms = 1000\n",
            MINIMAL
        );
        assert!(parse_config(&cfg).is_err());
    }

    #[test]
    fn enabled_provider_requires_model_and_dims() {
        let cfg = format!("{}[embedding]\nprovider = \"openai\"\ndims = 8\n", MINIMAL);
        assert!(parse_config(&cfg).unwrap_err().to_string().contains("model"));

        let cfg = format!(
            "{}[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\n",
            MINIMAL
        );
        assert!(parse_config(&cfg).unwrap_err().to_string().contains("dims"));

        let cfg = format!(
            "{}[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
            MINIMAL
        );
        assert!(parse_config(&cfg).unwrap().embedding.is_enabled());
    }

    #[test]
    fn vector_index_section() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.vector_index.to_params(), AnnParams::default());

        let cfg = format!("{}[vector_index]
ann_threshold = 500
ef_search = 128
", MINIMAL);
        let params = parse_config(&cfg).unwrap().vector_index.to_params();
        assert_eq!(params.threshold, 500);
        assert_eq!(params.ef_search, 128);
        assert_eq!(params.max_nb_connection, 16);

        let cfg = format!("{}[vector_index]
m = 1
", MINIMAL);
        assert!(parse_config(&cfg).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let cfg = format!("{}[embedding]\nprovider = \"local\"\n", MINIMAL);
        assert!(parse_config(&cfg).is_err());
    }

    #[test]
    fn document_source_defaults_to_markdown() {
        let cfg = format!("{}[sources.documents]\nroot = \"./knowledge\"\n", MINIMAL);
        let docs = parse_config(&cfg).unwrap().sources.documents.unwrap();
        assert_eq!(docs.include_globs, vec!["**/*.md"]);
        assert!(!docs.follow_symlinks);
    }
}
