//! Retrieval service and the `voltline search` / `voltline terms` commands.
//!
//! [`Retriever`] owns everything a query needs: the store, the (cached)
//! query-embedding provider, the term extractor and the retrieval
//! parameters. Both the CLI and the HTTP server go through it.
//!
//! Query embedding happens here, not in the ranker. When it fails, hybrid
//! search carries on with the exact-title and full-text surfaces only;
//! vector search has nothing to fall back on and fails with
//! [`RetrievalError::EmbeddingUnavailable`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use voltline_core::embedding::EmbeddingProvider;
use voltline_core::error::{EmbeddingError, RetrievalError};
use voltline_core::models::{ContentType, IndexedItem, SearchHit};
use voltline_core::search::{self as ranker, RankedItem, RetrievalParams, SearchRequest};
use voltline_core::store::Store;
use voltline_core::terms::{TermExtractor, Vocabulary};

use crate::cache::CachedProvider;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

/// Search modes accepted by the CLI.
const MODES: [&str; 3] = ["hybrid", "vector", "text"];

pub struct Retriever {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    extractor: TermExtractor,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        extractor: TermExtractor,
        params: RetrievalParams,
    ) -> Self {
        Self {
            store,
            embedder,
            extractor,
            params,
        }
    }

    /// Build a retriever over the configured SQLite database.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store: Arc<dyn Store> =
            Arc::new(SqliteStore::new(pool).with_ann_params(config.vector_index.to_params()));

        let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.is_enabled() {
            let inner = embedding::create_provider(&config.embedding)?;
            Some(Arc::new(CachedProvider::new(
                inner,
                Duration::from_secs(config.embedding.cache_ttl_secs),
                config.embedding.cache_capacity,
            )))
        } else {
            None
        };

        let extractor = TermExtractor::new(load_vocabulary(config)?);

        Ok(Self::new(
            store,
            embedder,
            extractor,
            config.retrieval.to_params(),
        ))
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn extractor(&self) -> &TermExtractor {
        &self.extractor
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Model used for query embeddings, if any.
    pub fn embedding_model(&self) -> Option<&str> {
        self.embedder.as_deref().map(|e| e.model_name())
    }

    pub async fn hybrid_search(
        &self,
        query: &str,
        content_types: &[ContentType],
        limit: Option<usize>,
    ) -> Result<Vec<RankedItem>, RetrievalError> {
        ranker::validate_query(query, false, &self.params)?;
        let query_vec = match self.embed_query(query).await {
            Ok(vec) => Some(vec),
            Err(EmbeddingError::Disabled) => None,
            Err(e) => {
                warn!(error = %e, "query embedding failed; hybrid search runs lexical-only");
                None
            }
        };

        let req = SearchRequest {
            query,
            query_vec: query_vec.as_deref(),
            content_types,
            limit,
            params: &self.params,
        };
        ranker::hybrid_search(self.store.as_ref(), &self.extractor, &req).await
    }

    pub async fn vector_search(
        &self,
        query: &str,
        content_types: &[ContentType],
        limit: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        ranker::validate_query(query, false, &self.params)?;
        let query_vec = self.embed_query(query).await?;
        ranker::vector_search(
            self.store.as_ref(),
            &query_vec,
            content_types,
            limit,
            min_similarity,
            &self.params,
        )
        .await
    }

    pub async fn text_search(
        &self,
        query: &str,
        content_types: &[ContentType],
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        ranker::text_search(self.store.as_ref(), query, content_types, limit, &self.params).await
    }

    pub async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<IndexedItem>, RetrievalError> {
        ranker::get_by_external_id(self.store.as_ref(), external_id, &self.params).await
    }

    /// Embed the query text, bounded by the per-surface timeout.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        let Some(embedder) = &self.embedder else {
            return Err(EmbeddingError::Disabled);
        };
        let query = query.trim();
        match tokio::time::timeout(self.params.surface_timeout, embedder.embed_one(query)).await {
            Ok(result) => {
                let vec = result?;
                debug!(dims = vec.len(), "query embedded");
                Ok(vec)
            }
            Err(_) => Err(EmbeddingError::Provider(format!(
                "query embedding timed out after {:?}",
                self.params.surface_timeout
            ))),
        }
    }
}

/// The configured vocabulary file, or the built-in one.
pub fn load_vocabulary(config: &Config) -> Result<Vocabulary> {
    match &config.vocabulary.path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read vocabulary: {}", path.display()))?;
            Vocabulary::from_toml_str(&raw)
                .with_context(|| format!("Invalid vocabulary file: {}", path.display()))
        }
        None => Ok(Vocabulary::builtin()),
    }
}

/// Parse `--type` values into content types.
pub fn parse_content_types(values: &[String]) -> Result<Vec<ContentType>> {
    values
        .iter()
        .map(|v| v.parse::<ContentType>().map_err(anyhow::Error::from))
        .collect()
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    types: &[String],
    limit: Option<usize>,
    min_similarity: Option<f32>,
) -> Result<()> {
    if !MODES.contains(&mode) {
        bail!(
            "Unknown search mode: {}. Use hybrid, vector, or text.",
            mode
        );
    }
    if mode == "vector" && !config.embedding.is_enabled() {
        bail!("Mode 'vector' requires embeddings. Set [embedding] provider in config.");
    }

    let content_types = parse_content_types(types)?;
    let retriever = Retriever::from_config(config).await?;

    match mode {
        "hybrid" => {
            let results = retriever
                .hybrid_search(query, &content_types, limit)
                .await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                let label = match r.matched_term() {
                    Some(term) => format!("exact:{}", term),
                    None => format!("{:.4}", r.score()),
                };
                print_item(i, &label, &r.item);
            }
        }
        _ => {
            let hits = if mode == "vector" {
                retriever
                    .vector_search(query, &content_types, limit, min_similarity)
                    .await?
            } else {
                retriever.text_search(query, &content_types, limit).await?
            };
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                print_item(i, &format!("{:.4}", hit.score), &hit.item);
            }
        }
    }

    Ok(())
}

fn print_item(i: usize, label: &str, item: &IndexedItem) {
    let meta = item.metadata_view();
    println!(
        "{}. [{}] {} / {}",
        i + 1,
        label,
        item.content_type,
        item.title
    );
    if let Some(ext) = &item.external_id {
        println!("    external_id: {}", ext);
    }
    if let Some(price) = meta.price {
        let sale = if meta.on_sale() { " (oferta)" } else { "" };
        println!("    price: {:.2}{}", price, sale);
    }
    if let Some(url) = &meta.permalink {
        println!("    url: {}", url);
    }
    println!("    excerpt: \"{}\"", excerpt(&item.content, 160));
    println!();
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Print the technical terms extracted from a query.
pub fn run_terms(config: &Config, query: &str) -> Result<()> {
    let vocabulary = load_vocabulary(config)?;
    let version = vocabulary.version().to_string();
    let terms = TermExtractor::new(vocabulary).extract(query);

    println!("vocabulary: {}", version);
    if terms.is_empty() {
        println!("No terms.");
    }
    for (i, term) in terms.iter().enumerate() {
        println!("{}. {}", i + 1, term);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use voltline_core::models::NewItem;
    use voltline_core::search::MatchType;
    use voltline_core::store::memory::InMemoryStore;

    /// Embeds every text as the same unit vector, or fails.
    struct StubProvider {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.fail {
                return Err(EmbeddingError::Provider("connection refused".into()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    async fn store_with_catalogue() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let items = [
            ("product_1", "Diferencial DPN 2P 25A 30mA", "Protección diferencial para vivienda.", vec![0.0, 1.0]),
            ("product_2", "Magnetotérmico 2P 16A", "Protección contra sobrecargas. Compatible con diferencial.", vec![1.0, 0.0]),
            ("product_3", "Bombilla LED E27 10W", "Luz cálida.", vec![0.6, 0.8]),
        ];
        for (ext, title, content, vec) in items {
            store
                .upsert_item(&NewItem {
                    content_type: ContentType::Product,
                    title: title.into(),
                    content: content.into(),
                    external_id: Some(ext.into()),
                    metadata: json!({ "price": "10.00" }),
                    content_hash: ext.into(),
                    embedding: Some(vec),
                })
                .await
                .unwrap();
        }
        store
    }

    fn retriever(store: Arc<InMemoryStore>, provider: Option<StubProvider>) -> Retriever {
        Retriever::new(
            store,
            provider.map(|p| Arc::new(p) as Arc<dyn EmbeddingProvider>),
            TermExtractor::new(Vocabulary::builtin()),
            RetrievalParams::default(),
        )
    }

    #[tokio::test]
    async fn exact_title_match_comes_first() {
        let r = retriever(store_with_catalogue().await, Some(StubProvider { fail: false }));
        let results = r.hybrid_search("quiero un diferencial DPN", &[], None).await.unwrap();
        assert_eq!(results[0].item.external_id.as_deref(), Some("product_1"));
        assert_eq!(results[0].match_type(), MatchType::ExactTitle);
    }

    #[tokio::test]
    async fn hybrid_degrades_to_lexical_when_embedding_fails() {
        let r = retriever(store_with_catalogue().await, Some(StubProvider { fail: true }));
        let results = r.hybrid_search("sobrecargas", &[], None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item.external_id.as_deref(), Some("product_2"));
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn malformed_queries_are_rejected_before_embedding() {
        let provider = Arc::new(CountingProvider::default());
        let r = Retriever::new(
            store_with_catalogue().await,
            Some(Arc::clone(&provider) as Arc<dyn EmbeddingProvider>),
            TermExtractor::new(Vocabulary::builtin()),
            RetrievalParams::default(),
        );

        let err = r.hybrid_search("   ", &[], None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::MalformedQuery(_)));
        let err = r.vector_search("", &[], None, None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::MalformedQuery(_)));
        let long = "a".repeat(RetrievalParams::default().max_query_chars + 1);
        let err = r.hybrid_search(&long, &[], None).await.unwrap_err();
        assert!(matches!(err, RetrievalError::MalformedQuery(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        r.hybrid_search("diferencial", &[], None).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn vector_search_needs_an_embedding() {
        let failing = retriever(store_with_catalogue().await, Some(StubProvider { fail: true }));
        let err = failing.vector_search("luz", &[], None, None).await.unwrap_err();
        assert_eq!(err.code(), "embedding_unavailable");

        let disabled = retriever(store_with_catalogue().await, None);
        let err = disabled.vector_search("luz", &[], None, None).await.unwrap_err();
        assert_eq!(err.code(), "embedding_unavailable");
        assert!(disabled.embedding_model().is_none());
    }

    #[tokio::test]
    async fn vector_search_ranks_by_similarity() {
        let r = retriever(store_with_catalogue().await, Some(StubProvider { fail: false }));
        let hits = r.vector_search("protección", &[], None, Some(0.5)).await.unwrap();
        let ids: Vec<_> = hits.iter().filter_map(|h| h.item.external_id.as_deref()).collect();
        assert_eq!(ids, vec!["product_2", "product_3"]);
    }

    #[tokio::test]
    async fn lookups_and_type_filters() {
        let r = retriever(store_with_catalogue().await, None);
        let item = r.get_by_external_id("product_3").await.unwrap().unwrap();
        assert_eq!(item.title, "Bombilla LED E27 10W");
        assert!(r.get_by_external_id("product_99").await.unwrap().is_none());

        let hits = r.text_search("protección", &[ContentType::Faq], None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn content_type_flags_are_validated() {
        let types = parse_content_types(&["product".into(), "faq".into()]).unwrap();
        assert_eq!(types, vec![ContentType::Product, ContentType::Faq]);
        assert!(parse_content_types(&["catalogue".into()]).is_err());
    }

    #[test]
    fn excerpts_are_flattened_and_cut() {
        assert_eq!(excerpt("uno\ndos", 20), "uno dos");
        assert_eq!(excerpt("abcdefghij", 4), "abcd…");
    }
}
