//! Query-embedding cache.
//!
//! [`CachedProvider`] wraps any [`EmbeddingProvider`] with a moka cache
//! keyed by the exact input text. Entries expire after `cache_ttl_secs`
//! and the cache holds at most `cache_capacity` vectors. Chatbot traffic
//! repeats the same short queries a lot, so this saves a provider round
//! trip on most searches.
//!
//! The cache is owned by whoever builds the provider (the
//! [`Retriever`](crate::search::Retriever)); there is no process-wide
//! instance. [`CachedProvider::invalidate_all`] drops every entry, e.g.
//! after switching embedding models.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;

use voltline_core::embedding::EmbeddingProvider;
use voltline_core::error::EmbeddingError;

pub struct CachedProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Cache<String, Arc<Vec<f32>>>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Cached vector for `text`, if any.
    pub fn cached(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.cache.get(text)
    }
}

#[async_trait]
impl EmbeddingProvider for CachedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    /// Serve hits from the cache and send only the misses to the wrapped
    /// provider, preserving input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out: Vec<Option<Vec<f32>>> = texts
            .iter()
            .map(|t| self.cache.get(t).map(|v| v.as_ref().clone()))
            .collect();

        let misses: Vec<String> = texts
            .iter()
            .zip(&out)
            .filter(|(_, hit)| hit.is_none())
            .map(|(t, _)| t.clone())
            .collect();

        if !misses.is_empty() {
            let fresh = self.inner.embed(&misses).await?;
            if fresh.len() != misses.len() {
                return Err(EmbeddingError::Provider(format!(
                    "expected {} embeddings, got {}",
                    misses.len(),
                    fresh.len()
                )));
            }
            let mut fresh = fresh.into_iter();
            for (slot, text) in out.iter_mut().zip(texts) {
                if slot.is_none() {
                    if let Some(vec) = fresh.next() {
                        self.cache.insert(text.clone(), Arc::new(vec.clone()));
                        *slot = Some(vec);
                    }
                }
            }
        }

        out.into_iter()
            .map(|v| v.ok_or(EmbeddingError::EmptyResponse))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds each text as `[len, 1.0]` and counts how many texts it saw.
    struct CountingProvider {
        seen: AtomicUsize,
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
            self.seen.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn setup() -> (Arc<CountingProvider>, CachedProvider) {
        let inner = Arc::new(CountingProvider {
            seen: AtomicUsize::new(0),
        });
        let cached = CachedProvider::new(inner.clone(), Duration::from_secs(60), 100);
        (inner, cached)
    }

    #[tokio::test]
    async fn repeated_query_hits_the_cache() {
        let (inner, cached) = setup();
        let a = cached.embed_one("diferencial").await.unwrap();
        let b = cached.embed_one("diferencial").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.seen.load(Ordering::SeqCst), 1);
        assert!(cached.cached("diferencial").is_some());
    }

    #[tokio::test]
    async fn only_misses_reach_the_provider_and_order_is_kept() {
        let (inner, cached) = setup();
        cached.embed_one("led").await.unwrap();
        let texts = vec!["cable".to_string(), "led".to_string(), "pia".to_string()];
        let vecs = cached.embed(&texts).await.unwrap();
        assert_eq!(vecs[0][0], 5.0);
        assert_eq!(vecs[1][0], 3.0);
        assert_eq!(vecs[2][0], 3.0);
        assert_eq!(inner.seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidate_all_forces_a_new_call() {
        let (inner, cached) = setup();
        cached.embed_one("ip65").await.unwrap();
        cached.invalidate_all();
        assert!(cached.cached("ip65").is_none());
        cached.embed_one("ip65").await.unwrap();
        assert_eq!(inner.seen.load(Ordering::SeqCst), 2);
    }
}
