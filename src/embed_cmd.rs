//! Embedding backfill.
//!
//! `voltline embed pending` finds active items without an embedding (new
//! items ingested while the provider was down, or disabled) and embeds them
//! in batches. A failed batch is reported and skipped; the items stay
//! pending for the next run.

use anyhow::{bail, Result};
use tracing::warn;

use voltline_core::embedding::EmbeddingProvider;
use voltline_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::ingest::embedding_text;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub pending: u64,
    pub embedded: u64,
    pub failed: u64,
}

/// Embed up to `limit` pending items, `batch_size` at a time.
pub async fn embed_pending(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    limit: Option<usize>,
    batch_size: usize,
) -> Result<EmbedReport> {
    let pending = store
        .items_missing_embedding(limit.unwrap_or(i64::MAX as usize))
        .await?;

    let mut report = EmbedReport {
        pending: pending.len() as u64,
        ..Default::default()
    };

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch
            .iter()
            .map(|item| embedding_text(&item.title, &item.content))
            .collect();

        match provider.embed(&texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    store.set_embedding(item.id, vec).await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, items = batch.len(), "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    if dry_run {
        let stats = store.stats().await?;
        let pending = match limit {
            Some(lim) => (stats.pending_embeddings as usize).min(lim),
            None => stats.pending_embeddings as usize,
        };
        println!("embed pending (dry-run)");
        println!("  items needing embeddings: {}", pending);
        pool.close().await;
        return Ok(());
    }

    let report = embed_pending(&store, provider.as_ref(), limit, batch_size).await?;

    println!("embed pending");
    if report.pending == 0 {
        println!("  all items up to date");
    } else {
        println!("  total pending: {}", report.pending);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use voltline_core::error::EmbeddingError;
    use voltline_core::models::{ContentType, NewItem};
    use voltline_core::store::memory::InMemoryStore;

    /// Fails every call after the first `ok_calls`.
    struct FlakyProvider {
        ok_calls: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_calls {
                return Err(EmbeddingError::Provider("503".into()));
            }
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    async fn seed(store: &InMemoryStore, n: usize) {
        for i in 0..n {
            store
                .upsert_item(&NewItem {
                    content_type: ContentType::Faq,
                    title: format!("Pregunta {}", i),
                    content: "Respuesta".into(),
                    external_id: Some(format!("doc_faq_{}", i)),
                    metadata: json!({}),
                    content_hash: format!("h{}", i),
                    embedding: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn backfills_every_pending_item() {
        let store = InMemoryStore::new();
        seed(&store, 5).await;
        let provider = FlakyProvider {
            ok_calls: usize::MAX,
            calls: AtomicUsize::new(0),
        };

        let report = embed_pending(&store, &provider, None, 2).await.unwrap();
        assert_eq!(report, EmbedReport { pending: 5, embedded: 5, failed: 0 });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.stats().await.unwrap().pending_embeddings, 0);
    }

    #[tokio::test]
    async fn failed_batches_stay_pending() {
        let store = InMemoryStore::new();
        seed(&store, 4).await;
        let provider = FlakyProvider {
            ok_calls: 1,
            calls: AtomicUsize::new(0),
        };

        let report = embed_pending(&store, &provider, None, 2).await.unwrap();
        assert_eq!(report, EmbedReport { pending: 4, embedded: 2, failed: 2 });
        assert_eq!(store.stats().await.unwrap().pending_embeddings, 2);
    }

    #[tokio::test]
    async fn limit_caps_the_run() {
        let store = InMemoryStore::new();
        seed(&store, 4).await;
        let provider = FlakyProvider {
            ok_calls: usize::MAX,
            calls: AtomicUsize::new(0),
        };

        let report = embed_pending(&store, &provider, Some(3), 10).await.unwrap();
        assert_eq!(report.embedded, 3);
        assert_eq!(store.stats().await.unwrap().pending_embeddings, 1);
    }
}
