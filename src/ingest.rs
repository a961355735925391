//! Ingestion pipeline orchestration.
//!
//! Coordinates the sync flow for each source: scan → hash → chunk →
//! embed → upsert → retire.
//!
//! - Unchanged documents (same content hash, already embedded) cost one
//!   natural-key lookup and no provider call.
//! - Inline embedding failures are non-fatal: the item is stored without a
//!   vector and reported as pending for `voltline embed pending`.
//! - After re-chunking, chunks beyond the new chunk count are retired, and
//!   so is the old `(external_id, content_type)` of a document whose type
//!   changed.
//! - A full sync retires every item the source owns but no longer produces.
//!   A `--limit`ed sync never retires, since it did not see the whole source.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{info, warn};

use voltline_core::chunk::{base_external_id, chunk_external_id, chunk_text, content_hash};
use voltline_core::embedding::EmbeddingProvider;
use voltline_core::models::{ContentType, NewItem};
use voltline_core::store::{ItemKey, Store, UpsertOutcome};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::SourceDocument;
use crate::sources::{self, SourceKind};
use crate::sqlite_store::SqliteStore;

/// Knobs for one sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub target_chars: usize,
    pub batch_size: usize,
    /// Content types owned by the source being synced.
    pub owned_types: Vec<ContentType>,
    /// Retire owned items the source no longer produces.
    pub retire_missing: bool,
}

/// Counters reported at the end of a sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub documents: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub retired: u64,
    pub embeddings_written: u64,
    pub embeddings_pending: u64,
}

/// Text sent to the embedding provider for an item.
pub fn embedding_text(title: &str, content: &str) -> String {
    format!("{}\n\n{}", title, content)
}

/// Corpus items for one source document, in chunk order.
pub fn document_items(doc: &SourceDocument, target_chars: usize) -> Vec<NewItem> {
    let doc_hash = content_hash(&[
        doc.content_type.as_str(),
        &doc.title,
        &doc.body,
        &doc.metadata.to_string(),
    ]);
    let chunks = chunk_text(&doc.body, target_chars);
    let total = chunks.len();

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut metadata = doc.metadata.clone();
            if total > 1 {
                if let Value::Object(map) = &mut metadata {
                    map.insert("chunk_index".into(), json!(index));
                    map.insert("chunk_total".into(), json!(total));
                    map.insert("base_external_id".into(), json!(doc.external_id));
                }
            }
            NewItem {
                content_type: doc.content_type,
                title: doc.title.clone(),
                content_hash: content_hash(&[&doc_hash, &index.to_string(), &total.to_string()]),
                content: chunk,
                external_id: Some(chunk_external_id(&doc.external_id, index, total)),
                metadata,
                embedding: None,
            }
        })
        .collect()
}

/// Write `docs` into `store`, embedding new or changed items with `provider`.
pub async fn sync_documents(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    docs: &[SourceDocument],
    opts: &SyncOptions,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    // Active keys grouped by document, before this run.
    let mut before: BTreeMap<String, Vec<ItemKey>> = BTreeMap::new();
    for key in store.list_active_keys(&opts.owned_types).await? {
        before
            .entry(base_external_id(&key.external_id).to_string())
            .or_default()
            .push(key);
    }

    let mut seen_bases: HashSet<&str> = HashSet::new();
    let mut produced: HashSet<ItemKey> = HashSet::new();

    for doc in docs {
        seen_bases.insert(doc.external_id.as_str());
        let mut items = document_items(doc, opts.target_chars);

        // Only new or changed items, or items still missing a vector, are embedded.
        let mut needs_embedding = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let ext = item.external_id.as_deref().unwrap_or_default();
            let fresh = match store.find_by_key(ext, item.content_type).await? {
                Some(existing) => {
                    existing.is_active
                        && existing.has_embedding
                        && existing.content_hash == item.content_hash
                }
                None => false,
            };
            if !fresh {
                needs_embedding.push(i);
            }
        }
        embed_items(provider, &mut items, &needs_embedding, opts.batch_size).await;

        for (i, item) in items.iter().enumerate() {
            let result = store.upsert_item(item).await?;
            match result.outcome {
                UpsertOutcome::Created => report.created += 1,
                UpsertOutcome::Updated => report.updated += 1,
                UpsertOutcome::Unchanged => report.unchanged += 1,
            }
            if item.embedding.is_some() {
                report.embeddings_written += 1;
            } else if needs_embedding.contains(&i) {
                report.embeddings_pending += 1;
            }
            if let Some(ext) = &item.external_id {
                produced.insert(ItemKey::new(ext.clone(), item.content_type));
            }
        }

        report.documents += 1;
    }

    for (base, previous) in &before {
        if seen_bases.contains(base.as_str()) {
            // Chunks left over from a longer version, or the old type of a
            // document whose type changed.
            let stale: Vec<ItemKey> = previous
                .iter()
                .filter(|key| !produced.contains(*key))
                .cloned()
                .collect();
            if !stale.is_empty() {
                report.retired += store.soft_delete(&stale).await?;
            }
        } else if opts.retire_missing {
            report.retired += store
                .soft_delete_document(base, &opts.owned_types)
                .await?;
        }
    }

    Ok(report)
}

/// Embed `items[i]` for every `i` in `indices`, in batches. Failures leave
/// the affected items without a vector.
async fn embed_items(
    provider: &dyn EmbeddingProvider,
    items: &mut [NewItem],
    indices: &[usize],
    batch_size: usize,
) {
    if provider.dims() == 0 {
        return;
    }
    for batch in indices.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch
            .iter()
            .map(|&i| embedding_text(&items[i].title, &items[i].content))
            .collect();
        match provider.embed(&texts).await {
            Ok(vectors) => {
                for (&i, vector) in batch.iter().zip(vectors) {
                    items[i].embedding = Some(vector);
                }
            }
            Err(e) => {
                warn!(error = %e, items = batch.len(), "inline embedding failed; items left pending");
            }
        }
    }
}

pub async fn run_ingest(
    config: &Config,
    source: &str,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    let kinds = sources::resolve(source, config)?;

    for kind in kinds {
        ingest_source(config, kind, dry_run, limit).await?;
    }
    Ok(())
}

async fn ingest_source(
    config: &Config,
    kind: SourceKind,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    let mut docs = kind.scan(config)?;
    let found = docs.len();

    if let Some(lim) = limit {
        docs.truncate(lim);
    }

    if dry_run {
        let items: usize = docs
            .iter()
            .map(|d| chunk_text(&d.body, config.chunking.target_chars).len())
            .sum();
        println!("ingest {} (dry-run)", kind);
        println!("  documents found: {}", found);
        println!("  documents to process: {}", docs.len());
        println!("  estimated items: {}", items);
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let provider = embedding::create_provider(&config.embedding)?;

    let opts = SyncOptions {
        target_chars: config.chunking.target_chars,
        batch_size: config.embedding.batch_size,
        owned_types: kind.owned_types(),
        retire_missing: limit.is_none(),
    };
    let report = sync_documents(&store, provider.as_ref(), &docs, &opts).await?;

    info!(
        source = %kind,
        documents = report.documents,
        created = report.created,
        updated = report.updated,
        retired = report.retired,
        "sync finished"
    );

    println!("ingest {}", kind);
    println!("  fetched: {} documents", report.documents);
    println!("  items created: {}", report.created);
    println!("  items updated: {}", report.updated);
    println!("  items unchanged: {}", report.unchanged);
    println!("  items retired: {}", report.retired);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", report.embeddings_written);
        println!("  embeddings pending: {}", report.embeddings_pending);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
