//! In-memory [`Store`] implementation for tests and embedders of the core.
//!
//! Items live in a `BTreeMap` behind `std::sync::RwLock`. Text search uses
//! the same analyser as the SQLite FTS index; vector search is brute-force
//! cosine similarity.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::analyze::{analyze, fold};
use crate::chunk::belongs_to_document;
use crate::embedding::cosine_similarity;
use crate::error::{StoreError, StoreResult};
use crate::models::{ContentType, IndexedItem, NewItem, SearchHit};

use super::{
    by_score_then_id, type_allowed, ItemKey, Store, StoreStats, TypeCount, UpsertOutcome,
    UpsertResult,
};

const TITLE_WEIGHT: f64 = 3.0;

struct StoredItem {
    item: IndexedItem,
    embedding: Option<Vec<f32>>,
    title_folded: String,
    title_terms: Vec<String>,
    content_terms: Vec<String>,
}

impl StoredItem {
    fn new(item: IndexedItem, embedding: Option<Vec<f32>>) -> Self {
        let mut stored = StoredItem {
            item,
            embedding,
            title_folded: String::new(),
            title_terms: Vec::new(),
            content_terms: Vec::new(),
        };
        stored.reindex();
        stored
    }

    fn reindex(&mut self) {
        self.title_folded = fold(&self.item.title);
        self.title_terms = analyze(&self.item.title);
        self.content_terms = analyze(&self.item.content);
        self.item.has_embedding = self.embedding.is_some();
    }

    fn visible(&self, types: &[ContentType]) -> bool {
        self.item.is_active && type_allowed(types, self.item.content_type)
    }
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<i64, StoredItem>,
    next_id: i64,
    clock_override: Option<i64>,
}

impl Inner {
    fn now(&self) -> i64 {
        self.clock_override
            .unwrap_or_else(|| chrono::Utc::now().timestamp())
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the store clock, so tests can observe `updated_at` behaviour.
    pub fn set_clock(&self, now: Option<i64>) -> StoreResult<()> {
        self.write()?.clock_override = now;
        Ok(())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }
}

fn term_frequency(terms: &[String], token: &str) -> usize {
    terms.iter().filter(|t| t.as_str() == token).count()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.read().map(|_| ())
    }

    async fn upsert_item(&self, new: &NewItem) -> StoreResult<UpsertResult> {
        let mut inner = self.write()?;
        let now = inner.now();

        let existing_id = new.external_id.as_deref().and_then(|ext| {
            inner
                .items
                .values()
                .find(|s| {
                    s.item.external_id.as_deref() == Some(ext)
                        && s.item.content_type == new.content_type
                })
                .map(|s| s.item.id)
        });

        if let Some(id) = existing_id {
            let Some(stored) = inner.items.get_mut(&id) else {
                return Err(StoreError::Corrupt(format!("item {} vanished", id)));
            };
            let same_hash = stored.item.content_hash == new.content_hash;
            let gains_embedding = new.embedding.is_some() && stored.embedding.is_none();
            if same_hash && stored.item.is_active && !gains_embedding {
                return Ok(UpsertResult {
                    id,
                    outcome: UpsertOutcome::Unchanged,
                });
            }

            stored.item.title = new.title.clone();
            stored.item.content = new.content.clone();
            stored.item.metadata = new.metadata.clone();
            stored.item.content_hash = new.content_hash.clone();
            stored.item.is_active = true;
            stored.item.updated_at = stored.item.updated_at.max(now);
            match &new.embedding {
                Some(v) => stored.embedding = Some(v.clone()),
                None if !same_hash => stored.embedding = None,
                None => {}
            }
            stored.reindex();
            return Ok(UpsertResult {
                id,
                outcome: UpsertOutcome::Updated,
            });
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let item = IndexedItem {
            id,
            content_type: new.content_type,
            title: new.title.clone(),
            content: new.content.clone(),
            external_id: new.external_id.clone(),
            metadata: new.metadata.clone(),
            is_active: true,
            has_embedding: new.embedding.is_some(),
            content_hash: new.content_hash.clone(),
            created_at: now,
            updated_at: now,
        };
        inner
            .items
            .insert(id, StoredItem::new(item, new.embedding.clone()));
        Ok(UpsertResult {
            id,
            outcome: UpsertOutcome::Created,
        })
    }

    async fn find_by_key(
        &self,
        external_id: &str,
        content_type: ContentType,
    ) -> StoreResult<Option<IndexedItem>> {
        let inner = self.read()?;
        Ok(inner
            .items
            .values()
            .find(|s| {
                s.item.external_id.as_deref() == Some(external_id)
                    && s.item.content_type == content_type
            })
            .map(|s| s.item.clone()))
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<IndexedItem>> {
        let inner = self.read()?;
        Ok(inner
            .items
            .get(&id)
            .filter(|s| s.item.is_active)
            .map(|s| s.item.clone()))
    }

    async fn get_by_external_id(&self, external_id: &str) -> StoreResult<Option<IndexedItem>> {
        let inner = self.read()?;
        Ok(inner
            .items
            .values()
            .find(|s| s.item.is_active && s.item.external_id.as_deref() == Some(external_id))
            .map(|s| s.item.clone()))
    }

    async fn list_active_keys(&self, types: &[ContentType]) -> StoreResult<Vec<ItemKey>> {
        let inner = self.read()?;
        let mut keys: Vec<ItemKey> = inner
            .items
            .values()
            .filter(|s| s.visible(types))
            .filter_map(|s| {
                let ext = s.item.external_id.clone()?;
                Some(ItemKey::new(ext, s.item.content_type))
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn soft_delete(&self, keys: &[ItemKey]) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let now = inner.now();
        let mut count = 0;
        for stored in inner.items.values_mut() {
            let matches = stored.item.external_id.as_deref().is_some_and(|ext| {
                keys.iter()
                    .any(|k| k.external_id == ext && k.content_type == stored.item.content_type)
            });
            if matches && stored.item.is_active {
                stored.item.is_active = false;
                stored.item.updated_at = stored.item.updated_at.max(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn soft_delete_document(
        &self,
        base_external_id: &str,
        types: &[ContentType],
    ) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let now = inner.now();
        let mut count = 0;
        for stored in inner.items.values_mut() {
            let matches = stored
                .item
                .external_id
                .as_deref()
                .is_some_and(|ext| belongs_to_document(ext, base_external_id));
            if matches && stored.visible(types) {
                stored.item.is_active = false;
                stored.item.updated_at = stored.item.updated_at.max(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn exact_title_search(
        &self,
        term: &str,
        types: &[ContentType],
        limit: usize,
    ) -> StoreResult<Vec<IndexedItem>> {
        let needle = fold(term.trim());
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let mut matches: Vec<&StoredItem> = inner
            .items
            .values()
            .filter(|s| s.visible(types) && s.title_folded.contains(&needle))
            .collect();
        matches.sort_by(|a, b| {
            a.title_folded
                .cmp(&b.title_folded)
                .then(a.item.id.cmp(&b.item.id))
        });
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|s| s.item.clone())
            .collect())
    }

    async fn text_search(
        &self,
        query: &str,
        types: &[ContentType],
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let mut tokens = analyze(query);
        tokens.sort();
        tokens.dedup();
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let mut hits: Vec<SearchHit> = inner
            .items
            .values()
            .filter(|s| s.visible(types))
            .filter_map(|s| {
                let mut score = 0.0;
                for token in &tokens {
                    let in_title = term_frequency(&s.title_terms, token);
                    let in_content = term_frequency(&s.content_terms, token);
                    if in_title + in_content == 0 {
                        return None;
                    }
                    score += TITLE_WEIGHT * in_title as f64 + in_content as f64;
                }
                let length = (s.title_terms.len() + s.content_terms.len()).max(1) as f64;
                Some(SearchHit {
                    item: s.item.clone(),
                    score: score / (1.0 + length.ln()),
                })
            })
            .collect();
        hits.sort_by(by_score_then_id);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        types: &[ContentType],
        min_similarity: f32,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        if query_vec.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let mut hits: Vec<SearchHit> = inner
            .items
            .values()
            .filter(|s| s.visible(types))
            .filter_map(|s| {
                let embedding = s.embedding.as_ref()?;
                let sim = cosine_similarity(query_vec, embedding);
                (sim >= min_similarity).then(|| SearchHit {
                    item: s.item.clone(),
                    score: sim as f64,
                })
            })
            .collect();
        hits.sort_by(by_score_then_id);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn items_missing_embedding(&self, limit: usize) -> StoreResult<Vec<IndexedItem>> {
        let inner = self.read()?;
        Ok(inner
            .items
            .values()
            .filter(|s| s.item.is_active && s.embedding.is_none())
            .take(limit)
            .map(|s| s.item.clone())
            .collect())
    }

    async fn set_embedding(&self, id: i64, vector: &[f32]) -> StoreResult<()> {
        let mut inner = self.write()?;
        let stored = inner
            .items
            .get_mut(&id)
            .ok_or_else(|| StoreError::Query(format!("no item with id {}", id)))?;
        stored.embedding = Some(vector.to_vec());
        stored.item.has_embedding = true;
        Ok(())
    }

    async fn purge_inactive(&self) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let before = inner.items.len();
        inner.items.retain(|_, s| s.item.is_active);
        Ok((before - inner.items.len()) as u64)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.read()?;
        let mut stats = StoreStats::default();
        for s in inner.items.values() {
            stats.total += 1;
            if s.item.is_active {
                stats.active += 1;
                if s.embedding.is_none() {
                    stats.pending_embeddings += 1;
                }
            } else {
                stats.inactive += 1;
            }
        }
        stats.by_type = ContentType::ALL
            .into_iter()
            .map(|ct| TypeCount {
                content_type: ct,
                active: inner
                    .items
                    .values()
                    .filter(|s| s.item.is_active && s.item.content_type == ct)
                    .count() as i64,
            })
            .filter(|tc| tc.active > 0)
            .collect();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(ext: &str, ct: ContentType, title: &str, content: &str) -> NewItem {
        NewItem {
            content_type: ct,
            title: title.to_string(),
            content: content.to_string(),
            external_id: Some(ext.to_string()),
            metadata: json!({}),
            content_hash: crate::chunk::content_hash(&[title, content]),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_unchanged_hash() {
        let store = InMemoryStore::new();
        store.set_clock(Some(100)).unwrap();
        let new = item("product_1", ContentType::Product, "Diferencial DPN", "");
        let first = store.upsert_item(&new).await.unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Created);

        store.set_clock(Some(200)).unwrap();
        let second = store.upsert_item(&new).await.unwrap();
        assert_eq!(second.outcome, UpsertOutcome::Unchanged);
        assert_eq!(second.id, first.id);

        let stored = store.get_by_id(first.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, 100);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn changed_content_updates_in_place_and_drops_stale_vector() {
        let store = InMemoryStore::new();
        let mut new = item("doc_envios", ContentType::Policy, "Envíos", "24h");
        new.embedding = Some(vec![1.0, 0.0]);
        let id = store.upsert_item(&new).await.unwrap().id;

        let changed = item("doc_envios", ContentType::Policy, "Envíos", "48h");
        let res = store.upsert_item(&changed).await.unwrap();
        assert_eq!(res, UpsertResult { id, outcome: UpsertOutcome::Updated });
        let stored = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.content, "48h");
        assert!(!stored.has_embedding);
    }

    #[tokio::test]
    async fn same_external_id_with_other_type_is_a_different_item() {
        let store = InMemoryStore::new();
        let a = store
            .upsert_item(&item("x", ContentType::Faq, "A", ""))
            .await
            .unwrap();
        let b = store
            .upsert_item(&item("x", ContentType::Policy, "B", ""))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(b.outcome, UpsertOutcome::Created);
    }

    #[tokio::test]
    async fn exact_title_is_accent_insensitive_and_sorted() {
        let store = InMemoryStore::new();
        for (ext, title) in [
            ("p2", "Magnetotérmico C16 2P"),
            ("p1", "MAGNETOTERMICO C10 1P"),
            ("p3", "Diferencial DPN"),
        ] {
            store
                .upsert_item(&item(ext, ContentType::Product, title, ""))
                .await
                .unwrap();
        }
        let hits = store
            .exact_title_search("magnetotermico", &[], 10)
            .await
            .unwrap();
        let titles: Vec<&str> = hits.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["MAGNETOTERMICO C10 1P", "Magnetotérmico C16 2P"]);
    }

    #[tokio::test]
    async fn soft_deleted_items_are_invisible_everywhere() {
        let store = InMemoryStore::new();
        let mut new = item("p1", ContentType::Product, "Diferencial DPN", "diferencial");
        new.embedding = Some(vec![1.0, 0.0]);
        store.upsert_item(&new).await.unwrap();
        let other_type = [ItemKey::new("p1", ContentType::Faq)];
        assert_eq!(store.soft_delete(&other_type).await.unwrap(), 0);
        let key = [ItemKey::new("p1", ContentType::Product)];
        assert_eq!(store.soft_delete(&key).await.unwrap(), 1);

        assert!(store.exact_title_search("DPN", &[], 10).await.unwrap().is_empty());
        assert!(store.text_search("diferencial", &[], 10).await.unwrap().is_empty());
        assert!(store
            .vector_search(&[1.0, 0.0], &[], 0.0, 10)
            .await
            .unwrap()
            .is_empty());
        assert!(store.get_by_external_id("p1").await.unwrap().is_none());
        assert!(store
            .find_by_key("p1", ContentType::Product)
            .await
            .unwrap()
            .is_some_and(|i| !i.is_active));
    }

    #[tokio::test]
    async fn text_search_requires_every_token() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("a", ContentType::Product, "Cable flexible", "rollo 100 metros"))
            .await
            .unwrap();
        store
            .upsert_item(&item("b", ContentType::Product, "Tubo corrugado", "rollo 50 metros"))
            .await
            .unwrap();
        let hits = store.text_search("cables en rollo", &[], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.external_id.as_deref(), Some("a"));
        assert_eq!(store.text_search("rollo", &[], 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn vector_search_applies_threshold_and_type_filter() {
        let store = InMemoryStore::new();
        for (ext, ct, v) in [
            ("a", ContentType::Product, vec![1.0, 0.0]),
            ("b", ContentType::Faq, vec![0.9, 0.1]),
            ("c", ContentType::Product, vec![0.0, 1.0]),
        ] {
            let mut new = item(ext, ct, ext, "");
            new.embedding = Some(v);
            store.upsert_item(&new).await.unwrap();
        }
        let hits = store
            .vector_search(&[1.0, 0.0], &[ContentType::Product], 0.5, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.external_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn deleting_a_document_retires_all_chunks() {
        let store = InMemoryStore::new();
        for ext in ["doc_faq_chunk_0", "doc_faq_chunk_1", "doc_faq_extra"] {
            store
                .upsert_item(&item(ext, ContentType::Faq, "Preguntas frecuentes", ext))
                .await
                .unwrap();
        }
        store
            .upsert_item(&item("doc_faq", ContentType::Product, "Otro", ""))
            .await
            .unwrap();
        assert_eq!(
            store
                .soft_delete_document("doc_faq", &[ContentType::Faq])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store.list_active_keys(&[]).await.unwrap(),
            vec![
                ItemKey::new("doc_faq", ContentType::Product),
                ItemKey::new("doc_faq_extra", ContentType::Faq),
            ]
        );
    }

    #[tokio::test]
    async fn purge_removes_only_inactive() {
        let store = InMemoryStore::new();
        store
            .upsert_item(&item("a", ContentType::General, "A", ""))
            .await
            .unwrap();
        store
            .upsert_item(&item("b", ContentType::General, "B", ""))
            .await
            .unwrap();
        store
            .soft_delete(&[ItemKey::new("a", ContentType::General)])
            .await
            .unwrap();
        assert_eq!(store.purge_inactive().await.unwrap(), 1);
        let stats = store.stats().await.unwrap();
        assert_eq!((stats.total, stats.active, stats.inactive), (1, 1, 0));
        assert_eq!(stats.pending_embeddings, 1);
    }
}
