//! Storage abstraction for the retrieval corpus.
//!
//! The [`Store`] trait covers everything the ranker and the ingestion
//! pipeline need: the three query surfaces, natural-key upserts, soft
//! deletes, and embedding backfill. The ranker only ever reads.
//!
//! All query methods filter out inactive items unconditionally and apply
//! the content-type allow-list the same way. An empty allow-list means
//! "every type".

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreResult;
use crate::models::{ContentType, IndexedItem, NewItem, SearchHit};

/// What [`Store::upsert_item`] did with the incoming item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// No item had the same natural key.
    Created,
    /// An existing item was rewritten in place (or reactivated).
    Updated,
    /// Same content hash on an active item; nothing was written.
    Unchanged,
}

/// Natural key of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemKey {
    pub external_id: String,
    pub content_type: ContentType,
}

impl ItemKey {
    pub fn new(external_id: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            external_id: external_id.into(),
            content_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub id: i64,
    pub outcome: UpsertOutcome,
}

/// Active item count for one content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeCount {
    pub content_type: ContentType,
    pub active: i64,
}

/// Corpus counters, for `voltline stats` and health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub active: i64,
    pub inactive: i64,
    /// Active items not yet embedded; invisible to vector search.
    pub pending_embeddings: i64,
    pub by_type: Vec<TypeCount>,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_item`](Store::upsert_item) | Insert or update by `(external_id, content_type)` |
/// | [`find_by_key`](Store::find_by_key) | Natural-key lookup, inactive items included |
/// | [`get_by_id`](Store::get_by_id) | Active item by store id |
/// | [`get_by_external_id`](Store::get_by_external_id) | Active item by external id |
/// | [`list_active_keys`](Store::list_active_keys) | Natural keys of active items |
/// | [`soft_delete`](Store::soft_delete) | Deactivate items by natural key |
/// | [`soft_delete_document`](Store::soft_delete_document) | Deactivate a document and all its chunks |
/// | [`exact_title_search`](Store::exact_title_search) | Accent-insensitive title substring match |
/// | [`text_search`](Store::text_search) | Stemmed full-text match, title weighted |
/// | [`vector_search`](Store::vector_search) | Cosine nearest neighbours above a threshold |
/// | [`items_missing_embedding`](Store::items_missing_embedding) | Active items awaiting an embedding |
/// | [`set_embedding`](Store::set_embedding) | Attach an embedding to an item |
/// | [`purge_inactive`](Store::purge_inactive) | Hard-delete inactive items |
/// | [`stats`](Store::stats) | Corpus counters |
#[async_trait]
pub trait Store: Send + Sync {
    /// Check that the store can serve queries.
    async fn ping(&self) -> StoreResult<()>;

    /// Insert or update an item by its natural key.
    ///
    /// An active item whose content hash is unchanged is left untouched
    /// (`updated_at` included), unless the incoming item brings an embedding
    /// the stored one lacks. A changed hash without a new embedding clears the
    /// stale vector. Writing reactivates soft-deleted items.
    async fn upsert_item(&self, item: &NewItem) -> StoreResult<UpsertResult>;

    /// Look up an item by natural key regardless of `is_active`.
    async fn find_by_key(
        &self,
        external_id: &str,
        content_type: ContentType,
    ) -> StoreResult<Option<IndexedItem>>;

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<IndexedItem>>;

    /// Active item with this external id (lowest id when several types share it).
    async fn get_by_external_id(&self, external_id: &str) -> StoreResult<Option<IndexedItem>>;

    /// Keys of active items passing the allow-list, ordered by external id
    /// then content type.
    async fn list_active_keys(&self, types: &[ContentType]) -> StoreResult<Vec<ItemKey>>;

    /// Deactivate the given items. Returns how many were active.
    async fn soft_delete(&self, keys: &[ItemKey]) -> StoreResult<u64>;

    /// Deactivate `base` and every `base_chunk_<n>` item whose type passes
    /// the allow-list.
    async fn soft_delete_document(
        &self,
        base_external_id: &str,
        types: &[ContentType],
    ) -> StoreResult<u64>;

    /// Items whose title contains `term`, ignoring case and accents,
    /// ordered by title then id.
    async fn exact_title_search(
        &self,
        term: &str,
        types: &[ContentType],
        limit: usize,
    ) -> StoreResult<Vec<IndexedItem>>;

    /// Items containing every analysed query token, best first.
    ///
    /// Items that do not match are excluded, not scored low. A query with
    /// no indexable tokens returns nothing.
    async fn text_search(
        &self,
        query: &str,
        types: &[ContentType],
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>>;

    /// Embedded items by cosine similarity, highest first, dropping those
    /// below `min_similarity`.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        types: &[ContentType],
        min_similarity: f32,
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>>;

    async fn items_missing_embedding(&self, limit: usize) -> StoreResult<Vec<IndexedItem>>;

    async fn set_embedding(&self, id: i64, vector: &[f32]) -> StoreResult<()>;

    /// Hard-delete every inactive item. Returns the number removed.
    async fn purge_inactive(&self) -> StoreResult<u64>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

/// Order two similarity hits: score descending, then id ascending.
pub fn by_score_then_id(a: &SearchHit, b: &SearchHit) -> std::cmp::Ordering {
    b.score.total_cmp(&a.score).then(a.item.id.cmp(&b.item.id))
}

/// True when `ct` passes the allow-list.
pub fn type_allowed(types: &[ContentType], ct: ContentType) -> bool {
    types.is_empty() || types.contains(&ct)
}
