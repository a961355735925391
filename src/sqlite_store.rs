//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`migrate`](crate::migrate):
//!
//! - exact-title matches use `instr()` over the folded title column;
//! - full-text matches use FTS5 with `bm25()` weighting the title column
//!   three times the content column;
//! - vector matches query an in-memory [`VectorIndex`] of every active
//!   embedding (exhaustive scan, or HNSW above a size threshold), rebuilt
//!   only when the `index_state` revision moves.
//!
//! Connection-level sqlx failures (pool timeout, closed pool, I/O) map to
//! [`StoreError::Unavailable`]; everything else is a per-query failure.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use voltline_core::analyze::{analyze, fold};
use voltline_core::embedding::{blob_to_vec, vec_to_blob};
use voltline_core::error::{StoreError, StoreResult};
use voltline_core::models::{ContentType, IndexedItem, NewItem, SearchHit};
use voltline_core::store::{
    by_score_then_id, ItemKey, Store, StoreStats, TypeCount, UpsertOutcome, UpsertResult,
};

use crate::vector_index::{AnnParams, VectorEntry, VectorIndex};

const ITEM_COLUMNS: &str = "i.id, i.content_type, i.title, i.content, i.external_id, \
     i.metadata_json, i.is_active, i.content_hash, i.embedding IS NOT NULL AS has_embedding, \
     i.created_at, i.updated_at";

const CHUNK_MARKER: &str = "_chunk_";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    ann: AnnParams,
    vectors: Arc<RwLock<Option<Arc<VectorIndex>>>>,
    /// Held for the whole of a rebuild, including the blocking build task,
    /// so one revision is built once even when callers give up waiting.
    rebuild: Arc<tokio::sync::Mutex<()>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            ann: AnnParams::default(),
            vectors: Arc::new(RwLock::new(None)),
            rebuild: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Override when the vector surface switches to an HNSW graph and how
    /// the graph is built.
    pub fn with_ann_params(mut self, ann: AnnParams) -> Self {
        self.ann = ann;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write transaction that takes the database write lock up front, so
    /// concurrent writers queue on the busy timeout instead of failing with
    /// `SQLITE_BUSY` when a read would have to upgrade.
    async fn begin_write(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(classify)
    }

    async fn revision(&self) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT revision FROM index_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)
    }

    async fn vector_index(&self) -> StoreResult<Arc<VectorIndex>> {
        let revision = self.revision().await?;
        if let Some(index) = self.cached_index(revision) {
            return Ok(index);
        }
        let guard = Arc::clone(&self.rebuild).lock_owned().await;
        if let Some(index) = self.cached_index(revision) {
            return Ok(index);
        }

        let rows = sqlx::query(
            "SELECT id, content_type, embedding FROM indexed_items \
             WHERE is_active = 1 AND embedding IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding").map_err(classify)?;
            entries.push(VectorEntry {
                id: row.try_get("id").map_err(classify)?,
                content_type: parse_content_type(row)?,
                vector: blob_to_vec(&blob),
            });
        }

        let params = self.ann.clone();
        let slot = Arc::clone(&self.vectors);
        tokio::task::spawn_blocking(move || {
            let index = Arc::new(VectorIndex::build(revision, entries, &params));
            *slot.write() = Some(Arc::clone(&index));
            drop(guard);
            index
        })
        .await
        .map_err(|e| StoreError::Query(format!("vector index build failed: {}", e)))
    }

    fn cached_index(&self, revision: i64) -> Option<Arc<VectorIndex>> {
        self.vectors
            .read()
            .clone()
            .filter(|index| index.revision() == revision)
    }

    async fn items_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<IndexedItem>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM indexed_items i WHERE i.id IN (",
            ITEM_COLUMNS
        ));
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(row_to_item).collect()
    }
}

/// Map an sqlx failure onto the store error taxonomy.
fn classify(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => StoreError::Corrupt(err.to_string()),
        other => StoreError::Query(other.to_string()),
    }
}

fn parse_content_type(row: &SqliteRow) -> StoreResult<ContentType> {
    let raw: String = row.try_get("content_type").map_err(classify)?;
    raw.parse()
        .map_err(|e: voltline_core::models::UnknownContentType| StoreError::Corrupt(e.to_string()))
}

fn row_to_item(row: &SqliteRow) -> StoreResult<IndexedItem> {
    let metadata_json: String = row.try_get("metadata_json").map_err(classify)?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Corrupt(format!("metadata_json: {}", e)))?;
    Ok(IndexedItem {
        id: row.try_get("id").map_err(classify)?,
        content_type: parse_content_type(row)?,
        title: row.try_get("title").map_err(classify)?,
        content: row.try_get("content").map_err(classify)?,
        external_id: row.try_get("external_id").map_err(classify)?,
        metadata,
        is_active: row.try_get("is_active").map_err(classify)?,
        has_embedding: row.try_get("has_embedding").map_err(classify)?,
        content_hash: row.try_get("content_hash").map_err(classify)?,
        created_at: row.try_get("created_at").map_err(classify)?,
        updated_at: row.try_get("updated_at").map_err(classify)?,
    })
}

/// Append `AND i.content_type IN (...)` unless every type is allowed.
fn push_type_filter(qb: &mut QueryBuilder<'_, Sqlite>, types: &[ContentType]) {
    if types.is_empty() {
        return;
    }
    qb.push(" AND i.content_type IN (");
    let mut sep = qb.separated(", ");
    for ct in types {
        sep.push_bind(ct.as_str());
    }
    sep.push_unseparated(")");
}

/// FTS5 query matching every analysed token. Tokens are quoted so that no
/// user input is read as query syntax.
fn fts_query(query: &str) -> Option<String> {
    let mut tokens = analyze(query);
    tokens.sort();
    tokens.dedup();
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn upsert_item(&self, new: &NewItem) -> StoreResult<UpsertResult> {
        let now = now_ts();
        let title_folded = fold(&new.title);
        let metadata_json = new.metadata.to_string();
        let fts_title = analyze(&new.title).join(" ");
        let fts_content = analyze(&new.content).join(" ");

        let mut tx = self.begin_write().await?;

        let existing = match new.external_id.as_deref() {
            Some(ext) => sqlx::query(
                "SELECT id, content_hash, is_active, embedding IS NOT NULL AS has_embedding \
                 FROM indexed_items WHERE external_id = ? AND content_type = ?",
            )
            .bind(ext)
            .bind(new.content_type.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?,
            None => None,
        };

        let (id, outcome) = match existing {
            Some(row) => {
                let id: i64 = row.try_get("id").map_err(classify)?;
                let stored_hash: String = row.try_get("content_hash").map_err(classify)?;
                let is_active: bool = row.try_get("is_active").map_err(classify)?;
                let has_embedding: bool = row.try_get("has_embedding").map_err(classify)?;

                let same_hash = stored_hash == new.content_hash;
                let gains_embedding = new.embedding.is_some() && !has_embedding;
                if same_hash && is_active && !gains_embedding {
                    return Ok(UpsertResult {
                        id,
                        outcome: UpsertOutcome::Unchanged,
                    });
                }

                sqlx::query(
                    r#"
                    UPDATE indexed_items SET
                        title = ?, title_folded = ?, content = ?, metadata_json = ?,
                        content_hash = ?, is_active = 1, updated_at = MAX(updated_at, ?)
                    WHERE id = ?
                    "#,
                )
                .bind(&new.title)
                .bind(&title_folded)
                .bind(&new.content)
                .bind(&metadata_json)
                .bind(&new.content_hash)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;

                let embedding = match &new.embedding {
                    Some(v) => Some(Some(vec_to_blob(v))),
                    None if !same_hash => Some(None),
                    None => None,
                };
                if let Some(blob) = embedding {
                    sqlx::query("UPDATE indexed_items SET embedding = ? WHERE id = ?")
                        .bind(blob)
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(classify)?;
                }

                sqlx::query("DELETE FROM items_fts WHERE rowid = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;

                (id, UpsertOutcome::Updated)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO indexed_items (content_type, title, title_folded, content,
                                               external_id, metadata_json, is_active,
                                               content_hash, embedding, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
                    "#,
                )
                .bind(new.content_type.as_str())
                .bind(&new.title)
                .bind(&title_folded)
                .bind(&new.content)
                .bind(&new.external_id)
                .bind(&metadata_json)
                .bind(&new.content_hash)
                .bind(new.embedding.as_deref().map(vec_to_blob))
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;

                (result.last_insert_rowid(), UpsertOutcome::Created)
            }
        };

        sqlx::query("INSERT INTO items_fts (rowid, title, content) VALUES (?, ?, ?)")
            .bind(id)
            .bind(&fts_title)
            .bind(&fts_content)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(UpsertResult { id, outcome })
    }

    async fn find_by_key(
        &self,
        external_id: &str,
        content_type: ContentType,
    ) -> StoreResult<Option<IndexedItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM indexed_items i WHERE i.external_id = ? AND i.content_type = ?",
            ITEM_COLUMNS
        ))
        .bind(external_id)
        .bind(content_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<IndexedItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM indexed_items i WHERE i.id = ? AND i.is_active = 1",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn get_by_external_id(&self, external_id: &str) -> StoreResult<Option<IndexedItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM indexed_items i WHERE i.external_id = ? AND i.is_active = 1 \
             ORDER BY i.id ASC LIMIT 1",
            ITEM_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn list_active_keys(&self, types: &[ContentType]) -> StoreResult<Vec<ItemKey>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT i.external_id, i.content_type FROM indexed_items i \
             WHERE i.is_active = 1 AND i.external_id IS NOT NULL",
        );
        push_type_filter(&mut qb, types);
        qb.push(" ORDER BY i.external_id, i.content_type");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(classify)?;
        rows.iter()
            .map(|row| {
                let external_id: String = row.try_get("external_id").map_err(classify)?;
                Ok(ItemKey::new(external_id, parse_content_type(row)?))
            })
            .collect()
    }

    async fn soft_delete(&self, keys: &[ItemKey]) -> StoreResult<u64> {
        let now = now_ts();
        let mut tx = self.begin_write().await?;
        let mut count = 0;
        for key in keys {
            count += sqlx::query(
                "UPDATE indexed_items SET is_active = 0, updated_at = MAX(updated_at, ?) \
                 WHERE external_id = ? AND content_type = ? AND is_active = 1",
            )
            .bind(now)
            .bind(&key.external_id)
            .bind(key.content_type.as_str())
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();
        }
        tx.commit().await.map_err(classify)?;
        Ok(count)
    }

    async fn soft_delete_document(
        &self,
        base_external_id: &str,
        types: &[ContentType],
    ) -> StoreResult<u64> {
        let prefix = format!("{}{}", base_external_id, CHUNK_MARKER);
        let prefix_len = prefix.chars().count() as i64;
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE indexed_items AS i SET is_active = 0, updated_at = MAX(updated_at, ",
        );
        qb.push_bind(now_ts());
        qb.push(") WHERE i.is_active = 1 AND (i.external_id = ");
        qb.push_bind(base_external_id);
        qb.push(" OR (substr(i.external_id, 1, ");
        qb.push_bind(prefix_len);
        qb.push(") = ");
        qb.push_bind(prefix);
        qb.push(" AND length(i.external_id) > ");
        qb.push_bind(prefix_len);
        qb.push(" AND substr(i.external_id, ");
        qb.push_bind(prefix_len);
        qb.push(" + 1) NOT GLOB '*[^0-9]*'))");
        push_type_filter(&mut qb, types);
        let result = qb.build().execute(&self.pool).await.map_err(classify)?;
        Ok(result.rows_affected())
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
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM indexed_items i WHERE i.is_active = 1 AND instr(i.title_folded, ",
            ITEM_COLUMNS
        ));
        qb.push_bind(needle);
        qb.push(") > 0");
        push_type_filter(&mut qb, types);
        qb.push(" ORDER BY i.title_folded ASC, i.id ASC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn text_search(
        &self,
        query: &str,
        types: &[ContentType],
        limit: usize,
    ) -> StoreResult<Vec<SearchHit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {}, -bm25(items_fts, 3.0, 1.0) AS score \
             FROM items_fts JOIN indexed_items i ON i.id = items_fts.rowid \
             WHERE items_fts MATCH ",
            ITEM_COLUMNS
        ));
        qb.push_bind(match_expr);
        qb.push(" AND i.is_active = 1");
        push_type_filter(&mut qb, types);
        qb.push(" ORDER BY score DESC, i.id ASC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter()
            .map(|row| {
                Ok(SearchHit {
                    item: row_to_item(row)?,
                    score: row.try_get("score").map_err(classify)?,
                })
            })
            .collect()
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
        let index = self.vector_index().await?;
        let scored = index.search(query_vec, types, min_similarity, limit);

        let ids: Vec<i64> = scored.iter().map(|(id, _)| *id).collect();
        let items = self.items_by_ids(&ids).await?;

        // An item deactivated between the index load and this read drops out.
        let mut hits: Vec<SearchHit> = items
            .into_iter()
            .filter(|item| item.is_active)
            .filter_map(|item| {
                let score = scored.iter().find(|(id, _)| *id == item.id)?.1;
                Some(SearchHit {
                    item,
                    score: score as f64,
                })
            })
            .collect();
        hits.sort_by(by_score_then_id);
        Ok(hits)
    }

    async fn items_missing_embedding(&self, limit: usize) -> StoreResult<Vec<IndexedItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM indexed_items i WHERE i.is_active = 1 AND i.embedding IS NULL \
             ORDER BY i.id ASC LIMIT ?",
            ITEM_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(row_to_item).collect()
    }

    async fn set_embedding(&self, id: i64, vector: &[f32]) -> StoreResult<()> {
        let result = sqlx::query("UPDATE indexed_items SET embedding = ? WHERE id = ?")
            .bind(vec_to_blob(vector))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Query(format!("no item with id {}", id)));
        }
        Ok(())
    }

    async fn purge_inactive(&self) -> StoreResult<u64> {
        let mut tx = self.begin_write().await?;
        sqlx::query(
            "DELETE FROM items_fts WHERE rowid IN (SELECT id FROM indexed_items WHERE is_active = 0)",
        )
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        let removed = sqlx::query("DELETE FROM indexed_items WHERE is_active = 0")
            .execute(&mut *tx)
            .await
            .map_err(classify)?
            .rows_affected();
        tx.commit().await.map_err(classify)?;
        Ok(removed)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(is_active = 1), 0) AS active,
                COALESCE(SUM(is_active = 0), 0) AS inactive,
                COALESCE(SUM(is_active = 1 AND embedding IS NULL), 0) AS pending
            FROM indexed_items
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        let type_rows = sqlx::query(
            "SELECT content_type, COUNT(*) AS active FROM indexed_items \
             WHERE is_active = 1 GROUP BY content_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let mut by_type = Vec::with_capacity(type_rows.len());
        for r in &type_rows {
            by_type.push(TypeCount {
                content_type: parse_content_type(r)?,
                active: r.try_get("active").map_err(classify)?,
            });
        }
        by_type.sort_by_key(|tc| tc.content_type);

        Ok(StoreStats {
            total: row.try_get("total").map_err(classify)?,
            active: row.try_get("active").map_err(classify)?,
            inactive: row.try_get("inactive").map_err(classify)?,
            pending_embeddings: row.try_get("pending").map_err(classify)?,
            by_type,
        })
    }
}
