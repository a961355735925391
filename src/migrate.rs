//! Schema migrations.
//!
//! Every statement is idempotent, so `voltline init` can be re-run safely.
//!
//! # Tables
//!
//! - `indexed_items`: one row per corpus item. `(external_id, content_type)`
//!   is unique; `title_folded` holds the lowercased, accent-stripped title
//!   used by the exact-title surface; `embedding` is a little-endian f32 BLOB.
//! - `items_fts`: FTS5 index over the analysed (folded, stemmed) title and
//!   content, keyed by `rowid = indexed_items.id`. Written by the store, not
//!   by triggers, because analysis happens in Rust.
//! - `index_state`: a single revision counter bumped by triggers whenever
//!   the set of searchable vectors may have changed. The store uses it to
//!   invalidate its in-memory vector index.

use anyhow::Result;
use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS indexed_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_type TEXT NOT NULL,
        title TEXT NOT NULL,
        title_folded TEXT NOT NULL,
        content TEXT NOT NULL,
        external_id TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        is_active INTEGER NOT NULL DEFAULT 1,
        content_hash TEXT NOT NULL,
        embedding BLOB,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(external_id, content_type)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_items_active_type ON indexed_items(is_active, content_type)",
    "CREATE INDEX IF NOT EXISTS idx_items_external_id ON indexed_items(external_id)",
    r#"
    CREATE TABLE IF NOT EXISTS index_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        revision INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO index_state (id, revision) VALUES (1, 0)",
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_items_insert_revision
    AFTER INSERT ON indexed_items
    BEGIN
        UPDATE index_state SET revision = revision + 1 WHERE id = 1;
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_items_update_revision
    AFTER UPDATE OF embedding, is_active, content_type ON indexed_items
    BEGIN
        UPDATE index_state SET revision = revision + 1 WHERE id = 1;
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS trg_items_delete_revision
    AFTER DELETE ON indexed_items
    BEGIN
        UPDATE index_state SET revision = revision + 1 WHERE id = 1;
    END
    "#,
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='items_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE items_fts USING fts5(
                title,
                content,
                tokenize = 'unicode61 remove_diacritics 2'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
