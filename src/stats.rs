//! Corpus statistics and the administrative purge.
//!
//! `voltline stats` gives a quick summary of what's indexed: active and
//! retired item counts, embedding coverage and a per-type breakdown.
//! `voltline purge` hard-deletes retired items; nothing else ever does.

use anyhow::Result;

use voltline_core::store::{Store, StoreStats};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let stats = store.stats().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Voltline — Index Stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    print_stats(&stats);
    println!();

    pool.close().await;
    Ok(())
}

fn print_stats(stats: &StoreStats) {
    let embedded = stats.active - stats.pending_embeddings;
    println!("  Items:       {}", stats.total);
    println!("  Active:      {}", stats.active);
    println!("  Retired:     {}", stats.inactive);
    println!(
        "  Embedded:    {} / {} ({}%)",
        embedded,
        stats.active,
        coverage_percent(embedded, stats.active)
    );

    if !stats.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<16} {:>8}", "TYPE", "ACTIVE");
        println!("  {}", "-".repeat(25));
        for t in &stats.by_type {
            println!("  {:<16} {:>8}", t.content_type, t.active);
        }
    }
}

fn coverage_percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

pub async fn run_purge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let removed = store.purge_inactive().await?;
    tracing::info!(removed, "purged retired items");

    println!("purge");
    println!("  items removed: {}", removed);
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
