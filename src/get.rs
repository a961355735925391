//! Item lookup by external id.
//!
//! Used by the `voltline get` CLI command. The HTTP server answers
//! `GET /items/{external_id}` through the same [`Retriever`] call.

use anyhow::{bail, Result};

use voltline_core::models::IndexedItem;

use crate::config::Config;
use crate::search::Retriever;

pub async fn run_get(config: &Config, external_id: &str) -> Result<()> {
    let retriever = Retriever::from_config(config).await?;

    let Some(item) = retriever.get_by_external_id(external_id).await? else {
        bail!("item not found: {}", external_id);
    };

    print_item(&item);
    Ok(())
}

fn print_item(item: &IndexedItem) {
    println!("--- Item ---");
    println!("id:           {}", item.id);
    println!("external_id:  {}", item.external_id.as_deref().unwrap_or("-"));
    println!("content_type: {}", item.content_type);
    println!("title:        {}", item.title);
    println!("embedded:     {}", if item.has_embedding { "yes" } else { "no" });
    println!("created_at:   {}", format_ts_iso(item.created_at));
    println!("updated_at:   {}", format_ts_iso(item.updated_at));
    println!("metadata:     {}", item.metadata);
    println!();

    println!("--- Content ---");
    println!("{}", item.content);
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
