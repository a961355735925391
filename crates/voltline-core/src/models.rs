//! Core data models for the retrieval corpus.
//!
//! - [`IndexedItem`]: one searchable corpus entry (a product, a policy, or a
//!   chunk of a longer knowledge document).
//! - [`NewItem`]: the write-side shape handed to
//!   [`Store::upsert_item`](crate::store::Store::upsert_item).
//! - [`ItemMetadata`]: a typed projection over the schema-free metadata bag.
//! - [`SearchHit`]: an item paired with the score of the surface that found it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of corpus entry. Stored as its snake_case tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Product,
    Category,
    CompanyInfo,
    Faq,
    Policy,
    General,
}

impl ContentType {
    pub const ALL: [ContentType; 6] = [
        ContentType::Product,
        ContentType::Category,
        ContentType::CompanyInfo,
        ContentType::Faq,
        ContentType::Policy,
        ContentType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Product => "product",
            ContentType::Category => "category",
            ContentType::CompanyInfo => "company_info",
            ContentType::Faq => "faq",
            ContentType::Policy => "policy",
            ContentType::General => "general",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown content type: {0:?}")]
pub struct UnknownContentType(pub String);

impl FromStr for ContentType {
    type Err = UnknownContentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| UnknownContentType(s.to_string()))
    }
}

/// A persisted corpus entry.
///
/// The embedding vector itself is not carried on the read model; stores
/// keep it beside the row and report its presence through `has_embedding`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedItem {
    /// Store-assigned identifier, stable for the item's lifetime.
    pub id: i64,
    pub content_type: ContentType,
    pub title: String,
    pub content: String,
    /// Identifier in the source system; chunks carry a `_chunk_<n>` suffix.
    pub external_id: Option<String>,
    /// Schema-free key/value bag. See [`ItemMetadata`] for the typed view.
    pub metadata: Value,
    pub is_active: bool,
    #[serde(skip)]
    pub has_embedding: bool,
    #[serde(skip)]
    pub content_hash: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    /// Unix timestamp (seconds). Never decreases.
    pub updated_at: i64,
}

impl IndexedItem {
    /// Typed projection of [`metadata`](Self::metadata).
    pub fn metadata_view(&self) -> ItemMetadata {
        ItemMetadata::from_value(&self.metadata)
    }
}

/// Write-side item handed to a store for insert-or-update.
///
/// `(external_id, content_type)` is the natural key. Items without an
/// external id are always inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub content_type: ContentType,
    pub title: String,
    pub content: String,
    pub external_id: Option<String>,
    pub metadata: Value,
    /// Hash of the source content, used to detect no-op re-syncs.
    pub content_hash: String,
    /// Embedding for `title + content`; `None` leaves the item pending.
    pub embedding: Option<Vec<f32>>,
}

/// An item paired with a surface-specific score.
///
/// For vector search the score is cosine similarity; for full-text search
/// it is a relevance score where higher is better.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub item: IndexedItem,
    pub score: f64,
}

/// Stock state of a product as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockStatus {
    InStock,
    OutOfStock,
    OnBackorder,
    Other(String),
}

impl StockStatus {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "instock" => StockStatus::InStock,
            "outofstock" => StockStatus::OutOfStock,
            "onbackorder" => StockStatus::OnBackorder,
            other => StockStatus::Other(other.to_string()),
        }
    }
}

/// Typed view over an item's metadata bag.
///
/// Lenient by construction: unknown keys are ignored and values of the wrong
/// shape become `None`. Prices are accepted as JSON numbers or as strings
/// (catalog exports ship them as `"24.90"` or `"24,90"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMetadata {
    pub price: Option<f64>,
    pub regular_price: Option<f64>,
    pub sale_price: Option<f64>,
    pub sku: Option<String>,
    pub stock_status: Option<StockStatus>,
    pub permalink: Option<String>,
    pub categories: Vec<String>,
    pub chunk_index: Option<usize>,
    pub chunk_total: Option<usize>,
    pub base_external_id: Option<String>,
    pub source_path: Option<String>,
}

impl ItemMetadata {
    pub fn from_value(value: &Value) -> Self {
        let get = |key: &str| value.get(key);
        ItemMetadata {
            price: get("price").and_then(as_price),
            regular_price: get("regular_price").and_then(as_price),
            sale_price: get("sale_price").and_then(as_price),
            sku: get("sku").and_then(as_text),
            stock_status: get("stock_status")
                .and_then(as_text)
                .map(|s| StockStatus::parse(&s)),
            permalink: get("permalink").and_then(as_text),
            categories: get("categories")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(as_text).collect())
                .unwrap_or_default(),
            chunk_index: get("chunk_index").and_then(as_count),
            chunk_total: get("chunk_total").and_then(as_count),
            base_external_id: get("base_external_id").and_then(as_text),
            source_path: get("source_path").and_then(as_text),
        }
    }

    /// True when the item is one piece of a multi-chunk document.
    pub fn is_chunk(&self) -> bool {
        self.chunk_total.is_some_and(|t| t > 1)
    }

    /// True when a sale price below the regular price is set.
    pub fn on_sale(&self) -> bool {
        matches!((self.sale_price, self.regular_price), (Some(s), Some(r)) if s < r)
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_price(v: &Value) -> Option<f64> {
    let price = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    };
    price.filter(|p| p.is_finite())
}

fn as_count(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
