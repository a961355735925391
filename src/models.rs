//! Application-side data models.
//!
//! Sources produce [`SourceDocument`]s; the ingestion pipeline turns each
//! one into one or more corpus items (see [`voltline_core::models`]).

use serde_json::Value;

use voltline_core::models::ContentType;

/// A document as read from a source, before hashing and chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    /// Base external id. Chunks append `_chunk_<n>`.
    pub external_id: String,
    pub content_type: ContentType,
    pub title: String,
    pub body: String,
    /// Copied onto every chunk.
    pub metadata: Value,
}
