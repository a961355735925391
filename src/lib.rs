//! # Voltline
//!
//! Hybrid retrieval for an electrical-supplies shop assistant: the product
//! catalogue and the shop's knowledge documents are indexed in SQLite and
//! queried by exact technical term, full text and embedding similarity.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │   Sources   │──▶│   Ingest     │──▶│  SQLite    │
//! │ Woo / docs  │   │ Chunk+Embed  │   │ FTS5+Vec   │
//! └─────────────┘   └──────────────┘   └─────┬─────┘
//!                                            │
//!                                      ┌─────┴─────┐
//!                                      │ Retriever │
//!                                      └─────┬─────┘
//!                        ┌───────────────────┤
//!                        ▼                   ▼
//!                   ┌──────────┐       ┌──────────┐
//!                   │   CLI    │       │   HTTP   │
//!                   └──────────┘       └──────────┘
//! ```
//!
//! Ranking, term extraction, chunking and the [`Store`](voltline_core::store::Store)
//! trait live in `voltline-core`. This crate adds the SQLite store,
//! embedding providers, sources and the two front ends.
//!
//! ## Quick Start
//!
//! ```bash
//! voltline init
//! voltline ingest all
//! voltline embed pending
//! voltline search "diferencial DPN 2P"
//! voltline serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store |
//! | [`vector_index`] | In-memory vector index, exhaustive or HNSW |
//! | [`embedding`] | OpenAI and Ollama embedding providers |
//! | [`cache`] | Query-embedding cache |
//! | [`models`] | Source documents |
//! | [`sources`] | Product export and markdown document sources |
//! | [`ingest`] | Sync pipeline |
//! | [`embed_cmd`] | Embedding backfill |
//! | [`search`] | Retrieval service and search commands |
//! | [`get`] | Item lookup command |
//! | [`stats`] | Statistics and purge commands |
//! | [`server`] | HTTP retrieval API |

pub mod cache;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod search;
pub mod server;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod vector_index;
