//! # Voltline Core
//!
//! Storage-agnostic retrieval logic for Voltline: data models, text
//! analysis, technical term extraction, chunking, the [`store::Store`]
//! abstraction with an in-memory backend, and the hybrid ranking algorithm.
//!
//! This crate performs no filesystem or network I/O. The only runtime it
//! touches is `tokio::time`, used to bound store queries issued by the
//! ranker. Concrete stores and embedding providers live in the `voltline`
//! application crate.

pub mod analyze;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
pub mod terms;
