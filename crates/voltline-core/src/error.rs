//! Error types shared by stores, embedding providers, and the ranker.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`Store`](crate::store::Store) implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing store cannot be reached or no connection could be acquired.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but the query itself failed.
    #[error("store query failed: {0}")]
    Query(String),
    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True when the failure concerns the connection rather than one query.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by [`EmbeddingProvider`](crate::embedding::EmbeddingProvider) implementations.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding provider failed: {0}")]
    Provider(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
    #[error("embedding provider returned no vectors")]
    EmptyResponse,
}

/// Failures surfaced by the public retrieval operations.
///
/// An empty result list is a successful outcome and never maps to an error.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("malformed query: {0}")]
    MalformedQuery(String),
    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),
}

impl RetrievalError {
    /// Stable machine-readable code, used by the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            RetrievalError::StoreUnavailable(_) => "store_unavailable",
            RetrievalError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RetrievalError::MalformedQuery(_) => "malformed_query",
            RetrievalError::Timeout(_) => "timeout",
        }
    }
}

impl From<StoreError> for RetrievalError {
    fn from(err: StoreError) -> Self {
        RetrievalError::StoreUnavailable(err.to_string())
    }
}

impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        RetrievalError::EmbeddingUnavailable(err.to_string())
    }
}
