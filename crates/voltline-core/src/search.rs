//! Hybrid ranking over the three store surfaces.
//!
//! The ranker works entirely through the [`Store`] trait. Callers embed the
//! query themselves and pass the vector in; the ranker never talks to an
//! embedding provider.
//!
//! # Hybrid algorithm
//!
//! 1. Extract technical terms from the query. For each term, run an
//!    exact-title lookup. Every item found is an exact match, tagged with
//!    the index of the first term that found it.
//! 2. If fewer than `limit` items were found, run vector and full-text
//!    search with `limit × candidate_multiplier` candidates each. When terms
//!    were extracted but none matched a title, the full-text query is the
//!    space-joined terms instead of the raw query.
//! 3. Fuse the two lists with weighted reciprocal rank fusion:
//!    `vw / (k + vector_rank) + tw / (k + text_rank)`, where a missing rank
//!    counts as [`MISSING_RANK`]. Items already matched exactly are skipped.
//! 4. Sort: every exact match before every fused match. Exact matches by
//!    term index, then title, then id; fused matches by score (desc), then id.
//! 5. Truncate to `limit`.
//!
//! # Failure policy
//!
//! Each store call is bounded by `surface_timeout`, the whole search by
//! `timeout`. A surface that fails or times out is logged and skipped. The
//! call fails with [`RetrievalError::StoreUnavailable`] when the store
//! reports the connection itself is down, or when every surface attempted
//! failed. Exceeding the overall timeout fails the call instead of returning
//! partial results.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::analyze::fold;
use crate::error::{RetrievalError, StoreError};
use crate::models::{ContentType, IndexedItem, SearchHit};
use crate::store::Store;
use crate::terms::TermExtractor;

/// Score reported for exact-title matches. Ordering never reads it.
pub const EXACT_MATCH_SCORE: f64 = 1000.0;

/// Rank assigned to a candidate absent from one surface's list.
pub const MISSING_RANK: usize = 999_999;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    pub vector_weight: f64,
    pub text_weight: f64,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    /// Candidates fetched per fused surface, as a multiple of `limit`.
    pub candidate_multiplier: usize,
    pub default_limit: usize,
    pub max_limit: usize,
    /// Default threshold for standalone vector search.
    pub min_similarity: f32,
    /// Threshold for the vector surface inside hybrid fusion.
    pub hybrid_min_similarity: f32,
    pub max_query_chars: usize,
    pub timeout: Duration,
    pub surface_timeout: Duration,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            vector_weight: 0.6,
            text_weight: 0.4,
            rrf_k: 60.0,
            candidate_multiplier: 4,
            default_limit: 10,
            max_limit: 100,
            min_similarity: 0.5,
            hybrid_min_similarity: 0.0,
            max_query_chars: 1000,
            timeout: Duration::from_secs(5),
            surface_timeout: Duration::from_secs(2),
        }
    }
}

impl RetrievalParams {
    /// Requested limit, defaulted and capped at `max_limit`.
    pub fn resolve_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }
}

/// Inputs for a single hybrid search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Pre-computed query embedding. `None` runs lexical surfaces only.
    pub query_vec: Option<&'a [f32]>,
    /// Allow-list of content types; empty means all.
    pub content_types: &'a [ContentType],
    pub limit: Option<usize>,
    pub params: &'a RetrievalParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    ExactTitle,
    Hybrid,
}

/// Why an item made it into the hybrid result list.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchKind {
    /// The title contains an extracted technical term.
    ExactTitle { term_index: usize, term: String },
    /// Reciprocal rank fusion of the vector and text surfaces.
    Fused {
        score: f64,
        vector_rank: Option<usize>,
        text_rank: Option<usize>,
    },
}

/// One ranked hybrid search result.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub item: IndexedItem,
    pub kind: MatchKind,
}

impl RankedItem {
    pub fn match_type(&self) -> MatchType {
        match self.kind {
            MatchKind::ExactTitle { .. } => MatchType::ExactTitle,
            MatchKind::Fused { .. } => MatchType::Hybrid,
        }
    }

    pub fn score(&self) -> f64 {
        match self.kind {
            MatchKind::ExactTitle { .. } => EXACT_MATCH_SCORE,
            MatchKind::Fused { score, .. } => score,
        }
    }

    pub fn matched_term(&self) -> Option<&str> {
        match &self.kind {
            MatchKind::ExactTitle { term, .. } => Some(term),
            MatchKind::Fused { .. } => None,
        }
    }

    /// Result ordering: exact matches first, then fused matches.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        match (&self.kind, &other.kind) {
            (
                MatchKind::ExactTitle { term_index: a, .. },
                MatchKind::ExactTitle { term_index: b, .. },
            ) => a
                .cmp(b)
                .then_with(|| fold(&self.item.title).cmp(&fold(&other.item.title)))
                .then(self.item.id.cmp(&other.item.id)),
            (MatchKind::ExactTitle { .. }, MatchKind::Fused { .. }) => Ordering::Less,
            (MatchKind::Fused { .. }, MatchKind::ExactTitle { .. }) => Ordering::Greater,
            (MatchKind::Fused { score: a, .. }, MatchKind::Fused { score: b, .. }) => {
                b.total_cmp(a).then(self.item.id.cmp(&other.item.id))
            }
        }
    }
}

#[derive(Serialize)]
struct RankedItemView<'a> {
    #[serde(flatten)]
    item: &'a IndexedItem,
    score: f64,
    match_type: MatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_term: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_rank: Option<usize>,
}

impl Serialize for RankedItem {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (vector_rank, text_rank) = match self.kind {
            MatchKind::Fused {
                vector_rank,
                text_rank,
                ..
            } => (vector_rank, text_rank),
            MatchKind::ExactTitle { .. } => (None, None),
        };
        RankedItemView {
            item: &self.item,
            score: self.score(),
            match_type: self.match_type(),
            matched_term: self.matched_term(),
            vector_rank,
            text_rank,
        }
        .serialize(serializer)
    }
}

/// A candidate after reciprocal rank fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub item: IndexedItem,
    pub score: f64,
    pub vector_rank: Option<usize>,
    pub text_rank: Option<usize>,
}

/// Weighted reciprocal rank fusion of two ranked lists.
///
/// Ranks are 1-based positions in each list. The output is sorted by fused
/// score (desc), then item id (asc).
pub fn reciprocal_rank_fusion(
    vector: &[SearchHit],
    text: &[SearchHit],
    params: &RetrievalParams,
) -> Vec<FusedCandidate> {
    let mut ranks: HashMap<i64, (IndexedItem, Option<usize>, Option<usize>)> = HashMap::new();

    for (pos, hit) in vector.iter().enumerate() {
        let entry = ranks
            .entry(hit.item.id)
            .or_insert_with(|| (hit.item.clone(), None, None));
        entry.1.get_or_insert(pos + 1);
    }
    for (pos, hit) in text.iter().enumerate() {
        let entry = ranks
            .entry(hit.item.id)
            .or_insert_with(|| (hit.item.clone(), None, None));
        entry.2.get_or_insert(pos + 1);
    }

    let mut fused: Vec<FusedCandidate> = ranks
        .into_values()
        .map(|(item, vector_rank, text_rank)| {
            let v = vector_rank.unwrap_or(MISSING_RANK) as f64;
            let t = text_rank.unwrap_or(MISSING_RANK) as f64;
            FusedCandidate {
                item,
                score: params.vector_weight / (params.rrf_k + v)
                    + params.text_weight / (params.rrf_k + t),
                vector_rank,
                text_rank,
            }
        })
        .collect();

    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.item.id.cmp(&b.item.id)));
    fused
}

/// Reject empty or oversized queries before any I/O. Callers that embed
/// the query themselves run this first, with `has_embedding = false`.
pub fn validate_query(
    query: &str,
    has_embedding: bool,
    params: &RetrievalParams,
) -> Result<(), RetrievalError> {
    let len = query.chars().count();
    if len > params.max_query_chars {
        return Err(RetrievalError::MalformedQuery(format!(
            "query is {} characters, the maximum is {}",
            len, params.max_query_chars
        )));
    }
    if query.trim().is_empty() && !has_embedding {
        return Err(RetrievalError::MalformedQuery(
            "query text is empty and no embedding was given".into(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
enum SurfaceError {
    Store(StoreError),
    TimedOut,
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, SurfaceError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SurfaceError::Store(err)),
        Err(_) => Err(SurfaceError::TimedOut),
    }
}

/// Tracks which surfaces failed so total failure can be told apart from
/// partial degradation.
#[derive(Default)]
struct SurfaceTally {
    attempted: usize,
    failed: usize,
    timed_out: usize,
}

impl SurfaceTally {
    /// Record one surface outcome. A connection-level failure aborts the search.
    fn record<T>(
        &mut self,
        surface: &str,
        result: Result<T, SurfaceError>,
    ) -> Result<Option<T>, RetrievalError> {
        self.attempted += 1;
        match result {
            Ok(value) => Ok(Some(value)),
            Err(SurfaceError::Store(err)) if err.is_unavailable() => {
                Err(RetrievalError::StoreUnavailable(err.to_string()))
            }
            Err(SurfaceError::Store(err)) => {
                warn!(surface, error = %err, "search surface failed, continuing without it");
                self.failed += 1;
                Ok(None)
            }
            Err(SurfaceError::TimedOut) => {
                warn!(surface, "search surface timed out, continuing without it");
                self.failed += 1;
                self.timed_out += 1;
                Ok(None)
            }
        }
    }

    fn all_failed(&self, surface_timeout: Duration) -> Option<RetrievalError> {
        if self.attempted == 0 || self.failed < self.attempted {
            return None;
        }
        if self.timed_out == self.failed {
            Some(RetrievalError::Timeout(surface_timeout))
        } else {
            Some(RetrievalError::StoreUnavailable(format!(
                "all {} search surfaces failed",
                self.attempted
            )))
        }
    }
}

/// Run a hybrid search against a [`Store`] backend.
///
/// Read-only; the only side effect is logging.
pub async fn hybrid_search<S: Store + ?Sized>(
    store: &S,
    extractor: &TermExtractor,
    req: &SearchRequest<'_>,
) -> Result<Vec<RankedItem>, RetrievalError> {
    let params = req.params;
    validate_query(req.query, req.query_vec.is_some(), params)?;

    let limit = params.resolve_limit(req.limit);
    if limit == 0 {
        return Ok(Vec::new());
    }

    match tokio::time::timeout(params.timeout, run_hybrid(store, extractor, req, limit)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout = ?params.timeout, "hybrid search exceeded its time budget");
            Err(RetrievalError::Timeout(params.timeout))
        }
    }
}

async fn run_hybrid<S: Store + ?Sized>(
    store: &S,
    extractor: &TermExtractor,
    req: &SearchRequest<'_>,
    limit: usize,
) -> Result<Vec<RankedItem>, RetrievalError> {
    let params = req.params;
    let types = req.content_types;
    let terms = extractor.extract(req.query);
    debug!(?terms, "extracted technical terms");

    let mut tally = SurfaceTally::default();
    let mut seen: HashSet<i64> = HashSet::new();
    let mut results: Vec<RankedItem> = Vec::new();

    if !terms.is_empty() {
        let lookups = terms.iter().map(|term| {
            bounded(
                params.surface_timeout,
                store.exact_title_search(term, types, limit),
            )
        });
        let outcomes = join_all(lookups).await;

        let mut group = SurfaceTally::default();
        for (term_index, (term, outcome)) in terms.iter().zip(outcomes).enumerate() {
            let Some(items) = group.record("exact_title", outcome)? else {
                continue;
            };
            for item in items {
                if seen.insert(item.id) {
                    results.push(RankedItem {
                        item,
                        kind: MatchKind::ExactTitle {
                            term_index,
                            term: term.clone(),
                        },
                    });
                }
            }
        }
        // The per-term lookups count as one surface.
        tally.attempted += 1;
        if group.failed == group.attempted {
            tally.failed += 1;
            if group.timed_out == group.failed {
                tally.timed_out += 1;
            }
        }
    }

    let exact_hits = results.len();
    debug!(exact_hits, "exact title pass finished");

    if results.len() < limit {
        let text_query = if !terms.is_empty() && exact_hits == 0 {
            terms.join(" ")
        } else {
            req.query.to_string()
        };
        let candidates = limit.saturating_mul(params.candidate_multiplier.max(1));

        let vector_fut = async {
            match req.query_vec {
                Some(vec) => Some(
                    bounded(
                        params.surface_timeout,
                        store.vector_search(vec, types, params.hybrid_min_similarity, candidates),
                    )
                    .await,
                ),
                None => None,
            }
        };
        let text_fut = bounded(
            params.surface_timeout,
            store.text_search(&text_query, types, candidates),
        );
        let (vector_outcome, text_outcome) = futures::join!(vector_fut, text_fut);

        let vector_hits = match vector_outcome {
            Some(outcome) => tally.record("vector", outcome)?.unwrap_or_default(),
            None => Vec::new(),
        };
        let text_hits = tally.record("text", text_outcome)?.unwrap_or_default();
        debug!(
            vector = vector_hits.len(),
            text = text_hits.len(),
            text_query = %text_query,
            "fusion candidates"
        );

        for candidate in reciprocal_rank_fusion(&vector_hits, &text_hits, params) {
            if seen.insert(candidate.item.id) {
                results.push(RankedItem {
                    item: candidate.item,
                    kind: MatchKind::Fused {
                        score: candidate.score,
                        vector_rank: candidate.vector_rank,
                        text_rank: candidate.text_rank,
                    },
                });
            }
        }
    }

    if let Some(err) = tally.all_failed(params.surface_timeout) {
        return Err(err);
    }

    results.sort_by(RankedItem::rank_cmp);
    results.truncate(limit);
    Ok(results)
}

/// Standalone vector search.
///
/// `min_similarity` defaults to [`RetrievalParams::min_similarity`].
pub async fn vector_search<S: Store + ?Sized>(
    store: &S,
    query_vec: &[f32],
    content_types: &[ContentType],
    limit: Option<usize>,
    min_similarity: Option<f32>,
    params: &RetrievalParams,
) -> Result<Vec<SearchHit>, RetrievalError> {
    if query_vec.is_empty() {
        return Err(RetrievalError::MalformedQuery(
            "query embedding is empty".into(),
        ));
    }
    let limit = params.resolve_limit(limit);
    if limit == 0 {
        return Ok(Vec::new());
    }
    let threshold = min_similarity.unwrap_or(params.min_similarity);
    with_timeout(
        params.timeout,
        store.vector_search(query_vec, content_types, threshold, limit),
    )
    .await
}

/// Standalone full-text search.
pub async fn text_search<S: Store + ?Sized>(
    store: &S,
    query: &str,
    content_types: &[ContentType],
    limit: Option<usize>,
    params: &RetrievalParams,
) -> Result<Vec<SearchHit>, RetrievalError> {
    validate_query(query, false, params)?;
    let limit = params.resolve_limit(limit);
    if limit == 0 {
        return Ok(Vec::new());
    }
    with_timeout(
        params.timeout,
        store.text_search(query, content_types, limit),
    )
    .await
}

/// Active item by external id.
pub async fn get_by_external_id<S: Store + ?Sized>(
    store: &S,
    external_id: &str,
    params: &RetrievalParams,
) -> Result<Option<IndexedItem>, RetrievalError> {
    if external_id.trim().is_empty() {
        return Err(RetrievalError::MalformedQuery(
            "external id is empty".into(),
        ));
    }
    with_timeout(params.timeout, store.get_by_external_id(external_id.trim())).await
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, RetrievalError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(RetrievalError::from),
        Err(_) => Err(RetrievalError::Timeout(limit)),
    }
}
