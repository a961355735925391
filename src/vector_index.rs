//! In-memory vector index behind the SQLite store's vector surface.
//!
//! The store loads every active embedding into a [`VectorIndex`] tagged with
//! the `index_state` revision it was read at, and rebuilds it when the
//! revision moves. Small corpora are scanned exhaustively. From
//! [`AnnParams::threshold`] vectors up, an HNSW graph (`hnsw_rs`, cosine
//! distance) is built alongside and queries walk the graph instead.
//!
//! Graph candidates are re-scored with exact cosine similarity, so scores
//! and tie-breaking match the exhaustive scan; only recall is approximate.
//! When the type filter or the similarity threshold discards too many
//! candidates, the search widens `k` until `limit` hits are found or every
//! vector has been visited.

use hnsw_rs::prelude::*;
use tracing::{debug, warn};

use voltline_core::embedding::cosine_similarity;
use voltline_core::models::ContentType;
use voltline_core::store::type_allowed;

/// HNSW graphs cap the layer count at 16.
const MAX_LAYER: usize = 16;

/// Candidates fetched per requested hit on the first graph walk.
const OVERSAMPLE: usize = 4;

/// Graph construction and search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnParams {
    /// Vector count from which a graph is built. Below it every query is an
    /// exhaustive scan.
    pub threshold: usize,
    /// Links per node (`M`).
    pub max_nb_connection: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            threshold: 2000,
            max_nb_connection: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

pub struct VectorEntry {
    pub id: i64,
    pub content_type: ContentType,
    pub vector: Vec<f32>,
}

struct Graph {
    hnsw: Hnsw<'static, f32, DistCosine>,
    dims: usize,
    /// Entries inserted into the graph; zero-norm and off-dimension vectors
    /// are left out.
    len: usize,
}

/// Active embeddings as of one store revision.
pub struct VectorIndex {
    revision: i64,
    entries: Vec<VectorEntry>,
    graph: Option<Graph>,
    ef_search: usize,
}

impl VectorIndex {
    /// Build the index for `entries`. CPU-bound when a graph is built; run
    /// it off the async executor.
    pub fn build(revision: i64, entries: Vec<VectorEntry>, params: &AnnParams) -> Self {
        let graph = if entries.len() >= params.threshold.max(1) {
            build_graph(&entries, params)
        } else {
            None
        };
        debug!(
            revision,
            vectors = entries.len(),
            ann = graph.is_some(),
            "built vector index"
        );
        Self {
            revision,
            entries,
            graph,
            ef_search: params.ef_search.max(1),
        }
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when queries walk an HNSW graph.
    pub fn is_approximate(&self) -> bool {
        self.graph.is_some()
    }

    /// `(id, similarity)` pairs above `min_similarity`, best first, ties by
    /// ascending id, at most `limit`.
    pub fn search(
        &self,
        query: &[f32],
        types: &[ContentType],
        min_similarity: f32,
        limit: usize,
    ) -> Vec<(i64, f32)> {
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut scored = match &self.graph {
            Some(graph) if graph.dims == query.len() => {
                self.graph_search(graph, query, types, min_similarity, limit)
            }
            _ => self.scan(query, types, min_similarity),
        };
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }

    fn scan(&self, query: &[f32], types: &[ContentType], min_similarity: f32) -> Vec<(i64, f32)> {
        self.entries
            .iter()
            .filter(|e| type_allowed(types, e.content_type))
            .map(|e| (e.id, cosine_similarity(query, &e.vector)))
            .filter(|(_, sim)| *sim >= min_similarity)
            .collect()
    }

    fn graph_search(
        &self,
        graph: &Graph,
        query: &[f32],
        types: &[ContentType],
        min_similarity: f32,
        limit: usize,
    ) -> Vec<(i64, f32)> {
        let mut k = limit.saturating_mul(OVERSAMPLE).min(graph.len).max(1);
        loop {
            let neighbours = graph.hnsw.search(query, k, self.ef_search.max(k));
            let scored: Vec<(i64, f32)> = neighbours
                .iter()
                .filter_map(|n| self.entries.get(n.d_id))
                .filter(|e| type_allowed(types, e.content_type))
                .map(|e| (e.id, cosine_similarity(query, &e.vector)))
                .filter(|(_, sim)| *sim >= min_similarity)
                .collect();
            if scored.len() >= limit || k >= graph.len {
                return scored;
            }
            k = k.saturating_mul(2).min(graph.len);
        }
    }
}

fn build_graph(entries: &[VectorEntry], params: &AnnParams) -> Option<Graph> {
    let dims = entries.first()?.vector.len();
    if dims == 0 {
        return None;
    }
    let hnsw = Hnsw::<f32, DistCosine>::new(
        params.max_nb_connection.max(2),
        entries.len(),
        MAX_LAYER,
        params.ef_construction.max(1),
        DistCosine {},
    );

    let mut len = 0;
    let mut skipped = 0;
    for (data_id, entry) in entries.iter().enumerate() {
        let norm: f32 = entry.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if entry.vector.len() != dims || norm < f32::EPSILON {
            skipped += 1;
            continue;
        }
        hnsw.insert_slice((entry.vector.as_slice(), data_id));
        len += 1;
    }
    if skipped > 0 {
        warn!(skipped, dims, "vectors left out of the HNSW graph (dimension or zero norm)");
    }
    if len == 0 {
        return None;
    }
    Some(Graph { hnsw, dims, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random unit-ish vectors.
    fn vectors(count: usize, dims: usize) -> Vec<Vec<f32>> {
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        (0..count)
            .map(|_| {
                (0..dims)
                    .map(|_| {
                        state = state
                            .wrapping_mul(6364136223846793005)
                            .wrapping_add(1442695040888963407);
                        ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
                    })
                    .collect()
            })
            .collect()
    }

    fn entries(vectors: &[Vec<f32>]) -> Vec<VectorEntry> {
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| VectorEntry {
                id: i as i64 + 1,
                content_type: if i % 2 == 0 {
                    ContentType::Product
                } else {
                    ContentType::Faq
                },
                vector: v.clone(),
            })
            .collect()
    }

    fn ann_params() -> AnnParams {
        AnnParams {
            threshold: 1,
            ..AnnParams::default()
        }
    }

    #[test]
    fn small_corpora_are_scanned() {
        let data = vectors(10, 8);
        let index = VectorIndex::build(3, entries(&data), &AnnParams::default());
        assert!(!index.is_approximate());
        assert_eq!(index.revision(), 3);
        assert_eq!(index.len(), 10);

        let hits = index.search(&data[4], &[], -1.0, 3);
        assert_eq!(hits[0].0, 5);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn graph_finds_stored_vectors() {
        let data = vectors(300, 16);
        let index = VectorIndex::build(1, entries(&data), &ann_params());
        assert!(index.is_approximate());

        for target in [0usize, 57, 128, 299] {
            let hits = index.search(&data[target], &[], 0.0, 5);
            assert_eq!(hits[0].0, target as i64 + 1);
            assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
            assert!(hits.iter().all(|(_, sim)| *sim >= 0.0));
        }
    }

    #[test]
    fn graph_scores_match_exact_cosine() {
        let data = vectors(200, 12);
        let exact = VectorIndex::build(1, entries(&data), &AnnParams::default());
        let approx = VectorIndex::build(1, entries(&data), &ann_params());

        let query = &data[42];
        let a = approx.search(query, &[], 0.0, 3);
        let e = exact.search(query, &[], 0.0, 3);
        assert_eq!(a[0], e[0]);
        for (id, sim) in &a {
            let stored = &data[*id as usize - 1];
            assert!((cosine_similarity(query, stored) - sim).abs() < 1e-6);
        }
    }

    #[test]
    fn graph_search_widens_for_type_filter() {
        let data = vectors(300, 16);
        let index = VectorIndex::build(1, entries(&data), &ann_params());

        let hits = index.search(&data[10], &[ContentType::Faq], -1.0, 20);
        assert_eq!(hits.len(), 20);
        assert!(hits.iter().all(|(id, _)| (id - 1) % 2 == 1));
    }

    #[test]
    fn off_dimension_query_falls_back_to_scan() {
        let data = vectors(50, 8);
        let index = VectorIndex::build(1, entries(&data), &ann_params());
        assert!(index.is_approximate());
        assert!(index.search(&[1.0, 0.0], &[], 0.5, 5).is_empty());
        assert!(index.search(&[], &[], 0.0, 5).is_empty());
    }
}
