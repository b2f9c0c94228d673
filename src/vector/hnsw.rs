//! HNSW index wrapper over `hnsw_rs`.
//!
//! Wraps `hnsw_rs::Hnsw<f32, DistCosine>` with:
//! - Bidirectional embedding-id ↔ `usize` mapping
//! - Soft-delete via `HashSet` + filtered search
//! - Rebuild-from-rows (the SQLite blobs are the source of truth; the
//!   graph is a derived, rebuildable accelerator)
//!
//! # Thread Safety
//!
//! The `hnsw_rs::Hnsw` graph uses `parking_lot::RwLock` internally, so
//! `insert()` takes `&self`. Our mapping state is protected by
//! `std::sync::RwLock`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use hnsw_rs::prelude::*;

use crate::config::HnswConfig;
use crate::error::{CodeGraphError, Result};

/// HNSW graph plus id-mapping state for one vector store.
pub struct HnswIndex {
    /// The underlying HNSW graph. Uses `'static` lifetime because all
    /// data is heap-owned (not memory-mapped).
    hnsw: Hnsw<'static, f32, DistCosine>,

    /// Mutable mapping state protected by RwLock.
    state: RwLock<IndexState>,

    /// Embedding dimension (must match all inserted vectors).
    dimension: usize,
}

#[derive(Debug)]
struct IndexState {
    /// Forward map: embedding id → internal usize ID.
    id_to_internal: HashMap<String, usize>,

    /// Reverse map: internal usize ID → embedding id.
    /// Uses Vec for O(1) lookup by index.
    internal_to_id: Vec<String>,

    /// Soft-deleted internal IDs (excluded from search).
    deleted: HashSet<usize>,

    /// Next internal ID to assign (monotonically increasing).
    next_id: usize,
}

impl HnswIndex {
    /// Creates a new empty HNSW index.
    pub fn new(dimension: usize, config: &HnswConfig) -> Self {
        let hnsw = Hnsw::new(
            config.max_nb_connection,
            config.max_elements,
            config.max_layer,
            config.ef_construction,
            DistCosine,
        );

        Self {
            hnsw,
            state: RwLock::new(IndexState {
                id_to_internal: HashMap::new(),
                internal_to_id: Vec::new(),
                deleted: HashSet::new(),
                next_id: 0,
            }),
            dimension,
        }
    }

    /// Rebuilds an index from stored `(id, vector)` rows.
    ///
    /// Called on store open; insertion uses `parallel_insert` for bulk
    /// throughput.
    pub fn rebuild(
        dimension: usize,
        config: &HnswConfig,
        rows: Vec<(String, Vec<f32>)>,
    ) -> Result<Self> {
        let index = Self::new(dimension, config);
        {
            let mut state = index
                .state
                .write()
                .map_err(|_| CodeGraphError::vector("Index state lock poisoned"))?;
            for (id, vector) in &rows {
                if vector.len() != dimension {
                    return Err(CodeGraphError::vector(format!(
                        "Stored vector for {id} has dimension {}, expected {dimension}",
                        vector.len()
                    )));
                }
                let internal = state.next_id;
                state.next_id += 1;
                state.id_to_internal.insert(id.clone(), internal);
                state.internal_to_id.push(id.clone());
            }
        }

        let batch: Vec<(&Vec<f32>, usize)> = rows
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (v, i))
            .collect();
        index.hnsw.parallel_insert(&batch);
        Ok(index)
    }

    /// Inserts a vector under the given embedding id.
    ///
    /// A no-op if the id is already present and live; a previously
    /// deleted id is re-inserted under a fresh internal id.
    pub fn insert(&self, id: &str, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(CodeGraphError::vector(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| CodeGraphError::vector("Index state lock poisoned"))?;

        if let Some(&internal) = state.id_to_internal.get(id) {
            if !state.deleted.contains(&internal) {
                return Ok(());
            }
        }

        let internal_id = state.next_id;
        state.next_id += 1;
        state.id_to_internal.insert(id.to_string(), internal_id);
        state.internal_to_id.push(id.to_string());

        // Drop the lock before hnsw insert (which takes its own lock).
        drop(state);

        self.hnsw.insert((embedding, internal_id));
        Ok(())
    }

    /// Replaces the vector stored under an id.
    ///
    /// HNSW graphs cannot remove points, so the old vector is
    /// soft-deleted and the new one gets a fresh internal id.
    pub fn reinsert(&self, id: &str, embedding: &[f32]) -> Result<()> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| CodeGraphError::vector("Index state lock poisoned"))?;
            if let Some(&old) = state.id_to_internal.get(id) {
                state.deleted.insert(old);
                state.id_to_internal.remove(id);
            }
        }
        self.insert(id, embedding)
    }

    /// Marks an embedding as deleted (idempotent).
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| CodeGraphError::vector("Index state lock poisoned"))?;
        if let Some(&internal) = state.id_to_internal.get(id) {
            state.deleted.insert(internal);
        }
        Ok(())
    }

    /// k-nearest search, excluding soft-deleted entries.
    ///
    /// Returns `(embedding_id, cosine_distance)` pairs sorted by distance
    /// ascending (closest first).
    pub fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimension {
            return Err(CodeGraphError::vector(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }

        let state = self
            .state
            .read()
            .map_err(|_| CodeGraphError::vector("Index state lock poisoned"))?;

        // A concrete closure auto-implements hnsw_rs::FilterT via the
        // blanket impl, so deleted points are filtered during traversal
        // rather than post-hoc.
        let deleted_ref = &state.deleted;
        let filter_fn = |id: &usize| -> bool { !deleted_ref.contains(id) };
        let results = if state.deleted.is_empty() {
            self.hnsw.search(query, k, ef_search)
        } else {
            self.hnsw.search_filter(query, k, ef_search, Some(&filter_fn))
        };

        let mapped: Vec<(String, f32)> = results
            .into_iter()
            .filter_map(|n| {
                state
                    .internal_to_id
                    .get(n.d_id)
                    .map(|id| (id.clone(), n.distance))
            })
            .collect();

        Ok(mapped)
    }

    /// True if the id is present and not deleted.
    pub fn contains(&self, id: &str) -> bool {
        let state = self.state.read().ok();
        state.is_some_and(|s| {
            s.id_to_internal
                .get(id)
                .is_some_and(|internal| !s.deleted.contains(internal))
        })
    }

    /// Number of active (non-deleted) vectors.
    pub fn active_count(&self) -> usize {
        let state = self.state.read().ok();
        state.map_or(0, |s| s.id_to_internal.len() - deleted_live(&s))
    }

    /// Total vectors in the graph, deleted included.
    pub fn total_count(&self) -> usize {
        self.hnsw.get_nb_point()
    }

    /// Index dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deleted entries that still occupy a live forward mapping.
///
/// `reinsert` removes the forward mapping when it tombstones, so only
/// `delete`d ids are counted here.
fn deleted_live(state: &IndexState) -> usize {
    state
        .id_to_internal
        .values()
        .filter(|internal| state.deleted.contains(internal))
        .count()
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HnswConfig {
        HnswConfig::default()
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_insert_and_search() {
        let index = HnswIndex::new(4, &config());
        index.insert("a", &unit(4, 0)).unwrap();
        index.insert("b", &unit(4, 1)).unwrap();
        index.insert("c", &[0.9, 0.1, 0.0, 0.0]).unwrap();

        let hits = index.search(&unit(4, 0), 2, 50).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1 < hits[1].1, "results sorted by distance");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let index = HnswIndex::new(4, &config());
        index.insert("a", &unit(4, 0)).unwrap();
        index.insert("a", &unit(4, 0)).unwrap();
        assert_eq!(index.active_count(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = HnswIndex::new(4, &config());
        assert!(index.insert("a", &[1.0, 2.0]).is_err());
        assert!(index.search(&[1.0], 1, 10).is_err());
    }

    #[test]
    fn test_delete_excludes_from_search() {
        let index = HnswIndex::new(4, &config());
        index.insert("a", &unit(4, 0)).unwrap();
        index.insert("b", &unit(4, 1)).unwrap();
        index.delete("a").unwrap();

        let hits = index.search(&unit(4, 0), 2, 50).unwrap();
        assert!(hits.iter().all(|(id, _)| id != "a"));
        assert!(!index.contains("a"));
        assert_eq!(index.active_count(), 1);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let index = HnswIndex::new(4, &config());
        index.insert("a", &unit(4, 0)).unwrap();
        index.reinsert("a", &unit(4, 3)).unwrap();

        let hits = index.search(&unit(4, 3), 1, 50).unwrap();
        assert_eq!(hits[0].0, "a");
        assert_eq!(index.active_count(), 1);
    }

    #[test]
    fn test_rebuild_from_rows() {
        let rows = vec![
            ("a".to_string(), unit(4, 0)),
            ("b".to_string(), unit(4, 1)),
            ("c".to_string(), unit(4, 2)),
        ];
        let index = HnswIndex::rebuild(4, &config(), rows).unwrap();
        assert_eq!(index.active_count(), 3);
        let hits = index.search(&unit(4, 1), 1, 50).unwrap();
        assert_eq!(hits[0].0, "b");
    }

    #[test]
    fn test_rebuild_rejects_bad_dimension() {
        let rows = vec![("a".to_string(), vec![1.0, 2.0])];
        assert!(HnswIndex::rebuild(4, &config(), rows).is_err());
    }
}
