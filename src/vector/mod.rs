//! Vector store: dense-vector persistence and similarity search.
//!
//! Vectors live as little-endian `f32` blobs in the store's own SQLite
//! file — the durable source of truth. Search runs in one of two modes,
//! transparent to callers:
//!
//! - **native** — an in-process HNSW index (cosine) built over the stored
//!   blobs on open and kept in sync on writes; similarity is reported as
//!   `1 / (1 + distance)`
//! - **fallback** — linear scan with cosine similarity, reported as
//!   `(cos + 1) / 2`
//!
//! The store drops to fallback permanently after
//! [`MAX_INDEX_BUILD_ATTEMPTS`] failed index builds; thresholds are
//! always compared in the active mode's own similarity mapping.

pub mod hnsw;

pub use hnsw::HnswIndex;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::config::{HnswConfig, VectorConfig};
use crate::error::{Result, StorageError};
use crate::storage::manager::{OpenOptions, SqlManager};
use crate::types::{EntityId, Timestamp};

/// Failed index builds tolerated before the store stays in fallback.
pub const MAX_INDEX_BUILD_ATTEMPTS: u32 = 3;

/// A stored embedding row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// Stable embedding id (one per entity and model).
    pub id: String,
    /// Entity this embedding describes.
    pub entity_id: EntityId,
    /// The text that was embedded.
    pub content: String,
    /// Dense vector; length equals the store dimension.
    pub vector: Vec<f32>,
    /// Free-form metadata.
    pub metadata: Value,
    /// Creation time (ms since epoch).
    pub created_at: Timestamp,
    /// Model that produced the vector.
    pub model_name: String,
}

impl Embedding {
    /// Builds an embedding with a stable id derived from the entity and
    /// model, so re-embedding the same entity overwrites in place.
    pub fn for_entity(
        entity_id: EntityId,
        content: impl Into<String>,
        vector: Vec<f32>,
        model_name: impl Into<String>,
    ) -> Self {
        let model_name = model_name.into();
        let digest = Sha256::digest(format!("{}|{}", entity_id.as_str(), model_name).as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(12);
        Self {
            id,
            entity_id,
            content: content.into(),
            vector,
            metadata: Value::Object(serde_json::Map::new()),
            created_at: Timestamp::now(),
            model_name,
        }
    }
}

/// Which search engine is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// HNSW-accelerated search.
    Native,
    /// Linear-scan cosine search.
    Fallback,
}

/// One similarity search result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Embedding id.
    pub id: String,
    /// Entity the embedding describes.
    pub entity_id: EntityId,
    /// Similarity in `[0, 1]`, higher is closer, mapped per mode.
    pub similarity: f32,
    /// Raw cosine distance in `[0, 2]`.
    pub distance: f32,
}

/// Optional constraints for [`VectorStore::search_with_filters`].
#[derive(Clone, Debug, Default)]
pub struct SearchFilters {
    /// Maximum results.
    pub limit: usize,
    /// Minimum similarity (compared in the active mode's mapping).
    pub threshold: Option<f32>,
    /// Every key/value pair here must appear in the embedding metadata.
    pub metadata_filter: Option<Value>,
    /// Inclusive `created_at` range.
    pub date_range: Option<(Timestamp, Timestamp)>,
}

/// Store statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorStats {
    /// Stored vectors.
    pub total_vectors: u64,
    /// Configured dimension.
    pub dimension: usize,
    /// Active search mode.
    pub mode: SearchMode,
}

/// Dense-vector store over its own SQLite file.
pub struct VectorStore {
    manager: SqlManager,
    dimension: usize,
    hnsw_config: HnswConfig,
    index: RwLock<Option<HnswIndex>>,
    build_attempts: AtomicU32,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dimension", &self.dimension)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Opens or creates a vector store at `path`.
    ///
    /// The file's dimension is fixed on creation; reopening with a
    /// different configured dimension fails with `DimensionMismatch`.
    #[instrument(skip(config, hnsw), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, config: &VectorConfig, hnsw: &HnswConfig) -> Result<Self> {
        let manager = SqlManager::open(path, OpenOptions::default())?;
        Self::from_manager(manager, config, hnsw)
    }

    /// Opens an in-memory store (tests).
    pub fn open_in_memory(config: &VectorConfig, hnsw: &HnswConfig) -> Result<Self> {
        let manager = SqlManager::open_in_memory()?;
        Self::from_manager(manager, config, hnsw)
    }

    fn from_manager(
        manager: SqlManager,
        config: &VectorConfig,
        hnsw: &HnswConfig,
    ) -> Result<Self> {
        manager.execute_batch(
            "CREATE TABLE IF NOT EXISTS embeddings (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                vector BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                model_name TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_entity ON embeddings(entity_id);
            CREATE TABLE IF NOT EXISTS vector_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        )?;

        // The dimension is locked into the file on first open.
        let stored: Option<i64> = manager.with_conn(|c| {
            c.query_row(
                "SELECT value FROM vector_meta WHERE key = 'dimension'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::from(other)),
            })
            .map_err(Into::into)
        })?;
        match stored {
            Some(dim) if dim as usize != config.dimension => {
                return Err(StorageError::DimensionMismatch {
                    expected: dim as usize,
                    got: config.dimension,
                }
                .into());
            }
            Some(_) => {}
            None => {
                manager.with_conn(|c| {
                    c.execute(
                        "INSERT INTO vector_meta (key, value) VALUES ('dimension', ?1)",
                        rusqlite::params![config.dimension as i64],
                    )
                    .map_err(StorageError::from)?;
                    Ok(())
                })?;
            }
        }

        let store = Self {
            manager,
            dimension: config.dimension,
            hnsw_config: hnsw.clone(),
            index: RwLock::new(None),
            build_attempts: AtomicU32::new(0),
        };

        if config.force_fallback {
            info!("Vector store opened in forced fallback mode");
            store.build_attempts.store(MAX_INDEX_BUILD_ATTEMPTS, Ordering::Relaxed);
        } else {
            store.try_build_index();
        }
        Ok(store)
    }

    /// Current search mode.
    pub fn mode(&self) -> SearchMode {
        if self.index.read().is_some() {
            SearchMode::Native
        } else {
            SearchMode::Fallback
        }
    }

    /// Attempts to (re)build the HNSW index from stored rows.
    ///
    /// After [`MAX_INDEX_BUILD_ATTEMPTS`] failures the store stops
    /// trying and serves linear scans permanently.
    fn try_build_index(&self) {
        if self.build_attempts.load(Ordering::Relaxed) >= MAX_INDEX_BUILD_ATTEMPTS {
            return;
        }
        match self.load_all_vectors().and_then(|rows| {
            HnswIndex::rebuild(self.dimension, &self.hnsw_config, rows)
        }) {
            Ok(index) => {
                debug!(vectors = index.active_count(), "HNSW index built");
                *self.index.write() = Some(index);
            }
            Err(err) => {
                let attempts = self.build_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    error = %err,
                    attempts,
                    "HNSW index build failed; will fall back after {MAX_INDEX_BUILD_ATTEMPTS} attempts"
                );
                *self.index.write() = None;
            }
        }
    }

    fn load_all_vectors(&self) -> Result<Vec<(String, Vec<f32>)>> {
        self.manager.with_conn(|c| {
            let mut stmt = c
                .prepare_cached("SELECT id, vector FROM embeddings")
                .map_err(StorageError::from)?;
            let mut rows = stmt.query([]).map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                let id: String = row.get(0).map_err(StorageError::from)?;
                let blob: Vec<u8> = row.get(1).map_err(StorageError::from)?;
                out.push((id, blob_to_vec(&blob)?));
            }
            Ok(out)
        })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            }
            .into());
        }
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts or replaces one embedding.
    #[instrument(skip(self, embedding), fields(id = %embedding.id))]
    pub fn insert(&self, embedding: &Embedding) -> Result<()> {
        self.check_dimension(&embedding.vector)?;
        self.manager.with_conn(|c| {
            upsert_embedding_row(c, embedding)?;
            Ok(())
        })?;
        if let Some(index) = self.index.read().as_ref() {
            index.reinsert(&embedding.id, &embedding.vector)?;
        }
        Ok(())
    }

    /// Inserts a batch inside one transaction, deduplicated by id
    /// (last occurrence wins).
    #[instrument(skip(self, embeddings), fields(count = embeddings.len()))]
    pub fn insert_batch(&self, embeddings: &[Embedding]) -> Result<usize> {
        let mut deduped: Vec<&Embedding> = Vec::with_capacity(embeddings.len());
        {
            let mut seen: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
            for e in embeddings {
                self.check_dimension(&e.vector)?;
                match seen.get(e.id.as_str()) {
                    Some(&pos) => deduped[pos] = e,
                    None => {
                        seen.insert(e.id.as_str(), deduped.len());
                        deduped.push(e);
                    }
                }
            }
        }

        self.manager.with_tx(|tx| {
            for e in &deduped {
                upsert_embedding_row(tx, e)?;
            }
            Ok(())
        })?;

        if let Some(index) = self.index.read().as_ref() {
            for e in &deduped {
                index.reinsert(&e.id, &e.vector)?;
            }
        }
        Ok(deduped.len())
    }

    /// Replaces the vector (and optionally metadata) of an embedding.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the id is absent.
    pub fn update(&self, id: &str, vector: &[f32], metadata: Option<Value>) -> Result<()> {
        self.check_dimension(vector)?;
        let affected = self.manager.with_conn(|c| {
            let blob = vec_to_blob(vector);
            let n = match &metadata {
                Some(meta) => c
                    .execute(
                        "UPDATE embeddings SET vector = ?2, metadata = ?3 WHERE id = ?1",
                        rusqlite::params![
                            id,
                            blob,
                            serde_json::to_string(meta).map_err(StorageError::from)?
                        ],
                    )
                    .map_err(StorageError::from)?,
                None => c
                    .execute(
                        "UPDATE embeddings SET vector = ?2 WHERE id = ?1",
                        rusqlite::params![id, blob],
                    )
                    .map_err(StorageError::from)?,
            };
            Ok(n)
        })?;
        if affected == 0 {
            return Err(StorageError::not_found("embedding", id).into());
        }
        if let Some(index) = self.index.read().as_ref() {
            index.reinsert(id, vector)?;
        }
        Ok(())
    }

    /// Deletes an embedding.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the id is absent.
    pub fn delete(&self, id: &str) -> Result<()> {
        let affected = self.manager.with_conn(|c| {
            c.execute(
                "DELETE FROM embeddings WHERE id = ?1",
                rusqlite::params![id],
            )
            .map_err(StorageError::from)
            .map_err(Into::into)
        })?;
        if affected == 0 {
            return Err(StorageError::not_found("embedding", id).into());
        }
        if let Some(index) = self.index.read().as_ref() {
            index.delete(id)?;
        }
        Ok(())
    }

    /// Drops every embedding and resets the index.
    pub fn clear(&self) -> Result<()> {
        self.manager.execute_batch("DELETE FROM embeddings")?;
        let mut index = self.index.write();
        if index.is_some() {
            *index = Some(HnswIndex::new(self.dimension, &self.hnsw_config));
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetches one embedding by id.
    pub fn get(&self, id: &str) -> Result<Option<Embedding>> {
        self.manager.with_conn(|c| {
            let mut stmt = c
                .prepare_cached(
                    "SELECT id, entity_id, content, vector, metadata, created_at, model_name
                     FROM embeddings WHERE id = ?1",
                )
                .map_err(StorageError::from)?;
            let mut rows = stmt.query(rusqlite::params![id]).map_err(StorageError::from)?;
            match rows.next().map_err(StorageError::from)? {
                Some(row) => Ok(Some(embedding_from_row(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Number of stored embeddings.
    pub fn count(&self) -> Result<u64> {
        self.manager.with_conn(|c| {
            let n: i64 = c
                .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
                .map_err(StorageError::from)?;
            Ok(n as u64)
        })
    }

    /// Store statistics.
    pub fn stats(&self) -> Result<VectorStats> {
        Ok(VectorStats {
            total_vectors: self.count()?,
            dimension: self.dimension,
            mode: self.mode(),
        })
    }

    /// k-nearest search.
    ///
    /// Returns at most `limit` hits sorted by similarity descending.
    /// With fewer than `limit` stored vectors, all of them come back.
    #[instrument(skip(self, query))]
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        self.check_dimension(query)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let raw = {
            let guard = self.index.read();
            match guard.as_ref() {
                Some(index) => {
                    let ef = self.hnsw_config.ef_search.max(limit);
                    Some(index.search(query, limit, ef)?)
                }
                None => None,
            }
        };

        match raw {
            Some(raw) => {
                let mut hits = Vec::with_capacity(raw.len());
                for (id, distance) in raw {
                    if let Some(entity_id) = self.entity_id_for(&id)? {
                        hits.push(SearchHit {
                            id,
                            entity_id,
                            similarity: 1.0 / (1.0 + distance),
                            distance,
                        });
                    }
                }
                Ok(hits)
            }
            None => self.linear_search(query, limit),
        }
    }

    /// Filtered search: threshold, metadata subset, and date range.
    pub fn search_with_filters(
        &self,
        query: &[f32],
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>> {
        let limit = if filters.limit == 0 { 10 } else { filters.limit };
        // Over-fetch so post-filters don't starve the result list.
        let candidates = self.search(query, limit.saturating_mul(4).max(limit))?;

        let mut hits = Vec::with_capacity(limit);
        for hit in candidates {
            if let Some(threshold) = filters.threshold {
                if hit.similarity < threshold {
                    continue;
                }
            }
            if filters.metadata_filter.is_some() || filters.date_range.is_some() {
                let Some(record) = self.get(&hit.id)? else {
                    continue;
                };
                if let Some(filter) = &filters.metadata_filter {
                    if !metadata_matches(&record.metadata, filter) {
                        continue;
                    }
                }
                if let Some((from, to)) = &filters.date_range {
                    if record.created_at < *from || record.created_at > *to {
                        continue;
                    }
                }
            }
            hits.push(hit);
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    /// All vectors within `radius` cosine distance of the query,
    /// closest first, capped at `limit`.
    pub fn search_within_radius(
        &self,
        query: &[f32],
        radius: f32,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let candidates = self.search(query, limit.saturating_mul(4).max(limit))?;
        Ok(candidates
            .into_iter()
            .filter(|hit| hit.distance <= radius)
            .take(limit)
            .collect())
    }

    /// Returns up to `limit` embeddings in id order.
    ///
    /// Used by the code analyzer to seed clone detection without paging
    /// the whole store through memory.
    pub fn sample(&self, limit: usize) -> Result<Vec<Embedding>> {
        self.manager.with_conn(|c| {
            let mut stmt = c
                .prepare_cached(
                    "SELECT id, entity_id, content, vector, metadata, created_at, model_name
                     FROM embeddings ORDER BY id LIMIT ?1",
                )
                .map_err(StorageError::from)?;
            let mut rows = stmt
                .query(rusqlite::params![limit as i64])
                .map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(embedding_from_row(row)?);
            }
            Ok(out)
        })
    }

    fn entity_id_for(&self, id: &str) -> Result<Option<EntityId>> {
        self.manager.with_conn(|c| {
            c.query_row(
                "SELECT entity_id FROM embeddings WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get::<_, String>(0),
            )
            .map(|s| Some(EntityId::from_raw(s)))
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::from(other)),
            })
            .map_err(Into::into)
        })
    }

    /// Fallback path: cosine similarity by linear scan.
    fn linear_search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        let rows = self.manager.with_conn(|c| {
            let mut stmt = c
                .prepare_cached("SELECT id, entity_id, vector FROM embeddings")
                .map_err(StorageError::from)?;
            let mut rows = stmt.query([]).map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                let id: String = row.get(0).map_err(StorageError::from)?;
                let entity_id: String = row.get(1).map_err(StorageError::from)?;
                let blob: Vec<u8> = row.get(2).map_err(StorageError::from)?;
                out.push((id, entity_id, blob_to_vec(&blob)?));
            }
            Ok(out)
        })?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|(id, entity_id, vector)| {
                let cos = cosine_similarity(query, &vector);
                SearchHit {
                    id,
                    entity_id: EntityId::from_raw(entity_id),
                    similarity: (cos + 1.0) / 2.0,
                    distance: 1.0 - cos,
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn upsert_embedding_row(conn: &rusqlite::Connection, e: &Embedding) -> Result<()> {
    conn.execute(
        "INSERT INTO embeddings (id, entity_id, content, vector, metadata, created_at, model_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             entity_id = excluded.entity_id,
             content = excluded.content,
             vector = excluded.vector,
             metadata = excluded.metadata,
             model_name = excluded.model_name",
        rusqlite::params![
            e.id,
            e.entity_id.as_str(),
            e.content,
            vec_to_blob(&e.vector),
            serde_json::to_string(&e.metadata).map_err(StorageError::from)?,
            e.created_at.millis(),
            e.model_name,
        ],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

fn embedding_from_row(row: &rusqlite::Row<'_>) -> Result<Embedding> {
    let blob: Vec<u8> = row.get(3).map_err(StorageError::from)?;
    let metadata_json: String = row.get(4).map_err(StorageError::from)?;
    Ok(Embedding {
        id: row.get(0).map_err(StorageError::from)?,
        entity_id: EntityId::from_raw(row.get::<_, String>(1).map_err(StorageError::from)?),
        content: row.get(2).map_err(StorageError::from)?,
        vector: blob_to_vec(&blob)?,
        metadata: serde_json::from_str(&metadata_json).map_err(StorageError::from)?,
        created_at: Timestamp::from_millis(row.get(5).map_err(StorageError::from)?),
        model_name: row.get(6).map_err(StorageError::from)?,
    })
}

/// Serializes a vector as little-endian f32 bytes.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Deserializes little-endian f32 bytes back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StorageError::serialization(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        ))
        .into());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Cosine similarity in `[-1, 1]`; zero vectors compare as orthogonal.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(force_fallback: bool) -> VectorStore {
        let config = VectorConfig {
            dimension: 4,
            force_fallback,
            path: None,
        };
        VectorStore::open_in_memory(&config, &HnswConfig::default()).unwrap()
    }

    fn embedding(name: &str, vector: Vec<f32>) -> Embedding {
        let entity_id = EntityId::from_parts("/v.ts", "function", name, 0, 10);
        Embedding::for_entity(entity_id, format!("fn {name}"), vector, "test-model")
    }

    fn unit(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; 4];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_modes() {
        assert_eq!(store(false).mode(), SearchMode::Native);
        assert_eq!(store(true).mode(), SearchMode::Fallback);
    }

    #[test]
    fn test_insert_get_round_trip() {
        let store = store(false);
        let e = embedding("a", unit(0));
        store.insert(&e).unwrap();
        let back = store.get(&e.id).unwrap().unwrap();
        assert_eq!(back.vector, e.vector);
        assert_eq!(back.entity_id, e.entity_id);
    }

    #[test]
    fn test_dimension_mismatch() {
        let store = store(false);
        let mut e = embedding("a", unit(0));
        e.vector = vec![1.0, 2.0];
        let err = store.insert(&e).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Storage(StorageError::DimensionMismatch {
                expected: 4,
                got: 2
            })
        ));
    }

    #[test]
    fn test_search_both_modes_agree_on_ranking() {
        for fallback in [false, true] {
            let store = store(fallback);
            store.insert(&embedding("x", unit(0))).unwrap();
            store.insert(&embedding("y", unit(1))).unwrap();
            store.insert(&embedding("z", vec![0.8, 0.2, 0.0, 0.0])).unwrap();

            let hits = store.search(&unit(0), 3).unwrap();
            assert_eq!(hits.len(), 3);
            // Exact match first, orthogonal vector last.
            assert_eq!(hits[0].id, embedding("x", unit(0)).id);
            for pair in hits.windows(2) {
                assert!(pair[0].similarity >= pair[1].similarity);
            }
            for hit in &hits {
                assert!((0.0..=1.0).contains(&hit.similarity));
            }
        }
    }

    #[test]
    fn test_search_returns_all_when_underfilled() {
        let store = store(false);
        store.insert(&embedding("a", unit(0))).unwrap();
        store.insert(&embedding("b", unit(1))).unwrap();
        let hits = store.search(&unit(0), 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_update_replaces_vector_exactly() {
        let store = store(false);
        let e = embedding("a", unit(0));
        store.insert(&e).unwrap();
        let new_vector = vec![0.5, 0.5, 0.0, 0.0];
        store.update(&e.id, &new_vector, None).unwrap();
        let back = store.get(&e.id).unwrap().unwrap();
        assert_eq!(back.vector, new_vector);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = store(false);
        let err = store.update("nope", &unit(0), None).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_removes_from_search() {
        let store = store(false);
        let a = embedding("a", unit(0));
        let b = embedding("b", unit(1));
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        store.delete(&a.id).unwrap();
        assert!(store.get(&a.id).unwrap().is_none());
        let hits = store.search(&unit(0), 10).unwrap();
        assert!(hits.iter().all(|h| h.id != a.id));
    }

    #[test]
    fn test_insert_batch_dedupes_by_id() {
        let store = store(false);
        let mut first = embedding("a", unit(0));
        first.content = "old".to_string();
        let mut second = embedding("a", unit(1));
        second.content = "new".to_string();
        let written = store.insert_batch(&[first, second.clone()]).unwrap();
        assert_eq!(written, 1);
        let back = store.get(&second.id).unwrap().unwrap();
        assert_eq!(back.content, "new");
        assert_eq!(back.vector, unit(1));
    }

    #[test]
    fn test_search_with_threshold_filter() {
        let store = store(true);
        store.insert(&embedding("close", unit(0))).unwrap();
        store.insert(&embedding("far", unit(1))).unwrap();
        let hits = store
            .search_with_filters(
                &unit(0),
                &SearchFilters {
                    limit: 10,
                    threshold: Some(0.9),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, embedding("close", unit(0)).id);
    }

    #[test]
    fn test_search_with_metadata_filter() {
        let store = store(true);
        let mut tagged = embedding("tagged", unit(0));
        tagged.metadata = serde_json::json!({"language": "rust", "kind": "function"});
        let untagged = embedding("untagged", vec![0.9, 0.1, 0.0, 0.0]);
        store.insert(&tagged).unwrap();
        store.insert(&untagged).unwrap();

        let hits = store
            .search_with_filters(
                &unit(0),
                &SearchFilters {
                    limit: 10,
                    metadata_filter: Some(serde_json::json!({"language": "rust"})),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, tagged.id);
    }

    #[test]
    fn test_search_within_radius() {
        let store = store(true);
        store.insert(&embedding("same", unit(0))).unwrap();
        store.insert(&embedding("orthogonal", unit(1))).unwrap();
        // Orthogonal vectors sit at cosine distance 1.0.
        let hits = store.search_within_radius(&unit(0), 0.5, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, embedding("same", unit(0)).id);
    }

    #[test]
    fn test_clear_and_count() {
        let store = store(false);
        store.insert(&embedding("a", unit(0))).unwrap();
        store.insert(&embedding("b", unit(1))).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.search(&unit(0), 10).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_rejects_different_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.db");
        let config4 = VectorConfig {
            dimension: 4,
            ..Default::default()
        };
        let store = VectorStore::open(&path, &config4, &HnswConfig::default()).unwrap();
        drop(store);

        let config8 = VectorConfig {
            dimension: 8,
            ..Default::default()
        };
        let err = VectorStore::open(&path, &config8, &HnswConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CodeGraphError::Storage(StorageError::DimensionMismatch { .. })
        ));
    }
}

/// True when every key/value pair in `filter` appears in `metadata`.
fn metadata_matches(metadata: &Value, filter: &Value) -> bool {
    match (metadata, filter) {
        (Value::Object(meta), Value::Object(want)) => want
            .iter()
            .all(|(k, v)| meta.get(k).is_some_and(|have| have == v)),
        _ => metadata == filter,
    }
}
