//! Chunked, transactional batch writes with per-item error capture.
//!
//! Each chunk of `batch_size` rows executes inside one transaction. A
//! failure on one row is captured as a [`BatchItemError`] and counted
//! without aborting the chunk; only a failed commit takes the whole chunk
//! down. The writer also adapts its chunk size to keep per-chunk latency
//! near a target window.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rusqlite::params;
use tracing::{debug, instrument, warn};

use crate::config::BatchConfig;
use crate::entity::{validate_entity, Entity, EntityPatch};
use crate::error::{Result, StorageError};
use crate::relation::Relationship;
use crate::types::{EntityId, Timestamp};

use super::graph::{upsert_entity_row, upsert_relationship_row};
use super::pool::ConnectionPool;

/// Smallest chunk the tuner will shrink to.
const MIN_BATCH_SIZE: usize = 100;
/// Largest chunk the tuner will grow to.
const MAX_BATCH_SIZE: usize = 10_000;

/// One failed row inside a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchItemError {
    /// Id of the failing row.
    pub id: String,
    /// Why it failed.
    pub error: String,
}

/// Outcome of a bulk write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchResult {
    /// Rows written successfully.
    pub processed: usize,
    /// Rows that failed.
    pub failed: usize,
    /// Per-row failure detail.
    pub errors: Vec<BatchItemError>,
    /// Wall-clock time for the whole batch, in milliseconds.
    pub time_ms: u64,
}

impl BatchResult {
    fn merge(&mut self, other: BatchResult) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Bulk writer over the pooled main database.
pub struct BatchWriter {
    pool: Arc<ConnectionPool>,
    batch_size: AtomicUsize,
    target_chunk_ms: u64,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("batch_size", &self.batch_size.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BatchWriter {
    /// Creates a writer with the configured starting chunk size.
    pub fn new(pool: Arc<ConnectionPool>, config: &BatchConfig) -> Self {
        Self {
            pool,
            batch_size: AtomicUsize::new(config.batch_size),
            target_chunk_ms: config.target_chunk_ms,
        }
    }

    /// Current chunk size.
    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Bulk-upserts entities.
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    pub fn insert_entities(&self, entities: &[Entity]) -> Result<BatchResult> {
        let started = Instant::now();
        let mut result = BatchResult::default();

        for chunk in entities.chunks(self.batch_size()) {
            result.merge(self.entity_chunk(chunk)?);
        }

        result.time_ms = started.elapsed().as_millis() as u64;
        debug!(
            processed = result.processed,
            failed = result.failed,
            time_ms = result.time_ms,
            "Entity batch complete"
        );
        Ok(result)
    }

    fn entity_chunk(&self, chunk: &[Entity]) -> Result<BatchResult> {
        let conn = self.pool.acquire()?;
        let chunk_result = conn.with_tx(|tx| {
            let mut out = BatchResult::default();
            for entity in chunk {
                let row = validate_entity(entity)
                    .map_err(Into::into)
                    .and_then(|()| upsert_entity_row(tx, entity));
                match row {
                    Ok(()) => out.processed += 1,
                    Err(err) => {
                        out.failed += 1;
                        out.errors.push(BatchItemError {
                            id: entity.id.to_string(),
                            error: err.to_string(),
                        });
                    }
                }
            }
            Ok(out)
        });

        match chunk_result {
            Ok(out) => Ok(out),
            // Commit failure: the whole chunk is lost.
            Err(err) => {
                warn!(error = %err, "Batch chunk failed to commit");
                Ok(BatchResult {
                    processed: 0,
                    failed: chunk.len(),
                    errors: chunk
                        .iter()
                        .map(|e| BatchItemError {
                            id: e.id.to_string(),
                            error: err.to_string(),
                        })
                        .collect(),
                    time_ms: 0,
                })
            }
        }
    }

    /// Bulk-upserts relationships.
    #[instrument(skip(self, rels), fields(count = rels.len()))]
    pub fn insert_relationships(&self, rels: &[Relationship]) -> Result<BatchResult> {
        let started = Instant::now();
        let mut result = BatchResult::default();

        for chunk in rels.chunks(self.batch_size()) {
            let conn = self.pool.acquire()?;
            let chunk_result = conn.with_tx(|tx| {
                let mut out = BatchResult::default();
                for rel in chunk {
                    match upsert_relationship_row(tx, rel) {
                        Ok(()) => out.processed += 1,
                        Err(err) => {
                            out.failed += 1;
                            out.errors.push(BatchItemError {
                                id: rel.id.to_string(),
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Ok(out)
            });
            match chunk_result {
                Ok(out) => result.merge(out),
                Err(err) => {
                    warn!(error = %err, "Relationship chunk failed to commit");
                    result.merge(BatchResult {
                        processed: 0,
                        failed: chunk.len(),
                        errors: chunk
                            .iter()
                            .map(|r| BatchItemError {
                                id: r.id.to_string(),
                                error: err.to_string(),
                            })
                            .collect(),
                        time_ms: 0,
                    });
                }
            }
        }

        result.time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Bulk-applies partial updates.
    ///
    /// Rows that do not exist are counted as failed with a not-found
    /// error; the rest of the chunk proceeds.
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    pub fn update_entities(&self, updates: &[(EntityId, EntityPatch)]) -> Result<BatchResult> {
        let started = Instant::now();
        let mut result = BatchResult::default();

        for chunk in updates.chunks(self.batch_size()) {
            let conn = self.pool.acquire()?;
            let chunk_result = conn.with_tx(|tx| {
                let mut out = BatchResult::default();
                for (id, patch) in chunk {
                    match apply_patch(tx, id, patch) {
                        Ok(()) => out.processed += 1,
                        Err(err) => {
                            out.failed += 1;
                            out.errors.push(BatchItemError {
                                id: id.to_string(),
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Ok(out)
            })?;
            result.merge(chunk_result);
        }

        result.time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Bulk-deletes entities (relationships cascade).
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn delete_entities(&self, ids: &[EntityId]) -> Result<BatchResult> {
        let started = Instant::now();
        let mut result = BatchResult::default();

        for chunk in ids.chunks(self.batch_size()) {
            let conn = self.pool.acquire()?;
            let chunk_result = conn.with_tx(|tx| {
                let mut out = BatchResult::default();
                for id in chunk {
                    match tx.execute("DELETE FROM entities WHERE id = ?1", params![id.as_str()])
                    {
                        Ok(0) => {
                            out.failed += 1;
                            out.errors.push(BatchItemError {
                                id: id.to_string(),
                                error: StorageError::not_found("entity", id).to_string(),
                            });
                        }
                        Ok(_) => out.processed += 1,
                        Err(err) => {
                            out.failed += 1;
                            out.errors.push(BatchItemError {
                                id: id.to_string(),
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Ok(out)
            })?;
            result.merge(chunk_result);
        }

        result.time_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Adapts the chunk size to recent latency.
    ///
    /// Halves the chunk (floor 100) when the average chunk time exceeds
    /// twice the target; doubles it (cap 10 000) when under half the
    /// target. Returns the new size.
    pub fn optimize_batch_size(&self, avg_chunk_ms: f64) -> usize {
        let current = self.batch_size();
        let target = self.target_chunk_ms as f64;
        let next = if avg_chunk_ms > target * 2.0 {
            (current / 2).max(MIN_BATCH_SIZE)
        } else if avg_chunk_ms < target * 0.5 {
            (current * 2).min(MAX_BATCH_SIZE)
        } else {
            current
        };
        if next != current {
            debug!(from = current, to = next, avg_chunk_ms, "Batch size retuned");
            self.batch_size.store(next, Ordering::Relaxed);
        }
        next
    }
}

/// Read-modify-write for one patched entity inside an open transaction.
fn apply_patch(
    tx: &rusqlite::Transaction<'_>,
    id: &EntityId,
    patch: &EntityPatch,
) -> Result<()> {
    use crate::entity::{EntityType, SourceLocation};

    let row = tx
        .query_row(
            "SELECT name, type, file_path, location, metadata, hash, created_at,
                    complexity_score, language, size_bytes
             FROM entities WHERE id = ?1",
            params![id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                ))
            },
        )
        .map_err(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => {
                crate::error::CodeGraphError::from(StorageError::not_found("entity", id))
            }
            other => StorageError::from(other).into(),
        })?;

    let (name, type_str, file_path, location_json, metadata_json, hash, created_at, score, language, size) =
        row;
    let entity_type = EntityType::parse(&type_str)
        .ok_or_else(|| StorageError::serialization(format!("unknown entity type {type_str}")))?;
    let location: SourceLocation =
        serde_json::from_str(&location_json).map_err(StorageError::from)?;
    let metadata = serde_json::from_str(&metadata_json).map_err(StorageError::from)?;

    let mut entity = Entity {
        id: id.clone(),
        name,
        entity_type,
        file_path,
        location,
        metadata,
        hash,
        created_at: Timestamp::from_millis(created_at),
        updated_at: Timestamp::now(),
        complexity_score: score,
        language,
        size_bytes: size.map(|v| v as u64),
    };

    if let Some(name) = &patch.name {
        entity.name = name.clone();
    }
    if let Some(metadata) = &patch.metadata {
        entity.metadata = metadata.clone();
    }
    if let Some(hash) = &patch.hash {
        entity.hash = hash.clone();
    }
    if let Some(location) = &patch.location {
        entity.location = *location;
    }
    if let Some(score) = patch.complexity_score {
        entity.complexity_score = Some(score);
    }
    if let Some(language) = &patch.language {
        entity.language = Some(language.clone());
    }
    if let Some(size) = patch.size_bytes {
        entity.size_bytes = Some(size);
    }
    validate_entity(&entity)?;
    upsert_entity_row(tx, &entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, PoolConfig};
    use crate::entity::{EntityType, SourceLocation};
    use crate::relation::RelationshipType;
    use crate::storage::manager::SqlManager;
    use crate::storage::migrations::migrate;

    fn test_pool() -> Arc<ConnectionPool> {
        let name = format!(
            "file:batchtest_{}?mode=memory&cache=shared",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        let factory = move || {
            let conn = rusqlite::Connection::open_with_flags(
                &name,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            )
            .map_err(StorageError::from)?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(StorageError::from)?;
            Ok(SqlManager::from_connection(conn))
        };
        let pool = ConnectionPool::new(factory, PoolConfig::default()).unwrap();
        {
            let conn = pool.acquire().unwrap();
            migrate(&conn).unwrap();
        }
        Arc::new(pool)
    }

    fn writer(pool: Arc<ConnectionPool>) -> BatchWriter {
        BatchWriter::new(pool, &BatchConfig::default())
    }

    fn entity(name: &str, start: u64) -> Entity {
        Entity::new(
            name,
            EntityType::Function,
            "/batch.ts",
            SourceLocation::from_span(1, start, 2, start + 10),
        )
    }

    #[test]
    fn test_empty_input_is_zero_result() {
        let writer = writer(test_pool());
        let result = writer.insert_entities(&[]).unwrap();
        assert_eq!(result.processed, 0);
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_insert_many_entities() {
        let writer = writer(test_pool());
        let entities: Vec<Entity> = (0..250).map(|i| entity(&format!("f{i}"), i * 100)).collect();
        let result = writer.insert_entities(&entities).unwrap();
        assert_eq!(result.processed, 250);
        assert_eq!(result.failed, 0);
    }

    #[test]
    fn test_bad_row_does_not_abort_chunk() {
        let writer = writer(test_pool());
        let good = entity("good", 0);
        let mut bad = entity("bad", 100);
        bad.name = String::new(); // fails validation
        let also_good = entity("also_good", 200);

        let result = writer
            .insert_entities(&[good.clone(), bad, also_good.clone()])
            .unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_relationship_batch_captures_fk_failures() {
        let pool = test_pool();
        let writer = writer(Arc::clone(&pool));
        let a = entity("a", 0);
        let b = entity("b", 100);
        writer.insert_entities(&[a.clone(), b.clone()]).unwrap();

        let good = Relationship::new(a.id.clone(), b.id.clone(), RelationshipType::Calls);
        let dangling = Relationship::new(
            a.id.clone(),
            crate::types::EntityId::from_raw("missing00000"),
            RelationshipType::Calls,
        );
        let result = writer.insert_relationships(&[good, dangling]).unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn test_update_entities_counts_missing() {
        let pool = test_pool();
        let writer = writer(Arc::clone(&pool));
        let a = entity("a", 0);
        writer.insert_entities(&[a.clone()]).unwrap();

        let updates = vec![
            (
                a.id.clone(),
                EntityPatch {
                    hash: Some("new".to_string()),
                    ..Default::default()
                },
            ),
            (
                crate::types::EntityId::from_raw("missing00000"),
                EntityPatch::default(),
            ),
        ];
        let result = writer.update_entities(&updates).unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn test_delete_entities() {
        let pool = test_pool();
        let writer = writer(Arc::clone(&pool));
        let a = entity("a", 0);
        writer.insert_entities(&[a.clone()]).unwrap();
        let result = writer
            .delete_entities(&[a.id.clone(), crate::types::EntityId::from_raw("ghost0000000")])
            .unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.failed, 1);
    }

    #[test]
    fn test_optimize_batch_size_halves_and_doubles() {
        let writer = writer(test_pool());
        assert_eq!(writer.batch_size(), 1000);

        // Way over target: halve
        assert_eq!(writer.optimize_batch_size(500.0), 500);
        // Way under target: double
        assert_eq!(writer.optimize_batch_size(5.0), 1000);
        // Within the window: unchanged
        assert_eq!(writer.optimize_batch_size(60.0), 1000);
    }

    #[test]
    fn test_optimize_batch_size_respects_bounds() {
        let writer = writer(test_pool());
        for _ in 0..10 {
            writer.optimize_batch_size(10_000.0);
        }
        assert_eq!(writer.batch_size(), MIN_BATCH_SIZE);
        for _ in 0..10 {
            writer.optimize_batch_size(0.1);
        }
        assert_eq!(writer.batch_size(), MAX_BATCH_SIZE);
    }
}
