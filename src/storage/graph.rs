//! Typed CRUD and traversal primitives over the entity/relationship tables.
//!
//! [`GraphStorage`] is the single writer for the main database. All access
//! goes through the connection pool; write operations acquire a handle for
//! the duration of one transaction, so writers serialize at the storage
//! layer while WAL lets readers proceed.
//!
//! Upserts preserve `created_at`: ids are content-addressed, so re-indexing
//! unchanged source rewrites rows in place without advancing their
//! creation time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rusqlite::{params, Connection, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::entity::{validate_entity, Entity, EntityPatch, EntityType, FileInfo, SourceLocation};
use crate::error::{Result, StorageError, ValidationError};
use crate::relation::{Relationship, RelationshipMetadata, RelationshipType};
use crate::types::{EntityId, RelationshipId, Timestamp};

use super::pool::ConnectionPool;

/// Default page size for find queries.
const DEFAULT_LIMIT: usize = 100;
/// Hard cap on find query pages.
const MAX_LIMIT: usize = 1000;
/// Maximum ids per SQL `IN (...)` list; larger sets are chunked.
const IN_CHUNK: usize = 500;
/// Maximum subgraph extraction depth.
const MAX_SUBGRAPH_DEPTH: u32 = 5;

/// Name filter for entity queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum NameFilter {
    /// Exact match on `name`.
    Exact(String),
    /// SQL `LIKE` pattern (caller supplies wildcards).
    Like(String),
}

/// Filter set for [`GraphStorage::find_entities`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct EntityQuery {
    /// Restrict to these entity types (empty = all).
    pub entity_types: Vec<EntityType>,
    /// Restrict to these file paths (empty = all).
    pub file_paths: Vec<String>,
    /// Restrict by name.
    pub name: Option<NameFilter>,
    /// Page size; `None` uses the default (100), values clamp to 1000.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: usize,
}

/// Filter set for [`GraphStorage::find_relationships`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct RelationshipQuery {
    /// Restrict to edges touching this entity.
    pub entity_id: Option<EntityId>,
    /// Restrict to these edge types (empty = all).
    pub rel_types: Vec<RelationshipType>,
    /// Page size; `None` uses the default (100), values clamp to 1000.
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: usize,
}

/// Direction selector for edge lookups relative to an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Edges whose `from_id` is the entity.
    Outgoing,
    /// Edges whose `to_id` is the entity.
    Incoming,
    /// Both.
    Both,
}

/// Result of a subgraph extraction.
#[derive(Clone, Debug, Default)]
pub struct Subgraph {
    /// Deduplicated entities reached within the depth bound.
    pub entities: Vec<Entity>,
    /// Edges traversed.
    pub relationships: Vec<Relationship>,
}

/// Counts reported by [`GraphStorage::delete_file_data`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileDeleteReport {
    /// Entity rows removed.
    pub entities_deleted: usize,
    /// Relationship rows removed (cascade included).
    pub relationships_deleted: usize,
}

/// Storage-level metrics snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphMetrics {
    /// Rows in `entities`.
    pub total_entities: u64,
    /// Rows in `relationships`.
    pub total_relationships: u64,
    /// Rows in `files`.
    pub total_files: u64,
    /// Main database size in megabytes.
    pub db_size_mb: f64,
    /// Index pages in megabytes (0.0 when `dbstat` is unavailable).
    pub index_size_mb: f64,
    /// Mean statement latency across storage operations.
    pub avg_query_time_ms: f64,
    /// Filled in by the owning facade from cache stats.
    pub cache_hit_rate: f64,
    /// Millisecond timestamp of the last `vacuum()` (0 when never run).
    pub last_vacuum: i64,
}

/// Graph storage over the pooled main database.
pub struct GraphStorage {
    pool: Arc<ConnectionPool>,
    op_count: AtomicU64,
    op_micros: AtomicU64,
}

impl std::fmt::Debug for GraphStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStorage").finish_non_exhaustive()
    }
}

impl GraphStorage {
    /// Creates graph storage over an already-migrated pool.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            op_count: AtomicU64::new(0),
            op_micros: AtomicU64::new(0),
        }
    }

    /// Returns the pool this storage draws connections from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn observe(&self, start: Instant) {
        self.op_count.fetch_add(1, Ordering::Relaxed);
        self.op_micros
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    // =========================================================================
    // Entity CRUD
    // =========================================================================

    /// Upserts a single entity by id.
    ///
    /// On conflict the mutable columns are overwritten and `updated_at`
    /// advances; `created_at` keeps its original value.
    #[instrument(skip(self, entity), fields(id = %entity.id))]
    pub fn insert_entity(&self, entity: &Entity) -> Result<()> {
        validate_entity(entity)?;
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        conn.with_conn(|c| upsert_entity_row(c, entity))?;
        self.observe(start);
        Ok(())
    }

    /// Upserts a collection of entities inside one transaction.
    pub fn insert_entities(&self, entities: &[Entity]) -> Result<()> {
        for entity in entities {
            validate_entity(entity)?;
        }
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        conn.with_tx(|tx| {
            for entity in entities {
                upsert_entity_row(tx, entity)?;
            }
            Ok(())
        })?;
        self.observe(start);
        Ok(())
    }

    /// Fetches an entity by id.
    pub fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let entity = conn.with_conn(|c| {
            let mut stmt = c
                .prepare_cached(&format!("SELECT {ENTITY_COLS} FROM entities WHERE id = ?1"))
                .map_err(StorageError::from)?;
            let mut rows = stmt
                .query(params![id.as_str()])
                .map_err(StorageError::from)?;
            match rows.next().map_err(StorageError::from)? {
                Some(row) => Ok(Some(entity_from_row(row)?)),
                None => Ok(None),
            }
        })?;
        self.observe(start);
        Ok(entity)
    }

    /// Applies a partial update to an entity.
    ///
    /// Read and write happen in the same transaction. `created_at` is
    /// preserved; `updated_at` is stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entity does not exist.
    #[instrument(skip(self, patch))]
    pub fn update_entity(&self, id: &EntityId, patch: &EntityPatch) -> Result<Entity> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let updated = conn.with_tx(|tx| {
            let mut stmt = tx
                .prepare_cached(&format!("SELECT {ENTITY_COLS} FROM entities WHERE id = ?1"))
                .map_err(StorageError::from)?;
            let mut rows = stmt
                .query(params![id.as_str()])
                .map_err(StorageError::from)?;
            let mut entity = match rows.next().map_err(StorageError::from)? {
                Some(row) => entity_from_row(row)?,
                None => return Err(StorageError::not_found("entity", id).into()),
            };
            drop(rows);
            drop(stmt);

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
            entity.updated_at = Timestamp::now();
            validate_entity(&entity)?;

            upsert_entity_row(tx, &entity)?;
            Ok(entity)
        })?;
        self.observe(start);
        Ok(updated)
    }

    /// Deletes an entity; relationships cascade via the foreign keys.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entity does not exist.
    pub fn delete_entity(&self, id: &EntityId) -> Result<()> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let affected = conn.with_conn(|c| {
            c.execute("DELETE FROM entities WHERE id = ?1", params![id.as_str()])
                .map_err(StorageError::from)
                .map_err(Into::into)
        })?;
        self.observe(start);
        if affected == 0 {
            return Err(StorageError::not_found("entity", id).into());
        }
        Ok(())
    }

    // =========================================================================
    // Relationship CRUD
    // =========================================================================

    /// Upserts a relationship by id.
    ///
    /// Ids are content-stable, so re-inserting the same edge is a no-op
    /// beyond refreshing metadata and weight. Both endpoints must already
    /// be stored (enforced by foreign keys).
    pub fn insert_relationship(&self, rel: &Relationship) -> Result<()> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        conn.with_conn(|c| upsert_relationship_row(c, rel))?;
        self.observe(start);
        Ok(())
    }

    /// Upserts a collection of relationships inside one transaction.
    pub fn insert_relationships(&self, rels: &[Relationship]) -> Result<()> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        conn.with_tx(|tx| {
            for rel in rels {
                upsert_relationship_row(tx, rel)?;
            }
            Ok(())
        })?;
        self.observe(start);
        Ok(())
    }

    /// Deletes a relationship by id.
    pub fn delete_relationship(&self, id: &RelationshipId) -> Result<()> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let affected = conn.with_conn(|c| {
            c.execute(
                "DELETE FROM relationships WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(StorageError::from)
            .map_err(Into::into)
        })?;
        self.observe(start);
        if affected == 0 {
            return Err(StorageError::not_found("relationship", id).into());
        }
        Ok(())
    }

    /// Returns edges touching `entity_id`, optionally filtered by type.
    pub fn relationships_for(
        &self,
        entity_id: &EntityId,
        rel_type: Option<RelationshipType>,
        direction: Direction,
    ) -> Result<Vec<Relationship>> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let rels = conn.with_conn(|c| {
            let mut sql = format!("SELECT {REL_COLS} FROM relationships WHERE ");
            match direction {
                Direction::Outgoing => sql.push_str("from_id = ?1"),
                Direction::Incoming => sql.push_str("to_id = ?1"),
                Direction::Both => sql.push_str("(from_id = ?1 OR to_id = ?1)"),
            }
            if rel_type.is_some() {
                sql.push_str(" AND type = ?2");
            }
            let mut stmt = c.prepare_cached(&sql).map_err(StorageError::from)?;
            let mut out = Vec::new();
            let mut collect = |rows: &mut rusqlite::Rows<'_>| -> Result<()> {
                while let Some(row) = rows.next().map_err(StorageError::from)? {
                    out.push(relationship_from_row(row)?);
                }
                Ok(())
            };
            match rel_type {
                Some(t) => {
                    let mut rows = stmt
                        .query(params![entity_id.as_str(), t.as_str()])
                        .map_err(StorageError::from)?;
                    collect(&mut rows)?;
                }
                None => {
                    let mut rows = stmt
                        .query(params![entity_id.as_str()])
                        .map_err(StorageError::from)?;
                    collect(&mut rows)?;
                }
            }
            Ok(out)
        })?;
        self.observe(start);
        Ok(rels)
    }

    // =========================================================================
    // File-scoped operations
    // =========================================================================

    /// Transactionally removes all data belonging to `path`.
    ///
    /// Deletes every relationship touching the file's entities, then the
    /// entities, then the `files` row. Entities listed in `preserve` keep
    /// their row, but relationships whose other endpoint is being deleted
    /// are still removed so no edge dangles.
    #[instrument(skip(self, preserve), fields(path))]
    pub fn delete_file_data(
        &self,
        path: &str,
        preserve: &HashSet<EntityId>,
    ) -> Result<FileDeleteReport> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let report = conn.with_tx(|tx| {
            let mut doomed: Vec<String> = Vec::new();
            {
                let mut stmt = tx
                    .prepare_cached("SELECT id FROM entities WHERE file_path = ?1")
                    .map_err(StorageError::from)?;
                let mut rows = stmt.query(params![path]).map_err(StorageError::from)?;
                while let Some(row) = rows.next().map_err(StorageError::from)? {
                    let id: String = row.get(0).map_err(StorageError::from)?;
                    if !preserve.contains(&EntityId::from_raw(id.clone())) {
                        doomed.push(id);
                    }
                }
            }

            let mut relationships_deleted = 0usize;
            let mut entities_deleted = 0usize;
            for chunk in doomed.chunks(IN_CHUNK) {
                let placeholders = placeholders(chunk.len());
                let params_vec: Vec<&dyn rusqlite::ToSql> =
                    chunk.iter().map(|s| s as &dyn rusqlite::ToSql).collect();

                // Explicit edge delete (rather than relying on cascade) so
                // the report can carry an exact count.
                let sql = format!(
                    "DELETE FROM relationships WHERE from_id IN ({placeholders}) \
                     OR to_id IN ({placeholders})"
                );
                let mut both: Vec<&dyn rusqlite::ToSql> = params_vec.clone();
                both.extend(params_vec.iter().copied());
                relationships_deleted += tx
                    .execute(&sql, both.as_slice())
                    .map_err(StorageError::from)?;

                let sql = format!("DELETE FROM entities WHERE id IN ({placeholders})");
                entities_deleted += tx
                    .execute(&sql, params_vec.as_slice())
                    .map_err(StorageError::from)?;
            }

            tx.execute("DELETE FROM files WHERE path = ?1", params![path])
                .map_err(StorageError::from)?;

            Ok(FileDeleteReport {
                entities_deleted,
                relationships_deleted,
            })
        })?;
        self.observe(start);
        info!(
            path,
            entities = report.entities_deleted,
            relationships = report.relationships_deleted,
            "File data deleted"
        );
        Ok(report)
    }

    /// Upserts per-file indexing state.
    pub fn upsert_file_info(&self, info: &FileInfo) -> Result<()> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        conn.with_conn(|c| {
            c.execute(
                "INSERT INTO files (path, hash, last_indexed, entity_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                     hash = excluded.hash,
                     last_indexed = excluded.last_indexed,
                     entity_count = excluded.entity_count",
                params![
                    info.path,
                    info.hash,
                    info.last_indexed.millis(),
                    info.entity_count as i64
                ],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })?;
        self.observe(start);
        Ok(())
    }

    /// Fetches per-file indexing state.
    pub fn get_file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        let conn = self.pool.acquire()?;
        conn.with_conn(|c| {
            let mut stmt = c
                .prepare_cached(
                    "SELECT path, hash, last_indexed, entity_count FROM files WHERE path = ?1",
                )
                .map_err(StorageError::from)?;
            let mut rows = stmt.query(params![path]).map_err(StorageError::from)?;
            match rows.next().map_err(StorageError::from)? {
                Some(row) => Ok(Some(FileInfo {
                    path: row.get(0).map_err(StorageError::from)?,
                    hash: row.get(1).map_err(StorageError::from)?,
                    last_indexed: Timestamp::from_millis(
                        row.get(2).map_err(StorageError::from)?,
                    ),
                    entity_count: row.get::<_, i64>(3).map_err(StorageError::from)? as u64,
                })),
                None => Ok(None),
            }
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Finds entities matching the filter set.
    ///
    /// `limit` defaults to 100 and clamps to 1000; an explicit limit of 0
    /// returns an empty list without touching storage.
    pub fn find_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let limit = effective_limit(query.limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut sql = format!("SELECT {ENTITY_COLS} FROM entities");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !query.entity_types.is_empty() {
            clauses.push(format!(
                "type IN ({})",
                placeholders(query.entity_types.len())
            ));
            for t in &query.entity_types {
                args.push(Box::new(t.as_str().to_string()));
            }
        }
        if !query.file_paths.is_empty() {
            clauses.push(format!(
                "file_path IN ({})",
                placeholders(query.file_paths.len())
            ));
            for p in &query.file_paths {
                args.push(Box::new(p.clone()));
            }
        }
        match &query.name {
            Some(NameFilter::Exact(name)) => {
                clauses.push("name = ?".to_string());
                args.push(Box::new(name.clone()));
            }
            Some(NameFilter::Like(pattern)) => {
                clauses.push("name LIKE ?".to_string());
                args.push(Box::new(pattern.clone()));
            }
            None => {}
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY file_path, name LIMIT ? OFFSET ?");
        args.push(Box::new(limit as i64));
        args.push(Box::new(query.offset as i64));

        let conn = self.pool.acquire()?;
        let entities = conn.with_conn(|c| {
            let mut stmt = c.prepare(&sql).map_err(StorageError::from)?;
            let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt.query(refs.as_slice()).map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(entity_from_row(row)?);
            }
            Ok(out)
        })?;
        self.observe(start);
        Ok(entities)
    }

    /// Finds relationships matching the filter set.
    pub fn find_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let limit = effective_limit(query.limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut sql = format!("SELECT {REL_COLS} FROM relationships");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(entity_id) = &query.entity_id {
            clauses.push("(from_id = ? OR to_id = ?)".to_string());
            args.push(Box::new(entity_id.as_str().to_string()));
            args.push(Box::new(entity_id.as_str().to_string()));
        }
        if !query.rel_types.is_empty() {
            clauses.push(format!("type IN ({})", placeholders(query.rel_types.len())));
            for t in &query.rel_types {
                args.push(Box::new(t.as_str().to_string()));
            }
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id LIMIT ? OFFSET ?");
        args.push(Box::new(limit as i64));
        args.push(Box::new(query.offset as i64));

        let conn = self.pool.acquire()?;
        let rels = conn.with_conn(|c| {
            let mut stmt = c.prepare(&sql).map_err(StorageError::from)?;
            let refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt.query(refs.as_slice()).map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(relationship_from_row(row)?);
            }
            Ok(out)
        })?;
        self.observe(start);
        Ok(rels)
    }

    /// Extracts the subgraph reachable from `root` within `depth` hops.
    ///
    /// BFS through relationships in either direction; entities and edges
    /// are deduplicated. `depth` 0 returns just the root.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::InvalidDepth`] when `depth > 5`
    /// - [`StorageError::NotFound`] when `root` is missing
    pub fn get_subgraph(&self, root: &EntityId, depth: u32) -> Result<Subgraph> {
        if depth > MAX_SUBGRAPH_DEPTH {
            return Err(ValidationError::invalid_depth(depth, 0, MAX_SUBGRAPH_DEPTH).into());
        }
        let root_entity = self
            .get_entity(root)?
            .ok_or_else(|| StorageError::not_found("entity", root))?;

        let mut entities: HashMap<EntityId, Entity> = HashMap::new();
        let mut edges: HashMap<RelationshipId, Relationship> = HashMap::new();
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut queue: VecDeque<(EntityId, u32)> = VecDeque::new();

        entities.insert(root.clone(), root_entity);
        visited.insert(root.clone());
        queue.push_back((root.clone(), 0));

        while let Some((current, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            for rel in self.relationships_for(&current, None, Direction::Both)? {
                let neighbor = if rel.from_id == current {
                    rel.to_id.clone()
                } else {
                    rel.from_id.clone()
                };
                edges.entry(rel.id.clone()).or_insert(rel);
                if visited.insert(neighbor.clone()) {
                    if let Some(entity) = self.get_entity(&neighbor)? {
                        entities.insert(neighbor.clone(), entity);
                    }
                    queue.push_back((neighbor, level + 1));
                }
            }
        }

        Ok(Subgraph {
            entities: entities.into_values().collect(),
            relationships: edges.into_values().collect(),
        })
    }

    /// Full-text search over entity names, paths, and metadata.
    ///
    /// Returns matching entities ranked by FTS relevance. Used as the
    /// structural leg of hybrid search.
    pub fn search_entities_text(&self, query: &str, limit: usize) -> Result<Vec<Entity>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit.min(MAX_LIMIT);
        let match_expr = fts_match_expr(query);

        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let entities = conn.with_conn(|c| {
            let mut stmt = c
                .prepare_cached(&format!(
                    "SELECT {ENTITY_COLS_PREFIXED} FROM entities_fts f
                     JOIN entities e ON e.rowid = f.rowid
                     WHERE f MATCH ?1
                     ORDER BY f.rank LIMIT ?2"
                ))
                .map_err(StorageError::from)?;
            let mut rows = stmt
                .query(params![match_expr, limit as i64])
                .map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(entity_from_row(row)?);
            }
            Ok(out)
        })?;
        self.observe(start);
        Ok(entities)
    }

    /// Lists every entity id, ordered for deterministic traversal.
    ///
    /// Whole-graph analyses (cycle detection, hotspots) iterate starts
    /// from this list rather than paging through `find_entities`.
    pub fn all_entity_ids(&self) -> Result<Vec<EntityId>> {
        let start = Instant::now();
        let conn = self.pool.acquire()?;
        let ids = conn.with_conn(|c| {
            let mut stmt = c
                .prepare_cached("SELECT id FROM entities ORDER BY id")
                .map_err(StorageError::from)?;
            let mut rows = stmt.query([]).map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(EntityId::from_raw(
                    row.get::<_, String>(0).map_err(StorageError::from)?,
                ));
            }
            Ok(out)
        })?;
        self.observe(start);
        Ok(ids)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rebuilds the database file, reclaiming free pages.
    #[instrument(skip(self))]
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.pool.acquire()?;
        conn.with_conn(|c| {
            c.execute_batch("VACUUM").map_err(StorageError::from)?;
            c.execute(
                "INSERT INTO performance_metrics (metric, value, recorded_at)
                 VALUES ('vacuum', 1.0, ?1)",
                params![Timestamp::now().millis()],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })
    }

    /// Refreshes SQLite's query-planner statistics.
    pub fn analyze(&self) -> Result<()> {
        let conn = self.pool.acquire()?;
        conn.with_conn(|c| {
            c.execute_batch("ANALYZE").map_err(StorageError::from)?;
            Ok(())
        })
    }

    /// Returns a storage metrics snapshot.
    ///
    /// `cache_hit_rate` is left at 0.0 here; the owning facade fills it
    /// from the query-cache stats.
    pub fn get_metrics(&self) -> Result<GraphMetrics> {
        let conn = self.pool.acquire()?;
        let mut metrics = conn.with_conn(|c| {
            let total_entities: i64 = c
                .query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            let total_relationships: i64 = c
                .query_row("SELECT COUNT(*) FROM relationships", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            let total_files: i64 = c
                .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            let page_count: i64 = c
                .query_row("PRAGMA page_count", [], |r| r.get(0))
                .map_err(StorageError::from)?;
            let page_size: i64 = c
                .query_row("PRAGMA page_size", [], |r| r.get(0))
                .map_err(StorageError::from)?;

            // dbstat is an optional SQLite build flag; treat absence as 0.
            let index_bytes: i64 = c
                .query_row(
                    "SELECT COALESCE(SUM(pgsize), 0) FROM dbstat WHERE name LIKE 'idx_%'",
                    [],
                    |r| r.get(0),
                )
                .unwrap_or(0);

            let last_vacuum: i64 = c
                .query_row(
                    "SELECT COALESCE(MAX(recorded_at), 0) FROM performance_metrics
                     WHERE metric = 'vacuum'",
                    [],
                    |r| r.get(0),
                )
                .unwrap_or(0);

            Ok(GraphMetrics {
                total_entities: total_entities as u64,
                total_relationships: total_relationships as u64,
                total_files: total_files as u64,
                db_size_mb: (page_count * page_size) as f64 / (1024.0 * 1024.0),
                index_size_mb: index_bytes as f64 / (1024.0 * 1024.0),
                avg_query_time_ms: 0.0,
                cache_hit_rate: 0.0,
                last_vacuum,
            })
        })?;

        let count = self.op_count.load(Ordering::Relaxed);
        let micros = self.op_micros.load(Ordering::Relaxed);
        metrics.avg_query_time_ms = if count == 0 {
            0.0
        } else {
            (micros as f64 / count as f64) / 1000.0
        };
        Ok(metrics)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

pub(crate) const ENTITY_COLS: &str = "id, name, type, file_path, location, metadata, hash, \
                           created_at, updated_at, complexity_score, language, size_bytes";
const ENTITY_COLS_PREFIXED: &str =
    "e.id, e.name, e.type, e.file_path, e.location, e.metadata, e.hash, \
     e.created_at, e.updated_at, e.complexity_score, e.language, e.size_bytes";
pub(crate) const REL_COLS: &str = "id, from_id, to_id, type, metadata, weight, created_at";

pub(crate) fn entity_from_row(row: &Row<'_>) -> Result<Entity> {
    let type_str: String = row.get(2).map_err(StorageError::from)?;
    let entity_type = EntityType::parse(&type_str).ok_or_else(|| {
        StorageError::serialization(format!("unknown entity type in row: {type_str}"))
    })?;
    let location_json: String = row.get(4).map_err(StorageError::from)?;
    let location: SourceLocation =
        serde_json::from_str(&location_json).map_err(StorageError::from)?;
    let metadata_json: String = row.get(5).map_err(StorageError::from)?;
    let metadata: Value = serde_json::from_str(&metadata_json).map_err(StorageError::from)?;

    Ok(Entity {
        id: EntityId::from_raw(row.get::<_, String>(0).map_err(StorageError::from)?),
        name: row.get(1).map_err(StorageError::from)?,
        entity_type,
        file_path: row.get(3).map_err(StorageError::from)?,
        location,
        metadata,
        hash: row.get(6).map_err(StorageError::from)?,
        created_at: Timestamp::from_millis(row.get(7).map_err(StorageError::from)?),
        updated_at: Timestamp::from_millis(row.get(8).map_err(StorageError::from)?),
        complexity_score: row.get(9).map_err(StorageError::from)?,
        language: row.get(10).map_err(StorageError::from)?,
        size_bytes: row
            .get::<_, Option<i64>>(11)
            .map_err(StorageError::from)?
            .map(|v| v as u64),
    })
}

pub(crate) fn relationship_from_row(row: &Row<'_>) -> Result<Relationship> {
    let type_str: String = row.get(3).map_err(StorageError::from)?;
    let rel_type = RelationshipType::parse(&type_str).ok_or_else(|| {
        StorageError::serialization(format!("unknown relationship type in row: {type_str}"))
    })?;
    let metadata_json: String = row.get(4).map_err(StorageError::from)?;
    let metadata: RelationshipMetadata =
        serde_json::from_str(&metadata_json).map_err(StorageError::from)?;

    Ok(Relationship {
        id: RelationshipId::from_raw(row.get::<_, String>(0).map_err(StorageError::from)?),
        from_id: EntityId::from_raw(row.get::<_, String>(1).map_err(StorageError::from)?),
        to_id: EntityId::from_raw(row.get::<_, String>(2).map_err(StorageError::from)?),
        rel_type,
        metadata,
        weight: row.get(5).map_err(StorageError::from)?,
        created_at: Timestamp::from_millis(row.get(6).map_err(StorageError::from)?),
    })
}

/// Upserts one entity row; works on both plain connections and
/// transactions (anything that derefs to [`Connection`]).
pub(crate) fn upsert_entity_row(conn: &Connection, entity: &Entity) -> Result<()> {
    conn.execute(
        "INSERT INTO entities (id, name, type, file_path, location, metadata, hash,
                               created_at, updated_at, complexity_score, language, size_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             location = excluded.location,
             metadata = excluded.metadata,
             hash = excluded.hash,
             updated_at = excluded.updated_at,
             complexity_score = excluded.complexity_score,
             language = excluded.language,
             size_bytes = excluded.size_bytes",
        params![
            entity.id.as_str(),
            entity.name,
            entity.entity_type.as_str(),
            entity.file_path,
            serde_json::to_string(&entity.location).map_err(StorageError::from)?,
            serde_json::to_string(&entity.metadata).map_err(StorageError::from)?,
            entity.hash,
            entity.created_at.millis(),
            entity.updated_at.millis(),
            entity.complexity_score,
            entity.language,
            entity.size_bytes.map(|v| v as i64),
        ],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Upserts one relationship row.
pub(crate) fn upsert_relationship_row(conn: &Connection, rel: &Relationship) -> Result<()> {
    conn.execute(
        "INSERT INTO relationships (id, from_id, to_id, type, metadata, weight, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             metadata = excluded.metadata,
             weight = excluded.weight",
        params![
            rel.id.as_str(),
            rel.from_id.as_str(),
            rel.to_id.as_str(),
            rel.rel_type.as_str(),
            serde_json::to_string(&rel.metadata).map_err(StorageError::from)?,
            rel.weight,
            rel.created_at.millis(),
        ],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

fn effective_limit(limit: Option<usize>) -> usize {
    match limit {
        None => DEFAULT_LIMIT,
        Some(n) => n.min(MAX_LIMIT),
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

/// Quotes each whitespace-separated term so FTS5 treats user text as
/// literals rather than query syntax.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}
