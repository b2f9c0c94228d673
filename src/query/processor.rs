//! Query processor: executes [`QueryDescriptor`] operations against the
//! graph, consulting the multi-level cache first.
//!
//! Algorithm notes:
//! - traversal and path queries execute the optimizer's recursive CTEs;
//!   the path-string guard inside the CTE carries the visited set
//! - dependency trees and cycle detection run DFS in process with an
//!   explicit recursion stack (never relying on object identity)
//! - every operation runs under a 5-second budget; long analyses check
//!   the deadline between graph nodes and fail with `QueryTimeout`
//!
//! Results are cached under the hash of their descriptor and the cache
//! is cleared wholesale by writers, so a stale entry can never outlive
//! the mutation that invalidated it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::cache::{query_key, MultiLevelCache};
use crate::entity::Entity;
use crate::error::{CodeGraphError, Result, StorageError, ValidationError};
use crate::relation::{Relationship, RelationshipType};
use crate::storage::graph::{
    entity_from_row, relationship_from_row, Direction, EntityQuery, GraphStorage,
    RelationshipQuery, Subgraph,
};
use crate::types::EntityId;

use super::optimizer::{EntityFilter, QueryOptimizer, QueryPlan, MAX_TRAVERSAL_DEPTH};
use super::{
    ChangeType, Cycle, DependencyNode, DependencyTree, EntityChange, Hotspot, ImpactAnalysis,
    Path, QueryDescriptor, RippleEffect, RiskLevel,
};

/// Overall wall-clock budget for one query operation.
const QUERY_BUDGET: Duration = Duration::from_secs(5);
/// Minimum total degree for an entity to count as a hotspot.
const HOTSPOT_MIN_CONNECTIONS: u32 = 5;

/// Executes graph queries with caching and a time budget.
pub struct QueryProcessor {
    storage: Arc<GraphStorage>,
    cache: Arc<MultiLevelCache>,
    optimizer: QueryOptimizer,
    budget: Duration,
}

impl std::fmt::Debug for QueryProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryProcessor").finish_non_exhaustive()
    }
}

impl QueryProcessor {
    /// Creates a processor over the shared storage and cache.
    pub fn new(storage: Arc<GraphStorage>, cache: Arc<MultiLevelCache>) -> Self {
        Self {
            storage,
            cache,
            optimizer: QueryOptimizer::new(),
            budget: QUERY_BUDGET,
        }
    }

    /// Overrides the per-operation budget (tests).
    #[doc(hidden)]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Point lookup by id. Returns `None` when absent.
    pub fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let descriptor = QueryDescriptor::GetEntity { id: id.clone() };
        self.cached(&descriptor, || self.storage.get_entity(id))
    }

    /// Filtered entity listing through the optimizer.
    #[instrument(skip(self, query))]
    pub fn list_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let descriptor = QueryDescriptor::ListEntities {
            query: query.clone(),
        };
        self.cached(&descriptor, || {
            let limit = match query.limit {
                Some(0) => return Ok(Vec::new()),
                Some(n) => n.min(1000),
                None => 100,
            };
            let filter = EntityFilter {
                id: None,
                entity_types: query.entity_types.clone(),
                file_paths: query.file_paths.clone(),
                name: match &query.name {
                    Some(crate::storage::graph::NameFilter::Exact(n)) => Some(n.clone()),
                    _ => None,
                },
                name_like: match &query.name {
                    Some(crate::storage::graph::NameFilter::Like(p)) => Some(p.clone()),
                    _ => None,
                },
                limit,
                offset: query.offset,
            };
            let plan = self.optimizer.optimize_entity_query(&filter);
            debug!(index = plan.index, cost = plan.estimated_cost, "Entity plan");
            self.run_entity_plan(&plan)
        })
    }

    /// Filtered relationship listing.
    pub fn find_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let descriptor = QueryDescriptor::FindRelationships {
            query: query.clone(),
        };
        self.cached(&descriptor, || self.storage.find_relationships(query))
    }

    /// Edges touching one entity, optionally filtered by type.
    pub fn get_relationships(
        &self,
        entity_id: &EntityId,
        rel_type: Option<RelationshipType>,
    ) -> Result<Vec<Relationship>> {
        let descriptor = QueryDescriptor::GetRelationships {
            entity_id: entity_id.clone(),
            rel_type: rel_type.map(|t| t.as_str().to_string()),
        };
        self.cached(&descriptor, || {
            let plan =
                self.optimizer
                    .optimize_relationship_query(entity_id, rel_type, Direction::Both);
            self.run_relationship_plan(&plan)
        })
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Entities reachable from `entity_id` within `depth` hops (either
    /// edge direction), the root excluded.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidDepth`] outside 1..=10.
    #[instrument(skip(self))]
    pub fn get_related_entities(&self, entity_id: &EntityId, depth: u32) -> Result<Vec<Entity>> {
        if depth == 0 || depth > MAX_TRAVERSAL_DEPTH {
            return Err(ValidationError::invalid_depth(depth, 1, MAX_TRAVERSAL_DEPTH).into());
        }
        let descriptor = QueryDescriptor::GetRelatedEntities {
            entity_id: entity_id.clone(),
            depth,
        };
        self.cached(&descriptor, || {
            let plan = self.optimizer.optimize_traversal_query(entity_id, depth, &[]);
            let ids = self.run_id_depth_plan(&plan)?;
            let mut entities = Vec::with_capacity(ids.len());
            for (id, _) in ids {
                if let Some(entity) = self.storage.get_entity(&id)? {
                    entities.push(entity);
                }
            }
            Ok(entities)
        })
    }

    /// Shortest path between two entities over the undirected view, or
    /// `None` when no path exists within the depth cap.
    #[instrument(skip(self))]
    pub fn find_path(&self, from_id: &EntityId, to_id: &EntityId) -> Result<Option<Path>> {
        let descriptor = QueryDescriptor::FindPath {
            from_id: from_id.clone(),
            to_id: to_id.clone(),
        };
        self.cached(&descriptor, || {
            let plan = self
                .optimizer
                .optimize_path_query(from_id, to_id, MAX_TRAVERSAL_DEPTH);
            let conn = self.storage.pool().acquire()?;
            let row: Option<String> = conn.with_conn(|c| {
                let mut stmt = c.prepare(&plan.sql).map_err(StorageError::from)?;
                let mut rows = stmt
                    .query(plan.param_refs().as_slice())
                    .map_err(StorageError::from)?;
                match rows.next().map_err(StorageError::from)? {
                    Some(row) => Ok(Some(row.get::<_, String>(0).map_err(StorageError::from)?)),
                    None => Ok(None),
                }
            })?;
            drop(conn);

            let Some(path_str) = row else {
                return Ok(None);
            };
            let ids: Vec<EntityId> = path_str
                .split('/')
                .filter(|s| !s.is_empty())
                .map(EntityId::from_raw)
                .collect();

            let mut nodes = Vec::with_capacity(ids.len());
            for id in &ids {
                match self.storage.get_entity(id)? {
                    Some(entity) => nodes.push(entity),
                    None => return Ok(None),
                }
            }

            let mut edges = Vec::new();
            for pair in ids.windows(2) {
                let connecting = self
                    .storage
                    .relationships_for(&pair[0], None, Direction::Both)?
                    .into_iter()
                    .find(|r| {
                        (r.from_id == pair[0] && r.to_id == pair[1])
                            || (r.from_id == pair[1] && r.to_id == pair[0])
                    });
                match connecting {
                    Some(edge) => edges.push(edge),
                    None => return Ok(None),
                }
            }

            let length = edges.len();
            Ok(Some(Path {
                nodes,
                edges,
                length,
            }))
        })
    }

    /// Subgraph extraction (BFS, both directions, depth 0..=5).
    pub fn get_subgraph(&self, root_id: &EntityId, depth: u32) -> Result<Subgraph> {
        let descriptor = QueryDescriptor::GetSubgraph {
            root_id: root_id.clone(),
            depth,
        };
        // Subgraph is not serde-cached as a whole (entity payloads can be
        // large); storage-level BFS already rides the entity row cache.
        let key = query_key(&descriptor);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(sub) = serde_json::from_value::<CachedSubgraph>(value) {
                return Ok(Subgraph {
                    entities: sub.entities,
                    relationships: sub.relationships,
                });
            }
        }
        let sub = self.storage.get_subgraph(root_id, depth)?;
        let cached = CachedSubgraph {
            entities: sub.entities.clone(),
            relationships: sub.relationships.clone(),
        };
        if let Ok(value) = serde_json::to_value(&cached) {
            self.cache.put(key, value);
        }
        Ok(sub)
    }

    // =========================================================================
    // Analyses
    // =========================================================================

    /// Dependency tree over outgoing DEPENDS_ON edges.
    ///
    /// Nodes found on the current recursion stack are marked
    /// `circular = true` and the cycle is recorded on the tree.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the root is missing.
    #[instrument(skip(self))]
    pub fn find_dependencies(&self, entity_id: &EntityId) -> Result<DependencyTree> {
        let descriptor = QueryDescriptor::FindDependencies {
            entity_id: entity_id.clone(),
        };
        self.cached(&descriptor, || {
            let root_entity = self
                .storage
                .get_entity(entity_id)?
                .ok_or_else(|| StorageError::not_found("entity", entity_id))?;

            let budget = Budget::start(self.budget);
            let mut stack: Vec<EntityId> = Vec::new();
            let mut cycles: Vec<Vec<EntityId>> = Vec::new();
            let root = self.dependency_node(
                &root_entity.id,
                &root_entity.name,
                &mut stack,
                &mut cycles,
                0,
                budget,
            )?;
            Ok(DependencyTree { root, cycles })
        })
    }

    fn dependency_node(
        &self,
        id: &EntityId,
        name: &str,
        stack: &mut Vec<EntityId>,
        cycles: &mut Vec<Vec<EntityId>>,
        depth: u32,
        budget: Budget,
    ) -> Result<DependencyNode> {
        budget.check()?;
        let mut node = DependencyNode {
            entity_id: id.clone(),
            name: name.to_string(),
            circular: false,
            children: Vec::new(),
        };
        if depth >= MAX_TRAVERSAL_DEPTH {
            return Ok(node);
        }

        stack.push(id.clone());
        for rel in self
            .storage
            .relationships_for(id, Some(RelationshipType::DependsOn), Direction::Outgoing)?
        {
            let child_id = rel.to_id.clone();
            if let Some(pos) = stack.iter().position(|s| *s == child_id) {
                // Cycle: cut the subtree, record the loop.
                cycles.push(stack[pos..].to_vec());
                let child_name = self
                    .storage
                    .get_entity(&child_id)?
                    .map(|e| e.name)
                    .unwrap_or_default();
                node.children.push(DependencyNode {
                    entity_id: child_id,
                    name: child_name,
                    circular: true,
                    children: Vec::new(),
                });
                continue;
            }
            let child_name = match self.storage.get_entity(&child_id)? {
                Some(e) => e.name,
                None => continue,
            };
            node.children.push(self.dependency_node(
                &child_id,
                &child_name,
                stack,
                cycles,
                depth + 1,
                budget,
            )?);
        }
        stack.pop();
        Ok(node)
    }

    /// Whole-graph cycle detection over directed edges.
    ///
    /// For each entity a cheap recursive-CTE probe asks whether any walk
    /// returns to the origin; only probe hits pay for the DFS that
    /// reconstructs the cycle path. Cycles are deduplicated by their
    /// entity set, so a ring of five entities reports once.
    #[instrument(skip(self))]
    pub fn detect_cycles(&self) -> Result<Vec<Cycle>> {
        let descriptor = QueryDescriptor::DetectCycles;
        self.cached(&descriptor, || {
            let budget = Budget::start(self.budget);
            let mut cycles: Vec<Cycle> = Vec::new();
            let mut seen: HashSet<BTreeSet<EntityId>> = HashSet::new();

            for start in self.storage.all_entity_ids()? {
                budget.check()?;

                let probe = self
                    .optimizer
                    .optimize_cycle_detection_query(&start, MAX_TRAVERSAL_DEPTH);
                if !self.run_exists_plan(&probe)? {
                    continue;
                }

                if let Some(path) = self.dfs_cycle_from(&start, budget)? {
                    let key: BTreeSet<EntityId> = path.iter().cloned().collect();
                    if seen.insert(key) {
                        cycles.push(Cycle { entities: path });
                    }
                }
            }
            Ok(cycles)
        })
    }

    /// DFS along outgoing edges looking for the first walk that returns
    /// to `start`. Carries an explicit path stack plus a per-start
    /// visited set; depth capped at 10.
    fn dfs_cycle_from(
        &self,
        start: &EntityId,
        budget: Budget,
    ) -> Result<Option<Vec<EntityId>>> {
        let mut path: Vec<EntityId> = vec![start.clone()];
        let mut visited: HashSet<EntityId> = HashSet::new();
        self.dfs_cycle_step(start, start, &mut path, &mut visited, budget)
    }

    fn dfs_cycle_step(
        &self,
        start: &EntityId,
        current: &EntityId,
        path: &mut Vec<EntityId>,
        visited: &mut HashSet<EntityId>,
        budget: Budget,
    ) -> Result<Option<Vec<EntityId>>> {
        budget.check()?;
        if path.len() > MAX_TRAVERSAL_DEPTH as usize {
            return Ok(None);
        }
        for rel in self
            .storage
            .relationships_for(current, None, Direction::Outgoing)?
        {
            let next = rel.to_id.clone();
            if next == *start {
                return Ok(Some(path.clone()));
            }
            if path.iter().any(|p| *p == next) || !visited.insert(next.clone()) {
                continue;
            }
            path.push(next.clone());
            if let Some(cycle) = self.dfs_cycle_step(start, &next, path, visited, budget)? {
                return Ok(Some(cycle));
            }
            path.pop();
        }
        Ok(None)
    }

    /// Degree-ranked hotspots (top 100, weighted score
    /// `incoming * 2 + outgoing`).
    #[instrument(skip(self))]
    pub fn analyze_hotspots(&self) -> Result<Vec<Hotspot>> {
        let descriptor = QueryDescriptor::AnalyzeHotspots;
        self.cached(&descriptor, || {
            let plan = self.optimizer.optimize_hotspot_query(HOTSPOT_MIN_CONNECTIONS);
            let conn = self.storage.pool().acquire()?;
            conn.with_conn(|c| {
                let mut stmt = c.prepare(&plan.sql).map_err(StorageError::from)?;
                let mut rows = stmt
                    .query(plan.param_refs().as_slice())
                    .map_err(StorageError::from)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().map_err(StorageError::from)? {
                    out.push(Hotspot {
                        entity_id: EntityId::from_raw(
                            row.get::<_, String>(0).map_err(StorageError::from)?,
                        ),
                        name: row.get(1).map_err(StorageError::from)?,
                        incoming: row.get::<_, i64>(2).map_err(StorageError::from)? as u64,
                        outgoing: row.get::<_, i64>(3).map_err(StorageError::from)? as u64,
                        score: row.get::<_, i64>(4).map_err(StorageError::from)? as u64,
                        change_frequency: 0,
                    });
                }
                Ok(out)
            })
        })
    }

    /// Impact analysis: who breaks when `entity_id` changes.
    ///
    /// Direct impacts are entities with an edge into the source;
    /// indirect impacts are the second hop over the direct set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the entity is missing.
    #[instrument(skip(self))]
    pub fn get_impacted_entities(&self, entity_id: &EntityId) -> Result<ImpactAnalysis> {
        let descriptor = QueryDescriptor::GetImpactedEntities {
            entity_id: entity_id.clone(),
        };
        self.cached(&descriptor, || {
            if self.storage.get_entity(entity_id)?.is_none() {
                return Err(StorageError::not_found("entity", entity_id).into());
            }
            let (direct, indirect) = self.impact_sets(entity_id)?;
            let risk_level = RiskLevel::from_total(direct.len() + indirect.len());
            Ok(ImpactAnalysis {
                source: entity_id.clone(),
                direct,
                indirect,
                risk_level,
            })
        })
    }

    fn impact_sets(&self, entity_id: &EntityId) -> Result<(Vec<EntityId>, Vec<EntityId>)> {
        let mut direct: Vec<EntityId> = Vec::new();
        let mut direct_set: HashSet<EntityId> = HashSet::new();
        for rel in self
            .storage
            .relationships_for(entity_id, None, Direction::Incoming)?
        {
            if rel.from_id != *entity_id && direct_set.insert(rel.from_id.clone()) {
                direct.push(rel.from_id.clone());
            }
        }

        let mut indirect: Vec<EntityId> = Vec::new();
        let mut indirect_set: HashSet<EntityId> = HashSet::new();
        for d in &direct {
            for rel in self.storage.relationships_for(d, None, Direction::Incoming)? {
                let candidate = rel.from_id.clone();
                if candidate != *entity_id
                    && !direct_set.contains(&candidate)
                    && indirect_set.insert(candidate.clone())
                {
                    indirect.push(candidate);
                }
            }
        }
        Ok((direct, indirect))
    }

    /// Aggregate ripple effect of a change batch.
    ///
    /// Each change contributes its weight per direct impact and half its
    /// weight per indirect impact. The raw sum is unbounded (it grows
    /// with batch size and graph degree, so there is no fixed maximum to
    /// divide by); it maps onto the 0–100 scale by saturating at 100,
    /// which keeps scores below the cap comparable across batches.
    /// Missing entities (e.g. already-deleted rows) contribute their own
    /// weight but no impact terms.
    #[instrument(skip(self, changes), fields(count = changes.len()))]
    pub fn calculate_change_ripple(&self, changes: &[EntityChange]) -> Result<RippleEffect> {
        let descriptor = QueryDescriptor::CalculateChangeRipple {
            changes: changes.to_vec(),
        };
        self.cached(&descriptor, || {
            let mut raw = 0.0f64;
            let mut impacted: Vec<EntityId> = Vec::new();
            let mut impacted_set: HashSet<EntityId> = HashSet::new();

            for change in changes {
                let weight = change.change_type.weight();
                if self.storage.get_entity(&change.entity_id)?.is_none() {
                    // Deleted rows still carry risk even without edges left.
                    if change.change_type == ChangeType::Deleted {
                        raw += weight;
                    }
                    continue;
                }
                let (direct, indirect) = self.impact_sets(&change.entity_id)?;
                raw += weight * direct.len() as f64;
                raw += 0.5 * weight * indirect.len() as f64;
                for id in direct.into_iter().chain(indirect) {
                    if impacted_set.insert(id.clone()) {
                        impacted.push(id);
                    }
                }
            }

            Ok(RippleEffect {
                impacted,
                total_risk: raw.min(100.0),
            })
        })
    }

    // =========================================================================
    // Plan execution
    // =========================================================================

    fn run_entity_plan(&self, plan: &QueryPlan) -> Result<Vec<Entity>> {
        let conn = self.storage.pool().acquire()?;
        conn.with_conn(|c| {
            let mut stmt = c.prepare(&plan.sql).map_err(StorageError::from)?;
            let mut rows = stmt
                .query(plan.param_refs().as_slice())
                .map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(entity_from_row(row)?);
            }
            Ok(out)
        })
    }

    fn run_relationship_plan(&self, plan: &QueryPlan) -> Result<Vec<Relationship>> {
        let conn = self.storage.pool().acquire()?;
        conn.with_conn(|c| {
            let mut stmt = c.prepare(&plan.sql).map_err(StorageError::from)?;
            let mut rows = stmt
                .query(plan.param_refs().as_slice())
                .map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push(relationship_from_row(row)?);
            }
            Ok(out)
        })
    }

    fn run_id_depth_plan(&self, plan: &QueryPlan) -> Result<Vec<(EntityId, u32)>> {
        let conn = self.storage.pool().acquire()?;
        conn.with_conn(|c| {
            let mut stmt = c.prepare(&plan.sql).map_err(StorageError::from)?;
            let mut rows = stmt
                .query(plan.param_refs().as_slice())
                .map_err(StorageError::from)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(StorageError::from)? {
                out.push((
                    EntityId::from_raw(row.get::<_, String>(0).map_err(StorageError::from)?),
                    row.get::<_, i64>(1).map_err(StorageError::from)? as u32,
                ));
            }
            Ok(out)
        })
    }

    fn run_exists_plan(&self, plan: &QueryPlan) -> Result<bool> {
        let conn = self.storage.pool().acquire()?;
        conn.with_conn(|c| {
            let mut stmt = c.prepare(&plan.sql).map_err(StorageError::from)?;
            let mut rows = stmt
                .query(plan.param_refs().as_slice())
                .map_err(StorageError::from)?;
            Ok(rows.next().map_err(StorageError::from)?.is_some())
        })
    }

    // =========================================================================
    // Cache plumbing
    // =========================================================================

    fn cached<T, F>(&self, descriptor: &QueryDescriptor, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let key = query_key(descriptor);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(typed) = serde_json::from_value(value) {
                return Ok(typed);
            }
        }
        let result = compute()?;
        if let Ok(value) = serde_json::to_value(&result) {
            self.cache.put(key, value);
        }
        Ok(result)
    }
}

/// Serializable mirror of [`Subgraph`] for the cache.
#[derive(Serialize, serde::Deserialize)]
struct CachedSubgraph {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
}

/// Wall-clock budget for one in-flight operation.
///
/// Carries the start instant alongside the deadline so a timeout error
/// reports how long the query actually ran, not the configured limit.
#[derive(Clone, Copy, Debug)]
struct Budget {
    started: Instant,
    deadline: Instant,
}

impl Budget {
    fn start(limit: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + limit,
        }
    }

    fn check(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(CodeGraphError::QueryTimeout {
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PoolConfig};
    use crate::entity::{EntityType, SourceLocation};
    use crate::storage::manager::SqlManager;
    use crate::storage::migrations::migrate;
    use crate::storage::pool::ConnectionPool;

    fn test_processor() -> (QueryProcessor, Arc<GraphStorage>) {
        let name = format!(
            "file:proctest_{}?mode=memory&cache=shared",
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
        let storage = Arc::new(GraphStorage::new(Arc::new(pool)));
        let cache = Arc::new(MultiLevelCache::new(CacheConfig::default(), None));
        (
            QueryProcessor::new(Arc::clone(&storage), cache),
            storage,
        )
    }

    fn entity(name: &str, start: u64) -> Entity {
        Entity::new(
            name,
            EntityType::Function,
            "/proc.ts",
            SourceLocation::from_span(1, start, 2, start + 10),
        )
    }

    fn ring(storage: &GraphStorage, n: usize) -> Vec<Entity> {
        let entities: Vec<Entity> = (0..n).map(|i| entity(&format!("e{i}"), i as u64 * 100)).collect();
        storage.insert_entities(&entities).unwrap();
        let edges: Vec<Relationship> = (0..n)
            .map(|i| {
                Relationship::new(
                    entities[i].id.clone(),
                    entities[(i + 1) % n].id.clone(),
                    RelationshipType::Calls,
                )
            })
            .collect();
        storage.insert_relationships(&edges).unwrap();
        entities
    }

    #[test]
    fn test_get_related_entities_one_hop() {
        let (proc, storage) = test_processor();
        let a = entity("a", 0);
        let b = entity("b", 100);
        let c = entity("c", 200);
        storage
            .insert_entities(&[a.clone(), b.clone(), c.clone()])
            .unwrap();
        storage
            .insert_relationships(&[
                Relationship::new(a.id.clone(), b.id.clone(), RelationshipType::Calls),
                Relationship::new(b.id.clone(), c.id.clone(), RelationshipType::Calls),
            ])
            .unwrap();

        let related = proc.get_related_entities(&a.id, 1).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, b.id);

        let related = proc.get_related_entities(&a.id, 2).unwrap();
        assert_eq!(related.len(), 2);
    }

    #[test]
    fn test_related_depth_validation() {
        let (proc, _storage) = test_processor();
        let id = EntityId::from_raw("abcabcabcabc");
        assert!(proc.get_related_entities(&id, 0).is_err());
        assert!(proc.get_related_entities(&id, 11).is_err());
    }

    #[test]
    fn test_find_path_two_hops() {
        let (proc, storage) = test_processor();
        let a = entity("a", 0);
        let b = entity("b", 100);
        let c = entity("c", 200);
        storage
            .insert_entities(&[a.clone(), b.clone(), c.clone()])
            .unwrap();
        storage
            .insert_relationships(&[
                Relationship::new(a.id.clone(), b.id.clone(), RelationshipType::Calls),
                Relationship::new(b.id.clone(), c.id.clone(), RelationshipType::Contains),
            ])
            .unwrap();

        let path = proc.find_path(&a.id, &c.id).unwrap().unwrap();
        assert_eq!(path.length, 2);
        assert_eq!(path.nodes.len(), 3);
        assert_eq!(path.nodes[0].id, a.id);
        assert_eq!(path.nodes[2].id, c.id);
        assert_eq!(path.edges.len(), 2);
    }

    #[test]
    fn test_find_path_none_when_disconnected() {
        let (proc, storage) = test_processor();
        let a = entity("a", 0);
        let b = entity("b", 100);
        storage.insert_entities(&[a.clone(), b.clone()]).unwrap();
        assert!(proc.find_path(&a.id, &b.id).unwrap().is_none());
    }

    #[test]
    fn test_detect_cycles_ring_of_five() {
        let (proc, storage) = test_processor();
        let entities = ring(&storage, 5);
        let cycles = proc.detect_cycles().unwrap();
        assert_eq!(cycles.len(), 1);
        let cycle_set: HashSet<&EntityId> = cycles[0].entities.iter().collect();
        for e in &entities {
            assert!(cycle_set.contains(&e.id));
        }
    }

    #[test]
    fn test_detect_cycles_none_on_dag() {
        let (proc, storage) = test_processor();
        let a = entity("a", 0);
        let b = entity("b", 100);
        storage.insert_entities(&[a.clone(), b.clone()]).unwrap();
        storage
            .insert_relationship(&Relationship::new(
                a.id.clone(),
                b.id.clone(),
                RelationshipType::Calls,
            ))
            .unwrap();
        assert!(proc.detect_cycles().unwrap().is_empty());
    }

    #[test]
    fn test_detect_cycles_terminates_on_large_scc() {
        let (proc, storage) = test_processor();
        // A ring of 100: one big strongly connected component. The depth
        // cap keeps this from exploding; the call must simply terminate.
        ring(&storage, 100);
        proc.detect_cycles().unwrap();
    }

    #[test]
    fn test_impact_on_ring() {
        let (proc, storage) = test_processor();
        let entities = ring(&storage, 5);
        let impact = proc.get_impacted_entities(&entities[0].id).unwrap();
        assert_eq!(impact.direct, vec![entities[4].id.clone()]);
        assert_eq!(impact.indirect, vec![entities[3].id.clone()]);
        assert_eq!(impact.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_impact_missing_entity_is_not_found() {
        let (proc, _storage) = test_processor();
        let err = proc
            .get_impacted_entities(&EntityId::from_raw("missing00000"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_ripple_weights() {
        let (proc, storage) = test_processor();
        let entities = ring(&storage, 5);
        let ripple = proc
            .calculate_change_ripple(&[EntityChange {
                entity_id: entities[0].id.clone(),
                change_type: ChangeType::Modified,
                timestamp: crate::types::Timestamp::now(),
            }])
            .unwrap();
        // 1 direct * 2.0 + 1 indirect * 0.5 * 2.0 = 3.0
        assert!((ripple.total_risk - 3.0).abs() < f64::EPSILON);
        assert_eq!(ripple.impacted.len(), 2);
    }

    #[test]
    fn test_ripple_saturates_at_one_hundred() {
        let (proc, storage) = test_processor();
        // A hub with 40 dependents: deleting it scores 40 * 3 = 120 raw,
        // which must saturate at the top of the 0-100 scale.
        let hub = entity("hub", 0);
        storage.insert_entity(&hub).unwrap();
        for i in 0..40u64 {
            let caller = entity(&format!("caller{i}"), 1_000 + i * 100);
            storage.insert_entity(&caller).unwrap();
            storage
                .insert_relationship(&Relationship::new(
                    caller.id.clone(),
                    hub.id.clone(),
                    RelationshipType::Calls,
                ))
                .unwrap();
        }

        let ripple = proc
            .calculate_change_ripple(&[EntityChange {
                entity_id: hub.id.clone(),
                change_type: ChangeType::Deleted,
                timestamp: crate::types::Timestamp::now(),
            }])
            .unwrap();
        assert_eq!(ripple.total_risk, 100.0);
        assert_eq!(ripple.impacted.len(), 40);
    }

    #[test]
    fn test_budget_timeout_reports_actual_elapsed() {
        let (proc, storage) = test_processor();
        ring(&storage, 3);
        let proc = proc.with_budget(Duration::from_millis(0));

        let err = proc.detect_cycles().unwrap_err();
        match err {
            CodeGraphError::QueryTimeout { elapsed_ms } => {
                // A zero budget trips on the first check; the reported
                // time must be the real elapsed time, not the configured
                // five-second limit.
                assert!(elapsed_ms < 1_000, "elapsed_ms = {elapsed_ms}");
            }
            other => panic!("expected QueryTimeout, got {other}"),
        }
    }

    #[test]
    fn test_hotspots_ranked_by_weighted_degree() {
        let (proc, storage) = test_processor();
        let hub = entity("hub", 0);
        storage.insert_entity(&hub).unwrap();
        let mut others = Vec::new();
        for i in 0..6 {
            let e = entity(&format!("caller{i}"), 100 + i * 100);
            storage.insert_entity(&e).unwrap();
            storage
                .insert_relationship(&Relationship::new(
                    e.id.clone(),
                    hub.id.clone(),
                    RelationshipType::Calls,
                ))
                .unwrap();
            others.push(e);
        }

        let hotspots = proc.analyze_hotspots().unwrap();
        assert_eq!(hotspots.len(), 1);
        assert_eq!(hotspots[0].entity_id, hub.id);
        assert_eq!(hotspots[0].incoming, 6);
        assert_eq!(hotspots[0].score, 12);
        assert_eq!(hotspots[0].change_frequency, 0);
    }

    #[test]
    fn test_find_dependencies_marks_cycles() {
        let (proc, storage) = test_processor();
        let a = entity("a", 0);
        let b = entity("b", 100);
        storage.insert_entities(&[a.clone(), b.clone()]).unwrap();
        storage
            .insert_relationships(&[
                Relationship::new(a.id.clone(), b.id.clone(), RelationshipType::DependsOn),
                Relationship::new(b.id.clone(), a.id.clone(), RelationshipType::DependsOn),
            ])
            .unwrap();

        let tree = proc.find_dependencies(&a.id).unwrap();
        assert_eq!(tree.root.entity_id, a.id);
        assert_eq!(tree.root.children.len(), 1);
        let b_node = &tree.root.children[0];
        assert_eq!(b_node.entity_id, b.id);
        assert!(!b_node.circular);
        // b's child is a, which is on the stack: circular.
        assert!(b_node.children[0].circular);
        assert_eq!(tree.cycles.len(), 1);
    }

    #[test]
    fn test_results_are_cached() {
        let (proc, storage) = test_processor();
        let a = entity("a", 0);
        storage.insert_entity(&a).unwrap();

        let first = proc.get_entity(&a.id).unwrap().unwrap();
        // Mutate behind the cache's back; the cached value must win
        // until invalidation.
        storage.delete_entity(&a.id).unwrap();
        let second = proc.get_entity(&a.id).unwrap().unwrap();
        assert_eq!(first, second);
    }
}
