//! Query optimizer: rewrites query descriptors into parameterized SQL
//! with index hints and cost estimates.
//!
//! The cost model is deliberately simple: a full table scan costs 1000
//! units, an indexed equality predicate scales that by 0.1, a `LIKE`
//! predicate by 0.5, and each join doubles it. Traversal-shaped queries
//! compile to recursive CTEs whose path-string guard
//! (`path NOT LIKE '%/<id>/%'`) prevents cycles inside the engine.

use crate::entity::EntityType;
use crate::relation::RelationshipType;
use crate::storage::graph::{Direction, ENTITY_COLS, REL_COLS};
use crate::types::EntityId;

/// Baseline cost of an unindexed full scan.
const FULL_SCAN_COST: f64 = 1000.0;
/// Cost multiplier for an indexed equality predicate.
const INDEXED_EQ: f64 = 0.1;
/// Cost multiplier for a `LIKE` predicate.
const LIKE_SCAN: f64 = 0.5;
/// Cost multiplier per join.
const JOIN: f64 = 2.0;
/// Hard cap on traversal depth inside recursive CTEs.
pub const MAX_TRAVERSAL_DEPTH: u32 = 10;

/// A bindable SQL parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    /// Text parameter.
    Text(String),
    /// Integer parameter.
    Int(i64),
}

impl rusqlite::ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Int(i) => i.to_sql(),
        }
    }
}

/// A compiled query: SQL text, bind parameters, the index the planner
/// expects SQLite to use, and an estimated cost.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    /// Parameterized SQL.
    pub sql: String,
    /// Bind parameters, positional.
    pub params: Vec<SqlParam>,
    /// Index hint recorded for observability.
    pub index: &'static str,
    /// Estimated cost in scan units.
    pub estimated_cost: f64,
}

impl QueryPlan {
    /// Returns the parameters as a slice of `ToSql` references for
    /// binding.
    pub fn param_refs(&self) -> Vec<&dyn rusqlite::ToSql> {
        self.params.iter().map(|p| p as &dyn rusqlite::ToSql).collect()
    }
}

/// Filter shape consumed by [`QueryOptimizer::optimize_entity_query`].
#[derive(Clone, Debug, Default)]
pub struct EntityFilter {
    /// Exact id lookup (wins over everything).
    pub id: Option<EntityId>,
    /// Entity type membership.
    pub entity_types: Vec<EntityType>,
    /// File path membership.
    pub file_paths: Vec<String>,
    /// Exact name.
    pub name: Option<String>,
    /// `LIKE` pattern on name.
    pub name_like: Option<String>,
    /// Page size.
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

/// Stateless SQL planner.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryOptimizer;

impl QueryOptimizer {
    /// Creates a planner.
    pub fn new() -> Self {
        Self
    }

    /// Plans an entity lookup, choosing the narrowest available index:
    /// primary key, then `(type)`, then `(file_path)`, then `(name)`.
    pub fn optimize_entity_query(&self, filter: &EntityFilter) -> QueryPlan {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        let mut cost = FULL_SCAN_COST;
        let mut index = "full-scan";

        if let Some(id) = &filter.id {
            clauses.push("id = ?".to_string());
            params.push(SqlParam::Text(id.to_string()));
            cost = 1.0;
            index = "PRIMARY";
        } else {
            if !filter.entity_types.is_empty() {
                clauses.push(format!(
                    "type IN ({})",
                    n_placeholders(filter.entity_types.len())
                ));
                for t in &filter.entity_types {
                    params.push(SqlParam::Text(t.as_str().to_string()));
                }
                cost *= INDEXED_EQ;
                index = "idx_entities_type";
            }
            if !filter.file_paths.is_empty() {
                clauses.push(format!(
                    "file_path IN ({})",
                    n_placeholders(filter.file_paths.len())
                ));
                for p in &filter.file_paths {
                    params.push(SqlParam::Text(p.clone()));
                }
                if index == "full-scan" {
                    index = "idx_entities_file_path";
                }
                cost *= INDEXED_EQ;
            }
            if let Some(name) = &filter.name {
                clauses.push("name = ?".to_string());
                params.push(SqlParam::Text(name.clone()));
                if index == "full-scan" {
                    index = "idx_entities_name";
                }
                cost *= INDEXED_EQ;
            } else if let Some(pattern) = &filter.name_like {
                clauses.push("name LIKE ?".to_string());
                params.push(SqlParam::Text(pattern.clone()));
                if index == "full-scan" {
                    index = "idx_entities_name";
                }
                cost *= LIKE_SCAN;
            }
        }

        let mut sql = format!("SELECT {ENTITY_COLS} FROM entities");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY file_path, name LIMIT ? OFFSET ?");
        params.push(SqlParam::Int(filter.limit as i64));
        params.push(SqlParam::Int(filter.offset as i64));

        QueryPlan {
            sql,
            params,
            index,
            estimated_cost: cost,
        }
    }

    /// Plans an edge lookup around one entity.
    pub fn optimize_relationship_query(
        &self,
        entity_id: &EntityId,
        rel_type: Option<RelationshipType>,
        direction: Direction,
    ) -> QueryPlan {
        let mut params: Vec<SqlParam> = Vec::new();
        let (clause, index) = match direction {
            Direction::Outgoing => {
                params.push(SqlParam::Text(entity_id.to_string()));
                ("from_id = ?", "idx_relationships_from")
            }
            Direction::Incoming => {
                params.push(SqlParam::Text(entity_id.to_string()));
                ("to_id = ?", "idx_relationships_to")
            }
            Direction::Both => {
                params.push(SqlParam::Text(entity_id.to_string()));
                params.push(SqlParam::Text(entity_id.to_string()));
                ("(from_id = ? OR to_id = ?)", "idx_relationships_from")
            }
        };

        let mut sql = format!("SELECT {REL_COLS} FROM relationships WHERE {clause}");
        let mut cost = FULL_SCAN_COST * INDEXED_EQ;
        let index = if let Some(t) = rel_type {
            sql.push_str(" AND type = ?");
            params.push(SqlParam::Text(t.as_str().to_string()));
            cost *= INDEXED_EQ;
            match direction {
                Direction::Outgoing | Direction::Both => "idx_relationships_from_type",
                Direction::Incoming => "idx_relationships_to_type",
            }
        } else {
            index
        };
        sql.push_str(" ORDER BY id");

        QueryPlan {
            sql,
            params,
            index,
            estimated_cost: cost,
        }
    }

    /// Plans a bounded breadth-first traversal from `root` as a recursive
    /// CTE. Returns each reached entity id with its minimum depth;
    /// depth 0 (the root itself) is filtered out.
    ///
    /// The `path` column accumulates `/id/` segments; the `NOT LIKE`
    /// guard keeps the walk from re-entering a node, which bounds the
    /// recursion even on cyclic graphs.
    pub fn optimize_traversal_query(
        &self,
        root: &EntityId,
        depth: u32,
        rel_types: &[RelationshipType],
    ) -> QueryPlan {
        let depth = depth.min(MAX_TRAVERSAL_DEPTH);
        let type_filter = if rel_types.is_empty() {
            String::new()
        } else {
            format!(" AND r.type IN ({})", n_placeholders(rel_types.len()))
        };

        let sql = format!(
            "WITH RECURSIVE traverse(id, depth, path) AS (
                 SELECT ?, 0, '/' || ? || '/'
                 UNION ALL
                 SELECT CASE WHEN r.from_id = t.id THEN r.to_id ELSE r.from_id END,
                        t.depth + 1,
                        t.path || CASE WHEN r.from_id = t.id THEN r.to_id ELSE r.from_id END || '/'
                 FROM relationships r
                 JOIN traverse t ON (r.from_id = t.id OR r.to_id = t.id)
                 WHERE t.depth < ?
                   AND t.path NOT LIKE '%/' ||
                       (CASE WHEN r.from_id = t.id THEN r.to_id ELSE r.from_id END) || '/%'
                   {type_filter}
             )
             SELECT id, MIN(depth) AS depth FROM traverse
             WHERE depth > 0
             GROUP BY id
             ORDER BY depth, id"
        );

        let mut params = vec![
            SqlParam::Text(root.to_string()),
            SqlParam::Text(root.to_string()),
            SqlParam::Int(depth as i64),
        ];
        for t in rel_types {
            params.push(SqlParam::Text(t.as_str().to_string()));
        }

        QueryPlan {
            sql,
            params,
            index: "idx_relationships_from_to_type",
            estimated_cost: FULL_SCAN_COST * INDEXED_EQ * JOIN * depth as f64,
        }
    }

    /// Plans a shortest-path search between two entities. The CTE walks
    /// the undirected view of the graph and returns the first row ordered
    /// by depth, whose `path` column carries the full `/a/b/c/` id chain.
    pub fn optimize_path_query(
        &self,
        from: &EntityId,
        to: &EntityId,
        max_depth: u32,
    ) -> QueryPlan {
        let max_depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let sql = "WITH RECURSIVE paths(id, depth, path) AS (
                 SELECT ?, 0, '/' || ? || '/'
                 UNION ALL
                 SELECT CASE WHEN r.from_id = p.id THEN r.to_id ELSE r.from_id END,
                        p.depth + 1,
                        p.path || CASE WHEN r.from_id = p.id THEN r.to_id ELSE r.from_id END || '/'
                 FROM relationships r
                 JOIN paths p ON (r.from_id = p.id OR r.to_id = p.id)
                 WHERE p.depth < ?
                   AND p.path NOT LIKE '%/' ||
                       (CASE WHEN r.from_id = p.id THEN r.to_id ELSE r.from_id END) || '/%'
             )
             SELECT path, depth FROM paths WHERE id = ? ORDER BY depth LIMIT 1"
            .to_string();

        QueryPlan {
            sql,
            params: vec![
                SqlParam::Text(from.to_string()),
                SqlParam::Text(from.to_string()),
                SqlParam::Int(max_depth as i64),
                SqlParam::Text(to.to_string()),
            ],
            index: "idx_relationships_from_to_type",
            estimated_cost: FULL_SCAN_COST * INDEXED_EQ * JOIN * max_depth as f64,
        }
    }

    /// Plans the hotspot aggregation: per-entity in/out degree with the
    /// weighted score `incoming * 2 + outgoing`, filtered to entities
    /// with at least `min_connections` total edges, top 100 by score.
    pub fn optimize_hotspot_query(&self, min_connections: u32) -> QueryPlan {
        let sql = "WITH degrees AS (
                 SELECT e.id, e.name,
                        (SELECT COUNT(*) FROM relationships r WHERE r.to_id = e.id) AS incoming,
                        (SELECT COUNT(*) FROM relationships r WHERE r.from_id = e.id) AS outgoing
                 FROM entities e
             )
             SELECT id, name, incoming, outgoing, incoming * 2 + outgoing AS score
             FROM degrees
             WHERE incoming + outgoing >= ?
             ORDER BY score DESC, id
             LIMIT 100"
            .to_string();

        QueryPlan {
            sql,
            params: vec![SqlParam::Int(min_connections as i64)],
            index: "idx_relationships_to_type",
            estimated_cost: FULL_SCAN_COST * JOIN,
        }
    }

    /// Plans a directed cycle probe for one starting entity: does any
    /// walk of length ≤ `max_depth` along outgoing edges return to the
    /// origin? Used as a cheap pre-filter before the DFS reconstructs
    /// the actual cycle path.
    pub fn optimize_cycle_detection_query(
        &self,
        start: &EntityId,
        max_depth: u32,
    ) -> QueryPlan {
        let max_depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let sql = "WITH RECURSIVE walk(id, depth, path) AS (
                 SELECT ?, 0, '/' || ? || '/'
                 UNION ALL
                 SELECT r.to_id, w.depth + 1, w.path || r.to_id || '/'
                 FROM relationships r
                 JOIN walk w ON r.from_id = w.id
                 WHERE w.depth < ?
                   AND (r.to_id = ? OR w.path NOT LIKE '%/' || r.to_id || '/%')
             )
             SELECT 1 FROM walk WHERE depth > 0 AND id = ? LIMIT 1"
            .to_string();

        QueryPlan {
            sql,
            params: vec![
                SqlParam::Text(start.to_string()),
                SqlParam::Text(start.to_string()),
                SqlParam::Int(max_depth as i64),
                SqlParam::Text(start.to_string()),
                SqlParam::Text(start.to_string()),
            ],
            index: "idx_relationships_from",
            estimated_cost: FULL_SCAN_COST * INDEXED_EQ * JOIN * max_depth as f64,
        }
    }
}

fn n_placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}
