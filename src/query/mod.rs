//! Graph query layer: descriptors, the SQL optimizer, and the processor
//! that executes them.
//!
//! A [`QueryDescriptor`] names one read operation and its arguments. The
//! descriptor doubles as the cache identity: its canonical JSON form is
//! hashed into the query key, so two logically equivalent requests share
//! one cache slot regardless of field order.

pub mod optimizer;
pub mod processor;

pub use optimizer::{EntityFilter, QueryOptimizer, QueryPlan, SqlParam, MAX_TRAVERSAL_DEPTH};
pub use processor::QueryProcessor;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::relation::Relationship;
use crate::storage::graph::{EntityQuery, RelationshipQuery};
use crate::types::{EntityId, Timestamp};

/// One read operation dispatched by the processor.
///
/// Serialized (with sorted keys) and hashed to form the cache key for
/// the operation's result.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum QueryDescriptor {
    /// Point lookup by id.
    GetEntity {
        /// Entity id.
        id: EntityId,
    },
    /// Filtered listing.
    ListEntities {
        /// Filter set.
        query: EntityQuery,
    },
    /// Edges touching one entity.
    GetRelationships {
        /// Entity id.
        entity_id: EntityId,
        /// Optional edge-type filter (wire name).
        rel_type: Option<String>,
    },
    /// Bounded traversal from a root.
    GetRelatedEntities {
        /// Root entity id.
        entity_id: EntityId,
        /// Traversal depth, 1..=10.
        depth: u32,
    },
    /// Shortest path between two entities.
    FindPath {
        /// Start entity.
        from_id: EntityId,
        /// Target entity.
        to_id: EntityId,
    },
    /// Subgraph extraction.
    GetSubgraph {
        /// Root entity id.
        root_id: EntityId,
        /// Extraction depth, 0..=5.
        depth: u32,
    },
    /// Dependency tree over outgoing DEPENDS_ON edges.
    FindDependencies {
        /// Root entity id.
        entity_id: EntityId,
    },
    /// Whole-graph cycle detection.
    DetectCycles,
    /// Degree-ranked hotspots.
    AnalyzeHotspots,
    /// Impact analysis for one entity.
    GetImpactedEntities {
        /// Changed entity id.
        entity_id: EntityId,
    },
    /// Ripple effect over a batch of changes.
    CalculateChangeRipple {
        /// The change batch.
        changes: Vec<EntityChange>,
    },
    /// Filtered relationship listing.
    FindRelationships {
        /// Filter set.
        query: RelationshipQuery,
    },
}

/// A path between two entities over the undirected view of the graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Path {
    /// Entities along the path, endpoints included.
    pub nodes: Vec<Entity>,
    /// Edges connecting consecutive nodes.
    pub edges: Vec<Relationship>,
    /// Number of hops (`edges.len()`).
    pub length: usize,
}

/// A node in a dependency tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyNode {
    /// Entity id.
    pub entity_id: EntityId,
    /// Entity name (denormalized for display).
    pub name: String,
    /// True when this node was already on the recursion stack — the
    /// subtree is cut here and the cycle recorded on the tree.
    pub circular: bool,
    /// Direct dependencies.
    pub children: Vec<DependencyNode>,
}

/// Dependency tree rooted at one entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyTree {
    /// The root node.
    pub root: DependencyNode,
    /// Cycles discovered while building the tree (paths of entity ids).
    pub cycles: Vec<Vec<EntityId>>,
}

/// A directed cycle in the relationship graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    /// Entities on the cycle, in walk order starting at the detection
    /// origin.
    pub entities: Vec<EntityId>,
}

impl Cycle {
    /// Number of entities on the cycle.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// True for a degenerate empty cycle (never produced by detection).
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// A high-traffic entity ranked by weighted degree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    /// Entity id.
    pub entity_id: EntityId,
    /// Entity name.
    pub name: String,
    /// In-degree.
    pub incoming: u64,
    /// Out-degree.
    pub outgoing: u64,
    /// `incoming * 2 + outgoing`.
    pub score: u64,
    /// Changes per unit time. Always 0 until a change log exists; the
    /// field stays in the shape so consumers need no migration later.
    pub change_frequency: u64,
}

/// Risk bucket for impact analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// 5 or fewer impacted entities.
    Low,
    /// 6–20 impacted entities.
    Medium,
    /// 21–50 impacted entities.
    High,
    /// More than 50 impacted entities.
    Critical,
}

impl RiskLevel {
    /// Buckets a total impacted-entity count.
    pub fn from_total(total: usize) -> Self {
        if total > 50 {
            RiskLevel::Critical
        } else if total > 20 {
            RiskLevel::High
        } else if total > 5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Result of impact analysis for one entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    /// The analyzed entity.
    pub source: EntityId,
    /// Entities with an edge into the source (would break first).
    pub direct: Vec<EntityId>,
    /// Two-hop closure over the direct impacts.
    pub indirect: Vec<EntityId>,
    /// Bucketed severity from the total impacted count.
    pub risk_level: RiskLevel,
}

/// Kind of change applied to an entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Entity was created.
    Added,
    /// Entity was modified in place.
    Modified,
    /// Entity was removed.
    Deleted,
}

impl ChangeType {
    /// Ripple weight of this change kind.
    pub fn weight(&self) -> f64 {
        match self {
            ChangeType::Added => 1.0,
            ChangeType::Modified => 2.0,
            ChangeType::Deleted => 3.0,
        }
    }
}

/// One entity change in a ripple batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityChange {
    /// Changed entity.
    pub entity_id: EntityId,
    /// What happened.
    pub change_type: ChangeType,
    /// When it happened.
    pub timestamp: Timestamp,
}

/// Aggregate ripple effect of a change batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RippleEffect {
    /// Union of all impacted entities across the batch.
    pub impacted: Vec<EntityId>,
    /// Total risk, normalized to 0–100.
    pub total_risk: f64,
}
