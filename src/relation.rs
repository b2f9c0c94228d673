//! Relationship domain model: directed typed edges between entities.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, RelationshipId, Timestamp};

/// Kind of a directed edge between two entities.
///
/// Wire names are the SCREAMING_CASE strings emitted by parsers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// `from` imports `to`.
    Imports,
    /// `from` exports `to`.
    Exports,
    /// `from` calls `to`.
    Calls,
    /// `from` references `to` by name.
    References,
    /// `from` lexically contains `to`.
    Contains,
    /// `from` extends `to` (class inheritance).
    Extends,
    /// `from` implements `to` (interface conformance).
    Implements,
    /// `from` depends on `to` (module/package level).
    DependsOn,
}

impl RelationshipType {
    /// All relationship types, in declaration order.
    pub const ALL: [RelationshipType; 8] = [
        RelationshipType::Imports,
        RelationshipType::Exports,
        RelationshipType::Calls,
        RelationshipType::References,
        RelationshipType::Contains,
        RelationshipType::Extends,
        RelationshipType::Implements,
        RelationshipType::DependsOn,
    ];

    /// Returns the storage/wire name of this type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Imports => "IMPORTS",
            RelationshipType::Exports => "EXPORTS",
            RelationshipType::Calls => "CALLS",
            RelationshipType::References => "REFERENCES",
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::Extends => "EXTENDS",
            RelationshipType::Implements => "IMPLEMENTS",
            RelationshipType::DependsOn => "DEPENDS_ON",
        }
    }

    /// Parses a storage/wire name back into a type.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how an edge was observed in source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMetadata {
    /// 1-based line of the referencing site.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 0-based column of the referencing site.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Short source excerpt around the site.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// The parser's raw edge label before normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_type: Option<String>,
}

/// A directed typed edge between two stored entities.
///
/// Both endpoints always resolve to a stored entity; symbols outside the
/// indexed corpus are materialized as external placeholder entities first.
/// Self-loops are allowed. The id is stable by content, so re-inserting an
/// edge is an idempotent overwrite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Content-addressed identifier (see [`RelationshipId::from_parts`]).
    pub id: RelationshipId,
    /// Source entity id.
    pub from_id: EntityId,
    /// Target entity id.
    pub to_id: EntityId,
    /// Edge kind.
    pub rel_type: RelationshipType,
    /// Observation site and raw label.
    pub metadata: RelationshipMetadata,
    /// Optional edge weight used by ranking queries.
    pub weight: Option<f64>,
    /// Creation time (ms since epoch).
    pub created_at: Timestamp,
}

impl Relationship {
    /// Builds an edge, deriving its stable id from endpoints and type.
    pub fn new(from_id: EntityId, to_id: EntityId, rel_type: RelationshipType) -> Self {
        let id = RelationshipId::from_parts(&from_id, &to_id, rel_type.as_str());
        Self {
            id,
            from_id,
            to_id,
            rel_type,
            metadata: RelationshipMetadata::default(),
            weight: None,
            created_at: Timestamp::now(),
        }
    }

    /// Sets the metadata, returning self for chaining.
    pub fn with_metadata(mut self, metadata: RelationshipMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the weight, returning self for chaining.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: &str) -> EntityId {
        EntityId::from_parts("/a.ts", "function", n, 0, 10)
    }

    #[test]
    fn test_relationship_id_stable() {
        let a = Relationship::new(id("f"), id("g"), RelationshipType::Calls);
        let b = Relationship::new(id("f"), id("g"), RelationshipType::Calls);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_relationship_type_round_trip() {
        for t in RelationshipType::ALL {
            assert_eq!(RelationshipType::parse(t.as_str()), Some(t));
        }
        assert_eq!(RelationshipType::parse("USES"), None);
    }

    #[test]
    fn test_depends_on_wire_name() {
        assert_eq!(RelationshipType::DependsOn.as_str(), "DEPENDS_ON");
        let json = serde_json::to_string(&RelationshipType::DependsOn).unwrap();
        assert_eq!(json, "\"DEPENDS_ON\"");
    }

    #[test]
    fn test_self_loop_allowed() {
        let r = Relationship::new(id("f"), id("f"), RelationshipType::References);
        assert_eq!(r.from_id, r.to_id);
    }

    #[test]
    fn test_metadata_skips_none_fields() {
        let r = Relationship::new(id("f"), id("g"), RelationshipType::Calls);
        let json = serde_json::to_value(&r.metadata).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
