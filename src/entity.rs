//! Entity domain model: code artifacts extracted from source files.
//!
//! An [`Entity`] is one code artifact (function, class, import, ...) with a
//! content-addressed id, a source location, and free-form JSON metadata.
//! [`FileInfo`] tracks per-file indexing state for incremental updates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{EntityId, Timestamp};

/// Kind of code artifact an entity represents.
///
/// The wire names (serde / storage) are the lowercase strings emitted by
/// parsers; `TypeAlias` maps to `"type"` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// Free-standing function.
    Function,
    /// Method bound to a class or interface.
    Method,
    /// Class declaration.
    Class,
    /// Interface declaration.
    Interface,
    /// Variable binding.
    Variable,
    /// Constant binding.
    Constant,
    /// Import statement or imported symbol.
    Import,
    /// Export statement or exported symbol.
    Export,
    /// Module-level artifact.
    Module,
    /// Namespace declaration.
    Namespace,
    /// Type alias declaration.
    #[serde(rename = "type")]
    TypeAlias,
    /// Enum declaration.
    Enum,
    /// Decorator application.
    Decorator,
    /// Property of a class or object.
    Property,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [EntityType; 14] = [
        EntityType::Function,
        EntityType::Method,
        EntityType::Class,
        EntityType::Interface,
        EntityType::Variable,
        EntityType::Constant,
        EntityType::Import,
        EntityType::Export,
        EntityType::Module,
        EntityType::Namespace,
        EntityType::TypeAlias,
        EntityType::Enum,
        EntityType::Decorator,
        EntityType::Property,
    ];

    /// Returns the storage/wire name of this type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityType::Function => "function",
            EntityType::Method => "method",
            EntityType::Class => "class",
            EntityType::Interface => "interface",
            EntityType::Variable => "variable",
            EntityType::Constant => "constant",
            EntityType::Import => "import",
            EntityType::Export => "export",
            EntityType::Module => "module",
            EntityType::Namespace => "namespace",
            EntityType::TypeAlias => "type",
            EntityType::Enum => "enum",
            EntityType::Decorator => "decorator",
            EntityType::Property => "property",
        }
    }

    /// Parses a storage/wire name back into a type.
    ///
    /// Unknown names map to `None`; callers decide whether that is an
    /// error (strict validation) or a skip (lenient ingestion).
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single position in a source file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePos {
    /// 1-based line number.
    pub line: u32,
    /// 0-based column.
    pub column: u32,
    /// Absolute byte offset into the file.
    pub index: u64,
}

/// Start/end span of an entity in its source file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// First position covered by the entity.
    pub start: SourcePos,
    /// One past the last position covered.
    pub end: SourcePos,
}

impl SourceLocation {
    /// Builds a span from raw positions.
    pub fn new(start: SourcePos, end: SourcePos) -> Self {
        Self { start, end }
    }

    /// Convenience constructor from line/index pairs, columns zeroed.
    pub fn from_span(start_line: u32, start_index: u64, end_line: u32, end_index: u64) -> Self {
        Self {
            start: SourcePos {
                line: start_line,
                column: 0,
                index: start_index,
            },
            end: SourcePos {
                line: end_line,
                column: 0,
                index: end_index,
            },
        }
    }
}

/// A code artifact stored in the graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Content-addressed identifier (see [`EntityId::from_parts`]).
    pub id: EntityId,
    /// Symbol name.
    pub name: String,
    /// Artifact kind.
    pub entity_type: EntityType,
    /// Path of the owning source file. External placeholders use the
    /// synthetic `external://<source>` scheme.
    pub file_path: String,
    /// Source span.
    pub location: SourceLocation,
    /// Free-form structured data: modifiers, return type, parameters,
    /// language, decorators, `isExternal`, ...
    pub metadata: Value,
    /// Content hash for change detection.
    pub hash: String,
    /// Creation time (ms since epoch). Preserved across upserts.
    pub created_at: Timestamp,
    /// Last write time (ms since epoch). Always `>= created_at`.
    pub updated_at: Timestamp,
    /// Optional cyclomatic-style complexity score.
    pub complexity_score: Option<f64>,
    /// Source language, when known.
    pub language: Option<String>,
    /// Size of the artifact's source text in bytes.
    pub size_bytes: Option<u64>,
}

impl Entity {
    /// Builds an entity, deriving its stable id from the identifying fields.
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        file_path: impl Into<String>,
        location: SourceLocation,
    ) -> Self {
        let name = name.into();
        let file_path = file_path.into();
        let id = EntityId::from_parts(
            &file_path,
            entity_type.as_str(),
            &name,
            location.start.index,
            location.end.index,
        );
        let now = Timestamp::now();
        Self {
            id,
            name,
            entity_type,
            file_path,
            location,
            metadata: Value::Object(serde_json::Map::new()),
            hash: String::new(),
            created_at: now,
            updated_at: now,
            complexity_score: None,
            language: None,
            size_bytes: None,
        }
    }

    /// Builds an external placeholder entity for a symbol outside the
    /// indexed corpus.
    ///
    /// The placeholder's `file_path` is `external://<source>` and its
    /// metadata carries `isExternal: true`, so referential integrity holds
    /// without forcing the external code to be indexed.
    pub fn external_placeholder(source: &str, symbol: &str) -> Self {
        let file_path = format!("external://{source}");
        let location = SourceLocation::default();
        let mut entity = Self::new(symbol, EntityType::Import, file_path, location);
        entity.metadata = serde_json::json!({ "isExternal": true, "source": source });
        entity
    }

    /// Returns true if this entity is an external placeholder.
    pub fn is_external(&self) -> bool {
        self.file_path.starts_with("external://")
    }

    /// Sets the metadata, returning self for chaining during construction.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the content hash, returning self for chaining.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    /// Sets the language, returning self for chaining.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Partial update applied by `update_entity`.
///
/// Only fields set to `Some(...)` are written. The id, file path, type,
/// and `created_at` are immutable; `updated_at` is stamped by storage.
#[derive(Clone, Debug, Default)]
pub struct EntityPatch {
    /// New symbol name.
    pub name: Option<String>,
    /// Replacement metadata document.
    pub metadata: Option<Value>,
    /// New content hash.
    pub hash: Option<String>,
    /// New source span.
    pub location: Option<SourceLocation>,
    /// New complexity score.
    pub complexity_score: Option<f64>,
    /// New language tag.
    pub language: Option<String>,
    /// New size in bytes.
    pub size_bytes: Option<u64>,
}

impl EntityPatch {
    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.metadata.is_none()
            && self.hash.is_none()
            && self.location.is_none()
            && self.complexity_score.is_none()
            && self.language.is_none()
            && self.size_bytes.is_none()
    }
}

/// Per-file indexing state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Source file path (unique).
    pub path: String,
    /// Content hash at last indexing.
    pub hash: String,
    /// When the file was last indexed.
    pub last_indexed: Timestamp,
    /// Number of entities extracted from the file.
    pub entity_count: u64,
}

/// Validates an entity before it is written.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidEntity`] when the name or file path is
/// empty, the span is inverted, or the timestamps are out of order.
pub fn validate_entity(entity: &Entity) -> Result<(), ValidationError> {
    if entity.name.trim().is_empty() {
        return Err(ValidationError::invalid_entity("name must not be empty"));
    }
    if entity.file_path.trim().is_empty() {
        return Err(ValidationError::invalid_entity(
            "file_path must not be empty",
        ));
    }
    if entity.location.end.index < entity.location.start.index {
        return Err(ValidationError::invalid_entity(
            "location end precedes start",
        ));
    }
    if entity.updated_at < entity.created_at {
        return Err(ValidationError::invalid_entity(
            "updated_at precedes created_at",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entity() -> Entity {
        Entity::new(
            "handleRequest",
            EntityType::Function,
            "/src/server.ts",
            SourceLocation::from_span(10, 240, 42, 1103),
        )
    }

    #[test]
    fn test_new_derives_stable_id() {
        let a = sample_entity();
        let b = sample_entity();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_entity_type_round_trip() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EntityType::parse("widget"), None);
    }

    #[test]
    fn test_type_alias_wire_name() {
        assert_eq!(EntityType::TypeAlias.as_str(), "type");
        let json = serde_json::to_string(&EntityType::TypeAlias).unwrap();
        assert_eq!(json, "\"type\"");
    }

    #[test]
    fn test_external_placeholder() {
        let p = Entity::external_placeholder("lodash", "debounce");
        assert!(p.is_external());
        assert_eq!(p.file_path, "external://lodash");
        assert_eq!(p.metadata["isExternal"], serde_json::json!(true));
        // Stable across constructions
        let q = Entity::external_placeholder("lodash", "debounce");
        assert_eq!(p.id, q.id);
    }

    #[test]
    fn test_validate_accepts_good_entity() {
        assert!(validate_entity(&sample_entity()).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut e = sample_entity();
        e.name = "  ".to_string();
        assert!(validate_entity(&e).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_span() {
        let mut e = sample_entity();
        e.location.end.index = 5;
        e.location.start.index = 100;
        assert!(validate_entity(&e).is_err());
    }

    #[test]
    fn test_validate_rejects_time_travel() {
        let mut e = sample_entity();
        e.updated_at = Timestamp::from_millis(e.created_at.millis() - 1);
        assert!(validate_entity(&e).is_err());
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(EntityPatch::default().is_empty());
        let patch = EntityPatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
