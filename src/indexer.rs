//! Indexing pipeline: turns parser output into graph rows and feeds the
//! semantic pipeline.
//!
//! The external parser publishes `parse:complete` documents on the
//! knowledge bus. The indexer flattens the parsed entity trees into
//! storage entities (children become CONTAINS edges, references become
//! REFERENCES edges, imports materialize `external://` placeholders),
//! deduplicates by stable id, optionally replaces the file's previous
//! data, batch-inserts entities before relationships, updates the file
//! record, clears the query cache, and publishes `index:complete` plus
//! `semantic:new_entities`.
//!
//! Ordering guarantees kept here: a replace deletes old rows before any
//! insert, so observers never see mixed generations for one file; and
//! entities land before the relationships that reference them, so
//! placeholders exist before the referring edges become visible.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cache::MultiLevelCache;
use crate::embedding::EmbeddingService;
use crate::entity::{Entity, EntityType, FileInfo, SourceLocation, SourcePos};
use crate::error::Result;
use crate::relation::{Relationship, RelationshipMetadata, RelationshipType};
use crate::runtime::{topics, KnowledgeBus};
use crate::storage::batch::BatchWriter;
use crate::storage::graph::GraphStorage;
use crate::types::{EntityId, Timestamp};
use crate::vector::{Embedding, VectorStore};

/// A position as the parser reports it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ParsedPos {
    /// 1-based line.
    pub line: u32,
    /// 0-based column.
    #[serde(default)]
    pub column: u32,
    /// Absolute byte offset.
    #[serde(default)]
    pub index: u64,
}

/// A span as the parser reports it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ParsedLocation {
    /// Span start.
    pub start: ParsedPos,
    /// Span end.
    pub end: ParsedPos,
}

impl From<ParsedLocation> for SourceLocation {
    fn from(loc: ParsedLocation) -> Self {
        SourceLocation {
            start: SourcePos {
                line: loc.start.line,
                column: loc.start.column,
                index: loc.start.index,
            },
            end: SourcePos {
                line: loc.end.line,
                column: loc.end.column,
                index: loc.end.index,
            },
        }
    }
}

/// One import specifier (`{ local, imported }`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSpecifier {
    /// Local binding name.
    pub local: String,
    /// Name in the source module, when renamed.
    #[serde(default)]
    pub imported: Option<String>,
}

/// Import payload attached to import entities.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportData {
    /// Module specifier (package name or relative path).
    pub source: String,
    /// Imported bindings.
    #[serde(default)]
    pub specifiers: Vec<ImportSpecifier>,
}

/// One parsed entity as received from the parser.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEntity {
    /// Symbol name.
    pub name: String,
    /// Entity type wire name (lowercase).
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Source span.
    #[serde(default)]
    pub location: ParsedLocation,
    /// Modifiers (`export`, `async`, ...).
    #[serde(default)]
    pub modifiers: Vec<String>,
    /// Declared return type, when present.
    #[serde(default)]
    pub return_type: Option<String>,
    /// Parameter descriptors.
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Nested entities (methods in a class, ...).
    #[serde(default)]
    pub children: Vec<ParsedEntity>,
    /// Names this entity references.
    #[serde(default)]
    pub references: Vec<String>,
    /// Import payload for import entities.
    #[serde(default)]
    pub import_data: Option<ImportData>,
}

/// A relationship the parser resolved itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidedRelationship {
    /// Source entity name.
    pub from: String,
    /// Target entity name.
    pub to: String,
    /// Relationship type wire name.
    #[serde(rename = "type")]
    pub rel_type: String,
    /// File the target lives in, when outside this file.
    #[serde(default)]
    pub target_file: Option<String>,
    /// Observation metadata.
    #[serde(default)]
    pub metadata: Option<RelationshipMetadata>,
}

/// The `parse:complete` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseComplete {
    /// Parsed file path.
    pub file_path: String,
    /// Source language.
    #[serde(default)]
    pub language: String,
    /// Top-level parsed entities.
    pub entities: Vec<ParsedEntity>,
    /// Parser-resolved relationships.
    #[serde(default)]
    pub relationships: Vec<ProvidedRelationship>,
    /// Hash of the file contents at parse time.
    #[serde(default)]
    pub content_hash: String,
    /// Parse completion time (ms since epoch).
    #[serde(default)]
    pub timestamp: i64,
    /// Parser wall-clock time.
    #[serde(default)]
    pub parse_time_ms: u64,
    /// Whether the parse came from a parser-side cache.
    #[serde(default)]
    pub from_cache: bool,
    /// Delete the file's previous rows before inserting.
    #[serde(default)]
    pub replace_file: bool,
}

/// Counts reported by one indexing pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    /// Entities written (placeholders included).
    pub entities: usize,
    /// Relationships written.
    pub relationships: usize,
    /// Wall-clock time.
    pub time_ms: u64,
}

/// Converts parse output into graph rows.
pub struct Indexer {
    storage: Arc<GraphStorage>,
    batch: Arc<BatchWriter>,
    cache: Arc<MultiLevelCache>,
    bus: Arc<KnowledgeBus>,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer").finish_non_exhaustive()
    }
}

impl Indexer {
    /// Creates the indexer over shared components.
    pub fn new(
        storage: Arc<GraphStorage>,
        batch: Arc<BatchWriter>,
        cache: Arc<MultiLevelCache>,
        bus: Arc<KnowledgeBus>,
    ) -> Self {
        Self {
            storage,
            batch,
            cache,
            bus,
        }
    }

    /// Indexes one parsed file.
    ///
    /// Re-running with identical input is idempotent: ids are
    /// content-addressed, so every write is an in-place upsert.
    #[instrument(skip(self, payload), fields(file = %payload.file_path))]
    pub fn index_file(&self, payload: &ParseComplete) -> Result<IndexReport> {
        let started = Instant::now();
        let converted = convert(payload);

        if payload.replace_file {
            // Preserve rows being rewritten so their created_at survives.
            let preserve: HashSet<EntityId> =
                converted.entities.iter().map(|e| e.id.clone()).collect();
            self.storage.delete_file_data(&payload.file_path, &preserve)?;
        }

        // Entities first, then edges: placeholders must exist before the
        // referring rows become visible.
        let entity_result = self.batch.insert_entities(&converted.entities)?;
        let rel_result = self.batch.insert_relationships(&converted.relationships)?;
        if entity_result.failed > 0 || rel_result.failed > 0 {
            warn!(
                entity_failures = entity_result.failed,
                relationship_failures = rel_result.failed,
                "Some rows failed during indexing"
            );
        }

        self.storage.upsert_file_info(&FileInfo {
            path: payload.file_path.clone(),
            hash: payload.content_hash.clone(),
            last_indexed: Timestamp::now(),
            entity_count: converted.file_entity_count as u64,
        })?;

        // Coarse invalidation: any mutation clears every cache tier.
        self.cache.clear();

        let report = IndexReport {
            entities: entity_result.processed,
            relationships: rel_result.processed,
            time_ms: started.elapsed().as_millis() as u64,
        };

        self.bus.publish(
            topics::INDEX_COMPLETE,
            serde_json::json!({
                "filePath": payload.file_path,
                "entities": report.entities,
                "relationships": report.relationships,
                "timeMs": report.time_ms,
            }),
            "indexer",
        );
        self.bus.publish(
            topics::SEMANTIC_NEW_ENTITIES,
            serde_json::to_value(&converted.semantic_batch)?,
            "indexer",
        );

        info!(
            entities = report.entities,
            relationships = report.relationships,
            time_ms = report.time_ms,
            "File indexed"
        );
        Ok(report)
    }

    /// Handles a raw bus entry (used by the indexer agent).
    pub fn handle_parse_complete(&self, data: &Value) -> Result<IndexReport> {
        let payload: ParseComplete = serde_json::from_value(data.clone())?;
        self.index_file(&payload)
    }

    /// Handles a `parse:batch:complete` entry: an array of
    /// `parse:complete` documents indexed in arrival order.
    pub fn handle_parse_batch(&self, data: &Value) -> Result<IndexReport> {
        let payloads: Vec<ParseComplete> = serde_json::from_value(data.clone())?;
        let mut total = IndexReport::default();
        for payload in &payloads {
            let report = self.index_file(payload)?;
            total.entities += report.entities;
            total.relationships += report.relationships;
            total.time_ms += report.time_ms;
        }
        Ok(total)
    }
}

/// One entity queued for embedding.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticEntity {
    /// Target entity id.
    pub entity_id: EntityId,
    /// Owning file (stamped for downstream filtering).
    pub file_path: String,
    /// Text to embed.
    pub content: String,
}

struct Converted {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
    semantic_batch: Vec<SemanticEntity>,
    /// Entities belonging to the file itself (placeholders excluded).
    file_entity_count: usize,
}

/// Flattens a `parse:complete` document into rows.
fn convert(payload: &ParseComplete) -> Converted {
    let mut entities: HashMap<EntityId, Entity> = HashMap::new();
    let mut relationships: HashMap<crate::types::RelationshipId, Relationship> = HashMap::new();
    let mut name_index: HashMap<String, EntityId> = HashMap::new();
    let mut semantic_batch = Vec::new();

    // Pass 1: entities, containment, imports.
    for parsed in &payload.entities {
        flatten(
            parsed,
            None,
            payload,
            &mut entities,
            &mut relationships,
            &mut name_index,
            &mut semantic_batch,
        );
    }
    let file_entity_count = entities.values().filter(|e| !e.is_external()).count();

    // Pass 2: intra-file references, now that every name is known.
    collect_references(&payload.entities, payload, &name_index, &mut relationships);

    // Pass 3: parser-resolved relationships.
    for provided in &payload.relationships {
        let Some(rel_type) = RelationshipType::parse(&provided.rel_type) else {
            debug!(rel_type = %provided.rel_type, "Skipping unknown relationship type");
            continue;
        };
        let Some(from_id) = name_index.get(&provided.from) else {
            continue;
        };
        let to_id = match name_index.get(&provided.to) {
            Some(id) => id.clone(),
            None => {
                // Target lives elsewhere: materialize a placeholder.
                let source = provided
                    .target_file
                    .clone()
                    .unwrap_or_else(|| "unresolved".to_string());
                let placeholder = Entity::external_placeholder(&source, &provided.to);
                let id = placeholder.id.clone();
                entities.entry(id.clone()).or_insert(placeholder);
                id
            }
        };
        let mut rel = Relationship::new(from_id.clone(), to_id, rel_type);
        if let Some(metadata) = &provided.metadata {
            rel = rel.with_metadata(metadata.clone());
        }
        relationships.entry(rel.id.clone()).or_insert(rel);
    }

    Converted {
        entities: entities.into_values().collect(),
        relationships: relationships.into_values().collect(),
        semantic_batch,
        file_entity_count,
    }
}

#[allow(clippy::too_many_arguments)]
fn flatten(
    parsed: &ParsedEntity,
    parent: Option<&EntityId>,
    payload: &ParseComplete,
    entities: &mut HashMap<EntityId, Entity>,
    relationships: &mut HashMap<crate::types::RelationshipId, Relationship>,
    name_index: &mut HashMap<String, EntityId>,
    semantic_batch: &mut Vec<SemanticEntity>,
) {
    let Some(entity_type) = EntityType::parse(&parsed.entity_type) else {
        warn!(entity_type = %parsed.entity_type, name = %parsed.name, "Skipping unknown entity type");
        return;
    };

    let mut metadata = serde_json::Map::new();
    if !parsed.modifiers.is_empty() {
        metadata.insert("modifiers".to_string(), serde_json::json!(parsed.modifiers));
    }
    if let Some(return_type) = &parsed.return_type {
        metadata.insert("returnType".to_string(), serde_json::json!(return_type));
    }
    if !parsed.parameters.is_empty() {
        metadata.insert("parameters".to_string(), Value::Array(parsed.parameters.clone()));
    }
    if !payload.language.is_empty() {
        metadata.insert("language".to_string(), serde_json::json!(payload.language));
    }

    let mut entity = Entity::new(
        parsed.name.clone(),
        entity_type,
        payload.file_path.clone(),
        parsed.location.into(),
    )
    .with_metadata(Value::Object(metadata))
    .with_hash(payload.content_hash.clone());
    if !payload.language.is_empty() {
        entity.language = Some(payload.language.clone());
    }
    entity.size_bytes = Some(
        parsed
            .location
            .end
            .index
            .saturating_sub(parsed.location.start.index),
    );

    let id = entity.id.clone();
    name_index.entry(parsed.name.clone()).or_insert_with(|| id.clone());

    semantic_batch.push(SemanticEntity {
        entity_id: id.clone(),
        file_path: payload.file_path.clone(),
        content: embed_text(parsed, payload),
    });

    entities.insert(id.clone(), entity);

    if let Some(parent_id) = parent {
        let rel = Relationship::new(parent_id.clone(), id.clone(), RelationshipType::Contains);
        relationships.entry(rel.id.clone()).or_insert(rel);
    }

    // Imports materialize placeholders immediately so the IMPORTS edge
    // always has a stored target.
    if let Some(import) = &parsed.import_data {
        if import.specifiers.is_empty() {
            add_import_edge(&id, &import.source, &parsed.name, entities, relationships);
        }
        for spec in &import.specifiers {
            let symbol = spec.imported.as_deref().unwrap_or(&spec.local);
            add_import_edge(&id, &import.source, symbol, entities, relationships);
        }
    }

    for child in &parsed.children {
        flatten(
            child,
            Some(&id),
            payload,
            entities,
            relationships,
            name_index,
            semantic_batch,
        );
    }
}

fn add_import_edge(
    from: &EntityId,
    source: &str,
    symbol: &str,
    entities: &mut HashMap<EntityId, Entity>,
    relationships: &mut HashMap<crate::types::RelationshipId, Relationship>,
) {
    let placeholder = Entity::external_placeholder(source, symbol);
    let to_id = placeholder.id.clone();
    entities.entry(to_id.clone()).or_insert(placeholder);
    let rel = Relationship::new(from.clone(), to_id, RelationshipType::Imports);
    relationships.entry(rel.id.clone()).or_insert(rel);
}

fn collect_references(
    parsed: &[ParsedEntity],
    payload: &ParseComplete,
    name_index: &HashMap<String, EntityId>,
    relationships: &mut HashMap<crate::types::RelationshipId, Relationship>,
) {
    for entity in parsed {
        if let Some(from_id) = name_index.get(&entity.name) {
            for reference in &entity.references {
                // Only same-file names resolve here; cross-file targets
                // arrive via provided relationships.
                let Some(to_id) = name_index.get(reference) else {
                    continue;
                };
                let rel = Relationship::new(
                    from_id.clone(),
                    to_id.clone(),
                    RelationshipType::References,
                );
                relationships.entry(rel.id.clone()).or_insert(rel);
            }
        }
        collect_references(&entity.children, payload, name_index, relationships);
    }
}

/// Builds the text fed to the embedding provider for one entity.
fn embed_text(parsed: &ParsedEntity, payload: &ParseComplete) -> String {
    let mut text = format!("{} {}", parsed.entity_type, parsed.name);
    if let Some(return_type) = &parsed.return_type {
        text.push_str(&format!(" -> {return_type}"));
    }
    if !payload.language.is_empty() {
        text.push_str(&format!(" [{}]", payload.language));
    }
    text.push_str(&format!(" in {}", payload.file_path));
    text
}

/// Embeds newly indexed entities and writes them to the vector store.
pub struct SemanticPipeline {
    embedding: Arc<EmbeddingService>,
    vector: Arc<VectorStore>,
}

impl std::fmt::Debug for SemanticPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticPipeline").finish_non_exhaustive()
    }
}

impl SemanticPipeline {
    /// Creates the pipeline over shared components.
    pub fn new(embedding: Arc<EmbeddingService>, vector: Arc<VectorStore>) -> Self {
        Self { embedding, vector }
    }

    /// Embeds one `semantic:new_entities` batch.
    #[instrument(skip(self, data))]
    pub fn process(&self, data: &Value) -> Result<usize> {
        let batch: Vec<SemanticEntity> = serde_json::from_value(data.clone())?;
        if batch.is_empty() {
            return Ok(0);
        }

        let texts: Vec<&str> = batch.iter().map(|e| e.content.as_str()).collect();
        let vectors = self.embedding.generate_embeddings(&texts)?;
        let model = self.embedding.active_model();

        let embeddings: Vec<Embedding> = batch
            .iter()
            .zip(vectors)
            .map(|(entity, vector)| {
                Embedding::for_entity(
                    entity.entity_id.clone(),
                    entity.content.clone(),
                    vector,
                    model.clone(),
                )
            })
            .collect();
        let written = self.vector.insert_batch(&embeddings)?;
        debug!(written, "Semantic batch embedded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(name: &str, entity_type: &str, start: u64, end: u64) -> ParsedEntity {
        ParsedEntity {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            location: ParsedLocation {
                start: ParsedPos {
                    line: 1,
                    column: 0,
                    index: start,
                },
                end: ParsedPos {
                    line: 2,
                    column: 0,
                    index: end,
                },
            },
            ..Default::default()
        }
    }

    fn payload(entities: Vec<ParsedEntity>) -> ParseComplete {
        ParseComplete {
            file_path: "/a.ts".to_string(),
            language: "typescript".to_string(),
            entities,
            relationships: Vec::new(),
            content_hash: "hash1".to_string(),
            timestamp: 0,
            parse_time_ms: 1,
            from_cache: false,
            replace_file: false,
        }
    }

    #[test]
    fn test_convert_flattens_children_to_contains() {
        let mut class = parsed("ClassA", "class", 100, 400);
        class.children.push(parsed("methodA", "method", 150, 300));
        let converted = convert(&payload(vec![class]));

        assert_eq!(converted.entities.len(), 2);
        assert_eq!(converted.relationships.len(), 1);
        let rel = &converted.relationships[0];
        assert_eq!(rel.rel_type, RelationshipType::Contains);
    }

    #[test]
    fn test_convert_resolves_same_file_references() {
        let mut caller = parsed("caller", "function", 0, 50);
        caller.references.push("callee".to_string());
        let callee = parsed("callee", "function", 100, 150);
        let converted = convert(&payload(vec![caller, callee]));

        assert!(converted
            .relationships
            .iter()
            .any(|r| r.rel_type == RelationshipType::References));
    }

    #[test]
    fn test_convert_ignores_unresolved_references() {
        let mut caller = parsed("caller", "function", 0, 50);
        caller.references.push("phantom".to_string());
        let converted = convert(&payload(vec![caller]));
        assert!(converted.relationships.is_empty());
    }

    #[test]
    fn test_convert_materializes_import_placeholders() {
        let mut import = parsed("debounce", "import", 0, 30);
        import.import_data = Some(ImportData {
            source: "lodash".to_string(),
            specifiers: vec![ImportSpecifier {
                local: "debounce".to_string(),
                imported: None,
            }],
        });
        let converted = convert(&payload(vec![import]));

        let placeholder = converted
            .entities
            .iter()
            .find(|e| e.is_external())
            .expect("placeholder created");
        assert_eq!(placeholder.file_path, "external://lodash");
        assert!(converted
            .relationships
            .iter()
            .any(|r| r.rel_type == RelationshipType::Imports && r.to_id == placeholder.id));
        // Placeholders are not counted as file entities.
        assert_eq!(converted.file_entity_count, 1);
    }

    #[test]
    fn test_convert_provided_relationship_with_external_target() {
        let func = parsed("handler", "function", 0, 50);
        let mut doc = payload(vec![func]);
        doc.relationships.push(ProvidedRelationship {
            from: "handler".to_string(),
            to: "express.Router".to_string(),
            rel_type: "CALLS".to_string(),
            target_file: Some("express".to_string()),
            metadata: None,
        });
        let converted = convert(&doc);

        assert!(converted.entities.iter().any(|e| e.is_external()));
        assert!(converted
            .relationships
            .iter()
            .any(|r| r.rel_type == RelationshipType::Calls));
    }

    #[test]
    fn test_convert_skips_unknown_types() {
        let converted = convert(&payload(vec![parsed("weird", "widget", 0, 10)]));
        assert!(converted.entities.is_empty());
    }

    #[test]
    fn test_convert_is_deterministic() {
        let mut class = parsed("ClassA", "class", 100, 400);
        class.children.push(parsed("methodA", "method", 150, 300));
        let a = convert(&payload(vec![class.clone()]));
        let b = convert(&payload(vec![class]));

        let mut ids_a: Vec<String> = a.entities.iter().map(|e| e.id.to_string()).collect();
        let mut ids_b: Vec<String> = b.entities.iter().map(|e| e.id.to_string()).collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_embed_text_shape() {
        let mut func = parsed("fetchUser", "function", 0, 10);
        func.return_type = Some("Promise<User>".to_string());
        let text = embed_text(&func, &payload(vec![]));
        assert!(text.contains("function fetchUser"));
        assert!(text.contains("Promise<User>"));
        assert!(text.contains("/a.ts"));
    }
}
