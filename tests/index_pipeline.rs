//! End-to-end indexing pipeline tests: parse:complete in, queryable
//! graph out.

use std::time::Duration;

use codegraph::{
    CodeGraph, Config, EntityId, ImportData, ImportSpecifier, ParseComplete, ParsedEntity,
    ParsedLocation, ParsedPos, ProvidedRelationship,
};
use tempfile::tempdir;

fn open_graph(dir: &tempfile::TempDir) -> CodeGraph {
    CodeGraph::open(dir.path().join("codegraph.db"), Config::default()).unwrap()
}

fn pos(line: u32, index: u64) -> ParsedPos {
    ParsedPos {
        line,
        column: 0,
        index,
    }
}

fn span(start_line: u32, start: u64, end_line: u32, end: u64) -> ParsedLocation {
    ParsedLocation {
        start: pos(start_line, start),
        end: pos(end_line, end),
    }
}

fn parsed(name: &str, entity_type: &str, location: ParsedLocation) -> ParsedEntity {
    ParsedEntity {
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        location,
        ..Default::default()
    }
}

/// The tiny graph from the seed scenario: functionA, ClassA containing
/// methodA, and a CALLS edge functionA → ClassA.
fn tiny_payload(replace_file: bool) -> ParseComplete {
    let function_a = parsed("functionA", "function", span(1, 0, 3, 50));
    let mut class_a = parsed("ClassA", "class", span(5, 100, 20, 400));
    class_a.children.push(parsed("methodA", "method", span(6, 150, 10, 250)));

    ParseComplete {
        file_path: "/a.ts".to_string(),
        language: "typescript".to_string(),
        entities: vec![function_a, class_a],
        relationships: vec![ProvidedRelationship {
            from: "functionA".to_string(),
            to: "ClassA".to_string(),
            rel_type: "CALLS".to_string(),
            target_file: None,
            metadata: None,
        }],
        content_hash: "hash-a-v1".to_string(),
        timestamp: 1_700_000_000_000,
        parse_time_ms: 4,
        from_cache: false,
        replace_file,
    }
}

fn id_function_a() -> EntityId {
    EntityId::from_parts("/a.ts", "function", "functionA", 0, 50)
}

fn id_class_a() -> EntityId {
    EntityId::from_parts("/a.ts", "class", "ClassA", 100, 400)
}

fn id_method_a() -> EntityId {
    EntityId::from_parts("/a.ts", "method", "methodA", 150, 250)
}

#[test]
fn index_and_query_tiny_graph() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    // Published on the bus, picked up by the indexer agent.
    graph.publish_parse_complete(&tiny_payload(false)).unwrap();

    // The bridge polls the bus, so indexing lands asynchronously; poll
    // for the row rather than racing the hand-off.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while graph.get_entity(&id_function_a()).unwrap().is_none() {
        assert!(
            std::time::Instant::now() < deadline,
            "indexer agent did not process the parse event in time"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(graph.wait_for_pipeline(Duration::from_secs(10)));

    let entity = graph.get_entity(&id_function_a()).unwrap().unwrap();
    assert_eq!(entity.name, "functionA");
    assert_eq!(entity.language.as_deref(), Some("typescript"));

    let related = graph.get_related_entities(&id_function_a(), 1).unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].id, id_class_a());

    // functionA → ClassA (CALLS) → methodA (CONTAINS): a 2-hop path.
    let path = graph
        .find_path(&id_function_a(), &id_method_a())
        .unwrap()
        .expect("path exists");
    assert_eq!(path.length, 2);
    assert_eq!(path.nodes.len(), 3);
    assert_eq!(path.nodes[1].id, id_class_a());

    graph.close();
}

#[test]
fn reindexing_is_idempotent() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    graph.index_file(&tiny_payload(true)).unwrap();
    let first = graph.metrics().unwrap();
    assert_eq!(first.total_entities, 3);

    graph.index_file(&tiny_payload(true)).unwrap();
    let second = graph.metrics().unwrap();
    assert_eq!(second.total_entities, 3, "no duplicate entities");
    assert_eq!(
        first.total_relationships, second.total_relationships,
        "no duplicate relationships"
    );

    graph.close();
}

#[test]
fn reindexing_preserves_entity_ids_and_created_at() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    graph.index_file(&tiny_payload(true)).unwrap();
    let before = graph.get_entity(&id_function_a()).unwrap().unwrap();

    std::thread::sleep(Duration::from_millis(10));
    graph.index_file(&tiny_payload(true)).unwrap();
    let after = graph.get_entity(&id_function_a()).unwrap().unwrap();

    assert_eq!(before.id, after.id);
    assert_eq!(before.created_at, after.created_at);
    assert!(after.updated_at >= before.updated_at);

    graph.close();
}

#[test]
fn imports_materialize_external_placeholders() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    let mut import = parsed("debounce", "import", span(1, 0, 1, 40));
    import.import_data = Some(ImportData {
        source: "lodash".to_string(),
        specifiers: vec![ImportSpecifier {
            local: "debounce".to_string(),
            imported: None,
        }],
    });
    let payload = ParseComplete {
        file_path: "/imports.ts".to_string(),
        language: "typescript".to_string(),
        entities: vec![import],
        relationships: vec![],
        content_hash: "h".to_string(),
        timestamp: 0,
        parse_time_ms: 1,
        from_cache: false,
        replace_file: false,
    };
    graph.index_file(&payload).unwrap();

    let import_id = EntityId::from_parts("/imports.ts", "import", "debounce", 0, 40);
    let rels = graph.get_relationships(&import_id, None).unwrap();
    assert_eq!(rels.len(), 1);

    // Both endpoints resolve; the target is the placeholder.
    let target = graph.get_entity(&rels[0].to_id).unwrap().unwrap();
    assert_eq!(target.file_path, "external://lodash");
    assert_eq!(target.metadata["isExternal"], serde_json::json!(true));

    graph.close();
}

#[test]
fn delete_file_data_leaves_no_dangling_edges() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    graph.index_file(&tiny_payload(false)).unwrap();
    graph
        .storage()
        .delete_file_data("/a.ts", &std::collections::HashSet::new())
        .unwrap();

    let remaining = graph
        .list_entities(&codegraph::EntityQuery {
            file_paths: vec!["/a.ts".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert!(remaining.is_empty());

    let metrics = graph.metrics().unwrap();
    assert_eq!(metrics.total_relationships, 0);

    graph.close();
}

#[test]
fn index_complete_event_published() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    let sub = graph.bus().subscribe("index:complete");
    graph.index_file(&tiny_payload(false)).unwrap();

    let entry = sub.receiver().recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(entry.data["filePath"], "/a.ts");
    assert_eq!(entry.data["entities"], serde_json::json!(3));

    graph.close();
}

#[test]
fn data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("codegraph.db");

    {
        let graph = CodeGraph::open(&path, Config::default()).unwrap();
        graph.index_file(&tiny_payload(false)).unwrap();
        graph.close();
    }

    let graph = CodeGraph::open(&path, Config::default()).unwrap();
    let entity = graph.get_entity(&id_function_a()).unwrap();
    assert!(entity.is_some(), "indexed data must survive a close/open cycle");
    graph.close();
}
