//! Graph analysis tests: cycles, impact, ripple, subgraphs, hotspots.

use codegraph::{
    ChangeType, CodeGraph, Config, Entity, EntityChange, EntityId, EntityType, Relationship,
    RelationshipType, RiskLevel, SourceLocation, Timestamp,
};
use tempfile::tempdir;

fn open_graph(dir: &tempfile::TempDir) -> CodeGraph {
    CodeGraph::open(dir.path().join("codegraph.db"), Config::default()).unwrap()
}

fn entity(name: &str, start: u64) -> Entity {
    Entity::new(
        name,
        EntityType::Function,
        "/graph.ts",
        SourceLocation::from_span(1, start, 2, start + 10),
    )
}

/// Inserts entities e0..eN wired into a directed ring through CALLS.
fn ring(graph: &CodeGraph, n: usize) -> Vec<Entity> {
    let entities: Vec<Entity> = (0..n)
        .map(|i| entity(&format!("e{i}"), i as u64 * 100))
        .collect();
    graph.storage().insert_entities(&entities).unwrap();
    let edges: Vec<Relationship> = (0..n)
        .map(|i| {
            Relationship::new(
                entities[i].id.clone(),
                entities[(i + 1) % n].id.clone(),
                RelationshipType::Calls,
            )
        })
        .collect();
    graph.storage().insert_relationships(&edges).unwrap();
    entities
}

#[test]
fn detect_cycles_finds_five_ring() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 5);

    let cycles = graph.detect_cycles().unwrap();
    assert_eq!(cycles.len(), 1, "one deduplicated cycle");
    assert_eq!(cycles[0].entities.len(), 5);
    let members: std::collections::HashSet<&EntityId> = cycles[0].entities.iter().collect();
    for e in &entities {
        assert!(members.contains(&e.id), "cycle contains {}", e.name);
    }

    graph.close();
}

#[test]
fn cycle_detection_terminates_on_large_scc() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    // One strongly connected component of 120 entities; the depth caps
    // bound the search, so this only needs to come back at all.
    ring(&graph, 120);
    graph.detect_cycles().unwrap();
    graph.close();
}

#[test]
fn impact_analysis_on_ring() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 5);

    let impact = graph.get_impacted_entities(&entities[0].id).unwrap();
    // Direct impact: the one entity with an edge into e0 (e4).
    assert_eq!(impact.direct, vec![entities[4].id.clone()]);
    assert_eq!(impact.risk_level, RiskLevel::Low);

    graph.close();
}

#[test]
fn ripple_accumulates_weights() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 5);

    let changes = vec![
        EntityChange {
            entity_id: entities[0].id.clone(),
            change_type: ChangeType::Deleted,
            timestamp: Timestamp::now(),
        },
        EntityChange {
            entity_id: entities[2].id.clone(),
            change_type: ChangeType::Added,
            timestamp: Timestamp::now(),
        },
    ];
    let ripple = graph.calculate_change_ripple(&changes).unwrap();
    // Deleted: 1 direct * 3 + 1 indirect * 1.5 = 4.5
    // Added:   1 direct * 1 + 1 indirect * 0.5 = 1.5
    assert!((ripple.total_risk - 6.0).abs() < 1e-9);
    assert!(!ripple.impacted.is_empty());
    assert!(ripple.total_risk <= 100.0);

    graph.close();
}

#[test]
fn subgraph_depth_zero_is_just_root() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 3);

    let sub = graph.get_subgraph(&entities[0].id, 0).unwrap();
    assert_eq!(sub.entities.len(), 1);
    assert_eq!(sub.entities[0].id, entities[0].id);
    assert!(sub.relationships.is_empty());

    graph.close();
}

#[test]
fn subgraph_contains_root_and_reachable_entities() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 5);

    let sub = graph.get_subgraph(&entities[0].id, 2).unwrap();
    assert!(sub.entities.iter().any(|e| e.id == entities[0].id));
    // Depth 2 on an undirected view of the ring reaches e1, e2, e3, e4.
    assert_eq!(sub.entities.len(), 5);
    assert!(!sub.relationships.is_empty());

    graph.close();
}

#[test]
fn subgraph_missing_root_is_not_found() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let err = graph
        .get_subgraph(&EntityId::from_raw("missing00000"), 2)
        .unwrap_err();
    assert!(err.is_not_found());
    graph.close();
}

#[test]
fn hotspots_rank_hub_entities() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    let hub = entity("hub", 0);
    graph.storage().insert_entity(&hub).unwrap();
    for i in 0..8 {
        let caller = entity(&format!("caller{i}"), 1000 + i * 100);
        graph.storage().insert_entity(&caller).unwrap();
        graph
            .storage()
            .insert_relationship(&Relationship::new(
                caller.id.clone(),
                hub.id.clone(),
                RelationshipType::Calls,
            ))
            .unwrap();
    }

    let hotspots = graph.analyze_hotspots().unwrap();
    assert!(!hotspots.is_empty());
    assert_eq!(hotspots[0].entity_id, hub.id);
    assert_eq!(hotspots[0].incoming, 8);
    assert_eq!(hotspots[0].score, 16);
    assert_eq!(hotspots[0].change_frequency, 0);

    graph.close();
}

#[test]
fn dependency_tree_marks_circular_nodes() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);

    let a = entity("modA", 0);
    let b = entity("modB", 100);
    let c = entity("modC", 200);
    graph
        .storage()
        .insert_entities(&[a.clone(), b.clone(), c.clone()])
        .unwrap();
    graph
        .storage()
        .insert_relationships(&[
            Relationship::new(a.id.clone(), b.id.clone(), RelationshipType::DependsOn),
            Relationship::new(b.id.clone(), c.id.clone(), RelationshipType::DependsOn),
            Relationship::new(c.id.clone(), a.id.clone(), RelationshipType::DependsOn),
        ])
        .unwrap();

    let tree = graph.find_dependencies(&a.id).unwrap();
    assert_eq!(tree.root.entity_id, a.id);
    assert_eq!(tree.cycles.len(), 1);
    // Walk to the leaf: a → b → c → (a, circular).
    let b_node = &tree.root.children[0];
    let c_node = &b_node.children[0];
    assert!(c_node.children[0].circular);

    graph.close();
}

#[test]
fn related_entities_depth_bounds() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 4);

    assert!(graph.get_related_entities(&entities[0].id, 0).is_err());
    assert!(graph.get_related_entities(&entities[0].id, 11).is_err());

    let related = graph.get_related_entities(&entities[0].id, 1).unwrap();
    // Undirected neighbors of e0 in the 4-ring: e1 and e3.
    assert_eq!(related.len(), 2);

    graph.close();
}

#[test]
fn list_entities_limit_zero_returns_empty() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    ring(&graph, 3);

    let listed = graph
        .list_entities(&codegraph::EntityQuery {
            limit: Some(0),
            ..Default::default()
        })
        .unwrap();
    assert!(listed.is_empty());

    graph.close();
}

#[test]
fn relationship_endpoints_always_resolve() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    let entities = ring(&graph, 4);

    for e in &entities {
        for rel in graph.get_relationships(&e.id, None).unwrap() {
            assert!(graph.get_entity(&rel.from_id).unwrap().is_some());
            assert!(graph.get_entity(&rel.to_id).unwrap().is_some());
        }
    }

    graph.close();
}
