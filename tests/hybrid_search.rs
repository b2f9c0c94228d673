//! Hybrid search integration: fusion, source tagging, and the
//! semantic-only degradation path.

use std::time::Duration;

use codegraph::{CodeGraph, Config, HitSource, ParseComplete, ParsedEntity, ParsedLocation, ParsedPos};
use tempfile::tempdir;

fn open_graph(dir: &tempfile::TempDir) -> CodeGraph {
    CodeGraph::open(dir.path().join("codegraph.db"), Config::default()).unwrap()
}

fn parsed(name: &str, entity_type: &str, start: u64) -> ParsedEntity {
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
                line: 3,
                column: 0,
                index: start + 80,
            },
        },
        ..Default::default()
    }
}

fn index_corpus(graph: &CodeGraph) {
    let payload = ParseComplete {
        file_path: "/api/client.ts".to_string(),
        language: "typescript".to_string(),
        entities: vec![
            parsed("debounceApiRequests", "function", 0),
            parsed("retryWithBackoff", "function", 200),
            parsed("renderChart", "function", 400),
        ],
        relationships: vec![],
        content_hash: "h1".to_string(),
        timestamp: 0,
        parse_time_ms: 1,
        from_cache: false,
        replace_file: false,
    };
    graph.index_file(&payload).unwrap();
    assert!(graph.wait_for_pipeline(Duration::from_secs(10)));
}

#[test]
fn semantic_results_only_when_structural_finds_nothing() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    index_corpus(&graph);

    // No entity name or metadata token matches these query words, so the
    // structural leg comes back empty and the fused list is purely
    // semantic.
    let hits = graph.hybrid_search("zzqx unmatchable quux", None).unwrap();
    assert!(hits.len() <= 10);
    for hit in &hits {
        assert_eq!(hit.source, HitSource::Semantic);
        assert!((0.0..=1.0).contains(&hit.score));
    }
    assert!(!hits.is_empty(), "semantic leg still returns neighbors");

    graph.close();
}

#[test]
fn exact_name_match_is_tagged_structural_or_hybrid() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    index_corpus(&graph);

    let hits = graph.hybrid_search("debounceApiRequests", None).unwrap();
    assert!(!hits.is_empty());
    let top = &hits[0];
    assert!(
        top.source == HitSource::Structural || top.source == HitSource::Hybrid,
        "exact-name query must surface the structural match first"
    );

    graph.close();
}

#[test]
fn fused_scores_sorted_descending_and_deduplicated() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    index_corpus(&graph);

    let hits = graph.hybrid_search("retryWithBackoff", None).unwrap();
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    let unique: std::collections::HashSet<_> = hits.iter().map(|h| h.entity_id.clone()).collect();
    assert_eq!(unique.len(), hits.len());

    graph.close();
}

#[test]
fn semantic_search_respects_limit() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    index_corpus(&graph);

    let hits = graph.semantic_search("http retry logic", 2).unwrap();
    assert!(hits.len() <= 2);
    for hit in &hits {
        assert!((0.0..=1.0).contains(&hit.similarity));
    }

    graph.close();
}

#[test]
fn empty_query_returns_nothing() {
    let dir = tempdir().unwrap();
    let graph = open_graph(&dir);
    index_corpus(&graph);

    assert!(graph.hybrid_search("   ", None).unwrap().is_empty());

    graph.close();
}
