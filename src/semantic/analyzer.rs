//! Lightweight code analysis: metrics, classification, concept
//! extraction, clone detection, and refactoring hints.
//!
//! Everything here is regex-and-heuristic level by design — the heavy
//! lifting (parsing) happens outside this system, and these analyses
//! only need to be cheap and language-agnostic.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::EntityId;
use crate::vector::VectorStore;

/// A function body longer than this suggests a split.
const LONG_FUNCTION_LINES: usize = 50;
/// More branches than this suggests simplification.
const MAX_BRANCHES: usize = 10;
/// Similarity at or above this marks fragments as clone candidates.
pub const CLONE_SIMILARITY: f32 = 0.85;
/// Embeddings sampled from the store per clone-detection pass.
const CLONE_SAMPLE: usize = 200;
/// Neighbors fetched per sampled embedding.
const CLONE_NEIGHBORS: usize = 10;

static BRANCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(if|else if|elif|switch|case|match|catch)\b|&&|\|\|").expect("valid regex")
});
static LOOP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(for|while|loop)\b|\.forEach\(|\.map\(").expect("valid regex")
});
static FUNCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bfn\s+\w+|\bfunction\b|\bdef\s+\w+|=>").expect("valid regex")
});
static CLASS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(class|struct|interface|trait|enum)\s+\w+").expect("valid regex")
});
static TEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"#\[test\]|\bdescribe\(|\bit\(|\bassert|test_\w+").expect("valid regex")
});
static MODULE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(import|export|use|module|mod|package)\b").expect("valid regex")
});
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").expect("valid regex"));

/// Structural metrics for a code fragment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeMetrics {
    /// Non-blank lines.
    pub lines: usize,
    /// Branching constructs.
    pub branches: usize,
    /// Looping constructs.
    pub loops: usize,
    /// Function definitions.
    pub functions: usize,
    /// Type definitions.
    pub classes: usize,
    /// Weighted complexity score.
    pub complexity: f64,
}

/// Coarse classification of a fragment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    /// Predominantly a function definition.
    Function,
    /// Predominantly a type definition.
    Class,
    /// Imports/exports and wiring.
    Module,
    /// Test code.
    Test,
    /// Anything else.
    Utility,
}

/// A group of fragments judged to be clones of each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloneGroup {
    /// Entities in the group (≥ 2).
    pub members: Vec<EntityId>,
    /// Mean pairwise similarity observed while grouping.
    pub similarity: f32,
}

/// What a refactoring suggestion proposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Function exceeds the line threshold.
    SplitLongFunction,
    /// Branch count exceeds the threshold.
    ReduceBranching,
    /// Near-identical fragments should share one implementation.
    ExtractSharedCode,
}

/// One refactoring hint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefactoringSuggestion {
    /// Proposed action.
    pub kind: SuggestionKind,
    /// Human-readable rationale.
    pub reason: String,
}

/// Stateless code analyzer.
#[derive(Clone, Copy, Debug, Default)]
pub struct CodeAnalyzer;

impl CodeAnalyzer {
    /// Creates an analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Derives structural metrics from a fragment.
    ///
    /// Complexity is a weighted sum: branches count double, loops
    /// triple, type definitions double, plus a small size term.
    pub fn metrics(&self, code: &str) -> CodeMetrics {
        let lines = code.lines().filter(|l| !l.trim().is_empty()).count();
        let branches = BRANCH_RE.find_iter(code).count();
        let loops = LOOP_RE.find_iter(code).count();
        let functions = FUNCTION_RE.find_iter(code).count();
        let classes = CLASS_RE.find_iter(code).count();
        let complexity = branches as f64 * 2.0
            + loops as f64 * 3.0
            + functions as f64
            + classes as f64 * 2.0
            + lines as f64 / 10.0;
        CodeMetrics {
            lines,
            branches,
            loops,
            functions,
            classes,
            complexity,
        }
    }

    /// Classifies a fragment by its dominant construct.
    pub fn classify(&self, code: &str) -> FragmentKind {
        if TEST_RE.is_match(code) {
            return FragmentKind::Test;
        }
        if CLASS_RE.is_match(code) {
            return FragmentKind::Class;
        }
        if FUNCTION_RE.is_match(code) {
            return FragmentKind::Function;
        }
        if code.lines().any(|l| MODULE_RE.is_match(l)) {
            return FragmentKind::Module;
        }
        FragmentKind::Utility
    }

    /// Extracts salient identifiers as lowercase concept terms.
    ///
    /// CamelCase identifiers are split into words; duplicates collapse
    /// keeping first-seen order; at most 20 terms come back.
    pub fn extract_concepts(&self, code: &str) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut concepts = Vec::new();
        for ident in IDENTIFIER_RE.find_iter(code) {
            for word in split_identifier(ident.as_str()) {
                if word.len() < 3 || is_stopword(&word) {
                    continue;
                }
                if seen.insert(word.clone()) {
                    concepts.push(word);
                    if concepts.len() >= 20 {
                        return concepts;
                    }
                }
            }
        }
        concepts
    }

    /// Detects candidate clone groups by sampling the vector store.
    ///
    /// Each sampled embedding contributes similarity edges to neighbors
    /// at or above `min_similarity`; groups are the transitive closure
    /// of those edges. Only groups with two or more members survive.
    pub fn detect_clones(
        &self,
        store: &VectorStore,
        min_similarity: f32,
    ) -> Result<Vec<CloneGroup>> {
        let sample = store.sample(CLONE_SAMPLE)?;
        if sample.len() < 2 {
            return Ok(Vec::new());
        }

        // Union-find over entity ids.
        let mut parent: HashMap<EntityId, EntityId> = HashMap::new();
        let mut edge_sims: Vec<(EntityId, EntityId, f32)> = Vec::new();
        for embedding in &sample {
            parent
                .entry(embedding.entity_id.clone())
                .or_insert_with(|| embedding.entity_id.clone());
            for hit in store.search(&embedding.vector, CLONE_NEIGHBORS)? {
                if hit.entity_id == embedding.entity_id || hit.similarity < min_similarity {
                    continue;
                }
                parent
                    .entry(hit.entity_id.clone())
                    .or_insert_with(|| hit.entity_id.clone());
                edge_sims.push((embedding.entity_id.clone(), hit.entity_id.clone(), hit.similarity));
            }
        }

        for (a, b, _) in &edge_sims {
            union(&mut parent, a, b);
        }

        let mut groups: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        for id in parent.keys().cloned().collect::<Vec<_>>() {
            let root = find(&mut parent, &id);
            groups.entry(root).or_default().push(id);
        }
        let mut sims: HashMap<EntityId, (f32, u32)> = HashMap::new();
        for (a, _, sim) in &edge_sims {
            let root = find(&mut parent, a);
            let entry = sims.entry(root).or_insert((0.0, 0));
            entry.0 += sim;
            entry.1 += 1;
        }

        let mut out: Vec<CloneGroup> = groups
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(root, mut members)| {
                members.sort();
                let similarity = sims
                    .get(&root)
                    .map(|(total, n)| total / *n as f32)
                    .unwrap_or(min_similarity);
                CloneGroup {
                    members,
                    similarity,
                }
            })
            .collect();
        out.sort_by(|a, b| b.members.len().cmp(&a.members.len()));
        Ok(out)
    }

    /// Produces refactoring hints for one fragment.
    pub fn suggest_refactoring(&self, code: &str) -> Vec<RefactoringSuggestion> {
        let metrics = self.metrics(code);
        let mut suggestions = Vec::new();
        if metrics.lines > LONG_FUNCTION_LINES {
            suggestions.push(RefactoringSuggestion {
                kind: SuggestionKind::SplitLongFunction,
                reason: format!(
                    "fragment spans {} lines (threshold {LONG_FUNCTION_LINES})",
                    metrics.lines
                ),
            });
        }
        if metrics.branches > MAX_BRANCHES {
            suggestions.push(RefactoringSuggestion {
                kind: SuggestionKind::ReduceBranching,
                reason: format!(
                    "{} branching constructs (threshold {MAX_BRANCHES})",
                    metrics.branches
                ),
            });
        }
        suggestions
    }

    /// Turns clone groups into extract-shared-code suggestions.
    ///
    /// A group qualifies when at least two fragments sit at or above the
    /// clone similarity threshold.
    pub fn suggest_for_clones(&self, groups: &[CloneGroup]) -> Vec<RefactoringSuggestion> {
        groups
            .iter()
            .filter(|g| g.members.len() >= 2 && g.similarity >= CLONE_SIMILARITY)
            .map(|g| RefactoringSuggestion {
                kind: SuggestionKind::ExtractSharedCode,
                reason: format!(
                    "{} fragments share ~{:.0}% similarity",
                    g.members.len(),
                    g.similarity * 100.0
                ),
            })
            .collect()
    }
}

fn find(parent: &mut HashMap<EntityId, EntityId>, id: &EntityId) -> EntityId {
    let mut current = id.clone();
    loop {
        let p = parent.get(&current).cloned().unwrap_or_else(|| current.clone());
        if p == current {
            return current;
        }
        // Path halving
        let gp = parent.get(&p).cloned().unwrap_or_else(|| p.clone());
        parent.insert(current.clone(), gp.clone());
        current = p;
    }
}

fn union(parent: &mut HashMap<EntityId, EntityId>, a: &EntityId, b: &EntityId) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        parent.insert(ra, rb);
    }
}

/// Splits camelCase / snake_case identifiers into lowercase words.
fn split_identifier(ident: &str) -> Vec<String> {
    let mut words = Vec::new();
    for part in ident.split('_') {
        let mut current = String::new();
        for ch in part.chars() {
            if ch.is_uppercase() && !current.is_empty() {
                words.push(current.to_lowercase());
                current = String::new();
            }
            current.push(ch);
        }
        if !current.is_empty() {
            words.push(current.to_lowercase());
        }
    }
    words
}

fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the" | "and" | "for" | "let" | "var" | "const" | "this" | "self" | "new" | "return"
            | "function" | "async" | "await" | "pub" | "use" | "mod" | "impl" | "from"
            | "import" | "export" | "true" | "false" | "null" | "undefined"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HnswConfig, VectorConfig};
    use crate::vector::Embedding;

    const SAMPLE_FN: &str = r#"
function fetchUserProfile(userId) {
    if (!userId) {
        return null;
    }
    for (const attempt of retries) {
        if (attempt > 3 && lastError) {
            break;
        }
    }
    return cache.get(userId);
}
"#;

    #[test]
    fn test_metrics_counts() {
        let analyzer = CodeAnalyzer::new();
        let metrics = analyzer.metrics(SAMPLE_FN);
        assert!(metrics.lines >= 10);
        assert!(metrics.branches >= 2);
        assert!(metrics.loops >= 1);
        assert!(metrics.functions >= 1);
        assert!(metrics.complexity > 0.0);
    }

    #[test]
    fn test_classify() {
        let analyzer = CodeAnalyzer::new();
        assert_eq!(analyzer.classify(SAMPLE_FN), FragmentKind::Function);
        assert_eq!(
            analyzer.classify("class UserRepository { }"),
            FragmentKind::Class
        );
        assert_eq!(
            analyzer.classify("#[test]\nfn test_it() { assert!(true); }"),
            FragmentKind::Test
        );
        assert_eq!(
            analyzer.classify("import { api } from './api';"),
            FragmentKind::Module
        );
        assert_eq!(analyzer.classify("x + 1"), FragmentKind::Utility);
    }

    #[test]
    fn test_extract_concepts_splits_camel_case() {
        let analyzer = CodeAnalyzer::new();
        let concepts = analyzer.extract_concepts("function fetchUserProfile(userId) {}");
        assert!(concepts.contains(&"fetch".to_string()));
        assert!(concepts.contains(&"user".to_string()));
        assert!(concepts.contains(&"profile".to_string()));
        // Deduplicated: "user" appears once despite userId.
        assert_eq!(concepts.iter().filter(|c| *c == "user").count(), 1);
    }

    #[test]
    fn test_suggest_refactoring_thresholds() {
        let analyzer = CodeAnalyzer::new();
        assert!(analyzer.suggest_refactoring("fn tiny() {}").is_empty());

        let long_fn: String = (0..60).map(|i| format!("    line_{i}();\n")).collect();
        let suggestions = analyzer.suggest_refactoring(&long_fn);
        assert!(suggestions
            .iter()
            .any(|s| s.kind == SuggestionKind::SplitLongFunction));

        let branchy: String = (0..12).map(|i| format!("if x{i} {{ }}\n")).collect();
        let suggestions = analyzer.suggest_refactoring(&branchy);
        assert!(suggestions
            .iter()
            .any(|s| s.kind == SuggestionKind::ReduceBranching));
    }

    #[test]
    fn test_detect_clones_groups_similar_vectors() {
        let store = VectorStore::open_in_memory(
            &VectorConfig {
                dimension: 4,
                force_fallback: true,
                path: None,
            },
            &HnswConfig::default(),
        )
        .unwrap();

        let id = |n: &str| EntityId::from_parts("/c.ts", "function", n, 0, 10);
        let mk = |n: &str, v: Vec<f32>| Embedding::for_entity(id(n), n, v, "m");

        // a and b are near-identical; c is orthogonal.
        store.insert(&mk("a", vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        store.insert(&mk("b", vec![0.99, 0.01, 0.0, 0.0])).unwrap();
        store.insert(&mk("c", vec![0.0, 1.0, 0.0, 0.0])).unwrap();

        let analyzer = CodeAnalyzer::new();
        let groups = analyzer.detect_clones(&store, 0.95).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 2);
        let members: Vec<String> = groups[0].members.iter().map(|m| m.to_string()).collect();
        assert!(members.contains(&id("a").to_string()));
        assert!(members.contains(&id("b").to_string()));

        let suggestions = analyzer.suggest_for_clones(&groups);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].kind, SuggestionKind::ExtractSharedCode);
    }

    #[test]
    fn test_detect_clones_empty_store() {
        let store = VectorStore::open_in_memory(
            &VectorConfig {
                dimension: 4,
                ..Default::default()
            },
            &HnswConfig::default(),
        )
        .unwrap();
        let groups = CodeAnalyzer::new().detect_clones(&store, 0.9).unwrap();
        assert!(groups.is_empty());
    }
}
