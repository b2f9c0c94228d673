//! Hybrid search: Reciprocal Rank Fusion of structural and semantic
//! result lists.
//!
//! The structural leg runs FTS over entity names/paths/metadata plus an
//! exact-name lookup; the semantic leg embeds the query and asks the
//! vector store for nearest neighbors. Each source contributes
//! `weight / (k + rank + 1)` per document; fused scores are normalized
//! to `[0, 1]`, deduplicated by entity id, and tagged with the source
//! that produced them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::semantic::SemanticCache;
use crate::storage::graph::{EntityQuery, GraphStorage, NameFilter};
use crate::types::EntityId;
use crate::vector::{SearchHit, VectorStore};

/// Fusion parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HybridOptions {
    /// RRF rank constant.
    pub k: u32,
    /// Weight of the structural list.
    pub structural_weight: f64,
    /// Weight of the semantic list.
    pub semantic_weight: f64,
    /// Maximum fused results.
    pub limit: usize,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            k: 60,
            structural_weight: 0.6,
            semantic_weight: 0.4,
            limit: 10,
        }
    }
}

/// Which source(s) surfaced a fused hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    /// Only the structural list.
    Structural,
    /// Only the semantic list.
    Semantic,
    /// Both lists.
    Hybrid,
}

/// One fused search result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HybridHit {
    /// Matching entity.
    pub entity_id: EntityId,
    /// Fused score, normalized to `[0, 1]`.
    pub score: f64,
    /// Which source(s) produced the hit.
    pub source: HitSource,
}

/// Fuses structural and semantic lookups.
pub struct HybridSearch {
    storage: Arc<GraphStorage>,
    vector: Arc<VectorStore>,
    embedding: Arc<EmbeddingService>,
    cache: Arc<SemanticCache>,
}

impl std::fmt::Debug for HybridSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridSearch").finish_non_exhaustive()
    }
}

impl HybridSearch {
    /// Creates the fused searcher over shared components.
    pub fn new(
        storage: Arc<GraphStorage>,
        vector: Arc<VectorStore>,
        embedding: Arc<EmbeddingService>,
        cache: Arc<SemanticCache>,
    ) -> Self {
        Self {
            storage,
            vector,
            embedding,
            cache,
        }
    }

    /// Runs both legs and fuses via RRF.
    ///
    /// Either leg may come back empty (e.g. nothing indexed yet, or the
    /// vector store is empty); the other leg then fully determines the
    /// result and every hit is tagged with that single source.
    #[instrument(skip(self), fields(query))]
    pub fn search(&self, query: &str, options: &HybridOptions) -> Result<Vec<HybridHit>> {
        if query.trim().is_empty() || options.limit == 0 {
            return Ok(Vec::new());
        }
        // Over-fetch both legs so fusion has real candidates to rank.
        let fetch = options.limit.saturating_mul(3).max(options.limit);

        let structural = self.structural_leg(query, fetch)?;
        let semantic = self.semantic_leg(query, fetch)?;
        debug!(
            structural = structural.len(),
            semantic = semantic.len(),
            "Hybrid legs collected"
        );

        Ok(fuse(&structural, &semantic, options))
    }

    /// Semantic-only search used by the `semantic_search` tool surface.
    pub fn semantic_only(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let cache_key = search_cache_key("semantic", query, limit);
        if let Some(hits) = self.cache.get_search(&cache_key) {
            return Ok(hits);
        }
        let vector = self.embedding.generate_embedding(query)?;
        let hits = self.vector.search(&vector, limit)?;
        self.cache.put_search(cache_key, hits.clone());
        Ok(hits)
    }

    fn structural_leg(&self, query: &str, fetch: usize) -> Result<Vec<EntityId>> {
        let mut ids: Vec<EntityId> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        // Exact name matches rank first.
        for entity in self.storage.find_entities(&EntityQuery {
            name: Some(NameFilter::Exact(query.to_string())),
            limit: Some(fetch),
            ..Default::default()
        })? {
            if seen.insert(entity.id.clone()) {
                ids.push(entity.id);
            }
        }

        for entity in self.storage.search_entities_text(query, fetch)? {
            if seen.insert(entity.id.clone()) {
                ids.push(entity.id);
            }
        }
        ids.truncate(fetch);
        Ok(ids)
    }

    fn semantic_leg(&self, query: &str, fetch: usize) -> Result<Vec<EntityId>> {
        let hits = self.semantic_only(query, fetch)?;
        let mut ids = Vec::with_capacity(hits.len());
        let mut seen = std::collections::HashSet::new();
        for hit in hits {
            if seen.insert(hit.entity_id.clone()) {
                ids.push(hit.entity_id);
            }
        }
        Ok(ids)
    }
}

/// Reciprocal Rank Fusion over two ranked id lists.
fn fuse(structural: &[EntityId], semantic: &[EntityId], options: &HybridOptions) -> Vec<HybridHit> {
    #[derive(Default)]
    struct Accum {
        score: f64,
        structural: bool,
        semantic: bool,
    }

    let mut accum: HashMap<EntityId, Accum> = HashMap::new();
    for (rank, id) in structural.iter().enumerate() {
        let entry = accum.entry(id.clone()).or_default();
        entry.score += options.structural_weight / (options.k as f64 + rank as f64 + 1.0);
        entry.structural = true;
    }
    for (rank, id) in semantic.iter().enumerate() {
        let entry = accum.entry(id.clone()).or_default();
        entry.score += options.semantic_weight / (options.k as f64 + rank as f64 + 1.0);
        entry.semantic = true;
    }

    let max_score = accum
        .values()
        .map(|a| a.score)
        .fold(0.0f64, f64::max);

    let mut hits: Vec<HybridHit> = accum
        .into_iter()
        .map(|(entity_id, a)| HybridHit {
            entity_id,
            score: if max_score > 0.0 { a.score / max_score } else { 0.0 },
            source: match (a.structural, a.semantic) {
                (true, true) => HitSource::Hybrid,
                (true, false) => HitSource::Structural,
                (false, _) => HitSource::Semantic,
            },
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    hits.truncate(options.limit);
    hits
}

fn search_cache_key(prefix: &str, query: &str, limit: usize) -> String {
    let digest = Sha256::digest(query.as_bytes());
    format!("{prefix}|{limit}|{}", hex::encode(digest))
}
