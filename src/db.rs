//! The `CodeGraph` engine handle: lifecycle, pipeline wiring, and the
//! tool-facing query interface.
//!
//! `CodeGraph::open()` assembles the whole engine: the process lock, the
//! pooled SQLite store (migrated to the current schema), the three-tier
//! query cache, the vector store, the embedding service, the query
//! processor, hybrid search, and the two pipeline agents (indexer and
//! semantic) bridged to the knowledge bus.
//!
//! # Thread Safety
//!
//! `CodeGraph` is `Send + Sync`; share it across threads with `Arc`.
//! A process-wide singleton accessor with single-flight construction is
//! provided for hosts that want exactly one engine per process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::cache::{cold::ColdCache, MultiLevelCache};
use crate::config::Config;
use crate::embedding::{EmbeddingService, ServiceInfo};
use crate::entity::Entity;
use crate::error::{Result, RuntimeError};
use crate::indexer::{IndexReport, Indexer, ParseComplete, SemanticPipeline};
use crate::query::{
    Cycle, DependencyTree, EntityChange, Hotspot, ImpactAnalysis, Path as GraphPath,
    QueryProcessor, RippleEffect,
};
use crate::relation::{Relationship, RelationshipType};
use crate::runtime::{
    topics, Agent, AgentCapabilities, AgentHandler, KnowledgeBus, TaskEnvelope,
};
use crate::search::{HybridHit, HybridOptions, HybridSearch};
use crate::semantic::{
    CloneGroup, CodeAnalyzer, RefactoringSuggestion, SemanticCache, SuggestionKind,
    CLONE_SIMILARITY,
};
use crate::storage::batch::BatchWriter;
use crate::storage::graph::{EntityQuery, GraphMetrics, GraphStorage, Subgraph};
use crate::storage::manager::{OpenOptions, ProcessLock, SqlManager};
use crate::storage::migrations::migrate;
use crate::storage::pool::ConnectionPool;
use crate::types::EntityId;
use crate::vector::{SearchFilters, SearchHit, VectorStats, VectorStore};

/// Grace period for outstanding pool handles at close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The engine handle.
pub struct CodeGraph {
    config: Config,
    _lock: Option<ProcessLock>,
    pool: Arc<ConnectionPool>,
    storage: Arc<GraphStorage>,
    batch: Arc<BatchWriter>,
    cache: Arc<MultiLevelCache>,
    processor: QueryProcessor,
    vector: Arc<VectorStore>,
    semantic_cache: Arc<SemanticCache>,
    embedding: Arc<EmbeddingService>,
    hybrid: HybridSearch,
    analyzer: CodeAnalyzer,
    bus: Arc<KnowledgeBus>,
    indexer: Arc<Indexer>,
    agents: Vec<Agent>,
    bridges: Mutex<Vec<std::thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeGraph")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CodeGraph {
    /// Opens or creates the engine at `path`.
    ///
    /// # Errors
    ///
    /// - configuration validation failures
    /// - `StorageError::Unavailable` when another process holds the lock
    /// - migration failures, including `SchemaDrift` (fatal by policy)
    #[instrument(skip(config), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening CodeGraph");
        let lock = ProcessLock::acquire(&path)?;

        let factory_path = path.clone();
        let pool = Arc::new(ConnectionPool::new(
            move || SqlManager::open(&factory_path, OpenOptions::default()),
            config.pool.clone(),
        )?);
        {
            let conn = pool.acquire()?;
            migrate(&conn)?;
        }

        let storage = Arc::new(GraphStorage::new(Arc::clone(&pool)));
        let batch = Arc::new(BatchWriter::new(Arc::clone(&pool), &config.batch));

        let cold_path = config
            .cache
            .cold_path
            .clone()
            .unwrap_or_else(|| sibling(&path, "query_cache.db"));
        let cold = match SqlManager::open(&cold_path, OpenOptions::default())
            .and_then(|m| ColdCache::new(m, config.cache.cold_ttl.as_millis() as i64))
        {
            Ok(cold) => Some(cold),
            Err(err) => {
                // Cache failures degrade silently; two tiers still work.
                warn!(error = %err, "Cold cache unavailable; running with in-memory tiers only");
                None
            }
        };
        let cache = Arc::new(MultiLevelCache::new(config.cache.clone(), cold));

        let vector_path = config
            .vector
            .path
            .clone()
            .unwrap_or_else(|| sibling(&path, "vectors.db"));
        let vector = Arc::new(VectorStore::open(
            &vector_path,
            &config.vector,
            &config.hnsw,
        )?);

        let semantic_cache = Arc::new(SemanticCache::new(config.semantic_cache.clone()));
        let embedding = Arc::new(EmbeddingService::new(
            &config.embedding,
            config.vector.dimension,
            config.http.clone(),
            Arc::clone(&semantic_cache),
        ));
        embedding.initialize();

        let processor = QueryProcessor::new(Arc::clone(&storage), Arc::clone(&cache));
        let hybrid = HybridSearch::new(
            Arc::clone(&storage),
            Arc::clone(&vector),
            Arc::clone(&embedding),
            Arc::clone(&semantic_cache),
        );

        let bus = Arc::new(KnowledgeBus::new());
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&storage),
            Arc::clone(&batch),
            Arc::clone(&cache),
            Arc::clone(&bus),
        ));
        let pipeline = Arc::new(SemanticPipeline::new(
            Arc::clone(&embedding),
            Arc::clone(&vector),
        ));

        let stop = Arc::new(AtomicBool::new(false));
        let indexer_agent = Agent::spawn(
            IndexerHandler {
                indexer: Arc::clone(&indexer),
            },
            AgentCapabilities::default(),
        );
        let semantic_agent = Agent::spawn(
            SemanticHandler { pipeline },
            AgentCapabilities::default(),
        );

        let mut bridges = Vec::new();
        bridges.push(bridge(
            Arc::clone(&bus),
            topics::PARSE_COMPLETE,
            &indexer_agent,
            Arc::clone(&stop),
        ));
        bridges.push(bridge(
            Arc::clone(&bus),
            topics::PARSE_BATCH_COMPLETE,
            &indexer_agent,
            Arc::clone(&stop),
        ));
        bridges.push(bridge(
            Arc::clone(&bus),
            topics::SEMANTIC_NEW_ENTITIES,
            &semantic_agent,
            Arc::clone(&stop),
        ));

        info!("CodeGraph opened");
        Ok(Self {
            config,
            _lock: Some(lock),
            pool,
            storage,
            batch,
            cache,
            processor,
            vector,
            semantic_cache,
            embedding,
            hybrid,
            analyzer: CodeAnalyzer::new(),
            bus,
            indexer,
            agents: vec![indexer_agent, semantic_agent],
            bridges: Mutex::new(bridges),
            stop,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The knowledge bus; external parsers publish `parse:complete`
    /// documents here.
    pub fn bus(&self) -> &Arc<KnowledgeBus> {
        &self.bus
    }

    /// Direct storage access for maintenance tooling.
    pub fn storage(&self) -> &Arc<GraphStorage> {
        &self.storage
    }

    /// The bulk writer (exposed for import tooling).
    pub fn batch_writer(&self) -> &Arc<BatchWriter> {
        &self.batch
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// Publishes a `parse:complete` document onto the bus; the indexer
    /// agent picks it up asynchronously.
    pub fn publish_parse_complete(&self, payload: &ParseComplete) -> Result<usize> {
        Ok(self
            .bus
            .publish(topics::PARSE_COMPLETE, serde_json::to_value(payload)?, "parser"))
    }

    /// Indexes a parsed file synchronously on the caller's thread.
    ///
    /// The semantic batch still flows through the bus to the semantic
    /// agent; use [`wait_for_pipeline`](Self::wait_for_pipeline) when a
    /// test or tool needs the embeddings to be queryable.
    pub fn index_file(&self, payload: &ParseComplete) -> Result<IndexReport> {
        self.indexer.index_file(payload)
    }

    /// Blocks until both pipeline agents are idle with empty queues, or
    /// the timeout elapses.
    ///
    /// Returns true when the pipeline drained.
    pub fn wait_for_pipeline(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self.agents.iter().any(|agent| {
                agent.queue_len() > 0
                    || agent.status() == crate::runtime::AgentStatus::Busy
            });
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // =========================================================================
    // Tool-facing query interface
    // =========================================================================

    /// Point lookup by id.
    pub fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        self.processor.get_entity(id)
    }

    /// Filtered entity listing.
    pub fn list_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        self.processor.list_entities(query)
    }

    /// Edges touching one entity.
    pub fn get_relationships(
        &self,
        entity_id: &EntityId,
        rel_type: Option<RelationshipType>,
    ) -> Result<Vec<Relationship>> {
        self.processor.get_relationships(entity_id, rel_type)
    }

    /// Entities reachable within `depth` hops (1..=10).
    pub fn get_related_entities(&self, entity_id: &EntityId, depth: u32) -> Result<Vec<Entity>> {
        self.processor.get_related_entities(entity_id, depth)
    }

    /// Shortest path between two entities.
    pub fn find_path(&self, from: &EntityId, to: &EntityId) -> Result<Option<GraphPath>> {
        self.processor.find_path(from, to)
    }

    /// Subgraph extraction (0..=5).
    pub fn get_subgraph(&self, root: &EntityId, depth: u32) -> Result<Subgraph> {
        self.processor.get_subgraph(root, depth)
    }

    /// Dependency tree over DEPENDS_ON edges.
    pub fn find_dependencies(&self, entity_id: &EntityId) -> Result<DependencyTree> {
        self.processor.find_dependencies(entity_id)
    }

    /// Whole-graph cycle detection.
    pub fn detect_cycles(&self) -> Result<Vec<Cycle>> {
        self.processor.detect_cycles()
    }

    /// Degree-ranked hotspots.
    pub fn analyze_hotspots(&self) -> Result<Vec<Hotspot>> {
        self.processor.analyze_hotspots()
    }

    /// Impact analysis for one entity.
    pub fn get_impacted_entities(&self, entity_id: &EntityId) -> Result<ImpactAnalysis> {
        self.processor.get_impacted_entities(entity_id)
    }

    /// Ripple effect over a change batch.
    pub fn calculate_change_ripple(&self, changes: &[EntityChange]) -> Result<RippleEffect> {
        self.processor.calculate_change_ripple(changes)
    }

    /// Semantic nearest-neighbor search over entity embeddings.
    pub fn semantic_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.hybrid.semantic_only(query, limit)
    }

    /// Embeds a text through the configured provider chain.
    ///
    /// Always returns a vector of the configured dimension; provider
    /// failures route to the deterministic fallback (visible in
    /// [`provider_info`](Self::provider_info)).
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        self.embedding.generate_embedding(text)
    }

    /// Finds stored code similar to a fragment.
    pub fn find_similar_code(&self, code: &str, threshold: f32) -> Result<Vec<SearchHit>> {
        let vector = self.embedding.generate_embedding(code)?;
        self.vector.search_with_filters(
            &vector,
            &SearchFilters {
                limit: 10,
                threshold: Some(threshold),
                ..Default::default()
            },
        )
    }

    /// Detects clone groups across the indexed corpus.
    pub fn detect_clones(&self, min_similarity: Option<f32>) -> Result<Vec<CloneGroup>> {
        self.analyzer
            .detect_clones(&self.vector, min_similarity.unwrap_or(CLONE_SIMILARITY))
    }

    /// Semantic search restricted to entities in the given languages.
    pub fn cross_language_search(
        &self,
        query: &str,
        languages: &[String],
    ) -> Result<Vec<SearchHit>> {
        let hits = self.hybrid.semantic_only(query, 50)?;
        if languages.is_empty() {
            return Ok(hits);
        }
        let wanted: HashSet<&str> = languages.iter().map(String::as_str).collect();
        let mut filtered = Vec::new();
        for hit in hits {
            if let Some(entity) = self.storage.get_entity(&hit.entity_id)? {
                if entity
                    .language
                    .as_deref()
                    .is_some_and(|lang| wanted.contains(lang))
                {
                    filtered.push(hit);
                }
            }
        }
        Ok(filtered)
    }

    /// Refactoring hints for a fragment, including shared-code
    /// extraction when near-identical indexed fragments exist.
    pub fn suggest_refactoring(&self, code: &str) -> Result<Vec<RefactoringSuggestion>> {
        let mut suggestions = self.analyzer.suggest_refactoring(code);
        let similar = self.find_similar_code(code, CLONE_SIMILARITY)?;
        if similar.len() >= 2 {
            suggestions.push(RefactoringSuggestion {
                kind: SuggestionKind::ExtractSharedCode,
                reason: format!(
                    "{} indexed fragments are at least {:.0}% similar to this code",
                    similar.len(),
                    CLONE_SIMILARITY * 100.0
                ),
            });
        }
        Ok(suggestions)
    }

    /// Hybrid (structural + semantic) search.
    pub fn hybrid_search(&self, query: &str, options: Option<HybridOptions>) -> Result<Vec<HybridHit>> {
        self.hybrid.search(query, &options.unwrap_or_default())
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Storage metrics with the cache hit rate filled in.
    pub fn metrics(&self) -> Result<GraphMetrics> {
        let mut metrics = self.storage.get_metrics()?;
        metrics.cache_hit_rate = self.cache.stats().hit_rate;
        Ok(metrics)
    }

    /// Query cache statistics.
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Vector store statistics.
    pub fn vector_stats(&self) -> Result<VectorStats> {
        self.vector.stats()
    }

    /// Embedding service description (provider + fallback state).
    pub fn provider_info(&self) -> ServiceInfo {
        self.embedding.info()
    }

    /// Clears the query and semantic caches.
    pub fn clear_caches(&self) {
        self.cache.clear();
        self.semantic_cache.clear();
    }

    /// Rebuilds the main database file.
    pub fn vacuum(&self) -> Result<()> {
        self.storage.vacuum()
    }

    /// Refreshes planner statistics.
    pub fn analyze(&self) -> Result<()> {
        self.storage.analyze()
    }

    /// Shuts the engine down: bridges, agents, providers, pool.
    ///
    /// Idempotent; also invoked by `Drop`.
    #[instrument(skip(self))]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing CodeGraph");

        self.stop.store(true, Ordering::Relaxed);
        for handle in self.bridges.lock().drain(..) {
            let _ = handle.join();
        }
        for agent in &self.agents {
            agent.shutdown();
        }
        self.embedding.close();
        self.pool.shutdown(SHUTDOWN_GRACE);
        info!("CodeGraph closed");
    }
}

impl Drop for CodeGraph {
    fn drop(&mut self) {
        self.close();
    }
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.parent()
        .map(|dir| dir.join(name))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Bridges one bus topic into an agent's queue.
///
/// `AgentBusy` rejections are the backpressure signal: the bridge sleeps
/// for the suggested delay and retries, which also stalls the bounded
/// bus queue behind it.
fn bridge(
    bus: Arc<KnowledgeBus>,
    topic: &'static str,
    agent: &Agent,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let subscription = bus.subscribe(topic);
    // The bridge only needs submit access; share the agent's queue via a
    // lightweight clone of its submit surface.
    let submitter = agent.submitter();
    std::thread::Builder::new()
        .name(format!("codegraph-bridge-{topic}"))
        .spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let entry = match subscription
                .receiver()
                .recv_timeout(Duration::from_millis(100))
            {
                Ok(entry) => entry,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            };

            let task = TaskEnvelope::new(topic, entry.data);
            loop {
                match submitter.submit(task.clone()) {
                    Ok(()) => break,
                    Err(crate::error::CodeGraphError::Runtime(RuntimeError::AgentBusy {
                        retry_after_ms,
                        ..
                    })) => {
                        // Backpressure: wait the suggested delay, retry.
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(retry_after_ms.clamp(10, 1000)));
                    }
                    Err(err) => {
                        warn!(topic, error = %err, "Bridge failed to submit task");
                        break;
                    }
                }
            }
        })
        .expect("spawn bridge thread")
}

struct IndexerHandler {
    indexer: Arc<Indexer>,
}

impl AgentHandler for IndexerHandler {
    fn agent_type(&self) -> &'static str {
        "indexer"
    }

    fn supported_tasks(&self) -> &[&'static str] {
        &[topics::PARSE_COMPLETE, topics::PARSE_BATCH_COMPLETE]
    }

    fn process(&mut self, task: TaskEnvelope) -> Result<Value> {
        let report = if task.task_type == topics::PARSE_BATCH_COMPLETE {
            self.indexer.handle_parse_batch(&task.payload)?
        } else {
            self.indexer.handle_parse_complete(&task.payload)?
        };
        Ok(serde_json::to_value(report)?)
    }
}

struct SemanticHandler {
    pipeline: Arc<SemanticPipeline>,
}

impl AgentHandler for SemanticHandler {
    fn agent_type(&self) -> &'static str {
        "semantic"
    }

    fn supported_tasks(&self) -> &[&'static str] {
        &[topics::SEMANTIC_NEW_ENTITIES]
    }

    fn process(&mut self, task: TaskEnvelope) -> Result<Value> {
        let written = self.pipeline.process(&task.payload)?;
        Ok(serde_json::json!({ "embedded": written }))
    }
}

// =============================================================================
// Process-wide singleton
// =============================================================================

static GLOBAL: OnceCell<Mutex<Option<Arc<CodeGraph>>>> = OnceCell::new();

/// Returns the process-wide engine, constructing it on first call.
///
/// Construction is single-flight: concurrent callers block on the slot
/// mutex and converge on one instance. Later calls ignore `path` and
/// `config` and return the existing engine.
pub fn global(path: impl AsRef<Path>, config: Config) -> Result<Arc<CodeGraph>> {
    let slot = GLOBAL.get_or_init(|| Mutex::new(None));
    let mut guard = slot.lock();
    if let Some(existing) = guard.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let graph = Arc::new(CodeGraph::open(path, config)?);
    *guard = Some(Arc::clone(&graph));
    Ok(graph)
}

/// Drops the process-wide engine (tests).
///
/// The engine closes when the last external `Arc` also drops.
pub fn reset_global() {
    if let Some(slot) = GLOBAL.get() {
        *slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_database_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codegraph.db");
        let graph = CodeGraph::open(&path, Config::default()).unwrap();
        assert!(path.exists());
        assert!(dir.path().join("vectors.db").exists());
        assert!(dir.path().join("query_cache.db").exists());
        graph.close();
    }

    #[test]
    fn test_second_process_lock_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codegraph.db");
        let graph = CodeGraph::open(&path, Config::default()).unwrap();
        let err = CodeGraph::open(&path, Config::default()).unwrap_err();
        assert!(err.is_storage());
        graph.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codegraph.db");
        let graph = CodeGraph::open(&path, Config::default()).unwrap();
        graph.close();
        graph.close();
    }

    #[test]
    fn test_codegraph_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CodeGraph>();
    }
}
