//! # codegraph
//!
//! Embedded code intelligence engine: ingest parsed source-code records,
//! persist a graph of code entities and relationships in SQLite, augment
//! them with dense vector embeddings, and serve structural, semantic,
//! and hybrid queries on commodity hardware.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use codegraph::{CodeGraph, Config};
//!
//! // Open or create an engine
//! let graph = CodeGraph::open("./codegraph.db", Config::default())?;
//!
//! // Feed it parser output (usually published on the knowledge bus)
//! graph.index_file(&parse_complete)?;
//!
//! // Query the graph
//! let entity = graph.get_entity(&id)?;
//! let related = graph.get_related_entities(&id, 2)?;
//! let hits = graph.hybrid_search("debounce api requests", None)?;
//!
//! // Clean up
//! graph.close();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! parse:complete ──► Indexer ──► GraphStorage (pooled SQLite, WAL)
//!       │               │               │
//!       ▼               ▼               ▼
//!  KnowledgeBus   index:complete   MultiLevelCache (hot/warm/cold)
//!       │                               ▲
//!       ▼                               │
//! semantic:new_entities ──► SemanticPipeline ──► VectorStore (HNSW)
//!                                               ▲
//!                    QueryProcessor ────────────┘
//! ```
//!
//! SQLite rows are the source of truth; the HNSW index and every cache
//! tier are derived, rebuildable structures.
//!
//! ## Thread Safety
//!
//! [`CodeGraph`] is `Send + Sync`; share it across threads with `Arc`.
//! One process owns the database files (enforced with an advisory lock);
//! within the process, writers serialize through the connection pool
//! while WAL mode lets readers proceed.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod db;
mod entity;
mod error;
mod relation;
mod types;

pub mod cache;
pub mod embedding;
pub mod indexer;
pub mod query;
pub mod runtime;
pub mod search;
pub mod semantic;
pub mod storage;
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main engine interface
pub use db::{global, reset_global, CodeGraph};

// Configuration
pub use config::{
    BatchConfig, CacheConfig, Config, EmbeddingConfig, HnswConfig, HttpEngineConfig, PoolConfig,
    SemanticCacheConfig, VectorConfig,
};

// Error handling
pub use error::{
    CodeGraphError, PoolError, ProviderError, Result, RuntimeError, StorageError, ValidationError,
};

// Core types
pub use types::{external_placeholder_id, EntityId, RelationshipId, Timestamp};

// Domain types
pub use entity::{Entity, EntityPatch, EntityType, FileInfo, SourceLocation, SourcePos};
pub use relation::{Relationship, RelationshipMetadata, RelationshipType};

// Query surface
pub use query::{
    ChangeType, Cycle, DependencyNode, DependencyTree, EntityChange, Hotspot, ImpactAnalysis,
    Path, QueryDescriptor, RippleEffect, RiskLevel,
};
pub use search::{HitSource, HybridHit, HybridOptions};
pub use storage::{BatchResult, EntityQuery, GraphMetrics, NameFilter, RelationshipQuery, Subgraph};
pub use vector::{Embedding, SearchHit, SearchMode, VectorStats};

// Pipeline input contracts
pub use indexer::{
    ImportData, ImportSpecifier, IndexReport, ParseComplete, ParsedEntity, ParsedLocation,
    ParsedPos, ProvidedRelationship,
};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common codegraph usage.
///
/// ```rust
/// use codegraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::CodeGraph;
    pub use crate::entity::{Entity, EntityType};
    pub use crate::error::{CodeGraphError, Result};
    pub use crate::indexer::ParseComplete;
    pub use crate::relation::{Relationship, RelationshipType};
    pub use crate::search::HybridOptions;
    pub use crate::types::{EntityId, Timestamp};
}
