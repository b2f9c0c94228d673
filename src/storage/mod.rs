//! Storage layer: embedded SQLite engine, connection pool, migrations,
//! graph CRUD, and batch writes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    GraphStorage (C4/C5)                   │
//! │                          │                                │
//! │                          ▼                                │
//! │                 ConnectionPool (C2)                       │
//! │                  │    │    │    │                         │
//! │                  ▼    ▼    ▼    ▼                         │
//! │                SqlManager handles (C1)                    │
//! │          WAL-mode SQLite, schema via migrations (C3)      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! SQLite rows are the **source of truth**. Derived structures (the HNSW
//! vector index, all cache tiers) are rebuildable from these tables.

pub mod batch;
pub mod graph;
pub mod manager;
pub mod migrations;
pub mod pool;

pub use batch::{BatchItemError, BatchResult, BatchWriter};
pub use graph::{
    Direction, EntityQuery, FileDeleteReport, GraphMetrics, GraphStorage, NameFilter,
    RelationshipQuery, Subgraph,
};
pub use manager::{OpenOptions, ProcessLock, SqlManager, StatementMetrics};
pub use migrations::{migrate, Migration, MigrationRecord, SCHEMA_VERSION};
pub use pool::{ConnectionPool, PooledConnection};
