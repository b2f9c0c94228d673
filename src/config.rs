//! Configuration types for codegraph.
//!
//! The [`Config`] struct controls engine behavior: connection pooling,
//! cache sizing, batch writes, vector search, and embedding providers.
//! All fields have defaults tuned for commodity hardware (≈4 cores,
//! 8 GB RAM) and a graph of 10⁵–10⁶ entities.
//!
//! # Example
//! ```rust
//! use codegraph::Config;
//!
//! // Use defaults (deterministic embeddings, 384 dimensions)
//! let config = Config::default();
//!
//! // Customize for a larger deployment
//! let config = Config {
//!     pool: codegraph::PoolConfig {
//!         max_connections: 8,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Engine configuration.
///
/// Use struct update syntax to override specific settings:
///
/// ```rust
/// use codegraph::Config;
///
/// let config = Config {
///     batch: codegraph::BatchConfig {
///         batch_size: 500,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Connection pool limits and timeouts.
    pub pool: PoolConfig,

    /// Multi-level query cache sizing.
    pub cache: CacheConfig,

    /// Batch write chunking and tuning.
    pub batch: BatchConfig,

    /// Vector store dimension and search mode.
    pub vector: VectorConfig,

    /// Embedding provider selection.
    pub embedding: EmbeddingConfig,

    /// HTTP engine settings for remote embedding providers.
    pub http: HttpEngineConfig,

    /// Semantic cache sizing (embeddings, search results, general).
    pub semantic_cache: SemanticCacheConfig,

    /// HNSW index parameters for the vector store's native mode.
    pub hnsw: HnswConfig,
}

impl Config {
    /// Creates a new Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `CodeGraph::open()`. You can also call this
    /// explicitly to check configuration before attempting to open.
    ///
    /// # Errors
    /// Returns `ValidationError` if any limit is zero, a timeout is zero,
    /// or the pool minimum exceeds its maximum.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pool.validate()?;
        self.cache.validate()?;
        self.batch.validate()?;
        self.vector.validate()?;
        self.hnsw.validate()?;
        Ok(())
    }
}

/// Connection pool settings.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Connections kept open even when idle. Default: 1
    pub min_connections: usize,

    /// Upper bound on open connections. Default: 4
    pub max_connections: usize,

    /// How long `acquire()` blocks before failing. Default: 5 s
    pub acquire_timeout: Duration,

    /// Idle connections above the minimum are closed after this long.
    /// Default: 30 s
    pub idle_timeout: Duration,

    /// Interval between `SELECT 1` health probes on idle handles.
    /// Default: 60 s
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_connections == 0 {
            return Err(ValidationError::invalid_field(
                "pool.max_connections",
                "must be greater than 0",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ValidationError::invalid_field(
                "pool.min_connections",
                "must not exceed max_connections",
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ValidationError::invalid_field(
                "pool.acquire_timeout",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Multi-level query cache settings.
///
/// Tier defaults follow the reference behavior: a small hot tier that
/// refreshes recency on reads, a larger warm tier that does not, and a
/// persistent cold tier in a sibling database file.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Hot tier capacity (entries). Default: 100
    pub hot_capacity: usize,

    /// Hot tier time-to-live. Default: 60 s
    pub hot_ttl: Duration,

    /// Warm tier capacity (entries). Default: 1000
    pub warm_capacity: usize,

    /// Warm tier time-to-live. Default: 5 min
    pub warm_ttl: Duration,

    /// Cold tier time-to-live. Default: 1 h
    pub cold_ttl: Duration,

    /// Override for the cold tier's database file. When `None`, a
    /// `query_cache.db` sibling of the main database is used.
    pub cold_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: 100,
            hot_ttl: Duration::from_secs(60),
            warm_capacity: 1000,
            warm_ttl: Duration::from_secs(300),
            cold_ttl: Duration::from_secs(3600),
            cold_path: None,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.hot_capacity == 0 {
            return Err(ValidationError::invalid_field(
                "cache.hot_capacity",
                "must be greater than 0",
            ));
        }
        if self.warm_capacity == 0 {
            return Err(ValidationError::invalid_field(
                "cache.warm_capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Batch write settings.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Rows per transaction chunk. Default: 1000
    pub batch_size: usize,

    /// Target latency per chunk driving adaptive tuning. Default: 50 ms
    pub target_chunk_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            target_chunk_ms: 50,
        }
    }
}

impl BatchConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::invalid_field(
                "batch.batch_size",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Vector store settings.
#[derive(Clone, Debug)]
pub struct VectorConfig {
    /// Embedding dimension, fixed per store file. Default: 384
    pub dimension: usize,

    /// Force the linear-scan fallback even when the HNSW index builds.
    /// Default: false
    pub force_fallback: bool,

    /// Override for the vector store's database file. When `None`, a
    /// `vectors.db` sibling of the main database is used.
    pub path: Option<PathBuf>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            force_fallback: false,
            path: None,
        }
    }
}

impl VectorConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.dimension == 0 {
            return Err(ValidationError::invalid_field(
                "vector.dimension",
                "must be greater than 0",
            ));
        }
        if self.dimension > 4096 {
            return Err(ValidationError::invalid_field(
                "vector.dimension",
                "must not exceed 4096",
            ));
        }
        Ok(())
    }
}

/// Embedding provider selection.
///
/// A closed set of providers behind one trait; see the `embedding` module.
/// Whatever is selected, a deterministic fallback is always constructed
/// alongside it, so `embed()` never fails outright.
#[derive(Clone, Debug, Default)]
pub enum EmbeddingConfig {
    /// Hash-seeded pseudo-random vectors. Always available, no I/O.
    #[default]
    Deterministic,

    /// In-process ONNX model (requires the `local-embeddings` feature).
    Local {
        /// Custom model path. If `None`, uses the bundled default model.
        model_path: Option<PathBuf>,
    },

    /// OpenAI-style `/v1/embeddings` endpoint.
    HttpOpenAi {
        /// Base URL, e.g. `https://api.openai.com`.
        base_url: String,
        /// Model name sent in each request.
        model: String,
        /// Bearer token, if the endpoint requires one.
        api_key: Option<String>,
    },

    /// Ollama `/api/embeddings` endpoint.
    HttpOllama {
        /// Base URL, e.g. `http://localhost:11434`.
        base_url: String,
        /// Model name sent in each request.
        model: String,
    },

    /// CloudRU-style embeddings endpoint.
    HttpCloudRu {
        /// Base URL of the deployment.
        base_url: String,
        /// Model name sent in each request.
        model: String,
        /// Bearer token, if the endpoint requires one.
        api_key: Option<String>,
    },
}

impl EmbeddingConfig {
    /// Short provider name used in cache keys and `ProviderInfo`.
    pub fn provider_name(&self) -> &'static str {
        match self {
            EmbeddingConfig::Deterministic => "memory",
            EmbeddingConfig::Local { .. } => "local",
            EmbeddingConfig::HttpOpenAi { .. } => "openai",
            EmbeddingConfig::HttpOllama { .. } => "ollama",
            EmbeddingConfig::HttpCloudRu { .. } => "cloudru",
        }
    }
}

/// HTTP engine settings shared by the remote providers.
#[derive(Clone, Debug)]
pub struct HttpEngineConfig {
    /// Per-request timeout. Default: 10 s
    pub request_timeout: Duration,

    /// Maximum in-flight requests. Default: 4
    pub max_concurrency: usize,

    /// Retries on HTTP 429/5xx with linear backoff. Default: 2
    pub max_retries: u32,

    /// Texts per request for providers without native batching.
    /// Default: 32
    pub max_batch_size: usize,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_concurrency: 4,
            max_retries: 2,
            max_batch_size: 32,
        }
    }
}

/// Semantic cache sizing.
///
/// Three LRU maps with one shared TTL: embeddings (hot path for the
/// indexing pipeline), semantic search results, and general values.
#[derive(Clone, Debug)]
pub struct SemanticCacheConfig {
    /// Embedding map capacity (entries). Default: 500
    pub embedding_capacity: usize,

    /// Search-result map capacity (entries). Default: 200
    pub search_capacity: usize,

    /// General map capacity (entries). Default: 200
    pub general_capacity: usize,

    /// Time-to-live applied to all three maps. Default: 10 min
    pub ttl: Duration,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            embedding_capacity: 500,
            search_capacity: 200,
            general_capacity: 200,
            ttl: Duration::from_secs(600),
        }
    }
}

/// Configuration for the HNSW index behind the vector store's native mode.
///
/// Controls the trade-off between index build time, memory usage, and
/// search accuracy. Defaults are tuned for the target scale
/// (10⁵–10⁶ vectors).
///
/// # Tuning Guide
///
/// | Use Case     | M  | ef_construction | ef_search |
/// |--------------|----|-----------------|-----------|
/// | Low memory   |  8 |             100 |        30 |
/// | Balanced     | 16 |             200 |        50 |
/// | High recall  | 32 |             400 |       100 |
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Maximum bidirectional connections per node (M parameter).
    /// Default: 16
    pub max_nb_connection: usize,

    /// Candidates tracked during index construction. Default: 200
    pub ef_construction: usize,

    /// Candidates tracked during search. Must be >= k. Default: 50
    pub ef_search: usize,

    /// Maximum skip-list layers. Default: 16
    pub max_layer: usize,

    /// Initial pre-allocated capacity (number of vectors). Default: 10_000
    pub max_elements: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_nb_connection: 16,
            ef_construction: 200,
            ef_search: 50,
            max_layer: 16,
            max_elements: 10_000,
        }
    }
}

impl HnswConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.max_nb_connection == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.max_nb_connection",
                "must be greater than 0",
            ));
        }
        if self.ef_construction == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_construction",
                "must be greater than 0",
            ));
        }
        if self.ef_search == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_search",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_pool_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.min_connections, 1);
        assert_eq!(pool.max_connections, 4);
        assert_eq!(pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(pool.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_cache_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.hot_capacity, 100);
        assert_eq!(cache.warm_capacity, 1000);
        assert_eq!(cache.hot_ttl, Duration::from_secs(60));
        assert_eq!(cache.warm_ttl, Duration::from_secs(300));
        assert_eq!(cache.cold_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_zero_max_connections() {
        let config = Config {
            pool: PoolConfig {
                max_connections: 0,
                min_connections: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field, .. } if field == "pool.max_connections"
        ));
    }

    #[test]
    fn test_validate_min_over_max() {
        let config = Config {
            pool: PoolConfig {
                min_connections: 8,
                max_connections: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_dimension_bounds() {
        let mut config = Config::default();
        config.vector.dimension = 0;
        assert!(config.validate().is_err());
        config.vector.dimension = 5000;
        assert!(config.validate().is_err());
        config.vector.dimension = 1536;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(EmbeddingConfig::Deterministic.provider_name(), "memory");
        let ollama = EmbeddingConfig::HttpOllama {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
        };
        assert_eq!(ollama.provider_name(), "ollama");
    }

    #[test]
    fn test_http_engine_defaults() {
        let http = HttpEngineConfig::default();
        assert_eq!(http.request_timeout, Duration::from_secs(10));
        assert_eq!(http.max_concurrency, 4);
        assert_eq!(http.max_retries, 2);
    }

    #[test]
    fn test_hnsw_validate_zeros() {
        let mut config = Config::default();
        config.hnsw.ef_search = 0;
        assert!(config.validate().is_err());
    }
}
