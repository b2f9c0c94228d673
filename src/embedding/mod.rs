//! Embedding provider abstraction.
//!
//! A closed set of providers behind one trait:
//!
//! - [`DeterministicProvider`] — hash-seeded pseudo-random normalized
//!   vectors; no I/O, always available, used as the universal fallback
//! - `LocalProvider` — in-process ONNX model, mean-pooled and normalized
//!   (requires the `local-embeddings` feature)
//! - [`HttpProvider`] — OpenAI-style, Ollama, or CloudRU-style remote
//!   endpoints over the shared [`HttpEngine`](http::HttpEngine)
//!
//! The orchestrating [`EmbeddingService`] constructs the selected
//! provider plus the deterministic fallback. Any initialize or embed
//! failure routes the request to the fallback and flips the service
//! info's `fallback_active` flag, so callers always get a correctly
//! shaped vector and can see when quality degraded.

pub mod http;

#[cfg(feature = "local-embeddings")]
pub mod onnx;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::config::{EmbeddingConfig, HttpEngineConfig};
use crate::error::{ProviderError, Result};
use crate::semantic::SemanticCache;

use http::HttpEngine;

/// Static description of a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Short provider name ("memory", "local", "openai", "ollama",
    /// "cloudru").
    pub name: String,
    /// Model identifier.
    pub model: String,
    /// Vector dimension produced.
    pub dimension: usize,
    /// Whether the provider accepts whole batches natively.
    pub supports_batch: bool,
}

/// Uniform interface over the provider variants.
///
/// Implementations must be `Send + Sync`; `embed_batch` defaults to a
/// sequential fan-out for providers without native batch support.
pub trait EmbeddingProvider: Send + Sync {
    /// Static provider description.
    fn info(&self) -> ProviderInfo;

    /// Prepares the provider (loads models, checks endpoints).
    fn initialize(&self) -> Result<()>;

    /// Vector dimension produced by this provider.
    fn dimension(&self) -> usize;

    /// Embeds one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds a batch of texts, preserving order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Releases provider resources.
    fn close(&self) {}
}

// =============================================================================
// Deterministic provider
// =============================================================================

/// Hash-seeded pseudo-random embedding provider.
///
/// Expands `sha256(text || counter)` blocks into floats in `[-1, 1]`
/// and L2-normalizes the result. The same text always produces the same
/// vector, so cached lookups and tests are stable. Quality is obviously
/// far below a learned model; the service info flags when this provider
/// is serving.
#[derive(Clone, Debug)]
pub struct DeterministicProvider {
    dimension: usize,
}

impl DeterministicProvider {
    /// Creates a provider producing vectors of `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingProvider for DeterministicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "memory".to_string(),
            model: "deterministic-hash-v1".to_string(),
            dimension: self.dimension,
            supports_batch: true,
        }
    }

    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut values = Vec::with_capacity(self.dimension);
        let mut counter = 0u32;
        while values.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if values.len() >= self.dimension {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1]
                values.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }

        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Ok(values)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

// =============================================================================
// HTTP providers
// =============================================================================

/// Which remote dialect an [`HttpProvider`] speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpProviderKind {
    /// OpenAI-style `/v1/embeddings`, native batching.
    OpenAi,
    /// Ollama `/api/embeddings`, one prompt per call.
    Ollama,
    /// CloudRU-style `/v1/embeddings` (OpenAI-compatible body).
    CloudRu,
}

impl HttpProviderKind {
    fn name(&self) -> &'static str {
        match self {
            HttpProviderKind::OpenAi => "openai",
            HttpProviderKind::Ollama => "ollama",
            HttpProviderKind::CloudRu => "cloudru",
        }
    }

    fn supports_batch(&self) -> bool {
        matches!(self, HttpProviderKind::OpenAi | HttpProviderKind::CloudRu)
    }
}

/// Remote embedding provider over HTTP.
pub struct HttpProvider {
    kind: HttpProviderKind,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    engine: HttpEngine,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    /// Creates a remote provider.
    pub fn new(
        kind: HttpProviderKind,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dimension: usize,
        http: HttpEngineConfig,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            dimension,
            engine: HttpEngine::new(http),
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(ProviderError::unavailable(format!(
                "provider returned dimension {}, expected {}",
                vector.len(),
                self.dimension
            ))
            .into());
        }
        Ok(())
    }
}

impl EmbeddingProvider for HttpProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.kind.name().to_string(),
            model: self.model.clone(),
            dimension: self.dimension,
            supports_batch: self.kind.supports_batch(),
        }
    }

    #[instrument(skip(self))]
    fn initialize(&self) -> Result<()> {
        // A one-text embed doubles as the health probe; there is no
        // uniform "models" endpoint across the three dialects.
        self.embed("ping").map(|_| ())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = match self.kind {
            HttpProviderKind::OpenAi | HttpProviderKind::CloudRu => {
                let mut batch = http::openai_embed_batch(
                    &self.engine,
                    &self.base_url,
                    self.api_key.as_deref(),
                    &self.model,
                    &[text],
                )?;
                batch
                    .pop()
                    .ok_or_else(|| ProviderError::unavailable("empty embedding response"))?
            }
            HttpProviderKind::Ollama => {
                http::ollama_embed(&self.engine, &self.base_url, &self.model, text)?
            }
        };
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.kind.supports_batch() {
            let mut out = Vec::with_capacity(texts.len());
            for chunk in texts.chunks(self.engine.max_batch_size()) {
                let vectors = http::openai_embed_batch(
                    &self.engine,
                    &self.base_url,
                    self.api_key.as_deref(),
                    &self.model,
                    chunk,
                )?;
                if vectors.len() != chunk.len() {
                    return Err(ProviderError::unavailable(format!(
                        "provider returned {} embeddings for {} inputs",
                        vectors.len(),
                        chunk.len()
                    ))
                    .into());
                }
                for v in &vectors {
                    self.check_dimension(v)?;
                }
                out.extend(vectors);
            }
            Ok(out)
        } else {
            // Fan out under the engine's concurrency permits.
            texts.iter().map(|t| self.embed(t)).collect()
        }
    }

    fn close(&self) {
        self.engine.cancel_flag().store(true, Ordering::Relaxed);
    }
}

// =============================================================================
// Orchestrating service
// =============================================================================

/// Runtime view of the embedding service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// The configured primary provider.
    pub provider: ProviderInfo,
    /// The always-available fallback.
    pub fallback: ProviderInfo,
    /// True once any primary initialize/embed call has failed; requests
    /// are then served by the fallback.
    pub fallback_active: bool,
}

/// Creates the primary provider named by the configuration.
pub fn create_provider(
    config: &EmbeddingConfig,
    dimension: usize,
    http: HttpEngineConfig,
) -> Box<dyn EmbeddingProvider> {
    match config {
        EmbeddingConfig::Deterministic => Box::new(DeterministicProvider::new(dimension)),

        #[cfg(feature = "local-embeddings")]
        EmbeddingConfig::Local { model_path } => {
            Box::new(onnx::LocalProvider::new(model_path.clone(), dimension))
        }

        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingConfig::Local { .. } => {
            warn!("local-embeddings feature disabled; using deterministic provider");
            Box::new(DeterministicProvider::new(dimension))
        }

        EmbeddingConfig::HttpOpenAi {
            base_url,
            model,
            api_key,
        } => Box::new(HttpProvider::new(
            HttpProviderKind::OpenAi,
            base_url.clone(),
            model.clone(),
            api_key.clone(),
            dimension,
            http,
        )),

        EmbeddingConfig::HttpOllama { base_url, model } => Box::new(HttpProvider::new(
            HttpProviderKind::Ollama,
            base_url.clone(),
            model.clone(),
            None,
            dimension,
            http,
        )),

        EmbeddingConfig::HttpCloudRu {
            base_url,
            model,
            api_key,
        } => Box::new(HttpProvider::new(
            HttpProviderKind::CloudRu,
            base_url.clone(),
            model.clone(),
            api_key.clone(),
            dimension,
            http,
        )),
    }
}

/// Orchestrates the selected provider with the deterministic fallback
/// and an embedding cache.
///
/// Cache keys include provider name, model, and dimension, so swapping
/// providers never yields stale hits.
pub struct EmbeddingService {
    primary: Box<dyn EmbeddingProvider>,
    fallback: DeterministicProvider,
    fallback_active: AtomicBool,
    cache: Arc<SemanticCache>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("provider", &self.primary.info().name)
            .field("fallback_active", &self.fallback_active.load(Ordering::Relaxed))
            .finish()
    }
}

impl EmbeddingService {
    /// Builds the service from configuration.
    pub fn new(
        config: &EmbeddingConfig,
        dimension: usize,
        http: HttpEngineConfig,
        cache: Arc<SemanticCache>,
    ) -> Self {
        let primary = create_provider(config, dimension, http);
        Self {
            primary,
            fallback: DeterministicProvider::new(dimension),
            fallback_active: AtomicBool::new(false),
            cache,
        }
    }

    /// Initializes the primary provider; a failure activates the
    /// fallback instead of erroring.
    #[instrument(skip(self))]
    pub fn initialize(&self) {
        match self.primary.initialize() {
            Ok(()) => info!(provider = %self.primary.info().name, "Embedding provider ready"),
            Err(err) => {
                warn!(
                    provider = %self.primary.info().name,
                    error = %err,
                    "Embedding provider failed to initialize; deterministic fallback active"
                );
                self.fallback_active.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Runtime service description.
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            provider: self.primary.info(),
            fallback: self.fallback.info(),
            fallback_active: self.fallback_active.load(Ordering::Relaxed),
        }
    }

    /// Vector dimension all embeddings share.
    pub fn dimension(&self) -> usize {
        self.fallback.dimension()
    }

    /// Model name of whichever provider is currently serving.
    pub fn active_model(&self) -> String {
        if self.fallback_active.load(Ordering::Relaxed) {
            self.fallback.info().model
        } else {
            self.primary.info().model
        }
    }

    /// Embeds one text, consulting the cache first.
    ///
    /// Never fails to produce a vector: a primary failure flips to the
    /// deterministic fallback for this and subsequent requests.
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.cache_key(text);
        if let Some(vector) = self.cache.get_embedding(&key) {
            return Ok(vector);
        }

        let vector = self.embed_uncached(text)?;
        // Key under the provider that actually produced the vector.
        self.cache.put_embedding(self.cache_key(text), vector.clone());
        Ok(vector)
    }

    /// Embeds a batch, preserving order; cached entries are not
    /// re-requested.
    pub fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing: Vec<usize> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            match self.cache.get_embedding(&self.cache_key(text)) {
                Some(vector) => out[i] = Some(vector),
                None => missing.push(i),
            }
        }

        if !missing.is_empty() {
            let todo: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let vectors = self.embed_batch_uncached(&todo)?;
            for (slot, vector) in missing.into_iter().zip(vectors) {
                self.cache
                    .put_embedding(self.cache_key(texts[slot]), vector.clone());
                out[slot] = Some(vector);
            }
        }

        Ok(out.into_iter().map(|v| v.expect("all slots filled")).collect())
    }

    /// Shuts both providers down.
    pub fn close(&self) {
        self.primary.close();
        self.fallback.close();
    }

    fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        if !self.fallback_active.load(Ordering::Relaxed) {
            match self.primary.embed(text) {
                Ok(vector) => return Ok(vector),
                Err(err) => {
                    warn!(error = %err, "Primary embed failed; switching to fallback");
                    self.fallback_active.store(true, Ordering::Relaxed);
                }
            }
        }
        self.fallback.embed(text)
    }

    fn embed_batch_uncached(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if !self.fallback_active.load(Ordering::Relaxed) {
            match self.primary.embed_batch(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(err) => {
                    warn!(error = %err, "Primary batch embed failed; switching to fallback");
                    self.fallback_active.store(true, Ordering::Relaxed);
                }
            }
        }
        self.fallback.embed_batch(texts)
    }

    fn cache_key(&self, text: &str) -> String {
        let info = if self.fallback_active.load(Ordering::Relaxed) {
            self.fallback.info()
        } else {
            self.primary.info()
        };
        let digest = Sha256::digest(text.as_bytes());
        format!(
            "{}|{}|{}|{}",
            info.name,
            info.model,
            info.dimension,
            hex::encode(digest)
        )
    }
}
