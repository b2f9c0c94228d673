//! In-process embedding generation via ONNX Runtime.
//!
//! Requires the `local-embeddings` feature. The provider loads a
//! sentence-transformer ONNX export plus its HuggingFace tokenizer from
//! a model directory (`model.onnx` + `tokenizer.json`), runs inference,
//! mean-pools the token embeddings weighted by the attention mask, and
//! L2-normalizes the result.
//!
//! Model resolution order: the configured path, then
//! `<cache_dir>/codegraph/models/all-MiniLM-L6-v2/`. No network
//! download is attempted; a missing model surfaces as
//! `ProviderError::Unavailable` and the orchestrator's deterministic
//! fallback takes over.

use std::path::PathBuf;

use ndarray::{Array2, Axis};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tracing::{info, instrument};

use crate::error::{ProviderError, Result};

use super::{EmbeddingProvider, ProviderInfo};

/// Maximum tokens fed to the model per text.
const MAX_SEQUENCE_LEN: usize = 256;

/// ONNX-backed local embedding provider.
///
/// # Thread Safety
///
/// Inference state lives behind a mutex; ONNX Runtime sessions require
/// exclusive access for `run()`.
pub struct LocalProvider {
    model_dir: Option<PathBuf>,
    dimension: usize,
    state: Mutex<Option<LocalState>>,
}

struct LocalState {
    session: Session,
    tokenizer: Tokenizer,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("model_dir", &self.model_dir)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl LocalProvider {
    /// Creates an uninitialized provider; the model loads on
    /// [`initialize`](EmbeddingProvider::initialize).
    pub fn new(model_dir: Option<PathBuf>, dimension: usize) -> Self {
        Self {
            model_dir,
            dimension,
            state: Mutex::new(None),
        }
    }

    fn resolve_model_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.model_dir {
            return Ok(dir.clone());
        }
        let cache = dirs::cache_dir().ok_or_else(|| {
            ProviderError::unavailable("no cache directory available for model files")
        })?;
        Ok(cache.join("codegraph/models/all-MiniLM-L6-v2"))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LocalState) -> Result<R>) -> Result<R> {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => f(state),
            None => Err(ProviderError::unavailable("local model not initialized").into()),
        }
    }
}

impl EmbeddingProvider for LocalProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "local".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: self.dimension,
            supports_batch: false,
        }
    }

    #[instrument(skip(self))]
    fn initialize(&self) -> Result<()> {
        let dir = self.resolve_model_dir()?;
        let model_path = dir.join("model.onnx");
        let tokenizer_path = dir.join("tokenizer.json");
        if !model_path.exists() || !tokenizer_path.exists() {
            return Err(ProviderError::unavailable(format!(
                "model files missing under {}",
                dir.display()
            ))
            .into());
        }

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ProviderError::unavailable(format!("tokenizer load failed: {e}")))?;
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_file(&model_path))
            .map_err(|e| ProviderError::unavailable(format!("session load failed: {e}")))?;

        *self.state.lock() = Some(LocalState { session, tokenizer });
        info!(dir = %dir.display(), "Local embedding model loaded");
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let dimension = self.dimension;
        self.with_state(|state| {
            let encoding = state
                .tokenizer
                .encode(text, true)
                .map_err(|e| ProviderError::unavailable(format!("tokenize failed: {e}")))?;
            let len = encoding.get_ids().len().min(MAX_SEQUENCE_LEN).max(1);

            let ids: Vec<i64> = encoding.get_ids()[..len].iter().map(|&v| v as i64).collect();
            let mask: Vec<i64> = encoding.get_attention_mask()[..len]
                .iter()
                .map(|&v| v as i64)
                .collect();

            let input_ids = Array2::from_shape_vec((1, len), ids)
                .map_err(|e| ProviderError::unavailable(e.to_string()))?;
            let attention_mask = Array2::from_shape_vec((1, len), mask.clone())
                .map_err(|e| ProviderError::unavailable(e.to_string()))?;
            let token_type_ids = Array2::<i64>::zeros((1, len));

            let inputs = ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ]
            .map_err(|e| ProviderError::unavailable(format!("input build failed: {e}")))?;

            let outputs = state
                .session
                .run(inputs)
                .map_err(|e| ProviderError::unavailable(format!("inference failed: {e}")))?;

            let hidden = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ProviderError::unavailable(format!("output extract failed: {e}")))?;

            // [1, len, dim] → mean over tokens weighted by the mask.
            let hidden = hidden
                .into_dimensionality::<ndarray::Ix3>()
                .map_err(|e| ProviderError::unavailable(e.to_string()))?;
            let mut pooled = vec![0.0f32; dimension];
            let mut total = 0.0f32;
            for (token_idx, weight) in mask.iter().enumerate() {
                if *weight == 0 {
                    continue;
                }
                total += 1.0;
                let row = hidden.index_axis(Axis(0), 0);
                let token = row.index_axis(Axis(0), token_idx);
                for (slot, value) in pooled.iter_mut().zip(token.iter()) {
                    *slot += value;
                }
            }
            if total > 0.0 {
                for slot in &mut pooled {
                    *slot /= total;
                }
            }

            let norm: f32 = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for slot in &mut pooled {
                    *slot /= norm;
                }
            }
            Ok(pooled)
        })
    }

    fn close(&self) {
        *self.state.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninitialized_embed_is_unavailable() {
        let provider = LocalProvider::new(None, 384);
        let err = provider.embed("hello").unwrap_err();
        assert!(err.is_provider());
    }

    #[test]
    fn test_missing_model_dir_fails_initialize() {
        let provider = LocalProvider::new(Some(PathBuf::from("/nonexistent/model-dir")), 384);
        assert!(provider.initialize().is_err());
    }

    #[test]
    fn test_local_provider_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LocalProvider>();
    }
}
