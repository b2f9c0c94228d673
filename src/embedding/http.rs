//! HTTP engine for remote embedding providers.
//!
//! One [`HttpEngine`] is shared by all remote providers and enforces the
//! transport contract: a per-request timeout, bounded concurrency via a
//! permit channel, retry with linear backoff on HTTP 429/5xx, and a
//! cooperative cancellation flag checked before every attempt.
//!
//! Three wire dialects are supported:
//! - OpenAI-style `POST /v1/embeddings` with native batch input
//! - Ollama `POST /api/embeddings`, one prompt per request
//! - CloudRU-style `POST /v1/embeddings` (OpenAI-compatible body)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::HttpEngineConfig;
use crate::error::{ProviderError, Result};

/// Base delay for linear backoff between retries.
const BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Shared HTTP transport with concurrency permits and cancellation.
pub struct HttpEngine {
    agent: ureq::Agent,
    config: HttpEngineConfig,
    permit_tx: Sender<()>,
    permit_rx: Receiver<()>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for HttpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEngine")
            .field("max_concurrency", &self.config.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl HttpEngine {
    /// Creates an engine with `max_concurrency` permits.
    pub fn new(config: HttpEngineConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.request_timeout)
            .build();
        let (permit_tx, permit_rx) = bounded(config.max_concurrency.max(1));
        for _ in 0..config.max_concurrency.max(1) {
            permit_tx.send(()).expect("permit channel has capacity");
        }
        Self {
            agent,
            config,
            permit_tx,
            permit_rx,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the cancellation flag; setting it aborts in-flight retries
    /// at the next attempt boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Maximum texts per request for fan-out providers.
    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// POSTs a JSON body, honoring permits, retries, and cancellation.
    ///
    /// # Errors
    ///
    /// - [`ProviderError::Timeout`] when cancelled or the request timed out
    /// - [`ProviderError::Http`] for non-retryable (or exhausted) statuses
    /// - [`ProviderError::Unavailable`] for transport failures
    pub fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        // Permit bounds global concurrency; returned on drop of `_permit`.
        let _permit = PermitGuard::acquire(&self.permit_rx, &self.permit_tx);

        let mut last_err: Option<ProviderError> = None;
        for attempt in 0..=self.config.max_retries {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(ProviderError::Timeout.into());
            }
            if attempt > 0 {
                // Linear backoff: 500 ms, 1 s, 1.5 s, ...
                std::thread::sleep(BACKOFF_STEP * attempt);
            }

            let mut request = self.agent.post(url).set("Content-Type", "application/json");
            if let Some(token) = bearer {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }

            match request.send_json(body.clone()) {
                Ok(response) => {
                    let parsed: serde_json::Value = response.into_json().map_err(|e| {
                        ProviderError::unavailable(format!("invalid JSON response: {e}"))
                    })?;
                    return Ok(parsed);
                }
                Err(ureq::Error::Status(status, response)) => {
                    let body_text = response.into_string().unwrap_or_default();
                    let err = ProviderError::http(status, body_text);
                    if status == 429 || (500..600).contains(&status) {
                        debug!(status, attempt, "Retryable HTTP status from provider");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err.into());
                }
                Err(ureq::Error::Transport(transport)) => {
                    let err = if transport.kind() == ureq::ErrorKind::Io {
                        // ureq reports timeouts as I/O transport errors.
                        ProviderError::Timeout
                    } else {
                        ProviderError::unavailable(transport.to_string())
                    };
                    warn!(attempt, error = %transport, "Transport failure calling provider");
                    last_err = Some(err);
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ProviderError::unavailable("retries exhausted"))
            .into())
    }
}

/// RAII permit: taken from the channel on acquire, returned on drop.
struct PermitGuard<'a> {
    tx: &'a Sender<()>,
}

impl<'a> PermitGuard<'a> {
    fn acquire(rx: &Receiver<()>, tx: &'a Sender<()>) -> Self {
        // The channel always holds max_concurrency permits total, so
        // this cannot deadlock; it blocks while all permits are out.
        rx.recv().expect("permit channel never closes");
        Self { tx }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(());
    }
}

// =============================================================================
// Wire formats
// =============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiDatum>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

/// Calls an OpenAI-style `/v1/embeddings` endpoint with a text batch.
pub fn openai_embed_batch(
    engine: &HttpEngine,
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    texts: &[&str],
) -> Result<Vec<Vec<f32>>> {
    let url = format!("{}/v1/embeddings", base_url.trim_end_matches('/'));
    let body = serde_json::json!({ "model": model, "input": texts });
    let value = engine.post_json(&url, api_key, &body)?;
    let parsed: OpenAiResponse = serde_json::from_value(value)
        .map_err(|e| ProviderError::unavailable(format!("unexpected response shape: {e}")))?;
    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}

/// Calls an Ollama `/api/embeddings` endpoint for one prompt.
pub fn ollama_embed(
    engine: &HttpEngine,
    base_url: &str,
    model: &str,
    text: &str,
) -> Result<Vec<f32>> {
    let url = format!("{}/api/embeddings", base_url.trim_end_matches('/'));
    let body = serde_json::json!({ "model": model, "prompt": text });
    let value = engine.post_json(&url, None, &body)?;
    let parsed: OllamaResponse = serde_json::from_value(value)
        .map_err(|e| ProviderError::unavailable(format!("unexpected response shape: {e}")))?;
    Ok(parsed.embedding)
}
