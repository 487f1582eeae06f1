//! Order-preserving batch embedding.
//!
//! [`Embedder`] wraps an [`EmbeddingProvider`] with the operational
//! contract the ingestion path relies on: requests are batched (512 texts
//! by default), every request carries a timeout and a small bounded retry
//! budget with jittered backoff, and the output is strictly index-aligned
//! with the input (`out[i]` embeds `texts[i]`). Exhausting the retry
//! budget is fatal for the surrounding ingestion job; job-level retry
//! belongs to the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    #[error("embedding provider error: {0}")]
    #[diagnostic(code(pagewright::embed::provider))]
    Provider(String),

    #[error("embedding request timed out after {0:?}")]
    #[diagnostic(code(pagewright::embed::timeout))]
    Timeout(Duration),

    #[error("embedding batch misaligned: sent {sent} texts, received {received} vectors")]
    #[diagnostic(
        code(pagewright::embed::misaligned),
        help("The provider must return one vector per input text, in order.")
    )]
    Misaligned { sent: usize, received: usize },

    #[error("embedding failed after {attempts} attempts: {last}")]
    #[diagnostic(
        code(pagewright::embed::retries_exhausted),
        help("The ingestion job fails here; the job queue owns further retries.")
    )]
    RetriesExhausted { attempts: u32, last: String },
}

/// Boundary to the external embedding service.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimensionality of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Embeds one batch; must return vectors aligned with `texts`.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Batching, retrying front end over an [`EmbeddingProvider`].
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    timeout: Duration,
    max_retries: u32,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            batch_size: 512,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Embeds `texts`, preserving order and length.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self.embed_batch_with_retry(batch).await?;
            if embedded.len() != batch.len() {
                return Err(EmbedError::Misaligned {
                    sent: batch.len(),
                    received: embedded.len(),
                });
            }
            vectors.extend(embedded);
        }
        debug_assert_eq!(vectors.len(), texts.len());
        Ok(vectors)
    }

    /// Embeds a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let input = [text.to_string()];
        let mut vectors = self.embed(&input).await?;
        vectors.pop().ok_or(EmbedError::Misaligned {
            sent: 1,
            received: 0,
        })
    }

    async fn embed_batch_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let attempts = self.max_retries.max(1);
        let mut last = String::new();
        for attempt in 0..attempts {
            let outcome = tokio::time::timeout(self.timeout, self.provider.embed_batch(batch)).await;
            match outcome {
                Ok(Ok(vectors)) => {
                    debug!(batch = batch.len(), attempt, "embedded batch");
                    return Ok(vectors);
                }
                Ok(Err(err)) => {
                    last = err.to_string();
                    warn!(attempt, error = %last, "embedding attempt failed");
                }
                Err(_) => {
                    last = EmbedError::Timeout(self.timeout).to_string();
                    warn!(attempt, timeout = ?self.timeout, "embedding attempt timed out");
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        Err(EmbedError::RetriesExhausted { attempts, last })
    }
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn backoff(attempt: u32) -> Duration {
    let base = 100u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Deterministic provider for tests and offline runs. Vectors are derived
/// from a text hash, so identical text always embeds identically.
#[derive(Debug, Default)]
pub struct MockEmbeddingProvider {
    calls: AtomicUsize,
}

impl MockEmbeddingProvider {
    pub const DIMENSIONS: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `embed_batch` calls observed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in text.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (0..Self::DIMENSIONS)
            .map(|i| {
                let lane = hash.rotate_left(i as u32 * 8) & 0xffff;
                (lane as f32 / 65535.0) * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimensions(&self) -> usize {
        Self::DIMENSIONS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}
