use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Error type for embedding operations.
///
/// Every variant is a provider failure; the guard treats all of them the
/// same way as "no trajectory available".
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("embedding timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl EmbedError {
    /// Timeouts and rate limits may succeed on a later invocation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited)
    }
}

/// Trait for text embedding providers (OpenAI, Voyage, local hashing, ...).
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Embed several texts. The default implementation calls `embed` in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        (**self).embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        (**self).embed_batch(texts).await
    }
}

/// Bounds every call of the inner provider by `timeout`.
/// Expiry surfaces as [`EmbedError::Timeout`].
pub struct TimeoutEmbedder<E> {
    inner: E,
    timeout: Duration,
}

impl<E: Embedder> TimeoutEmbedder<E> {
    pub fn new(inner: E, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for TimeoutEmbedder<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        match tokio::time::timeout(self.timeout, self.inner.embed(text)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    provider = self.inner.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "embedding call timed out"
                );
                Err(EmbedError::Timeout(self.timeout))
            }
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        tokio::time::timeout(self.timeout, self.inner.embed_batch(texts))
            .await
            .map_err(|_| EmbedError::Timeout(self.timeout))?
    }
}

/// Mock provider for testing: fixed vectors per text.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: Vec<f32>,
    failure: Option<EmbedError>,
    delay: Option<Duration>,
}

impl MockEmbedder {
    /// Every text embeds to `fallback` unless registered with [`MockEmbedder::with`].
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            vectors: HashMap::new(),
            fallback,
            failure: None,
            delay: None,
        }
    }

    pub fn with(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }

    /// Make every call fail with `error`.
    pub fn failing(error: EmbedError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new(Vec::new())
        }
    }

    /// Sleep before answering; pairs with [`TimeoutEmbedder`] in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn name(&self) -> &str {
        "mock"
    }

    fn dimensions(&self) -> usize {
        self.fallback.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
