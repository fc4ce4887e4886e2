//! In-process cache in front of an embedding provider, backed by moka.

use async_trait::async_trait;
use moka::future::Cache;

use crate::provider::{EmbedError, Embedder};

/// Wraps a provider with a size-bounded cache keyed by text. A capacity of
/// zero disables caching.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Option<Cache<String, Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let cache = (capacity > 0).then(|| Cache::builder().max_capacity(capacity as u64).build());
        Self { inner, cache }
    }

    /// Number of cached texts once pending evictions have run.
    pub async fn len(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn lookup(&self, text: &str) -> Option<Vec<f32>> {
        self.cache.as_ref()?.get(text).await
    }

    async fn store(&self, text: &str, vector: &[f32]) {
        if let Some(cache) = &self.cache {
            cache.insert(text.to_owned(), vector.to_vec()).await;
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if let Some(hit) = self.lookup(text).await {
            return Ok(hit);
        }
        let vector = self.inner.embed(text).await?;
        self.store(text, &vector).await;
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.lookup(text).await);
        }
        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fetched = self.inner.embed_batch(&batch).await?;
            if fetched.len() != batch.len() {
                return Err(EmbedError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    fetched.len()
                )));
            }
            for (idx, vector) in missing.into_iter().zip(fetched) {
                self.store(&texts[idx], &vector).await;
                results[idx] = Some(vector);
            }
        }

        Ok(results.into_iter().map(Option::unwrap_or_default).collect())
    }
}
