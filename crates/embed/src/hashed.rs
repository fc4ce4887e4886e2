//! Offline embedding via feature hashing.
//!
//! Each lowercase word is hashed into one of `dimensions` buckets with a
//! sign bit, and the resulting bag-of-words vector is L2-normalized. Same
//! input always yields the same output, and texts that share words have a
//! positive cosine similarity. Useful without network access and in tests.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::provider::{EmbedError, Embedder};

/// Default embedding dimension for the local provider.
pub const DEFAULT_DIM: usize = 256;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    /// Synchronous core of [`Embedder::embed`].
    pub fn generate(&self, content: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dim];
        for word in content
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.generate(text))
    }
}
