//! Text embeddings for task similarity search.
//!
//! An [`Embedder`] is optional. When none is configured, or it fails, the
//! service returns a pseudo-random unit vector seeded from the text so the
//! same text always maps to the same vector.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EmbeddingError;

pub const DEFAULT_DIMENSIONS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

pub struct EmbeddingService {
    embedder: Option<Arc<dyn Embedder>>,
    dimensions: usize,
}

impl EmbeddingService {
    pub fn new(embedder: Option<Arc<dyn Embedder>>, dimensions: usize) -> Self {
        Self {
            embedder,
            dimensions,
        }
    }

    /// Service without a backing model; always uses the fallback vector.
    pub fn fallback_only() -> Self {
        Self::new(None, DEFAULT_DIMENSIONS)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed `text`. Never fails.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        let Some(embedder) = &self.embedder else {
            return self.fallback(text);
        };
        match embedder.embed(text).await {
            Ok(v) if v.len() == self.dimensions => v,
            Ok(v) => {
                let e = EmbeddingError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: v.len(),
                };
                tracing::warn!("Embedding rejected, using fallback vector: {e}");
                self.fallback(text)
            }
            Err(e) => {
                tracing::warn!("Embedding failed, using fallback vector: {e}");
                self.fallback(text)
            }
        }
    }

    fn fallback(&self, text: &str) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(fnv1a(text.as_bytes()));
        let mut v: Vec<f32> = (0..self.dimensions)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ *b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Cosine similarity, 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
