//! Deterministic local embedder.
//!
//! Signed feature hashing of lowercase alphanumeric tokens into a fixed
//! dimension, L2-normalised. Texts sharing vocabulary get a high cosine;
//! it is not a semantic model.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Embedding, EmbeddingProvider, ProviderError};

pub const DEFAULT_DIMENSION: usize = 256;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    version: String,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            version: format!("hashing-v1-{dimension}"),
        }
    }

    /// Override the version tag (e.g. to simulate a model upgrade).
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        Ok(Embedding {
            vector: self.embed_sync(text),
            model_version: self.version.clone(),
        })
    }

    fn model_version(&self) -> String {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[test]
    fn deterministic_and_normalised() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_sync("Run cargo test before pushing");
        let b = e.embed_sync("run CARGO test before pushing!");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashingEmbedder::default();
        let base = e.embed_sync("deploy the api service to staging");
        let close = e.embed_sync("deploy the api service to production");
        let far = e.embed_sync("grocery list apples bananas");
        assert!(cosine_similarity(&base, &close) > cosine_similarity(&base, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let v = HashingEmbedder::new(8).embed_sync("   ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn version_tag_is_stamped() {
        let e = HashingEmbedder::new(16).with_version("v2");
        assert_eq!(e.embed("x").await.unwrap().model_version, "v2");
    }
}
