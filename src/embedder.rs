use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::Fingerprint;

const HASH_EMBED_DIMS: usize = 64;

/// Turns a query and optional context into a fixed-dimension fingerprint.
/// Embedding generation itself is a delegated collaborator; this trait is
/// the narrow interface the cache talks to.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, query: &str, context: Option<&Value>) -> anyhow::Result<Fingerprint>;
}

/// Deterministic, model-free fallback: hashes token shingles of the query
/// into a unit-normalized vector. Stable across restarts, makes no external
/// calls. Production deployments are expected to supply a real embedding
/// provider through the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingEmbedder;

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, query: &str, context: Option<&Value>) -> anyhow::Result<Fingerprint> {
        let vector = hash_embedding(query);
        let context_key = context.map(context_key_of);
        Ok(Fingerprint { vector, context_key })
    }
}

fn hash_embedding(text: &str) -> Vec<f32> {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut digest = Sha256::new();
    digest.update(normalized.as_bytes());
    let bytes = digest.finalize();

    let mut vec = vec![0f32; HASH_EMBED_DIMS];
    for (idx, value) in vec.iter_mut().enumerate() {
        let byte = bytes[idx % bytes.len()] as f32;
        *value = (byte / 255.0) * 2.0 - 1.0;
    }
    normalize(vec)
}

fn normalize(mut vec: Vec<f32>) -> Vec<f32> {
    let norm = vec
        .iter()
        .map(|v| (*v as f64) * (*v as f64))
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 {
        return vec;
    }
    let norm = norm as f32;
    for value in vec.iter_mut() {
        *value /= norm;
    }
    vec
}

/// Stable hash of the context dimensions that must match exactly for a cache
/// hit (e.g. the current file path), independent of the fingerprint vector.
fn context_key_of(context: &Value) -> String {
    let mut digest = Sha256::new();
    digest.update(context.to_string().as_bytes());
    hex::encode(digest.finalize())
}
