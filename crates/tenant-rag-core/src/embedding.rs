//! Embedder trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all bi-encoder backends implement,
//! plus pure helpers for vector serialization and similarity computation.
//!
//! Network and model-backed providers (OpenAI, Ollama, fastembed) live in
//! the `tenant-rag` app crate. The [`HashingEmbedder`] lives here because it
//! is pure: it maps text to a feature-hashed bag-of-words vector with no
//! model download, which makes it the default for tests and air-gapped use.

use sha2::{Digest, Sha256};

use crate::error::BackendError;
use crate::text::tokenize;

/// A bi-encoder that maps text to vectors of a fixed dimension.
///
/// Implementations must be deterministic for a given model and must return
/// exactly one vector of length [`dims`](Embedder::dims) per input text.
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, preserving input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::malformed(self.model_name(), "empty embedding response"))
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each token is hashed with SHA-256; the first eight bytes select a
/// dimension and one further bit selects the sign. The vector is
/// L2-normalized, so cosine similarity reduces to weighted token overlap.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as little-endian f32 bytes.
///
/// # Example
///
/// ```rust
/// use tenant_rag_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
