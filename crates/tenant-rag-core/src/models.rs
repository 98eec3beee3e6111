//! Core data models shared by the pipeline stages.
//!
//! These types flow between chunking, indexing, retrieval, reranking and
//! answer generation:
//!
//! ```text
//! Document text ──chunk──▶ Chunk ──embed──▶ (Chunk, Vec<f32>) ──search──▶ ScoredChunk
//! ```
//!
//! All types are `Serialize + Deserialize` so index generations and cache
//! entries can be persisted as JSON snapshots.

use serde::{Deserialize, Serialize};

/// Change signature for one stored document.
///
/// Two signatures are equal only when path, size, modification time and
/// content hash all agree. A tenant's manifest is an ordered map of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSignature {
    /// Path relative to the tenant's document root (forward slashes).
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub modified_ms: i64,
    /// Hex-encoded SHA-256 of the raw bytes.
    pub hash: String,
}

impl FileSignature {
    /// True when size and modification time agree, ignoring the hash.
    pub fn same_stat(&self, other: &FileSignature) -> bool {
        self.path == other.path && self.size == other.size && self.modified_ms == other.modified_ms
    }
}

/// Metadata carried by every chunk for attribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Display file name (last path component).
    pub filename: String,
    /// Path relative to the tenant's document root.
    pub path: String,
    /// 1-based page numbers the span touches, when the source is paginated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<u32>,
    /// Origin URL for web-derived documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// A bounded span of a document's text, the unit of embedding and retrieval.
///
/// Chunks are immutable once created. When the parent document changes,
/// all of its chunks are regenerated and replaced together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic UUID (v5) derived from document id and ordinal.
    pub id: String,
    /// Parent document identifier (its relative path).
    pub document_id: String,
    /// Zero-based ordinal within the document.
    pub chunk_index: usize,
    /// The span text.
    pub text: String,
    /// Start offset in the document, in characters.
    pub start: usize,
    /// End offset (exclusive) in the document, in characters.
    pub end: usize,
    /// SHA-256 hex of `text`.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

/// A chunk returned by search, with the scores gathered along the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// Tenant the chunk was retrieved from.
    pub tenant: String,
    pub chunk: Chunk,
    /// Cosine similarity from the bi-encoder search.
    pub similarity: f32,
    /// Cross-encoder score, when the rerank stage ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Additive bonus from the evidence filter.
    #[serde(default)]
    pub evidence_bonus: f32,
}

impl ScoredChunk {
    pub fn new(tenant: impl Into<String>, chunk: Chunk, similarity: f32) -> Self {
        Self {
            tenant: tenant.into(),
            chunk,
            similarity,
            rerank_score: None,
            evidence_bonus: 0.0,
        }
    }

    /// Best available relevance: rerank score if present, else similarity.
    pub fn relevance(&self) -> f32 {
        self.rerank_score.unwrap_or(self.similarity)
    }

    /// Relevance plus the evidence bonus; the final ordering key.
    pub fn final_score(&self) -> f32 {
        self.relevance() + self.evidence_bonus
    }
}

/// A tenant with its routing score, used in disambiguation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantScore {
    pub tenant: String,
    pub score: f32,
}

/// Sort scored values descending, placing NaN last and keeping input order on ties.
pub fn sort_desc_by<T>(items: &mut [T], key: impl Fn(&T) -> f32) {
    items.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc.txt".to_string(),
            chunk_index: 0,
            text: "text".to_string(),
            start: 0,
            end: 4,
            hash: String::new(),
            metadata: ChunkMetadata::default(),
        }
    }

    #[test]
    fn relevance_prefers_rerank_score() {
        let mut sc = ScoredChunk::new("RC", chunk("a"), 0.6);
        assert_eq!(sc.relevance(), 0.6);
        sc.rerank_score = Some(2.5);
        sc.evidence_bonus = 0.5;
        assert_eq!(sc.relevance(), 2.5);
        assert_eq!(sc.final_score(), 3.0);
    }

    #[test]
    fn sort_desc_is_stable_on_ties() {
        let mut v = vec![(0, 0.5f32), (1, 0.9), (2, 0.5)];
        sort_desc_by(&mut v, |x| x.1);
        assert_eq!(v.iter().map(|x| x.0).collect::<Vec<_>>(), vec![1, 0, 2]);
    }

    #[test]
    fn same_stat_ignores_hash() {
        let a = FileSignature {
            path: "a.txt".into(),
            size: 3,
            modified_ms: 10,
            hash: "x".into(),
        };
        let mut b = a.clone();
        b.hash = "y".into();
        assert!(a.same_stat(&b));
        assert_ne!(a, b);
    }
}
