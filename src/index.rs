//! Per-tenant vector index with generation swap.
//!
//! A [`TenantIndex`] publishes immutable [`IndexGeneration`]s through a
//! single `RwLock<Arc<_>>`. Readers clone the `Arc` and search it without
//! holding the lock, so a rebuild never blocks queries and a query never
//! sees chunks from two generations. Rebuilds build a complete generation
//! off to the side, persist it, then swap the pointer.
//!
//! Rebuilds of one tenant are serialized by a rebuild lock. A request that
//! arrives while a rebuild is running sets a pending flag instead of
//! waiting; the running rebuild loops once more before releasing (a
//! queue of one).
//!
//! # Snapshot format
//!
//! Each generation is persisted as `<index_dir>/<tenant>/index.json`.
//! Vectors are base64 strings of little-endian `f32` bytes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};

use tenant_rag_core::embedding::cosine_similarity;
use tenant_rag_core::models::{Chunk, ScoredChunk};

use crate::manifest::Manifest;
use crate::storage::write_atomic;

const SNAPSHOT_FILE: &str = "index.json";

/// A chunk and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    #[serde(with = "vector_b64")]
    pub vector: Vec<f32>,
}

/// Routing summary of a tenant's corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantDescriptor {
    pub text: String,
    #[serde(with = "vector_b64")]
    pub vector: Vec<f32>,
    pub terms: BTreeSet<String>,
}

/// One immutable, fully built state of a tenant index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexGeneration {
    pub tenant: String,
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    pub model: String,
    pub dims: usize,
    pub entries: Vec<IndexedChunk>,
    pub manifest: Manifest,
    #[serde(default)]
    pub descriptor: Option<TenantDescriptor>,
}

impl IndexGeneration {
    /// Generation 0: no documents, no descriptor.
    pub fn empty(tenant: &str, model: &str, dims: usize) -> Self {
        Self {
            tenant: tenant.to_string(),
            generation: 0,
            built_at: Utc::now(),
            model: model.to_string(),
            dims,
            entries: Vec::new(),
            manifest: Manifest::default(),
            descriptor: None,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.entries.len()
    }

    /// Exact cosine search: the `k` best chunks, ties broken by chunk id.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredChunk> {
        if query.len() != self.dims {
            tracing::warn!(
                tenant = %self.tenant,
                expected = self.dims,
                actual = query.len(),
                "query vector dimension does not match index"
            );
            return Vec::new();
        }
        let mut scored: Vec<(f32, &IndexedChunk)> = self
            .entries
            .iter()
            .map(|e| (cosine_similarity(query, &e.vector), e))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.chunk.id.cmp(&b.1.chunk.id))
        });
        scored
            .into_iter()
            .take(k)
            .map(|(score, e)| ScoredChunk::new(self.tenant.clone(), e.chunk.clone(), score))
            .collect()
    }
}

/// Live index of one tenant.
pub struct TenantIndex {
    tenant: String,
    current: RwLock<Arc<IndexGeneration>>,
    rebuild_lock: Mutex<()>,
    pending: AtomicBool,
}

impl TenantIndex {
    pub fn new(generation: IndexGeneration) -> Self {
        Self {
            tenant: generation.tenant.clone(),
            current: RwLock::new(Arc::new(generation)),
            rebuild_lock: Mutex::new(()),
            pending: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The published generation. Hold on to it for a consistent view.
    pub fn current(&self) -> Arc<IndexGeneration> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredChunk> {
        self.current().search(query, k)
    }

    /// Atomically replace the published generation.
    pub fn publish(&self, generation: IndexGeneration) {
        let generation = Arc::new(generation);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = generation;
    }

    /// Take the rebuild lock, or mark a rebuild as pending and return `None`
    /// when another thread holds it.
    pub fn try_begin_rebuild(&self) -> Option<MutexGuard<'_, ()>> {
        self.pending.store(true, Ordering::SeqCst);
        match self.rebuild_lock.try_lock() {
            Ok(guard) => {
                self.pending.store(false, Ordering::SeqCst);
                Some(guard)
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                self.pending.store(false, Ordering::SeqCst);
                Some(poisoned.into_inner())
            }
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Whether a rebuild was requested while the lock was held. Clears the flag.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

pub fn snapshot_path(index_dir: &Path, tenant: &str) -> PathBuf {
    index_dir.join(tenant).join(SNAPSHOT_FILE)
}

/// Persist `generation` via a staging file and rename.
pub fn save_snapshot(index_dir: &Path, generation: &IndexGeneration) -> Result<()> {
    let dir = index_dir.join(&generation.tenant);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create index dir: {}", dir.display()))?;
    let json = serde_json::to_vec(generation)?;
    write_atomic(&dir, SNAPSHOT_FILE, &json)
}

/// Load a tenant's snapshot; `Ok(None)` if there is none.
pub fn load_snapshot(index_dir: &Path, tenant: &str) -> Result<Option<IndexGeneration>> {
    let path = snapshot_path(index_dir, tenant);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let generation = serde_json::from_slice(&raw)
        .with_context(|| format!("Corrupt index snapshot: {}", path.display()))?;
    Ok(Some(generation))
}

pub fn remove_snapshot(index_dir: &Path, tenant: &str) -> Result<()> {
    let dir = index_dir.join(tenant);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

mod vector_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};
    use tenant_rag_core::embedding::{blob_to_vec, vec_to_blob};

    pub fn serialize<S: Serializer>(v: &[f32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(vec_to_blob(v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(serde::de::Error::custom("vector byte length not a multiple of 4"));
        }
        Ok(blob_to_vec(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_rag_core::models::ChunkMetadata;

    fn entry(id: &str, vector: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            chunk: Chunk {
                id: id.to_string(),
                document_id: "doc.txt".to_string(),
                chunk_index: 0,
                text: format!("text of {}", id),
                start: 0,
                end: 0,
                hash: String::new(),
                metadata: ChunkMetadata::default(),
            },
            vector,
        }
    }

    fn generation(n: u64, entries: Vec<IndexedChunk>) -> IndexGeneration {
        IndexGeneration {
            generation: n,
            entries,
            ..IndexGeneration::empty("RC", "test", 2)
        }
    }

    #[test]
    fn search_ranks_by_cosine_with_id_tiebreak() {
        let g = generation(
            1,
            vec![
                entry("b", vec![1.0, 0.0]),
                entry("a", vec![1.0, 0.0]),
                entry("c", vec![0.0, 1.0]),
            ],
        );
        let hits = g.search(&[1.0, 0.0], 2);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(hits[0].tenant, "RC");
    }

    #[test]
    fn wrong_dimension_query_finds_nothing() {
        let g = generation(1, vec![entry("a", vec![1.0, 0.0])]);
        assert!(g.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn publish_swaps_whole_generation() {
        let index = TenantIndex::new(generation(1, vec![entry("old", vec![1.0, 0.0])]));
        let before = index.current();
        index.publish(generation(2, vec![entry("new", vec![1.0, 0.0])]));
        assert_eq!(before.generation, 1);
        assert_eq!(before.entries[0].chunk.id, "old");
        assert_eq!(index.current().generation, 2);
        assert_eq!(index.search(&[1.0, 0.0], 5)[0].chunk.id, "new");
    }

    #[test]
    fn second_rebuild_request_is_coalesced() {
        let index = TenantIndex::new(generation(0, Vec::new()));
        let guard = index.try_begin_rebuild();
        assert!(guard.is_some());
        assert!(!index.take_pending());
        assert!(index.try_begin_rebuild().is_none());
        drop(guard);
        assert!(index.take_pending());
        assert!(index.try_begin_rebuild().is_some());
    }

    #[test]
    fn snapshot_round_trip_preserves_vectors() {
        let dir = tempfile::TempDir::new().unwrap();
        let g = generation(3, vec![entry("a", vec![0.25, -1.5])]);
        save_snapshot(dir.path(), &g).unwrap();
        let loaded = load_snapshot(dir.path(), "RC").unwrap().unwrap();
        assert_eq!(loaded.generation, 3);
        assert_eq!(loaded.entries, g.entries);
        assert!(load_snapshot(dir.path(), "NONE").unwrap().is_none());
        remove_snapshot(dir.path(), "RC").unwrap();
        assert!(load_snapshot(dir.path(), "RC").unwrap().is_none());
    }
}
