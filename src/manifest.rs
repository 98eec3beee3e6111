//! Per-tenant manifests and change detection.
//!
//! A [`Manifest`] maps each document path to its [`FileSignature`]. Comparing
//! the manifest stored with the live index against a fresh [`scan`] of
//! storage tells the ingestion pipeline what to do:
//!
//! | Diff | Action |
//! |------|--------|
//! | any added or removed path | full rebuild (unchanged documents reuse their vectors) |
//! | content changes only | replace those documents' chunks |
//! | mtime changed, same hash | republish the manifest, no re-embedding |
//! | nothing | no-op |

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tenant_rag_core::models::FileSignature;

use crate::storage::{DocumentStorage, StoredDocument};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    entries: BTreeMap<String, FileSignature>,
}

impl Manifest {
    pub fn from_signatures(signatures: impl IntoIterator<Item = FileSignature>) -> Self {
        Self {
            entries: signatures
                .into_iter()
                .map(|s| (s.path.clone(), s))
                .collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileSignature> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn signatures(&self) -> impl Iterator<Item = &FileSignature> {
        self.entries.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Copy without `paths`; a scan against it re-hashes those documents.
    pub fn without<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Manifest {
        let mut out = self.clone();
        for path in paths {
            out.entries.remove(path);
        }
        out
    }

    /// What changed going from `self` (indexed) to `live` (storage).
    pub fn diff(&self, live: &Manifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, sig) in &live.entries {
            match self.entries.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old.hash != sig.hash => diff.changed.push(path.clone()),
                Some(old) if old != sig => diff.touched.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.entries.keys() {
            if !live.entries.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }
        diff
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Content hash differs.
    pub changed: Vec<String>,
    /// Size or mtime differs but content is identical.
    pub touched: Vec<String>,
}

impl ManifestDiff {
    /// Nothing to re-embed and nothing to republish.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.touched.is_empty()
    }

    /// Any add or remove calls for a whole-tenant rebuild.
    pub fn is_structural(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Paths whose chunks must be (re)generated.
    pub fn to_embed(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.changed.iter())
    }
}

/// Current storage state of `tenant` as a manifest.
///
/// Hashes are reused from `previous` when size and mtime are unchanged, so
/// an idle corpus is scanned without reading file contents. Documents that
/// vanish or fail to read between listing and hashing are left out.
pub fn scan(
    storage: &dyn DocumentStorage,
    tenant: &str,
    previous: &Manifest,
) -> Result<(Manifest, Vec<StoredDocument>)> {
    let listed = storage.list(tenant)?;
    let mut signatures = Vec::with_capacity(listed.len());
    let mut documents = Vec::with_capacity(listed.len());

    for doc in listed {
        let stat = doc.signature(String::new());
        let hash = match previous.get(&doc.path) {
            Some(prev) if prev.same_stat(&stat) => prev.hash.clone(),
            _ => match storage.hash(tenant, &doc.path) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(tenant, path = %doc.path, error = %e, "skipping unreadable document");
                    continue;
                }
            },
        };
        signatures.push(doc.signature(hash));
        documents.push(doc);
    }

    Ok((Manifest::from_signatures(signatures), documents))
}
