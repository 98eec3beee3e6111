//! Tenant registry and routing descriptors.
//!
//! The registry maps tenant ids to their live [`TenantIndex`]. Tenants are
//! added when their first document is ingested (or a snapshot is found at
//! startup) and leave only through explicit removal.
//!
//! A tenant's descriptor is rebuilt with every generation: a short text
//! naming the tenant, its aliases, its files and its most frequent terms,
//! embedded once, plus the term set used for keyword overlap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use tenant_rag_core::embedding::Embedder;
use tenant_rag_core::error::BackendError;
use tenant_rag_core::text::{routing_terms, top_terms, tokenize};

use crate::config::TenantConfig;
use crate::index::{IndexGeneration, IndexedChunk, TenantDescriptor, TenantIndex};

/// File names listed in a descriptor.
const DESCRIPTOR_MAX_FILES: usize = 30;

#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<BTreeMap<String, Arc<TenantIndex>>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: &str) -> Option<Arc<TenantIndex>> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    /// Existing index for `tenant`, or a new one starting from `init()`.
    pub fn get_or_insert_with(
        &self,
        tenant: &str,
        init: impl FnOnce() -> IndexGeneration,
    ) -> Arc<TenantIndex> {
        if let Some(index) = self.get(tenant) {
            return index;
        }
        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            tenants
                .entry(tenant.to_string())
                .or_insert_with(|| Arc::new(TenantIndex::new(init()))),
        )
    }

    pub fn insert(&self, index: TenantIndex) -> Arc<TenantIndex> {
        let index = Arc::new(index);
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.tenant().to_string(), Arc::clone(&index));
        index
    }

    pub fn remove(&self, tenant: &str) -> Option<Arc<TenantIndex>> {
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tenant)
    }

    /// Sorted tenant ids.
    pub fn ids(&self) -> Vec<String> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of every tenant's index, sorted by id.
    pub fn all(&self) -> Vec<Arc<TenantIndex>> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Tenants with at least one indexed chunk.
    pub fn queryable(&self) -> Vec<Arc<TenantIndex>> {
        self.all()
            .into_iter()
            .filter(|t| t.current().chunk_count() > 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Descriptor text for a tenant's corpus.
pub fn descriptor_text(
    tenant: &str,
    config: Option<&TenantConfig>,
    file_names: &[String],
    topics: &[String],
) -> String {
    let mut text = format!("Tenant: {}.", tenant);
    if let Some(tc) = config {
        if !tc.aliases.is_empty() {
            text.push_str(&format!(" Aliases: {}.", tc.aliases.join(", ")));
        }
        if let Some(description) = &tc.description {
            text.push_str(&format!(" {}", description.trim()));
        }
    }
    if !file_names.is_empty() {
        let shown: Vec<&str> = file_names
            .iter()
            .take(DESCRIPTOR_MAX_FILES)
            .map(String::as_str)
            .collect();
        text.push_str(&format!(" Files: {}.", shown.join(", ")));
    }
    if !topics.is_empty() {
        text.push_str(&format!(" Topics: {}.", topics.join(", ")));
    }
    text
}

/// Build the routing descriptor for a generation's chunks.
pub fn build_descriptor(
    tenant: &str,
    config: Option<&TenantConfig>,
    entries: &[IndexedChunk],
    max_terms: usize,
    embedder: &dyn Embedder,
) -> Result<TenantDescriptor, BackendError> {
    let file_names: Vec<String> = entries
        .iter()
        .map(|e| e.chunk.metadata.filename.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let topics = top_terms(entries.iter().map(|e| e.chunk.text.as_str()), max_terms);

    let mut terms: BTreeSet<String> = BTreeSet::new();
    terms.extend(tokenize(tenant));
    if let Some(tc) = config {
        for alias in &tc.aliases {
            terms.extend(routing_terms(alias));
        }
    }
    for name in &file_names {
        terms.extend(routing_terms(name).into_iter().filter(|t| t.len() >= 3));
    }
    terms.extend(topics.iter().cloned());

    let text = descriptor_text(tenant, config, &file_names, &topics);
    let vector = embedder.embed(&text)?;
    Ok(TenantDescriptor {
        text,
        vector,
        terms,
    })
}
