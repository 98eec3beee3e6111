//! Similarity retrieval over one or several tenant indexes.
//!
//! The query is embedded once (optionally behind a keyword preamble) and
//! searched against each routed tenant's current generation. Candidates
//! below the similarity cutoff are dropped even when they rank in the top
//! `k`. For a fan-out, the per-tenant lists are unioned and ordered by raw
//! similarity.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tenant_rag_core::embedding::Embedder;
use tenant_rag_core::error::BackendError;
use tenant_rag_core::models::{sort_desc_by, ScoredChunk};
use tenant_rag_core::text::with_keyword_preamble;

use crate::config::RetrievalConfig;
use crate::index::{IndexGeneration, TenantIndex};

/// Candidates plus the generations they were read from.
///
/// Later stages resolve file signatures against these same generations, so
/// a rebuild published mid-query cannot mix manifests.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub chunks: Vec<ScoredChunk>,
    pub generations: BTreeMap<String, Arc<IndexGeneration>>,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, config: RetrievalConfig) -> Self {
        Self { embedder, config }
    }

    /// The string actually embedded for `query`.
    pub fn retrieval_text(&self, query: &str) -> String {
        if self.config.keyword_preamble {
            with_keyword_preamble(query)
        } else {
            query.to_string()
        }
    }

    pub fn retrieve(
        &self,
        indexes: &[Arc<TenantIndex>],
        query: &str,
    ) -> Result<Retrieval, BackendError> {
        let vector = self.embedder.embed(&self.retrieval_text(query))?;

        let mut retrieval = Retrieval::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for index in indexes {
            let generation = index.current();
            let hits = generation.search(&vector, self.config.top_k);
            let total = hits.len();
            let kept: Vec<ScoredChunk> = hits
                .into_iter()
                .filter(|h| h.similarity >= self.config.similarity_cutoff)
                .filter(|h| seen.insert((h.tenant.clone(), h.chunk.id.clone())))
                .collect();
            tracing::debug!(
                tenant = index.tenant(),
                generation = generation.generation,
                hits = total,
                kept = kept.len(),
                "retrieved"
            );
            retrieval.chunks.extend(kept);
            retrieval
                .generations
                .insert(index.tenant().to_string(), generation);
        }
        sort_desc_by(&mut retrieval.chunks, |c| c.similarity);
        Ok(retrieval)
    }
}
