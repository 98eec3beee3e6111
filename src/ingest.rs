//! Ingestion pipeline: storage → extraction → chunking → embedding → index.
//!
//! Each pass scans the tenant's storage into a manifest, diffs it against
//! the manifest of the published generation, and builds a complete new
//! generation off to the side:
//!
//! - chunks of documents whose content hash is unchanged are carried over
//!   with their vectors;
//! - added and changed documents are extracted, chunked and embedded;
//! - removed documents simply do not appear.
//!
//! The staging generation is checked (dimensions, non-empty) and persisted
//! before it is published. Any failure leaves the previous generation
//! authoritative.
//!
//! Only one pass per tenant runs at a time. A request that finds a pass in
//! flight marks the tenant pending and returns; the running pass loops
//! once more before it finishes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use tenant_rag_core::chunk::{chunk_document, ChunkParams};
use tenant_rag_core::embedding::Embedder;
use tenant_rag_core::models::{Chunk, ChunkMetadata};

use crate::config::{Config, IngestConfig, TenantConfig};
use crate::error::{RagError, RebuildError};
use crate::extract::{extract, html_to_text};
use crate::index::{save_snapshot, IndexGeneration, IndexedChunk, TenantIndex};
use crate::manifest::{scan, ManifestDiff};
use crate::storage::{validate_tenant_id, DocumentStorage, StoredDocument};
use crate::tenants::{build_descriptor, TenantRegistry};

/// Longest file name derived from a URL, before the extension.
const MAX_URL_NAME: usize = 120;

/// What one `ingest` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub tenant: String,
    /// A new generation was published.
    pub rebuilt: bool,
    /// Another pass was already running and will pick up this request.
    pub coalesced: bool,
    /// Documents were added or removed, so the whole tenant was rebuilt.
    pub full_rebuild: bool,
    pub generation: u64,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub touched: usize,
    /// Documents that could not be read or extracted.
    pub failed: Vec<String>,
    /// Chunks in the published generation.
    pub chunks: usize,
}

impl IngestReport {
    fn new(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            ..Self::default()
        }
    }

    fn absorb(&mut self, pass: IngestReport) {
        self.rebuilt |= pass.rebuilt;
        self.full_rebuild |= pass.full_rebuild;
        self.generation = pass.generation;
        self.added += pass.added;
        self.changed += pass.changed;
        self.removed += pass.removed;
        self.touched += pass.touched;
        self.failed.extend(pass.failed);
        self.chunks = pass.chunks;
    }
}

pub struct IngestPipeline {
    storage: Arc<dyn DocumentStorage>,
    embedder: Arc<dyn Embedder>,
    chunk_params: ChunkParams,
    index_dir: PathBuf,
    tenant_configs: BTreeMap<String, TenantConfig>,
    descriptor_terms: usize,
    ingest: IngestConfig,
}

impl IngestPipeline {
    pub fn new(config: &Config, storage: Arc<dyn DocumentStorage>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            embedder,
            chunk_params: ChunkParams {
                chunk_size: config.chunking.chunk_size,
                chunk_overlap: config.chunking.chunk_overlap,
            },
            index_dir: config.storage.index_dir.clone(),
            tenant_configs: config.tenants.clone(),
            descriptor_terms: config.routing.descriptor_terms,
            ingest: config.ingest.clone(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    /// The empty generation a new tenant starts from.
    pub fn empty_generation(&self, tenant: &str) -> IndexGeneration {
        IndexGeneration::empty(tenant, self.embedder.model_name(), self.embedder.dims())
    }

    /// Bring `tenant`'s index in line with storage.
    ///
    /// `changed` names documents known to have changed; they are re-hashed
    /// even if their size and mtime look the same.
    pub fn ingest(
        &self,
        registry: &TenantRegistry,
        tenant: &str,
        changed: &[String],
    ) -> Result<IngestReport, RagError> {
        validate_tenant_id(tenant)?;
        if registry.get(tenant).is_none() && self.storage.list(tenant)?.is_empty() {
            return Err(RagError::UnknownTenant(tenant.to_string()));
        }
        let index = registry.get_or_insert_with(tenant, || self.empty_generation(tenant));

        let mut report = IngestReport::new(tenant);
        let Some(mut guard) = index.try_begin_rebuild() else {
            tracing::info!(tenant, "rebuild already running, request coalesced");
            report.coalesced = true;
            report.generation = index.current().generation;
            return Ok(report);
        };

        let mut changed = changed;
        loop {
            let pass = self.run_pass(&index, changed);
            drop(guard);
            report.absorb(pass?);
            changed = &[];

            if !index.take_pending() {
                break;
            }
            match index.try_begin_rebuild() {
                Some(next) => guard = next,
                None => break,
            }
        }
        Ok(report)
    }

    fn run_pass(&self, index: &TenantIndex, changed: &[String]) -> Result<IngestReport, RagError> {
        let tenant = index.tenant();
        let current = index.current();
        let mut report = IngestReport::new(tenant);
        report.generation = current.generation;
        report.chunks = current.chunk_count();

        let previous = current.manifest.without(changed.iter().map(String::as_str));
        let (live, documents) = scan(self.storage.as_ref(), tenant, &previous)?;

        let model_changed = current.generation > 0
            && (current.model != self.embedder.model_name() || current.dims != self.embedder.dims());
        let diff = if model_changed {
            tracing::info!(
                tenant,
                from = %current.model,
                to = self.embedder.model_name(),
                "embedding model changed, re-embedding all documents"
            );
            ManifestDiff {
                added: live.paths().map(str::to_string).collect(),
                removed: current
                    .manifest
                    .paths()
                    .filter(|p| !live.contains(p))
                    .map(str::to_string)
                    .collect(),
                ..ManifestDiff::default()
            }
        } else {
            current.manifest.diff(&live)
        };

        if diff.is_empty() {
            tracing::debug!(tenant, generation = current.generation, "index up to date");
            return Ok(report);
        }
        report.full_rebuild = diff.is_structural();
        report.added = diff.added.len();
        report.changed = diff.changed.len();
        report.removed = diff.removed.len();
        report.touched = diff.touched.len();

        let to_embed: HashSet<&str> = diff.to_embed().map(String::as_str).collect();
        let by_path: HashMap<&str, &StoredDocument> =
            documents.iter().map(|d| (d.path.as_str(), d)).collect();

        let mut entries: Vec<IndexedChunk> = current
            .entries
            .iter()
            .filter(|e| {
                let path = e.chunk.document_id.as_str();
                live.contains(path) && !to_embed.contains(path)
            })
            .cloned()
            .collect();

        let mut fresh: Vec<Chunk> = Vec::new();
        for path in diff.to_embed() {
            let Some(doc) = by_path.get(path.as_str()) else {
                continue;
            };
            match self.chunk_document(tenant, doc) {
                Ok(chunks) => fresh.extend(chunks),
                Err(e) => {
                    tracing::warn!(tenant, path = %path, error = %format!("{:#}", e), "skipping document");
                    report.failed.push(path.clone());
                }
            }
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder
                .embed_batch(&texts)
                .map_err(RebuildError::Embedding)?
        };
        if vectors.len() != fresh.len() {
            return Err(RebuildError::Embedding(tenant_rag_core::error::BackendError::malformed(
                self.embedder.model_name(),
                format!("expected {} vectors, got {}", fresh.len(), vectors.len()),
            ))
            .into());
        }
        let dims = self.embedder.dims();
        for v in &vectors {
            if v.len() != dims {
                return Err(RebuildError::DimensionMismatch {
                    expected: dims,
                    actual: v.len(),
                }
                .into());
            }
        }
        entries.extend(
            fresh
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexedChunk { chunk, vector }),
        );
        entries.sort_by(|a, b| {
            a.chunk
                .document_id
                .cmp(&b.chunk.document_id)
                .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        });

        if entries.is_empty() && !live.is_empty() {
            return Err(RebuildError::Empty {
                tenant: tenant.to_string(),
                documents: live.len(),
            }
            .into());
        }

        let descriptor = if entries.is_empty() {
            None
        } else {
            Some(
                build_descriptor(
                    tenant,
                    self.tenant_configs.get(tenant),
                    &entries,
                    self.descriptor_terms,
                    self.embedder.as_ref(),
                )
                .map_err(RebuildError::Embedding)?,
            )
        };

        let generation = IndexGeneration {
            tenant: tenant.to_string(),
            generation: current.generation + 1,
            built_at: chrono::Utc::now(),
            model: self.embedder.model_name().to_string(),
            dims,
            entries,
            manifest: live,
            descriptor,
        };
        save_snapshot(&self.index_dir, &generation)
            .map_err(|e| RebuildError::Persist(format!("{:#}", e)))?;

        report.rebuilt = true;
        report.generation = generation.generation;
        report.chunks = generation.chunk_count();
        tracing::info!(
            tenant,
            generation = report.generation,
            chunks = report.chunks,
            added = report.added,
            changed = report.changed,
            removed = report.removed,
            failed = report.failed.len(),
            full = report.full_rebuild,
            "published index generation"
        );
        index.publish(generation);
        Ok(report)
    }

    fn chunk_document(&self, tenant: &str, doc: &StoredDocument) -> anyhow::Result<Vec<Chunk>> {
        let bytes = self.storage.read(tenant, &doc.path)?;
        let extracted = extract(&doc.path, &bytes, self.ingest.cleaning)?;
        if extracted.is_blank() {
            tracing::debug!(tenant, path = %doc.path, "document has no text");
            return Ok(Vec::new());
        }
        let (text, page_starts) = extracted.joined();
        let filename = doc
            .path
            .rsplit('/')
            .next()
            .unwrap_or(doc.path.as_str())
            .to_string();
        let meta = ChunkMetadata {
            filename,
            path: doc.path.clone(),
            pages: Vec::new(),
            source_url: doc.source_url.clone(),
        };
        Ok(chunk_document(
            &doc.path,
            &text,
            &self.chunk_params,
            &page_starts,
            &meta,
        ))
    }

    /// Fetch `url`, store its text in `tenant`'s root, and ingest it.
    pub fn ingest_url(
        &self,
        registry: &TenantRegistry,
        tenant: &str,
        url: &str,
    ) -> Result<IngestReport, RagError> {
        validate_tenant_id(tenant)?;
        let parsed = check_url(url, &self.ingest.allowed_domains)?;
        let text = self.fetch_text(&parsed)?;

        let name = url_file_name(&parsed);
        self.storage
            .write(tenant, &name, text.as_bytes(), Some(parsed.as_str()))?;
        tracing::info!(tenant, url = %parsed, file = %name, bytes = text.len(), "stored web page");
        self.ingest(registry, tenant, &[name])
    }

    fn fetch_text(&self, url: &reqwest::Url) -> Result<String, RagError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.ingest.fetch_timeout_secs))
            .build()
            .map_err(|e| RagError::FetchRefused(e.to_string()))?;
        let resp = client
            .get(url.clone())
            .send()
            .map_err(|e| RagError::FetchRefused(format!("{}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RagError::FetchRefused(format!("{} returned HTTP {}", url, status)));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        let body = resp
            .text()
            .map_err(|e| RagError::FetchRefused(format!("{}: {}", url, e)))?;

        let text = if content_type.contains("html") {
            html_to_text(&body)
        } else if content_type.starts_with("text/") {
            body
        } else {
            return Err(RagError::FetchRefused(format!(
                "{} has unsupported content type {}",
                url, content_type
            )));
        };
        if text.trim().is_empty() {
            return Err(RagError::FetchRefused(format!("{} has no text content", url)));
        }
        Ok(text)
    }
}

/// Parse `url` and require an http(s) scheme and an allowed host.
///
/// A host is allowed when it equals an entry of `allowed` or is a subdomain
/// of one. An empty allow-list refuses everything.
pub fn check_url(url: &str, allowed: &[String]) -> Result<reqwest::Url, RagError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| RagError::FetchRefused(format!("{}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RagError::FetchRefused(format!(
            "unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| RagError::FetchRefused(format!("{} has no host", url)))?;
    let ok = allowed.iter().any(|domain| {
        let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
        !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
    });
    if !ok {
        return Err(RagError::FetchRefused(format!(
            "host '{}' is not in ingest.allowed_domains",
            host
        )));
    }
    Ok(parsed)
}

/// Storage file name for a fetched page: host and path, non-alphanumerics
/// folded to `_`, plus `.txt`.
pub fn url_file_name(url: &reqwest::Url) -> String {
    let raw = format!(
        "{}{}",
        url.host_str().unwrap_or("page"),
        url.path().trim_end_matches('/')
    );
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' };
        if c == '_' && name.ends_with('_') {
            continue;
        }
        name.push(c);
    }
    let name: String = name.trim_matches('_').chars().take(MAX_URL_NAME).collect();
    format!("{}.txt", if name.is_empty() { "page" } else { &name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::FsStorage;
    use std::fs;
    use tempfile::TempDir;
    use tenant_rag_core::embedding::HashingEmbedder;

    struct Fixture {
        _dir: TempDir,
        docs: PathBuf,
        pipeline: IngestPipeline,
        registry: TenantRegistry,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("documents");
        let mut config = Config::default();
        config.storage = StorageConfig {
            documents_dir: docs.clone(),
            index_dir: dir.path().join("index"),
            ..StorageConfig::default()
        };
        config.chunking.chunk_size = 200;
        config.chunking.chunk_overlap = 20;
        let storage = Arc::new(FsStorage::new(&config.storage).unwrap());
        let pipeline = IngestPipeline::new(&config, storage, Arc::new(HashingEmbedder::new(64)));
        Fixture {
            _dir: dir,
            docs,
            pipeline,
            registry: TenantRegistry::new(),
        }
    }

    fn write(f: &Fixture, tenant: &str, name: &str, text: &str) {
        let dir = f.docs.join(tenant);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn first_ingest_publishes_generation_one() {
        let f = fixture();
        write(&f, "RC", "policy.txt", "Policy 204-B covers remote work up to 3 days.");
        let report = f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        assert!(report.rebuilt);
        assert!(report.full_rebuild);
        assert_eq!(report.generation, 1);
        assert_eq!(report.added, 1);
        let current = f.registry.get("RC").unwrap().current();
        assert_eq!(current.chunk_count(), 1);
        assert!(current.descriptor.is_some());
        assert!(current.manifest.contains("policy.txt"));
    }

    #[test]
    fn unchanged_storage_is_a_no_op() {
        let f = fixture();
        write(&f, "RC", "policy.txt", "Policy text.");
        f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        let again = f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        assert!(!again.rebuilt);
        assert_eq!(again.generation, 1);
    }

    #[test]
    fn content_change_replaces_only_that_document() {
        let f = fixture();
        write(&f, "RC", "a.txt", "alpha document text");
        write(&f, "RC", "b.txt", "bravo document text");
        f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        let before = f.registry.get("RC").unwrap().current();
        let b_before = before
            .entries
            .iter()
            .find(|e| e.chunk.document_id == "b.txt")
            .unwrap()
            .clone();

        write(&f, "RC", "a.txt", "alpha document rewritten with new words");
        let report = f
            .pipeline
            .ingest(&f.registry, "RC", &["a.txt".to_string()])
            .unwrap();
        assert!(report.rebuilt);
        assert!(!report.full_rebuild);
        assert_eq!(report.changed, 1);

        let after = f.registry.get("RC").unwrap().current();
        assert_eq!(after.generation, 2);
        let a = after.entries.iter().find(|e| e.chunk.document_id == "a.txt").unwrap();
        assert!(a.chunk.text.contains("rewritten"));
        let b = after.entries.iter().find(|e| e.chunk.document_id == "b.txt").unwrap();
        assert_eq!(*b, b_before);
    }

    #[test]
    fn removal_drops_chunks_and_manifest_entry() {
        let f = fixture();
        write(&f, "RC", "a.txt", "alpha");
        write(&f, "RC", "b.txt", "bravo");
        f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        fs::remove_file(f.docs.join("RC").join("b.txt")).unwrap();
        let report = f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        assert_eq!(report.removed, 1);
        let current = f.registry.get("RC").unwrap().current();
        assert!(!current.manifest.contains("b.txt"));
        assert!(current.entries.iter().all(|e| e.chunk.document_id != "b.txt"));
    }

    #[test]
    fn empty_build_keeps_previous_generation() {
        let f = fixture();
        write(&f, "RC", "a.txt", "alpha");
        f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        // Whitespace only: extracts to nothing.
        write(&f, "RC", "a.txt", "   \n  ");
        let err = f.pipeline.ingest(&f.registry, "RC", &[]).unwrap_err();
        assert!(matches!(err, RagError::IndexRebuild(RebuildError::Empty { .. })));
        let current = f.registry.get("RC").unwrap().current();
        assert_eq!(current.generation, 1);
        assert!(current.entries[0].chunk.text.contains("alpha"));
    }

    #[test]
    fn unknown_tenant_without_documents_is_rejected() {
        let f = fixture();
        let err = f.pipeline.ingest(&f.registry, "NOPE", &[]).unwrap_err();
        assert!(matches!(err, RagError::UnknownTenant(_)));
        assert!(f.registry.is_empty());
    }

    #[test]
    fn pending_request_runs_another_pass() {
        let f = fixture();
        write(&f, "RC", "a.txt", "alpha");
        let index = f
            .registry
            .get_or_insert_with("RC", || f.pipeline.empty_generation("RC"));
        let held = index.try_begin_rebuild().unwrap();
        let coalesced = f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        assert!(coalesced.coalesced);
        assert!(!coalesced.rebuilt);
        drop(held);
        let report = f.pipeline.ingest(&f.registry, "RC", &[]).unwrap();
        assert!(report.rebuilt);
        assert!(!index.take_pending());
    }

    #[test]
    fn url_checks_and_names() {
        let allowed = vec!["cms.gov".to_string()];
        assert!(check_url("https://www.cms.gov/esmd", &allowed).is_ok());
        assert!(check_url("https://cms.gov/", &allowed).is_ok());
        assert!(matches!(
            check_url("https://evilcms.gov/", &allowed),
            Err(RagError::FetchRefused(_))
        ));
        assert!(check_url("ftp://cms.gov/file", &allowed).is_err());
        assert!(check_url("https://cms.gov/", &[]).is_err());

        let url = reqwest::Url::parse("https://www.cms.gov/esmd/overview/").unwrap();
        assert_eq!(url_file_name(&url), "www_cms_gov_esmd_overview.txt");
    }
}
