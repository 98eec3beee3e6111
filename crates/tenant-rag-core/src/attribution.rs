//! Source attribution for answers.
//!
//! Sources are derived from the chunks that made it into the context, never
//! stored. Chunks are grouped by canonical document identity so one
//! document cited through several chunks, or through both its original file
//! and an extracted-text sidecar (`report.pdf.txt` next to `report.pdf`),
//! appears once under the original name.

use serde::{Deserialize, Serialize};

use crate::models::{sort_desc_by, ChunkMetadata, ScoredChunk};

/// Extensions whose `.txt` sidecars are attributed to the original file.
const SIDECAR_ORIGINALS: &[&str] = &["pdf", "docx", "doc", "pptx", "xlsx", "html", "htm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Webpage,
}

/// One cited document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    /// File name, or URL for web-derived documents.
    pub source: String,
    pub kind: SourceKind,
    pub tenant: String,
    /// Highest relevance among the document's cited chunks.
    pub relevance: f32,
    #[serde(default)]
    pub pages: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// `report.pdf.txt` -> `Some("report.pdf")`; anything else -> `None`.
pub fn sidecar_original(path: &str) -> Option<&str> {
    let lower = path.to_ascii_lowercase();
    if !lower.ends_with(".txt") {
        return None;
    }
    let stem = &path[..path.len() - 4];
    let ext = stem.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase())?;
    if ext.contains('/') {
        return None;
    }
    SIDECAR_ORIGINALS.contains(&ext.as_str()).then_some(stem)
}

/// Canonical identity of the document a chunk came from.
pub fn canonical_identity(meta: &ChunkMetadata) -> String {
    if let Some(url) = &meta.source_url {
        return url.trim_end_matches('/').to_string();
    }
    sidecar_original(&meta.path)
        .unwrap_or(meta.path.as_str())
        .to_string()
}

/// Host part of a URL, without port or credentials.
pub fn url_domain(url: &str) -> Option<String> {
    let after_scheme = url.split_once("://").map(|(_, r)| r)?;
    let authority = after_scheme.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?.split(':').next()?;
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Derive the deduplicated source list for a set of context chunks.
pub fn attribute(chunks: &[ScoredChunk]) -> Vec<SourceAttribution> {
    let mut groups: Vec<(String, SourceAttribution)> = Vec::new();

    for sc in chunks {
        let meta = &sc.chunk.metadata;
        let identity = canonical_identity(meta);
        let relevance = sc.relevance();

        if let Some(entry) = groups
            .iter_mut()
            .find(|entry| entry.0 == identity && entry.1.tenant == sc.tenant)
        {
            let existing = &mut entry.1;
            existing.relevance = existing.relevance.max(relevance);
            for p in &meta.pages {
                if !existing.pages.contains(p) {
                    existing.pages.push(*p);
                }
            }
            existing.pages.sort_unstable();
            continue;
        }

        let attribution = match &meta.source_url {
            Some(url) => SourceAttribution {
                source: url.clone(),
                kind: SourceKind::Webpage,
                tenant: sc.tenant.clone(),
                relevance,
                pages: Vec::new(),
                domain: url_domain(url),
            },
            None => {
                let name = sidecar_original(&meta.filename).unwrap_or(meta.filename.as_str());
                let mut pages = meta.pages.clone();
                pages.sort_unstable();
                SourceAttribution {
                    source: name.to_string(),
                    kind: SourceKind::File,
                    tenant: sc.tenant.clone(),
                    relevance,
                    pages,
                    domain: None,
                }
            }
        };
        groups.push((identity, attribution));
    }

    let mut sources: Vec<SourceAttribution> = groups.into_iter().map(|(_, a)| a).collect();
    sort_desc_by(&mut sources, |a| a.relevance);
    sources
}
