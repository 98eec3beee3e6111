//! Fixed-size overlapping text chunker.
//!
//! Splits document text into spans of at most `chunk_size` characters,
//! with consecutive spans sharing exactly `chunk_overlap` characters.
//! Removing the first `chunk_overlap` characters of every span after the
//! first and concatenating reproduces the input exactly, so trailing
//! content shorter than one full chunk is never lost.
//!
//! # Algorithm
//!
//! 1. Work in character units (not bytes), so multi-byte text never
//!    splits inside a code point.
//! 2. A span ends `chunk_size` characters after its start, or at the end
//!    of the text.
//! 3. A span that does not reach the end of the text is pulled back to the
//!    nearest whitespace within its last eighth, keeping words intact. The
//!    pull-back never shrinks a span to `chunk_overlap` characters or fewer,
//!    so every step makes progress.
//! 4. The next span starts `chunk_overlap` characters before the previous end.
//!
//! Each chunk gets a deterministic UUID (v5) derived from its document id,
//! ordinal and content hash, so re-chunking identical text yields identical ids.
//!
//! # Example
//!
//! ```rust
//! use tenant_rag_core::chunk::{chunk_spans, ChunkParams};
//!
//! let params = ChunkParams { chunk_size: 10, chunk_overlap: 3 };
//! let spans = chunk_spans("abcdefghijklmnop", &params);
//! assert_eq!(spans.len(), 2);
//! assert_eq!((spans[1].start, spans[1].end), (7, 16));
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, ChunkMetadata};

/// Chunk size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            chunk_overlap: 100,
        }
    }
}

/// A half-open character range `[start, end)` within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Compute span boundaries for `text`.
///
/// Returns an empty vector for empty text. `chunk_overlap` is clamped to
/// `chunk_size - 1`; a zero `chunk_size` is treated as 1.
pub fn chunk_spans(text: &str, params: &ChunkParams) -> Vec<Span> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let size = params.chunk_size.max(1);
    let overlap = params.chunk_overlap.min(size - 1);

    let mut spans = Vec::new();
    let mut start = 0usize;
    while start < n {
        let hard_end = (start + size).min(n);
        let end = if hard_end < n {
            snap_to_whitespace(&chars, start + overlap + 1, hard_end, size / 8)
        } else {
            hard_end
        };
        spans.push(Span { start, end });
        if end >= n {
            break;
        }
        start = end - overlap;
    }
    spans
}

/// Move `hard_end` back to just after a whitespace character, searching at
/// most `window` characters and never below `floor`.
fn snap_to_whitespace(chars: &[char], floor: usize, hard_end: usize, window: usize) -> usize {
    let lowest = hard_end.saturating_sub(window).max(floor);
    let mut p = hard_end;
    while p > lowest {
        if chars[p - 1].is_whitespace() {
            return p;
        }
        p -= 1;
    }
    hard_end
}

/// Split `text` into [`Chunk`]s for `document_id`.
///
/// `page_starts` holds the character offset at which each page begins
/// (first entry 0); pass an empty slice for unpaginated text. Every chunk
/// inherits `metadata`, with `pages` filled from the span's page overlap.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    params: &ChunkParams,
    page_starts: &[usize],
    metadata: &ChunkMetadata,
) -> Vec<Chunk> {
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    chunk_spans(text, params)
        .into_iter()
        .enumerate()
        .map(|(index, span)| {
            let body = &text[byte_at[span.start]..byte_at[span.end]];
            let mut meta = metadata.clone();
            meta.pages = pages_for_span(page_starts, span.start, span.end);
            make_chunk(document_id, index, body, span, meta)
        })
        .collect()
}

/// 1-based page numbers whose ranges intersect `[start, end)`.
pub fn pages_for_span(page_starts: &[usize], start: usize, end: usize) -> Vec<u32> {
    let mut pages = Vec::new();
    for (i, &page_start) in page_starts.iter().enumerate() {
        let page_end = page_starts.get(i + 1).copied().unwrap_or(usize::MAX);
        if page_start < end && start < page_end {
            pages.push(i as u32 + 1);
        }
    }
    pages
}

/// SHA-256 hex digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn make_chunk(
    document_id: &str,
    index: usize,
    text: &str,
    span: Span,
    metadata: ChunkMetadata,
) -> Chunk {
    let hash = content_hash(text);
    let seed = format!("{}#{}#{}", document_id, index, hash);
    Chunk {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        start: span.start,
        end: span.end,
        hash,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reassemble(chunks: &[Chunk], overlap: usize) -> String {
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&c.text);
            } else {
                out.extend(c.text.chars().skip(overlap));
            }
        }
        out
    }

    fn params(size: usize, overlap: usize) -> ChunkParams {
        ChunkParams {
            chunk_size: size,
            chunk_overlap: overlap,
        }
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        let chunks = chunk_document("a.txt", "", &params(10, 2), &[], &ChunkMetadata::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_document(
            "a.txt",
            "Hello, world!",
            &ChunkParams::default(),
            &[],
            &ChunkMetadata::default(),
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn test_trailing_fragment_kept() {
        let text = "x".repeat(25);
        let spans = chunk_spans(&text, &params(10, 2));
        assert_eq!(spans.last().map(|s| s.end), Some(25));
        for s in &spans {
            assert!(s.end - s.start <= 10);
        }
    }

    #[test]
    fn test_consecutive_spans_overlap_exactly() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let spans = chunk_spans(text, &params(16, 4));
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end - pair[1].start, 4);
        }
    }

    #[test]
    fn test_prefers_whitespace_boundaries() {
        let text = "aaaaaaa bbbbbbb ccccccc ddddddd";
        let chunks = chunk_document("a.txt", text, &params(16, 2), &[], &ChunkMetadata::default());
        assert!(chunks[0].text.ends_with(' '), "got {:?}", chunks[0].text);
    }

    #[test]
    fn test_multibyte_text_reassembles() {
        let text = "┌──────────────────┐\n│ Hello wörld ✓    │\n└──────────────────┘";
        let chunks = chunk_document("a.txt", text, &params(7, 3), &[], &ChunkMetadata::default());
        assert_eq!(reassemble(&chunks, 3), text);
    }

    #[test]
    fn test_deterministic_ids() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = chunk_document("d", text, &params(8, 2), &[], &ChunkMetadata::default());
        let b = chunk_document("d", text, &params(8, 2), &[], &ChunkMetadata::default());
        assert_eq!(a, b);
        let other = chunk_document("e", text, &params(8, 2), &[], &ChunkMetadata::default());
        assert_ne!(a[0].id, other[0].id);
    }

    #[test]
    fn test_pages_assigned_from_offsets() {
        // page 1 = chars 0..10, page 2 = chars 10..
        let text = "0123456789abcdefghij";
        let chunks = chunk_document("p.pdf", text, &params(8, 2), &[0, 10], &ChunkMetadata::default());
        assert_eq!(chunks[0].metadata.pages, vec![1]);
        assert!(chunks.iter().any(|c| c.metadata.pages == vec![1, 2]));
        assert_eq!(chunks.last().map(|c| c.metadata.pages.clone()), Some(vec![2]));
    }

    #[test]
    fn test_overlap_clamped_below_size() {
        let spans = chunk_spans("abcdefghij", &params(3, 10));
        assert_eq!(spans.last().map(|s| s.end), Some(10));
        for pair in spans.windows(2) {
            assert!(pair[1].start > pair[0].start);
        }
    }

    proptest! {
        #[test]
        fn prop_reassembly_loses_nothing(
            text in "[a-z \\n\u{e9}\u{2500}]{0,400}",
            size in 1usize..64,
            overlap in 0usize..64,
        ) {
            let p = params(size, overlap);
            let effective = overlap.min(size - 1);
            let chunks = chunk_document("d", &text, &p, &[], &ChunkMetadata::default());
            prop_assert_eq!(reassemble(&chunks, effective), text.clone());
            for c in &chunks {
                prop_assert!(c.text.chars().count() <= size);
            }
        }
    }
}
