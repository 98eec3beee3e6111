//! Token-budgeted context assembly.
//!
//! Chunks are appended in the order given (descending relevance) as
//! self-describing blocks:
//!
//! ```text
//! [Source: handbook.pdf | tenant RC | pages 3-4]
//! <chunk text>
//! ```
//!
//! Inclusion stops at the first block that would push the running total
//! past the budget. Blocks are never split, and later (smaller) blocks are
//! not used to back-fill the remainder, so the included set is always a
//! prefix of the ranking.

use crate::models::ScoredChunk;

/// Counts tokens the way the generator's tokenizer would, or conservatively.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character-based approximation: `ceil(chars / chars_per_token)`.
///
/// With the default of 4.0 this matches the common English heuristic for
/// BPE tokenizers. Lower values over-count and are safer for code-heavy or
/// non-English corpora.
#[derive(Debug, Clone, Copy)]
pub struct CharApproxCounter {
    pub chars_per_token: f32,
}

impl Default for CharApproxCounter {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenCounter for CharApproxCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count() as f32;
        (chars / self.chars_per_token.max(f32::EPSILON)).ceil() as usize
    }
}

/// The assembled context and the chunks that made it in.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub text: String,
    pub included: Vec<ScoredChunk>,
    pub tokens: usize,
}

/// Header line identifying a chunk's origin inside the prompt.
pub fn block_header(sc: &ScoredChunk) -> String {
    let meta = &sc.chunk.metadata;
    let name = meta
        .source_url
        .as_deref()
        .unwrap_or(meta.filename.as_str());
    let mut header = format!("[Source: {} | tenant {}", name, sc.tenant);
    match (meta.pages.first(), meta.pages.last()) {
        (Some(first), Some(last)) if first == last => header.push_str(&format!(" | page {}", first)),
        (Some(first), Some(last)) => header.push_str(&format!(" | pages {}-{}", first, last)),
        _ => {}
    }
    header.push(']');
    header
}

fn render_block(sc: &ScoredChunk) -> String {
    format!("{}\n{}\n\n", block_header(sc), sc.chunk.text.trim())
}

/// Concatenate `chunks` until the next block would exceed `token_budget`.
///
/// Each block is costed on its own, including its trailing separator, so
/// the sum of block costs bounds the cost of the whole string.
pub fn assemble(
    chunks: &[ScoredChunk],
    token_budget: usize,
    counter: &dyn TokenCounter,
) -> AssembledContext {
    let mut out = AssembledContext::default();
    for sc in chunks {
        let block = render_block(sc);
        let cost = counter.count(&block);
        if out.tokens + cost > token_budget {
            break;
        }
        out.tokens += cost;
        out.text.push_str(&block);
        out.included.push(sc.clone());
    }
    let trimmed = out.text.trim_end().len();
    out.text.truncate(trimmed);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};
    use proptest::prelude::*;

    fn sc(id: usize, text: &str) -> ScoredChunk {
        ScoredChunk::new(
            "RC",
            Chunk {
                id: format!("c{}", id),
                document_id: "handbook.pdf".to_string(),
                chunk_index: id,
                text: text.to_string(),
                start: 0,
                end: 0,
                hash: String::new(),
                metadata: ChunkMetadata {
                    filename: "handbook.pdf".to_string(),
                    path: "handbook.pdf".to_string(),
                    pages: vec![3, 4],
                    source_url: None,
                },
            },
            1.0 - id as f32 * 0.01,
        )
    }

    fn ids(ctx: &AssembledContext) -> Vec<String> {
        ctx.included.iter().map(|c| c.chunk.id.clone()).collect()
    }

    #[test]
    fn header_shows_source_tenant_and_pages() {
        let chunk = sc(0, "body");
        assert_eq!(block_header(&chunk), "[Source: handbook.pdf | tenant RC | pages 3-4]");
    }

    #[test]
    fn stops_at_first_overflow_without_backfill() {
        let counter = CharApproxCounter::default();
        let chunks = vec![sc(0, &"a".repeat(40)), sc(1, &"b".repeat(400)), sc(2, "c")];
        let first_cost = counter.count(&render_block(&chunks[0]));
        let ctx = assemble(&chunks, first_cost + 30, &counter);
        assert_eq!(ids(&ctx), vec!["c0"]);
        assert!(ctx.tokens <= first_cost + 30);
    }

    #[test]
    fn zero_budget_includes_nothing() {
        let ctx = assemble(&[sc(0, "text")], 0, &CharApproxCounter::default());
        assert!(ctx.included.is_empty());
        assert!(ctx.text.is_empty());
    }

    #[test]
    fn chunks_are_never_split() {
        let counter = CharApproxCounter::default();
        let chunks = vec![sc(0, "alpha beta gamma"), sc(1, "delta epsilon")];
        let ctx = assemble(&chunks, 1000, &counter);
        assert!(ctx.text.contains("alpha beta gamma"));
        assert!(ctx.text.contains("delta epsilon"));
        assert!(ctx.text.find("alpha").unwrap() < ctx.text.find("delta").unwrap());
    }

    proptest! {
        #[test]
        fn prop_budget_respected_and_monotone(
            lens in proptest::collection::vec(1usize..300, 1..12),
            budget in 0usize..600,
            extra in 0usize..300,
            drop_at in 0usize..12,
        ) {
            let counter = CharApproxCounter::default();
            let chunks: Vec<ScoredChunk> =
                lens.iter().enumerate().map(|(i, n)| sc(i, &"x".repeat(*n))).collect();

            let ctx = assemble(&chunks, budget, &counter);
            prop_assert!(counter.count(&ctx.text) <= budget);
            prop_assert!(ctx.tokens <= budget);

            // A larger budget never loses chunks.
            let bigger = assemble(&chunks, budget + extra, &counter);
            prop_assert!(bigger.included.len() >= ctx.included.len());

            // Dropping a higher-ranked chunk and growing the budget keeps
            // every other previously included chunk.
            let drop_at = drop_at % chunks.len();
            let mut reduced = chunks.clone();
            let removed = reduced.remove(drop_at);
            let after = assemble(&reduced, budget + extra, &counter);
            let kept = ids(&after);
            for id in ids(&ctx) {
                if id != removed.chunk.id {
                    prop_assert!(kept.contains(&id));
                }
            }
        }
    }
}
