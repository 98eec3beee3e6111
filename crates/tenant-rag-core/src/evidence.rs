//! Evidence guardrail: literal-token support checks and abstention.
//!
//! Semantic retrieval happily returns text that is *about* the right topic
//! without containing the specific fact asked for. When a query names a
//! literal (a quoted phrase, a number, a classification code), at least one
//! retained chunk must contain that literal, or the pipeline abstains rather
//! than letting the generator improvise.
//!
//! # Tokens
//!
//! | Kind | Source | Bonus per hit |
//! |------|--------|---------------|
//! | quoted | `"..."`, `“...”`, `'...'` | 0.4 |
//! | code | ICD-10, HCPCS, DRG, alphanumerics with a digit, configured patterns | 0.5 |
//! | numeric | words containing a digit (`204-B`, `3`, `j1234`) | 0.3 |
//!
//! The total bonus per chunk is capped at [`MAX_BONUS`]. Code patterns are
//! compiled case-insensitively, so `j1234` and `J1234` are the same code.
//! Numeric and code tokens must stand as whole words.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::models::{sort_desc_by, ScoredChunk};
use crate::text::{find_word, normalize_query};

pub const QUOTED_BONUS: f32 = 0.4;
pub const CODE_BONUS: f32 = 0.5;
pub const NUMERIC_BONUS: f32 = 0.3;
pub const MAX_BONUS: f32 = 2.0;

/// Built-in classification code patterns, matched case-insensitively.
pub const BUILTIN_CODE_PATTERNS: &[&str] = &[
    // ICD-10-CM
    r"\b[A-TV-Z][0-9]{2}(?:\.[A-Z0-9]{1,4})?\b",
    // HCPCS level II
    r"\b[A-V][0-9]{4}\b",
    // DRG / MS-DRG
    r"\b(?:MS-)?DRG\s*\d{3}\b",
    // alphanumeric identifiers containing a digit
    r"\b[A-Z][A-Z0-9]*[0-9][A-Z0-9]*(?:[-_.][A-Z0-9]+)*\b",
];

static QUOTED: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)"|“([^”]+)”|(?:^|[\s(])'([^']+)'"#).ok()
});
static NUMERIC: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b[a-z]*\d[\w\-.]*").ok());

/// Literal tokens found in a query, lowercased and deduplicated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceTokens {
    pub quoted: Vec<String>,
    pub codes: Vec<String>,
    pub numeric: Vec<String>,
}

impl EvidenceTokens {
    pub fn is_empty(&self) -> bool {
        self.quoted.is_empty() && self.codes.is_empty() && self.numeric.is_empty()
    }
}

/// Result of filtering a reranked candidate list.
#[derive(Debug, Clone)]
pub struct EvidenceOutcome {
    /// Surviving chunks, reordered by final score. Empty when abstaining.
    pub chunks: Vec<ScoredChunk>,
    /// True when the query named literals that no candidate contains.
    pub abstain: bool,
    pub tokens: EvidenceTokens,
}

/// Literal-evidence filter built once from configuration.
#[derive(Debug, Clone)]
pub struct EvidenceFilter {
    code_patterns: Vec<Regex>,
    drop_unmatched: bool,
}

impl EvidenceFilter {
    /// Build a filter from the built-in code patterns plus `extra_patterns`.
    pub fn new(extra_patterns: &[String], drop_unmatched: bool) -> Result<Self, regex::Error> {
        let mut code_patterns = Vec::new();
        for pattern in BUILTIN_CODE_PATTERNS
            .iter()
            .copied()
            .chain(extra_patterns.iter().map(String::as_str))
        {
            code_patterns.push(RegexBuilder::new(pattern).case_insensitive(true).build()?);
        }
        Ok(Self {
            code_patterns,
            drop_unmatched,
        })
    }

    /// Extract literal tokens from `query`.
    pub fn extract(&self, query: &str) -> EvidenceTokens {
        let mut seen = HashSet::new();
        let mut tokens = EvidenceTokens::default();

        if let Some(re) = QUOTED.as_ref() {
            for caps in re.captures_iter(query) {
                let phrase = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .or_else(|| caps.get(3))
                    .map(|m| normalize_query(m.as_str()))
                    .unwrap_or_default();
                if !phrase.is_empty() && seen.insert(phrase.clone()) {
                    tokens.quoted.push(phrase);
                }
            }
        }

        for re in &self.code_patterns {
            for m in re.find_iter(query) {
                let code = normalize_query(m.as_str());
                if seen.insert(code.clone()) {
                    tokens.codes.push(code);
                }
            }
        }

        if let Some(re) = NUMERIC.as_ref() {
            let lower = query.to_lowercase();
            for m in re.find_iter(&lower) {
                let num = m.as_str().trim_end_matches(['.', '-']).to_string();
                if !num.is_empty() && seen.insert(num.clone()) {
                    tokens.numeric.push(num);
                }
            }
        }

        tokens
    }

    /// Apply evidence bonuses to `chunks` and decide whether to abstain.
    pub fn filter(&self, query: &str, mut chunks: Vec<ScoredChunk>) -> EvidenceOutcome {
        let tokens = self.extract(query);
        if tokens.is_empty() {
            return EvidenceOutcome {
                chunks,
                abstain: false,
                tokens,
            };
        }

        let mut any_match = false;
        let mut matched = Vec::with_capacity(chunks.len());
        for sc in chunks.iter_mut() {
            let bonus = evidence_bonus(&tokens, &sc.chunk.text);
            sc.evidence_bonus = bonus;
            matched.push(bonus > 0.0);
            any_match |= bonus > 0.0;
        }

        if !any_match {
            return EvidenceOutcome {
                chunks: Vec::new(),
                abstain: true,
                tokens,
            };
        }

        if self.drop_unmatched {
            let mut keep = matched.into_iter();
            chunks.retain(|_| keep.next().unwrap_or(false));
        }
        sort_desc_by(&mut chunks, ScoredChunk::final_score);

        EvidenceOutcome {
            chunks,
            abstain: false,
            tokens,
        }
    }
}

/// Capped bonus for the literal tokens `text` contains.
pub fn evidence_bonus(tokens: &EvidenceTokens, text: &str) -> f32 {
    let haystack = normalize_query(text);
    let mut bonus = 0.0;
    for phrase in &tokens.quoted {
        if haystack.contains(phrase.as_str()) {
            bonus += QUOTED_BONUS;
        }
    }
    for code in &tokens.codes {
        if find_word(&haystack, code).is_some() {
            bonus += CODE_BONUS;
        }
    }
    for num in &tokens.numeric {
        if find_word(&haystack, num).is_some() {
            bonus += NUMERIC_BONUS;
        }
    }
    f32::min(bonus, MAX_BONUS)
}

/// Code-like tokens in `text`, for "only codes" answers.
///
/// Returns uppercase alphanumeric identifiers containing a digit, plus bare
/// 3-6 digit numbers, in first-appearance order.
pub fn extract_code_like_tokens(text: &str) -> Vec<String> {
    static CODE_LIKE: LazyLock<Option<Regex>> = LazyLock::new(|| {
        Regex::new(r"\b[A-Z0-9][A-Z0-9_.-]{1,19}\b|\b\d{3,6}\b").ok()
    });
    let Some(re) = CODE_LIKE.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', '-', '_']).to_string())
        .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};

    fn filter() -> EvidenceFilter {
        EvidenceFilter::new(&[], false).unwrap()
    }

    fn sc(id: &str, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk::new(
            "RC",
            Chunk {
                id: id.to_string(),
                document_id: format!("{}.txt", id),
                chunk_index: 0,
                text: text.to_string(),
                start: 0,
                end: text.chars().count(),
                hash: String::new(),
                metadata: ChunkMetadata::default(),
            },
            score,
        )
    }

    #[test]
    fn extracts_all_token_kinds() {
        let t = filter().extract(r#"Is "prior authorization" needed for J1234 under policy 204-B?"#);
        assert_eq!(t.quoted, vec!["prior authorization"]);
        assert!(t.codes.contains(&"j1234".to_string()));
        assert!(t.numeric.contains(&"204-b".to_string()));
    }

    #[test]
    fn apostrophes_are_not_quotes() {
        let t = filter().extract("what's the carrier's remote work rule");
        assert!(t.is_empty(), "{:?}", t);
    }

    #[test]
    fn no_tokens_passes_through() {
        let chunks = vec![sc("a", "remote work rules", 0.8)];
        let out = filter().filter("what are the remote work rules", chunks.clone());
        assert!(!out.abstain);
        assert_eq!(out.chunks, chunks);
    }

    #[test]
    fn matching_chunk_is_boosted_first() {
        let chunks = vec![
            sc("a", "General remote work overview.", 0.9),
            sc("b", "Policy 204-B covers remote work up to 3 days.", 0.7),
        ];
        let out = filter().filter("What does policy 204-B say about remote work?", chunks);
        assert!(!out.abstain);
        assert_eq!(out.chunks[0].chunk.id, "b");
        assert!((out.chunks[0].evidence_bonus - NUMERIC_BONUS).abs() < 1e-6);
        assert_eq!(out.chunks.len(), 2);
    }

    #[test]
    fn abstains_when_literal_absent() {
        let chunks = vec![sc("a", "Policy 204-A covers travel.", 0.9)];
        let out = filter().filter("What does policy 204-B say about remote work?", chunks);
        assert!(out.abstain);
        assert!(out.chunks.is_empty());
    }

    #[test]
    fn lowercase_codes_are_extracted() {
        let t = filter().extract("is j1234 covered under hcpcs");
        assert!(t.codes.contains(&"j1234".to_string()), "{:?}", t);

        let t = filter().extract("does a01.1 map to drg470");
        assert!(t.codes.contains(&"a01.1".to_string()), "{:?}", t);
        assert!(t.codes.contains(&"drg470".to_string()), "{:?}", t);
    }

    #[test]
    fn digits_inside_words_are_numeric_tokens() {
        let t = filter().extract("see form5b and x-204");
        assert!(t.codes.contains(&"form5b".to_string()) || t.numeric.contains(&"form5b".to_string()));
        assert!(t.numeric.contains(&"204".to_string()));
    }

    #[test]
    fn abstains_for_lowercase_code_absent_from_chunks() {
        let chunks = vec![
            sc("a", "HCPCS coverage overview for durable equipment.", 0.9),
            sc("b", "Code J1500 is covered with prior authorization.", 0.8),
        ];
        let out = filter().filter("is j1234 covered", chunks);
        assert!(out.abstain);
        assert!(out.chunks.is_empty());
    }

    #[test]
    fn lowercase_code_matches_uppercase_chunk() {
        let chunks = vec![
            sc("a", "HCPCS coverage overview.", 0.9),
            sc("b", "Code J1234 is covered with prior authorization.", 0.6),
        ];
        let out = filter().filter("is j1234 covered", chunks);
        assert!(!out.abstain);
        assert_eq!(out.chunks[0].chunk.id, "b");
    }

    #[test]
    fn numeric_tokens_match_whole_words_only() {
        let chunks = vec![sc("a", "Updated in 2023.", 0.9)];
        let out = filter().filter("list the 3 rules", chunks);
        assert!(out.abstain);
    }

    #[test]
    fn drop_unmatched_keeps_only_supporting_chunks() {
        let f = EvidenceFilter::new(&[], true).unwrap();
        let chunks = vec![
            sc("a", "no literal here", 0.9),
            sc("b", "see \"grace period\" rules", 0.5),
        ];
        let out = f.filter("what is the \"grace period\"", chunks);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].chunk.id, "b");
    }

    #[test]
    fn bonus_is_capped() {
        let tokens = EvidenceTokens {
            quoted: vec!["a b".into(); 10],
            codes: vec![],
            numeric: vec![],
        };
        assert_eq!(evidence_bonus(&tokens, "a b"), MAX_BONUS);
    }

    #[test]
    fn custom_patterns_are_used_and_validated() {
        let f = EvidenceFilter::new(&[r"\bFORM-[a-z]+\b".to_string()], false).unwrap();
        assert!(f.extract("where is FORM-abc").codes.contains(&"form-abc".to_string()));
        assert!(EvidenceFilter::new(&["(".to_string()], false).is_err());
    }

    #[test]
    fn code_like_tokens_need_digits() {
        let codes = extract_code_like_tokens("Use A01.1 or 99213; NOT ALLCAPS.");
        assert_eq!(codes, vec!["A01.1", "99213"]);
    }
}
