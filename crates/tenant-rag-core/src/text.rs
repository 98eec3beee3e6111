//! Query and corpus text helpers: tokenizing, stopwords, normalization.

use std::collections::{BTreeMap, HashSet};

/// Words that carry no routing or retrieval signal.
pub const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "for", "with", "that", "this", "from", "your", "about",
    "have", "has", "had", "what", "which", "when", "where", "who", "why", "will", "would",
    "there", "their", "into", "those", "these", "been", "being", "were", "was", "are", "is", "be",
    "how", "make", "made", "like", "such", "use", "uses", "used", "using", "can", "could", "you",
    "please", "tell", "more", "info", "step", "steps", "process", "guide", "guidance", "policy",
    "policies", "onboarding", "onboard", "form", "forms", "do", "does", "did", "of", "to", "in",
    "on", "at", "by", "it", "its", "as", "if", "me", "my", "we", "our", "us", "i", "say", "says",
    "should", "any", "all", "some", "get", "need", "want", "know", "explain", "describe",
];

/// Terms that are always significant in this domain, regardless of length.
pub const DOMAIN_TERMS: &[&str] = &[
    "esmd", "fhir", "cms", "hhs", "extension", "extensions", "implementation", "lob", "medicare",
    "medicaid", "marketplace", "icd", "cpt", "hcpcs", "drg", "npi",
];

const MAX_PREAMBLE_TERMS: usize = 8;

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

pub fn is_domain_term(token: &str) -> bool {
    DOMAIN_TERMS.contains(&token)
}

/// Lowercased alphanumeric runs of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Cache-key normalization: trimmed, lowercased, internal whitespace collapsed.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Routing view of a query: tokens with stopwords and single letters removed.
pub fn routing_terms(query: &str) -> Vec<String> {
    tokenize(query)
        .into_iter()
        .filter(|t| !is_stopword(t) && (t.chars().count() > 1 || t.chars().all(|c| c.is_ascii_digit())))
        .collect()
}

/// Domain-significant tokens of `query`, in first-appearance order.
///
/// A token qualifies if it is a domain term, contains a digit, or is a
/// non-stopword of four or more characters.
pub fn significant_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| {
            is_domain_term(t)
                || t.chars().any(|c| c.is_ascii_digit())
                || (!is_stopword(t) && t.chars().count() >= 4)
        })
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_PREAMBLE_TERMS)
        .collect()
}

/// Prefix the query with a keyword preamble to bias nearest-neighbor search.
///
/// Only the retrieval embedding sees this string; the generator always
/// receives the original query.
pub fn with_keyword_preamble(query: &str) -> String {
    let terms = significant_terms(query);
    if terms.is_empty() {
        return query.to_string();
    }
    format!("Keywords: {}. {}", terms.join(", "), query)
}

/// Byte offset of the first occurrence of `needle` in `haystack` that is
/// not glued to an alphanumeric character on either side.
///
/// Both arguments are expected to be lowercased already. `"rc"` matches in
/// `"ask rc about"` but not in `"source"`.
pub fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(needle) {
        let at = from + rel;
        let end = at + needle.len();
        let before_ok = haystack[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(at);
        }
        from = at + haystack[at..].chars().next().map_or(1, |c| c.len_utf8());
    }
    None
}

/// The `n` most frequent non-stopword tokens across `texts`.
///
/// Tokens shorter than three characters and pure numbers are skipped.
/// Ties break alphabetically so the result is deterministic.
pub fn top_terms<'a>(texts: impl IntoIterator<Item = &'a str>, n: usize) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for text in texts {
        for token in tokenize(text) {
            if token.chars().count() < 3
                || is_stopword(&token)
                || token.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(t, _)| t).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_query_ignores_case_and_spacing() {
        assert_eq!(
            normalize_query("  What IS   policy\t204-B? "),
            normalize_query("what is policy 204-b?")
        );
    }

    #[test]
    fn routing_terms_drop_stopwords() {
        assert_eq!(
            routing_terms("What is the remote work policy for RC?"),
            vec!["remote", "work", "rc"]
        );
    }

    #[test]
    fn preamble_keeps_codes_and_domain_terms() {
        let terms = significant_terms("What does policy 204-B say about CPT billing?");
        assert_eq!(terms, vec!["204", "cpt", "billing"]);
        assert_eq!(
            with_keyword_preamble("What does policy 204-B say about CPT billing?"),
            "Keywords: 204, cpt, billing. What does policy 204-B say about CPT billing?"
        );
    }

    #[test]
    fn preamble_absent_for_plain_query() {
        assert_eq!(with_keyword_preamble("how are you"), "how are you");
    }

    #[test]
    fn find_word_respects_boundaries() {
        assert_eq!(find_word("ask rc about leave", "rc"), Some(4));
        assert_eq!(find_word("open source docs", "rc"), None);
        assert_eq!(find_word("source rc", "rc"), Some(7));
        assert_eq!(find_word("code 204-b applies", "204-b"), Some(5));
        assert_eq!(find_word("code 204-bx applies", "204-b"), None);
    }

    #[test]
    fn top_terms_by_frequency_then_alpha() {
        let texts = ["remote work remote", "claims work audit", "audit remote"];
        assert_eq!(top_terms(texts, 3), vec!["remote", "audit", "work"]);
    }
}
