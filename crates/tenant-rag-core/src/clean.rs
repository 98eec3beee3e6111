//! Cleanup of extracted document text before chunking.
//!
//! PDF and office extraction leaves artifacts: words hyphenated across line
//! breaks, stray control characters, running headers and footers repeated
//! on every page, and ragged whitespace. [`clean_pages`] removes these while
//! keeping page boundaries, so page numbers stay correct for attribution.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// A short line seen at least this many times is treated as a header/footer.
const BOILERPLATE_MIN_REPEATS: usize = 3;
const BOILERPLATE_MAX_LEN: usize = 80;

static HYPHEN_BREAK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\w)-\n[ \t]*(\w)").ok());
static BLANK_RUNS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n{3,}").ok());
static CODE_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{0,4}[-.]?\d[\w.\-]*$").ok());

fn is_code_line(line: &str) -> bool {
    CODE_LINE.as_ref().is_some_and(|re| re.is_match(line))
}

/// Clean a single unpaginated text.
pub fn clean_text(text: &str) -> String {
    clean_pages(&[text.to_string()]).pop().unwrap_or_default()
}

/// Clean every page, dropping lines that repeat across the document.
///
/// Classification-code lines (`A01.1`, `99213`) are never treated as
/// boilerplate even when they repeat, since code tables legitimately list
/// the same code on many pages.
pub fn clean_pages(pages: &[String]) -> Vec<String> {
    let normalized: Vec<String> = pages.iter().map(|p| normalize_chars(p)).collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for page in &normalized {
        for line in page.lines() {
            let line = line.trim();
            if line.len() >= 2 && line.len() <= BOILERPLATE_MAX_LEN {
                *counts.entry(line).or_insert(0) += 1;
            }
        }
    }
    let boilerplate: Vec<&str> = counts
        .into_iter()
        .filter(|(line, n)| *n >= BOILERPLATE_MIN_REPEATS && !is_code_line(line))
        .map(|(line, _)| line)
        .collect();

    normalized
        .iter()
        .map(|page| {
            let kept: Vec<String> = page
                .lines()
                .filter(|line| !boilerplate.contains(&line.trim()))
                .map(collapse_spaces)
                .collect();
            let mut text = kept.join("\n");
            if let Some(re) = HYPHEN_BREAK.as_ref() {
                text = re.replace_all(&text, "$1$2").into_owned();
            }
            if let Some(re) = BLANK_RUNS.as_ref() {
                text = re.replace_all(&text, "\n\n").into_owned();
            }
            text.trim().to_string()
        })
        .collect()
}

/// Unify line endings and replace control characters with spaces.
fn normalize_chars(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                ' '
            } else {
                c
            }
        })
        .collect()
}

fn collapse_spaces(line: &str) -> String {
    line.split([' ', '\t'])
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_hyphenated_words() {
        assert_eq!(clean_text("reimburse-\nment applies"), "reimbursement applies");
    }

    #[test]
    fn strips_control_chars_and_spaces() {
        assert_eq!(clean_text("a\u{0007}b   c\t\td\r\ne"), "a b c d\ne");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean_text("one\n\n\n\n\ntwo"), "one\n\ntwo");
    }

    #[test]
    fn removes_repeated_headers_but_keeps_codes() {
        let pages: Vec<String> = (1..=3)
            .map(|i| format!("ACME Confidential\nA01.1\nBody text {}", i))
            .collect();
        let cleaned = clean_pages(&pages);
        assert_eq!(cleaned.len(), 3);
        for (i, page) in cleaned.iter().enumerate() {
            assert!(!page.contains("ACME Confidential"));
            assert!(page.contains("A01.1"));
            assert!(page.contains(&format!("Body text {}", i + 1)));
        }
    }
}
