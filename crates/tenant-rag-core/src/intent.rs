//! Rule-based query intent.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceFilter;
use crate::text::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SmallTalk,
    Download,
    Clarify,
    Question,
    Unknown,
}

static GREETING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(hi|hello|hey|hiya|yo|sup|good\s+(morning|afternoon|evening|night)|how\s+are\s+you|what'?s\s+up|thanks|thank\s+you)\b",
    )
    .ok()
});

static LITERALS: LazyLock<Option<EvidenceFilter>> =
    LazyLock::new(|| EvidenceFilter::new(&[], false).ok());

const DOWNLOAD_KEYWORDS: &[&str] = &["download", "form", "get", "obtain", "document"];
const CLARIFY_PHRASES: &[&str] = &[
    "what do you mean",
    "can you explain",
    "clarify",
    "elaborate",
    "more details",
    "tell me more",
];
const QUESTION_WORDS: &[&str] = &[
    "what", "where", "when", "who", "how", "why", "which", "can", "do", "does", "is", "are",
];
const ONLY_CODES_PHRASES: &[&str] = &["only code", "only codes", "just code", "just codes", "codes only"];

/// Longest query still treated as pure small talk.
const SMALL_TALK_MAX_WORDS: usize = 5;

/// Classify `query`, returning the intent and a heuristic confidence.
///
/// Greetings only count as small talk when the query is short; "hi, what
/// does policy 204-B say?" is a question.
pub fn classify(query: &str) -> (Intent, f32) {
    let words = tokenize(query);
    let lower = query.to_lowercase();

    let greeting = GREETING.as_ref().is_some_and(|re| re.is_match(&lower));
    if greeting && words.len() <= SMALL_TALK_MAX_WORDS && !has_question_body(&lower) {
        return (Intent::SmallTalk, 0.9);
    }
    if is_download_intent(query) {
        return (Intent::Download, 0.85);
    }
    if CLARIFY_PHRASES.iter().any(|p| lower.contains(p)) {
        return (Intent::Clarify, 0.8);
    }
    if words.len() >= 2
        && (words.iter().take(3).any(|w| QUESTION_WORDS.contains(&w.as_str()))
            || query.contains('?')
            || words.len() >= 4)
    {
        return (Intent::Question, 0.9);
    }
    (Intent::Unknown, 0.5)
}

/// Whether anything besides the greeting phrases reads as a question: a
/// question word, a `?`, or a literal such as a code or number.
fn has_question_body(lower: &str) -> bool {
    let rest = match GREETING.as_ref() {
        Some(re) => re.replace_all(lower, " ").into_owned(),
        None => lower.to_string(),
    };
    let words = tokenize(&rest);
    if words.is_empty() {
        return false;
    }
    rest.contains('?')
        || words.iter().any(|w| QUESTION_WORDS.contains(&w.as_str()))
        || LITERALS.as_ref().is_some_and(|f| !f.extract(&rest).is_empty())
}

/// Whether the user is asking for a file rather than an explanation.
pub fn is_download_intent(query: &str) -> bool {
    let words = tokenize(query);
    DOWNLOAD_KEYWORDS
        .iter()
        .any(|k| words.iter().any(|w| w == k || w.strip_suffix('s') == Some(k)))
}

/// Whether the user asked for classification codes and nothing else.
pub fn wants_only_codes(query: &str) -> bool {
    let lower = query.to_lowercase();
    ONLY_CODES_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greetings_are_small_talk() {
        assert_eq!(classify("Hello!").0, Intent::SmallTalk);
        assert_eq!(classify("good morning").0, Intent::SmallTalk);
        assert_eq!(classify("how are you?").0, Intent::SmallTalk);
        assert_eq!(classify("what's up").0, Intent::SmallTalk);
    }

    #[test]
    fn greeting_with_question_is_not_small_talk() {
        assert_eq!(
            classify("hi, what does policy 204-B say about remote work?").0,
            Intent::Question
        );
        assert_eq!(classify("hey what is esmd").0, Intent::Question);
    }

    #[test]
    fn short_greeting_questions_are_not_small_talk() {
        assert_eq!(classify("Hi, is J1234 covered?").0, Intent::Question);
        assert_ne!(classify("Thanks, is form 5 needed?").0, Intent::SmallTalk);
        assert_ne!(classify("hello, j1234 coverage").0, Intent::SmallTalk);
        assert_eq!(classify("hi there").0, Intent::SmallTalk);
        assert_eq!(classify("thank you!").0, Intent::SmallTalk);
    }

    #[test]
    fn download_and_clarify() {
        assert_eq!(classify("download the enrollment forms").0, Intent::Download);
        assert!(is_download_intent("where can I get the W-9 form"));
        assert!(!is_download_intent("what is the formula"));
        assert_eq!(classify("can you explain that").0, Intent::Clarify);
    }

    #[test]
    fn questions_and_unknown() {
        assert_eq!(classify("remote work days allowed").0, Intent::Question);
        assert_eq!(classify("asdf").0, Intent::Unknown);
    }

    #[test]
    fn only_codes_detection() {
        assert!(wants_only_codes("List the ICD codes only, just codes please"));
        assert!(!wants_only_codes("explain the coding rules"));
    }
}
