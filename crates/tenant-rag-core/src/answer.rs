//! Prompt template and structured answer parsing.
//!
//! The language model is asked for one JSON object with a fixed set of
//! keys. Its output is then parsed into [`StructuredAnswer`], a strict
//! schema:
//!
//! - absent keys default to empty values;
//! - keys outside [`ALLOWED_FIELDS`] are removed before deserialization and
//!   reported in [`ParsedAnswer::rejected_fields`];
//! - list fields tolerate a bare string or mixed scalars.
//!
//! When the raw text is not valid JSON, exactly one repair is attempted:
//! strip Markdown fences, cut out the first balanced `{...}` object, and
//! escape raw control characters inside string literals.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::models::ScoredChunk;

/// Keys the generator may return.
pub const ALLOWED_FIELDS: &[&str] = &[
    "summary",
    "detailed_response",
    "key_points",
    "suggestions",
    "follow_up_questions",
    "code_snippets",
    "codes",
];

const FALLBACK_PASSAGES: usize = 3;
const FALLBACK_PASSAGE_CHARS: usize = 600;

/// The validated answer payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StructuredAnswer {
    #[serde(deserialize_with = "lenient_string")]
    pub summary: String,
    #[serde(deserialize_with = "lenient_string")]
    pub detailed_response: String,
    #[serde(deserialize_with = "lenient_list")]
    pub key_points: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub suggestions: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub follow_up_questions: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub code_snippets: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub codes: Vec<String>,
}

/// A parsed answer plus the keys that were refused.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnswer {
    pub answer: StructuredAnswer,
    pub rejected_fields: Vec<String>,
    /// True when the repair pass was needed.
    pub repaired: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("no JSON object found in model output")]
    NoJsonObject,
    #[error("model output is JSON but not an object")]
    NotAnObject,
    #[error("invalid JSON in model output: {0}")]
    Invalid(String),
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(scalar_to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    })
}

fn lenient_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => items
            .into_iter()
            .filter_map(scalar_to_string)
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s],
        _ => Vec::new(),
    })
}

fn scalar_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Build the single-shot generation prompt.
pub fn build_prompt(query: &str, context: &str, tenant_label: &str) -> String {
    let context = if context.trim().is_empty() {
        "No relevant context found."
    } else {
        context
    };
    format!(
        r#"You are a professional assistant answering employee questions from internal documents.

RULES:
1. Answer ONLY from the CONTEXT below. Do not use outside knowledge.
2. If the CONTEXT does not contain the answer, say that the information was not found in the available documents.
3. Be clear, concise, and professional.
4. Copy any code blocks (XML, JSON, scripts) from the CONTEXT exactly into "code_snippets".
5. Copy classification codes the user asks about (ICD-10, CPT, HCPCS, DRG) into "codes".

CONTEXT FROM {tenant_label}:
---
{context}
---

USER QUERY: "{query}"

Respond with a single JSON object with exactly these keys:
{{
  "summary": "1-3 sentence answer based only on the context",
  "detailed_response": "fuller answer based only on the context",
  "key_points": ["3-5 key takeaways, or an empty list"],
  "suggestions": ["2-3 practical next steps, or an empty list"],
  "follow_up_questions": ["2-3 follow-up questions the context can answer, or an empty list"],
  "code_snippets": [],
  "codes": []
}}

Output the JSON object and nothing else. Escape newlines inside strings as \n."#
    )
}

/// Parse raw model output into a [`StructuredAnswer`].
pub fn parse_model_output(raw: &str) -> Result<ParsedAnswer, ParseError> {
    let cleaned = strip_code_fences(raw);
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return from_value(value, false);
    }

    let candidate = extract_first_json_object(cleaned).ok_or(ParseError::NoJsonObject)?;
    let repaired = escape_control_chars_in_strings(candidate);
    let value: Value =
        serde_json::from_str(&repaired).map_err(|e| ParseError::Invalid(e.to_string()))?;
    from_value(value, true)
}

fn from_value(value: Value, repaired: bool) -> Result<ParsedAnswer, ParseError> {
    let Value::Object(map) = value else {
        return Err(ParseError::NotAnObject);
    };

    let mut known = Map::new();
    let mut rejected_fields = Vec::new();
    for (key, v) in map {
        if ALLOWED_FIELDS.contains(&key.as_str()) {
            known.insert(key, v);
        } else {
            rejected_fields.push(key);
        }
    }

    let answer: StructuredAnswer = serde_json::from_value(Value::Object(known))
        .map_err(|e| ParseError::Invalid(e.to_string()))?;
    Ok(ParsedAnswer {
        answer,
        rejected_fields,
        repaired,
    })
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// The first balanced `{...}` object in `text`, skipping braces in strings.
///
/// Quotes before the opening brace are prose and do not start a string.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let mut in_string = false;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut start = None;

    for (i, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' if depth > 0 => in_string = !in_string,
            '{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if !in_string && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| &text[s..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Escape raw newlines, tabs and other control characters inside JSON strings.
pub fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                out.push(ch);
                in_string = !in_string;
            }
            '\n' if in_string => out.push_str("\\n"),
            '\r' if in_string => out.push_str("\\r"),
            '\t' if in_string => out.push_str("\\t"),
            c if in_string && c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Answer used when the evidence guardrail abstains or nothing was retrieved.
pub fn no_evidence_answer() -> StructuredAnswer {
    StructuredAnswer {
        summary: "I could not find this information in the provided documents.".to_string(),
        detailed_response: "None of the retrieved passages contain the specific details asked \
            about, so no answer is given. Try rephrasing the question or naming the document \
            set it belongs to."
            .to_string(),
        ..StructuredAnswer::default()
    }
}

/// Minimal answer built only from chunk text, used when model output is unusable.
pub fn fallback_answer(chunks: &[ScoredChunk]) -> StructuredAnswer {
    let passages: Vec<String> = chunks
        .iter()
        .take(FALLBACK_PASSAGES)
        .map(|sc| {
            let text = sc.chunk.text.trim();
            if text.chars().count() > FALLBACK_PASSAGE_CHARS {
                let cut: String = text.chars().take(FALLBACK_PASSAGE_CHARS).collect();
                format!("{}…", cut.trim_end())
            } else {
                text.to_string()
            }
        })
        .collect();

    StructuredAnswer {
        summary: "A formatted answer could not be produced; the most relevant passages are shown below."
            .to_string(),
        detailed_response: passages.join("\n\n"),
        ..StructuredAnswer::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};

    #[test]
    fn parses_clean_json_and_defaults_missing() {
        let parsed = parse_model_output(r#"{"summary": "Up to 3 days.", "key_points": ["a"]}"#)
            .unwrap();
        assert_eq!(parsed.answer.summary, "Up to 3 days.");
        assert_eq!(parsed.answer.key_points, vec!["a"]);
        assert!(parsed.answer.suggestions.is_empty());
        assert!(parsed.answer.detailed_response.is_empty());
        assert!(!parsed.repaired);
    }

    #[test]
    fn unknown_fields_are_rejected_explicitly() {
        let parsed =
            parse_model_output(r#"{"summary": "s", "intent": "QUESTION", "downloadable_files": []}"#)
                .unwrap();
        assert_eq!(parsed.answer.summary, "s");
        let mut rejected = parsed.rejected_fields.clone();
        rejected.sort();
        assert_eq!(rejected, vec!["downloadable_files", "intent"]);
    }

    #[test]
    fn wrong_types_are_coerced() {
        let parsed = parse_model_output(
            r#"{"summary": null, "key_points": "only one", "suggestions": 5, "codes": ["A01", 99213, null]}"#,
        )
        .unwrap();
        assert_eq!(parsed.answer.summary, "");
        assert_eq!(parsed.answer.key_points, vec!["only one"]);
        assert!(parsed.answer.suggestions.is_empty());
        assert_eq!(parsed.answer.codes, vec!["A01", "99213"]);
    }

    #[test]
    fn fenced_output_is_accepted() {
        let parsed = parse_model_output("```json\n{\"summary\": \"ok\"}\n```").unwrap();
        assert_eq!(parsed.answer.summary, "ok");
    }

    #[test]
    fn repairs_prose_wrapped_object_with_raw_newlines() {
        let raw = "Sure! Here is the answer:\n{\"summary\": \"line one\nline two\", \"key_points\": [\"{brace}\"]}\nHope that helps.";
        let parsed = parse_model_output(raw).unwrap();
        assert!(parsed.repaired);
        assert_eq!(parsed.answer.summary, "line one\nline two");
        assert_eq!(parsed.answer.key_points, vec!["{brace}"]);
    }

    #[test]
    fn gives_up_without_object() {
        assert_eq!(
            parse_model_output("I cannot answer that."),
            Err(ParseError::NoJsonObject)
        );
        assert_eq!(parse_model_output("[1, 2]"), Err(ParseError::NotAnObject));
    }

    #[test]
    fn first_object_skips_braces_in_strings() {
        let text = r#"x {"a": "}{", "b": {"c": 1}} {"d": 2}"#;
        assert_eq!(
            extract_first_json_object(text),
            Some(r#"{"a": "}{", "b": {"c": 1}}"#)
        );
        assert_eq!(extract_first_json_object("{ unbalanced"), None);
    }

    #[test]
    fn stray_quote_in_leading_prose_is_ignored() {
        let raw = "Here is the \"answer: {\"summary\": \"x\"}";
        assert_eq!(extract_first_json_object(raw), Some("{\"summary\": \"x\"}"));
        let parsed = parse_model_output(raw).unwrap();
        assert_eq!(parsed.answer.summary, "x");
    }

    #[test]
    fn prompt_carries_query_context_and_schema() {
        let p = build_prompt("What is 204-B?", "[Source: a.txt]\nPolicy 204-B", "tenant RC");
        assert!(p.contains("USER QUERY: \"What is 204-B?\""));
        assert!(p.contains("Policy 204-B"));
        assert!(p.contains("CONTEXT FROM tenant RC"));
        for field in ALLOWED_FIELDS {
            assert!(p.contains(&format!("\"{}\"", field)), "missing {}", field);
        }
        assert!(build_prompt("q", "  ", "t").contains("No relevant context found."));
    }

    #[test]
    fn fallback_uses_raw_chunks() {
        let chunk = Chunk {
            id: "c".into(),
            document_id: "a.txt".into(),
            chunk_index: 0,
            text: "Policy 204-B covers remote work up to 3 days.".into(),
            start: 0,
            end: 0,
            hash: String::new(),
            metadata: ChunkMetadata::default(),
        };
        let answer = fallback_answer(&[ScoredChunk::new("RC", chunk, 0.9)]);
        assert!(answer.detailed_response.contains("3 days"));
        assert!(!answer.summary.is_empty());
    }
}
