//! Single-shot answer generation.
//!
//! One prompt, one model call (with transient retries), one parse. Output
//! that cannot be parsed even after repair is replaced by an answer built
//! only from the passages that were in the context. Exhausted retries are
//! the only failure surfaced to the caller.

use std::sync::Arc;

use tenant_rag_core::answer::{build_prompt, fallback_answer, parse_model_output, StructuredAnswer};
use tenant_rag_core::context::AssembledContext;
use tenant_rag_core::error::BackendError;
use tenant_rag_core::evidence::extract_code_like_tokens;
use tenant_rag_core::intent::wants_only_codes;

use crate::llm::LanguageModel;
use crate::retry::{with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    /// Parsed model output.
    Answered,
    /// Passage-only answer; the model was disabled or its output unusable.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub answer: StructuredAnswer,
    pub status: GenerationStatus,
}

pub struct AnswerGenerator {
    llm: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl AnswerGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub fn model_name(&self) -> &str {
        self.llm.name()
    }

    pub fn generate(
        &self,
        query: &str,
        context: &AssembledContext,
        tenant_label: &str,
    ) -> Result<Generation, BackendError> {
        let prompt = build_prompt(query, &context.text, tenant_label);
        let raw = match with_backoff(&self.retry, self.llm.name(), || self.llm.complete(&prompt)) {
            Ok(raw) => raw,
            Err(BackendError::Disabled(_)) => return Ok(self.fallback(query, context)),
            Err(err) => {
                tracing::error!(model = self.llm.name(), error = %err, "generation failed");
                return Err(err);
            }
        };

        let mut generation = match parse_model_output(&raw) {
            Ok(parsed) => {
                if !parsed.rejected_fields.is_empty() {
                    tracing::warn!(
                        model = self.llm.name(),
                        fields = ?parsed.rejected_fields,
                        "dropped keys outside the answer schema"
                    );
                }
                if parsed.repaired {
                    tracing::debug!(model = self.llm.name(), "model output needed repair");
                }
                Generation {
                    answer: parsed.answer,
                    status: GenerationStatus::Answered,
                }
            }
            Err(err) => {
                tracing::warn!(
                    model = self.llm.name(),
                    error = %err,
                    raw_len = raw.len(),
                    "unusable model output, answering from passages"
                );
                self.fallback(query, context)
            }
        };

        if wants_only_codes(query) && generation.answer.codes.is_empty() {
            generation.answer.codes = extract_code_like_tokens(&context.text);
        }
        Ok(generation)
    }

    fn fallback(&self, query: &str, context: &AssembledContext) -> Generation {
        let mut answer = fallback_answer(&context.included);
        if wants_only_codes(query) {
            answer.codes = extract_code_like_tokens(&context.text);
        }
        Generation {
            answer,
            status: GenerationStatus::Fallback,
        }
    }
}
