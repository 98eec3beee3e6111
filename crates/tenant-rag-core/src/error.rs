//! Failure taxonomy for external model backends.
//!
//! Every embedding, cross-encoder and language-model call returns
//! `Result<_, BackendError>`. Callers retry only the transient variants;
//! the rest fail the enclosing query or ingestion immediately.

/// Error from an embedding, rerank, or language-model backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The call exceeded its per-call timeout.
    #[error("{backend} timed out after {timeout_ms} ms")]
    Timeout { backend: String, timeout_ms: u64 },
    /// Network failure, rate limit, or server-side error.
    #[error("{backend} unavailable: {message}")]
    Unavailable { backend: String, message: String },
    /// The backend refused the request (client error, bad credentials).
    #[error("{backend} rejected the request: {message}")]
    Rejected { backend: String, message: String },
    /// The backend answered but the payload could not be interpreted.
    #[error("{backend} returned a malformed response: {message}")]
    Malformed { backend: String, message: String },
    /// No backend is configured for this capability.
    #[error("{0} backend is disabled")]
    Disabled(String),
}

impl BackendError {
    pub fn unavailable(backend: &str, message: impl Into<String>) -> Self {
        BackendError::Unavailable {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(backend: &str, message: impl Into<String>) -> Self {
        BackendError::Rejected {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(backend: &str, message: impl Into<String>) -> Self {
        BackendError::Malformed {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout { .. } | BackendError::Unavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_outages_are_transient() {
        assert!(BackendError::Timeout {
            backend: "llm".into(),
            timeout_ms: 10
        }
        .is_transient());
        assert!(BackendError::unavailable("embed", "503").is_transient());
        assert!(!BackendError::rejected("embed", "401").is_transient());
        assert!(!BackendError::malformed("embed", "no data").is_transient());
        assert!(!BackendError::Disabled("rerank".into()).is_transient());
    }

    #[test]
    fn display_names_backend() {
        let e = BackendError::Timeout {
            backend: "ollama".into(),
            timeout_ms: 1500,
        };
        assert_eq!(e.to_string(), "ollama timed out after 1500 ms");
    }
}
