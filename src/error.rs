//! Error types surfaced by the engine.
//!
//! Routing ambiguity and missing evidence are *outcomes*, returned inside a
//! normal response. Only the cases below interrupt a request.

pub use tenant_rag_core::error::BackendError;

/// User-safe message for exhausted backend retries.
pub const UNAVAILABLE_MESSAGE: &str =
    "the answering service is temporarily unavailable, please try again shortly";

/// Failure of a query, ingestion, or cache operation.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),
    #[error("no tenants have been ingested yet")]
    NoTenants,
    /// Embedding, rerank, or LLM backend failed after retries. The source
    /// is kept for logging; `Display` stays generic.
    #[error("{}", UNAVAILABLE_MESSAGE)]
    BackendUnavailable(#[source] BackendError),
    #[error("index rebuild failed: {0}")]
    IndexRebuild(#[from] RebuildError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("fetch refused: {0}")]
    FetchRefused(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<BackendError> for RagError {
    fn from(e: BackendError) -> Self {
        RagError::BackendUnavailable(e)
    }
}

impl From<anyhow::Error> for RagError {
    fn from(e: anyhow::Error) -> Self {
        RagError::Storage(format!("{:#}", e))
    }
}

/// Why a staging generation was not published.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("tenant '{tenant}' has {documents} documents but produced no chunks")]
    Empty { tenant: String, documents: usize },
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding failed: {0}")]
    Embedding(#[source] BackendError),
    #[error("failed to persist snapshot: {0}")]
    Persist(String),
}
