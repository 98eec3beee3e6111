//! Cross-encoder reranking.
//!
//! The [`Reranker`] re-scores retrieved candidates with a [`CrossEncoder`]
//! that reads query and passage together, then keeps the best `top_n`.
//!
//! | Config Value | Backend |
//! |-------------|----------|
//! | `"disabled"` | none; candidates pass through |
//! | `"http"` | [`HttpCrossEncoder`] (Cohere/TEI-style `POST /rerank`) |
//! | `"local"` | `LocalCrossEncoder` (fastembed `TextRerank`) |
//!
//! Reranking degrades instead of failing: when no backend is configured, or
//! the backend still fails after retries, candidates keep their retrieval
//! order and are truncated to `top_n`.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use tenant_rag_core::error::BackendError;
use tenant_rag_core::models::{sort_desc_by, ScoredChunk};

use crate::config::RerankerConfig;
use crate::retry::{status_error, transport_error, with_backoff, RetryPolicy};

/// A model scoring (query, passage) pairs jointly.
pub trait CrossEncoder: Send + Sync {
    fn name(&self) -> &str;
    /// One score per passage, in input order. Higher is more relevant.
    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, BackendError>;
}

/// How the rerank stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStatus {
    Reranked,
    /// No cross-encoder configured.
    Skipped,
    /// The cross-encoder failed; retrieval order was kept.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub chunks: Vec<ScoredChunk>,
    pub status: RerankStatus,
}

pub struct Reranker {
    backend: Option<Arc<dyn CrossEncoder>>,
    top_n: usize,
    retry: RetryPolicy,
}

impl Reranker {
    pub fn new(backend: Option<Arc<dyn CrossEncoder>>, top_n: usize, retry: RetryPolicy) -> Self {
        Self {
            backend,
            top_n: top_n.max(1),
            retry,
        }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Re-score `candidates` and keep the best `top_n`.
    ///
    /// Output is a subset of the input, ordered by cross-encoder score
    /// descending with ties kept in retrieval order.
    pub fn rerank(&self, query: &str, candidates: Vec<ScoredChunk>) -> RerankOutcome {
        let Some(backend) = &self.backend else {
            return self.passthrough(candidates, RerankStatus::Skipped);
        };
        if candidates.is_empty() {
            return RerankOutcome {
                chunks: candidates,
                status: RerankStatus::Reranked,
            };
        }

        let passages: Vec<&str> = candidates.iter().map(|c| c.chunk.text.as_str()).collect();
        let scores = with_backoff(&self.retry, backend.name(), || {
            backend.score(query, &passages)
        })
        .and_then(|scores| {
            if scores.len() == passages.len() {
                Ok(scores)
            } else {
                Err(BackendError::malformed(
                    backend.name(),
                    format!("expected {} scores, got {}", passages.len(), scores.len()),
                ))
            }
        });

        match scores {
            Ok(scores) => {
                let mut chunks: Vec<ScoredChunk> = candidates
                    .into_iter()
                    .zip(scores)
                    .map(|(mut c, s)| {
                        c.rerank_score = Some(s);
                        c
                    })
                    .collect();
                sort_desc_by(&mut chunks, |c| c.rerank_score.unwrap_or(f32::MIN));
                chunks.truncate(self.top_n);
                RerankOutcome {
                    chunks,
                    status: RerankStatus::Reranked,
                }
            }
            Err(err) => {
                tracing::warn!(
                    backend = backend.name(),
                    error = %err,
                    "reranker failed, keeping retrieval order"
                );
                self.passthrough(candidates, RerankStatus::Degraded)
            }
        }
    }

    fn passthrough(&self, mut candidates: Vec<ScoredChunk>, status: RerankStatus) -> RerankOutcome {
        candidates.truncate(self.top_n);
        RerankOutcome {
            chunks: candidates,
            status,
        }
    }
}

// ============ HTTP ============

/// Cross-encoder served over HTTP.
///
/// Sends `{"model", "query", "documents"}` to the configured URL and reads
/// `results[].{index, relevance_score}` (Cohere, Jina, and TEI-compatible
/// servers; TEI's bare array of `{index, score}` is accepted too).
pub struct HttpCrossEncoder {
    url: String,
    model: Option<String>,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl HttpCrossEncoder {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reranker.url required for http provider"))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        let url = if url.trim_end_matches('/').ends_with("/rerank") {
            url
        } else {
            format!("{}/rerank", url.trim_end_matches('/'))
        };
        Ok(Self {
            url,
            model: config.model.clone(),
            api_key,
            timeout,
            client,
        })
    }
}

impl CrossEncoder for HttpCrossEncoder {
    fn name(&self) -> &str {
        "http-rerank"
    }

    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, BackendError> {
        let mut body = serde_json::json!({
            "query": query,
            "documents": passages,
            "texts": passages,
            "return_documents": false,
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|e| transport_error(self.name(), &e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(status_error(self.name(), status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .map_err(|e| transport_error(self.name(), &e, self.timeout))?;
        parse_rerank_response(&json, passages.len())
    }
}

fn parse_rerank_response(json: &serde_json::Value, n: usize) -> Result<Vec<f32>, BackendError> {
    let results = json
        .get("results")
        .or(Some(json))
        .and_then(|r| r.as_array())
        .ok_or_else(|| BackendError::malformed("http-rerank", "missing results array"))?;

    let mut scores = vec![f32::MIN; n];
    for item in results {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .filter(|i| *i < n)
            .ok_or_else(|| BackendError::malformed("http-rerank", "result index missing or out of range"))?;
        let score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|s| s.as_f64())
            .ok_or_else(|| BackendError::malformed("http-rerank", "result score missing"))?;
        scores[index] = score as f32;
    }
    Ok(scores)
}

// ============ Local (fastembed) ============

/// Cross-encoder running locally through fastembed's `TextRerank`.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalCrossEncoder {
    timeout: Duration,
    model: Arc<std::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalCrossEncoder {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let model = match config.model.as_deref().unwrap_or("bge-reranker-base") {
            "bge-reranker-base" => fastembed::RerankerModel::BGERerankerBase,
            "jina-reranker-v1-turbo-en" => fastembed::RerankerModel::JINARerankerV1TurboEn,
            other => bail!(
                "Unknown local reranker model: '{}'. Supported models: bge-reranker-base, jina-reranker-v1-turbo-en",
                other
            ),
        };
        let model = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local reranker: {}", e))?;
        Ok(Self {
            timeout: Duration::from_secs(config.timeout_secs),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl CrossEncoder for LocalCrossEncoder {
    fn name(&self) -> &str {
        "local-rerank"
    }

    fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, BackendError> {
        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let documents: Vec<String> = passages.iter().map(|p| p.to_string()).collect();
        let n = documents.len();
        crate::retry::run_with_timeout("local-rerank", self.timeout, move || {
            let mut model = model
                .lock()
                .map_err(|_| BackendError::unavailable("local-rerank", "model lock poisoned"))?;
            let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
            let results = model
                .rerank(query.as_str(), &docs, false, None)
                .map_err(|e| BackendError::unavailable("local-rerank", e.to_string()))?;
            let mut scores = vec![f32::MIN; n];
            for r in results {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = r.score;
                }
            }
            Ok(scores)
        })
    }
}

/// Create the configured [`CrossEncoder`], or `None` when disabled.
pub fn create_cross_encoder(config: &RerankerConfig) -> Result<Option<Arc<dyn CrossEncoder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpCrossEncoder::new(config)?))),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Arc::new(LocalCrossEncoder::new(config)?))),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local reranker requires --features local-embeddings-fastembed"),
        other => bail!("Unknown reranker provider: {}", other),
    }
}

/// Build the rerank stage around `backend` with the configured limits.
pub fn reranker_from_config(
    config: &RerankerConfig,
    backend: Option<Arc<dyn CrossEncoder>>,
) -> Reranker {
    Reranker::new(
        backend,
        config.top_n,
        RetryPolicy::new(config.max_retries, config.retry_base_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenant_rag_core::models::{Chunk, ChunkMetadata};

    fn candidate(id: &str, text: &str, similarity: f32) -> ScoredChunk {
        ScoredChunk::new(
            "RC",
            Chunk {
                id: id.to_string(),
                document_id: "doc".to_string(),
                chunk_index: 0,
                text: text.to_string(),
                start: 0,
                end: text.len(),
                hash: String::new(),
                metadata: ChunkMetadata::default(),
            },
            similarity,
        )
    }

    /// Scores a passage by its length.
    struct LengthScorer;
    impl CrossEncoder for LengthScorer {
        fn name(&self) -> &str {
            "length"
        }
        fn score(&self, _query: &str, passages: &[&str]) -> Result<Vec<f32>, BackendError> {
            Ok(passages.iter().map(|p| p.len() as f32).collect())
        }
    }

    struct Broken;
    impl CrossEncoder for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn score(&self, _query: &str, _passages: &[&str]) -> Result<Vec<f32>, BackendError> {
            Err(BackendError::unavailable("broken", "503"))
        }
    }

    fn inputs() -> Vec<ScoredChunk> {
        vec![
            candidate("a", "short", 0.9),
            candidate("b", "a much longer passage", 0.8),
            candidate("c", "medium text", 0.7),
        ]
    }

    #[test]
    fn reorders_by_cross_encoder_and_truncates() {
        let r = Reranker::new(Some(Arc::new(LengthScorer)), 2, RetryPolicy::none());
        let out = r.rerank("q", inputs());
        assert_eq!(out.status, RerankStatus::Reranked);
        let ids: Vec<&str> = out.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(out.chunks[0].rerank_score.is_some());
    }

    #[test]
    fn disabled_passes_through_truncated() {
        let r = Reranker::new(None, 2, RetryPolicy::none());
        let out = r.rerank("q", inputs());
        assert_eq!(out.status, RerankStatus::Skipped);
        let ids: Vec<&str> = out.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn failure_degrades_to_retrieval_order() {
        let r = Reranker::new(Some(Arc::new(Broken)), 5, RetryPolicy::new(1, 1));
        let out = r.rerank("q", inputs());
        assert_eq!(out.status, RerankStatus::Degraded);
        assert_eq!(out.chunks.len(), 3);
        assert_eq!(out.chunks[0].chunk.id, "a");
        assert!(out.chunks.iter().all(|c| c.rerank_score.is_none()));
    }

    #[test]
    fn parses_cohere_and_tei_shapes() {
        let cohere = serde_json::json!({"results": [
            {"index": 1, "relevance_score": 0.9},
            {"index": 0, "relevance_score": 0.1}
        ]});
        assert_eq!(parse_rerank_response(&cohere, 2).unwrap(), vec![0.1, 0.9]);

        let tei = serde_json::json!([{"index": 0, "score": 2.5}]);
        assert_eq!(parse_rerank_response(&tei, 1).unwrap(), vec![2.5]);

        let bad = serde_json::json!({"results": [{"index": 7, "score": 1.0}]});
        assert!(parse_rerank_response(&bad, 2).is_err());
    }
}
