//! The query and ingestion orchestrator.
//!
//! [`RagEngine`] owns one instance of every pipeline stage and sequences
//! them:
//!
//! ```text
//! query ─▶ validate ─▶ intent ─▶ route ─▶ cache? ─▶ retrieve ─▶ rerank
//!       ─▶ evidence ─▶ assemble ─▶ generate ─▶ attribute ─▶ cache put
//!
//! ingest ─▶ scan ─▶ diff ─▶ extract/chunk/embed ─▶ persist ─▶ swap ─▶ invalidate cache
//! ```
//!
//! Routing ambiguity, abstention, small talk and an empty registry are
//! ordinary responses with their own [`ResponseStatus`]. Only invalid
//! input, unknown tenants and exhausted backend retries are errors.
//!
//! The engine is `Sync`; share it by reference across worker threads.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tenant_rag_core::answer::{no_evidence_answer, StructuredAnswer};
use tenant_rag_core::attribution::{attribute, SourceAttribution};
use tenant_rag_core::context::{assemble, CharApproxCounter};
use tenant_rag_core::embedding::Embedder;
use tenant_rag_core::evidence::EvidenceFilter;
use tenant_rag_core::intent::{classify, is_download_intent, Intent};
use tenant_rag_core::models::{ScoredChunk, TenantScore};
use tenant_rag_core::routing::RouteDecision;

use crate::cache::{partition_label, Dependency, ResponseCache};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::RagError;
use crate::generator::{AnswerGenerator, GenerationStatus};
use crate::index::{load_snapshot, remove_snapshot, IndexGeneration, TenantIndex};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::llm::{create_language_model, LanguageModel};
use crate::rerank::{create_cross_encoder, reranker_from_config, CrossEncoder, RerankStatus, Reranker};
use crate::retriever::Retriever;
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::storage::{DocumentStorage, FsStorage};
use crate::tenants::TenantRegistry;

const MIN_QUERY_CHARS: usize = 2;
const MAX_QUERY_CHARS: usize = 500;

/// One question for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    /// Restrict the query to this tenant.
    #[serde(default)]
    pub tenant_hint: Option<String>,
    /// Fan out instead of asking when routing is unsure.
    #[serde(default)]
    pub auto_select: bool,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Answered,
    NoEvidence,
    Fallback,
    Disambiguation,
    SmallTalk,
    NotConfigured,
}

/// The answer payload returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub summary: String,
    pub detailed_response: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
    #[serde(default)]
    pub code_snippets: Vec<String>,
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceAttribution>,
    pub selected_tenant: Option<String>,
    #[serde(default)]
    pub selected_tenants: Vec<String>,
    pub route_confidence: f32,
    #[serde(default)]
    pub needs_disambiguation: bool,
    #[serde(default)]
    pub candidate_tenants: Vec<TenantScore>,
    #[serde(default)]
    pub is_download_intent: bool,
}

impl QueryResponse {
    fn from_answer(status: ResponseStatus, answer: StructuredAnswer) -> Self {
        Self {
            status,
            summary: answer.summary,
            detailed_response: answer.detailed_response,
            key_points: answer.key_points,
            suggestions: answer.suggestions,
            follow_up_questions: answer.follow_up_questions,
            code_snippets: answer.code_snippets,
            codes: answer.codes,
            sources: Vec::new(),
            selected_tenant: None,
            selected_tenants: Vec::new(),
            route_confidence: 0.0,
            needs_disambiguation: false,
            candidate_tenants: Vec::new(),
            is_download_intent: false,
        }
    }

    fn message(status: ResponseStatus, summary: &str) -> Self {
        Self::from_answer(
            status,
            StructuredAnswer {
                summary: summary.to_string(),
                ..StructuredAnswer::default()
            },
        )
    }

    fn routed(mut self, tenants: &[String], confidence: f32) -> Self {
        self.selected_tenant = Some(partition_label(tenants));
        self.selected_tenants = tenants.to_vec();
        self.route_confidence = confidence;
        self
    }
}

/// A response plus how it was produced.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub response: QueryResponse,
    pub cache_hit: bool,
    /// `None` when the pipeline stopped before reranking.
    pub rerank: Option<RerankStatus>,
}

impl QueryOutcome {
    fn fresh(response: QueryResponse) -> Self {
        Self {
            response,
            cache_hit: false,
            rerank: None,
        }
    }
}

/// Summary line for one registered tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantSummary {
    pub tenant: String,
    pub generation: u64,
    pub documents: usize,
    pub chunks: usize,
    pub model: String,
    pub built_at: String,
}

/// Backends the engine is assembled from.
pub struct EngineComponents {
    pub storage: Arc<dyn DocumentStorage>,
    pub embedder: Arc<dyn Embedder>,
    pub cross_encoder: Option<Arc<dyn CrossEncoder>>,
    pub llm: Arc<dyn LanguageModel>,
}

impl EngineComponents {
    /// Providers selected by the configuration's provider tags.
    pub fn from_config(config: &Config) -> Result<Self, RagError> {
        let config_err = |e: anyhow::Error| RagError::Config(format!("{:#}", e));
        Ok(Self {
            storage: Arc::new(FsStorage::new(&config.storage).map_err(config_err)?),
            embedder: create_embedder(&config.embedding).map_err(config_err)?,
            cross_encoder: create_cross_encoder(&config.reranker).map_err(config_err)?,
            llm: create_language_model(&config.llm).map_err(config_err)?,
        })
    }
}

pub struct RagEngine {
    config: Config,
    registry: TenantRegistry,
    storage: Arc<dyn DocumentStorage>,
    router: Router,
    retriever: Retriever,
    reranker: Reranker,
    evidence: EvidenceFilter,
    counter: CharApproxCounter,
    cache: ResponseCache<QueryResponse>,
    generator: AnswerGenerator,
    pipeline: IngestPipeline,
}

impl RagEngine {
    /// Build every backend from `config`, then [`RagEngine::new`].
    pub fn open(config: Config) -> Result<Self, RagError> {
        let components = EngineComponents::from_config(&config)?;
        Self::new(config, components)
    }

    /// Assemble the engine, load index snapshots, and reconcile tenants
    /// with storage when `ingest.reconcile_on_open` is set.
    pub fn new(config: Config, components: EngineComponents) -> Result<Self, RagError> {
        let evidence = EvidenceFilter::new(&config.evidence.code_patterns, config.evidence.drop_unmatched)
            .map_err(|e| RagError::Config(format!("evidence.code_patterns: {}", e)))?;
        let llm_retry = RetryPolicy::new(config.llm.max_retries, config.llm.retry_base_ms);

        let engine = Self {
            registry: TenantRegistry::new(),
            storage: Arc::clone(&components.storage),
            router: Router::new(
                Arc::clone(&components.embedder),
                config.routing.clone(),
                config.tenants.clone(),
            ),
            retriever: Retriever::new(Arc::clone(&components.embedder), config.retrieval.clone()),
            reranker: reranker_from_config(&config.reranker, components.cross_encoder),
            evidence,
            counter: CharApproxCounter {
                chars_per_token: config.context.chars_per_token,
            },
            cache: ResponseCache::open(config.cache.clone()),
            generator: AnswerGenerator::new(components.llm, llm_retry),
            pipeline: IngestPipeline::new(&config, components.storage, components.embedder),
            config,
        };

        engine.load_snapshots()?;
        if engine.config.ingest.reconcile_on_open {
            engine.reconcile();
        }
        Ok(engine)
    }

    fn known_tenants(&self) -> Result<BTreeSet<String>, RagError> {
        let mut tenants: BTreeSet<String> = self.storage.tenants()?.into_iter().collect();
        tenants.extend(self.registry.ids());
        let index_dir = &self.config.storage.index_dir;
        if index_dir.exists() {
            let entries = std::fs::read_dir(index_dir)
                .map_err(|e| RagError::Storage(format!("{}: {}", index_dir.display(), e)))?;
            for entry in entries.flatten() {
                if entry.path().join("index.json").is_file() {
                    tenants.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        Ok(tenants)
    }

    fn load_snapshots(&self) -> Result<(), RagError> {
        let index_dir = &self.config.storage.index_dir;
        for tenant in self.known_tenants()? {
            match load_snapshot(index_dir, &tenant) {
                Ok(Some(generation)) => {
                    tracing::info!(
                        tenant = %tenant,
                        generation = generation.generation,
                        chunks = generation.chunk_count(),
                        "loaded index snapshot"
                    );
                    self.registry.insert(TenantIndex::new(generation));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tenant = %tenant, error = %format!("{:#}", e), "ignoring unreadable snapshot");
                }
            }
        }
        Ok(())
    }

    /// Ingest every known tenant whose index disagrees with storage.
    fn reconcile(&self) {
        let tenants = match self.known_tenants() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list tenants for reconciliation");
                return;
            }
        };
        for tenant in tenants {
            if let Err(e) = self.ingest(&tenant, &[]) {
                tracing::warn!(tenant = %tenant, error = %e, "reconciliation failed");
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResponseCache<QueryResponse> {
        &self.cache
    }

    pub fn tenants(&self) -> Vec<TenantSummary> {
        self.registry
            .all()
            .iter()
            .map(|index| {
                let g = index.current();
                TenantSummary {
                    tenant: g.tenant.clone(),
                    generation: g.generation,
                    documents: g.manifest.len(),
                    chunks: g.chunk_count(),
                    model: g.model.clone(),
                    built_at: g.built_at.to_rfc3339(),
                }
            })
            .collect()
    }

    // ============ Queries ============

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse, RagError> {
        Ok(self.query_detailed(request)?.response)
    }

    pub fn query_detailed(&self, request: &QueryRequest) -> Result<QueryOutcome, RagError> {
        let started = Instant::now();
        let outcome = self.run_query(request);
        match &outcome {
            Ok(o) => tracing::info!(
                status = ?o.response.status,
                tenant = o.response.selected_tenant.as_deref().unwrap_or("-"),
                cache_hit = o.cache_hit,
                sources = o.response.sources.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query answered"
            ),
            Err(RagError::BackendUnavailable(source)) => tracing::error!(
                error = %source,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query failed"
            ),
            Err(e) => tracing::info!(error = %e, "query rejected"),
        }
        outcome
    }

    fn run_query(&self, request: &QueryRequest) -> Result<QueryOutcome, RagError> {
        let text = request.text.trim();
        let len = text.chars().count();
        if len < MIN_QUERY_CHARS {
            return Err(RagError::InvalidQuery(format!(
                "query must be at least {} characters",
                MIN_QUERY_CHARS
            )));
        }
        if len > MAX_QUERY_CHARS {
            return Err(RagError::InvalidQuery(format!(
                "query must be at most {} characters",
                MAX_QUERY_CHARS
            )));
        }

        let (intent, _) = classify(text);
        if intent == Intent::SmallTalk {
            return Ok(QueryOutcome::fresh(QueryResponse::message(
                ResponseStatus::SmallTalk,
                "Hello! Ask me a question about your documents and I'll find the answer.",
            )));
        }
        if self.registry.queryable().is_empty() && request.tenant_hint.is_none() {
            return Ok(QueryOutcome::fresh(QueryResponse::message(
                ResponseStatus::NotConfigured,
                "No documents have been ingested yet.",
            )));
        }

        let decision = self.router.route(
            &self.registry,
            text,
            request.tenant_hint.as_deref(),
            request.auto_select,
        )?;
        tracing::debug!(?decision, "route decision");
        let (tenants, confidence) = match decision {
            RouteDecision::Single {
                tenant, confidence, ..
            } => (vec![tenant], confidence),
            RouteDecision::Merge {
                tenants, confidence, ..
            } => (tenants, confidence),
            RouteDecision::Disambiguate {
                candidates,
                confidence,
            } => return Ok(QueryOutcome::fresh(disambiguation(candidates, confidence))),
        };

        if let Some(cached) = self
            .cache
            .get(&tenants, text, |dep| self.dependency_is_current(dep))
        {
            return Ok(QueryOutcome {
                response: cached,
                cache_hit: true,
                rerank: None,
            });
        }
        let ticket = self.cache.ticket(&tenants);
        let download = is_download_intent(text);

        let indexes: Vec<Arc<TenantIndex>> = tenants
            .iter()
            .filter_map(|t| self.registry.get(t))
            .collect();
        let retrieval = self.retriever.retrieve(&indexes, text)?;
        if retrieval.chunks.is_empty() {
            let response = no_evidence(&tenants, confidence, download);
            self.cache.put(&ticket, text, response.clone(), Vec::new());
            return Ok(QueryOutcome::fresh(response));
        }

        let reranked = self.reranker.rerank(text, retrieval.chunks);
        let rerank = Some(reranked.status);
        let evidence = self.evidence.filter(text, reranked.chunks);
        if evidence.abstain {
            tracing::info!(tokens = ?evidence.tokens, "evidence guardrail abstained");
        }

        let context = assemble(
            &evidence.chunks,
            self.config.context.token_budget,
            &self.counter,
        );
        if context.included.is_empty() {
            let response = no_evidence(&tenants, confidence, download);
            self.cache.put(&ticket, text, response.clone(), Vec::new());
            return Ok(QueryOutcome {
                response,
                cache_hit: false,
                rerank,
            });
        }

        let generation = self
            .generator
            .generate(text, &context, &partition_label(&tenants))?;
        let status = match generation.status {
            GenerationStatus::Answered => ResponseStatus::Answered,
            GenerationStatus::Fallback => ResponseStatus::Fallback,
        };
        let mut response =
            QueryResponse::from_answer(status, generation.answer).routed(&tenants, confidence);
        response.sources = attribute(&context.included);
        response.is_download_intent = download;

        if status == ResponseStatus::Answered {
            let dependencies = dependencies(&context.included, &retrieval.generations);
            self.cache.put(&ticket, text, response.clone(), dependencies);
        }
        Ok(QueryOutcome {
            response,
            cache_hit: false,
            rerank,
        })
    }

    /// Whether a cached answer's dependency still matches the live manifest
    /// and storage.
    fn dependency_is_current(&self, dep: &Dependency) -> bool {
        let Some(index) = self.registry.get(&dep.tenant) else {
            return false;
        };
        if index.current().manifest.get(&dep.signature.path) != Some(&dep.signature) {
            return false;
        }
        match self.storage.stat(&dep.tenant, &dep.signature.path) {
            Ok(Some(stat)) if stat.same_stat(&dep.signature) => {}
            _ => return false,
        }
        if self.config.cache.verify_hash {
            return self
                .storage
                .hash(&dep.tenant, &dep.signature.path)
                .is_ok_and(|h| h == dep.signature.hash);
        }
        true
    }

    // ============ Ingestion ============

    /// Bring `tenant`'s index in line with storage, then invalidate its
    /// cached answers if a new generation was published.
    pub fn ingest(&self, tenant: &str, changed: &[String]) -> Result<IngestReport, RagError> {
        let report = self.pipeline.ingest(&self.registry, tenant, changed)?;
        if report.rebuilt {
            self.cache.invalidate(tenant);
        }
        Ok(report)
    }

    /// [`RagEngine::ingest`] for every tenant in storage or the registry.
    pub fn ingest_all(&self) -> Result<Vec<(String, Result<IngestReport, RagError>)>, RagError> {
        Ok(self
            .known_tenants()?
            .into_iter()
            .map(|t| {
                let result = self.ingest(&t, &[]);
                (t, result)
            })
            .collect())
    }

    /// Fetch a web page into `tenant` and ingest it.
    pub fn ingest_url(&self, tenant: &str, url: &str) -> Result<IngestReport, RagError> {
        let report = self.pipeline.ingest_url(&self.registry, tenant, url)?;
        if report.rebuilt {
            self.cache.invalidate(tenant);
        }
        Ok(report)
    }

    pub fn invalidate_cache(&self, tenant: &str) -> usize {
        self.cache.invalidate(tenant)
    }

    /// Delete a tenant's documents, index snapshot and cached answers.
    pub fn remove_tenant(&self, tenant: &str) -> Result<(), RagError> {
        let registered = self.registry.remove(tenant).is_some();
        let stored = !self.storage.list(tenant)?.is_empty();
        if !registered && !stored {
            return Err(RagError::UnknownTenant(tenant.to_string()));
        }
        remove_snapshot(&self.config.storage.index_dir, tenant)?;
        self.storage.remove_tenant(tenant)?;
        self.cache.invalidate(tenant);
        tracing::info!(tenant, "tenant removed");
        Ok(())
    }
}

fn disambiguation(candidates: Vec<TenantScore>, confidence: f32) -> QueryResponse {
    let names: Vec<&str> = candidates.iter().map(|c| c.tenant.as_str()).collect();
    let mut response = QueryResponse::message(
        ResponseStatus::Disambiguation,
        &format!(
            "Your question could apply to more than one document set ({}). \
             Choose one, or ask to search all of them.",
            names.join(", ")
        ),
    );
    response.route_confidence = confidence;
    response.needs_disambiguation = true;
    response.candidate_tenants = candidates;
    response
}

fn no_evidence(tenants: &[String], confidence: f32, download: bool) -> QueryResponse {
    let mut response =
        QueryResponse::from_answer(ResponseStatus::NoEvidence, no_evidence_answer()).routed(tenants, confidence);
    response.is_download_intent = download;
    response
}

/// File signatures behind the chunks in a context, read from the same
/// generations the chunks were retrieved from.
fn dependencies(
    included: &[ScoredChunk],
    generations: &BTreeMap<String, Arc<IndexGeneration>>,
) -> Vec<Dependency> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for sc in included {
        let path = &sc.chunk.document_id;
        if !seen.insert((sc.tenant.clone(), path.clone())) {
            continue;
        }
        if let Some(sig) = generations
            .get(&sc.tenant)
            .and_then(|g| g.manifest.get(path))
        {
            out.push(Dependency {
                tenant: sc.tenant.clone(),
                signature: sig.clone(),
            });
        }
    }
    out
}
