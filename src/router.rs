//! Tenant routing.
//!
//! Order of precedence:
//! 1. a caller-supplied tenant hint;
//! 2. tenant ids or aliases mentioned in the raw query (several → merge);
//! 3. a registry with a single queryable tenant;
//! 4. blended descriptor similarity and keyword overlap, decided by
//!    [`tenant_rag_core::routing::decide`].
//!
//! Only the routing view of the query is normalized; retrieval and
//! generation always see the original text.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use tenant_rag_core::embedding::{cosine_similarity, Embedder};
use tenant_rag_core::models::TenantScore;
use tenant_rag_core::routing::{
    blended_score, decide, find_mentions, keyword_overlap, route_explicit, RouteDecision,
    RoutePolicy,
};
use tenant_rag_core::text::{normalize_query, routing_terms};

use crate::config::{alias_pairs, RoutingConfig, TenantConfig};
use crate::error::RagError;
use crate::tenants::TenantRegistry;

pub struct Router {
    embedder: Arc<dyn Embedder>,
    config: RoutingConfig,
    tenant_configs: BTreeMap<String, TenantConfig>,
}

impl Router {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        config: RoutingConfig,
        tenant_configs: BTreeMap<String, TenantConfig>,
    ) -> Self {
        Self {
            embedder,
            config,
            tenant_configs,
        }
    }

    pub fn route(
        &self,
        registry: &TenantRegistry,
        query: &str,
        tenant_hint: Option<&str>,
        auto_select: bool,
    ) -> Result<RouteDecision, RagError> {
        if let Some(hint) = tenant_hint {
            if registry.get(hint).is_none() {
                return Err(RagError::UnknownTenant(hint.to_string()));
            }
            return Ok(RouteDecision::Single {
                tenant: hint.to_string(),
                confidence: 1.0,
                explicit: true,
            });
        }

        let tenants: Vec<String> = registry
            .queryable()
            .iter()
            .map(|t| t.tenant().to_string())
            .collect();
        if tenants.is_empty() {
            return Err(RagError::NoTenants);
        }

        let mentions = find_mentions(
            query,
            &alias_pairs(&self.tenant_configs, tenants.iter().map(String::as_str)),
        );
        if let Some(decision) = route_explicit(&mentions) {
            tracing::debug!(?mentions, "routed by explicit mention");
            return Ok(decision);
        }

        if let [only] = tenants.as_slice() {
            return Ok(RouteDecision::Single {
                tenant: only.clone(),
                confidence: 1.0,
                explicit: false,
            });
        }

        let scores = self.score_tenants(registry, query)?;
        tracing::debug!(?scores, "tenant routing scores");
        let policy = RoutePolicy {
            high_confidence: self.config.high_confidence,
            min_confidence: self.config.min_confidence,
            auto_select,
            low_confidence_fanout: self.config.low_confidence_fanout,
        };
        Ok(decide(scores, &policy))
    }

    /// Blended score for every queryable tenant.
    pub fn score_tenants(
        &self,
        registry: &TenantRegistry,
        query: &str,
    ) -> Result<Vec<TenantScore>, RagError> {
        let terms = routing_terms(query);
        let routing_text = if terms.is_empty() {
            normalize_query(query)
        } else {
            terms.join(" ")
        };
        let query_vector = self.embedder.embed(&routing_text)?;

        Ok(registry
            .queryable()
            .iter()
            .map(|index| {
                let generation = index.current();
                let (cosine, overlap) = match &generation.descriptor {
                    Some(d) => {
                        let tenant_terms: HashSet<String> = d.terms.iter().cloned().collect();
                        (
                            cosine_similarity(&query_vector, &d.vector),
                            keyword_overlap(&terms, &tenant_terms),
                        )
                    }
                    None => (0.0, 0.0),
                };
                TenantScore {
                    tenant: index.tenant().to_string(),
                    score: blended_score(self.config.semantic_weight, cosine, overlap),
                }
            })
            .collect())
    }
}
