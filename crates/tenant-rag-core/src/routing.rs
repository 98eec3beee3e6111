//! Tenant routing math.
//!
//! The router picks the tenant(s) a query should be answered from. This
//! module holds the pure parts of that decision; the app crate supplies the
//! query embedding and the per-tenant descriptors.
//!
//! # Algorithm
//!
//! 1. Explicit mentions win: a tenant id or alias appearing as a whole word
//!    in the raw query routes there with confidence `1.0`. Two or more
//!    mentioned tenants are merged, restricted to exactly those tenants.
//! 2. Otherwise each tenant is scored as
//!    `w * cosine(query, descriptor) + (1 - w) * keyword_overlap`.
//! 3. The best score is compared against the thresholds, lower bounds
//!    inclusive:
//!
//! | Best score | `auto_select` | Decision |
//! |------------|---------------|----------|
//! | `>= high` | any | single tenant |
//! | `< high` | true | merge all tenants |
//! | `[min, high)` | false | disambiguate |
//! | `< min` | false | disambiguate (or merge all when `low_confidence_fanout`) |

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::{sort_desc_by, TenantScore};
use crate::text::{find_word, normalize_query};

/// Why a query was fanned out to several tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    ExplicitMentions,
    AutoSelect,
    LowConfidence,
}

/// Outcome of routing one query.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Answer from one tenant.
    Single {
        tenant: String,
        confidence: f32,
        explicit: bool,
    },
    /// Retrieve from every listed tenant and merge candidates before reranking.
    Merge {
        tenants: Vec<String>,
        confidence: f32,
        reason: MergeReason,
    },
    /// The caller must choose a tenant or opt into auto-select.
    Disambiguate {
        candidates: Vec<TenantScore>,
        confidence: f32,
    },
}

impl RouteDecision {
    pub fn confidence(&self) -> f32 {
        match self {
            RouteDecision::Single { confidence, .. }
            | RouteDecision::Merge { confidence, .. }
            | RouteDecision::Disambiguate { confidence, .. } => *confidence,
        }
    }
}

/// Thresholds and caller preferences for a routing decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutePolicy {
    pub high_confidence: f32,
    pub min_confidence: f32,
    pub auto_select: bool,
    pub low_confidence_fanout: bool,
}

/// Tenants named in `raw_query`, in order of first appearance.
///
/// `aliases` pairs each alias (tenant ids included) with its tenant. Matching
/// is case-insensitive, whitespace-insensitive, and whole-word only.
pub fn find_mentions(raw_query: &str, aliases: &[(String, String)]) -> Vec<String> {
    let haystack = normalize_query(raw_query);
    let mut hits: Vec<(usize, &str)> = aliases
        .iter()
        .filter_map(|(alias, tenant)| {
            find_word(&haystack, &normalize_query(alias)).map(|at| (at, tenant.as_str()))
        })
        .collect();
    hits.sort_by_key(|(at, _)| *at);

    let mut tenants: Vec<String> = Vec::new();
    for (_, tenant) in hits {
        if !tenants.iter().any(|t| t == tenant) {
            tenants.push(tenant.to_string());
        }
    }
    tenants
}

/// Decision for explicitly mentioned tenants, if any were mentioned.
pub fn route_explicit(mentions: &[String]) -> Option<RouteDecision> {
    match mentions {
        [] => None,
        [only] => Some(RouteDecision::Single {
            tenant: only.clone(),
            confidence: 1.0,
            explicit: true,
        }),
        many => Some(RouteDecision::Merge {
            tenants: many.to_vec(),
            confidence: 1.0,
            reason: MergeReason::ExplicitMentions,
        }),
    }
}

/// Fraction of query terms that appear among the tenant's terms.
pub fn keyword_overlap(query_terms: &[String], tenant_terms: &HashSet<String>) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let hits = query_terms
        .iter()
        .filter(|t| tenant_terms.contains(t.as_str()))
        .count();
    hits as f32 / query_terms.len() as f32
}

/// `w * semantic + (1 - w) * keyword`.
pub fn blended_score(semantic_weight: f32, cosine: f32, overlap: f32) -> f32 {
    semantic_weight * cosine + (1.0 - semantic_weight) * overlap
}

/// Turn blended per-tenant scores into a decision.
pub fn decide(mut scores: Vec<TenantScore>, policy: &RoutePolicy) -> RouteDecision {
    sort_desc_by(&mut scores, |s| s.score);
    let best = match scores.first() {
        Some(best) => best.clone(),
        None => {
            return RouteDecision::Disambiguate {
                candidates: Vec::new(),
                confidence: 0.0,
            }
        }
    };

    if best.score >= policy.high_confidence {
        return RouteDecision::Single {
            tenant: best.tenant,
            confidence: best.score,
            explicit: false,
        };
    }

    let fan_out = |reason| RouteDecision::Merge {
        tenants: scores.iter().map(|s| s.tenant.clone()).collect(),
        confidence: best.score,
        reason,
    };

    if policy.auto_select {
        return fan_out(MergeReason::AutoSelect);
    }
    if best.score < policy.min_confidence && policy.low_confidence_fanout {
        return fan_out(MergeReason::LowConfidence);
    }
    RouteDecision::Disambiguate {
        confidence: best.score,
        candidates: scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(auto: bool) -> RoutePolicy {
        RoutePolicy {
            high_confidence: 0.75,
            min_confidence: 0.5,
            auto_select: auto,
            low_confidence_fanout: false,
        }
    }

    fn scores(pairs: &[(&str, f32)]) -> Vec<TenantScore> {
        pairs
            .iter()
            .map(|(t, s)| TenantScore {
                tenant: t.to_string(),
                score: *s,
            })
            .collect()
    }

    fn aliases() -> Vec<(String, String)> {
        [
            ("RC", "RC"),
            ("review contractor", "RC"),
            ("HIH", "HIH"),
            ("health information handler", "HIH"),
        ]
        .iter()
        .map(|(a, t)| (a.to_string(), t.to_string()))
        .collect()
    }

    #[test]
    fn alias_mention_is_case_and_space_insensitive() {
        let m = find_mentions("What must a Review   Contractor submit?", &aliases());
        assert_eq!(m, vec!["RC"]);
    }

    #[test]
    fn alias_inside_word_is_ignored() {
        assert!(find_mentions("Which source describes this?", &aliases()).is_empty());
    }

    #[test]
    fn two_mentions_merge_in_order() {
        let m = find_mentions("compare HIH and rc rules", &aliases());
        assert_eq!(m, vec!["HIH", "RC"]);
        match route_explicit(&m) {
            Some(RouteDecision::Merge {
                tenants, reason, ..
            }) => {
                assert_eq!(tenants, vec!["HIH", "RC"]);
                assert_eq!(reason, MergeReason::ExplicitMentions);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn single_mention_has_full_confidence() {
        let d = route_explicit(&["RC".to_string()]);
        assert_eq!(
            d,
            Some(RouteDecision::Single {
                tenant: "RC".into(),
                confidence: 1.0,
                explicit: true
            })
        );
    }

    #[test]
    fn high_score_routes_directly_inclusive() {
        let d = decide(scores(&[("A", 0.75), ("B", 0.2)]), &policy(false));
        assert!(matches!(d, RouteDecision::Single { ref tenant, .. } if tenant == "A"));
    }

    #[test]
    fn middle_band_disambiguates() {
        let d = decide(scores(&[("B", 0.55), ("A", 0.6)]), &policy(false));
        match d {
            RouteDecision::Disambiguate { candidates, confidence } => {
                assert_eq!(candidates[0].tenant, "A");
                assert!((confidence - 0.6).abs() < 1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn both_below_min_disambiguates() {
        let d = decide(scores(&[("A", 0.41), ("B", 0.39)]), &policy(false));
        assert!(matches!(d, RouteDecision::Disambiguate { .. }));
    }

    #[test]
    fn low_confidence_fanout_when_enabled() {
        let mut p = policy(false);
        p.low_confidence_fanout = true;
        let d = decide(scores(&[("A", 0.41), ("B", 0.39)]), &p);
        assert!(matches!(
            d,
            RouteDecision::Merge {
                reason: MergeReason::LowConfidence,
                ..
            }
        ));
    }

    #[test]
    fn auto_select_fans_out_to_all() {
        let d = decide(scores(&[("A", 0.6), ("B", 0.1)]), &policy(true));
        match d {
            RouteDecision::Merge { tenants, reason, .. } => {
                assert_eq!(tenants, vec!["A", "B"]);
                assert_eq!(reason, MergeReason::AutoSelect);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn overlap_and_blend() {
        let terms: HashSet<String> = ["remote", "work"].iter().map(|s| s.to_string()).collect();
        let q = vec!["remote".to_string(), "days".to_string()];
        assert!((keyword_overlap(&q, &terms) - 0.5).abs() < 1e-6);
        assert!((blended_score(0.7, 0.5, 0.5) - 0.5).abs() < 1e-6);
        assert!((blended_score(0.7, 1.0, 0.0) - 0.7).abs() < 1e-6);
        assert_eq!(keyword_overlap(&[], &terms), 0.0);
    }
}
