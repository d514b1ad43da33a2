// Pattern Matcher - score an entity's evidence bag against named templates
//
// Each template is a weighted set of predicates over a profile assembled
// from the store. Evidence strength aggregates as the maximum confidence
// per source category, never a sum: a hundred weak behavioral observations
// do not outweigh one strong clustering signal.

use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

use crate::model::{normalize_address, EntityType, Evidence};
use crate::store::GraphStore;

// ============================================================================
// PROFILE
// ============================================================================

/// What the matcher knows about one entity, pulled from the graph.
#[derive(Debug, Clone, Default)]
pub struct EntityProfile {
    pub address: String,
    pub is_contract: bool,
    pub contract_name: Option<String>,
    pub has_ens: bool,
    pub governance_votes: bool,
    pub bot_cadence: bool,
    pub cluster_size: usize,
    pub relationship_count: usize,
    pub evidence: Vec<Evidence>,
}

impl EntityProfile {
    pub fn build(store: &GraphStore, address: &str) -> Result<Self> {
        let address = normalize_address(address);
        let entity = store.get_entity(&address)?;
        let evidence = store.evidence_for(&address)?;
        let relationship_count = store.relationships_for(&address)?.len();
        let cluster_size = match entity.as_ref().and_then(|e| e.cluster_id.as_deref()) {
            Some(id) => store.cluster_member_count(id)? as usize,
            None => 0,
        };

        let contract_name = evidence.iter().find_map(|e| {
            e.claim
                .strip_prefix("contract name: ")
                .map(|name| name.to_string())
        });
        let has_ens = entity.as_ref().map_or(false, |e| e.ens_name.is_some());
        let governance_votes = evidence
            .iter()
            .any(|e| e.source == "osint" && e.claim.contains("governance votes"));
        let bot_cadence = evidence
            .iter()
            .any(|e| e.source == "behavioral" && e.claim.contains("machine-regular send cadence"));

        Ok(EntityProfile {
            address,
            is_contract: contract_name.is_some(),
            contract_name,
            has_ens,
            governance_votes,
            bot_cadence,
            cluster_size,
            relationship_count,
            evidence,
        })
    }

    /// Max confidence per source category, then the max of those maxima.
    pub fn evidence_support(&self) -> f64 {
        let mut per_source: HashMap<&str, f64> = HashMap::new();
        for e in &self.evidence {
            let slot = per_source.entry(e.source.as_str()).or_insert(0.0);
            if e.confidence > *slot {
                *slot = e.confidence;
            }
        }
        per_source.values().cloned().fold(0.0, f64::max)
    }
}

// ============================================================================
// TEMPLATES
// ============================================================================

/// One boolean check over the profile, with its weight in the template.
#[derive(Debug, Clone)]
pub enum Predicate {
    IsContract(bool),
    HasEns,
    VotesInGovernance,
    BotCadence,
    MinClusterSize(usize),
    MaxClusterSize(usize),
    MinRelationships(usize),
    /// Best-effort heuristic, not a strict type check: the token must appear
    /// as a substring of the reported contract name (case-insensitive), e.g.
    /// token "safe" matches "GnosisSafeProxy". The reverse direction is
    /// never checked.
    ContractNameContains(&'static str),
}

impl Predicate {
    fn holds(&self, profile: &EntityProfile) -> bool {
        match self {
            Predicate::IsContract(expected) => profile.is_contract == *expected,
            Predicate::HasEns => profile.has_ens,
            Predicate::VotesInGovernance => profile.governance_votes,
            Predicate::BotCadence => profile.bot_cadence,
            Predicate::MinClusterSize(n) => profile.cluster_size >= *n,
            Predicate::MaxClusterSize(n) => profile.cluster_size <= *n,
            Predicate::MinRelationships(n) => profile.relationship_count >= *n,
            Predicate::ContractNameContains(token) => profile
                .contract_name
                .as_deref()
                .map_or(false, |name| name.to_lowercase().contains(token)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Predicate::IsContract(true) => "is a contract".to_string(),
            Predicate::IsContract(false) => "is an EOA".to_string(),
            Predicate::HasEns => "has ENS".to_string(),
            Predicate::VotesInGovernance => "votes in governance".to_string(),
            Predicate::BotCadence => "machine-regular cadence".to_string(),
            Predicate::MinClusterSize(n) => format!("cluster of {}+", n),
            Predicate::MaxClusterSize(n) => format!("cluster of at most {}", n),
            Predicate::MinRelationships(n) => format!("{}+ relationships", n),
            Predicate::ContractNameContains(token) => format!("contract name ~ \"{}\"", token),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    pub name: &'static str,
    pub suggests: EntityType,
    pub predicates: Vec<(Predicate, f64)>,
}

impl Template {
    /// Fraction of predicate weight satisfied.
    fn score(&self, profile: &EntityProfile) -> (f64, Vec<String>) {
        let total: f64 = self.predicates.iter().map(|(_, w)| w).sum();
        let mut hit = 0.0;
        let mut matched = Vec::new();
        for (predicate, weight) in &self.predicates {
            if predicate.holds(profile) {
                hit += weight;
                matched.push(predicate.describe());
            }
        }
        if total == 0.0 {
            (0.0, matched)
        } else {
            (hit / total, matched)
        }
    }
}

// ============================================================================
// MATCHER
// ============================================================================

#[derive(Debug, Clone)]
pub struct TypeSuggestion {
    pub template: &'static str,
    pub entity_type: EntityType,
    /// Template fit in [0,1].
    pub score: f64,
    /// Fit scaled by the entity's evidence support.
    pub confidence: f64,
    pub matched: Vec<String>,
}

pub struct PatternMatcher {
    templates: Vec<Template>,
    /// Suggestions scoring below this are noise.
    pub min_score: f64,
}

impl PatternMatcher {
    pub fn new() -> Self {
        PatternMatcher {
            templates: default_templates(),
            min_score: 0.50,
        }
    }

    pub fn with_templates(templates: Vec<Template>) -> Self {
        PatternMatcher {
            templates,
            min_score: 0.50,
        }
    }

    /// Score every template; strongest first.
    pub fn score_all(&self, store: &GraphStore, address: &str) -> Result<Vec<TypeSuggestion>> {
        let profile = EntityProfile::build(store, address)?;
        let support = profile.evidence_support();

        let mut suggestions: Vec<TypeSuggestion> = self
            .templates
            .iter()
            .map(|t| {
                let (score, matched) = t.score(&profile);
                TypeSuggestion {
                    template: t.name,
                    entity_type: t.suggests,
                    score,
                    confidence: score * support,
                    matched,
                }
            })
            .collect();
        suggestions.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!(
            address = %profile.address,
            best = suggestions.first().map(|s| s.template).unwrap_or("-"),
            "templates scored"
        );
        Ok(suggestions)
    }

    /// Best suggestion clearing the score floor, if any.
    pub fn suggest(&self, store: &GraphStore, address: &str) -> Result<Option<TypeSuggestion>> {
        let suggestions = self.score_all(store, address)?;
        Ok(suggestions.into_iter().find(|s| s.score >= self.min_score))
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn default_templates() -> Vec<Template> {
    vec![
        Template {
            name: "vc_fund",
            suggests: EntityType::Fund,
            predicates: vec![
                (Predicate::IsContract(false), 1.0),
                (Predicate::MinClusterSize(3), 2.0),
                (Predicate::VotesInGovernance, 1.0),
                (Predicate::MinRelationships(5), 1.0),
            ],
        },
        Template {
            name: "protocol_treasury",
            suggests: EntityType::Protocol,
            predicates: vec![
                (Predicate::IsContract(true), 2.0),
                (Predicate::ContractNameContains("safe"), 2.0),
                (Predicate::VotesInGovernance, 1.0),
            ],
        },
        Template {
            name: "exchange_hot_wallet",
            suggests: EntityType::Exchange,
            predicates: vec![
                (Predicate::IsContract(false), 1.0),
                (Predicate::MinRelationships(50), 3.0),
                (Predicate::MaxClusterSize(1), 1.0),
            ],
        },
        Template {
            name: "mev_bot",
            suggests: EntityType::Bot,
            predicates: vec![
                (Predicate::BotCadence, 3.0),
                (Predicate::MinRelationships(10), 1.0),
            ],
        },
        Template {
            name: "whale_individual",
            suggests: EntityType::Individual,
            predicates: vec![
                (Predicate::IsContract(false), 1.0),
                (Predicate::HasEns, 1.0),
                (Predicate::VotesInGovernance, 1.0),
                (Predicate::MaxClusterSize(2), 1.0),
            ],
        },
    ]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityPatch, NewEvidence, WriteSource};

    #[test]
    fn test_evidence_support_is_max_by_source() {
        let mut store = GraphStore::in_memory().unwrap();
        store
            .add_evidence(&NewEvidence::new("0xa", "cio", "joint funding", 0.90))
            .unwrap();
        for i in 0..100 {
            store
                .add_evidence(&NewEvidence::new(
                    "0xa",
                    "behavioral",
                    &format!("weak signal {}", i),
                    0.10,
                ))
                .unwrap();
        }
        let profile = EntityProfile::build(&store, "0xa").unwrap();
        assert!(
            (profile.evidence_support() - 0.90).abs() < 1e-9,
            "sum-diluted aggregation would be wrong here"
        );
    }

    #[test]
    fn test_whale_individual_template() {
        let mut store = GraphStore::in_memory().unwrap();
        let mut patch = EntityPatch::new("0xwhale");
        patch.ens_name = Some("whale.eth".to_string());
        store.upsert_entity(&patch, WriteSource::Automated).unwrap();
        store
            .add_evidence(&NewEvidence::new(
                "0xwhale",
                "osint",
                "cast 4 governance votes across 2 spaces",
                0.60,
            ))
            .unwrap();

        let matcher = PatternMatcher::new();
        let suggestion = matcher
            .suggest(&store, "0xwhale")
            .unwrap()
            .expect("EOA with ENS and votes fits a template");
        assert_eq!(suggestion.entity_type, EntityType::Individual);
        assert_eq!(suggestion.template, "whale_individual");
        // All four predicates hold for this profile.
        assert!((suggestion.score - 1.0).abs() < 1e-9);
        assert!((suggestion.confidence - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_safe_substring_is_best_effort() {
        let mut store = GraphStore::in_memory().unwrap();
        store
            .add_evidence(&NewEvidence::new(
                "0xtreasury",
                "chain",
                "contract name: GnosisSafeProxy",
                0.90,
            ))
            .unwrap();
        store
            .add_evidence(&NewEvidence::new(
                "0xtreasury",
                "osint",
                "cast 12 governance votes across 1 spaces",
                0.60,
            ))
            .unwrap();

        let matcher = PatternMatcher::new();
        let suggestion = matcher
            .suggest(&store, "0xtreasury")
            .unwrap()
            .expect("Safe with governance fits treasury");
        assert_eq!(suggestion.entity_type, EntityType::Protocol);
        assert_eq!(suggestion.template, "protocol_treasury");
    }

    #[test]
    fn test_bot_template_from_cadence() {
        let mut store = GraphStore::in_memory().unwrap();
        store
            .add_evidence(&NewEvidence::new(
                "0xbot",
                "behavioral",
                "machine-regular send cadence (cv 0.05 over 40 sends)",
                0.60,
            ))
            .unwrap();

        let matcher = PatternMatcher::new();
        let suggestion = matcher.suggest(&store, "0xbot").unwrap().expect("bot fits");
        assert_eq!(suggestion.entity_type, EntityType::Bot);
        assert_eq!(suggestion.template, "mev_bot");
        assert!(suggestion.score >= 0.5);
    }

    #[test]
    fn test_no_suggestion_for_blank_profile() {
        let mut store = GraphStore::in_memory().unwrap();
        store.ensure_entity("0xnobody").unwrap();

        let matcher = PatternMatcher::new();
        let suggestion = matcher.suggest(&store, "0xnobody").unwrap();
        // An EOA with no signals half-matches the individual template at
        // best; anything it does match has zero evidence support.
        if let Some(s) = suggestion {
            assert_eq!(s.confidence, 0.0);
        }
    }
}
