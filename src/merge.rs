// Cluster Merge Engine - reconcile overlapping cluster detections
//
// Two clusters describing one controller show up as high-confidence
// clustering edges whose endpoints sit in different clusters. Each such
// pair is merged through GraphStore::merge_clusters; the survivor is the
// higher-confidence cluster, member count as tiebreak. Running reconcile
// again over an unchanged graph is a no-op.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::model::RelationshipType;
use crate::store::{GraphStore, MergeOutcome};

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Cross-cluster edges below this are left for a later, better-evidenced
    /// pass.
    pub min_link_confidence: f64,

    /// Safety stop for the fixpoint loop.
    pub max_rounds: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            min_link_confidence: 0.75,
            max_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub merges: Vec<MergeOutcome>,
}

impl MergeReport {
    pub fn merged(&self) -> usize {
        self.merges.len()
    }
}

pub struct MergeEngine {
    pub config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        MergeEngine { config }
    }

    /// Edge types strong enough to unify clusters on their own.
    fn is_cluster_link(kind: RelationshipType) -> bool {
        matches!(
            kind,
            RelationshipType::SameEntity
                | RelationshipType::SameCluster
                | RelationshipType::SharedDeposits
                | RelationshipType::TemporalCorrelation
        )
    }

    /// Merge until no qualifying cross-cluster edge remains.
    pub fn reconcile(&self, store: &mut GraphStore) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        for round in 0..self.config.max_rounds {
            let pair = self.find_mergeable_pair(store)?;
            let Some((a, b)) = pair else {
                break;
            };

            let (surviving, absorbed) = self.pick_survivor(store, &a, &b)?;
            debug!(round, surviving = %surviving, absorbed = %absorbed, "merging clusters");
            let outcome = store.merge_clusters(&surviving, &[absorbed])?;
            report.merges.push(outcome);
        }

        if report.merged() > 0 {
            info!(merges = report.merged(), "cluster reconciliation finished");
        }
        Ok(report)
    }

    /// First pair of distinct clusters linked by a strong clustering edge.
    fn find_mergeable_pair(&self, store: &GraphStore) -> Result<Option<(String, String)>> {
        let mut cluster_of: HashMap<String, Option<String>> = HashMap::new();
        for rel in store.all_relationships()? {
            if !Self::is_cluster_link(rel.relationship_type) {
                continue;
            }
            if rel.confidence < self.config.min_link_confidence {
                continue;
            }
            for addr in [&rel.source, &rel.target] {
                if !cluster_of.contains_key(addr.as_str()) {
                    let id = store.get_entity(addr)?.and_then(|e| e.cluster_id);
                    cluster_of.insert(addr.clone(), id);
                }
            }
            let a = cluster_of[&rel.source].clone();
            let b = cluster_of[&rel.target].clone();
            if let (Some(a), Some(b)) = (a, b) {
                if a != b {
                    return Ok(Some((a, b)));
                }
            }
        }
        Ok(None)
    }

    /// Higher confidence survives; member count breaks ties, cluster id
    /// breaks those (deterministic across runs).
    fn pick_survivor(
        &self,
        store: &GraphStore,
        a: &str,
        b: &str,
    ) -> Result<(String, String)> {
        let ca = store.get_cluster(a)?.expect("cluster a exists");
        let cb = store.get_cluster(b)?.expect("cluster b exists");
        let na = store.cluster_member_count(a)?;
        let nb = store.cluster_member_count(b)?;

        let a_wins = match ca
            .confidence
            .partial_cmp(&cb.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                if na != nb {
                    na > nb
                } else {
                    ca.id < cb.id
                }
            }
        };

        if a_wins {
            Ok((ca.id, cb.id))
        } else {
            Ok((cb.id, ca.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRelationship;
    use std::collections::BTreeSet;

    fn methods(name: &str) -> BTreeSet<String> {
        [name.to_string()].into_iter().collect()
    }

    #[test]
    fn test_reconcile_merges_linked_clusters() {
        let mut store = GraphStore::in_memory().unwrap();
        let a = store.create_cluster(None, &methods("common_funder"), 0.80).unwrap();
        let b = store.create_cluster(None, &methods("shared_deposit"), 0.60).unwrap();

        for addr in ["0x1", "0x2"] {
            store.ensure_entity(addr).unwrap();
            store.set_cluster(addr, &a.id).unwrap();
        }
        for addr in ["0x3", "0x4"] {
            store.ensure_entity(addr).unwrap();
            store.set_cluster(addr, &b.id).unwrap();
        }
        // Independent heuristics tie a member of each cluster together.
        store
            .add_relationship(&NewRelationship::new(
                "0x2",
                "0x3",
                RelationshipType::SharedDeposits,
                0.90,
                "both deposit to 0xdep",
            ))
            .unwrap();

        let engine = MergeEngine::new(MergeConfig::default());
        let report = engine.reconcile(&mut store).unwrap();

        assert_eq!(report.merged(), 1);
        assert_eq!(report.merges[0].surviving_id, a.id);
        assert!(store.get_cluster(&b.id).unwrap().is_none());
        assert_eq!(store.cluster_member_count(&a.id).unwrap(), 4);

        // The surviving cluster now carries both detection methods.
        let merged = store.get_cluster(&a.id).unwrap().unwrap();
        assert!(merged.detection_methods.contains("common_funder"));

        // Second reconcile over the unchanged graph is a no-op.
        let report = engine.reconcile(&mut store).unwrap();
        assert_eq!(report.merged(), 0);
    }

    #[test]
    fn test_reconcile_ignores_weak_links() {
        let mut store = GraphStore::in_memory().unwrap();
        let a = store.create_cluster(None, &methods("common_funder"), 0.80).unwrap();
        let b = store.create_cluster(None, &methods("common_funder"), 0.70).unwrap();
        store.ensure_entity("0x1").unwrap();
        store.set_cluster("0x1", &a.id).unwrap();
        store.ensure_entity("0x2").unwrap();
        store.set_cluster("0x2", &b.id).unwrap();

        // Below min_link_confidence, and funded_by is not a cluster link.
        store
            .add_relationship(&NewRelationship::new(
                "0x1",
                "0x2",
                RelationshipType::SameCluster,
                0.50,
                "weak",
            ))
            .unwrap();
        store
            .add_relationship(&NewRelationship::new(
                "0x1",
                "0x2",
                RelationshipType::FundedBy,
                0.95,
                "funding alone does not merge",
            ))
            .unwrap();

        let engine = MergeEngine::new(MergeConfig::default());
        let report = engine.reconcile(&mut store).unwrap();
        assert_eq!(report.merged(), 0);
        assert!(store.get_cluster(&b.id).unwrap().is_some());
    }

    #[test]
    fn test_survivor_tiebreak_by_member_count() {
        let mut store = GraphStore::in_memory().unwrap();
        let small = store.create_cluster(None, &methods("temporal_correlation"), 0.80).unwrap();
        let big = store.create_cluster(None, &methods("temporal_correlation"), 0.80).unwrap();
        store.ensure_entity("0x1").unwrap();
        store.set_cluster("0x1", &small.id).unwrap();
        for addr in ["0x2", "0x3", "0x4"] {
            store.ensure_entity(addr).unwrap();
            store.set_cluster(addr, &big.id).unwrap();
        }
        store
            .add_relationship(&NewRelationship::new(
                "0x1",
                "0x2",
                RelationshipType::TemporalCorrelation,
                0.92,
                "scripted pair",
            ))
            .unwrap();

        let engine = MergeEngine::new(MergeConfig::default());
        let report = engine.reconcile(&mut store).unwrap();
        assert_eq!(report.merged(), 1);
        assert_eq!(report.merges[0].surviving_id, big.id);
    }
}
