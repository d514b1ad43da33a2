// Label Propagation Engine - decayed traversal from an identified seed
//
// Breadth-first over the relationship graph with a visited-best-confidence
// map: a node reachable over several paths keeps the maximum candidate
// confidence, never a sum, and cycles terminate because confidence only
// shrinks per hop. Branches stop at the floor threshold.

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::model::{
    normalize_address, EntityPatch, NewEvidence, RelationshipType, WriteSource,
};
use crate::store::GraphStore;

pub const PROPAGATED_SUFFIX: &str = " (propagated)";
pub const CLUSTER_MEMBER_SUFFIX: &str = " (cluster member)";

/// Strip propagation markers, however often a past bug may have stacked them.
pub fn base_identity(identity: &str) -> &str {
    let mut base = identity;
    loop {
        if let Some(stripped) = base.strip_suffix(PROPAGATED_SUFFIX) {
            base = stripped;
        } else if let Some(stripped) = base.strip_suffix(CLUSTER_MEMBER_SUFFIX) {
            base = stripped;
        } else {
            return base;
        }
    }
}

pub fn propagated_label(identity: &str) -> String {
    format!("{}{}", base_identity(identity), PROPAGATED_SUFFIX)
}

pub fn cluster_member_label(identity: &str) -> String {
    format!("{}{}", base_identity(identity), CLUSTER_MEMBER_SUFFIX)
}

// ============================================================================
// CONFIG & RESULTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Branches stop expanding below this confidence.
    pub floor: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig { floor: 0.30 }
    }
}

#[derive(Debug, Clone)]
pub struct PropagatedLabel {
    pub address: String,
    pub identity: String,
    pub confidence: f64,
    pub hops: usize,
    pub via: RelationshipType,
}

#[derive(Debug, Clone, Default)]
pub struct PropagationReport {
    pub labeled: Vec<PropagatedLabel>,
    pub conflicts_kept_existing: usize,
    pub conflicts_relabeled: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct LabelPropagator {
    pub config: PropagationConfig,
}

impl LabelPropagator {
    pub fn new(config: PropagationConfig) -> Self {
        LabelPropagator { config }
    }

    /// Propagate `identity` outward from `seed`. The seed itself is not
    /// rewritten; it is assumed to carry the identity already.
    pub fn propagate(
        &self,
        store: &mut GraphStore,
        seed: &str,
        identity: &str,
        seed_confidence: f64,
    ) -> Result<PropagationReport> {
        let seed = normalize_address(seed);
        let base = base_identity(identity).to_string();
        let mut report = PropagationReport::default();

        // address -> best confidence seen; the arena that makes cyclic
        // graphs terminate.
        let mut best: HashMap<String, f64> = HashMap::new();
        best.insert(seed.clone(), seed_confidence);
        // Best path bookkeeping for conflict resolution.
        let mut path: HashMap<String, (usize, RelationshipType)> = HashMap::new();

        let mut queue: VecDeque<(String, f64, usize)> = VecDeque::new();
        queue.push_back((seed.clone(), seed_confidence, 0));

        while let Some((address, confidence, hops)) = queue.pop_front() {
            for rel in store.relationships_for(&address)? {
                let neighbor = if rel.source == address {
                    rel.target.clone()
                } else {
                    rel.source.clone()
                };
                if neighbor == address {
                    continue;
                }
                let candidate = confidence * rel.relationship_type.propagation_weight();
                if candidate < self.config.floor {
                    continue;
                }
                // Visited with equal-or-higher confidence: stop. Keeps the
                // maximum across paths and prevents inflation through
                // re-visits.
                if best.get(&neighbor).map_or(false, |held| *held >= candidate) {
                    continue;
                }
                best.insert(neighbor.clone(), candidate);
                path.insert(neighbor.clone(), (hops + 1, rel.relationship_type));
                queue.push_back((neighbor, candidate, hops + 1));
            }
        }

        let mut targets: Vec<(String, f64)> = best
            .into_iter()
            .filter(|(address, _)| *address != seed)
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        for (address, confidence) in targets {
            let (hops, via) = path[&address];
            if let Some(label) =
                self.resolve_and_write(store, &seed, &address, &base, confidence, hops, via, &mut report)?
            {
                report.labeled.push(label);
            }
        }

        info!(
            seed = %seed,
            identity = %base,
            labeled = report.labeled.len(),
            kept = report.conflicts_kept_existing,
            "label propagation finished"
        );
        Ok(report)
    }

    /// Write one propagated label, resolving collisions with whatever
    /// identity the address already carries. Losing hypotheses become
    /// evidence, never silence.
    #[allow(clippy::too_many_arguments)]
    fn resolve_and_write(
        &self,
        store: &mut GraphStore,
        seed: &str,
        address: &str,
        base: &str,
        confidence: f64,
        hops: usize,
        via: RelationshipType,
        report: &mut PropagationReport,
    ) -> Result<Option<PropagatedLabel>> {
        let label = if hops == 1 && via == RelationshipType::SameCluster {
            cluster_member_label(base)
        } else {
            propagated_label(base)
        };
        let claim = format!(
            "identity hypothesis \"{}\" via {} ({} hops) from {}",
            base,
            via.as_str(),
            hops,
            seed
        );

        let existing = store.get_entity(address)?;
        let held_identity = existing.as_ref().and_then(|e| e.identity.clone());

        if let Some(held) = held_identity {
            let held_base = base_identity(&held).to_string();
            if held_base != base {
                let entity = existing.expect("identity implies entity");
                if !self.new_label_wins(store, seed, address, hops, via, confidence, entity.confidence)? {
                    // Existing identity stands; record the losing hypothesis.
                    store.add_evidence(&NewEvidence::new(
                        address,
                        "propagation_conflict",
                        &format!(
                            "rejected identity hypothesis \"{}\" ({:.2} via {}, {} hops from {}): kept \"{}\"",
                            base, confidence, via.as_str(), hops, seed, held_base
                        ),
                        0.05,
                    ))?;
                    report.conflicts_kept_existing += 1;
                    return Ok(None);
                }
                // New hypothesis wins; keep the old one on record.
                store.add_evidence(&NewEvidence::new(
                    address,
                    "propagation_conflict",
                    &format!(
                        "superseded identity hypothesis \"{}\" by \"{}\" ({:.2} via {}, {} hops from {})",
                        held_base, base, confidence, via.as_str(), hops, seed
                    ),
                    0.05,
                ))?;
                report.conflicts_relabeled += 1;
            }
        }

        store.add_evidence(&NewEvidence::new(address, "propagated", &claim, confidence))?;
        let mut patch = EntityPatch::new(address);
        patch.identity = Some(label.clone());
        patch.confidence = Some(confidence);
        store.upsert_entity(&patch, WriteSource::Automated)?;

        debug!(address = %address, label = %label, confidence, hops, "label propagated");
        Ok(Some(PropagatedLabel {
            address: address.to_string(),
            identity: label,
            confidence,
            hops,
            via,
        }))
    }

    /// Conflict priority: direct evidence beats multi-hop propagation, then
    /// raw confidence, then a behavioral (timezone) tiebreak.
    #[allow(clippy::too_many_arguments)]
    fn new_label_wins(
        &self,
        store: &GraphStore,
        seed: &str,
        address: &str,
        hops: usize,
        via: RelationshipType,
        new_confidence: f64,
        held_confidence: f64,
    ) -> Result<bool> {
        let evidence = store.evidence_for(address)?;

        let held_is_manual = evidence.iter().any(|e| e.source == "manual");
        if held_is_manual {
            return Ok(false);
        }

        let held_is_direct = evidence.iter().any(|e| {
            e.source == "propagated"
                && (e.claim.contains("via change_address (1 hops)")
                    || e.claim.contains("via deployed_by (1 hops)"))
        });
        let new_is_direct = hops == 1 && via.is_direct_evidence();
        match (held_is_direct, new_is_direct) {
            (true, false) => return Ok(false),
            (false, true) => return Ok(true),
            _ => {}
        }

        if (new_confidence - held_confidence).abs() > 1e-9 {
            return Ok(new_confidence > held_confidence);
        }

        // Behavioral tiebreak: a timezone fingerprint matching the seed's
        // leans toward the new hypothesis.
        let seed_tz = timezone_claim(&store.evidence_for(seed)?);
        let addr_tz = timezone_claim(&evidence);
        if let (Some(seed_tz), Some(addr_tz)) = (seed_tz, addr_tz) {
            return Ok(seed_tz == addr_tz);
        }
        Ok(false)
    }
}

fn timezone_claim(evidence: &[crate::model::Evidence]) -> Option<String> {
    evidence
        .iter()
        .filter(|e| e.source == "behavioral")
        .find_map(|e| {
            e.claim
                .starts_with("timezone guess ")
                .then(|| e.claim.clone())
        })
}

/// Name a cluster and label its members. Members other than the identified
/// address get the `(cluster member)` suffix at same_cluster decay.
pub fn label_cluster_members(
    store: &mut GraphStore,
    cluster_id: &str,
    identity: &str,
    confidence: f64,
    identified: &str,
) -> Result<usize> {
    let base = base_identity(identity).to_string();
    store.name_cluster(cluster_id, &base)?;
    let identified = normalize_address(identified);
    let decayed = confidence * RelationshipType::SameCluster.propagation_weight();
    let mut labeled = 0usize;

    for member in store.cluster_members(cluster_id)? {
        if member.address == identified {
            continue;
        }
        if member.identity.is_some() {
            continue;
        }
        store.add_evidence(&NewEvidence::new(
            &member.address,
            "propagated",
            &format!(
                "identity hypothesis \"{}\" via same_cluster (1 hops) from {}",
                base, identified
            ),
            decayed,
        ))?;
        let mut patch = EntityPatch::new(&member.address);
        patch.identity = Some(cluster_member_label(&base));
        patch.confidence = Some(decayed);
        store.upsert_entity(&patch, WriteSource::Automated)?;
        labeled += 1;
    }
    Ok(labeled)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewRelationship;

    fn funded(store: &mut GraphStore, child: &str, funder: &str) {
        store
            .add_relationship(&NewRelationship::new(
                child,
                funder,
                RelationshipType::FundedBy,
                0.75,
                "test funding",
            ))
            .unwrap();
    }

    #[test]
    fn test_suffix_never_nests() {
        assert_eq!(base_identity("Acme Fund"), "Acme Fund");
        assert_eq!(base_identity("Acme Fund (propagated)"), "Acme Fund");
        assert_eq!(base_identity("Acme Fund (cluster member)"), "Acme Fund");
        assert_eq!(
            base_identity("Acme Fund (propagated) (propagated)"),
            "Acme Fund"
        );
        assert_eq!(
            propagated_label("Acme Fund (propagated)"),
            "Acme Fund (propagated)"
        );
        assert_eq!(
            cluster_member_label("Acme Fund (propagated)"),
            "Acme Fund (cluster member)"
        );
    }

    #[test]
    fn test_funding_chain_decay_and_floor() {
        // 0xA funds 0xB (four transfers), 0xB funds 0xC once. Seeded at 0.5,
        // 0xB clears the floor at seed * 0.75 and 0xC (seed * 0.75^2) does
        // not.
        let mut store = GraphStore::in_memory().unwrap();
        funded(&mut store, "0xb", "0xa");
        funded(&mut store, "0xc", "0xb");

        let propagator = LabelPropagator::new(PropagationConfig::default());
        let report = propagator
            .propagate(&mut store, "0xa", "Acme Fund", 0.50)
            .unwrap();

        assert_eq!(report.labeled.len(), 1);
        let b = store.get_entity("0xb").unwrap().unwrap();
        assert_eq!(b.identity.as_deref(), Some("Acme Fund (propagated)"));
        assert!((b.confidence - 0.375).abs() < 1e-9, "seed 0.5 x funded_by 0.75");

        let c = store.get_entity("0xc").unwrap().unwrap();
        assert!(c.identity.is_none(), "below-floor branch must not be labeled");
    }

    #[test]
    fn test_propagation_idempotent() {
        let mut store = GraphStore::in_memory().unwrap();
        funded(&mut store, "0xb", "0xa");
        store
            .add_relationship(&NewRelationship::new(
                "0xb",
                "0xc",
                RelationshipType::SharedDeposits,
                0.9,
                "shared deposit",
            ))
            .unwrap();

        let propagator = LabelPropagator::new(PropagationConfig::default());
        propagator
            .propagate(&mut store, "0xa", "Acme Fund", 0.9)
            .unwrap();
        let first: Vec<_> = store
            .all_entities()
            .unwrap()
            .into_iter()
            .map(|e| (e.address, e.identity, e.confidence))
            .collect();
        let evidence_count = store.stats().unwrap().evidence;

        propagator
            .propagate(&mut store, "0xa", "Acme Fund", 0.9)
            .unwrap();
        let second: Vec<_> = store
            .all_entities()
            .unwrap()
            .into_iter()
            .map(|e| (e.address, e.identity, e.confidence))
            .collect();

        assert_eq!(first, second, "re-running propagation must not compound");
        assert_eq!(
            store.stats().unwrap().evidence,
            evidence_count,
            "identical claims dedup"
        );
    }

    #[test]
    fn test_multiple_paths_keep_maximum() {
        // 0xa -> 0xd directly via funded_by (0.75), and via 0xm with
        // same_entity (0.95) then shared_deposits (0.90) = 0.855.
        let mut store = GraphStore::in_memory().unwrap();
        funded(&mut store, "0xd", "0xa");
        store
            .add_relationship(&NewRelationship::new(
                "0xa",
                "0xm",
                RelationshipType::SameEntity,
                0.9,
                "same entity",
            ))
            .unwrap();
        store
            .add_relationship(&NewRelationship::new(
                "0xm",
                "0xd",
                RelationshipType::SharedDeposits,
                0.9,
                "shared deposit",
            ))
            .unwrap();

        let propagator = LabelPropagator::new(PropagationConfig::default());
        propagator
            .propagate(&mut store, "0xa", "Acme Fund", 1.0)
            .unwrap();

        let d = store.get_entity("0xd").unwrap().unwrap();
        assert!(
            (d.confidence - 0.855).abs() < 1e-9,
            "maximum of path products, not a sum; got {}",
            d.confidence
        );
    }

    #[test]
    fn test_conflict_keeps_manual_identity() {
        let mut store = GraphStore::in_memory().unwrap();
        funded(&mut store, "0xb", "0xa");

        // 0xb was manually identified before.
        let mut patch = EntityPatch::new("0xb");
        patch.identity = Some("Bravo Capital".to_string());
        patch.confidence = Some(0.6);
        store.upsert_entity(&patch, WriteSource::Manual).unwrap();
        store
            .add_evidence(&NewEvidence::new(
                "0xb",
                "manual",
                "operator identification: Bravo Capital",
                0.6,
            ))
            .unwrap();

        let propagator = LabelPropagator::new(PropagationConfig::default());
        let report = propagator
            .propagate(&mut store, "0xa", "Acme Fund", 0.95)
            .unwrap();

        let b = store.get_entity("0xb").unwrap().unwrap();
        assert_eq!(
            b.identity.as_deref(),
            Some("Bravo Capital"),
            "manual identity must survive propagation"
        );
        assert_eq!(report.conflicts_kept_existing, 1);
        // The losing hypothesis is on record, not discarded silently.
        let evidence = store.evidence_for("0xb").unwrap();
        assert!(evidence
            .iter()
            .any(|e| e.source == "propagation_conflict" && e.claim.contains("Acme Fund")));
    }

    #[test]
    fn test_conflict_direct_evidence_beats_higher_confidence() {
        let mut store = GraphStore::in_memory().unwrap();
        // 0xb reached from 0xa over change_address (direct, 1 hop).
        store
            .add_relationship(&NewRelationship::new(
                "0xa",
                "0xb",
                RelationshipType::ChangeAddress,
                0.9,
                "change output",
            ))
            .unwrap();
        let propagator = LabelPropagator::new(PropagationConfig::default());
        propagator
            .propagate(&mut store, "0xa", "Acme Fund", 0.6)
            .unwrap();
        let b = store.get_entity("0xb").unwrap().unwrap();
        assert_eq!(b.identity.as_deref(), Some("Acme Fund (propagated)"));

        // A stronger multi-hop hypothesis from elsewhere must not displace it.
        store
            .add_relationship(&NewRelationship::new(
                "0xz",
                "0xm",
                RelationshipType::SameEntity,
                0.95,
                "same entity",
            ))
            .unwrap();
        store
            .add_relationship(&NewRelationship::new(
                "0xm",
                "0xb",
                RelationshipType::SameEntity,
                0.95,
                "same entity",
            ))
            .unwrap();
        let report = propagator
            .propagate(&mut store, "0xz", "Zulu Trading", 0.99)
            .unwrap();

        let b = store.get_entity("0xb").unwrap().unwrap();
        assert_eq!(
            base_identity(b.identity.as_deref().unwrap()),
            "Acme Fund",
            "direct evidence outranks multi-hop propagation"
        );
        assert_eq!(report.conflicts_kept_existing, 1);
    }

    #[test]
    fn test_end_to_end_funding_scenario() {
        // 0xa funds 0xb four times inside 20 seconds; 0xb funds 0xc once.
        // After enrichment and detection, identifying 0xa and propagating
        // labels 0xb at seed x funded_by weight; 0xc stays below the floor.
        use crate::adapters::{ChainDataSource, FundingTransfer, StaticDataSource};
        use crate::detectors::{ClusterDetector, DetectorConfig};
        use crate::model::Layer;
        use crate::pipeline::{enqueue_all_layers, Pipeline, PipelineConfig};
        use chrono::{Duration, TimeZone, Utc};

        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut source = StaticDataSource::new();
        for secs in [0, 5, 12, 20] {
            source.push_transfer(FundingTransfer {
                tx_hash: format!("0xab{}", secs),
                from_address: "0xa".to_string(),
                to_address: "0xb".to_string(),
                value_eth: 10.0,
                block_time: t0 + Duration::seconds(secs),
            });
        }
        source.push_transfer(FundingTransfer {
            tx_hash: "0xbc".to_string(),
            from_address: "0xb".to_string(),
            to_address: "0xc".to_string(),
            value_eth: 5.0,
            block_time: t0 + Duration::seconds(100),
        });

        let mut store = GraphStore::in_memory().unwrap();
        for addr in ["0xa", "0xb", "0xc"] {
            enqueue_all_layers(&mut store, addr).unwrap();
        }
        let pipeline = Pipeline::new(&source, &source, PipelineConfig::default());
        pipeline.run(&mut store, None).unwrap();

        let transfers = source.all_transfers().unwrap();
        ClusterDetector::new(DetectorConfig::default())
            .run(&mut store, &transfers, &Default::default())
            .unwrap();

        // Four repeat transfers firm the funding edge up to 0.75.
        let rel = store
            .get_relationship("0xb", "0xa", RelationshipType::FundedBy)
            .unwrap()
            .expect("funding edge for 0xb");
        assert!((rel.confidence - 0.75).abs() < 1e-9);

        let propagator = LabelPropagator::new(PropagationConfig::default());
        propagator
            .propagate(&mut store, "0xa", "Acme Fund", 0.50)
            .unwrap();

        let b = store.get_entity("0xb").unwrap().unwrap();
        assert_eq!(b.identity.as_deref(), Some("Acme Fund (propagated)"));
        assert!((b.confidence - 0.375).abs() < 1e-9);

        let c = store.get_entity("0xc").unwrap().unwrap();
        assert!(
            c.identity.is_none(),
            "0xc's path product is under the floor"
        );
    }

    #[test]
    fn test_label_cluster_members() {
        let mut store = GraphStore::in_memory().unwrap();
        let methods = ["common_funder".to_string()].into_iter().collect();
        let cluster = store.create_cluster(None, &methods, 0.8).unwrap();
        for addr in ["0x1", "0x2", "0x3"] {
            store.ensure_entity(addr).unwrap();
            store.set_cluster(addr, &cluster.id).unwrap();
        }

        let labeled =
            label_cluster_members(&mut store, &cluster.id, "Acme Fund", 0.9, "0x1").unwrap();
        assert_eq!(labeled, 2);

        let member = store.get_entity("0x2").unwrap().unwrap();
        assert_eq!(member.identity.as_deref(), Some("Acme Fund (cluster member)"));
        assert!((member.confidence - 0.81).abs() < 1e-9, "0.9 x same_cluster 0.90");
        let named = store.get_cluster(&cluster.id).unwrap().unwrap();
        assert_eq!(named.name.as_deref(), Some("Acme Fund"));
    }
}
