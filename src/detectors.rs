// Cluster Detector - heuristics over accumulated transfers and relationships
// Five strategies: Common Funder, Circular Funding, Shared Deposit,
// Temporal Correlation, Counterparty Overlap
//
// Every emitted edge goes through GraphStore::add_relationship and therefore
// obeys the monotonic-confidence rule; a weak detector never erases a strong
// one. Cluster candidates are applied here, overlaps across existing
// clusters are left for the merge engine.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::adapters::FundingTransfer;
use crate::model::{normalize_address, NewRelationship, RelationshipType};
use crate::store::GraphStore;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Window within which transfers from one funder count as coordinated.
    pub funding_window_secs: i64,

    /// Funder must reach at least this many distinct recipients.
    pub min_shared_recipients: usize,

    /// Longest funding cycle searched for (A -> B -> C -> A is length 3).
    pub max_cycle_len: usize,

    /// Deposit addresses with more distinct senders than this are treated as
    /// protocol/CEX hot wallets and skipped.
    pub deposit_max_fan_in: usize,

    /// Action-pair window for temporal correlation.
    pub temporal_window_secs: i64,

    /// Pairs needed before temporal correlation says anything.
    pub min_temporal_pairs: usize,

    /// Average delta under this earns the tightness boost.
    pub tight_delta_secs: f64,

    /// Counterparties interacting with more than this fraction of the
    /// population are noise (DEX routers, bridges) and are removed before
    /// overlap scoring. Mandatory: without it any two active DeFi users look
    /// related.
    pub noise_degree_fraction: f64,

    /// Weighted-Jaccard similarity needed to emit an overlap edge.
    pub overlap_threshold: f64,

    /// Common counterparties needed before overlap is even scored.
    pub min_shared_counterparties: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            funding_window_secs: 6 * 3600,
            min_shared_recipients: 2,
            max_cycle_len: 4,
            deposit_max_fan_in: 20,
            temporal_window_secs: 30,
            min_temporal_pairs: 3,
            tight_delta_secs: 10.0,
            noise_degree_fraction: 0.10,
            overlap_threshold: 0.35,
            min_shared_counterparties: 2,
        }
    }
}

// ============================================================================
// CANDIDATES & REPORT
// ============================================================================

/// One heuristic's proposal: a member set plus the edges that justify it.
#[derive(Debug, Clone)]
pub struct ClusterCandidate {
    pub method: &'static str,
    pub members: BTreeSet<String>,
    pub confidence: f64,
    pub relationships: Vec<NewRelationship>,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub candidates: usize,
    pub relationships_written: usize,
    pub clusters_created: usize,
    pub clusters_reinforced: usize,
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct ClusterDetector {
    pub config: DetectorConfig,
}

impl ClusterDetector {
    pub fn new(config: DetectorConfig) -> Self {
        ClusterDetector { config }
    }

    /// Run every heuristic over the transfer set and apply the proposals.
    /// `known_contracts` feeds the shared-deposit EOA filter.
    pub fn run(
        &self,
        store: &mut GraphStore,
        transfers: &[FundingTransfer],
        known_contracts: &HashSet<String>,
    ) -> Result<DetectionReport> {
        let mut candidates = self.common_funder(transfers);
        candidates.extend(self.circular_funding(transfers));
        candidates.extend(self.shared_deposit(transfers, known_contracts));
        candidates.extend(self.temporal_correlation(transfers));
        candidates.extend(self.counterparty_overlap(transfers));

        let mut report = DetectionReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            for rel in &candidate.relationships {
                if store.add_relationship(rel)? {
                    report.relationships_written += 1;
                }
            }
            self.apply_candidate(store, &candidate, &mut report)?;
        }

        info!(
            candidates = report.candidates,
            relationships = report.relationships_written,
            created = report.clusters_created,
            reinforced = report.clusters_reinforced,
            "cluster detection finished"
        );
        Ok(report)
    }

    /// Attach a candidate to the graph: extend the single existing cluster
    /// its members already sit in, or open a new one. Members spread across
    /// several clusters are evidence for a merge, which the merge engine
    /// picks up from the edges written above.
    fn apply_candidate(
        &self,
        store: &mut GraphStore,
        candidate: &ClusterCandidate,
        report: &mut DetectionReport,
    ) -> Result<()> {
        let mut existing_ids = BTreeSet::new();
        for member in &candidate.members {
            if let Some(entity) = store.get_entity(member)? {
                if let Some(id) = entity.cluster_id {
                    existing_ids.insert(id);
                }
            }
        }

        let methods: BTreeSet<String> = [candidate.method.to_string()].into_iter().collect();
        let cluster_id = match existing_ids.len() {
            0 => {
                let cluster = store.create_cluster(None, &methods, candidate.confidence)?;
                report.clusters_created += 1;
                cluster.id
            }
            1 => {
                let id = existing_ids.into_iter().next().expect("one id");
                store.reinforce_cluster(&id, &methods, candidate.confidence)?;
                report.clusters_reinforced += 1;
                id
            }
            _ => {
                // Cross-cluster candidate: reinforce the strongest and let
                // reconcile() merge the rest via the written edges.
                let mut best: Option<(String, f64)> = None;
                for id in existing_ids {
                    let c = store.get_cluster(&id)?.expect("member references it");
                    if best.as_ref().map_or(true, |(_, conf)| c.confidence > *conf) {
                        best = Some((c.id, c.confidence));
                    }
                }
                let (id, _) = best.expect("at least two ids");
                store.reinforce_cluster(&id, &methods, candidate.confidence)?;
                report.clusters_reinforced += 1;
                id
            }
        };

        for member in &candidate.members {
            store.ensure_entity(member)?;
            let entity = store.get_entity(member)?.expect("ensured");
            if entity.cluster_id.is_none() {
                store.set_cluster(member, &cluster_id)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Strategy 1: Common Funder
    // ------------------------------------------------------------------

    /// Addresses first funded by the same source inside the window likely
    /// belong to one operator spinning up wallets.
    fn common_funder(&self, transfers: &[FundingTransfer]) -> Vec<ClusterCandidate> {
        let mut by_funder: HashMap<&str, Vec<&FundingTransfer>> = HashMap::new();
        for t in transfers {
            if t.from_address != t.to_address {
                by_funder.entry(t.from_address.as_str()).or_default().push(t);
            }
        }

        let mut candidates = Vec::new();
        for (funder, txs) in by_funder {
            // First funding per recipient is what matters for wallet setup.
            let mut first_funding: HashMap<&str, DateTime<Utc>> = HashMap::new();
            for t in &txs {
                let slot = first_funding
                    .entry(t.to_address.as_str())
                    .or_insert(t.block_time);
                if t.block_time < *slot {
                    *slot = t.block_time;
                }
            }
            if first_funding.len() < self.config.min_shared_recipients {
                continue;
            }

            let mut times: Vec<DateTime<Utc>> = first_funding.values().cloned().collect();
            times.sort();
            let span = (*times.last().expect("non-empty") - times[0]).num_seconds();
            if span > self.config.funding_window_secs {
                continue;
            }

            // More wallets from one source, funded tighter together, is a
            // stronger signal.
            let n = first_funding.len();
            let mut confidence = (0.50 + 0.10 * (n as f64 - 2.0)).min(0.85);
            if span <= self.config.funding_window_secs / 4 {
                confidence = (confidence + 0.05).min(0.90);
            }

            let members: BTreeSet<String> =
                first_funding.keys().map(|a| a.to_string()).collect();
            let mut relationships = Vec::new();
            for member in &members {
                let count = txs.iter().filter(|t| t.to_address == *member).count();
                relationships.push(NewRelationship::new(
                    member,
                    funder,
                    RelationshipType::FundedBy,
                    (0.60 + 0.05 * (count as f64 - 1.0)).min(0.80),
                    &format!("funded by {} ({} transfers)", funder, count),
                ));
            }
            debug!(funder = %funder, wallets = n, span_secs = span, "common funder candidate");
            candidates.push(ClusterCandidate {
                method: "common_funder",
                members,
                confidence,
                relationships,
            });
        }
        candidates
    }

    // ------------------------------------------------------------------
    // Strategy 2: Circular Funding
    // ------------------------------------------------------------------

    /// A funding cycle A -> B -> C -> A almost never happens between
    /// strangers; treat the cycle as one controller.
    fn circular_funding(&self, transfers: &[FundingTransfer]) -> Vec<ClusterCandidate> {
        let mut edges: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for t in transfers {
            if t.from_address != t.to_address {
                edges
                    .entry(t.from_address.as_str())
                    .or_default()
                    .insert(t.to_address.as_str());
            }
        }

        let mut seen_cycles: HashSet<BTreeSet<String>> = HashSet::new();
        let mut candidates = Vec::new();
        let mut nodes: Vec<&str> = edges.keys().cloned().collect();
        nodes.sort();

        for start in nodes {
            let mut stack = vec![(start, vec![start])];
            while let Some((node, path)) = stack.pop() {
                let Some(nexts) = edges.get(node) else { continue };
                for next in nexts {
                    if *next == start && path.len() >= 2 {
                        let members: BTreeSet<String> =
                            path.iter().map(|a| a.to_string()).collect();
                        if !seen_cycles.insert(members.clone()) {
                            continue;
                        }
                        let mut relationships = Vec::new();
                        for pair in path.windows(2) {
                            relationships.push(NewRelationship::new(
                                pair[0],
                                pair[1],
                                RelationshipType::SameCluster,
                                0.90,
                                &format!("funding cycle of length {}", path.len()),
                            ));
                        }
                        relationships.push(NewRelationship::new(
                            path[path.len() - 1],
                            start,
                            RelationshipType::SameCluster,
                            0.90,
                            &format!("funding cycle of length {}", path.len()),
                        ));
                        debug!(len = path.len(), start = %start, "funding cycle found");
                        candidates.push(ClusterCandidate {
                            method: "circular_funding",
                            members,
                            confidence: 0.90,
                            relationships,
                        });
                    } else if path.len() < self.config.max_cycle_len
                        && !path.contains(next)
                        // Canonical start avoids re-finding each rotation.
                        && *next > start
                    {
                        let mut extended = path.clone();
                        extended.push(*next);
                        stack.push((*next, extended));
                    }
                }
            }
        }
        candidates
    }

    // ------------------------------------------------------------------
    // Strategy 3: Shared Deposit Destination
    // ------------------------------------------------------------------

    /// Several addresses paying into one externally-owned deposit address is
    /// the classic exchange-deposit reuse pattern. High-fan-in destinations
    /// are hot wallets, not personal deposit addresses, and are skipped.
    fn shared_deposit(
        &self,
        transfers: &[FundingTransfer],
        known_contracts: &HashSet<String>,
    ) -> Vec<ClusterCandidate> {
        let mut senders_by_deposit: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for t in transfers {
            if t.from_address != t.to_address {
                senders_by_deposit
                    .entry(t.to_address.as_str())
                    .or_default()
                    .insert(t.from_address.as_str());
            }
        }

        let mut candidates = Vec::new();
        for (deposit, senders) in senders_by_deposit {
            if known_contracts.contains(deposit) {
                continue;
            }
            if senders.len() < 2 || senders.len() > self.config.deposit_max_fan_in {
                continue;
            }

            let members: BTreeSet<String> = senders.iter().map(|a| a.to_string()).collect();
            let mut relationships = Vec::new();
            let list: Vec<&str> = senders.into_iter().collect();
            for i in 0..list.len() {
                for j in (i + 1)..list.len() {
                    relationships.push(NewRelationship::new(
                        list[i],
                        list[j],
                        RelationshipType::SharedDeposits,
                        0.90,
                        &format!("both deposit to {}", deposit),
                    ));
                }
            }
            debug!(deposit = %deposit, senders = list.len(), "shared deposit candidate");
            candidates.push(ClusterCandidate {
                method: "shared_deposit",
                members,
                confidence: 0.90,
                relationships,
            });
        }
        candidates
    }

    // ------------------------------------------------------------------
    // Strategy 4: Temporal Correlation
    // ------------------------------------------------------------------

    /// Two addresses that keep acting within seconds of each other are
    /// scripted together. Confidence is a function of pair count and
    /// tightness only, never of transaction value.
    fn temporal_correlation(&self, transfers: &[FundingTransfer]) -> Vec<ClusterCandidate> {
        let mut actions: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
        for t in transfers {
            actions.entry(t.from_address.as_str()).or_default().push(t.block_time);
        }
        for times in actions.values_mut() {
            times.sort();
        }

        let mut addresses: Vec<&str> = actions.keys().cloned().collect();
        addresses.sort();

        let mut candidates = Vec::new();
        for i in 0..addresses.len() {
            for j in (i + 1)..addresses.len() {
                let (a, b) = (addresses[i], addresses[j]);
                let (pairs, total_delta) =
                    count_correlated_pairs(&actions[a], &actions[b], self.config.temporal_window_secs);
                if pairs < self.config.min_temporal_pairs {
                    continue;
                }
                let avg_delta = total_delta / pairs as f64;
                let confidence =
                    temporal_confidence(pairs, avg_delta, self.config.tight_delta_secs);

                let members: BTreeSet<String> = [a.to_string(), b.to_string()].into();
                debug!(a = %a, b = %b, pairs, avg_delta, confidence, "temporal correlation");
                candidates.push(ClusterCandidate {
                    method: "temporal_correlation",
                    members,
                    confidence,
                    relationships: vec![NewRelationship::new(
                        a,
                        b,
                        RelationshipType::TemporalCorrelation,
                        confidence,
                        &format!("{} action pairs within {}s, avg delta {:.1}s",
                            pairs, self.config.temporal_window_secs, avg_delta),
                    )],
                });
            }
        }
        candidates
    }

    // ------------------------------------------------------------------
    // Strategy 5: Counterparty Overlap
    // ------------------------------------------------------------------

    /// Weighted Jaccard over counterparty sets, after dropping high-degree
    /// noise counterparties. Rare shared counterparties weigh more than
    /// popular ones.
    fn counterparty_overlap(&self, transfers: &[FundingTransfer]) -> Vec<ClusterCandidate> {
        let mut counterparties: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for t in transfers {
            if t.from_address == t.to_address {
                continue;
            }
            counterparties
                .entry(t.from_address.as_str())
                .or_default()
                .insert(t.to_address.as_str());
            counterparties
                .entry(t.to_address.as_str())
                .or_default()
                .insert(t.from_address.as_str());
        }

        let population = counterparties.len();
        let mut degree: HashMap<&str, usize> = HashMap::new();
        for set in counterparties.values() {
            for c in set {
                *degree.entry(c).or_default() += 1;
            }
        }
        let noise_cutoff =
            ((population as f64 * self.config.noise_degree_fraction).ceil() as usize).max(3);

        let filtered: HashMap<&str, BTreeSet<&str>> = counterparties
            .iter()
            .map(|(addr, set)| {
                let kept: BTreeSet<&str> = set
                    .iter()
                    .filter(|c| degree[*c] <= noise_cutoff)
                    .cloned()
                    .collect();
                (*addr, kept)
            })
            .collect();

        let weight = |c: &str| 1.0 / degree[c] as f64;

        let mut addresses: Vec<&str> = filtered.keys().cloned().collect();
        addresses.sort();

        let mut candidates = Vec::new();
        for i in 0..addresses.len() {
            for j in (i + 1)..addresses.len() {
                let (a, b) = (addresses[i], addresses[j]);
                let (sa, sb) = (&filtered[a], &filtered[b]);
                if sa.is_empty() || sb.is_empty() {
                    continue;
                }
                let shared: Vec<&str> = sa.intersection(sb).copied().collect();
                if shared.len() < self.config.min_shared_counterparties {
                    continue;
                }
                let inter: f64 = shared.iter().copied().map(&weight).sum();
                let union: f64 = sa.union(sb).copied().map(&weight).sum();
                let similarity = inter / union;
                if similarity < self.config.overlap_threshold {
                    continue;
                }
                let confidence = (0.50 + 0.40 * similarity).min(0.90);

                debug!(a = %a, b = %b, similarity, "counterparty overlap");
                candidates.push(ClusterCandidate {
                    method: "counterparty_overlap",
                    members: [a.to_string(), b.to_string()].into(),
                    confidence,
                    relationships: vec![NewRelationship::new(
                        a,
                        b,
                        RelationshipType::CounterpartyOverlap,
                        confidence,
                        &format!(
                            "{} shared counterparties, weighted Jaccard {:.2}",
                            shared.len(),
                            similarity
                        ),
                    )],
                });
            }
        }
        candidates
    }
}

/// Ordered action-pair count: for each of `a`'s actions, the nearest of
/// `b`'s actions within the window, each action matched at most once.
fn count_correlated_pairs(
    a: &[DateTime<Utc>],
    b: &[DateTime<Utc>],
    window_secs: i64,
) -> (usize, f64) {
    let mut pairs = 0usize;
    let mut total_delta = 0.0;
    let mut bi = 0usize;
    for ta in a {
        while bi < b.len() && (*ta - b[bi]).num_seconds() > window_secs {
            bi += 1;
        }
        if bi < b.len() {
            let delta = (b[bi] - *ta).num_seconds().abs();
            if delta <= window_secs {
                pairs += 1;
                total_delta += delta as f64;
                bi += 1;
            }
        }
    }
    (pairs, total_delta)
}

/// Banded confidence from pair count, with a tightness boost.
/// 3-4 pairs: 65-70%, 5-9: 80-85%, 10+: 90-95%; +10% when the average
/// delta is tight, capped at 100%.
fn temporal_confidence(pairs: usize, avg_delta_secs: f64, tight_secs: f64) -> f64 {
    let base = match pairs {
        0..=2 => return 0.0,
        3 => 0.65,
        4 => 0.70,
        5..=9 => 0.80 + 0.0125 * (pairs - 5) as f64,
        _ => (0.90 + 0.005 * (pairs - 10) as f64).min(0.95),
    };
    let boosted = if avg_delta_secs < tight_secs {
        base + 0.10
    } else {
        base
    };
    boosted.min(1.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn transfer(from: &str, to: &str, at: DateTime<Utc>) -> FundingTransfer {
        FundingTransfer {
            tx_hash: format!("0xtx-{}-{}-{}", from, to, at.timestamp()),
            from_address: normalize_address(from),
            to_address: normalize_address(to),
            value_eth: 1.0,
            block_time: at,
        }
    }

    #[test]
    fn test_temporal_confidence_bands() {
        assert_eq!(temporal_confidence(2, 5.0, 10.0), 0.0);
        assert!((temporal_confidence(3, 20.0, 10.0) - 0.65).abs() < 1e-9);
        assert!((temporal_confidence(4, 20.0, 10.0) - 0.70).abs() < 1e-9);
        assert!((temporal_confidence(5, 20.0, 10.0) - 0.80).abs() < 1e-9);
        assert!((temporal_confidence(9, 20.0, 10.0) - 0.85).abs() < 1e-9);
        assert!((temporal_confidence(10, 20.0, 10.0) - 0.90).abs() < 1e-9);
        assert!(temporal_confidence(30, 20.0, 10.0) <= 0.95);

        // 10 pairs at 8s average: top band plus the tightness boost, capped.
        let c = temporal_confidence(10, 8.0, 10.0);
        assert!((c - 1.0).abs() < 1e-9, "expected cap at 1.0, got {}", c);

        // Boost applies inside lower bands too.
        assert!((temporal_confidence(3, 4.0, 10.0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_temporal_correlation_detects_scripted_pair() {
        let mut store = GraphStore::in_memory().unwrap();
        let mut transfers = Vec::new();
        // 0xa and 0xb act 5 seconds apart, ten times.
        for i in 0..10 {
            let base = t0() + Duration::seconds(600 * i);
            transfers.push(transfer("0xa", "0xm1", base));
            transfers.push(transfer("0xb", "0xm2", base + Duration::seconds(5)));
        }
        let detector = ClusterDetector::new(DetectorConfig::default());
        detector.run(&mut store, &transfers, &HashSet::new()).unwrap();

        let rel = store
            .get_relationship("0xa", "0xb", RelationshipType::TemporalCorrelation)
            .unwrap()
            .expect("temporal edge");
        // 10 pairs, 5s average delta: 0.90 + 0.10 boost.
        assert!((rel.confidence - 1.0).abs() < 1e-9);

        let a = store.get_entity("0xa").unwrap().unwrap();
        let b = store.get_entity("0xb").unwrap().unwrap();
        assert!(a.cluster_id.is_some());
        assert_eq!(a.cluster_id, b.cluster_id);
    }

    #[test]
    fn test_common_funder_clusters_recipients() {
        let mut store = GraphStore::in_memory().unwrap();
        let transfers = vec![
            transfer("0xf", "0x1", t0()),
            transfer("0xf", "0x2", t0() + Duration::seconds(120)),
            transfer("0xf", "0x3", t0() + Duration::seconds(300)),
        ];
        let detector = ClusterDetector::new(DetectorConfig::default());
        let report = detector.run(&mut store, &transfers, &HashSet::new()).unwrap();
        assert!(report.clusters_created >= 1);

        let e1 = store.get_entity("0x1").unwrap().unwrap();
        let e2 = store.get_entity("0x2").unwrap().unwrap();
        let e3 = store.get_entity("0x3").unwrap().unwrap();
        assert!(e1.cluster_id.is_some());
        assert_eq!(e1.cluster_id, e2.cluster_id);
        assert_eq!(e2.cluster_id, e3.cluster_id);

        let rel = store
            .get_relationship("0x1", "0xf", RelationshipType::FundedBy)
            .unwrap();
        assert!(rel.is_some());
    }

    #[test]
    fn test_common_funder_respects_window() {
        let mut store = GraphStore::in_memory().unwrap();
        // Second wallet funded two days later: unrelated airdrop pattern.
        let transfers = vec![
            transfer("0xf", "0x1", t0()),
            transfer("0xf", "0x2", t0() + Duration::days(2)),
        ];
        let detector = ClusterDetector::new(DetectorConfig::default());
        let report = detector.run(&mut store, &transfers, &HashSet::new()).unwrap();
        assert_eq!(report.clusters_created, 0);
    }

    #[test]
    fn test_circular_funding_detected() {
        let mut store = GraphStore::in_memory().unwrap();
        let transfers = vec![
            transfer("0xa", "0xb", t0()),
            transfer("0xb", "0xc", t0() + Duration::seconds(60)),
            transfer("0xc", "0xa", t0() + Duration::seconds(120)),
        ];
        let detector = ClusterDetector::new(DetectorConfig::default());
        detector.run(&mut store, &transfers, &HashSet::new()).unwrap();

        let a = store.get_entity("0xa").unwrap().unwrap();
        let b = store.get_entity("0xb").unwrap().unwrap();
        let c = store.get_entity("0xc").unwrap().unwrap();
        assert!(a.cluster_id.is_some());
        assert_eq!(a.cluster_id, b.cluster_id);
        assert_eq!(b.cluster_id, c.cluster_id);

        let rel = store
            .get_relationship("0xa", "0xb", RelationshipType::SameCluster)
            .unwrap()
            .expect("cycle edge");
        assert!((rel.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_shared_deposit_skips_contracts_and_hot_wallets() {
        let mut store = GraphStore::in_memory().unwrap();
        let mut transfers = vec![
            // Two wallets share a personal deposit address.
            transfer("0x1", "0xdep", t0()),
            transfer("0x2", "0xdep", t0() + Duration::seconds(60)),
            // Router is a known contract.
            transfer("0x1", "0xrouter", t0()),
            transfer("0x2", "0xrouter", t0()),
        ];
        // Hot wallet with huge fan-in.
        for i in 0..30 {
            transfers.push(transfer(&format!("0xuser{}", i), "0xhot", t0()));
        }
        let contracts: HashSet<String> = ["0xrouter".to_string()].into();

        let mut config = DetectorConfig::default();
        config.min_temporal_pairs = 100; // isolate the deposit strategy
        let detector = ClusterDetector::new(config);
        detector.run(&mut store, &transfers, &contracts).unwrap();

        assert!(store
            .get_relationship("0x1", "0x2", RelationshipType::SharedDeposits)
            .unwrap()
            .is_some());
        assert!(store
            .get_relationship("0xuser0", "0xuser1", RelationshipType::SharedDeposits)
            .unwrap()
            .is_none(),
            "hot wallet fan-in must not create deposit edges");
    }

    #[test]
    fn test_counterparty_overlap_noise_filter() {
        // 0xa and 0xb share two niche counterparties plus one router that
        // everyone uses. Without the noise filter the router would relate
        // every pair in the population.
        let mut transfers = Vec::new();
        for (i, user) in ["0xa", "0xb", "0xc", "0xd", "0xe", "0xf", "0xg", "0xh"]
            .iter()
            .enumerate()
        {
            transfers.push(transfer(user, "0xrouter", t0() + Duration::seconds(i as i64 * 3600)));
        }
        transfers.push(transfer("0xa", "0xn1", t0() + Duration::days(1)));
        transfers.push(transfer("0xb", "0xn1", t0() + Duration::days(2)));
        transfers.push(transfer("0xa", "0xn2", t0() + Duration::days(3)));
        transfers.push(transfer("0xb", "0xn2", t0() + Duration::days(4)));

        let mut config = DetectorConfig::default();
        config.min_temporal_pairs = 100;
        config.min_shared_recipients = 100;
        let detector = ClusterDetector::new(config);

        let candidates = detector.counterparty_overlap(&transfers);
        let pair: Vec<_> = candidates
            .iter()
            .filter(|c| c.members.contains("0xa") && c.members.contains("0xb"))
            .collect();
        assert_eq!(pair.len(), 1, "niche overlap must be detected");

        // No candidate may pair two addresses whose only link is the router.
        for c in &candidates {
            assert!(
                !(c.members.contains("0xc") && c.members.contains("0xd")),
                "router-only overlap is noise"
            );
        }
    }

    #[test]
    fn test_detector_never_downgrades_existing_edge() {
        let mut store = GraphStore::in_memory().unwrap();
        store
            .add_relationship(&NewRelationship::new(
                "0xa",
                "0xb",
                RelationshipType::TemporalCorrelation,
                0.99,
                "manual review",
            ))
            .unwrap();

        let mut transfers = Vec::new();
        for i in 0..3 {
            let base = t0() + Duration::seconds(600 * i);
            transfers.push(transfer("0xa", "0xm1", base));
            transfers.push(transfer("0xb", "0xm2", base + Duration::seconds(25)));
        }
        let detector = ClusterDetector::new(DetectorConfig::default());
        detector.run(&mut store, &transfers, &HashSet::new()).unwrap();

        let rel = store
            .get_relationship("0xa", "0xb", RelationshipType::TemporalCorrelation)
            .unwrap()
            .unwrap();
        assert_eq!(rel.confidence, 0.99, "weaker detector run must not overwrite");
        assert_eq!(rel.evidence_ref, "manual review");
    }
}
