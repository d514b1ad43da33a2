// Layered Enrichment Pipeline
//
// Queue items move pending -> processing -> {completed | error}. Each
// address's layer task is isolated: its output is committed as one
// transaction, and a failure marks that one item `error` without touching
// its siblings. Layers run in order (expansion, behavioral, osint) but a
// later layer still runs for an address whose earlier layer errored.

use anyhow::{anyhow, Result};
use chrono::Timelike;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adapters::{ChainDataSource, FundingTransfer, OsintSource};
use crate::model::{
    normalize_address, EntityPatch, EntityType, Layer, NewEvidence, NewRelationship, QueueItem,
    RelationshipType, TypeSource, WriteSource,
};
use crate::store::{GraphStore, LayerWrite};

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue items claimed per batch.
    pub batch_size: usize,

    /// Attempts before an item is surfaced as permanently failed.
    pub attempt_cap: u32,

    /// Per-address time budget. An over-budget task counts as a failure for
    /// that address only.
    pub address_budget: Duration,

    /// Sends below this are dust and carry no funding signal.
    pub min_transfer_eth: f64,

    /// Sends needed before cadence analysis says anything.
    pub min_cadence_actions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            batch_size: 50,
            attempt_cap: 3,
            address_budget: Duration::from_secs(30),
            min_transfer_eth: 0.01,
            min_cadence_actions: 10,
        }
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LayerReport {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub layers: HashMap<Layer, LayerReport>,
    pub permanently_failed: Vec<QueueItem>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.layers.values().map(|l| l.completed).sum()
    }

    pub fn failed(&self) -> usize {
        self.layers.values().map(|l| l.failed).sum()
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline<'a, C: ChainDataSource, O: OsintSource> {
    chain: &'a C,
    osint: &'a O,
    pub config: PipelineConfig,
}

/// Queue an address for every enrichment layer. Returns how many items were
/// actually created.
pub fn enqueue_all_layers(store: &mut GraphStore, address: &str) -> Result<usize> {
    let mut created = 0;
    for layer in Layer::ALL {
        if store.enqueue(address, layer)? {
            created += 1;
        }
    }
    Ok(created)
}

impl<'a, C: ChainDataSource, O: OsintSource> Pipeline<'a, C, O> {
    pub fn new(chain: &'a C, osint: &'a O, config: PipelineConfig) -> Self {
        Pipeline {
            chain,
            osint,
            config,
        }
    }

    /// Drain the queue, one layer at a time. `only` restricts the run to a
    /// single layer (CLI `run --layer`).
    pub fn run(&self, store: &mut GraphStore, only: Option<Layer>) -> Result<RunReport> {
        let mut report = RunReport::default();

        for layer in Layer::ALL {
            if let Some(filter) = only {
                if layer != filter {
                    continue;
                }
            }
            let retried = store.requeue_failed(layer, self.config.attempt_cap)?;
            if retried > 0 {
                debug!(layer = layer.as_str(), retried, "requeued failed items");
            }

            let entry = report.layers.entry(layer).or_default();
            loop {
                let items = store.claim_batch(layer, self.config.batch_size)?;
                if items.is_empty() {
                    break;
                }
                for item in items {
                    // Per-item commit: an exception here never marks a
                    // sibling completed.
                    let started = Instant::now();
                    let result = self
                        .layer_write(layer, &item.address)
                        .and_then(|write| store.apply_layer_write(&write));
                    let elapsed = started.elapsed();

                    match result {
                        Ok(_) if elapsed > self.config.address_budget => {
                            warn!(
                                address = %item.address,
                                layer = layer.as_str(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "layer task exceeded per-address budget"
                            );
                            store.mark_error(
                                &item.address,
                                layer,
                                &format!("exceeded per-address budget ({:?})", elapsed),
                            )?;
                            entry.failed += 1;
                        }
                        Ok(outcome) => {
                            debug!(
                                address = %item.address,
                                layer = layer.as_str(),
                                relationships = outcome.relationships_written,
                                evidence = outcome.evidence_written,
                                enqueued = outcome.enqueued,
                                "layer task completed"
                            );
                            store.mark_completed(&item.address, layer)?;
                            entry.completed += 1;
                        }
                        Err(e) => {
                            warn!(
                                address = %item.address,
                                layer = layer.as_str(),
                                error = %e,
                                "layer task failed"
                            );
                            store.mark_error(&item.address, layer, &e.to_string())?;
                            entry.failed += 1;
                        }
                    }
                }
            }
            info!(
                layer = layer.as_str(),
                completed = entry.completed,
                failed = entry.failed,
                "layer drained"
            );
        }

        report.permanently_failed = store.permanently_failed(self.config.attempt_cap)?;
        Ok(report)
    }

    /// Build one address's layer output. Pure with respect to the store:
    /// all writes happen atomically in `apply_layer_write`.
    fn layer_write(&self, layer: Layer, address: &str) -> Result<LayerWrite> {
        match layer {
            Layer::Expansion => self.expansion_write(address),
            Layer::Behavioral => self.behavioral_write(address),
            Layer::Osint => self.osint_write(address),
        }
    }

    // ------------------------------------------------------------------
    // Layer 1: on-chain expansion
    // ------------------------------------------------------------------

    fn expansion_write(&self, address: &str) -> Result<LayerWrite> {
        let addr = normalize_address(address);
        let mut write = LayerWrite::new(&addr);
        let transfers = self.chain.transfers_for(&addr)?;

        let mut inbound: HashMap<String, Vec<&FundingTransfer>> = HashMap::new();
        let mut outbound = 0usize;
        for t in &transfers {
            if t.value_eth < self.config.min_transfer_eth {
                continue;
            }
            if t.to_address == addr {
                inbound.entry(t.from_address.clone()).or_default().push(t);
            } else if t.from_address == addr {
                outbound += 1;
                write.enqueue.extend(
                    Layer::ALL
                        .iter()
                        .map(|l| (t.to_address.clone(), *l)),
                );
            }
        }

        for (funder, txs) in &inbound {
            if *funder == addr {
                continue;
            }
            // Repeat funding from one source firms the edge up; the hard
            // common-funder confidence comes from the cluster detector.
            let confidence = (0.60 + 0.05 * (txs.len() as f64 - 1.0)).min(0.80);
            write.relationships.push(NewRelationship::new(
                &addr,
                funder,
                RelationshipType::FundedBy,
                confidence,
                &format!("{} transfers, first tx {}", txs.len(), txs[0].tx_hash),
            ));
            write
                .enqueue
                .extend(Layer::ALL.iter().map(|l| (funder.clone(), *l)));
        }

        if !transfers.is_empty() {
            let total_in: usize = inbound.values().map(Vec::len).sum();
            write.evidence.push(NewEvidence::new(
                &addr,
                "chain",
                &format!(
                    "observed {} transfers ({} in from {} funders, {} out)",
                    transfers.len(),
                    total_in,
                    inbound.len(),
                    outbound
                ),
                0.30,
            ));
        }

        if let Some(info) = self.chain.contract_info(&addr)? {
            if let Some(name) = &info.contract_name {
                write.evidence.push(NewEvidence::new(
                    &addr,
                    "chain",
                    &format!("contract name: {}", name),
                    0.90,
                ));
            }
            if let Some(deployer) = &info.deployer {
                write.relationships.push(NewRelationship::new(
                    &addr,
                    deployer,
                    RelationshipType::DeployedBy,
                    0.85,
                    "contract deployment record",
                ));
                write
                    .enqueue
                    .extend(Layer::ALL.iter().map(|l| (deployer.clone(), *l)));
            }
        }

        Ok(write)
    }

    // ------------------------------------------------------------------
    // Layer 2: behavioral fingerprinting
    // ------------------------------------------------------------------

    fn behavioral_write(&self, address: &str) -> Result<LayerWrite> {
        let addr = normalize_address(address);
        let mut write = LayerWrite::new(&addr);
        let transfers = self.chain.transfers_for(&addr)?;

        // Fingerprint what the controller initiates, not what lands on them.
        let mut sends: Vec<_> = transfers
            .iter()
            .filter(|t| t.from_address == addr)
            .collect();
        sends.sort_by_key(|t| t.block_time);
        if sends.is_empty() {
            return Ok(write);
        }

        let mut hour_counts = [0usize; 24];
        for t in &sends {
            hour_counts[t.block_time.hour() as usize] += 1;
        }
        let (peak_hour, peak_count) = hour_counts
            .iter()
            .enumerate()
            .max_by_key(|(_, n)| **n)
            .map(|(h, n)| (h, *n))
            .unwrap_or((0, 0));

        write.evidence.push(NewEvidence::new(
            &addr,
            "behavioral",
            &format!(
                "activity peaks at UTC {:02}:00 ({} of {} sends)",
                peak_hour,
                peak_count,
                sends.len()
            ),
            0.35,
        ));

        if sends.len() >= self.config.min_cadence_actions {
            // Timezone guess assumes a business-hours peak around 13:00
            // local. Known to mislabel night-active traders, hence the low
            // confidence and signal-only use.
            let offset = ((peak_hour as i64 - 13).rem_euclid(24) + 11) % 24 - 11;
            write.evidence.push(NewEvidence::new(
                &addr,
                "behavioral",
                &format!("timezone guess UTC{:+} from activity peak", -offset),
                0.40,
            ));

            let deltas: Vec<f64> = sends
                .windows(2)
                .map(|w| (w[1].block_time - w[0].block_time).num_seconds() as f64)
                .collect();
            let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
            if mean > 0.0 {
                let var = deltas
                    .iter()
                    .map(|d| (d - mean) * (d - mean))
                    .sum::<f64>()
                    / deltas.len() as f64;
                let cv = var.sqrt() / mean;
                if cv < 0.25 {
                    write.evidence.push(NewEvidence::new(
                        &addr,
                        "behavioral",
                        &format!(
                            "machine-regular send cadence (cv {:.2} over {} sends)",
                            cv,
                            sends.len()
                        ),
                        0.60,
                    ));
                    let mut patch = EntityPatch::new(&addr);
                    patch.entity_type = Some(EntityType::Bot);
                    patch.type_source = TypeSource::Behavioral;
                    write.entity = Some(patch);
                }
            }
        }

        Ok(write)
    }

    // ------------------------------------------------------------------
    // Layer 3: OSINT aggregation
    // ------------------------------------------------------------------

    fn osint_write(&self, address: &str) -> Result<LayerWrite> {
        let addr = normalize_address(address);
        let mut write = LayerWrite::new(&addr);
        let mut patch = EntityPatch::new(&addr);
        let mut touched = false;

        if let Some(name) = self.osint.ens_name(&addr)? {
            write.evidence.push(
                NewEvidence::new(&addr, "osint", &format!("ENS reverse record {}", name), 0.80)
                    .with_url(&format!("https://app.ens.domains/{}", name)),
            );
            patch.ens_name = Some(name);
            touched = true;
        }

        let votes = self.osint.governance_votes(&addr)?;
        if !votes.is_empty() {
            let mut spaces: Vec<&str> = votes.iter().map(|v| v.space.as_str()).collect();
            spaces.sort();
            spaces.dedup();
            write.evidence.push(NewEvidence::new(
                &addr,
                "osint",
                &format!(
                    "cast {} governance votes across {} spaces",
                    votes.len(),
                    spaces.len()
                ),
                0.60,
            ));
        }

        if let Some(known) = self.osint.known_identity(&addr)? {
            write.evidence.push(NewEvidence::new(
                &addr,
                "known_whale",
                &format!("curated list identity: {}", known.identity),
                known.confidence,
            ));
            patch.identity = Some(known.identity);
            patch.confidence = Some(known.confidence);
            touched = true;
        }

        if touched {
            write.entity = Some(patch);
        }
        Ok(write)
    }
}

// Adapter errors surface per-address; give them a uniform shape.
pub fn adapter_error(kind: &str, address: &str, detail: &str) -> anyhow::Error {
    anyhow!("{} adapter failed for {}: {}", kind, address, detail)
}

// ============================================================================
// TESTS
// ============================================================================
