// Input adapters - typed records at the external-API boundary
//
// Etherscan/Dune/Arkham/Safe/Snapshot clients live outside this crate; the
// core consumes their rows as typed records through the two traits below.
// The bundled implementation is CSV-backed (warehouse exports) plus an
// in-memory source used by tests and small investigations.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

use crate::model::normalize_address;

// ============================================================================
// TYPED RECORDS
// ============================================================================

/// One native-token transfer between two addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingTransfer {
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub value_eth: f64,
    pub block_time: DateTime<Utc>,
}

/// Contract metadata for an address, when the address is a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractInfo {
    pub address: String,
    pub contract_name: Option<String>,
    pub deployer: Option<String>,
}

/// One governance vote cast by an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceVote {
    pub voter: String,
    pub space: String,
    pub proposal: String,
    pub cast_at: DateTime<Utc>,
}

/// An identity from a curated known-whale / known-entity list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub address: String,
    pub identity: String,
    pub confidence: f64,
}

// ============================================================================
// ADAPTER TRAITS
// ============================================================================

/// On-chain data: transfers and contract metadata.
pub trait ChainDataSource {
    /// Transfers touching the address, either direction.
    fn transfers_for(&self, address: &str) -> Result<Vec<FundingTransfer>>;

    /// Every transfer the source knows about (detector input).
    fn all_transfers(&self) -> Result<Vec<FundingTransfer>>;

    fn contract_info(&self, address: &str) -> Result<Option<ContractInfo>>;
}

/// Off-chain identity signals: ENS, governance, curated lists.
pub trait OsintSource {
    fn ens_name(&self, address: &str) -> Result<Option<String>>;

    fn governance_votes(&self, address: &str) -> Result<Vec<GovernanceVote>>;

    fn known_identity(&self, address: &str) -> Result<Option<KnownIdentity>>;
}

// ============================================================================
// IN-MEMORY SOURCE (CSV-backed)
// ============================================================================

/// Data source over records already in memory. `load_dir` fills it from the
/// warehouse CSV exports; tests push records directly.
#[derive(Debug, Default)]
pub struct StaticDataSource {
    transfers: Vec<FundingTransfer>,
    contracts: HashMap<String, ContractInfo>,
    ens: HashMap<String, String>,
    votes: Vec<GovernanceVote>,
    identities: HashMap<String, KnownIdentity>,
}

impl StaticDataSource {
    pub fn new() -> Self {
        StaticDataSource::default()
    }

    /// Load every export the directory holds. Missing files are fine; a
    /// directory with only `transfers.csv` still drives a useful run.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut source = StaticDataSource::new();

        let transfers = dir.join("transfers.csv");
        if transfers.exists() {
            source.transfers = load_transfers_csv(&transfers)?;
        }
        let contracts = dir.join("contracts.csv");
        if contracts.exists() {
            for c in load_contracts_csv(&contracts)? {
                source.contracts.insert(c.address.clone(), c);
            }
        }
        let ens = dir.join("ens.csv");
        if ens.exists() {
            for (address, name) in load_ens_csv(&ens)? {
                source.ens.insert(address, name);
            }
        }
        let votes = dir.join("votes.csv");
        if votes.exists() {
            source.votes = load_votes_csv(&votes)?;
        }
        let identities = dir.join("identities.csv");
        if identities.exists() {
            for k in load_identities_csv(&identities)? {
                source.identities.insert(k.address.clone(), k);
            }
        }

        Ok(source)
    }

    pub fn push_transfer(&mut self, t: FundingTransfer) {
        self.transfers.push(FundingTransfer {
            from_address: normalize_address(&t.from_address),
            to_address: normalize_address(&t.to_address),
            ..t
        });
    }

    pub fn push_contract(&mut self, c: ContractInfo) {
        let address = normalize_address(&c.address);
        self.contracts.insert(address.clone(), ContractInfo { address, ..c });
    }

    pub fn push_ens(&mut self, address: &str, name: &str) {
        self.ens.insert(normalize_address(address), name.to_string());
    }

    pub fn push_vote(&mut self, v: GovernanceVote) {
        self.votes.push(GovernanceVote {
            voter: normalize_address(&v.voter),
            ..v
        });
    }

    pub fn push_identity(&mut self, k: KnownIdentity) {
        let address = normalize_address(&k.address);
        self.identities.insert(address.clone(), KnownIdentity { address, ..k });
    }

    /// Addresses appearing anywhere in the transfer set.
    pub fn seed_addresses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        for t in &self.transfers {
            seen.insert(t.from_address.clone());
            seen.insert(t.to_address.clone());
        }
        let mut addresses: Vec<String> = seen.into_iter().collect();
        addresses.sort();
        addresses
    }

    /// Known contract addresses (shared-deposit filtering input).
    pub fn contract_addresses(&self) -> HashSet<String> {
        self.contracts.keys().cloned().collect()
    }
}

impl ChainDataSource for StaticDataSource {
    fn transfers_for(&self, address: &str) -> Result<Vec<FundingTransfer>> {
        let addr = normalize_address(address);
        Ok(self
            .transfers
            .iter()
            .filter(|t| t.from_address == addr || t.to_address == addr)
            .cloned()
            .collect())
    }

    fn all_transfers(&self) -> Result<Vec<FundingTransfer>> {
        Ok(self.transfers.clone())
    }

    fn contract_info(&self, address: &str) -> Result<Option<ContractInfo>> {
        Ok(self.contracts.get(&normalize_address(address)).cloned())
    }
}

impl OsintSource for StaticDataSource {
    fn ens_name(&self, address: &str) -> Result<Option<String>> {
        Ok(self.ens.get(&normalize_address(address)).cloned())
    }

    fn governance_votes(&self, address: &str) -> Result<Vec<GovernanceVote>> {
        let addr = normalize_address(address);
        Ok(self
            .votes
            .iter()
            .filter(|v| v.voter == addr)
            .cloned()
            .collect())
    }

    fn known_identity(&self, address: &str) -> Result<Option<KnownIdentity>> {
        Ok(self.identities.get(&normalize_address(address)).cloned())
    }
}

// ============================================================================
// CSV LOADERS
// ============================================================================
// A malformed row is a data error, not a fatal one: warn and skip, and say
// how many rows were dropped.

#[derive(Debug, Deserialize)]
struct TransferRow {
    tx_hash: String,
    block_time: String,
    from_address: String,
    to_address: String,
    value_eth: f64,
}

pub fn load_transfers_csv<P: AsRef<Path>>(path: P) -> Result<Vec<FundingTransfer>> {
    let mut rdr = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("failed to open transfers CSV {:?}", path.as_ref()))?;

    let mut transfers = Vec::new();
    let mut skipped = 0usize;
    for (i, result) in rdr.deserialize::<TransferRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!(line = i + 2, error = %e, "skipping malformed transfer row");
                skipped += 1;
                continue;
            }
        };
        let block_time = match parse_block_time(&row.block_time) {
            Some(t) => t,
            None => {
                warn!(line = i + 2, value = %row.block_time, "skipping transfer with unparseable block_time");
                skipped += 1;
                continue;
            }
        };
        transfers.push(FundingTransfer {
            tx_hash: row.tx_hash,
            from_address: normalize_address(&row.from_address),
            to_address: normalize_address(&row.to_address),
            value_eth: row.value_eth,
            block_time,
        });
    }
    if skipped > 0 {
        warn!(skipped, loaded = transfers.len(), "transfer CSV had bad rows");
    }
    Ok(transfers)
}

#[derive(Debug, Deserialize)]
struct ContractRow {
    address: String,
    contract_name: Option<String>,
    deployer: Option<String>,
}

pub fn load_contracts_csv<P: AsRef<Path>>(path: P) -> Result<Vec<ContractInfo>> {
    let mut rdr = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("failed to open contracts CSV {:?}", path.as_ref()))?;
    let mut contracts = Vec::new();
    for (i, result) in rdr.deserialize::<ContractRow>().enumerate() {
        match result {
            Ok(row) => contracts.push(ContractInfo {
                address: normalize_address(&row.address),
                contract_name: row.contract_name.filter(|s| !s.is_empty()),
                deployer: row.deployer.map(|d| normalize_address(&d)).filter(|s| !s.is_empty()),
            }),
            Err(e) => warn!(line = i + 2, error = %e, "skipping malformed contract row"),
        }
    }
    Ok(contracts)
}

#[derive(Debug, Deserialize)]
struct EnsRow {
    address: String,
    ens_name: String,
}

pub fn load_ens_csv<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String)>> {
    let mut rdr = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("failed to open ENS CSV {:?}", path.as_ref()))?;
    let mut records = Vec::new();
    for (i, result) in rdr.deserialize::<EnsRow>().enumerate() {
        match result {
            Ok(row) => records.push((normalize_address(&row.address), row.ens_name)),
            Err(e) => warn!(line = i + 2, error = %e, "skipping malformed ENS row"),
        }
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct VoteRow {
    voter: String,
    space: String,
    proposal: String,
    cast_at: String,
}

pub fn load_votes_csv<P: AsRef<Path>>(path: P) -> Result<Vec<GovernanceVote>> {
    let mut rdr = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("failed to open votes CSV {:?}", path.as_ref()))?;
    let mut votes = Vec::new();
    for (i, result) in rdr.deserialize::<VoteRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!(line = i + 2, error = %e, "skipping malformed vote row");
                continue;
            }
        };
        let cast_at = match parse_block_time(&row.cast_at) {
            Some(t) => t,
            None => {
                warn!(line = i + 2, value = %row.cast_at, "skipping vote with unparseable cast_at");
                continue;
            }
        };
        votes.push(GovernanceVote {
            voter: normalize_address(&row.voter),
            space: row.space,
            proposal: row.proposal,
            cast_at,
        });
    }
    Ok(votes)
}

#[derive(Debug, Deserialize)]
struct IdentityRow {
    address: String,
    identity: String,
    confidence: f64,
}

pub fn load_identities_csv<P: AsRef<Path>>(path: P) -> Result<Vec<KnownIdentity>> {
    let mut rdr = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("failed to open identities CSV {:?}", path.as_ref()))?;
    let mut identities = Vec::new();
    for (i, result) in rdr.deserialize::<IdentityRow>().enumerate() {
        match result {
            Ok(row) if (0.0..=1.0).contains(&row.confidence) => identities.push(KnownIdentity {
                address: normalize_address(&row.address),
                identity: row.identity,
                confidence: row.confidence,
            }),
            Ok(row) => warn!(
                line = i + 2,
                confidence = row.confidence,
                "skipping identity row with out-of-range confidence"
            ),
            Err(e) => warn!(line = i + 2, error = %e, "skipping malformed identity row"),
        }
    }
    Ok(identities)
}

/// Warehouse exports carry either RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
fn parse_block_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}
