// Core row types for the knowledge graph
// Entities, clusters, relationships, evidence and queue items share one
// SQLite store; every mutation goes through store::GraphStore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Case-normalize an address so "0xAbC…" and "0xabc…" are one entity.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

// ============================================================================
// ENTITY TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Individual,
    Fund,
    Protocol,
    Exchange,
    Bot,
    Unknown,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Individual => "individual",
            EntityType::Fund => "fund",
            EntityType::Protocol => "protocol",
            EntityType::Exchange => "exchange",
            EntityType::Bot => "bot",
            EntityType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<EntityType> {
        match s {
            "individual" => Some(EntityType::Individual),
            "fund" => Some(EntityType::Fund),
            "protocol" => Some(EntityType::Protocol),
            "exchange" => Some(EntityType::Exchange),
            "bot" => Some(EntityType::Bot),
            "unknown" => Some(EntityType::Unknown),
            _ => None,
        }
    }
}

// ============================================================================
// TYPE SOURCE (which detector set entity_type)
// ============================================================================

/// Priority ladder for entity_type writes: manual > cluster-derived >
/// behavioral. A lower-priority detector never overwrites a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeSource {
    Unset,
    Behavioral,
    Cluster,
    Manual,
}

impl TypeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeSource::Unset => "unset",
            TypeSource::Behavioral => "behavioral",
            TypeSource::Cluster => "cluster",
            TypeSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<TypeSource> {
        match s {
            "unset" => Some(TypeSource::Unset),
            "behavioral" => Some(TypeSource::Behavioral),
            "cluster" => Some(TypeSource::Cluster),
            "manual" => Some(TypeSource::Manual),
            _ => None,
        }
    }
}

// ============================================================================
// WRITE SOURCE
// ============================================================================

/// Automated writes obey the monotonic-confidence guard; manual writes
/// (operator identification) bypass it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    Automated,
    Manual,
}

impl WriteSource {
    pub fn is_manual(&self) -> bool {
        matches!(self, WriteSource::Manual)
    }
}

// ============================================================================
// RELATIONSHIP TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    SameEntity,
    SameCluster,
    SharedDeposits,
    TemporalCorrelation,
    CounterpartyOverlap,
    FundedBy,
    DeployedBy,
    ChangeAddress,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::SameEntity => "same_entity",
            RelationshipType::SameCluster => "same_cluster",
            RelationshipType::SharedDeposits => "shared_deposits",
            RelationshipType::TemporalCorrelation => "temporal_correlation",
            RelationshipType::CounterpartyOverlap => "counterparty_overlap",
            RelationshipType::FundedBy => "funded_by",
            RelationshipType::DeployedBy => "deployed_by",
            RelationshipType::ChangeAddress => "change_address",
        }
    }

    pub fn parse(s: &str) -> Option<RelationshipType> {
        match s {
            "same_entity" => Some(RelationshipType::SameEntity),
            "same_cluster" => Some(RelationshipType::SameCluster),
            "shared_deposits" => Some(RelationshipType::SharedDeposits),
            "temporal_correlation" => Some(RelationshipType::TemporalCorrelation),
            "counterparty_overlap" => Some(RelationshipType::CounterpartyOverlap),
            "funded_by" => Some(RelationshipType::FundedBy),
            "deployed_by" => Some(RelationshipType::DeployedBy),
            "change_address" => Some(RelationshipType::ChangeAddress),
            _ => None,
        }
    }

    /// Per-hop multiplier applied during label propagation.
    pub fn propagation_weight(&self) -> f64 {
        match self {
            RelationshipType::SameEntity => 0.95,
            RelationshipType::DeployedBy => 0.90,
            RelationshipType::SameCluster => 0.90,
            RelationshipType::SharedDeposits => 0.90,
            RelationshipType::TemporalCorrelation => 0.85,
            RelationshipType::ChangeAddress => 0.80,
            RelationshipType::CounterpartyOverlap => 0.80,
            RelationshipType::FundedBy => 0.75,
        }
    }

    /// Direct-evidence edge types outrank any multi-hop propagation when
    /// competing identity hypotheses collide.
    pub fn is_direct_evidence(&self) -> bool {
        matches!(
            self,
            RelationshipType::ChangeAddress | RelationshipType::DeployedBy
        )
    }
}

// ============================================================================
// QUEUE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<QueueStatus> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "error" => Some(QueueStatus::Error),
            _ => None,
        }
    }
}

/// Enrichment layers, in pipeline order. A later layer consumes earlier
/// layers' writes as extra graph evidence but runs even where they errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    Expansion,
    Behavioral,
    Osint,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Expansion, Layer::Behavioral, Layer::Osint];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Expansion => "expansion",
            Layer::Behavioral => "behavioral",
            Layer::Osint => "osint",
        }
    }

    pub fn parse(s: &str) -> Option<Layer> {
        match s {
            "expansion" => Some(Layer::Expansion),
            "behavioral" => Some(Layer::Behavioral),
            "osint" => Some(Layer::Osint),
            _ => None,
        }
    }
}

// ============================================================================
// ROWS
// ============================================================================

/// One row per blockchain address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub address: String,
    pub identity: Option<String>,
    pub entity_type: EntityType,
    pub type_source: TypeSource,
    pub confidence: f64,
    pub cluster_id: Option<String>,
    pub ens_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A detected group of addresses believed to share one controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: Option<String>,
    pub detection_methods: BTreeSet<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Directed or symmetric edge between two addresses.
/// `(source, target, relationship_type)` is the unique key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub evidence_ref: String,
    /// Cluster whose detection produced this edge, if any. Migrated to the
    /// surviving cluster when its owner is merged away.
    pub cluster_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only log entry supporting a claim about an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: i64,
    pub entity_address: String,
    pub source: String,
    pub claim: String,
    pub confidence: f64,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Unit of pending work for the enrichment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub address: String,
    pub layer: Layer,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// WRITE PAYLOADS
// ============================================================================

/// Partial entity update applied through the store's invariant guards.
#[derive(Debug, Clone)]
pub struct EntityPatch {
    pub address: String,
    pub identity: Option<String>,
    pub entity_type: Option<EntityType>,
    pub type_source: TypeSource,
    pub confidence: Option<f64>,
    pub ens_name: Option<String>,
}

impl EntityPatch {
    pub fn new(address: &str) -> Self {
        EntityPatch {
            address: normalize_address(address),
            identity: None,
            entity_type: None,
            type_source: TypeSource::Unset,
            confidence: None,
            ens_name: None,
        }
    }
}

/// Relationship write as emitted by detectors and enrichment layers.
#[derive(Debug, Clone)]
pub struct NewRelationship {
    pub source: String,
    pub target: String,
    pub relationship_type: RelationshipType,
    pub confidence: f64,
    pub evidence_ref: String,
    pub cluster_id: Option<String>,
}

impl NewRelationship {
    pub fn new(
        source: &str,
        target: &str,
        relationship_type: RelationshipType,
        confidence: f64,
        evidence_ref: &str,
    ) -> Self {
        NewRelationship {
            source: normalize_address(source),
            target: normalize_address(target),
            relationship_type,
            confidence,
            evidence_ref: evidence_ref.to_string(),
            cluster_id: None,
        }
    }
}

/// Evidence write. Identical claims from the same source dedup via hash.
#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub entity_address: String,
    pub source: String,
    pub claim: String,
    pub confidence: f64,
    pub url: Option<String>,
}

impl NewEvidence {
    pub fn new(address: &str, source: &str, claim: &str, confidence: f64) -> Self {
        NewEvidence {
            entity_address: normalize_address(address),
            source: source.to_string(),
            claim: claim.to_string(),
            confidence,
            url: None,
        }
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Deduplication hash over (address, source, claim).
    /// Re-inserting the same observation is a counted no-op, which also keeps
    /// repeated propagation runs from compounding.
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.entity_address.as_bytes());
        hasher.update(b"|");
        hasher.update(self.source.as_bytes());
        hasher.update(b"|");
        hasher.update(self.claim.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" 0xABCdef "), "0xabcdef");
        assert_eq!(normalize_address("0xabcdef"), "0xabcdef");
    }

    #[test]
    fn test_entity_type_roundtrip() {
        for t in [
            EntityType::Individual,
            EntityType::Fund,
            EntityType::Protocol,
            EntityType::Exchange,
            EntityType::Bot,
            EntityType::Unknown,
        ] {
            assert_eq!(EntityType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EntityType::parse("whale"), None);
    }

    #[test]
    fn test_relationship_type_roundtrip() {
        for t in [
            RelationshipType::SameEntity,
            RelationshipType::SameCluster,
            RelationshipType::SharedDeposits,
            RelationshipType::TemporalCorrelation,
            RelationshipType::CounterpartyOverlap,
            RelationshipType::FundedBy,
            RelationshipType::DeployedBy,
            RelationshipType::ChangeAddress,
        ] {
            assert_eq!(RelationshipType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_propagation_weights() {
        assert_eq!(RelationshipType::SameEntity.propagation_weight(), 0.95);
        assert_eq!(RelationshipType::DeployedBy.propagation_weight(), 0.90);
        assert_eq!(RelationshipType::SameCluster.propagation_weight(), 0.90);
        assert_eq!(RelationshipType::SharedDeposits.propagation_weight(), 0.90);
        assert_eq!(
            RelationshipType::TemporalCorrelation.propagation_weight(),
            0.85
        );
        assert_eq!(RelationshipType::ChangeAddress.propagation_weight(), 0.80);
        assert_eq!(
            RelationshipType::CounterpartyOverlap.propagation_weight(),
            0.80
        );
        assert_eq!(RelationshipType::FundedBy.propagation_weight(), 0.75);
    }

    #[test]
    fn test_type_source_priority() {
        assert!(TypeSource::Manual > TypeSource::Cluster);
        assert!(TypeSource::Cluster > TypeSource::Behavioral);
        assert!(TypeSource::Behavioral > TypeSource::Unset);
    }

    #[test]
    fn test_evidence_dedup_hash_stable() {
        let a = NewEvidence::new("0xAAA", "osint", "has ENS name", 0.9);
        let b = NewEvidence::new("0xaaa", "osint", "has ENS name", 0.5);
        // Confidence is not part of the hash: same observation, same row.
        assert_eq!(a.dedup_hash(), b.dedup_hash());

        let c = NewEvidence::new("0xaaa", "behavioral", "has ENS name", 0.9);
        assert_ne!(a.dedup_hash(), c.dedup_hash());
    }
}
