// whalegraph - Knowledge-Graph Entity Resolution for Whale Deanonymization
// Exposes all modules for use in the CLI and tests

pub mod model;       // Row types + closed enums
pub mod store;       // Graph Store - invariant-preserving SQLite persistence
pub mod adapters;    // Typed input records + CSV loaders
pub mod pipeline;    // Layered enrichment pipeline + work queue
pub mod detectors;   // Cluster heuristics
pub mod merge;       // Cluster merge engine
pub mod propagation; // Label propagation with confidence decay
pub mod patterns;    // Entity-type template scoring

// Re-export commonly used types
pub use model::{
    normalize_address, Cluster, Entity, EntityPatch, EntityType, Evidence, Layer, NewEvidence,
    NewRelationship, QueueItem, QueueStatus, Relationship, RelationshipType, TypeSource,
    WriteSource,
};
pub use store::{GraphStats, GraphStore, LayerWrite, LayerWriteOutcome, MergeOutcome};
pub use adapters::{
    load_contracts_csv, load_ens_csv, load_identities_csv, load_transfers_csv, load_votes_csv,
    ChainDataSource, ContractInfo, FundingTransfer, GovernanceVote, KnownIdentity, OsintSource,
    StaticDataSource,
};
pub use pipeline::{enqueue_all_layers, LayerReport, Pipeline, PipelineConfig, RunReport};
pub use detectors::{ClusterCandidate, ClusterDetector, DetectionReport, DetectorConfig};
pub use merge::{MergeConfig, MergeEngine, MergeReport};
pub use propagation::{
    base_identity, cluster_member_label, label_cluster_members, propagated_label, LabelPropagator,
    PropagatedLabel, PropagationConfig, PropagationReport,
};
pub use patterns::{EntityProfile, PatternMatcher, Predicate, Template, TypeSuggestion};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
