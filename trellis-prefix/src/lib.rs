//! Prefix management for the trellis control plane.
//!
//! `PrefixManager` owns the set of prefixes this node advertises. It
//! merges entries from multiple origins per prefix, selects the winner
//! by metric, gates each advertisement through per-area import policy,
//! persists the result into the KvStore under deterministic key names,
//! and emits static routes toward the forwarding layer. Configured
//! aggregates are originated once enough more-specific RIB routes
//! support them.

pub mod entry;
pub mod manager;
pub mod originated;
pub mod policy;
pub mod prefix_key;

use ipnet::IpNet;
use std::collections::BTreeSet;

use trellis_model::{OriginatedPrefixConfig, PrefixEntry, PrefixType};

pub use entry::{pick_best_type, select_best_prefix_metrics, PrefixEntryInternal};
pub use manager::{PrefixManager, PrefixManagerHandle};
pub use originated::OriginatedRoute;
pub use policy::{NoopPolicy, PolicyAction, PolicyEngine, PolicyRule, RulePolicy};
pub use prefix_key::PrefixKey;

#[derive(Debug, thiserror::Error)]
pub enum PrefixManagerError {
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),
    #[error("missing policy: {0}")]
    PolicyMissing(String),
    #[error("kvstore: {0}")]
    KvStore(#[from] trellis_kvstore::KvStoreError),
    #[error("prefix manager stopped")]
    Stopped,
}

/// One prefix with its competing entries and the current winner.
#[derive(Clone, Debug)]
pub struct AdvertisedRouteDetail {
    pub prefix: IpNet,
    pub best_type: PrefixType,
    pub best_types: BTreeSet<PrefixType>,
    pub routes: Vec<(PrefixType, PrefixEntry)>,
}

/// Snapshot of one configured aggregate.
#[derive(Clone, Debug)]
pub struct OriginatedPrefixEntry {
    pub config: OriginatedPrefixConfig,
    pub supporting_prefixes: Vec<IpNet>,
    pub is_advertised: bool,
}
