//! Shared data model for the trellis routing control plane.
//!
//! Plain value types that cross component boundaries: versioned store
//! values and publications, peer descriptors, spanning-tree messages,
//! prefix entries and route updates, and the daemon configuration.
//! Behavior lives in `trellis-kvstore` and `trellis-prefix`; this crate
//! only defines the vocabulary they share.

pub mod config;
pub mod constants;
pub mod prefix;
pub mod types;

pub use config::{AreaConfig, Config, KvStoreConfig, OriginatedPrefixConfig};
pub use prefix::{
    NextHop, PrefixDatabase, PrefixEntry, PrefixEvent, PrefixEventKind, PrefixMetrics,
    PrefixType, RibUnicastEntry, RouteUpdate,
};
pub use types::{
    value_hash, DualMessage, DualMessageType, DualMessages, DumpParams, FilterOp,
    FloodTopoSetParams, KeyVals, PeerEvent, PeerSpec, PeerState, Publication, SptInfo,
    SptInfos, Value, DUAL_DISTANCE_INFINITY, TTL_INFINITY,
};
