//! Prefix advertisement types.
//!
//! These cross three boundaries: the prefix-event input queue (BGP-like
//! speakers, local configuration), the decision engine's route updates,
//! and the `PrefixDatabase` bodies persisted into the KvStore.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::constants::{DEFAULT_PATH_PREFERENCE, DEFAULT_SOURCE_PREFERENCE};

/// Origin class of a prefix entry. At most one entry per (prefix, type)
/// lives in the prefix database.
///
/// The declaration order doubles as the deterministic tiebreak when
/// metrics compare equal.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PrefixType {
    Loopback,
    Bgp,
    Rib,
    Config,
    Vip,
}

/// Route selection metrics, compared lexicographically:
/// higher path preference, then higher source preference, then lower
/// distance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixMetrics {
    pub path_preference: i32,
    pub source_preference: i32,
    pub distance: i32,
}

impl Default for PrefixMetrics {
    fn default() -> Self {
        Self {
            path_preference: DEFAULT_PATH_PREFERENCE,
            source_preference: DEFAULT_SOURCE_PREFERENCE,
            distance: 0,
        }
    }
}

impl PrefixMetrics {
    /// Sort key under which the *smallest* tuple is the best route.
    pub fn rank(&self) -> (i32, i32, i32) {
        (-self.path_preference, -self.source_preference, self.distance)
    }
}

/// One advertised prefix as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixEntry {
    pub prefix: IpNet,
    pub ptype: PrefixType,
    pub metrics: PrefixMetrics,
    /// Areas this entry has already crossed, most recent last.
    pub area_stack: Vec<String>,
    pub tags: BTreeSet<String>,
    pub prepend_label: Option<i32>,
}

impl PrefixEntry {
    pub fn new(prefix: IpNet, ptype: PrefixType) -> Self {
        Self {
            prefix,
            ptype,
            metrics: PrefixMetrics::default(),
            area_stack: Vec::new(),
            tags: BTreeSet::new(),
            prepend_label: None,
        }
    }
}

/// Body persisted under a prefix key in the KvStore. A `delete_prefix`
/// body with empty entries withdraws the key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixDatabase {
    pub this_node_name: String,
    pub prefix_entries: Vec<PrefixEntry>,
    pub delete_prefix: bool,
}

/// A route's nexthop; `area` names the area the nexthop was learned in.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextHop {
    pub address: String,
    pub area: Option<String>,
}

impl NextHop {
    pub fn new(address: impl Into<String>, area: Option<String>) -> Self {
        Self {
            address: address.into(),
            area,
        }
    }
}

/// A unicast RIB route chosen by the decision engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibUnicastEntry {
    pub prefix: IpNet,
    pub nexthops: BTreeSet<NextHop>,
    pub best_entry: PrefixEntry,
    /// Area whose adjacency won best-path selection for this route.
    pub best_area: String,
}

/// Incremental route delta. Produced by the decision engine for the
/// prefix manager, and by the prefix manager for the forwarding layer.
#[derive(Clone, Debug, Default)]
pub struct RouteUpdate {
    pub unicast_to_update: HashMap<IpNet, RibUnicastEntry>,
    pub unicast_to_delete: Vec<IpNet>,
}

impl RouteUpdate {
    pub fn is_empty(&self) -> bool {
        self.unicast_to_update.is_empty() && self.unicast_to_delete.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixEventKind {
    Add,
    Withdraw,
    WithdrawByType,
    SyncByType,
}

/// Request on the prefix-event input queue.
#[derive(Clone, Debug)]
pub struct PrefixEvent {
    pub kind: PrefixEventKind,
    pub entries: Vec<PrefixEntry>,
    /// Required for the by-type event kinds.
    pub ptype: Option<PrefixType>,
    /// Target areas; empty means every configured area.
    pub dst_areas: Vec<String>,
}

impl PrefixEvent {
    pub fn add(entries: Vec<PrefixEntry>) -> Self {
        Self {
            kind: PrefixEventKind::Add,
            entries,
            ptype: None,
            dst_areas: Vec::new(),
        }
    }

    pub fn withdraw(entries: Vec<PrefixEntry>) -> Self {
        Self {
            kind: PrefixEventKind::Withdraw,
            entries,
            ptype: None,
            dst_areas: Vec::new(),
        }
    }
}
