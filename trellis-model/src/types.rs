//! Core KvStore value types.
//!
//! A `Value` is the unit of replication: a versioned, originator-stamped
//! byte blob with a countdown TTL. A `Publication` is the unit of
//! exchange between stores, both for incremental flooding and full-sync
//! dumps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Sentinel TTL for keys that never expire.
pub const TTL_INFINITY: i64 = i64::MIN;

/// Deterministic digest of a value's identity: `(version, originator, body)`.
///
/// The TTL fields are deliberately excluded so that TTL refreshes do not
/// change the hash.
pub fn value_hash(version: u64, originator_id: &str, value: &[u8]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&version.to_le_bytes());
    hasher.update(originator_id.as_bytes());
    hasher.update(value);
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

/// A replicated, versioned value.
///
/// `value` may be absent: hash-only copies are exchanged during full sync
/// so peers can diff stores without shipping bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub version: u64,
    pub originator_id: String,
    pub value: Option<Vec<u8>>,
    /// Remaining time to live in milliseconds, or [`TTL_INFINITY`].
    pub ttl_ms: i64,
    /// Bumped on every TTL refresh; content-neutral.
    pub ttl_version: u64,
    pub hash: u64,
}

impl Value {
    /// Build a value with its body present; computes the hash.
    pub fn new(
        version: u64,
        originator_id: impl Into<String>,
        value: Vec<u8>,
        ttl_ms: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        let hash = value_hash(version, &originator_id, &value);
        Self {
            version,
            originator_id,
            value: Some(value),
            ttl_ms,
            ttl_version: 0,
            hash,
        }
    }

    /// Copy of this value with the body stripped, for hash dumps and
    /// TTL-only advertisements.
    pub fn as_hash_only(&self) -> Self {
        Self {
            value: None,
            ..self.clone()
        }
    }

    pub fn has_body(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_expiring(&self) -> bool {
        self.ttl_ms != TTL_INFINITY
    }
}

/// Key to value mapping; keys are opaque strings.
pub type KeyVals = HashMap<String, Value>;

/// A batch of key-value mutations exchanged between stores.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Publication {
    pub key_vals: KeyVals,
    /// Keys removed by TTL expiry; delivered to local subscribers only.
    pub expired_keys: Vec<String>,
    /// Keys the receiver should send full bodies for (full-sync third leg).
    pub tobe_updated_keys: Option<Vec<String>>,
    /// Nodes this publication has already visited; used for loop prevention.
    pub node_ids: Vec<String>,
    /// Set when the sender flooded along a spanning tree rooted here.
    pub flood_root_id: Option<String>,
    pub area: String,
    pub timestamp_ms: u64,
}

impl Publication {
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

/// How a peer can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub addr: String,
    pub port: u16,
}

impl PeerSpec {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

/// Lifecycle state of a peer relative to the local store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Idle,
    Syncing,
    Initialized,
}

/// Peer membership change for one area, consumed from the peer-events
/// input queue.
#[derive(Clone, Debug, Default)]
pub struct PeerEvent {
    pub area: String,
    pub peers_to_add: HashMap<String, PeerSpec>,
    pub peers_to_del: Vec<String>,
}

/// Filter combination across the key-prefix and originator axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[default]
    Or,
    And,
}

/// Wire form of a dump request's filter set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DumpParams {
    /// Anchored-at-start regexes over keys; empty matches all keys.
    pub key_prefixes: Vec<String>,
    /// Originator ids to match; empty matches all.
    pub originator_ids: BTreeSet<String>,
    pub op: FilterOp,
    /// When present, the responder computes the difference against these
    /// hashes instead of dumping everything.
    pub key_val_hashes: Option<KeyVals>,
    /// Strip bodies from the reply.
    pub hash_only: bool,
}

impl DumpParams {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_prefixes(key_prefixes: Vec<String>) -> Self {
        Self {
            key_prefixes,
            ..Default::default()
        }
    }
}

/// Distance used by the spanning-tree algorithm for "unreachable".
pub const DUAL_DISTANCE_INFINITY: i64 = i64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DualMessageType {
    Update,
    Query,
    Reply,
}

/// One distance report between neighbors for a given flood root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DualMessage {
    pub mtype: DualMessageType,
    pub src_id: String,
    pub root_id: String,
    pub distance: i64,
}

/// Batch of DUAL messages from one neighbor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DualMessages {
    pub src_id: String,
    pub messages: Vec<DualMessage>,
}

/// Child set/unset command sent to a neighbor after a nexthop change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FloodTopoSetParams {
    /// Root the action applies to; ignored when `all_roots` is set.
    pub root_id: Option<String>,
    pub src_node_name: String,
    pub set_child: bool,
    pub all_roots: bool,
}

/// Snapshot of one root's spanning-tree state at this node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SptInfo {
    pub passive: bool,
    pub cost: i64,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
}

/// All roots known to this node plus the currently selected flood root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SptInfos {
    pub infos: HashMap<String, SptInfo>,
    pub flood_root_id: Option<String>,
    pub flood_peers: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_ttl_fields() {
        let mut a = Value::new(3, "node-a", b"payload".to_vec(), 5_000);
        let b = Value::new(3, "node-a", b"payload".to_vec(), 60_000);
        a.ttl_version = 7;
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn hash_depends_on_version_originator_and_body() {
        let base = Value::new(1, "node-a", b"x".to_vec(), TTL_INFINITY);
        assert_ne!(base.hash, Value::new(2, "node-a", b"x".to_vec(), TTL_INFINITY).hash);
        assert_ne!(base.hash, Value::new(1, "node-b", b"x".to_vec(), TTL_INFINITY).hash);
        assert_ne!(base.hash, Value::new(1, "node-a", b"y".to_vec(), TTL_INFINITY).hash);
    }

    #[test]
    fn hash_only_copy_keeps_metadata() {
        let v = Value::new(4, "node-a", b"body".to_vec(), 1_000);
        let stripped = v.as_hash_only();
        assert!(stripped.value.is_none());
        assert_eq!(stripped.hash, v.hash);
        assert_eq!(stripped.version, v.version);
    }
}
