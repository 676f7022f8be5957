//! TTL countdown queue.
//!
//! Min-heap over absolute expiry instants. Entries are never removed
//! eagerly; a popped entry is discarded when its recorded identity no
//! longer matches the live value (the key was refreshed or replaced
//! since the entry was pushed). This keeps updates O(log n) without a
//! decrease-key operation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use trellis_model::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TtlEntry {
    pub expires_at: Instant,
    pub key: String,
    pub version: u64,
    pub ttl_version: u64,
    pub originator_id: String,
}

impl Ord for TtlEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for TtlEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TtlEntry {
    /// Does this entry still describe the live value?
    pub fn matches(&self, value: &Value) -> bool {
        self.version == value.version
            && self.ttl_version == value.ttl_version
            && self.originator_id == value.originator_id
    }
}

#[derive(Debug, Default)]
pub struct TtlQueue {
    heap: BinaryHeap<Reverse<TtlEntry>>,
    /// Live expiry per key, kept in lockstep with accepted merges; used
    /// for egress TTL adjustment.
    expiry: HashMap<String, Instant>,
}

impl TtlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value's expiry. No-op for infinite-TTL values.
    pub fn track(&mut self, key: &str, value: &Value, now: Instant) {
        if !value.is_expiring() {
            self.expiry.remove(key);
            return;
        }
        let ttl = Duration::from_millis(value.ttl_ms.max(0) as u64);
        let expires_at = now + ttl;
        self.expiry.insert(key.to_string(), expires_at);
        self.heap.push(Reverse(TtlEntry {
            expires_at,
            key: key.to_string(),
            version: value.version,
            ttl_version: value.ttl_version,
            originator_id: value.originator_id.clone(),
        }));
    }

    pub fn untrack(&mut self, key: &str) {
        self.expiry.remove(key);
    }

    /// Remaining lifetime of a key, if it is tracked.
    pub fn remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        self.expiry
            .get(key)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Earliest expiry; the owner arms its timer against this.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.expires_at)
    }

    /// Pop all entries due at `now`. Staleness is the caller's call: it
    /// holds the live values to check against.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TtlEntry> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.expires_at > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
