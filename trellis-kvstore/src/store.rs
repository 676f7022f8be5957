//! Versioned value store: compare and merge semantics.
//!
//! Pure functions over a [`KeyVals`] map. The per-key winner is the
//! unique maximum under [`compare_values`]; merging is commutative and
//! idempotent, which is what makes flooding eventually consistent.

use std::collections::HashMap;

use trellis_model::{KeyVals, Value};

use crate::filters::KvFilters;

/// Outcome of comparing two values for the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueCmp {
    ABetter,
    BBetter,
    Equal,
    /// One side carries only a hash and the hashes disagree, so the
    /// bodies cannot be ordered.
    Unknown,
}

/// Total order over values: version, then originator id, then body bytes,
/// then TTL version. Higher wins at every step.
pub fn compare_values(a: &Value, b: &Value) -> ValueCmp {
    if a.version != b.version {
        return if a.version > b.version {
            ValueCmp::ABetter
        } else {
            ValueCmp::BBetter
        };
    }
    if a.originator_id != b.originator_id {
        return if a.originator_id > b.originator_id {
            ValueCmp::ABetter
        } else {
            ValueCmp::BBetter
        };
    }
    match (&a.value, &b.value) {
        (Some(av), Some(bv)) if av != bv => {
            return if av > bv {
                ValueCmp::ABetter
            } else {
                ValueCmp::BBetter
            };
        }
        (Some(_), Some(_)) => {}
        // At least one side is hash-only: comparable only if the hashes
        // agree, in which case the bodies are identical by construction.
        _ => {
            if a.hash != b.hash {
                return ValueCmp::Unknown;
            }
        }
    }
    if a.ttl_version != b.ttl_version {
        return if a.ttl_version > b.ttl_version {
            ValueCmp::ABetter
        } else {
            ValueCmp::BBetter
        };
    }
    ValueCmp::Equal
}

/// What a merge pass changed.
#[derive(Debug, Default)]
pub struct MergeResult {
    /// Accepted changes, keyed like the store. TTL-only refreshes appear
    /// body-stripped; everything else carries the full value.
    pub updates: KeyVals,
    /// Keys whose ordering came back [`ValueCmp::Unknown`]; the caller
    /// should request full bodies from the sender.
    pub to_request: Vec<String>,
    /// Entries dropped by the filter set.
    pub filtered: u64,
}

impl MergeResult {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.to_request.is_empty()
    }
}

/// Merge `update` into `store`, returning only what actually changed.
///
/// A TTL-only advance (same version, originator, and body hash) refreshes
/// the stored TTL in place and surfaces as a body-stripped entry in
/// `updates` so downstream consumers can tell it apart from a content
/// change.
pub fn merge_key_values(
    store: &mut KeyVals,
    update: KeyVals,
    filters: Option<&KvFilters>,
) -> MergeResult {
    let mut result = MergeResult::default();

    for (key, received) in update {
        if let Some(f) = filters {
            if !f.matches(&key, &received) {
                result.filtered += 1;
                continue;
            }
        }

        match store.get_mut(&key) {
            None => {
                // Hash-only values cannot be materialized into the store.
                if received.has_body() {
                    store.insert(key.clone(), received.clone());
                    result.updates.insert(key, received);
                }
            }
            Some(existing) => match compare_values(&received, existing) {
                ValueCmp::ABetter => {
                    let ttl_only = received.version == existing.version
                        && received.originator_id == existing.originator_id
                        && received.hash == existing.hash;
                    if ttl_only {
                        // Newer TTL on an identical body: refresh in place.
                        existing.ttl_ms = received.ttl_ms;
                        existing.ttl_version = received.ttl_version;
                        result.updates.insert(key, received.as_hash_only());
                    } else if received.has_body() {
                        *existing = received.clone();
                        result.updates.insert(key, received);
                    }
                    // Better by version but bodyless: nothing to apply;
                    // the sender's next full exchange carries the body.
                }
                ValueCmp::Equal | ValueCmp::BBetter => {}
                ValueCmp::Unknown => result.to_request.push(key),
            },
        }
    }

    result
}

/// Dump entries matching `filters`, optionally stripping bodies.
pub fn dump_with_filters(store: &KeyVals, filters: &KvFilters, hash_only: bool) -> KeyVals {
    store
        .iter()
        .filter(|(k, v)| filters.matches(k, v))
        .map(|(k, v)| {
            let v = if hash_only { v.as_hash_only() } else { v.clone() };
            (k.clone(), v)
        })
        .collect()
}

/// Responder half of full sync: given the initiator's hashes, return the
/// entries it is missing or holds a worse copy of, plus the keys where
/// the initiator is strictly better (or unordered) so it can send bodies
/// back.
pub fn dump_difference(
    store: &KeyVals,
    their_hashes: &KeyVals,
) -> (KeyVals, Vec<String>) {
    let mut to_send = HashMap::new();
    let mut tobe_updated = Vec::new();

    for (key, mine) in store {
        match their_hashes.get(key) {
            None => {
                to_send.insert(key.clone(), mine.clone());
            }
            Some(theirs) => match compare_values(mine, theirs) {
                ValueCmp::ABetter => {
                    to_send.insert(key.clone(), mine.clone());
                }
                ValueCmp::BBetter => tobe_updated.push(key.clone()),
                // Can't order the bodies: ship mine, ask for theirs, and
                // let merge settle it on both ends.
                ValueCmp::Unknown => {
                    to_send.insert(key.clone(), mine.clone());
                    tobe_updated.push(key.clone());
                }
                ValueCmp::Equal => {}
            },
        }
    }

    for key in their_hashes.keys() {
        if !store.contains_key(key) {
            tobe_updated.push(key.clone());
        }
    }

    (to_send, tobe_updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_model::TTL_INFINITY;

    fn v(version: u64, originator: &str, body: &[u8]) -> Value {
        Value::new(version, originator, body.to_vec(), TTL_INFINITY)
    }

    #[test]
    fn higher_version_wins() {
        let a = v(2, "a", b"x");
        let b = v(1, "z", b"zzz");
        assert_eq!(compare_values(&a, &b), ValueCmp::ABetter);
        assert_eq!(compare_values(&b, &a), ValueCmp::BBetter);
    }

    #[test]
    fn originator_breaks_version_tie() {
        let a = v(1, "node-a", b"x");
        let b = v(1, "node-b", b"x");
        assert_eq!(compare_values(&b, &a), ValueCmp::ABetter);
    }

    #[test]
    fn body_breaks_originator_tie() {
        let a = v(1, "a", b"apple");
        let b = v(1, "a", b"banana");
        assert_eq!(compare_values(&b, &a), ValueCmp::ABetter);
    }

    #[test]
    fn ttl_version_is_last_resort() {
        let a = v(1, "a", b"x");
        let mut b = v(1, "a", b"x");
        b.ttl_version = 3;
        assert_eq!(compare_values(&b, &a), ValueCmp::ABetter);
        assert_eq!(compare_values(&a, &a), ValueCmp::Equal);
    }

    #[test]
    fn hash_only_with_differing_hash_is_unknown() {
        let a = v(1, "a", b"apple");
        let b = v(1, "a", b"banana").as_hash_only();
        assert_eq!(compare_values(&a, &b), ValueCmp::Unknown);
    }

    #[test]
    fn hash_only_with_equal_hash_falls_through_to_ttl_version() {
        let a = v(1, "a", b"apple");
        let mut b = a.as_hash_only();
        b.ttl_version = 5;
        assert_eq!(compare_values(&b, &a), ValueCmp::ABetter);
    }

    #[test]
    fn merge_inserts_new_keys_with_bodies() {
        let mut store = KeyVals::new();
        let update = KeyVals::from([("k1".to_string(), v(1, "a", b"x"))]);
        let res = merge_key_values(&mut store, update, None);
        assert_eq!(res.updates.len(), 1);
        assert_eq!(store["k1"].value.as_deref(), Some(b"x".as_slice()));
    }

    #[test]
    fn merge_ignores_hash_only_for_unknown_keys() {
        let mut store = KeyVals::new();
        let update = KeyVals::from([("k1".to_string(), v(1, "a", b"x").as_hash_only())]);
        let res = merge_key_values(&mut store, update, None);
        assert!(res.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut store = KeyVals::new();
        let update = KeyVals::from([("k1".to_string(), v(3, "a", b"x"))]);
        let first = merge_key_values(&mut store, update.clone(), None);
        assert_eq!(first.updates.len(), 1);
        let second = merge_key_values(&mut store, update, None);
        assert!(second.is_empty());
    }

    #[test]
    fn merge_keeps_better_local_value() {
        let mut store = KeyVals::from([("k1".to_string(), v(5, "a", b"new"))]);
        let update = KeyVals::from([("k1".to_string(), v(4, "a", b"old"))]);
        let res = merge_key_values(&mut store, update, None);
        assert!(res.is_empty());
        assert_eq!(store["k1"].version, 5);
    }

    #[test]
    fn ttl_refresh_updates_in_place_and_strips_body() {
        let mut store = KeyVals::from([("k1".to_string(), v(1, "a", b"x"))]);
        let mut refresh = v(1, "a", b"x").as_hash_only();
        refresh.ttl_ms = 9_000;
        refresh.ttl_version = 1;
        let res = merge_key_values(&mut store, KeyVals::from([("k1".to_string(), refresh)]), None);
        assert_eq!(store["k1"].ttl_version, 1);
        assert_eq!(store["k1"].ttl_ms, 9_000);
        assert_eq!(store["k1"].value.as_deref(), Some(b"x".as_slice()));
        let delta = &res.updates["k1"];
        assert!(delta.value.is_none(), "ttl refresh must not look like a content change");
    }

    #[test]
    fn unknown_merge_requests_full_value() {
        let mut store = KeyVals::from([("k1".to_string(), v(1, "a", b"apple"))]);
        let update = KeyVals::from([("k1".to_string(), v(1, "a", b"banana").as_hash_only())]);
        let res = merge_key_values(&mut store, update, None);
        assert_eq!(res.to_request, vec!["k1".to_string()]);
        assert_eq!(store["k1"].value.as_deref(), Some(b"apple".as_slice()));
    }

    #[test]
    fn dump_difference_partitions_keys() {
        let store = KeyVals::from([

            ("only-mine".to_string(), v(1, "a", b"m")),
            ("mine-better".to_string(), v(2, "a", b"m")),
            ("theirs-better".to_string(), v(1, "a", b"m")),
            ("same".to_string(), v(1, "a", b"s")),
        ]);
        let theirs = KeyVals::from([
            ("mine-better".to_string(), v(1, "a", b"m").as_hash_only()),
            ("theirs-better".to_string(), v(9, "a", b"m").as_hash_only()),
            ("same".to_string(), v(1, "a", b"s").as_hash_only()),
            ("only-theirs".to_string(), v(1, "a", b"t").as_hash_only()),
        ]);
        let (to_send, mut tobe_updated) = dump_difference(&store, &theirs);
        tobe_updated.sort();
        assert!(to_send.contains_key("only-mine"));
        assert!(to_send.contains_key("mine-better"));
        assert!(!to_send.contains_key("same"));
        assert_eq!(
            tobe_updated,
            vec!["only-theirs".to_string(), "theirs-better".to_string()]
        );
    }
}
