//! Daemon configuration.
//!
//! Loading and validation of the on-disk form happens outside this crate;
//! these structs are the recognized options with their defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    pub areas: Vec<AreaConfig>,
    #[serde(default)]
    pub kvstore: KvStoreConfig,
    /// Restrict flooding to spanning-tree neighbors where possible.
    #[serde(default)]
    pub enable_flood_optimization: bool,
    /// Offer this node as a root for optimized flooding.
    #[serde(default)]
    pub is_flood_root: bool,
    /// Break BGP vs CONFIG metric ties in favor of CONFIG.
    #[serde(default)]
    pub prefer_originated_routes: bool,
    /// Emit the compact (v2) prefix key format.
    #[serde(default)]
    pub enable_compact_prefix_keys: bool,
    #[serde(default)]
    pub originated_prefixes: Vec<OriginatedPrefixConfig>,
}

impl Config {
    /// Minimal config for a node in the given areas; everything else at
    /// defaults.
    pub fn new(node_name: impl Into<String>, area_ids: &[&str]) -> Self {
        Self {
            node_name: node_name.into(),
            areas: area_ids.iter().map(|id| AreaConfig::new(*id)).collect(),
            kvstore: KvStoreConfig::default(),
            enable_flood_optimization: false,
            is_flood_root: false,
            prefer_originated_routes: false,
            enable_compact_prefix_keys: false,
            originated_prefixes: Vec::new(),
        }
    }

    pub fn area_ids(&self) -> BTreeSet<String> {
        self.areas.iter().map(|a| a.id.clone()).collect()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AreaConfig {
    pub id: String,
    /// Name of the import policy gating advertisements into this area.
    #[serde(default)]
    pub import_policy: Option<String>,
    /// Regexes a neighbor's node name must match to peer in this area.
    #[serde(default)]
    pub neighbor_regexes: Vec<String>,
}

impl AreaConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            import_policy: None,
            neighbor_regexes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// TTL for keys this node originates.
    #[serde(default = "default_key_ttl_ms")]
    pub key_ttl_ms: i64,
    /// Period of the scheduler that promotes idle peers to full sync.
    #[serde(default = "default_sync_interval_s")]
    pub sync_interval_s: u64,
    /// Flood rate limit in publications per second; 0 disables limiting.
    #[serde(default)]
    pub flood_msg_per_sec: u32,
    /// Flood rate limit burst size.
    #[serde(default)]
    pub flood_msg_burst: u32,
    /// TTL decrement applied to every value leaving this node.
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: i64,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            key_ttl_ms: default_key_ttl_ms(),
            sync_interval_s: default_sync_interval_s(),
            flood_msg_per_sec: 0,
            flood_msg_burst: 0,
            ttl_decrement_ms: default_ttl_decrement_ms(),
        }
    }
}

fn default_key_ttl_ms() -> i64 {
    3_600_000
}

fn default_sync_interval_s() -> u64 {
    60
}

fn default_ttl_decrement_ms() -> i64 {
    1
}

/// A configured aggregate this node originates once enough more-specific
/// routes support it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OriginatedPrefixConfig {
    /// CIDR string; parsed at prefix-manager startup.
    pub prefix: String,
    pub minimum_supporting_routes: usize,
    #[serde(default)]
    pub install_to_fib: bool,
    #[serde(default)]
    pub path_preference: Option<i32>,
    #[serde(default)]
    pub source_preference: Option<i32>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}
