use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use trellis_kvstore::{KvStore, KvStoreHandle, MemNetwork};
use trellis_model::{Config, PeerEvent, PeerSpec, PeerState, Publication, Value};

pub const AREA: &str = "area0";

/// Spawn a node on the in-process network and register it under its
/// node name.
pub fn spawn_node(network: &MemNetwork, config: &Config) -> (KvStoreHandle, mpsc::Sender<PeerEvent>) {
    let (peer_tx, peer_rx) = mpsc::channel(64);
    let handle = KvStore::spawn(config, network.transport(), peer_rx);
    network.register(&config.node_name, handle.clone());
    (handle, peer_tx)
}

pub fn peer_spec(node: &str) -> PeerSpec {
    PeerSpec::new(node, 0)
}

pub fn peers(nodes: &[&str]) -> HashMap<String, PeerSpec> {
    nodes
        .iter()
        .map(|n| (n.to_string(), peer_spec(n)))
        .collect()
}

/// Poll until the condition holds; panic after ~5s.
pub async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn get_value(handle: &KvStoreHandle, key: &str) -> Option<Value> {
    handle
        .get_key_vals(AREA, vec![key.to_string()])
        .await
        .expect("get_key_vals")
        .key_vals
        .remove(key)
}

pub async fn peer_initialized(handle: &KvStoreHandle, peer: &str) -> bool {
    handle
        .peer_state(AREA, peer)
        .await
        .expect("peer_state")
        .map(|s| s == PeerState::Initialized)
        .unwrap_or(false)
}

pub async fn counter(handle: &KvStoreHandle, name: &str) -> i64 {
    handle
        .counters()
        .await
        .expect("counters")
        .get(name)
        .copied()
        .unwrap_or(0)
}

pub fn publication_of(key: &str, value: Value) -> Publication {
    let mut publication = Publication::new(AREA);
    publication.key_vals.insert(key.to_string(), value);
    publication
}
