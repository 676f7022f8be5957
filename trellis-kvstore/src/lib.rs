//! Gossip-replicated key-value store, partitioned per routing area.
//!
//! `KvStore` spawns one [`db::KvStoreDb`] actor per configured area and
//! multiplexes requests to them through a cheap cloneable
//! [`KvStoreHandle`]. Replication is eventually consistent: peers merge
//! versioned values ([`store::compare_values`]) and flood deltas to their
//! own peers, with TTL countdown, rate-limited flooding, and an optional
//! spanning-tree optimization cutting redundant sends.

pub mod client;
pub mod db;
pub mod dual;
pub mod filters;
pub mod flood;
pub mod net;
pub mod peer;
pub mod store;
pub mod ttl_queue;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use trellis_model::{
    Config, DualMessages, DumpParams, FloodTopoSetParams, PeerEvent, PeerSpec, PeerState,
    Publication, SptInfos,
};

use db::{DbCmd, KvStoreDb};

pub use client::KvStoreClient;
pub use filters::KvFilters;
pub use net::{ClientError, MemNetwork, PeerClient, PeerTransport};
pub use store::{compare_values, merge_key_values, ValueCmp};

const CMD_QUEUE_DEPTH: usize = 1024;
const UPDATES_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum KvStoreError {
    #[error("unknown area: {0}")]
    UnknownArea(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("kvstore stopped")]
    Stopped,
}

/// Top-level store: one db actor per area plus a dispatcher for the
/// peer-events input queue.
pub struct KvStore;

impl KvStore {
    /// Spawn the per-area actors and the peer-event dispatcher; the
    /// returned handle is the only way in.
    pub fn spawn(
        config: &Config,
        transport: Arc<dyn PeerTransport>,
        mut peer_events: mpsc::Receiver<PeerEvent>,
    ) -> KvStoreHandle {
        let (updates_tx, _) = broadcast::channel(UPDATES_QUEUE_DEPTH);

        let mut areas = HashMap::new();
        for area_cfg in &config.areas {
            if areas.contains_key(&area_cfg.id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(CMD_QUEUE_DEPTH);
            let db = KvStoreDb::new(
                config,
                area_cfg.id.clone(),
                updates_tx.clone(),
                transport.clone(),
                tx.clone(),
            );
            tokio::spawn(db.run(rx));
            areas.insert(area_cfg.id.clone(), tx);
        }

        let handle = KvStoreHandle {
            node_name: config.node_name.clone(),
            areas: Arc::new(areas),
            updates_tx,
        };

        let dispatcher = handle.clone();
        tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                if let Err(e) = dispatcher.apply_peer_event(event).await {
                    tracing::warn!(error = %e, "dropping peer event");
                }
            }
            tracing::debug!("peer event queue closed");
        });

        handle
    }
}

/// Cloneable handle to the store; every method schedules onto the owning
/// area's loop and resolves when that loop has processed the request.
#[derive(Clone)]
pub struct KvStoreHandle {
    node_name: String,
    areas: Arc<HashMap<String, mpsc::Sender<DbCmd>>>,
    updates_tx: broadcast::Sender<Publication>,
}

impl KvStoreHandle {
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn area_ids(&self) -> BTreeSet<String> {
        self.areas.keys().cloned().collect()
    }

    /// Process-local updates queue: every merge delta, TTL refresh, and
    /// expiry lands here with its area set.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.updates_tx.subscribe()
    }

    fn area_tx(&self, area: &str) -> Result<&mpsc::Sender<DbCmd>, KvStoreError> {
        self.areas
            .get(area)
            .ok_or_else(|| KvStoreError::UnknownArea(area.to_string()))
    }

    async fn call<T>(
        &self,
        area: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> DbCmd,
    ) -> Result<T, KvStoreError> {
        let tx = self.area_tx(area)?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(make(resp_tx))
            .await
            .map_err(|_| KvStoreError::Stopped)?;
        resp_rx.await.map_err(|_| KvStoreError::Stopped)
    }

    pub async fn get_key_vals(
        &self,
        area: &str,
        keys: Vec<String>,
    ) -> Result<Publication, KvStoreError> {
        self.call(area, |resp| DbCmd::GetKeyVals { keys, resp }).await
    }

    /// Merge a publication into one area; the delta floods onward from
    /// there.
    pub async fn set_key_vals(
        &self,
        area: &str,
        publication: Publication,
    ) -> Result<(), KvStoreError> {
        self.call(area, |resp| DbCmd::SetKeyVals {
            publication,
            resp: Some(resp),
        })
        .await
    }

    pub async fn dump_area(
        &self,
        area: &str,
        params: DumpParams,
    ) -> Result<Publication, KvStoreError> {
        self.call(area, |resp| DbCmd::Dump { params, resp }).await?
    }

    /// Hash-only dump of one area.
    pub async fn dump_hashes(
        &self,
        area: &str,
        mut params: DumpParams,
    ) -> Result<Publication, KvStoreError> {
        params.hash_only = true;
        self.dump_area(area, params).await
    }

    /// Fan a dump out to the selected areas (all areas when `None`) and
    /// concatenate the per-area publications.
    pub async fn dump_keys(
        &self,
        params: DumpParams,
        select_areas: Option<BTreeSet<String>>,
    ) -> Result<Vec<Publication>, KvStoreError> {
        let areas: Vec<String> = match select_areas {
            Some(selected) => {
                for area in &selected {
                    if !self.areas.contains_key(area) {
                        return Err(KvStoreError::UnknownArea(area.clone()));
                    }
                }
                selected.into_iter().collect()
            }
            None => self.areas.keys().cloned().collect(),
        };
        let mut publications = Vec::with_capacity(areas.len());
        for area in areas {
            publications.push(self.dump_area(&area, params.clone()).await?);
        }
        Ok(publications)
    }

    pub async fn add_peers(
        &self,
        area: &str,
        peers: HashMap<String, PeerSpec>,
    ) -> Result<(), KvStoreError> {
        self.call(area, |resp| DbCmd::AddPeers { peers, resp }).await
    }

    pub async fn del_peers(&self, area: &str, peers: Vec<String>) -> Result<(), KvStoreError> {
        self.call(area, |resp| DbCmd::DelPeers { peers, resp }).await
    }

    pub async fn dump_peers(
        &self,
        area: &str,
    ) -> Result<HashMap<String, PeerSpec>, KvStoreError> {
        self.call(area, |resp| DbCmd::DumpPeers { resp }).await
    }

    pub async fn peer_state(
        &self,
        area: &str,
        peer: &str,
    ) -> Result<Option<PeerState>, KvStoreError> {
        let peer = peer.to_string();
        self.call(area, |resp| DbCmd::PeerState { peer, resp }).await
    }

    pub async fn process_dual_messages(
        &self,
        area: &str,
        msgs: DualMessages,
    ) -> Result<(), KvStoreError> {
        self.call(area, |resp| DbCmd::DualMessages { msgs, resp }).await
    }

    pub async fn flood_topo_set(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> Result<(), KvStoreError> {
        self.call(area, |resp| DbCmd::FloodTopoSet { params, resp })
            .await
    }

    pub async fn spt_infos(&self, area: &str) -> Result<SptInfos, KvStoreError> {
        self.call(area, |resp| DbCmd::SptInfos { resp }).await
    }

    /// Counters summed across all areas.
    pub async fn counters(&self) -> Result<HashMap<String, i64>, KvStoreError> {
        let mut total: HashMap<String, i64> = HashMap::new();
        for area in self.areas.keys() {
            let per_area = self.call(area, |resp| DbCmd::Counters { resp }).await?;
            for (name, value) in per_area {
                *total.entry(name).or_insert(0) += value;
            }
        }
        Ok(total)
    }

    async fn apply_peer_event(&self, event: PeerEvent) -> Result<(), KvStoreError> {
        if !event.peers_to_add.is_empty() {
            self.add_peers(&event.area, event.peers_to_add.clone()).await?;
        }
        if !event.peers_to_del.is_empty() {
            self.del_peers(&event.area, event.peers_to_del.clone()).await?;
        }
        Ok(())
    }

    /// Stop every area loop. Outstanding requests complete with
    /// [`KvStoreError::Stopped`]; in-flight peer RPCs are abandoned.
    pub async fn stop(&self) {
        for tx in self.areas.values() {
            let _ = tx.send(DbCmd::Stop).await;
        }
    }
}
