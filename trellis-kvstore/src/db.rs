//! Per-area store actor.
//!
//! One `KvStoreDb` task owns everything for its area: the key-value map,
//! the TTL countdown queue, the peer table, the flood buffer, and the
//! spanning-tree state. All mutation happens on this task; peers and the
//! rest of the process reach it through its command channel. Outbound
//! RPCs are spawned off the loop and report back as internal commands,
//! so the loop never blocks on the network.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use trellis_model::constants::{
    FLOOD_PENDING_DRAIN, KEEP_ALIVE_PERIOD, MAX_PARALLEL_SYNCS, RPC_DEADLINE, TTL_THRESHOLD,
    INITIAL_PARALLEL_SYNCS,
};
use trellis_model::{
    Config, DualMessage, DualMessages, DumpParams, FloodTopoSetParams, KvStoreConfig,
    PeerSpec, PeerState, Publication, SptInfos,
};

use crate::dual::{DualOutput, DualState};
use crate::filters::KvFilters;
use crate::flood::TokenBucket;
use crate::net::{ClientError, PeerClient, PeerTransport};
use crate::peer::{KvStorePeer, PeerStateEvent};
use crate::store::{dump_difference, dump_with_filters, merge_key_values};
use crate::ttl_queue::TtlQueue;
use crate::KvStoreError;

/// Commands served by a `KvStoreDb` actor. The internal variants carry
/// completions of spawned peer RPCs back onto the loop.
pub(crate) enum DbCmd {
    GetKeyVals {
        keys: Vec<String>,
        resp: oneshot::Sender<Publication>,
    },
    Dump {
        params: DumpParams,
        resp: oneshot::Sender<Result<Publication, KvStoreError>>,
    },
    SetKeyVals {
        publication: Publication,
        resp: Option<oneshot::Sender<()>>,
    },
    AddPeers {
        peers: HashMap<String, PeerSpec>,
        resp: oneshot::Sender<()>,
    },
    DelPeers {
        peers: Vec<String>,
        resp: oneshot::Sender<()>,
    },
    DumpPeers {
        resp: oneshot::Sender<HashMap<String, PeerSpec>>,
    },
    PeerState {
        peer: String,
        resp: oneshot::Sender<Option<PeerState>>,
    },
    DualMessages {
        msgs: DualMessages,
        resp: oneshot::Sender<()>,
    },
    FloodTopoSet {
        params: FloodTopoSetParams,
        resp: oneshot::Sender<()>,
    },
    SptInfos {
        resp: oneshot::Sender<SptInfos>,
    },
    Counters {
        resp: oneshot::Sender<HashMap<String, i64>>,
    },
    Stop,
    FullSyncDone {
        peer: String,
        result: Result<Publication, ClientError>,
    },
    SendFailure {
        peer: String,
        error: ClientError,
    },
}

pub(crate) struct KvStoreDb {
    node_name: String,
    area: String,
    params: KvStoreConfig,
    enable_flood_optimization: bool,

    store: trellis_model::KeyVals,
    ttl_queue: TtlQueue,
    peers: HashMap<String, KvStorePeer>,
    parallel_sync_limit: usize,
    dual: DualState,

    flood_limiter: Option<TokenBucket>,
    publication_buffer: HashMap<Option<String>, BTreeSet<String>>,
    flood_deadline: Option<Instant>,
    sync_deadline: Option<Instant>,

    counters: HashMap<&'static str, i64>,
    updates_tx: broadcast::Sender<Publication>,
    transport: Arc<dyn PeerTransport>,
    self_tx: mpsc::Sender<DbCmd>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl KvStoreDb {
    pub(crate) fn new(
        config: &Config,
        area: String,
        updates_tx: broadcast::Sender<Publication>,
        transport: Arc<dyn PeerTransport>,
        self_tx: mpsc::Sender<DbCmd>,
    ) -> Self {
        let flood_limiter = (config.kvstore.flood_msg_per_sec > 0).then(|| {
            TokenBucket::new(
                config.kvstore.flood_msg_per_sec,
                config.kvstore.flood_msg_burst,
                Instant::now(),
            )
        });
        Self {
            node_name: config.node_name.clone(),
            area,
            params: config.kvstore.clone(),
            enable_flood_optimization: config.enable_flood_optimization,
            store: trellis_model::KeyVals::new(),
            ttl_queue: TtlQueue::new(),
            peers: HashMap::new(),
            parallel_sync_limit: INITIAL_PARALLEL_SYNCS,
            dual: DualState::new(config.node_name.clone(), config.is_flood_root),
            flood_limiter,
            publication_buffer: HashMap::new(),
            flood_deadline: None,
            sync_deadline: None,
            counters: HashMap::new(),
            updates_tx,
            transport,
            self_tx,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<DbCmd>) {
        let mut sync_interval =
            tokio::time::interval(Duration::from_secs(self.params.sync_interval_s.max(1)));
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_PERIOD);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(area = %self.area, node = %self.node_name, "kvstore area started");
        loop {
            let ttl_deadline = self.ttl_queue.next_deadline();
            let flood_deadline = self.flood_deadline;
            let sync_deadline = self.sync_deadline;
            tokio::select! {
                maybe_cmd = rx.recv() => match maybe_cmd {
                    Some(DbCmd::Stop) | None => break,
                    Some(cmd) => self.handle_cmd(cmd),
                },
                _ = async { tokio::time::sleep_until(ttl_deadline.expect("guarded").into()).await },
                    if ttl_deadline.is_some() =>
                {
                    self.cleanup_ttl_queue();
                }
                _ = async { tokio::time::sleep_until(flood_deadline.expect("guarded").into()).await },
                    if flood_deadline.is_some() =>
                {
                    self.flood_deadline = None;
                    self.flood_buffered_updates();
                }
                _ = async { tokio::time::sleep_until(sync_deadline.expect("guarded").into()).await },
                    if sync_deadline.is_some() =>
                {
                    self.sync_deadline = None;
                    self.request_peer_sync();
                }
                _ = sync_interval.tick() => self.request_peer_sync(),
                _ = keep_alive.tick() => self.send_keep_alives(),
            }
        }
        tracing::info!(area = %self.area, "kvstore area stopped");
    }

    fn handle_cmd(&mut self, cmd: DbCmd) {
        match cmd {
            DbCmd::GetKeyVals { keys, resp } => {
                let _ = resp.send(self.get_key_vals(&keys));
            }
            DbCmd::Dump { params, resp } => {
                let _ = resp.send(self.dump(params));
            }
            DbCmd::SetKeyVals { publication, resp } => {
                self.bump("kvstore.received_publications");
                self.merge_publication(publication, None);
                if let Some(resp) = resp {
                    let _ = resp.send(());
                }
            }
            DbCmd::AddPeers { peers, resp } => {
                self.add_peers(peers);
                let _ = resp.send(());
            }
            DbCmd::DelPeers { peers, resp } => {
                self.del_peers(&peers);
                let _ = resp.send(());
            }
            DbCmd::DumpPeers { resp } => {
                let dump = self
                    .peers
                    .iter()
                    .map(|(name, p)| (name.clone(), p.spec.clone()))
                    .collect();
                let _ = resp.send(dump);
            }
            DbCmd::PeerState { peer, resp } => {
                let _ = resp.send(self.peers.get(&peer).map(|p| p.state));
            }
            DbCmd::DualMessages { msgs, resp } => {
                self.process_dual_messages(msgs);
                let _ = resp.send(());
            }
            DbCmd::FloodTopoSet { params, resp } => {
                self.process_flood_topo_set(params);
                let _ = resp.send(());
            }
            DbCmd::SptInfos { resp } => {
                let _ = resp.send(self.dual.spt_infos());
            }
            DbCmd::Counters { resp } => {
                let _ = resp.send(self.counter_snapshot());
            }
            DbCmd::FullSyncDone { peer, result } => self.handle_full_sync_done(peer, result),
            DbCmd::SendFailure { peer, error } => self.handle_api_error(&peer, &error),
            DbCmd::Stop => unreachable!("handled by the loop"),
        }
    }

    // ==================== Reads ====================

    fn get_key_vals(&self, keys: &[String]) -> Publication {
        let mut publication = Publication::new(&self.area);
        publication.timestamp_ms = now_ms();
        for key in keys {
            if let Some(value) = self.store.get(key) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        self.update_publication_ttl(&mut publication, false);
        publication
    }

    fn dump(&mut self, params: DumpParams) -> Result<Publication, KvStoreError> {
        let filters = KvFilters::from_params(&params)
            .map_err(|e| KvStoreError::InvalidFilter(e.to_string()))?;
        let mut publication = Publication::new(&self.area);
        publication.timestamp_ms = now_ms();

        if let Some(their_hashes) = &params.key_val_hashes {
            let mine = dump_with_filters(&self.store, &filters, false);
            let (to_send, tobe_updated) = dump_difference(&mine, their_hashes);
            publication.key_vals = to_send;
            publication.tobe_updated_keys = Some(tobe_updated);
        } else {
            publication.key_vals = dump_with_filters(&self.store, &filters, params.hash_only);
        }

        self.update_publication_ttl(&mut publication, false);
        Ok(publication)
    }

    /// Rewrite every outgoing value's TTL to its remaining lifetime minus
    /// the configured decrement, dropping values that are already (or
    /// about to be) dead.
    fn update_publication_ttl(&self, publication: &mut Publication, remove_about_to_expire: bool) {
        let now = Instant::now();
        let threshold = TTL_THRESHOLD.as_millis() as i64;
        publication.key_vals.retain(|key, value| {
            if !value.is_expiring() {
                return true;
            }
            let Some(remaining) = self.ttl_queue.remaining(key, now) else {
                return true;
            };
            let remaining_ms = remaining.as_millis() as i64 - self.params.ttl_decrement_ms;
            if remaining_ms <= 0 {
                return false;
            }
            if remove_about_to_expire && remaining_ms < threshold {
                return false;
            }
            value.ttl_ms = remaining_ms;
            true
        });
    }

    // ==================== Merge and flood ====================

    /// Merge a received publication and flood whatever changed. Returns
    /// the number of applied updates.
    fn merge_publication(&mut self, publication: Publication, sender: Option<&str>) -> usize {
        let Publication {
            key_vals,
            mut node_ids,
            flood_root_id,
            tobe_updated_keys,
            ..
        } = publication;

        let result = merge_key_values(&mut self.store, key_vals, None);
        self.add_to(
            "kvstore.updated_key_vals",
            result.updates.len() as i64,
        );
        self.add_to("kvstore.filtered_key_vals", result.filtered as i64);

        let now = Instant::now();
        for key in result.updates.keys() {
            if let Some(stored) = self.store.get(key) {
                self.ttl_queue.track(key, stored, now);
            }
        }

        if let Some(sender) = sender {
            // The third leg of full sync: ship full bodies for keys the
            // sender asked for, and ask it for bodies we could not order.
            let wanted: BTreeSet<String> =
                tobe_updated_keys.unwrap_or_default().into_iter().collect();
            self.finalize_full_sync(wanted, sender);
            if !result.to_request.is_empty() {
                self.request_full_values(sender, result.to_request.clone());
            }
            if !node_ids.iter().any(|n| n == sender) {
                node_ids.push(sender.to_string());
            }
        } else if !result.to_request.is_empty() {
            // No reply channel for a one-way set; the next full sync
            // reconciles these.
            self.add_to(
                "kvstore.unresolved_unknown_keys",
                result.to_request.len() as i64,
            );
        }

        let applied = result.updates.len();
        if applied > 0 {
            let delta = Publication {
                key_vals: result.updates,
                expired_keys: Vec::new(),
                tobe_updated_keys: None,
                node_ids,
                flood_root_id,
                area: self.area.clone(),
                timestamp_ms: now_ms(),
            };
            self.flood_publication(delta, true, sender.is_none());
        }
        applied
    }

    fn flood_publication(
        &mut self,
        mut publication: Publication,
        rate_limit: bool,
        set_flood_root: bool,
    ) {
        if rate_limit && !publication.key_vals.is_empty() {
            if let Some(limiter) = &mut self.flood_limiter {
                if !limiter.try_consume(Instant::now()) {
                    self.buffer_publication(publication);
                    return;
                }
            }
        }

        publication.area = self.area.clone();
        publication.timestamp_ms = now_ms();

        if set_flood_root
            && self.enable_flood_optimization
            && publication.flood_root_id.is_none()
        {
            publication.flood_root_id = self.dual.current_flood_root();
        }

        // Local subscribers always see the merge, including expiries and
        // TTL refreshes.
        let _ = self.updates_tx.send(publication.clone());

        if publication.key_vals.is_empty() {
            return;
        }

        let excluded: HashSet<String> = publication.node_ids.iter().cloned().collect();
        publication.node_ids.push(self.node_name.clone());
        self.update_publication_ttl(&mut publication, false);
        if publication.key_vals.is_empty() {
            return;
        }

        // Keys that mutate while a peer is still initializing are flushed
        // to it when its full sync finalizes.
        let keys: BTreeSet<String> = publication.key_vals.keys().cloned().collect();
        for peer in self.peers.values_mut() {
            if peer.state != PeerState::Initialized && !excluded.contains(&peer.node_name) {
                peer.pending_keys_during_initialization
                    .extend(keys.iter().cloned());
            }
        }

        let recipients = self.flood_peers(publication.flood_root_id.as_deref());
        for name in recipients {
            if excluded.contains(&name) {
                continue;
            }
            let Some(client) = self.peer_client(&name) else {
                continue;
            };
            self.bump("kvstore.sent_publications");
            let area = self.area.clone();
            let publication = publication.clone();
            self.spawn_rpc(name, async move { client.key_set(&area, publication).await });
        }
    }

    /// Recipient set for one publication: the spanning-tree neighborhood
    /// when flooding along a root, otherwise every initialized peer.
    fn flood_peers(&self, root_id: Option<&str>) -> Vec<String> {
        let initialized = |name: &String| {
            self.peers
                .get(name)
                .map(|p| p.state == PeerState::Initialized)
                .unwrap_or(false)
        };
        match root_id {
            Some(root) if self.enable_flood_optimization => self
                .dual
                .flood_peers(root)
                .into_iter()
                .filter(initialized)
                .collect(),
            _ => self
                .peers
                .values()
                .filter(|p| p.state == PeerState::Initialized)
                .map(|p| p.node_name.clone())
                .collect(),
        }
    }

    fn buffer_publication(&mut self, publication: Publication) {
        self.bump("kvstore.rate_limit_suppressed");
        let entry = self
            .publication_buffer
            .entry(publication.flood_root_id.clone())
            .or_default();
        entry.extend(publication.key_vals.into_keys());
        if self.flood_deadline.is_none() {
            self.flood_deadline = Some(Instant::now() + FLOOD_PENDING_DRAIN);
        }
    }

    /// Drain the coalesced buffer: rebuild publications from the live
    /// store (dropping keys that vanished) and try flooding again.
    fn flood_buffered_updates(&mut self) {
        let buffered = std::mem::take(&mut self.publication_buffer);
        for (root_id, keys) in buffered {
            let mut publication = Publication::new(&self.area);
            publication.flood_root_id = root_id;
            for key in keys {
                if let Some(value) = self.store.get(&key) {
                    publication.key_vals.insert(key, value.clone());
                }
            }
            if publication.key_vals.is_empty() {
                continue;
            }
            self.flood_publication(publication, true, false);
        }
    }

    // ==================== TTL expiry ====================

    fn cleanup_ttl_queue(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.ttl_queue.pop_expired(now) {
            match self.store.get(&entry.key) {
                Some(live) if entry.matches(live) => {
                    self.store.remove(&entry.key);
                    self.ttl_queue.untrack(&entry.key);
                    expired.push(entry.key);
                }
                // Stale entry: the key was refreshed or replaced since.
                _ => {}
            }
        }
        if expired.is_empty() {
            return;
        }
        self.add_to("kvstore.expired_keys", expired.len() as i64);
        tracing::debug!(area = %self.area, count = expired.len(), "expired keys");
        let mut publication = Publication::new(&self.area);
        publication.expired_keys = expired;
        // Carries no key_vals, so this reaches local subscribers only;
        // every peer expires on its own clock thanks to the egress TTL
        // decrement.
        self.flood_publication(publication, false, false);
    }

    // ==================== Peers and full sync ====================

    fn add_peers(&mut self, peers: HashMap<String, PeerSpec>) {
        for (name, spec) in peers {
            if name == self.node_name {
                tracing::warn!(area = %self.area, "ignoring self as peer");
                continue;
            }
            match self.peers.get_mut(&name) {
                Some(existing) => {
                    if existing.spec != spec {
                        existing.spec = spec;
                        existing.client = None;
                    }
                    existing.transition(PeerStateEvent::PeerAdd);
                }
                None => {
                    tracing::info!(area = %self.area, peer = %name, "peer added");
                    self.peers.insert(name.clone(), KvStorePeer::new(name.clone(), spec));
                    if self.enable_flood_optimization {
                        let outputs = self.dual.peer_up(&name, 1);
                        for (root, output) in outputs {
                            self.process_dual_output(&root, output);
                        }
                    }
                }
            }
        }
        self.request_peer_sync();
    }

    fn del_peers(&mut self, peers: &[String]) {
        for name in peers {
            if self.peers.remove(name).is_none() {
                continue;
            }
            tracing::info!(area = %self.area, peer = %name, "peer removed");
            if self.enable_flood_optimization {
                for (root, output) in self.dual.peer_down(name) {
                    self.process_dual_output(&root, output);
                }
            }
        }
    }

    /// Promote idle peers whose backoff has elapsed, up to the parallel
    /// sync limit, and fire a full-dump request at each.
    fn request_peer_sync(&mut self) {
        let now = Instant::now();
        let mut in_flight = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Syncing)
            .count();

        let mut idle: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Idle)
            .map(|p| p.node_name.clone())
            .collect();
        idle.sort();

        let mut next_retry: Option<Duration> = None;
        let my_hashes = dump_with_filters(&self.store, &KvFilters::match_all(), true);

        for name in idle {
            if in_flight >= self.parallel_sync_limit {
                next_retry = Some(next_retry.map_or(FLOOD_PENDING_DRAIN, |d| d.min(FLOOD_PENDING_DRAIN)));
                break;
            }
            let peer = match self.peers.get_mut(&name) {
                Some(p) => p,
                None => continue,
            };
            let wait = peer.backoff.time_until_retry(now);
            if !wait.is_zero() {
                next_retry = Some(next_retry.map_or(wait, |d| d.min(wait)));
                continue;
            }

            let client = match Self::client_for(&self.transport, peer) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(area = %self.area, peer = %name, error = %e, "peer connect failed");
                    peer.backoff.report_error(now);
                    let retry = peer.backoff.time_until_retry(now);
                    next_retry = Some(next_retry.map_or(retry, |d| d.min(retry)));
                    continue;
                }
            };

            peer.transition(PeerStateEvent::SyncScheduled);
            in_flight += 1;
            self.bump("kvstore.full_sync_requests");

            let params = DumpParams {
                key_val_hashes: Some(my_hashes.clone()),
                ..Default::default()
            };
            let area = self.area.clone();
            let tx = self.self_tx.clone();
            let peer_name = name.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(
                    RPC_DEADLINE,
                    client.key_dump(&area, params),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err(ClientError::Timeout),
                };
                let _ = tx.send(DbCmd::FullSyncDone { peer: peer_name, result }).await;
            });
        }

        if let Some(wait) = next_retry {
            let deadline = now + wait;
            self.sync_deadline = Some(self.sync_deadline.map_or(deadline, |d| d.min(deadline)));
        }
    }

    fn handle_full_sync_done(
        &mut self,
        peer_name: String,
        result: Result<Publication, ClientError>,
    ) {
        match result {
            Ok(publication) => {
                let pending = {
                    let Some(peer) = self.peers.get_mut(&peer_name) else {
                        return;
                    };
                    peer.transition(PeerStateEvent::SyncRespRcvd);
                    peer.backoff.report_success();
                    std::mem::take(&mut peer.pending_keys_during_initialization)
                };
                self.parallel_sync_limit =
                    (self.parallel_sync_limit * 2).min(MAX_PARALLEL_SYNCS);
                self.bump("kvstore.full_sync_success");
                tracing::info!(area = %self.area, peer = %peer_name, "full sync complete");

                let mut publication = publication;
                let mut wanted: BTreeSet<String> = publication
                    .tobe_updated_keys
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                wanted.extend(pending);
                publication.tobe_updated_keys = Some(wanted.into_iter().collect());
                self.merge_publication(publication, Some(&peer_name));
            }
            Err(error) => {
                self.bump("kvstore.full_sync_failure");
                self.handle_api_error(&peer_name, &error);
            }
        }
    }

    /// Last leg of full sync: push full bodies for `keys` to the peer we
    /// just synced with.
    fn finalize_full_sync(&mut self, keys: BTreeSet<String>, peer_name: &str) {
        if keys.is_empty() {
            return;
        }
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(value) = self.store.get(&key) {
                publication.key_vals.insert(key, value.clone());
            }
        }
        self.update_publication_ttl(&mut publication, false);
        if publication.key_vals.is_empty() {
            return;
        }
        publication.node_ids.push(self.node_name.clone());
        publication.timestamp_ms = now_ms();

        let Some(client) = self.peer_client(peer_name) else {
            return;
        };
        self.bump("kvstore.sent_publications");
        let area = self.area.clone();
        self.spawn_rpc(peer_name.to_string(), async move {
            client.key_set(&area, publication).await
        });
    }

    /// Ask `peer` for the full bodies of keys whose ordering was
    /// undecidable, and merge the answer like any other publication.
    fn request_full_values(&mut self, peer_name: &str, keys: Vec<String>) {
        self.add_to("kvstore.unknown_value_requests", keys.len() as i64);
        let Some(client) = self.peer_client(peer_name) else {
            return;
        };
        let area = self.area.clone();
        let tx = self.self_tx.clone();
        let peer = peer_name.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(RPC_DEADLINE, client.key_get(&area, keys)).await {
                Ok(Ok(publication)) => {
                    let _ = tx
                        .send(DbCmd::SetKeyVals {
                            publication,
                            resp: None,
                        })
                        .await;
                }
                Ok(Err(error)) => {
                    let _ = tx.send(DbCmd::SendFailure { peer, error }).await;
                }
                Err(_) => {
                    let _ = tx
                        .send(DbCmd::SendFailure {
                            peer,
                            error: ClientError::Timeout,
                        })
                        .await;
                }
            }
        });
    }

    fn handle_api_error(&mut self, peer_name: &str, error: &ClientError) {
        let now = Instant::now();
        let Some(peer) = self.peers.get_mut(peer_name) else {
            return;
        };
        peer.backoff.report_error(now);
        peer.pending_keys_during_initialization.clear();
        peer.transition(PeerStateEvent::ApiError);
        let retry = peer.backoff.time_until_retry(now);

        self.bump("kvstore.send_failures");
        tracing::warn!(area = %self.area, peer = %peer_name, error = %error, "peer api error");
        let deadline = now + retry;
        self.sync_deadline = Some(self.sync_deadline.map_or(deadline, |d| d.min(deadline)));
    }

    fn send_keep_alives(&mut self) {
        let initialized: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Initialized)
            .map(|p| p.node_name.clone())
            .collect();
        for name in initialized {
            let Some(client) = self.peer_client(&name) else {
                continue;
            };
            self.spawn_rpc(name, async move { client.keep_alive().await });
        }
    }

    fn client_for(
        transport: &Arc<dyn PeerTransport>,
        peer: &mut KvStorePeer,
    ) -> Result<Arc<dyn PeerClient>, ClientError> {
        if let Some(client) = &peer.client {
            return Ok(client.clone());
        }
        let client = transport.connect(&peer.spec)?;
        peer.client = Some(client.clone());
        Ok(client)
    }

    fn peer_client(&mut self, name: &str) -> Option<Arc<dyn PeerClient>> {
        let peer = self.peers.get_mut(name)?;
        match Self::client_for(&self.transport, peer) {
            Ok(client) => Some(client),
            Err(error) => {
                self.handle_api_error(name, &error);
                None
            }
        }
    }

    /// Run a fire-and-forget peer RPC off the loop; failures come back as
    /// `SendFailure` and feed the peer state machine.
    fn spawn_rpc<F>(&self, peer: String, fut: F)
    where
        F: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(RPC_DEADLINE, fut).await {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(ClientError::Timeout),
            };
            if let Some(error) = outcome {
                let _ = tx.send(DbCmd::SendFailure { peer, error }).await;
            }
        });
    }

    // ==================== Spanning tree ====================

    fn process_dual_messages(&mut self, msgs: DualMessages) {
        for msg in &msgs.messages {
            let output = self.dual.handle_message(msg);
            let root = msg.root_id.clone();
            self.process_dual_output(&root, output);
        }
    }

    fn process_dual_output(&mut self, root: &str, output: DualOutput) {
        // Batch outgoing messages per destination neighbor.
        let mut by_dst: HashMap<String, Vec<DualMessage>> = HashMap::new();
        for (dst, msg) in output.msgs {
            by_dst.entry(dst).or_default().push(msg);
        }
        for (dst, messages) in by_dst {
            let Some(client) = self.peer_client(&dst) else {
                continue;
            };
            let batch = DualMessages {
                src_id: self.node_name.clone(),
                messages,
            };
            let area = self.area.clone();
            self.spawn_rpc(dst, async move { client.dual_messages(&area, batch).await });
        }

        if let Some((old_parent, new_parent)) = output.nexthop_change {
            self.process_nexthop_change(root, old_parent, new_parent);
        }
    }

    fn process_nexthop_change(
        &mut self,
        root: &str,
        old_parent: Option<String>,
        new_parent: Option<String>,
    ) {
        tracing::info!(
            area = %self.area,
            root = %root,
            old = ?old_parent,
            new = ?new_parent,
            "spanning tree nexthop change"
        );
        if let Some(old) = old_parent.filter(|p| *p != self.node_name) {
            self.send_topo_set(root, &old, false);
        }
        if let Some(new) = new_parent.filter(|p| *p != self.node_name) {
            self.send_topo_set(root, &new, true);
            // Re-push everything through the updated tree; the drain
            // timer batches it into one publication.
            let keys: BTreeSet<String> = self.store.keys().cloned().collect();
            if !keys.is_empty() {
                self.publication_buffer
                    .entry(Some(root.to_string()))
                    .or_default()
                    .extend(keys);
                if self.flood_deadline.is_none() {
                    self.flood_deadline = Some(Instant::now() + FLOOD_PENDING_DRAIN);
                }
            }
        }
    }

    fn send_topo_set(&mut self, root: &str, peer_name: &str, set_child: bool) {
        let Some(client) = self.peer_client(peer_name) else {
            return;
        };
        let params = FloodTopoSetParams {
            root_id: Some(root.to_string()),
            src_node_name: self.node_name.clone(),
            set_child,
            all_roots: false,
        };
        let area = self.area.clone();
        self.spawn_rpc(peer_name.to_string(), async move {
            client.flood_topo_set(&area, params).await
        });
    }

    fn process_flood_topo_set(&mut self, params: FloodTopoSetParams) {
        if params.all_roots {
            if !params.set_child {
                self.dual.unset_child_all(&params.src_node_name);
            }
            return;
        }
        let Some(root) = &params.root_id else {
            tracing::warn!(area = %self.area, "flood topo set without root id");
            return;
        };
        if params.set_child {
            self.dual.set_child(root, &params.src_node_name);
        } else {
            self.dual.unset_child(root, &params.src_node_name);
        }
    }

    // ==================== Counters ====================

    fn bump(&mut self, name: &'static str) {
        *self.counters.entry(name).or_insert(0) += 1;
    }

    fn add_to(&mut self, name: &'static str, delta: i64) {
        if delta != 0 {
            *self.counters.entry(name).or_insert(0) += delta;
        }
    }

    fn counter_snapshot(&self) -> HashMap<String, i64> {
        let mut snapshot: HashMap<String, i64> = self
            .counters
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect();
        snapshot.insert("kvstore.num_keys".to_string(), self.store.len() as i64);
        snapshot.insert("kvstore.num_peers".to_string(), self.peers.len() as i64);
        snapshot.insert(
            "kvstore.ttl_countdown_entries".to_string(),
            self.ttl_queue.len() as i64,
        );
        snapshot
    }
}
