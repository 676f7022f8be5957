//! The prefix manager actor.
//!
//! Owns the prefix database and reconciles it into the KvStore: consumes
//! prefix events and decision route updates, batches changed prefixes,
//! and on each (throttled) sync pass advertises the winning entry per
//! prefix into every eligible area, withdraws stale keys, and emits
//! static routes for the forwarding layer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use tokio::sync::{broadcast, mpsc, oneshot};

use trellis_kvstore::{KvStoreClient, KvStoreHandle};
use trellis_model::constants::KVSTORE_SYNC_THROTTLE;
use trellis_model::{
    Config, DumpParams, PrefixDatabase, PrefixEntry, PrefixEvent, PrefixEventKind,
    PrefixType, Publication, RibUnicastEntry, RouteUpdate, Value,
};

use crate::entry::{pick_best_type, select_best_prefix_metrics, PrefixEntryInternal};
use crate::originated::{
    build_originated_prefix_db, strictly_contains, OriginatedRoute,
};
use crate::policy::PolicyEngine;
use crate::prefix_key::PrefixKey;
use crate::{AdvertisedRouteDetail, OriginatedPrefixEntry, PrefixManagerError};

pub(crate) enum PrefixCmd {
    Advertise {
        entries: Vec<PrefixEntry>,
        resp: oneshot::Sender<bool>,
    },
    Withdraw {
        entries: Vec<PrefixEntry>,
        resp: oneshot::Sender<bool>,
    },
    WithdrawByType {
        ptype: PrefixType,
        resp: oneshot::Sender<bool>,
    },
    SyncByType {
        ptype: PrefixType,
        entries: Vec<PrefixEntry>,
        resp: oneshot::Sender<bool>,
    },
    GetPrefixes {
        resp: oneshot::Sender<Vec<PrefixEntry>>,
    },
    GetPrefixesByType {
        ptype: PrefixType,
        resp: oneshot::Sender<Vec<PrefixEntry>>,
    },
    GetAdvertisedRoutes {
        resp: oneshot::Sender<Vec<AdvertisedRouteDetail>>,
    },
    GetOriginatedPrefixes {
        resp: oneshot::Sender<Vec<OriginatedPrefixEntry>>,
    },
    Stop,
}

/// Which KvStore keys a prefix currently owns, and whether its winning
/// entry is installed downstream.
#[derive(Debug, Default)]
struct AdvertisedKeys {
    keys: BTreeSet<String>,
    installed_to_fib: bool,
}

pub struct PrefixManager;

impl PrefixManager {
    /// Validate configuration, build the originated-prefix table, and
    /// spawn the actor.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: &Config,
        policy: Arc<dyn PolicyEngine>,
        kvstore: KvStoreHandle,
        prefix_events: mpsc::Receiver<PrefixEvent>,
        route_updates: mpsc::Receiver<RouteUpdate>,
        static_routes: mpsc::Sender<RouteUpdate>,
        initial_sync_hold: Duration,
    ) -> Result<PrefixManagerHandle, PrefixManagerError> {
        let mut areas = BTreeMap::new();
        for area in &config.areas {
            if let Some(name) = &area.import_policy {
                if !policy.has_policy(name) {
                    return Err(PrefixManagerError::PolicyMissing(name.clone()));
                }
            }
            areas.insert(area.id.clone(), area.import_policy.clone());
        }
        let originated =
            build_originated_prefix_db(&config.node_name, &config.originated_prefixes)?;

        let client = KvStoreClient::new(kvstore.clone(), config.kvstore.key_ttl_ms);
        let manager = Manager {
            node_name: config.node_name.clone(),
            areas,
            prefer_originated: config.prefer_originated_routes,
            compact_keys: config.enable_compact_prefix_keys,
            policy,
            kvstore,
            client,
            static_routes,
            prefix_map: HashMap::new(),
            advertised_keys: HashMap::new(),
            originated,
            rib_prefix_db: HashMap::new(),
            pending: BTreeSet::new(),
            throttle_deadline: None,
            initial_deadline: Instant::now() + initial_sync_hold,
            initial_done: false,
        };

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(manager.run(rx, prefix_events, route_updates));
        Ok(PrefixManagerHandle { tx })
    }
}

struct Manager {
    node_name: String,
    /// Area id to optional import policy name.
    areas: BTreeMap<String, Option<String>>,
    prefer_originated: bool,
    compact_keys: bool,
    policy: Arc<dyn PolicyEngine>,
    kvstore: KvStoreHandle,
    client: KvStoreClient,
    static_routes: mpsc::Sender<RouteUpdate>,

    prefix_map: HashMap<IpNet, HashMap<PrefixType, PrefixEntryInternal>>,
    advertised_keys: HashMap<IpNet, AdvertisedKeys>,
    originated: HashMap<IpNet, OriginatedRoute>,
    /// RIB prefix to the originated aggregates it supports.
    rib_prefix_db: HashMap<IpNet, Vec<IpNet>>,

    pending: BTreeSet<IpNet>,
    throttle_deadline: Option<Instant>,
    initial_deadline: Instant,
    initial_done: bool,
}

impl Manager {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<PrefixCmd>,
        mut prefix_events: mpsc::Receiver<PrefixEvent>,
        mut route_updates: mpsc::Receiver<RouteUpdate>,
    ) {
        // Subscribe before the recovery dump so no update slips between.
        let mut kv_updates = self.kvstore.subscribe();
        let mut kv_updates_open = true;

        self.recover_advertised_keys().await;
        // Aggregates with a zero threshold advertise right away.
        self.process_originated_prefixes();

        tracing::info!(node = %self.node_name, "prefix manager started");
        loop {
            let throttle = self.throttle_deadline;
            let initial = (!self.initial_done).then_some(self.initial_deadline);
            let refresh = self.client.next_refresh_deadline();
            tokio::select! {
                maybe_cmd = rx.recv() => match maybe_cmd {
                    Some(PrefixCmd::Stop) | None => break,
                    Some(cmd) => self.handle_cmd(cmd),
                },
                maybe_event = prefix_events.recv() => match maybe_event {
                    Some(event) => self.handle_prefix_event(event),
                    None => {
                        tracing::debug!("prefix event queue closed");
                        break;
                    }
                },
                maybe_routes = route_updates.recv() => match maybe_routes {
                    Some(update) => self.handle_route_update(update),
                    None => {
                        tracing::debug!("route update queue closed");
                        break;
                    }
                },
                update = kv_updates.recv(), if kv_updates_open => match update {
                    Ok(publication) => self.handle_kvstore_update(&publication),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "kvstore updates lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => kv_updates_open = false,
                },
                _ = async { tokio::time::sleep_until(initial.expect("guarded").into()).await },
                    if initial.is_some() =>
                {
                    self.initial_done = true;
                    tracing::info!("initial kvstore sync");
                    self.sync_kvstore().await;
                }
                _ = async { tokio::time::sleep_until(throttle.expect("guarded").into()).await },
                    if throttle.is_some() && self.initial_done =>
                {
                    self.throttle_deadline = None;
                    self.sync_kvstore().await;
                }
                _ = async { tokio::time::sleep_until(refresh.expect("guarded").into()).await },
                    if refresh.is_some() =>
                {
                    if let Err(e) = self.client.refresh_ttls().await {
                        tracing::warn!(error = %e, "ttl refresh failed");
                    }
                }
            }
        }
        tracing::info!(node = %self.node_name, "prefix manager stopped");
    }

    fn handle_cmd(&mut self, cmd: PrefixCmd) {
        match cmd {
            PrefixCmd::Advertise { entries, resp } => {
                let dst = self.all_area_ids();
                let entries = entries
                    .into_iter()
                    .map(|e| PrefixEntryInternal::new(e, dst.clone()))
                    .collect();
                let _ = resp.send(self.advertise_entries(entries));
            }
            PrefixCmd::Withdraw { entries, resp } => {
                let _ = resp.send(self.withdraw_entries(&entries));
            }
            PrefixCmd::WithdrawByType { ptype, resp } => {
                let _ = resp.send(self.withdraw_by_type(ptype));
            }
            PrefixCmd::SyncByType {
                ptype,
                entries,
                resp,
            } => {
                let dst = self.all_area_ids();
                let _ = resp.send(self.sync_by_type(ptype, entries, dst));
            }
            PrefixCmd::GetPrefixes { resp } => {
                let prefixes = self
                    .prefix_map
                    .values()
                    .flat_map(|by_type| by_type.values())
                    .map(|e| e.entry.clone())
                    .collect();
                let _ = resp.send(prefixes);
            }
            PrefixCmd::GetPrefixesByType { ptype, resp } => {
                let prefixes = self
                    .prefix_map
                    .values()
                    .filter_map(|by_type| by_type.get(&ptype))
                    .map(|e| e.entry.clone())
                    .collect();
                let _ = resp.send(prefixes);
            }
            PrefixCmd::GetAdvertisedRoutes { resp } => {
                let _ = resp.send(self.advertised_route_details());
            }
            PrefixCmd::GetOriginatedPrefixes { resp } => {
                let originated = self
                    .originated
                    .values()
                    .map(|route| OriginatedPrefixEntry {
                        config: route.config.clone(),
                        supporting_prefixes: route.supporting_routes.iter().copied().collect(),
                        is_advertised: route.is_advertised,
                    })
                    .collect();
                let _ = resp.send(originated);
            }
            PrefixCmd::Stop => unreachable!("handled by the loop"),
        }
    }

    fn all_area_ids(&self) -> BTreeSet<String> {
        self.areas.keys().cloned().collect()
    }

    fn schedule_sync(&mut self) {
        // Writes are held back until the one-shot initial sync fires;
        // pending prefixes accumulate and ride that first pass.
        if !self.initial_done {
            return;
        }
        if self.throttle_deadline.is_none() {
            self.throttle_deadline = Some(Instant::now() + KVSTORE_SYNC_THROTTLE);
        }
    }

    // ==================== Prefix database mutation ====================

    fn handle_prefix_event(&mut self, event: PrefixEvent) {
        let dst_areas: BTreeSet<String> = if event.dst_areas.is_empty() {
            self.all_area_ids()
        } else {
            event.dst_areas.iter().cloned().collect()
        };
        match event.kind {
            PrefixEventKind::Add => {
                let entries = event
                    .entries
                    .into_iter()
                    .map(|e| PrefixEntryInternal::new(e, dst_areas.clone()))
                    .collect();
                self.advertise_entries(entries);
            }
            PrefixEventKind::Withdraw => {
                self.withdraw_entries(&event.entries);
            }
            PrefixEventKind::WithdrawByType => match event.ptype {
                Some(ptype) => {
                    self.withdraw_by_type(ptype);
                }
                None => tracing::warn!("withdraw-by-type event without a type"),
            },
            PrefixEventKind::SyncByType => match event.ptype {
                Some(ptype) => {
                    self.sync_by_type(ptype, event.entries, dst_areas);
                }
                None => tracing::warn!("sync-by-type event without a type"),
            },
        }
    }

    fn advertise_entries(&mut self, entries: Vec<PrefixEntryInternal>) -> bool {
        let mut changed = false;
        for entry in entries {
            let network = entry.entry.prefix;
            let ptype = entry.entry.ptype;
            let by_type = self.prefix_map.entry(network).or_default();
            if by_type.get(&ptype) == Some(&entry) {
                continue;
            }
            by_type.insert(ptype, entry);
            self.pending.insert(network);
            changed = true;
        }
        if changed {
            self.schedule_sync();
        }
        changed
    }

    fn withdraw_entries(&mut self, entries: &[PrefixEntry]) -> bool {
        let mut changed = false;
        for entry in entries {
            let network = entry.prefix;
            let Some(by_type) = self.prefix_map.get_mut(&network) else {
                continue;
            };
            if by_type.remove(&entry.ptype).is_none() {
                continue;
            }
            // No empty inner maps.
            if by_type.is_empty() {
                self.prefix_map.remove(&network);
            }
            self.pending.insert(network);
            changed = true;
        }
        if changed {
            self.schedule_sync();
        }
        changed
    }

    fn withdraw_by_type(&mut self, ptype: PrefixType) -> bool {
        let to_remove: Vec<PrefixEntry> = self
            .prefix_map
            .values()
            .filter_map(|by_type| by_type.get(&ptype))
            .map(|e| e.entry.clone())
            .collect();
        self.withdraw_entries(&to_remove)
    }

    /// Make `ptype`'s entries exactly `entries`: advertise the new set,
    /// withdraw whatever of that type is no longer named.
    fn sync_by_type(
        &mut self,
        ptype: PrefixType,
        entries: Vec<PrefixEntry>,
        dst_areas: BTreeSet<String>,
    ) -> bool {
        let mut stale: BTreeSet<IpNet> = self
            .prefix_map
            .iter()
            .filter(|(_, by_type)| by_type.contains_key(&ptype))
            .map(|(network, _)| *network)
            .collect();

        let mut to_add = Vec::new();
        for entry in entries {
            if entry.ptype != ptype {
                tracing::warn!(
                    expected = ?ptype,
                    got = ?entry.ptype,
                    "sync-by-type entry with mismatched type"
                );
                continue;
            }
            stale.remove(&entry.prefix);
            to_add.push(PrefixEntryInternal::new(entry, dst_areas.clone()));
        }
        let to_remove: Vec<PrefixEntry> = stale
            .iter()
            .filter_map(|network| self.prefix_map.get(network))
            .filter_map(|by_type| by_type.get(&ptype))
            .map(|e| e.entry.clone())
            .collect();

        let mut changed = self.advertise_entries(to_add);
        changed |= self.withdraw_entries(&to_remove);
        changed
    }

    // ==================== Decision route redistribution ====================

    fn handle_route_update(&mut self, update: RouteUpdate) {
        let mut advertised = Vec::new();
        let mut withdrawn = Vec::new();

        for (prefix, route) in update.unicast_to_update {
            // A node's own aggregate is never its own supporting route.
            if route.best_entry.ptype == PrefixType::Config
                && self.originated.contains_key(&prefix)
            {
                continue;
            }

            let mut entry = route.best_entry;
            entry.prefix = prefix;
            entry.area_stack.push(route.best_area.clone());
            entry.metrics.distance += 1;
            entry.ptype = PrefixType::Rib;
            // Prepend labels must not leak across areas.
            entry.prepend_label = None;

            let mut dst_areas = self.all_area_ids();
            for nexthop in &route.nexthops {
                if let Some(area) = &nexthop.area {
                    dst_areas.remove(area);
                }
            }
            advertised.push(PrefixEntryInternal::new(entry, dst_areas));

            self.aggregates_to_advertise(&prefix);
        }

        for prefix in update.unicast_to_delete {
            if self.originated.contains_key(&prefix) {
                continue;
            }
            withdrawn.push(PrefixEntry::new(prefix, PrefixType::Rib));
            self.aggregates_to_withdraw(&prefix);
        }

        self.process_originated_prefixes();

        // Redistribution only makes sense across multiple areas, but the
        // supporting-route bookkeeping above runs regardless.
        if self.areas.len() > 1 {
            self.advertise_entries(advertised);
            self.withdraw_entries(&withdrawn);
        }
    }

    fn aggregates_to_advertise(&mut self, prefix: &IpNet) {
        // Attribute-only updates for known RIB entries cannot change any
        // supporting-route count.
        if self.rib_prefix_db.contains_key(prefix) {
            return;
        }
        let mut supported = Vec::new();
        for (network, route) in self.originated.iter_mut() {
            if !strictly_contains(network, prefix) {
                continue;
            }
            tracing::debug!(
                supporting = %prefix,
                aggregate = %network,
                "adding supporting route"
            );
            supported.push(*network);
            route.supporting_routes.insert(*prefix);
        }
        self.rib_prefix_db.insert(*prefix, supported);
    }

    fn aggregates_to_withdraw(&mut self, prefix: &IpNet) {
        let Some(supported) = self.rib_prefix_db.remove(prefix) else {
            return;
        };
        for network in supported {
            if let Some(route) = self.originated.get_mut(&network) {
                tracing::debug!(
                    supporting = %prefix,
                    aggregate = %network,
                    "removing supporting route"
                );
                route.supporting_routes.remove(prefix);
            }
        }
    }

    fn process_originated_prefixes(&mut self) {
        let all_areas = self.all_area_ids();
        let mut advertised = Vec::new();
        let mut withdrawn = Vec::new();

        for (network, route) in self.originated.iter_mut() {
            if route.should_advertise() {
                route.is_advertised = true;
                tracing::info!(prefix = %network, "advertising originated route");
                let nexthops = route
                    .config
                    .install_to_fib
                    .then(|| route.unicast_entry.nexthops.clone());
                advertised.push(PrefixEntryInternal {
                    entry: route.unicast_entry.best_entry.clone(),
                    dst_areas: all_areas.clone(),
                    nexthops,
                });
            }
            if route.should_withdraw() {
                route.is_advertised = false;
                tracing::info!(prefix = %network, "withdrawing originated route");
                withdrawn.push(PrefixEntry::new(*network, PrefixType::Config));
            }
        }

        self.advertise_entries(advertised);
        self.withdraw_entries(&withdrawn);
    }

    // ==================== KvStore reconciliation ====================

    /// One reconciliation pass over every changed prefix.
    async fn sync_kvstore(&mut self) {
        let changed: Vec<IpNet> = std::mem::take(&mut self.pending).into_iter().collect();
        if changed.is_empty() {
            return;
        }
        tracing::debug!(
            changed = changed.len(),
            total = self.prefix_map.len(),
            "syncing prefixes to kvstore"
        );
        let mut routes_out = RouteUpdate::default();

        for network in changed {
            let best = self.prefix_map.get(&network).and_then(|by_type| {
                let best_types = select_best_prefix_metrics(by_type);
                pick_best_type(&best_types, self.prefer_originated)
                    .and_then(|t| by_type.get(&t))
                    .cloned()
            });

            match best {
                None => {
                    // Nothing left for this prefix: withdraw every key we
                    // ever issued for it.
                    if let Some(advertised) = self.advertised_keys.remove(&network) {
                        self.delete_kvstore_keys(&network, &advertised.keys).await;
                        if advertised.installed_to_fib {
                            routes_out.unicast_to_delete.push(network);
                        }
                    }
                }
                Some(best) => {
                    let new_keys = self.advertise_to_areas(&network, &best).await;

                    let advertised = self.advertised_keys.entry(network).or_default();
                    let stale: BTreeSet<String> =
                        advertised.keys.difference(&new_keys).cloned().collect();
                    advertised.keys = new_keys;
                    let was_installed = advertised.installed_to_fib;
                    advertised.installed_to_fib = best.should_install();

                    if !stale.is_empty() {
                        self.delete_kvstore_keys(&network, &stale).await;
                    }

                    if best.should_install() {
                        routes_out.unicast_to_update.insert(
                            network,
                            RibUnicastEntry {
                                prefix: network,
                                nexthops: best.nexthops.clone().unwrap_or_default(),
                                best_entry: best.entry.clone(),
                                best_area: String::new(),
                            },
                        );
                    } else if was_installed {
                        routes_out.unicast_to_delete.push(network);
                    }
                }
            }
        }

        if !routes_out.is_empty() {
            if let Err(e) = self.static_routes.try_send(routes_out) {
                tracing::warn!(error = %e, "dropping static route update");
            }
        }
    }

    /// Advertise the winning entry into each destination area it may
    /// enter; returns the key names issued this round.
    async fn advertise_to_areas(
        &mut self,
        network: &IpNet,
        best: &PrefixEntryInternal,
    ) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for area in &best.dst_areas {
            let Some(policy_name) = self.areas.get(area) else {
                tracing::debug!(area = %area, "skipping unknown destination area");
                continue;
            };
            // A prefix never re-enters an area it has crossed.
            if best.entry.area_stack.iter().any(|a| a == area) {
                continue;
            }

            let post_policy = match policy_name {
                Some(name) => {
                    let (entry, hit) = self.policy.apply_policy(name, &best.entry);
                    match entry {
                        Some(entry) => entry,
                        None => {
                            tracing::debug!(
                                area = %area,
                                policy = %name,
                                rule = %hit,
                                prefix = %network,
                                "prefix rejected by import policy"
                            );
                            continue;
                        }
                    }
                }
                None => best.entry.clone(),
            };

            let key =
                PrefixKey::new(&self.node_name, area, *network).format(self.compact_keys);
            let database = PrefixDatabase {
                this_node_name: self.node_name.clone(),
                prefix_entries: vec![post_policy],
                delete_prefix: false,
            };
            let body = match bincode::serialize(&database) {
                Ok(body) => body,
                Err(e) => {
                    debug_assert!(false, "prefix database must serialize: {e}");
                    tracing::error!(error = %e, "failed encoding prefix database");
                    continue;
                }
            };
            match self.client.persist_key(area, &key, body).await {
                Ok(changed) => {
                    if changed {
                        tracing::info!(area = %area, key = %key, "prefix advertised");
                    }
                    keys.insert(key);
                }
                Err(e) => {
                    tracing::warn!(area = %area, key = %key, error = %e, "prefix advertise failed");
                }
            }
        }
        keys
    }

    /// Withdraw keys by publishing a delete-flagged database body.
    async fn delete_kvstore_keys(&mut self, network: &IpNet, keys: &BTreeSet<String>) {
        for key in keys {
            let Some(parsed) = PrefixKey::parse(key) else {
                debug_assert!(false, "advertised key must parse: {key}");
                tracing::error!(key = %key, "unparseable advertised key");
                continue;
            };
            let database = PrefixDatabase {
                this_node_name: self.node_name.clone(),
                prefix_entries: vec![PrefixEntry::new(*network, PrefixType::Config)],
                delete_prefix: true,
            };
            let body = match bincode::serialize(&database) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(error = %e, "failed encoding delete database");
                    continue;
                }
            };
            match self.client.clear_key(&parsed.area, key, body).await {
                Ok(_) => tracing::info!(area = %parsed.area, key = %key, "prefix withdrawn"),
                Err(e) => {
                    tracing::warn!(area = %parsed.area, key = %key, error = %e, "prefix withdraw failed");
                }
            }
        }
    }

    // ==================== Restart recovery ====================

    /// Learn the keys this node advertised before a restart so the next
    /// sync pass can refresh or withdraw them.
    async fn recover_advertised_keys(&mut self) {
        let areas: Vec<String> = self.areas.keys().cloned().collect();
        for area in areas {
            let params = DumpParams::with_prefixes(PrefixKey::node_patterns(&self.node_name));
            match self.kvstore.dump_area(&area, params).await {
                Ok(publication) => {
                    for (key, value) in &publication.key_vals {
                        self.learn_advertised_key(key, value);
                    }
                }
                Err(e) => {
                    tracing::warn!(area = %area, error = %e, "advertised key recovery failed");
                }
            }
        }
    }

    fn handle_kvstore_update(&mut self, publication: &Publication) {
        for (key, value) in &publication.key_vals {
            self.learn_advertised_key(key, value);
        }
    }

    fn learn_advertised_key(&mut self, key: &str, value: &Value) {
        // TTL refreshes carry no body and change nothing here.
        let Some(body) = &value.value else {
            return;
        };
        let Some(parsed) = PrefixKey::parse(key) else {
            return;
        };
        if parsed.node != self.node_name {
            return;
        }
        let database: PrefixDatabase = match bincode::deserialize(body) {
            Ok(database) => database,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable prefix database body");
                return;
            }
        };
        if database.delete_prefix || database.this_node_name != self.node_name {
            return;
        }
        let advertised = self.advertised_keys.entry(parsed.prefix).or_default();
        if advertised.keys.insert(key.to_string()) {
            tracing::debug!(key = %key, "learned previously advertised key");
            self.pending.insert(parsed.prefix);
            self.schedule_sync();
        }
    }

    // ==================== Introspection ====================

    fn advertised_route_details(&self) -> Vec<AdvertisedRouteDetail> {
        let mut details = Vec::new();
        for (network, by_type) in &self.prefix_map {
            if by_type.is_empty() {
                continue;
            }
            let best_types = select_best_prefix_metrics(by_type);
            let Some(best_type) = pick_best_type(&best_types, self.prefer_originated) else {
                continue;
            };
            details.push(AdvertisedRouteDetail {
                prefix: *network,
                best_type,
                best_types,
                routes: by_type
                    .iter()
                    .map(|(t, e)| (*t, e.entry.clone()))
                    .collect(),
            });
        }
        details
    }
}

/// Cloneable handle; methods schedule onto the manager's loop.
#[derive(Clone, Debug)]
pub struct PrefixManagerHandle {
    tx: mpsc::Sender<PrefixCmd>,
}

impl PrefixManagerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PrefixCmd,
    ) -> Result<T, PrefixManagerError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(make(resp_tx))
            .await
            .map_err(|_| PrefixManagerError::Stopped)?;
        resp_rx.await.map_err(|_| PrefixManagerError::Stopped)
    }

    /// Advertise entries into every configured area.
    pub async fn advertise(&self, entries: Vec<PrefixEntry>) -> Result<bool, PrefixManagerError> {
        self.call(|resp| PrefixCmd::Advertise { entries, resp }).await
    }

    pub async fn withdraw(&self, entries: Vec<PrefixEntry>) -> Result<bool, PrefixManagerError> {
        self.call(|resp| PrefixCmd::Withdraw { entries, resp }).await
    }

    pub async fn withdraw_by_type(&self, ptype: PrefixType) -> Result<bool, PrefixManagerError> {
        self.call(|resp| PrefixCmd::WithdrawByType { ptype, resp })
            .await
    }

    pub async fn sync_by_type(
        &self,
        ptype: PrefixType,
        entries: Vec<PrefixEntry>,
    ) -> Result<bool, PrefixManagerError> {
        self.call(|resp| PrefixCmd::SyncByType {
            ptype,
            entries,
            resp,
        })
        .await
    }

    pub async fn get_prefixes(&self) -> Result<Vec<PrefixEntry>, PrefixManagerError> {
        self.call(|resp| PrefixCmd::GetPrefixes { resp }).await
    }

    pub async fn get_prefixes_by_type(
        &self,
        ptype: PrefixType,
    ) -> Result<Vec<PrefixEntry>, PrefixManagerError> {
        self.call(|resp| PrefixCmd::GetPrefixesByType { ptype, resp })
            .await
    }

    pub async fn get_advertised_routes(
        &self,
    ) -> Result<Vec<AdvertisedRouteDetail>, PrefixManagerError> {
        self.call(|resp| PrefixCmd::GetAdvertisedRoutes { resp }).await
    }

    pub async fn get_originated_prefixes(
        &self,
    ) -> Result<Vec<OriginatedPrefixEntry>, PrefixManagerError> {
        self.call(|resp| PrefixCmd::GetOriginatedPrefixes { resp })
            .await
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(PrefixCmd::Stop).await;
    }
}
