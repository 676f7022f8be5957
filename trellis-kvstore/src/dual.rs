//! Loop-free spanning tree per flood root.
//!
//! A diffusing-update (DUAL style) distance vector: every node tracks its
//! neighbors' reported distances to each root and only routes through a
//! neighbor satisfying the feasibility condition (its reported distance is
//! strictly below our feasible distance). When no feasible successor
//! remains, the node goes active, queries all neighbors, and recomputes
//! once the last reply arrives. Reported distances only shrink while
//! passive, which keeps the active topology loop-free.
//!
//! This module is a pure state machine: inputs are peer and message
//! events, outputs are messages to send plus an optional nexthop change
//! the owner turns into `FLOOD_TOPO_SET` commands and a re-flood.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use trellis_model::{
    DualMessage, DualMessageType, SptInfo, SptInfos, DUAL_DISTANCE_INFINITY,
};

/// Output of one event: messages addressed to neighbors, and the nexthop
/// change (old, new) if the route to the root moved.
#[derive(Debug, Default)]
pub struct DualOutput {
    pub msgs: Vec<(String, DualMessage)>,
    pub nexthop_change: Option<(Option<String>, Option<String>)>,
}

impl DualOutput {
    fn merge(&mut self, other: DualOutput) {
        self.msgs.extend(other.msgs);
        if other.nexthop_change.is_some() {
            self.nexthop_change = other.nexthop_change;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DualStatus {
    Passive,
    /// Waiting on replies from these neighbors.
    Active(BTreeSet<String>),
}

/// DUAL instance for one root at one node.
pub struct Dual {
    node_id: String,
    root_id: String,
    /// Last distance reported by each neighbor, plus the link cost.
    neighbors: BTreeMap<String, NeighborInfo>,
    nexthop: Option<String>,
    report_distance: i64,
    feasible_distance: i64,
    status: DualStatus,
}

#[derive(Debug)]
struct NeighborInfo {
    reported: i64,
    link_cost: i64,
}

impl Dual {
    pub fn new(node_id: impl Into<String>, root_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let root_id = root_id.into();
        let is_root = node_id == root_id;
        let dist = if is_root { 0 } else { DUAL_DISTANCE_INFINITY };
        let nexthop = is_root.then(|| root_id.clone());
        Self {
            node_id,
            root_id,
            neighbors: BTreeMap::new(),
            nexthop,
            report_distance: dist,
            feasible_distance: dist,
            status: DualStatus::Passive,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Nexthop toward the root; the root itself reports its own id.
    pub fn nexthop(&self) -> Option<&str> {
        self.nexthop.as_deref()
    }

    pub fn distance(&self) -> i64 {
        self.report_distance
    }

    pub fn is_passive(&self) -> bool {
        self.status == DualStatus::Passive
    }

    fn is_root(&self) -> bool {
        self.node_id == self.root_id
    }

    fn update_msg(&self, dst: &str) -> (String, DualMessage) {
        (
            dst.to_string(),
            DualMessage {
                mtype: DualMessageType::Update,
                src_id: self.node_id.clone(),
                root_id: self.root_id.clone(),
                distance: self.report_distance,
            },
        )
    }

    /// A neighbor came up; advertise our distance to it.
    pub fn peer_up(&mut self, neighbor: &str, link_cost: i64) -> DualOutput {
        self.neighbors.insert(
            neighbor.to_string(),
            NeighborInfo {
                reported: DUAL_DISTANCE_INFINITY,
                link_cost,
            },
        );
        let mut out = DualOutput {
            msgs: vec![self.update_msg(neighbor)],
            nexthop_change: None,
        };
        out.merge(self.local_compute());
        out
    }

    pub fn peer_down(&mut self, neighbor: &str) -> DualOutput {
        self.neighbors.remove(neighbor);
        let mut out = DualOutput::default();
        // A pending reply from a vanished neighbor would hang the
        // diffusing computation; treat the down as its reply.
        if let DualStatus::Active(pending) = &mut self.status {
            pending.remove(neighbor);
            if pending.is_empty() {
                out.merge(self.finish_active());
                return out;
            }
        }
        out.merge(self.local_compute());
        out
    }

    pub fn handle(&mut self, msg: &DualMessage) -> DualOutput {
        debug_assert_eq!(msg.root_id, self.root_id);
        match msg.mtype {
            DualMessageType::Update => self.handle_update(&msg.src_id, msg.distance),
            DualMessageType::Query => self.handle_query(&msg.src_id, msg.distance),
            DualMessageType::Reply => self.handle_reply(&msg.src_id, msg.distance),
        }
    }

    fn handle_update(&mut self, from: &str, distance: i64) -> DualOutput {
        if let Some(info) = self.neighbors.get_mut(from) {
            info.reported = distance;
        }
        let mut out = self.local_compute();
        // An infinity report doubles as "tell me what you have": a peer
        // that came up after our last update would otherwise never learn
        // our distance.
        if distance == DUAL_DISTANCE_INFINITY
            && self.report_distance != DUAL_DISTANCE_INFINITY
        {
            out.msgs.push(self.update_msg(from));
        }
        out
    }

    fn handle_query(&mut self, from: &str, distance: i64) -> DualOutput {
        if let Some(info) = self.neighbors.get_mut(from) {
            info.reported = distance;
        }
        let mut out = self.local_compute();
        // Always answer; the reply carries whatever we can currently
        // stand behind, including infinity while we are active ourselves.
        out.msgs.push((
            from.to_string(),
            DualMessage {
                mtype: DualMessageType::Reply,
                src_id: self.node_id.clone(),
                root_id: self.root_id.clone(),
                distance: self.report_distance,
            },
        ));
        out
    }

    fn handle_reply(&mut self, from: &str, distance: i64) -> DualOutput {
        if let Some(info) = self.neighbors.get_mut(from) {
            info.reported = distance;
        }
        if let DualStatus::Active(pending) = &mut self.status {
            pending.remove(from);
            if pending.is_empty() {
                return self.finish_active();
            }
            return DualOutput::default();
        }
        self.local_compute()
    }

    /// Best distance through any neighbor, ignoring feasibility.
    fn best_distance(&self) -> (i64, Option<String>) {
        let mut best = (DUAL_DISTANCE_INFINITY, None);
        for (name, info) in &self.neighbors {
            if info.reported == DUAL_DISTANCE_INFINITY {
                continue;
            }
            let d = info.reported.saturating_add(info.link_cost);
            if d < best.0 {
                best = (d, Some(name.clone()));
            }
        }
        best
    }

    /// Best distance through a neighbor satisfying the feasibility
    /// condition: reported distance strictly below our feasible distance.
    fn best_feasible(&self) -> (i64, Option<String>) {
        let mut best = (DUAL_DISTANCE_INFINITY, None);
        for (name, info) in &self.neighbors {
            if info.reported >= self.feasible_distance {
                continue;
            }
            let d = info.reported.saturating_add(info.link_cost);
            if d < best.0 {
                best = (d, Some(name.clone()));
            }
        }
        best
    }

    fn local_compute(&mut self) -> DualOutput {
        if self.is_root() || !matches!(self.status, DualStatus::Passive) {
            return DualOutput::default();
        }

        let (dist, successor) = self.best_feasible();
        if successor.is_some() {
            return self.adopt(dist, successor);
        }

        // No feasible successor. A node that never had a route has no
        // reported distance to defend, so there is no loop risk in
        // waiting passively for neighbor updates.
        if self.report_distance == DUAL_DISTANCE_INFINITY {
            return self.adopt(DUAL_DISTANCE_INFINITY, None);
        }

        self.start_active()
    }

    fn start_active(&mut self) -> DualOutput {
        let pending: BTreeSet<String> = self.neighbors.keys().cloned().collect();
        if pending.is_empty() {
            return self.adopt(DUAL_DISTANCE_INFINITY, None);
        }
        let (best, _) = self.best_distance();
        self.status = DualStatus::Active(pending.clone());
        let msgs = pending
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    DualMessage {
                        mtype: DualMessageType::Query,
                        src_id: self.node_id.clone(),
                        root_id: self.root_id.clone(),
                        distance: best,
                    },
                )
            })
            .collect();
        DualOutput {
            msgs,
            nexthop_change: None,
        }
    }

    /// Last reply arrived: the feasible distance resets and the best
    /// neighbor (if any) becomes the successor.
    fn finish_active(&mut self) -> DualOutput {
        self.status = DualStatus::Passive;
        self.feasible_distance = DUAL_DISTANCE_INFINITY;
        let (dist, successor) = self.best_distance();
        self.adopt(dist, successor)
    }

    fn adopt(&mut self, dist: i64, successor: Option<String>) -> DualOutput {
        let mut out = DualOutput::default();
        let old_report = self.report_distance;
        self.report_distance = dist;
        self.feasible_distance = self.feasible_distance.min(dist);
        if self.nexthop != successor {
            out.nexthop_change = Some((self.nexthop.take(), successor.clone()));
            self.nexthop = successor;
        }
        if old_report != self.report_distance {
            out.msgs = self
                .neighbors
                .keys()
                .map(|n| self.update_msg(n))
                .collect();
        }
        out
    }

    pub fn spt_info(&self, children: &BTreeSet<String>) -> SptInfo {
        SptInfo {
            passive: self.is_passive(),
            cost: self.report_distance,
            parent: if self.is_root() {
                None
            } else {
                self.nexthop.clone()
            },
            children: children.clone(),
        }
    }
}

/// All DUAL instances at one node plus the child relationships peers have
/// declared through `FLOOD_TOPO_SET`.
pub struct DualState {
    node_id: String,
    duals: HashMap<String, Dual>,
    children: HashMap<String, BTreeSet<String>>,
    /// Neighbors currently up, with link cost; new roots learn them.
    neighbors: BTreeMap<String, i64>,
}

impl DualState {
    pub fn new(node_id: impl Into<String>, is_flood_root: bool) -> Self {
        let node_id = node_id.into();
        let mut state = Self {
            node_id: node_id.clone(),
            duals: HashMap::new(),
            children: HashMap::new(),
            neighbors: BTreeMap::new(),
        };
        if is_flood_root {
            state.duals.insert(node_id.clone(), Dual::new(node_id.clone(), node_id));
        }
        state
    }

    pub fn peer_up(&mut self, neighbor: &str, link_cost: i64) -> Vec<(String, DualOutput)> {
        self.neighbors.insert(neighbor.to_string(), link_cost);
        self.duals
            .iter_mut()
            .map(|(root, dual)| (root.clone(), dual.peer_up(neighbor, link_cost)))
            .collect()
    }

    pub fn peer_down(&mut self, neighbor: &str) -> Vec<(String, DualOutput)> {
        self.neighbors.remove(neighbor);
        for children in self.children.values_mut() {
            children.remove(neighbor);
        }
        self.duals
            .iter_mut()
            .map(|(root, dual)| (root.clone(), dual.peer_down(neighbor)))
            .collect()
    }

    /// Route one message to its root's instance, creating the instance on
    /// first sight of a new root.
    pub fn handle_message(&mut self, msg: &DualMessage) -> DualOutput {
        let dual = self.duals.entry(msg.root_id.clone()).or_insert_with(|| {
            let mut d = Dual::new(self.node_id.clone(), msg.root_id.clone());
            // A fresh instance must know the current adjacency before it
            // can process reports.
            for (n, cost) in &self.neighbors {
                let _ = d.peer_up(n, *cost);
            }
            d
        });
        dual.handle(msg)
    }

    pub fn set_child(&mut self, root_id: &str, peer: &str) {
        self.children
            .entry(root_id.to_string())
            .or_default()
            .insert(peer.to_string());
    }

    pub fn unset_child(&mut self, root_id: &str, peer: &str) {
        if let Some(children) = self.children.get_mut(root_id) {
            children.remove(peer);
        }
    }

    pub fn unset_child_all(&mut self, peer: &str) {
        for children in self.children.values_mut() {
            children.remove(peer);
        }
    }

    /// The lowest root id with a live route is the flood root.
    pub fn current_flood_root(&self) -> Option<String> {
        self.duals
            .iter()
            .filter(|(_, d)| d.nexthop().is_some() && d.is_passive())
            .map(|(root, _)| root.clone())
            .min()
    }

    /// Peers a publication flooded for `root_id` goes to: the parent plus
    /// declared children.
    pub fn flood_peers(&self, root_id: &str) -> BTreeSet<String> {
        let mut peers = self
            .children
            .get(root_id)
            .cloned()
            .unwrap_or_default();
        if let Some(dual) = self.duals.get(root_id) {
            if let Some(parent) = dual.nexthop() {
                if parent != self.node_id {
                    peers.insert(parent.to_string());
                }
            }
        }
        peers
    }

    pub fn parent(&self, root_id: &str) -> Option<String> {
        self.duals.get(root_id).and_then(|d| {
            d.nexthop()
                .filter(|nh| *nh != self.node_id)
                .map(str::to_string)
        })
    }

    pub fn spt_infos(&self) -> SptInfos {
        let infos = self
            .duals
            .iter()
            .map(|(root, dual)| {
                let children = self.children.get(root).cloned().unwrap_or_default();
                (root.clone(), dual.spt_info(&children))
            })
            .collect();
        let flood_root_id = self.current_flood_root();
        let flood_peers = flood_root_id
            .as_deref()
            .map(|r| self.flood_peers(r))
            .unwrap_or_default();
        SptInfos {
            infos,
            flood_root_id,
            flood_peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deliver queued messages between a set of nodes until quiescent.
    fn settle(nodes: &mut BTreeMap<String, Dual>, mut queue: Vec<(String, DualMessage)>) {
        let mut rounds = 0;
        while !queue.is_empty() {
            rounds += 1;
            assert!(rounds < 1000, "dual did not converge");
            let mut next = Vec::new();
            for (dst, msg) in queue.drain(..) {
                if let Some(node) = nodes.get_mut(&dst) {
                    let out = node.handle(&msg);
                    next.extend(out.msgs);
                }
            }
            queue = next;
        }
    }

    fn link(nodes: &mut BTreeMap<String, Dual>, a: &str, b: &str) -> Vec<(String, DualMessage)> {
        let mut msgs = Vec::new();
        let out_a = nodes.get_mut(a).unwrap().peer_up(b, 1);
        msgs.extend(out_a.msgs);
        let out_b = nodes.get_mut(b).unwrap().peer_up(a, 1);
        msgs.extend(out_b.msgs);
        msgs
    }

    #[test]
    fn line_topology_converges() {
        // r0 - n1 - n2
        let mut nodes = BTreeMap::new();
        nodes.insert("r0".to_string(), Dual::new("r0", "r0"));
        nodes.insert("n1".to_string(), Dual::new("n1", "r0"));
        nodes.insert("n2".to_string(), Dual::new("n2", "r0"));

        let mut queue = link(&mut nodes, "r0", "n1");
        queue.extend(link(&mut nodes, "n1", "n2"));
        settle(&mut nodes, queue);

        assert_eq!(nodes["r0"].nexthop(), Some("r0"));
        assert_eq!(nodes["n1"].nexthop(), Some("r0"));
        assert_eq!(nodes["n1"].distance(), 1);
        assert_eq!(nodes["n2"].nexthop(), Some("n1"));
        assert_eq!(nodes["n2"].distance(), 2);
        assert!(nodes.values().all(|d| d.is_passive()));
    }

    #[test]
    fn triangle_prefers_direct_link() {
        let mut nodes = BTreeMap::new();
        nodes.insert("r0".to_string(), Dual::new("r0", "r0"));
        nodes.insert("n1".to_string(), Dual::new("n1", "r0"));
        nodes.insert("n2".to_string(), Dual::new("n2", "r0"));

        let mut queue = link(&mut nodes, "r0", "n1");
        queue.extend(link(&mut nodes, "r0", "n2"));
        queue.extend(link(&mut nodes, "n1", "n2"));
        settle(&mut nodes, queue);

        assert_eq!(nodes["n1"].nexthop(), Some("r0"));
        assert_eq!(nodes["n2"].nexthop(), Some("r0"));
        assert_eq!(nodes["n1"].distance(), 1);
        assert_eq!(nodes["n2"].distance(), 1);
    }

    #[test]
    fn losing_the_direct_link_reroutes_through_sibling() {
        let mut nodes = BTreeMap::new();
        nodes.insert("r0".to_string(), Dual::new("r0", "r0"));
        nodes.insert("n1".to_string(), Dual::new("n1", "r0"));
        nodes.insert("n2".to_string(), Dual::new("n2", "r0"));

        let mut queue = link(&mut nodes, "r0", "n1");
        queue.extend(link(&mut nodes, "r0", "n2"));
        queue.extend(link(&mut nodes, "n1", "n2"));
        settle(&mut nodes, queue);

        // n2 loses its link to the root.
        let out_r = nodes.get_mut("r0").unwrap().peer_down("n2");
        let out_n2 = nodes.get_mut("n2").unwrap().peer_down("r0");
        let mut queue: Vec<_> = out_r.msgs;
        queue.extend(out_n2.msgs);
        settle(&mut nodes, queue);

        assert_eq!(nodes["n2"].nexthop(), Some("n1"));
        assert_eq!(nodes["n2"].distance(), 2);
        assert!(nodes["n2"].is_passive());
    }

    #[test]
    fn feasibility_condition_gates_successors() {
        let mut d = Dual::new("n1", "r0");
        let _ = d.peer_up("n2", 1);
        // n2 reports distance 5; accepted because fd is still infinite.
        let _ = d.handle(&DualMessage {
            mtype: DualMessageType::Update,
            src_id: "n2".to_string(),
            root_id: "r0".to_string(),
            distance: 5,
        });
        assert_eq!(d.nexthop(), Some("n2"));
        assert_eq!(d.distance(), 6);

        // A neighbor whose report equals our feasible distance is not a
        // feasible successor.
        let _ = d.peer_up("n3", 1);
        let out = d.handle(&DualMessage {
            mtype: DualMessageType::Update,
            src_id: "n3".to_string(),
            root_id: "r0".to_string(),
            distance: 6,
        });
        assert_eq!(d.nexthop(), Some("n2"));
        assert!(out.nexthop_change.is_none());
    }

    #[test]
    fn state_tracks_children_from_topo_set() {
        let mut state = DualState::new("n1", false);
        state.set_child("r0", "n2");
        state.set_child("r0", "n3");
        state.unset_child("r0", "n2");
        assert_eq!(
            state.flood_peers("r0"),
            BTreeSet::from(["n3".to_string()])
        );
        state.unset_child_all("n3");
        assert!(state.flood_peers("r0").is_empty());
    }
}
