//! Cluster membership and the master/proxy contract
//!
//! Topic names are partitioned over live nodes by a consistent hash; each
//! topic is mastered on exactly one node and proxied everywhere else. This
//! module carries the placement ring, the request/response message contract
//! between proxy and master, a loopback transport for tests, and the
//! leader-style failover bookkeeping. The actual inter-node wire (gRPC, raw
//! TCP) lives behind [`ClusterTransport`] and is out of scope here.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use twox_hash::XxHash64;

use crate::config::FailoverConfig;
use crate::proto::{ClientMsg, ServerMsg};
use crate::topic::StopReason;
use crate::types::{AuthLevel, Uid};

/// Virtual points per node on the hash ring.
const RING_REPLICAS: usize = 64;

/// What a proxied client packet asks the master to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterReqType {
    /// Subscribe a remote session.
    Attach,
    /// Detach a remote session.
    Detach,
    /// Get/set/del topic metadata.
    Meta,
    /// Publish a data message.
    Data,
    /// Forward a note or routed presence.
    Broadcast,
    /// Heartbeat.
    Ping,
}

/// Descriptor of the real client session on the origin node.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub sid: String,
    pub uid: Uid,
    pub auth_lvl: AuthLevel,
    pub user_agent: String,
    pub background: bool,
}

/// Proxy-to-master request.
pub struct ClusterReq {
    pub req_type: ClusterReqType,
    /// Name of the sending node.
    pub node: String,
    pub topic: String,
    pub msg: Option<ClientMsg>,
    /// Routed server-side message (offline presence crossing nodes, proxied
    /// publishes).
    pub srv_msg: Option<ServerMsg>,
    pub sess: Option<RemoteSession>,
    /// Proxied-session bookkeeping piggybacked on a broadcast request.
    pub sess_update: Option<ClusterSessUpdate>,
}

impl ClusterReq {
    pub fn new(req_type: ClusterReqType, node: &str, topic: &str) -> Self {
        Self {
            req_type,
            node: node.to_string(),
            topic: topic.to_string(),
            msg: None,
            srv_msg: None,
            sess: None,
            sess_update: None,
        }
    }
}

/// Master-to-proxy response. An empty `orig_sid` addresses every session the
/// proxy multiplexes for this topic.
pub struct ClusterResp {
    pub topic: String,
    pub orig_sid: String,
    pub msg: Option<ServerMsg>,
    pub detach: bool,
    pub stop: Option<StopReason>,
}

/// Proxied-session bookkeeping update (user-agent change, background session
/// coming to the foreground).
#[derive(Debug, Clone)]
pub struct ClusterSessUpdate {
    pub node: String,
    pub sid: String,
    pub uid: Uid,
    pub user_agent: String,
    pub background_to_fg: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
}

/// Node-to-node delivery. Implementations must be cheap to clone behind an
/// Arc and safe to call from topic loops.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn request(&self, node: &str, req: ClusterReq) -> Result<(), ClusterError>;
    async fn respond(&self, node: &str, resp: ClusterResp) -> Result<(), ClusterError>;
}

fn hash64(key: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// Consistent-hash ring over node names.
struct Ring {
    points: Vec<(u64, usize)>,
    nodes: Vec<String>,
}

impl Ring {
    fn new(mut nodes: Vec<String>) -> Self {
        nodes.sort();
        nodes.dedup();
        let mut points = Vec::with_capacity(nodes.len() * RING_REPLICAS);
        for (idx, node) in nodes.iter().enumerate() {
            for replica in 0..RING_REPLICAS {
                points.push((hash64(&format!("{}:{}", node, replica)), idx));
            }
        }
        points.sort_unstable();
        Self { points, nodes }
    }

    fn node_for(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash64(key);
        let idx = match self.points.binary_search_by(|(p, _)| p.cmp(&h)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0,
            Err(i) => i,
        };
        Some(&self.nodes[self.points[idx].1])
    }
}

/// Cluster handle threaded through the server context.
pub struct Cluster {
    pub self_name: String,
    ring: RwLock<Ring>,
    pub transport: Arc<dyn ClusterTransport>,
}

impl Cluster {
    pub fn new(self_name: &str, nodes: Vec<String>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            self_name: self_name.to_string(),
            ring: RwLock::new(Ring::new(nodes)),
            transport,
        }
    }

    /// The node mastering the given topic.
    pub fn node_for(&self, topic: &str) -> String {
        self.ring
            .read()
            .unwrap()
            .node_for(topic)
            .unwrap_or(&self.self_name)
            .to_string()
    }

    /// Some(master) when the topic lives on another node.
    pub fn is_remote(&self, topic: &str) -> Option<String> {
        let master = self.node_for(topic);
        if master == self.self_name {
            None
        } else {
            Some(master)
        }
    }

    /// Replace the live node set; called on failover transitions.
    pub fn set_live_nodes(&self, nodes: Vec<String>) {
        *self.ring.write().unwrap() = Ring::new(nodes);
    }

    pub fn live_nodes(&self) -> Vec<String> {
        self.ring.read().unwrap().nodes.clone()
    }
}

/// In-process transport: per-node request/response inboxes. Used by tests
/// and single-binary multi-node simulations.
#[derive(Default)]
pub struct LoopbackTransport {
    reqs: DashMap<String, mpsc::Sender<ClusterReq>>,
    resps: DashMap<String, mpsc::Sender<ClusterResp>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and get its inboxes.
    pub fn register(&self, node: &str) -> (mpsc::Receiver<ClusterReq>, mpsc::Receiver<ClusterResp>) {
        let (req_tx, req_rx) = mpsc::channel(64);
        let (resp_tx, resp_rx) = mpsc::channel(64);
        self.reqs.insert(node.to_string(), req_tx);
        self.resps.insert(node.to_string(), resp_tx);
        (req_rx, resp_rx)
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn request(&self, node: &str, req: ClusterReq) -> Result<(), ClusterError> {
        let tx = self
            .reqs
            .get(node)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::Unreachable(node.to_string()))?;
        tx.send(req)
            .await
            .map_err(|_| ClusterError::Unreachable(node.to_string()))
    }

    async fn respond(&self, node: &str, resp: ClusterResp) -> Result<(), ClusterError> {
        let tx = self
            .resps
            .get(node)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::Unreachable(node.to_string()))?;
        tx.send(resp)
            .await
            .map_err(|_| ClusterError::Unreachable(node.to_string()))
    }
}

/// Outcome of one failover tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FailoverVerdict {
    /// Nodes newly declared down.
    pub failed: Vec<String>,
    pub leader_changed: bool,
    /// The live set changed; topics must be rehashed.
    pub topology_changed: bool,
}

/// Heartbeat bookkeeping for the leader-style failover protocol. The caller
/// drives it: `heartbeat_from` on every received ping, `tick` once per
/// heartbeat interval.
pub struct FailoverState {
    cfg: FailoverConfig,
    self_name: String,
    /// Missed-heartbeat counters for every other configured node.
    missed: HashMap<String, u32>,
    /// Nodes currently considered alive (including self).
    live: Vec<String>,
    leader: String,
}

impl FailoverState {
    pub fn new(cfg: FailoverConfig, self_name: &str, nodes: &[String]) -> Self {
        let mut live: Vec<String> = nodes.to_vec();
        live.sort();
        live.dedup();
        // Lowest node name wins the initial election.
        let leader = live.first().cloned().unwrap_or_else(|| self_name.to_string());
        let missed = nodes
            .iter()
            .filter(|n| **n != self_name)
            .map(|n| (n.clone(), 0))
            .collect();
        Self {
            cfg,
            self_name: self_name.to_string(),
            missed,
            live,
            leader,
        }
    }

    pub fn leader(&self) -> &str {
        &self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader == self.self_name
    }

    pub fn live_nodes(&self) -> Vec<String> {
        self.live.clone()
    }

    /// Record a heartbeat. A previously-dead node rejoining changes the
    /// topology.
    pub fn heartbeat_from(&mut self, node: &str) -> bool {
        if let Some(counter) = self.missed.get_mut(node) {
            *counter = 0;
        }
        if !self.live.iter().any(|n| n == node) {
            self.live.push(node.to_string());
            self.live.sort();
            return true;
        }
        false
    }

    /// Advance the clock by one heartbeat interval.
    pub fn tick(&mut self) -> FailoverVerdict {
        let mut verdict = FailoverVerdict::default();
        let mut vote_out = false;
        for (node, counter) in self.missed.iter_mut() {
            *counter += 1;
            let was_live = self.live.iter().any(|n| n == node);
            if was_live && *counter >= self.cfg.node_fail_after {
                verdict.failed.push(node.clone());
            }
            if was_live && node == &self.leader && *counter >= self.cfg.vote_after {
                vote_out = true;
            }
        }
        if !verdict.failed.is_empty() {
            self.live.retain(|n| !verdict.failed.contains(n));
            verdict.topology_changed = true;
        }
        if vote_out || !self.live.iter().any(|n| n == &self.leader) {
            // New leader: lowest live node wins the tie-break; a voted-out
            // leader is not a candidate even before it is declared dead.
            let new_leader = self
                .live
                .iter()
                .filter(|n| !(vote_out && **n == self.leader))
                .min()
                .cloned()
                .unwrap_or_else(|| self.self_name.clone());
            verdict.leader_changed = new_leader != self.leader;
            self.leader = new_leader;
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        vec!["n1".to_string(), "n2".to_string(), "n3".to_string()]
    }

    #[test]
    fn test_ring_is_deterministic() {
        let a = Ring::new(nodes());
        let b = Ring::new(nodes());
        for topic in ["grp1", "grp2", "usr00000000000000aa", "p2pxyz"] {
            assert_eq!(a.node_for(topic), b.node_for(topic));
        }
    }

    #[test]
    fn test_ring_partitions_all_nodes() {
        let ring = Ring::new(nodes());
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(ring.node_for(&format!("grp{}", i)).unwrap().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_node_removal_only_moves_its_topics() {
        let full = Ring::new(nodes());
        let reduced = Ring::new(vec!["n1".to_string(), "n3".to_string()]);
        for i in 0..500 {
            let topic = format!("grp{}", i);
            let before = full.node_for(&topic).unwrap();
            let after = reduced.node_for(&topic).unwrap();
            if before != "n2" {
                assert_eq!(before, after, "topic {} moved needlessly", topic);
            } else {
                assert_ne!(after, "n2");
            }
        }
    }

    #[test]
    fn test_is_remote() {
        let cluster = Cluster::new("n1", nodes(), Arc::new(LoopbackTransport::new()));
        let mut local = 0;
        let mut remote = 0;
        for i in 0..100 {
            match cluster.is_remote(&format!("grp{}", i)) {
                None => local += 1,
                Some(node) => {
                    assert_ne!(node, "n1");
                    remote += 1;
                }
            }
        }
        assert!(local > 0 && remote > 0);
    }

    #[test]
    fn test_failover_detects_dead_node() {
        let cfg = FailoverConfig {
            enabled: true,
            heartbeat: 100,
            vote_after: 4,
            node_fail_after: 8,
        };
        let mut state = FailoverState::new(cfg, "n2", &nodes());
        assert_eq!(state.leader(), "n1");

        // n3 keeps beating, n1 goes silent.
        let mut leader_changed = false;
        let mut failed = Vec::new();
        let mut rehashes = 0;
        for _ in 0..8 {
            let verdict = state.tick();
            leader_changed |= verdict.leader_changed;
            failed.extend(verdict.failed);
            rehashes += verdict.topology_changed as u32;
            state.heartbeat_from("n3");
        }
        assert!(leader_changed);
        assert_eq!(failed, vec!["n1".to_string()]);
        assert_eq!(rehashes, 1);
        // Lowest live name wins.
        assert_eq!(state.leader(), "n2");
        assert!(state.is_leader());
        assert_eq!(state.live_nodes(), vec!["n2".to_string(), "n3".to_string()]);
    }

    #[test]
    fn test_failover_leader_voted_out_before_node_death() {
        let cfg = FailoverConfig {
            enabled: true,
            heartbeat: 100,
            vote_after: 2,
            node_fail_after: 8,
        };
        let mut state = FailoverState::new(cfg, "n3", &nodes());
        state.heartbeat_from("n2");
        state.tick();
        state.heartbeat_from("n2");
        let verdict = state.tick();
        // Leader n1 missed vote_after beats; n2 is the lowest live candidate.
        assert!(verdict.leader_changed);
        assert_eq!(state.leader(), "n2");
    }

    #[test]
    fn test_rejoin_changes_topology() {
        let cfg = FailoverConfig {
            enabled: true,
            heartbeat: 100,
            vote_after: 2,
            node_fail_after: 2,
        };
        let mut state = FailoverState::new(cfg, "n1", &nodes());
        state.tick();
        let verdict = state.tick();
        assert_eq!(verdict.failed.len(), 2);
        assert!(state.heartbeat_from("n2"));
        assert_eq!(
            state.live_nodes(),
            vec!["n1".to_string(), "n2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_loopback_transport() {
        let transport = LoopbackTransport::new();
        let (mut req_rx, _resp_rx) = transport.register("n2");

        transport
            .request("n2", ClusterReq::new(ClusterReqType::Ping, "n1", ""))
            .await
            .unwrap();
        let req = req_rx.recv().await.unwrap();
        assert_eq!(req.req_type, ClusterReqType::Ping);
        assert_eq!(req.node, "n1");

        let err = transport
            .request("nx", ClusterReq::new(ClusterReqType::Ping, "n1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Unreachable(_)));
    }
}
