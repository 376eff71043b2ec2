//! Node manager: owns every node, the links between them and the route graph.
//!
//! Nodes live in an index-addressed list; links are keyed by their unordered
//! peer pair. Components refer to each other by id and the manager resolves
//! them, so nothing holds a pointer back to its owner.

use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use mesh_node::{AddRouteControlMessage, Node, NodeError};
use mesh_topology::{DirectRoute, RouteGraph};
use mesh_transport::{LossControl, MemoryTransport};
use mesh_wire::{
    PeerId, RouteId, RouteRule, RpcCall, RpcFailure, RpcReply, TransportId, TransportInfo,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// One link created by the manager
#[derive(Clone, Debug)]
pub struct LinkRecord {
    /// First peer as passed to `connect`
    pub a: PeerId,
    /// Second peer
    pub b: PeerId,
    /// Transport id on `a`'s side
    pub a_transport: TransportId,
    /// Transport id on `b`'s side
    pub b_transport: TransportId,
    /// Loss injection for datagrams `a` sends
    pub a_loss: LossControl,
    /// Loss injection for datagrams `b` sends
    pub b_loss: LossControl,
}

impl LinkRecord {
    /// Transport id on `from`'s side of the link
    pub fn transport_of(&self, from: &PeerId) -> Option<TransportId> {
        if *from == self.a {
            Some(self.a_transport)
        } else if *from == self.b {
            Some(self.b_transport)
        } else {
            None
        }
    }
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Default)]
struct NodeList {
    nodes: Vec<Node>,
    index: HashMap<PeerId, usize>,
}

/// Creates nodes, links them and builds routes across them
pub struct NodeManager {
    config: ManagerConfig,
    nodes: RwLock<NodeList>,
    links: tokio::sync::Mutex<HashMap<(PeerId, PeerId), LinkRecord>>,
    graph: Mutex<RouteGraph>,
    shut_down: AtomicBool,
}

impl NodeManager {
    /// Create an empty manager
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: RwLock::new(NodeList::default()),
            links: tokio::sync::Mutex::new(HashMap::new()),
            graph: Mutex::new(RouteGraph::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ManagerError::Shutdown);
        }
        Ok(())
    }

    // ---- nodes ----

    /// Start one node
    pub fn add_node(&self) -> Result<PeerId> {
        self.check_running()?;
        let node = Node::spawn(self.config.node_config());
        let peer = node.peer();

        let mut list = self
            .nodes
            .write()
            .map_err(|_| ManagerError::LockPoisoned("nodes"))?;
        let next = list.nodes.len();
        list.index.insert(peer, next);
        list.nodes.push(node);
        info!(peer = %peer, index = list.nodes.len() - 1, "Node added");
        Ok(peer)
    }

    /// Start `n` nodes
    pub fn add_nodes(&self, n: usize) -> Result<Vec<PeerId>> {
        if n > self.config.max_nodes_per_call {
            return Err(ManagerError::TooManyNodes {
                requested: n,
                max: self.config.max_nodes_per_call,
            });
        }
        (0..n).map(|_| self.add_node()).collect()
    }

    /// Number of managed nodes
    pub fn node_count(&self) -> usize {
        self.nodes.read().map(|l| l.nodes.len()).unwrap_or(0)
    }

    /// Peers in creation order
    pub fn peers(&self) -> Vec<PeerId> {
        self.nodes
            .read()
            .map(|l| l.nodes.iter().map(|n| n.peer()).collect())
            .unwrap_or_default()
    }

    /// Node at position `index`
    pub fn node_at(&self, index: usize) -> Result<Node> {
        let list = self
            .nodes
            .read()
            .map_err(|_| ManagerError::LockPoisoned("nodes"))?;
        list.nodes
            .get(index)
            .cloned()
            .ok_or(ManagerError::NodeIndexOutOfRange {
                index,
                len: list.nodes.len(),
            })
    }

    /// Node with peer id `peer`
    pub fn node(&self, peer: &PeerId) -> Result<Node> {
        let list = self
            .nodes
            .read()
            .map_err(|_| ManagerError::LockPoisoned("nodes"))?;
        list.index
            .get(peer)
            .and_then(|i| list.nodes.get(*i))
            .cloned()
            .ok_or(ManagerError::NodeNotFound(*peer))
    }

    fn peer_at(&self, index: usize) -> Result<PeerId> {
        self.node_at(index).map(|n| n.peer())
    }

    // ---- links ----

    /// Link the nodes at positions `i` and `j`
    pub async fn connect_nodes(&self, i: usize, j: usize) -> Result<[TransportId; 2]> {
        let (a, b) = (self.peer_at(i)?, self.peer_at(j)?);
        self.connect_peers(a, b).await
    }

    /// Link two nodes with an in-memory transport pair.
    ///
    /// Returns the transport ids on `a`'s and `b`'s side.
    pub async fn connect_peers(&self, a: PeerId, b: PeerId) -> Result<[TransportId; 2]> {
        self.check_running()?;
        if a == b {
            return Err(ManagerError::ConnectedToItself(a));
        }
        let (node_a, node_b) = (self.node(&a)?, self.node(&b)?);

        let mut links = self.links.lock().await;
        if links.contains_key(&link_key(a, b)) {
            return Err(ManagerError::AlreadyConnected(a, b));
        }

        let (ta, tb) = MemoryTransport::pair(a, b, self.config.link_mtu);
        let (a_loss, b_loss) = (ta.loss(), tb.loss());
        let a_transport = node_a
            .control()
            .add_transport(TransportId::new(), b, Arc::new(ta))
            .await?;
        let b_transport = match node_b
            .control()
            .add_transport(TransportId::new(), a, Arc::new(tb))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = node_a.remove_transport(&b).await {
                    warn!(a = %a.short(), b = %b.short(), "removing half-made link failed: {}", cleanup);
                }
                return Err(e.into());
            }
        };

        links.insert(
            link_key(a, b),
            LinkRecord {
                a,
                b,
                a_transport,
                b_transport,
                a_loss,
                b_loss,
            },
        );
        drop(links);

        {
            let mut graph = self
                .graph
                .lock()
                .map_err(|_| ManagerError::LockPoisoned("graph"))?;
            graph.add_direct_route(a, b, self.config.link_weight)?;
            graph.add_direct_route(b, a, self.config.link_weight)?;
        }

        info!(a = %a.short(), b = %b.short(), "Nodes connected");
        Ok([a_transport, b_transport])
    }

    /// Link record between two peers, in either order
    pub async fn link(&self, a: &PeerId, b: &PeerId) -> Option<LinkRecord> {
        self.links.lock().await.get(&link_key(*a, *b)).cloned()
    }

    async fn transport_between(&self, from: &PeerId, to: &PeerId) -> Option<TransportId> {
        self.link(from, to).await.and_then(|l| l.transport_of(from))
    }

    /// Every directed edge of the route graph
    pub fn edges(&self) -> Vec<DirectRoute> {
        self.graph.lock().map(|g| g.edges()).unwrap_or_default()
    }

    // ---- routes ----

    /// Shortest path between two peers, endpoints included
    pub fn find_path(&self, from: PeerId, to: PeerId) -> Result<Vec<PeerId>> {
        let mut graph = self
            .graph
            .lock()
            .map_err(|_| ManagerError::LockPoisoned("graph"))?;
        Ok(graph.find_route(from, to)?)
    }

    /// Build a route along the shortest path between positions `i` and `j`
    pub async fn find_route(&self, i: usize, j: usize) -> Result<Vec<RouteId>> {
        let (a, b) = (self.peer_at(i)?, self.peer_at(j)?);
        let path = self.find_path(a, b)?;
        debug!(from = %a.short(), to = %b.short(), hops = path.len(), "path found");
        self.build_route(&path).await
    }

    /// Build a route through the nodes at `indices`
    pub async fn build_route_indices(&self, indices: &[usize]) -> Result<Vec<RouteId>> {
        let path = indices
            .iter()
            .map(|i| self.peer_at(*i))
            .collect::<Result<Vec<_>>>()?;
        self.build_route(&path).await
    }

    /// Install a route along `path`, one id per link.
    ///
    /// The first id addresses the route from the origin, the last one from
    /// the terminal. A hop that fails leaves earlier hops installed and is
    /// reported as [`ManagerError::RouteBuild`].
    pub async fn build_route(&self, path: &[PeerId]) -> Result<Vec<RouteId>> {
        self.check_running()?;
        if path.len() < 2 {
            return Err(ManagerError::InvalidPath(format!(
                "{} peers, need at least 2",
                path.len()
            )));
        }

        let route_ids: Vec<RouteId> = (0..path.len() - 1).map(|_| RouteId::new()).collect();

        for (hop, peer) in path.iter().enumerate() {
            let fail = |source| ManagerError::RouteBuild {
                hop,
                peer: *peer,
                source,
            };
            let node = self.node(peer)?;

            let incoming = match hop.checked_sub(1).map(|p| path[p]) {
                Some(prev) => Some((
                    self.transport_between(peer, &prev)
                        .await
                        .ok_or_else(|| fail(NodeError::NoTransport(prev)))?,
                    route_ids[hop - 1],
                )),
                None => None,
            };
            let outgoing = match path.get(hop + 1) {
                Some(next) => Some((
                    self.transport_between(peer, next)
                        .await
                        .ok_or_else(|| fail(NodeError::NoTransport(*next)))?,
                    route_ids[hop],
                )),
                None => None,
            };

            let msg = AddRouteControlMessage {
                incoming_transport: incoming.map(|(t, _)| t),
                outgoing_transport: outgoing.map(|(t, _)| t),
                incoming_route_id: incoming.map(|(_, r)| r),
                outgoing_route_id: outgoing.map(|(_, r)| r),
            };
            if let Err(e) = node.control().add_route(msg).await {
                warn!(hop, peer = %peer.short(), "route build failed: {}", e);
                return Err(fail(e));
            }
        }

        info!(
            origin = %path[0].short(),
            terminal = %path[path.len() - 1].short(),
            hops = path.len(),
            "Route built"
        );
        Ok(route_ids)
    }

    // ---- listings ----

    /// Transports of the node at position `index`
    pub async fn list_transports(&self, index: usize) -> Result<Vec<TransportInfo>> {
        Ok(self.node_at(index)?.control().list_transports().await?)
    }

    /// Transports of every node, in node order
    pub async fn list_all_transports(&self) -> Result<Vec<TransportInfo>> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| ManagerError::LockPoisoned("nodes"))?
            .nodes
            .clone();
        let mut all = Vec::new();
        for node in nodes {
            all.extend(node.control().list_transports().await?);
        }
        Ok(all)
    }

    /// Route table of the node at position `index`
    pub async fn list_routes(&self, index: usize) -> Result<Vec<RouteRule>> {
        Ok(self.node_at(index)?.control().list_routes().await?)
    }

    // ---- rpc ----

    /// Execute one control RPC call
    pub async fn handle(&self, call: RpcCall) -> std::result::Result<RpcReply, RpcFailure> {
        let name = call.name();
        let result = match call {
            RpcCall::AddNode => self.add_node().map(RpcReply::PeerId),
            RpcCall::AddNodes { n } => self.add_nodes(n as usize).map(RpcReply::PeerIds),
            RpcCall::ConnectNodes { i, j } => self
                .connect_nodes(i as usize, j as usize)
                .await
                .map(RpcReply::TransportPair),
            RpcCall::ListTransports { node } => self
                .list_transports(node as usize)
                .await
                .map(RpcReply::Transports),
            RpcCall::ListAllTransports => self.list_all_transports().await.map(RpcReply::Transports),
            RpcCall::BuildRoute { nodes } => {
                let indices: Vec<usize> = nodes.into_iter().map(|n| n as usize).collect();
                self.build_route_indices(&indices)
                    .await
                    .map(RpcReply::RouteIds)
            }
            RpcCall::FindRoute { i, j } => self
                .find_route(i as usize, j as usize)
                .await
                .map(RpcReply::RouteIds),
            RpcCall::ListRoutes { node } => {
                self.list_routes(node as usize).await.map(RpcReply::Routes)
            }
        };
        result.map_err(|e| {
            debug!(call = name, "rpc call failed: {}", e);
            e.to_failure()
        })
    }

    /// Close every node and refuse further work
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let nodes = match self.nodes.write() {
            Ok(mut list) => {
                list.index.clear();
                std::mem::take(&mut list.nodes)
            }
            Err(_) => Vec::new(),
        };
        let count = nodes.len();
        for result in futures::future::join_all(nodes.iter().map(|n| n.close())).await {
            if let Err(e) = result {
                warn!("node close failed: {}", e);
            }
        }
        self.links.lock().await.clear();
        if let Ok(mut graph) = self.graph.lock() {
            graph.clear();
        }
        info!(nodes = count, "Node manager shut down");
    }
}
