//! Control RPC over UDP.
//!
//! Every request datagram carries a sequence number; the server answers with
//! a response carrying the same number. The client keeps one oneshot waiter
//! per outstanding sequence and gives up after the control timeout.

use crate::error::RpcError;
use crate::manager::NodeManager;
use bytes::Bytes;
use dashmap::DashMap;
use mesh_wire::{
    PeerId, RouteId, RouteRule, RpcCall, RpcErrorKind, RpcFailure, RpcMessage, RpcReply,
    RpcRequest, RpcResponse, TransportId, TransportInfo, WireError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest datagram read from a control socket
pub const MAX_RPC_DATAGRAM: usize = 65_507;

/// Serves manager RPC calls on one or more UDP sockets
pub struct RpcServer {
    addrs: Vec<SocketAddr>,
    closing: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind every address in `addrs` and start one receive loop per socket
    pub async fn bind(manager: Arc<NodeManager>, addrs: &[SocketAddr]) -> Result<Self, RpcError> {
        let (closing, _) = watch::channel(false);
        let mut bound = Vec::with_capacity(addrs.len());
        let mut tasks = Vec::with_capacity(addrs.len());

        for addr in addrs {
            let socket = Arc::new(UdpSocket::bind(addr).await?);
            let local = socket.local_addr()?;
            info!(addr = %local, "RPC server listening");
            bound.push(local);
            tasks.push(tokio::spawn(serve(
                manager.clone(),
                socket,
                closing.subscribe(),
            )));
        }

        Ok(Self {
            addrs: bound,
            closing,
            tasks: Mutex::new(tasks),
        })
    }

    /// Bound addresses, in the order given to [`RpcServer::bind`]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Stop every receive loop
    pub async fn shutdown(&self) {
        let _ = self.closing.send(true);
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut t) => t.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("RPC server stopped");
    }
}

async fn serve(manager: Arc<NodeManager>, socket: Arc<UdpSocket>, mut closing: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_RPC_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = closing.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("rpc receive failed: {}", e);
                    continue;
                }
            },
        };

        let request = match RpcMessage::decode(&buf[..len]) {
            Ok(RpcMessage::Request(request)) => request,
            Ok(RpcMessage::Response(_)) => {
                debug!(%from, "ignoring response sent to server");
                continue;
            }
            Err(e) => {
                warn!(%from, "dropping undecodable rpc datagram: {}", e);
                continue;
            }
        };

        // calls like BuildRoute wait on nodes; keep receiving meanwhile
        let manager = manager.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            debug!(%from, sequence = request.sequence, call = request.call.name(), "rpc call");
            let outcome = manager.handle(request.call).await;
            match reply_datagram(request.sequence, outcome) {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, from).await {
                        warn!(%from, "rpc reply failed: {}", e);
                    }
                }
                Err(e) => warn!(%from, "rpc reply encode failed: {}", e),
            }
        });
    }
    debug!("rpc receive loop exited");
}

/// Encode a response, replacing replies too large for one datagram with an
/// `Internal` failure so the caller sees an error rather than a timeout.
fn reply_datagram(
    sequence: u64,
    outcome: Result<RpcReply, RpcFailure>,
) -> Result<Bytes, WireError> {
    let bytes = RpcMessage::Response(RpcResponse { sequence, outcome }).encode()?;
    if bytes.len() <= MAX_RPC_DATAGRAM {
        return Ok(bytes);
    }
    warn!(sequence, len = bytes.len(), "rpc reply exceeds datagram limit");
    RpcMessage::Response(RpcResponse {
        sequence,
        outcome: Err(RpcFailure {
            kind: RpcErrorKind::Internal,
            message: format!(
                "reply of {} bytes exceeds the {} byte datagram limit",
                bytes.len(),
                MAX_RPC_DATAGRAM
            ),
        }),
    })
    .encode()
}

/// Client for a remote [`RpcServer`]
pub struct RpcClient {
    socket: Arc<UdpSocket>,
    sequence: AtomicU64,
    waiters: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>,
    timeout: Duration,
    closing: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Connect to a server at `server`
    pub async fn connect(server: SocketAddr, timeout: Duration) -> Result<Self, RpcError> {
        let bind: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        socket.connect(server).await?;

        let waiters = Arc::new(DashMap::new());
        let (closing, closing_rx) = watch::channel(false);
        let task = tokio::spawn(receive_responses(socket.clone(), waiters.clone(), closing_rx));

        Ok(Self {
            socket,
            sequence: AtomicU64::new(1),
            waiters,
            timeout,
            closing,
            task: Mutex::new(Some(task)),
        })
    }

    /// Outstanding calls
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Issue one call and wait for its reply
    pub async fn call(&self, call: RpcCall) -> Result<RpcReply, RpcError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let bytes = RpcMessage::Request(RpcRequest { sequence, call }).encode()?;

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(sequence, tx);
        if let Err(e) = self.socket.send(&bytes).await {
            self.waiters.remove(&sequence);
            return Err(e.into());
        }

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.waiters.remove(&sequence);
        match outcome {
            Ok(Ok(response)) => response.outcome.map_err(RpcError::Remote),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::ControlTimeout(sequence)),
        }
    }

    /// Start one node
    pub async fn add_node(&self) -> Result<PeerId, RpcError> {
        match self.call(RpcCall::AddNode).await? {
            RpcReply::PeerId(peer) => Ok(peer),
            _ => Err(RpcError::UnexpectedReply("AddNode")),
        }
    }

    /// Start `n` nodes
    pub async fn add_nodes(&self, n: u32) -> Result<Vec<PeerId>, RpcError> {
        match self.call(RpcCall::AddNodes { n }).await? {
            RpcReply::PeerIds(peers) => Ok(peers),
            _ => Err(RpcError::UnexpectedReply("AddNodes")),
        }
    }

    /// Link nodes `i` and `j`
    pub async fn connect_nodes(&self, i: u32, j: u32) -> Result<[TransportId; 2], RpcError> {
        match self.call(RpcCall::ConnectNodes { i, j }).await? {
            RpcReply::TransportPair(pair) => Ok(pair),
            _ => Err(RpcError::UnexpectedReply("ConnectNodes")),
        }
    }

    /// Transports of node `node`
    pub async fn list_transports(&self, node: u32) -> Result<Vec<TransportInfo>, RpcError> {
        match self.call(RpcCall::ListTransports { node }).await? {
            RpcReply::Transports(t) => Ok(t),
            _ => Err(RpcError::UnexpectedReply("ListTransports")),
        }
    }

    /// Transports of every node
    pub async fn list_all_transports(&self) -> Result<Vec<TransportInfo>, RpcError> {
        match self.call(RpcCall::ListAllTransports).await? {
            RpcReply::Transports(t) => Ok(t),
            _ => Err(RpcError::UnexpectedReply("ListAllTransports")),
        }
    }

    /// Build a route through `nodes`
    pub async fn build_route(&self, nodes: Vec<u32>) -> Result<Vec<RouteId>, RpcError> {
        match self.call(RpcCall::BuildRoute { nodes }).await? {
            RpcReply::RouteIds(ids) => Ok(ids),
            _ => Err(RpcError::UnexpectedReply("BuildRoute")),
        }
    }

    /// Build a route along the shortest path from `i` to `j`
    pub async fn find_route(&self, i: u32, j: u32) -> Result<Vec<RouteId>, RpcError> {
        match self.call(RpcCall::FindRoute { i, j }).await? {
            RpcReply::RouteIds(ids) => Ok(ids),
            _ => Err(RpcError::UnexpectedReply("FindRoute")),
        }
    }

    /// Route table of node `node`
    pub async fn list_routes(&self, node: u32) -> Result<Vec<RouteRule>, RpcError> {
        match self.call(RpcCall::ListRoutes { node }).await? {
            RpcReply::Routes(routes) => Ok(routes),
            _ => Err(RpcError::UnexpectedReply("ListRoutes")),
        }
    }

    /// Stop the response loop; outstanding calls fail with `Closed`
    pub async fn close(&self) {
        let _ = self.closing.send(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        self.waiters.clear();
    }
}

async fn receive_responses(
    socket: Arc<UdpSocket>,
    waiters: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>,
    mut closing: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_RPC_DATAGRAM];
    loop {
        let len = tokio::select! {
            _ = closing.changed() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    debug!("rpc client receive failed: {}", e);
                    continue;
                }
            },
        };

        match RpcMessage::decode(&buf[..len]) {
            Ok(RpcMessage::Response(response)) => match waiters.remove(&response.sequence) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response);
                }
                None => debug!(sequence = response.sequence, "late or unknown rpc response"),
            },
            Ok(RpcMessage::Request(_)) => debug!("ignoring request sent to client"),
            Err(e) => warn!("dropping undecodable rpc datagram: {}", e),
        }
    }
}
