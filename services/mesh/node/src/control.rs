//! Node control channel used by the manager.
//!
//! Commands travel over a bounded channel to the node's control task. Every
//! request carries a sequence number and a oneshot for the result; callers
//! wait on it with the control timeout.

use crate::error::{NodeError, Result};
use mesh_transport::PhysicalTransport;
use mesh_wire::{PeerId, RouteId, RouteRule, TransportId, TransportInfo};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Install one hop of a route built by the manager.
///
/// The origin hop has no incoming side, the terminal hop no outgoing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRouteControlMessage {
    /// Transport toward the previous hop
    pub incoming_transport: Option<TransportId>,
    /// Transport toward the next hop
    pub outgoing_transport: Option<TransportId>,
    /// Id on the link from the previous hop
    pub incoming_route_id: Option<RouteId>,
    /// Id on the link to the next hop
    pub outgoing_route_id: Option<RouteId>,
}

/// Commands a node's control task accepts
pub enum NodeCommand {
    /// Attach a physical link and wrap it in a reliable transport
    AddTransport {
        /// Id for the new transport
        transport_id: TransportId,
        /// Peer at the other end
        remote_peer: PeerId,
        /// The link
        physical: Arc<dyn PhysicalTransport>,
        /// Result channel
        response_tx: oneshot::Sender<Result<TransportId>>,
    },
    /// Install one hop of a route
    AddRoute {
        /// Hop description
        route: AddRouteControlMessage,
        /// Result channel
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// Snapshot the route table
    ListRoutes {
        /// Result channel
        response_tx: oneshot::Sender<Vec<RouteRule>>,
    },
    /// Snapshot the transports
    ListTransports {
        /// Result channel
        response_tx: oneshot::Sender<Vec<TransportInfo>>,
    },
}

impl NodeCommand {
    /// Command name for logs
    pub fn name(&self) -> &'static str {
        match self {
            NodeCommand::AddTransport { .. } => "add_transport",
            NodeCommand::AddRoute { .. } => "add_route",
            NodeCommand::ListRoutes { .. } => "list_routes",
            NodeCommand::ListTransports { .. } => "list_transports",
        }
    }
}

impl fmt::Debug for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::AddTransport {
                transport_id,
                remote_peer,
                ..
            } => f
                .debug_struct("AddTransport")
                .field("transport_id", transport_id)
                .field("remote_peer", remote_peer)
                .finish(),
            NodeCommand::AddRoute { route, .. } => {
                f.debug_struct("AddRoute").field("route", route).finish()
            }
            NodeCommand::ListRoutes { .. } => f.write_str("ListRoutes"),
            NodeCommand::ListTransports { .. } => f.write_str("ListTransports"),
        }
    }
}

/// A sequenced command
#[derive(Debug)]
pub struct ControlRequest {
    /// Per-handle sequence number
    pub sequence: u64,
    /// The command
    pub command: NodeCommand,
}

/// Cloneable handle to a node's control channel
#[derive(Clone)]
pub struct NodeControl {
    peer: PeerId,
    tx: mpsc::Sender<ControlRequest>,
    sequence: Arc<AtomicU64>,
    timeout: Duration,
}

impl NodeControl {
    pub(crate) fn new(peer: PeerId, tx: mpsc::Sender<ControlRequest>, timeout: Duration) -> Self {
        Self {
            peer,
            tx,
            sequence: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    /// Peer of the controlled node
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        let request = ControlRequest {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            command: make(response_tx),
        };
        let sequence = request.sequence;
        debug!(peer = %self.peer.short(), sequence, command = request.command.name(), "control request");

        tokio::time::timeout(self.timeout, self.tx.send(request))
            .await
            .map_err(|_| NodeError::ControlTimeout)?
            .map_err(|_| NodeError::Closed)?;

        match tokio::time::timeout(self.timeout, response_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(NodeError::Closed),
            Err(_) => {
                debug!(peer = %self.peer.short(), sequence, "control request timed out");
                Err(NodeError::ControlTimeout)
            }
        }
    }

    /// Attach a physical link
    pub async fn add_transport(
        &self,
        transport_id: TransportId,
        remote_peer: PeerId,
        physical: Arc<dyn PhysicalTransport>,
    ) -> Result<TransportId> {
        self.request(|response_tx| NodeCommand::AddTransport {
            transport_id,
            remote_peer,
            physical,
            response_tx,
        })
        .await?
    }

    /// Install one hop of a route
    pub async fn add_route(&self, route: AddRouteControlMessage) -> Result<()> {
        self.request(|response_tx| NodeCommand::AddRoute { route, response_tx })
            .await?
    }

    /// Route table snapshot
    pub async fn list_routes(&self) -> Result<Vec<RouteRule>> {
        self.request(|response_tx| NodeCommand::ListRoutes { response_tx })
            .await
    }

    /// Transport snapshot
    pub async fn list_transports(&self) -> Result<Vec<TransportInfo>> {
        self.request(|response_tx| NodeCommand::ListTransports { response_tx })
            .await
    }
}
