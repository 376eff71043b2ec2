//! Node error types.

use mesh_routing::RouteError;
use mesh_transport::TransportError;
use mesh_wire::{PeerId, RouteId, TransportId, WireError};
use thiserror::Error;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    /// No usable route under this id
    #[error("no route {0}")]
    NoRoute(RouteId),

    /// No transport reaches the next peer
    #[error("no transport to peer {0}")]
    NoTransport(PeerId),

    /// A transport to this peer already exists
    #[error("transport to peer {0} already exists")]
    TransportExists(PeerId),

    /// Transport id is not attached to this node
    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),

    /// Message or control request is malformed
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Node was closed
    #[error("node closed")]
    Closed,

    /// A task panicked while holding one of the node's locks
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    /// Control request or route confirm timed out
    #[error("control request timed out")]
    ControlTimeout,

    /// Application response timed out
    #[error("application request timed out")]
    AppTimeout,

    /// Application-level failure reported by the remote end
    #[error("application error: {0}")]
    App(String),

    /// Route table error
    #[error(transparent)]
    Route(#[from] RouteError),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Wire error
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
