//! Manager and RPC error types.

use mesh_node::NodeError;
use mesh_topology::GraphError;
use mesh_wire::{PeerId, RpcErrorKind, RpcFailure, WireError};
use thiserror::Error;

/// Node manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Index past the end of the node list
    #[error("node index {index} out of range ({len} nodes)")]
    NodeIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Nodes known
        len: usize,
    },

    /// `AddNodes` asked for more than the cap
    #[error("too many nodes requested: {requested} (max {max})")]
    TooManyNodes {
        /// Requested count
        requested: usize,
        /// Cap
        max: usize,
    },

    /// The pair already shares a transport
    #[error("{0} and {1} are already connected")]
    AlreadyConnected(PeerId, PeerId),

    /// Peer is not managed here
    #[error("node {0} not found")]
    NodeNotFound(PeerId),

    /// Both ends are the same node
    #[error("node {0} cannot connect to itself")]
    ConnectedToItself(PeerId),

    /// Path has fewer than two peers
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A hop rejected its part of the route; earlier hops stay installed
    #[error("route build failed at hop {hop} ({peer}): {source}")]
    RouteBuild {
        /// Index of the failing hop in the path
        hop: usize,
        /// Peer at that hop
        peer: PeerId,
        /// What the hop reported
        #[source]
        source: NodeError,
    },

    /// Manager was shut down
    #[error("manager shut down")]
    Shutdown,

    /// A task panicked while holding one of the manager's locks
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    /// Node error
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Graph error
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ManagerError {
    /// Error kind carried over RPC
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            ManagerError::NodeIndexOutOfRange { .. } => RpcErrorKind::NodeIndexOutOfRange,
            ManagerError::TooManyNodes { .. } => RpcErrorKind::TooManyNodes,
            ManagerError::AlreadyConnected(..) => RpcErrorKind::AlreadyConnected,
            ManagerError::NodeNotFound(_) => RpcErrorKind::NodeNotFound,
            ManagerError::ConnectedToItself(_) => RpcErrorKind::ConnectedToItself,
            ManagerError::RouteBuild { .. } => RpcErrorKind::RouteBuild,
            ManagerError::Graph(GraphError::NoRoute { .. }) => RpcErrorKind::NoRoute,
            ManagerError::Node(NodeError::ControlTimeout) => RpcErrorKind::ControlTimeout,
            _ => RpcErrorKind::Internal,
        }
    }

    /// Wire form of this error
    pub fn to_failure(&self) -> RpcFailure {
        RpcFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Result type for manager operations
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Control RPC errors seen by a client
#[derive(Error, Debug)]
pub enum RpcError {
    /// No response within the control timeout
    #[error("control request {0} timed out")]
    ControlTimeout(u64),

    /// Server answered with an error
    #[error("{:?}: {}", .0.kind, .0.message)]
    Remote(RpcFailure),

    /// Server answered with a reply of the wrong shape
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),

    /// Client was closed
    #[error("rpc client closed")]
    Closed,

    /// Wire error
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Remote error kind, if the server answered with one
    pub fn remote_kind(&self) -> Option<RpcErrorKind> {
        match self {
            RpcError::Remote(failure) => Some(failure.kind),
            _ => None,
        }
    }
}
