//! Control RPC surface shared by the manager and its clients.

use crate::codec::Serializer;
use crate::error::WireError;
use crate::ids::{PeerId, RouteId, TransportId};
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of [`RpcRequest`]
pub const RPC_REQUEST_PREFIX: u8 = 0x10;
/// Prefix of [`RpcResponse`]
pub const RPC_RESPONSE_PREFIX: u8 = 0x11;

/// State of one transport end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportStatus {
    /// Open and carrying traffic
    Connected,
    /// Closed locally or by the peer
    Closed,
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Connected => write!(f, "connected"),
            TransportStatus::Closed => write!(f, "closed"),
        }
    }
}

/// One end of a point-to-point transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportInfo {
    /// Id of this end
    pub transport_id: TransportId,
    /// Current status
    pub status: TransportStatus,
    /// Owning node
    pub from_peer: PeerId,
    /// Remote node
    pub to_peer: PeerId,
}

/// Snapshot of one route table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Table key
    pub route_id: RouteId,
    /// Forward next peer, zero when terminal
    pub forward_to_peer_id: PeerId,
    /// Id written on forward traffic
    pub forward_rewrite_route_id: RouteId,
    /// Backward next peer, zero when terminal
    pub backward_to_peer_id: PeerId,
    /// Id written on backward traffic
    pub backward_rewrite_route_id: RouteId,
    /// Remaining lifetime, `None` for routes that never expire
    pub expires_in_ms: Option<u64>,
}

/// Procedures a manager exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCall {
    /// Create one node
    AddNode,
    /// Create `n` nodes
    AddNodes {
        /// How many
        n: u32,
    },
    /// Link nodes `i` and `j`
    ConnectNodes {
        /// First node index
        i: u32,
        /// Second node index
        j: u32,
    },
    /// Transports of one node
    ListTransports {
        /// Node index
        node: u32,
    },
    /// Transports of every node
    ListAllTransports,
    /// Install a route along explicit hops
    BuildRoute {
        /// Node indices, origin first
        nodes: Vec<u32>,
    },
    /// Compute and install the shortest route
    FindRoute {
        /// Origin index
        i: u32,
        /// Destination index
        j: u32,
    },
    /// Route table of one node
    ListRoutes {
        /// Node index
        node: u32,
    },
}

impl RpcCall {
    /// Procedure name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RpcCall::AddNode => "AddNode",
            RpcCall::AddNodes { .. } => "AddNodes",
            RpcCall::ConnectNodes { .. } => "ConnectNodes",
            RpcCall::ListTransports { .. } => "ListTransports",
            RpcCall::ListAllTransports => "ListAllTransports",
            RpcCall::BuildRoute { .. } => "BuildRoute",
            RpcCall::FindRoute { .. } => "FindRoute",
            RpcCall::ListRoutes { .. } => "ListRoutes",
        }
    }
}

/// Successful results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    /// From `AddNode`
    PeerId(PeerId),
    /// From `AddNodes`
    PeerIds(Vec<PeerId>),
    /// From `ConnectNodes`
    TransportPair([TransportId; 2]),
    /// From `ListTransports` and `ListAllTransports`
    Transports(Vec<TransportInfo>),
    /// From `BuildRoute` and `FindRoute`
    RouteIds(Vec<RouteId>),
    /// From `ListRoutes`
    Routes(Vec<RouteRule>),
}

/// Failure categories carried back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// Index outside the node list
    NodeIndexOutOfRange,
    /// `AddNodes` above the cap
    TooManyNodes,
    /// Transport already links the pair
    AlreadyConnected,
    /// Unknown peer
    NodeNotFound,
    /// Both ends are the same node
    ConnectedToItself,
    /// No path in the graph
    NoRoute,
    /// A hop refused or timed out
    RouteBuild,
    /// Node did not answer in time
    ControlTimeout,
    /// Anything else
    Internal,
}

/// Error half of an [`RpcResponse`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    /// Category
    pub kind: RpcErrorKind,
    /// Display text of the original error
    pub message: String,
}

/// A sequenced call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlates the response
    pub sequence: u64,
    /// Procedure and arguments
    pub call: RpcCall,
}

/// Answer to an [`RpcRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Copied from the request
    pub sequence: u64,
    /// Result of the call
    pub outcome: Result<RpcReply, RpcFailure>,
}

/// Either direction of the control protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    /// Caller to manager
    Request(RpcRequest),
    /// Manager to caller
    Response(RpcResponse),
}

impl From<RpcRequest> for RpcMessage {
    fn from(msg: RpcRequest) -> Self {
        RpcMessage::Request(msg)
    }
}

impl From<RpcResponse> for RpcMessage {
    fn from(msg: RpcResponse) -> Self {
        RpcMessage::Response(msg)
    }
}

/// Serializer for the control protocol
pub static RPC: Lazy<Serializer<RpcMessage>> = Lazy::new(|| {
    Serializer::new()
        .with::<RpcRequest>(RPC_REQUEST_PREFIX)
        .with::<RpcResponse>(RPC_RESPONSE_PREFIX)
});

impl RpcMessage {
    /// Encode with the variant's prefix
    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            RpcMessage::Request(m) => RPC.encode(m),
            RpcMessage::Response(m) => RPC.encode(m),
        }
    }

    /// Decode either direction
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        RPC.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_response() {
        let req = RpcMessage::Request(RpcRequest {
            sequence: 42,
            call: RpcCall::BuildRoute {
                nodes: vec![0, 1, 2],
            },
        });
        let bytes = req.encode().unwrap();
        assert_eq!(bytes[0], RPC_REQUEST_PREFIX);
        assert_eq!(RpcMessage::decode(&bytes).unwrap(), req);

        let resp = RpcMessage::Response(RpcResponse {
            sequence: 42,
            outcome: Err(RpcFailure {
                kind: RpcErrorKind::NodeIndexOutOfRange,
                message: "node index 9 out of range (3 nodes)".to_string(),
            }),
        });
        let bytes = resp.encode().unwrap();
        assert_eq!(RpcMessage::decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_route_rule_listing() {
        let rule = RouteRule {
            route_id: RouteId::new(),
            forward_to_peer_id: PeerId::random(),
            forward_rewrite_route_id: RouteId::new(),
            backward_to_peer_id: PeerId::ZERO,
            backward_rewrite_route_id: RouteId::NIL,
            expires_in_ms: None,
        };
        let resp = RpcMessage::Response(RpcResponse {
            sequence: 1,
            outcome: Ok(RpcReply::Routes(vec![rule])),
        });
        let decoded = RpcMessage::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded, resp);
    }
}
