//! Delivery interface for applications built on a node.

use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::{PeerId, RouteId};

/// Where a reply to a delivered message should go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyTo {
    /// Route id the message arrived on
    pub route_id: RouteId,
    /// Neighbor that handed the message over
    pub from_peer_id: PeerId,
}

/// A fully reassembled message delivered by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessage {
    /// Pass to `send_message_back_thru_route` to answer
    pub reply_to: ReplyTo,
    /// Payload
    pub contents: Bytes,
}

/// Receives messages arriving from one neighbor.
///
/// Each call runs on its own task, so a slow consumer does not stall the
/// node.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Handle one message
    async fn consume(&self, message: MeshMessage);
}
