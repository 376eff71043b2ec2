//! Contract every unreliable point-to-point link satisfies.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::PeerId;
use tokio::sync::mpsc;

/// Unreliable datagram link to exactly one peer.
///
/// Datagrams may be lost; they are never split or merged. Anything received
/// is pushed, one datagram per item, into the channel installed with
/// [`PhysicalTransport::set_receive_channel`].
#[async_trait]
pub trait PhysicalTransport: Send + Sync {
    /// Whether `peer` is reachable over this link
    fn connected_to_peer(&self, peer: &PeerId) -> bool;

    /// Largest datagram that may be sent to `peer`
    fn max_message_size_to_peer(&self, peer: &PeerId) -> usize;

    /// Send one datagram; delivery is not guaranteed
    async fn send_message(&self, peer: &PeerId, bytes: Bytes) -> Result<()>;

    /// Install the channel inbound datagrams are written to
    fn set_receive_channel(&self, tx: mpsc::Sender<Bytes>);

    /// Stop sending and receiving
    async fn close(&self) -> Result<()>;
}
