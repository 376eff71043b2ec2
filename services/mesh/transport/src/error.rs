//! Transport error types.

use mesh_wire::{MessageId, PeerId, WireError};
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport was closed
    #[error("transport closed")]
    Closed,

    /// This transport does not reach the requested peer
    #[error("not connected to peer {0}")]
    NotConnected(PeerId),

    /// Datagram exceeds the link MTU
    #[error("message of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Encoded length
        len: usize,
        /// Link maximum
        max: usize,
    },

    /// No ack arrived in time
    #[error("timed out waiting for ack of {0}")]
    TransportTimeout(MessageId),

    /// Encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Settings the background loops cannot run with
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
