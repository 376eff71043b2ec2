//! Transports for mesh: the physical link contract, in-memory and UDP links,
//! and the reliable transport layered on top.
//!
//! A [`ReliableTransport`] wraps exactly one [`PhysicalTransport`] and adds
//! message ids, acks, retransmission on timeout and receive-side dedup.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ledger;
pub mod memory;
pub mod physical;
pub mod reliable;
pub mod udp;

pub use error::{Result, TransportError};
pub use ledger::{SeenSet, SentLedger, SentState};
pub use memory::{LossControl, MemoryTransport, DEFAULT_MEMORY_MTU};
pub use physical::PhysicalTransport;
pub use reliable::{Delivered, ReliableTransport, TransportConfig};
pub use udp::{UdpTransport, DEFAULT_UDP_MTU};
