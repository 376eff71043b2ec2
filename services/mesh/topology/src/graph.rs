//! Direct-link graph and shortest-path cache.

use mesh_wire::PeerId;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Weight of a link created by the manager when none is given
pub const DEFAULT_LINK_WEIGHT: i64 = 1;

/// A directed edge between two peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectRoute {
    /// Tail of the edge
    pub from: PeerId,
    /// Head of the edge
    pub to: PeerId,
    /// Positive cost
    pub weight: i64,
}

/// Graph errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Edge from a peer to itself
    #[error("self-loop on {0}")]
    SelfLoop(PeerId),

    /// Weight is zero or negative
    #[error("non-positive weight {0}")]
    NonPositiveWeight(i64),

    /// Destination unreachable from source
    #[error("no route from {from} to {to}")]
    NoRoute {
        /// Source
        from: PeerId,
        /// Destination
        to: PeerId,
    },
}

/// Shortest-path tree rooted at one source
#[derive(Debug, Clone, Default)]
pub(crate) struct ShortestPaths {
    pub(crate) distance: HashMap<PeerId, i64>,
    pub(crate) previous: HashMap<PeerId, PeerId>,
}

/// Graph of every known direct link
#[derive(Debug, Default)]
pub struct RouteGraph {
    /// Outgoing edges per peer, in insertion order
    adjacency: HashMap<PeerId, Vec<DirectRoute>>,
    /// Ordered pairs already present
    edge_set: HashSet<(PeerId, PeerId)>,
    /// Peers in first-seen order
    peers: Vec<PeerId>,
    /// Per-source search results
    cache: HashMap<PeerId, ShortestPaths>,
}

// Include implementation
mod search;
