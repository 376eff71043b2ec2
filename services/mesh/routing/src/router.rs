//! Router trait and forwarding decisions

use crate::route::Hop;
use mesh_wire::{PeerId, RouteId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of looking up a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Rewrite and send to the next peer
    Forward(Hop),
    /// The message terminates at this node
    Local,
    /// Drop the message
    Drop(DropReason),
}

/// Reason for dropping a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// No entry for the route id
    RouteNotFound,
    /// Entry exists but has expired
    RouteExpired,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::RouteNotFound => write!(f, "route not found"),
            DropReason::RouteExpired => write!(f, "route expired"),
        }
    }
}

/// Router trait for making forwarding decisions
pub trait Router: Send + Sync {
    /// Decide where a message carrying `route_id` goes next
    fn decide(&self, route_id: &RouteId, send_back: bool) -> RoutingDecision;

    /// Peer owning this router
    fn local_peer(&self) -> PeerId;

    /// Counters so far
    fn stats(&self) -> RouterStats;
}

/// Router statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Entries in the table
    pub total_routes: usize,
    /// Decisions made
    pub decisions_made: u64,
    /// Messages forwarded
    pub forwarded: u64,
    /// Messages terminated locally
    pub local: u64,
    /// Messages dropped
    pub dropped: u64,
}
