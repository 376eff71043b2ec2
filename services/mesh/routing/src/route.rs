//! A single forwarding rule.

use mesh_wire::{PeerId, RouteId, RouteRule};
use std::time::{Duration, Instant};

/// When a route stops being valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Sentinel: never expires
    Never,
    /// Expires at this instant
    At(Instant),
}

impl Expiry {
    /// Whether the route is past its expiry at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(at) => *at <= now,
        }
    }

    /// Time left at `now`; `None` for [`Expiry::Never`]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Expiry::Never => None,
            Expiry::At(at) => Some(at.saturating_duration_since(now)),
        }
    }
}

/// One side of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    /// Next peer, zero to terminate here
    pub peer: PeerId,
    /// Id written into the message for the next peer
    pub rewrite_route_id: RouteId,
}

impl Hop {
    /// A side that terminates at this node
    pub const TERMINAL: Hop = Hop {
        peer: PeerId::ZERO,
        rewrite_route_id: RouteId::NIL,
    };

    /// Whether messages following this side stop here
    pub fn is_terminal(&self) -> bool {
        self.peer.is_zero()
    }
}

/// Bidirectional forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Followed when `send_back` is false
    pub forward: Hop,
    /// Followed when `send_back` is true
    pub backward: Hop,
    /// Expiry time
    pub expiry: Expiry,
}

impl Route {
    /// Route with both sides given
    pub fn new(forward: Hop, backward: Hop, expiry: Expiry) -> Self {
        Self {
            forward,
            backward,
            expiry,
        }
    }

    /// Origin-side route: forward only, no incoming side
    pub fn outbound(next_peer: PeerId, rewrite_route_id: RouteId) -> Self {
        Self::new(
            Hop {
                peer: next_peer,
                rewrite_route_id,
            },
            Hop::TERMINAL,
            Expiry::Never,
        )
    }

    /// A route with both sides terminal never moves a message
    pub fn is_valid(&self) -> bool {
        !(self.forward.is_terminal() && self.backward.is_terminal())
    }

    /// Side selected by a message's `send_back` flag
    pub fn side(&self, send_back: bool) -> Hop {
        if send_back {
            self.backward
        } else {
            self.forward
        }
    }

    /// Listing form
    pub fn to_rule(&self, route_id: RouteId, now: Instant) -> RouteRule {
        RouteRule {
            route_id,
            forward_to_peer_id: self.forward.peer,
            forward_rewrite_route_id: self.forward.rewrite_route_id,
            backward_to_peer_id: self.backward.peer,
            backward_rewrite_route_id: self.backward.rewrite_route_id,
            expires_in_ms: self
                .expiry
                .remaining(now)
                .map(|d| d.as_millis().min(u64::MAX as u128) as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        let none = Route::new(Hop::TERMINAL, Hop::TERMINAL, Expiry::Never);
        assert!(!none.is_valid());
        assert!(Route::outbound(PeerId::random(), RouteId::new()).is_valid());
    }

    #[test]
    fn test_side_selection() {
        let fwd = Hop {
            peer: PeerId::random(),
            rewrite_route_id: RouteId::new(),
        };
        let back = Hop {
            peer: PeerId::random(),
            rewrite_route_id: RouteId::new(),
        };
        let r = Route::new(fwd, back, Expiry::Never);
        assert_eq!(r.side(false), fwd);
        assert_eq!(r.side(true), back);
    }

    #[test]
    fn test_expiry() {
        let now = Instant::now();
        assert!(!Expiry::Never.is_expired(now));
        assert!(Expiry::At(now).is_expired(now));
        let later = Expiry::At(now + Duration::from_secs(3));
        assert!(!later.is_expired(now));
        assert_eq!(later.remaining(now), Some(Duration::from_secs(3)));

        let rule = Route::new(Hop::TERMINAL, Hop::TERMINAL, later).to_rule(RouteId::new(), now);
        assert_eq!(rule.expires_in_ms, Some(3_000));
    }
}
