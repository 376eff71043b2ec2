//! Per-node route table keyed by locally scoped route ids

use crate::error::RouteError;
use crate::route::{Expiry, Hop, Route};
use crate::router::{DropReason, Router, RouterStats, RoutingDecision};
use dashmap::DashMap;
use mesh_wire::{PeerId, RouteId, RouteRule};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default upper bound on a route's lifetime
pub const DEFAULT_MAX_ROUTE_LIFETIME: Duration = Duration::from_secs(600);

/// In-memory route table
#[derive(Debug)]
pub struct RoutingTable {
    /// Local peer
    local_peer: PeerId,
    /// Route id -> rule
    routes: DashMap<RouteId, Route>,
    /// Horizon expiries are clamped to
    max_lifetime: Duration,
    decisions_counter: AtomicU64,
    forwards_counter: AtomicU64,
    local_counter: AtomicU64,
    drops_counter: AtomicU64,
}

impl RoutingTable {
    /// Create an empty table
    pub fn new(local_peer: PeerId, max_lifetime: Duration) -> Self {
        Self {
            local_peer,
            routes: DashMap::new(),
            max_lifetime,
            decisions_counter: AtomicU64::new(0),
            forwards_counter: AtomicU64::new(0),
            local_counter: AtomicU64::new(0),
            drops_counter: AtomicU64::new(0),
        }
    }

    /// Install an origin rule sending to `next_peer` under the same id
    pub fn add_route(&self, route_id: RouteId, next_peer: PeerId) -> Result<(), RouteError> {
        self.add_route_rewriting(route_id, next_peer, route_id)
    }

    /// Install an origin rule that rewrites to `rewrite_route_id`
    pub fn add_route_rewriting(
        &self,
        route_id: RouteId,
        next_peer: PeerId,
        rewrite_route_id: RouteId,
    ) -> Result<(), RouteError> {
        use dashmap::mapref::entry::Entry;

        let route = Route::outbound(next_peer, rewrite_route_id);
        validate(&route_id, &route)?;
        match self.routes.entry(route_id) {
            Entry::Occupied(_) => Err(RouteError::RouteExists(route_id)),
            Entry::Vacant(slot) => {
                slot.insert(route);
                debug!(route_id = %route_id, next = %next_peer.short(), "origin route added");
                Ok(())
            }
        }
    }

    /// Install or overwrite a rule; returns true if it replaced one
    pub fn install(&self, route_id: RouteId, route: Route) -> Result<bool, RouteError> {
        validate(&route_id, &route)?;
        let replaced = self.routes.insert(route_id, route).is_some();
        info!(
            route_id = %route_id,
            forward = %route.forward.peer.short(),
            backward = %route.backward.peer.short(),
            replaced,
            "route installed"
        );
        Ok(replaced)
    }

    /// Install only if the id is free
    pub fn install_new(&self, route_id: RouteId, route: Route) -> Result<(), RouteError> {
        use dashmap::mapref::entry::Entry;

        validate(&route_id, &route)?;
        match self.routes.entry(route_id) {
            Entry::Occupied(_) => Err(RouteError::RouteExists(route_id)),
            Entry::Vacant(slot) => {
                slot.insert(route);
                Ok(())
            }
        }
    }

    /// Extend an existing rule to `expiry`; rules that never expire stay so
    pub fn refresh(&self, route_id: &RouteId, expiry: Expiry) -> Result<(), RouteError> {
        match self.routes.get_mut(route_id) {
            Some(mut route) => {
                if route.expiry != Expiry::Never {
                    route.expiry = expiry;
                }
                debug!(route_id = %route_id, ?expiry, "route refreshed");
                Ok(())
            }
            None => Err(RouteError::RouteNotFound(*route_id)),
        }
    }

    /// Remove a rule
    pub fn remove(&self, route_id: &RouteId) -> Option<Route> {
        let removed = self.routes.remove(route_id).map(|(_, r)| r);
        if removed.is_some() {
            debug!(route_id = %route_id, "route removed");
        }
        removed
    }

    /// Copy of a rule
    pub fn get(&self, route_id: &RouteId) -> Option<Route> {
        self.routes.get(route_id).map(|r| *r)
    }

    /// Whether the id names a rule
    pub fn contains(&self, route_id: &RouteId) -> bool {
        self.routes.contains_key(route_id)
    }

    /// Expiry `hint` from now, clamped to the table's horizon
    pub fn clamp_expiry(&self, hint: Option<Duration>, now: Instant) -> Expiry {
        let lifetime = hint.map_or(self.max_lifetime, |h| h.min(self.max_lifetime));
        Expiry::At(now + lifetime)
    }

    /// Drop rules expired at `now`
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.routes.len();
        self.routes.retain(|id, route| {
            let keep = !route.expiry.is_expired(now);
            if !keep {
                debug!(route_id = %id, "route expired");
            }
            keep
        });
        before - self.routes.len()
    }

    /// Snapshot sorted by route id
    pub fn list(&self, now: Instant) -> Vec<RouteRule> {
        let mut rules: Vec<_> = self
            .routes
            .iter()
            .map(|e| e.value().to_rule(*e.key(), now))
            .collect();
        rules.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        rules
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decide at an explicit time
    pub fn decide_at(&self, route_id: &RouteId, send_back: bool, now: Instant) -> RoutingDecision {
        self.decisions_counter.fetch_add(1, Ordering::Relaxed);

        let decision = match self.routes.get(route_id) {
            None => RoutingDecision::Drop(DropReason::RouteNotFound),
            Some(route) if route.expiry.is_expired(now) => {
                RoutingDecision::Drop(DropReason::RouteExpired)
            }
            Some(route) => {
                let hop: Hop = route.side(send_back);
                if hop.is_terminal() {
                    RoutingDecision::Local
                } else {
                    RoutingDecision::Forward(hop)
                }
            }
        };

        match decision {
            RoutingDecision::Forward(_) => self.forwards_counter.fetch_add(1, Ordering::Relaxed),
            RoutingDecision::Local => self.local_counter.fetch_add(1, Ordering::Relaxed),
            RoutingDecision::Drop(_) => self.drops_counter.fetch_add(1, Ordering::Relaxed),
        };
        decision
    }
}

fn validate(route_id: &RouteId, route: &Route) -> Result<(), RouteError> {
    if route_id.is_nil() {
        return Err(RouteError::InvalidRoute("nil route id".to_string()));
    }
    if !route.is_valid() {
        return Err(RouteError::InvalidRoute(format!(
            "route {} has no forward or backward peer",
            route_id
        )));
    }
    Ok(())
}

impl Router for RoutingTable {
    fn decide(&self, route_id: &RouteId, send_back: bool) -> RoutingDecision {
        self.decide_at(route_id, send_back, Instant::now())
    }

    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn stats(&self) -> RouterStats {
        RouterStats {
            total_routes: self.routes.len(),
            decisions_made: self.decisions_counter.load(Ordering::Relaxed),
            forwarded: self.forwards_counter.load(Ordering::Relaxed),
            local: self.local_counter.load(Ordering::Relaxed),
            dropped: self.drops_counter.load(Ordering::Relaxed),
        }
    }
}
