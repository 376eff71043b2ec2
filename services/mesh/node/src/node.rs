//! The mesh node: route table, forwarding engine and route control protocol.
//!
//! A node owns one reliable transport per neighbor. Everything those
//! transports deliver lands on a single incoming channel drained by the
//! node's incoming task, which looks the message's route id up and either
//! rewrites and forwards it or handles it locally. User payloads are
//! reassembled at every hop and re-fragmented for the next link.
//!
//! Three tasks run per node: incoming messages, control commands and the
//! expiry sweep. All exit when the node is closed.

use crate::config::NodeConfig;
use crate::consumer::{Consumer, MeshMessage, ReplyTo};
use crate::control::{AddRouteControlMessage, ControlRequest, NodeCommand, NodeControl};
use crate::error::{NodeError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use mesh_routing::{Expiry, Hop, Route, Router, RouterStats, RoutingDecision, RoutingTable};
use mesh_transport::{Delivered, PhysicalTransport, ReliableTransport};
use mesh_wire::{
    fragment, max_content_length, DeleteRouteMessage, MessageBase, MessageId, PeerId,
    Reassembler, RefreshRouteMessage, RouteId, RouteRule, RoutedMessage, SetRouteMessage,
    SetRouteReply, TransportId, TransportInfo, UserMessage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct NodeInner {
    peer: PeerId,
    config: NodeConfig,
    routes: RoutingTable,
    transports: RwLock<HashMap<PeerId, ReliableTransport>>,
    reassembler: Mutex<Reassembler>,
    consumers: RwLock<HashMap<PeerId, Arc<dyn Consumer>>>,
    receive_tx: RwLock<Option<mpsc::Sender<MeshMessage>>>,
    confirms: DashMap<RouteId, oneshot::Sender<()>>,
    incoming_tx: mpsc::Sender<Delivered>,
    closed: AtomicBool,
    closing: watch::Sender<bool>,
}

/// Handle to a running node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
    control: NodeControl,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Node {
    /// Start a node with a fresh random peer id
    pub fn spawn(config: NodeConfig) -> Self {
        Self::spawn_with_peer(PeerId::random(), config)
    }

    /// Start a node with a given peer id
    pub fn spawn_with_peer(peer: PeerId, config: NodeConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.channel_capacity);
        let (control_tx, control_rx) = mpsc::channel(config.channel_capacity);
        let (closing, _) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            peer,
            routes: RoutingTable::new(peer, config.max_route_lifetime),
            transports: RwLock::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new()),
            consumers: RwLock::new(HashMap::new()),
            receive_tx: RwLock::new(None),
            confirms: DashMap::new(),
            incoming_tx,
            closed: AtomicBool::new(false),
            closing,
            config,
        });

        let control = NodeControl::new(peer, control_tx, inner.config.control_timeout);
        let node = Self {
            inner,
            control,
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        let tasks = vec![
            tokio::spawn(incoming_loop(node.clone(), incoming_rx)),
            tokio::spawn(control_loop(node.clone(), control_rx)),
            tokio::spawn(sweep_loop(node.clone())),
        ];
        if let Ok(mut slot) = node.tasks.lock() {
            slot.extend(tasks);
        }

        info!(peer = %peer, "Node started");
        node
    }

    /// This node's peer id
    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Handle to the control channel
    pub fn control(&self) -> NodeControl {
        self.control.clone()
    }

    /// Whether the node has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // ---- transports ----

    /// Wrap `physical` in a reliable transport to `remote_peer`
    pub fn add_transport(
        &self,
        transport_id: TransportId,
        remote_peer: PeerId,
        physical: Arc<dyn PhysicalTransport>,
    ) -> Result<TransportId> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }
        if remote_peer == self.inner.peer {
            return Err(NodeError::InvalidMessage(
                "transport to self".to_string(),
            ));
        }

        let mut transports = self
            .inner
            .transports
            .write()
            .map_err(|_| NodeError::LockPoisoned("transports"))?;
        if transports.contains_key(&remote_peer) {
            return Err(NodeError::TransportExists(remote_peer));
        }

        let transport = ReliableTransport::spawn(
            transport_id,
            self.inner.peer,
            remote_peer,
            physical,
            self.inner.config.transport.clone(),
            self.inner.incoming_tx.clone(),
        );
        transports.insert(remote_peer, transport);
        info!(
            peer = %self.inner.peer.short(),
            remote = %remote_peer.short(),
            transport_id = %transport_id,
            "Transport added"
        );
        Ok(transport_id)
    }

    /// Close and detach the transport to `remote_peer`
    pub async fn remove_transport(&self, remote_peer: &PeerId) -> Result<()> {
        let transport = self
            .inner
            .transports
            .write()
            .map_err(|_| NodeError::LockPoisoned("transports"))?
            .remove(remote_peer);
        match transport {
            Some(t) => Ok(t.close().await?),
            None => Err(NodeError::NoTransport(*remote_peer)),
        }
    }

    fn transport_to(&self, peer: &PeerId) -> Result<ReliableTransport> {
        self.inner
            .transports
            .read()
            .map_err(|_| NodeError::LockPoisoned("transports"))?
            .get(peer)
            .cloned()
            .ok_or(NodeError::NoTransport(*peer))
    }

    fn peer_of_transport(&self, id: &TransportId) -> Result<PeerId> {
        self.inner
            .transports
            .read()
            .map_err(|_| NodeError::LockPoisoned("transports"))?
            .values()
            .find(|t| t.id() == *id)
            .map(|t| t.remote_peer())
            .ok_or(NodeError::UnknownTransport(*id))
    }

    /// Whether a transport to `peer` exists
    pub fn has_transport_to(&self, peer: &PeerId) -> bool {
        self.transport_to(peer).is_ok()
    }

    /// Transports sorted by remote peer
    pub fn list_transports(&self) -> Vec<TransportInfo> {
        let mut infos: Vec<_> = match self.inner.transports.read() {
            Ok(t) => t.values().map(|t| t.info()).collect(),
            Err(_) => Vec::new(),
        };
        infos.sort_by(|a, b| a.to_peer.cmp(&b.to_peer));
        infos
    }

    // ---- consumers ----

    /// Deliver messages arriving from `peer` to `consumer`.
    ///
    /// Registering under [`PeerId::ZERO`] catches messages from any neighbor
    /// without a consumer of its own.
    pub fn register_consumer(&self, peer: PeerId, consumer: Arc<dyn Consumer>) {
        self.inner
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, consumer);
    }

    /// Stop delivering to the consumer for `peer`
    pub fn unregister_consumer(&self, peer: &PeerId) {
        self.inner
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    /// Channel for messages no consumer claims
    pub fn set_receive_channel(&self, tx: mpsc::Sender<MeshMessage>) {
        *self
            .inner
            .receive_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    // ---- route table ----

    /// Install an origin route sending to `next_peer`
    pub fn add_route(&self, route_id: RouteId, next_peer: PeerId) -> Result<()> {
        self.inner.routes.add_route(route_id, next_peer)?;
        info!(peer = %self.inner.peer.short(), route_id = %route_id, next = %next_peer.short(), "Route added");
        Ok(())
    }

    /// Install one hop of a manager-built route
    pub fn apply_add_route(&self, msg: AddRouteControlMessage) -> Result<()> {
        let incoming = match (msg.incoming_transport, msg.incoming_route_id) {
            (Some(t), Some(r)) => Some((self.peer_of_transport(&t)?, r)),
            (None, None) => None,
            _ => {
                return Err(NodeError::InvalidMessage(
                    "incoming transport and route id must be given together".to_string(),
                ))
            }
        };
        let outgoing = match (msg.outgoing_transport, msg.outgoing_route_id) {
            (Some(t), Some(r)) => Some((self.peer_of_transport(&t)?, r)),
            (None, None) => None,
            _ => {
                return Err(NodeError::InvalidMessage(
                    "outgoing transport and route id must be given together".to_string(),
                ))
            }
        };

        let routes = &self.inner.routes;
        match (incoming, outgoing) {
            (None, Some((next, out_id))) => self.add_route(out_id, next),
            (Some((prev, in_id)), None) => {
                let route = Route::new(
                    Hop::TERMINAL,
                    Hop {
                        peer: prev,
                        rewrite_route_id: in_id,
                    },
                    Expiry::Never,
                );
                routes.install_new(in_id, route)?;
                info!(peer = %self.inner.peer.short(), route_id = %in_id, "Terminal route added");
                Ok(())
            }
            (Some((prev, in_id)), Some((next, out_id))) => {
                let route = Route::new(
                    Hop {
                        peer: next,
                        rewrite_route_id: out_id,
                    },
                    Hop {
                        peer: prev,
                        rewrite_route_id: in_id,
                    },
                    Expiry::Never,
                );
                routes.install_new(in_id, route)?;
                if let Err(e) = routes.install_new(out_id, route) {
                    routes.remove(&in_id);
                    return Err(e.into());
                }
                info!(
                    peer = %self.inner.peer.short(),
                    incoming = %in_id,
                    outgoing = %out_id,
                    "Relay route added"
                );
                Ok(())
            }
            (None, None) => Err(NodeError::InvalidMessage(
                "route hop with neither side".to_string(),
            )),
        }
    }

    /// Copy of one rule
    pub fn route(&self, route_id: &RouteId) -> Option<Route> {
        self.inner.routes.get(route_id)
    }

    /// Route table sorted by id
    pub fn list_routes(&self) -> Vec<RouteRule> {
        self.inner.routes.list(Instant::now())
    }

    /// Forwarding counters
    pub fn stats(&self) -> RouterStats {
        self.inner.routes.stats()
    }

    /// Partial user messages buffered
    pub fn pending_reassembly(&self) -> usize {
        self.inner
            .reassembler
            .lock()
            .map(|r| r.pending())
            .unwrap_or(0)
    }

    // ---- user messages ----

    /// Send `contents` along the forward side of `route_id`
    pub async fn send_message_thru_route(&self, route_id: RouteId, contents: Bytes) -> Result<()> {
        let hop = self.outbound_hop(&route_id, false)?;
        self.send_user(hop, false, MessageId::new(), contents).await
    }

    /// Answer a delivered message along the route it came in on
    pub async fn send_message_back_thru_route(
        &self,
        reply_to: ReplyTo,
        contents: Bytes,
    ) -> Result<()> {
        let hop = self.outbound_hop(&reply_to.route_id, true)?;
        self.send_user(hop, true, MessageId::new(), contents).await
    }

    fn outbound_hop(&self, route_id: &RouteId, send_back: bool) -> Result<Hop> {
        if self.is_closed() {
            return Err(NodeError::Closed);
        }
        match self.inner.routes.decide(route_id, send_back) {
            RoutingDecision::Forward(hop) => Ok(hop),
            RoutingDecision::Local | RoutingDecision::Drop(_) => Err(NodeError::NoRoute(*route_id)),
        }
    }

    async fn send_user(
        &self,
        hop: Hop,
        send_back: bool,
        message_id: MessageId,
        contents: Bytes,
    ) -> Result<()> {
        let transport = self.transport_to(&hop.peer)?;
        let max_len = max_content_length(transport.max_message_size())?;
        let base = MessageBase::new(hop.rewrite_route_id, send_back, self.inner.peer);

        let fragments = fragment(base, message_id, &contents, max_len)?;
        debug!(
            peer = %self.inner.peer.short(),
            to = %hop.peer.short(),
            message_id = %message_id,
            fragments = fragments.len(),
            len = contents.len(),
            "sending user message"
        );
        for frag in fragments {
            let bytes = RoutedMessage::User(frag).encode()?;
            transport.send(bytes).await?;
        }
        Ok(())
    }

    async fn send_routed(&self, to: PeerId, msg: RoutedMessage) -> Result<()> {
        let transport = self.transport_to(&to)?;
        transport.send(msg.encode()?).await?;
        Ok(())
    }

    // ---- route control ----

    fn register_confirm(&self, confirm_route_id: RouteId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.confirms.insert(confirm_route_id, tx);
        rx
    }

    async fn await_confirm(&self, confirm_route_id: RouteId, rx: oneshot::Receiver<()>) -> Result<()> {
        let result = tokio::time::timeout(self.inner.config.control_timeout, rx).await;
        self.inner.confirms.remove(&confirm_route_id);
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(NodeError::Closed),
            Err(_) => Err(NodeError::ControlTimeout),
        }
    }

    /// Install a route on neighbor `peer` and wait for its confirm
    pub async fn set_route_on_peer(
        &self,
        peer: PeerId,
        set_route_id: RouteId,
        forward: Hop,
        backward: Hop,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        let confirm_route_id = RouteId::new();
        let msg = SetRouteMessage {
            base: MessageBase::new(RouteId::NIL, false, self.inner.peer),
            set_route_id,
            confirm_route_id,
            forward_to_peer_id: forward.peer,
            forward_rewrite_route_id: forward.rewrite_route_id,
            backward_to_peer_id: backward.peer,
            backward_rewrite_route_id: backward.rewrite_route_id,
            duration_hint_ms: lifetime.map(duration_ms),
        };
        let rx = self.register_confirm(confirm_route_id);
        if let Err(e) = self.send_routed(peer, RoutedMessage::SetRoute(msg)).await {
            self.inner.confirms.remove(&confirm_route_id);
            return Err(e);
        }
        self.await_confirm(confirm_route_id, rx).await
    }

    /// Install a route on the far end of `route_id` and wait for its confirm
    pub async fn set_route_thru_route(
        &self,
        route_id: RouteId,
        set_route_id: RouteId,
        forward: Hop,
        backward: Hop,
        lifetime: Option<Duration>,
    ) -> Result<()> {
        let hop = self.outbound_hop(&route_id, false)?;
        let confirm_route_id = RouteId::new();
        let msg = SetRouteMessage {
            base: MessageBase::new(hop.rewrite_route_id, false, self.inner.peer),
            set_route_id,
            confirm_route_id,
            forward_to_peer_id: forward.peer,
            forward_rewrite_route_id: forward.rewrite_route_id,
            backward_to_peer_id: backward.peer,
            backward_rewrite_route_id: backward.rewrite_route_id,
            duration_hint_ms: lifetime.map(duration_ms),
        };
        let rx = self.register_confirm(confirm_route_id);
        if let Err(e) = self.send_routed(hop.peer, RoutedMessage::SetRoute(msg)).await {
            self.inner.confirms.remove(&confirm_route_id);
            return Err(e);
        }
        self.await_confirm(confirm_route_id, rx).await
    }

    /// Extend `route_id` at every hop and wait for the far end's confirm
    pub async fn refresh_route(&self, route_id: RouteId, lifetime: Option<Duration>) -> Result<()> {
        let hop = self.outbound_hop(&route_id, false)?;
        let expiry = self.inner.routes.clamp_expiry(lifetime, Instant::now());
        self.inner.routes.refresh(&route_id, expiry)?;

        let confirm_route_id = RouteId::new();
        let msg = RefreshRouteMessage {
            base: MessageBase::new(hop.rewrite_route_id, false, self.inner.peer),
            confirm_route_id,
            duration_hint_ms: lifetime.map(duration_ms),
        };
        let rx = self.register_confirm(confirm_route_id);
        if let Err(e) = self.send_routed(hop.peer, RoutedMessage::RefreshRoute(msg)).await {
            self.inner.confirms.remove(&confirm_route_id);
            return Err(e);
        }
        self.await_confirm(confirm_route_id, rx).await
    }

    /// Remove `route_id` here and at every hop along it
    pub async fn delete_route(&self, route_id: RouteId) -> Result<()> {
        let result = match self.inner.routes.decide(&route_id, false) {
            RoutingDecision::Forward(hop) => {
                let msg = DeleteRouteMessage {
                    base: MessageBase::new(hop.rewrite_route_id, false, self.inner.peer),
                };
                self.send_routed(hop.peer, RoutedMessage::DeleteRoute(msg)).await
            }
            RoutingDecision::Local => Ok(()),
            RoutingDecision::Drop(_) => return Err(NodeError::NoRoute(route_id)),
        };
        self.inner.routes.remove(&route_id);
        info!(peer = %self.inner.peer.short(), route_id = %route_id, "Route deleted");
        result
    }

    // ---- incoming ----

    async fn handle_incoming(&self, delivered: Delivered) {
        let msg = match RoutedMessage::decode(&delivered.contents) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %self.inner.peer.short(), from = %delivered.from_peer.short(), "dropping undecodable message: {}", e);
                return;
            }
        };

        let base = *msg.base();
        if base.send_route_id.is_nil() {
            // addressed to this neighbor directly
            self.handle_local(msg, delivered.from_peer).await;
            return;
        }

        match self.inner.routes.decide(&base.send_route_id, base.send_back) {
            RoutingDecision::Forward(hop) => self.forward(msg, hop).await,
            RoutingDecision::Local => self.handle_local(msg, delivered.from_peer).await,
            // a route being extended: its new tail sees its own id first
            RoutingDecision::Drop(_)
                if matches!(&msg, RoutedMessage::SetRoute(set) if set.set_route_id == base.send_route_id) =>
            {
                self.handle_local(msg, delivered.from_peer).await
            }
            RoutingDecision::Drop(reason) => {
                debug!(
                    peer = %self.inner.peer.short(),
                    route_id = %base.send_route_id,
                    kind = msg.kind(),
                    %reason,
                    "dropping message"
                );
            }
        }
    }

    async fn forward(&self, msg: RoutedMessage, hop: Hop) {
        let arrival = *msg.base();
        let result = match msg {
            RoutedMessage::User(user) => self.forward_user(user, hop).await,
            RoutedMessage::RefreshRoute(mut refresh) => {
                let expiry = self.inner.routes.clamp_expiry(
                    refresh.duration_hint_ms.map(Duration::from_millis),
                    Instant::now(),
                );
                self.refresh_pair(&arrival.send_route_id, &hop.rewrite_route_id, expiry);
                refresh.base.rewrite(hop.rewrite_route_id, self.inner.peer);
                self.send_routed(hop.peer, RoutedMessage::RefreshRoute(refresh))
                    .await
            }
            RoutedMessage::DeleteRoute(mut delete) => {
                delete.base.rewrite(hop.rewrite_route_id, self.inner.peer);
                let sent = self
                    .send_routed(hop.peer, RoutedMessage::DeleteRoute(delete))
                    .await;
                self.inner.routes.remove(&arrival.send_route_id);
                self.inner.routes.remove(&hop.rewrite_route_id);
                sent
            }
            mut other => {
                other.base_mut().rewrite(hop.rewrite_route_id, self.inner.peer);
                self.send_routed(hop.peer, other).await
            }
        };

        if let Err(e) = result {
            warn!(
                peer = %self.inner.peer.short(),
                route_id = %arrival.send_route_id,
                next = %hop.peer.short(),
                "forwarding failed: {}",
                e
            );
        }
    }

    fn refresh_pair(&self, arrival_id: &RouteId, rewrite_id: &RouteId, expiry: Expiry) {
        let routes = &self.inner.routes;
        let arrival = routes.get(arrival_id);
        let _ = routes.refresh(arrival_id, expiry);
        // relays hold the same rule under both link ids
        if let (Some(a), Some(b)) = (arrival, routes.get(rewrite_id)) {
            if a.forward == b.forward && a.backward == b.backward {
                let _ = routes.refresh(rewrite_id, expiry);
            }
        }
    }

    async fn forward_user(&self, user: UserMessage, hop: Hop) -> Result<()> {
        let send_back = user.base.send_back;
        let done = match self.reassemble(user)? {
            Some(done) => done,
            None => return Ok(()),
        };
        self.send_user(hop, send_back, done.message_id, done.contents)
            .await
    }

    fn reassemble(&self, user: UserMessage) -> Result<Option<mesh_wire::Reassembled>> {
        let mut reassembler = self
            .inner
            .reassembler
            .lock()
            .map_err(|_| NodeError::LockPoisoned("reassembler"))?;
        Ok(reassembler.insert(user)?)
    }

    async fn handle_local(&self, msg: RoutedMessage, neighbor: PeerId) {
        let kind = msg.kind();
        let result = match msg {
            RoutedMessage::User(user) => self.deliver_user(user).await,
            RoutedMessage::SetRoute(set) => self.install_route(set, neighbor),
            RoutedMessage::RefreshRoute(refresh) => self.refresh_terminal(refresh, neighbor),
            RoutedMessage::DeleteRoute(delete) => {
                if delete.base.send_route_id.is_nil() {
                    Err(NodeError::InvalidMessage("delete without route id".to_string()))
                } else {
                    self.inner.routes.remove(&delete.base.send_route_id);
                    Ok(())
                }
            }
            RoutedMessage::SetRouteReply(reply) => {
                match self.inner.confirms.remove(&reply.confirm_route_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(());
                    }
                    None => {
                        debug!(confirm = %reply.confirm_route_id, "confirm for unknown request");
                    }
                }
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(peer = %self.inner.peer.short(), kind, "dropping message: {}", e);
        }
    }

    async fn deliver_user(&self, user: UserMessage) -> Result<()> {
        let done = match self.reassemble(user)? {
            Some(done) => done,
            None => return Ok(()),
        };
        let message = MeshMessage {
            reply_to: ReplyTo {
                route_id: done.base.send_route_id,
                from_peer_id: done.base.from_peer_id,
            },
            contents: done.contents,
        };

        let consumer = {
            let c = self
                .inner
                .consumers
                .read()
                .map_err(|_| NodeError::LockPoisoned("consumers"))?;
            c.get(&message.reply_to.from_peer_id)
                .or_else(|| c.get(&PeerId::ZERO))
                .cloned()
        };
        if let Some(consumer) = consumer {
            tokio::spawn(async move { consumer.consume(message).await });
            return Ok(());
        }

        let tx = self
            .inner
            .receive_tx
            .read()
            .map_err(|_| NodeError::LockPoisoned("receive channel"))?
            .clone();
        match tx {
            Some(tx) => tx.send(message).await.map_err(|_| NodeError::Closed),
            None => {
                debug!(peer = %self.inner.peer.short(), "no consumer or receive channel, message dropped");
                Ok(())
            }
        }
    }

    fn install_route(&self, set: SetRouteMessage, neighbor: PeerId) -> Result<()> {
        if set.set_route_id.is_nil() {
            return Err(NodeError::InvalidMessage("set route with nil id".to_string()));
        }
        let expiry = self.inner.routes.clamp_expiry(
            set.duration_hint_ms.map(Duration::from_millis),
            Instant::now(),
        );
        let route = Route::new(
            Hop {
                peer: set.forward_to_peer_id,
                rewrite_route_id: set.forward_rewrite_route_id,
            },
            Hop {
                peer: set.backward_to_peer_id,
                rewrite_route_id: set.backward_rewrite_route_id,
            },
            expiry,
        );
        if !route.is_valid() {
            return Err(NodeError::InvalidMessage(format!(
                "route {} has neither forward nor backward peer",
                set.set_route_id
            )));
        }
        self.inner.routes.install(set.set_route_id, route)?;
        self.spawn_reply(set.base, set.confirm_route_id, neighbor);
        Ok(())
    }

    fn refresh_terminal(&self, refresh: RefreshRouteMessage, neighbor: PeerId) -> Result<()> {
        let route_id = refresh.base.send_route_id;
        if route_id.is_nil() {
            return Err(NodeError::InvalidMessage("refresh without route id".to_string()));
        }
        let expiry = self.inner.routes.clamp_expiry(
            refresh.duration_hint_ms.map(Duration::from_millis),
            Instant::now(),
        );
        self.inner.routes.refresh(&route_id, expiry)?;
        self.spawn_reply(refresh.base, refresh.confirm_route_id, neighbor);
        Ok(())
    }

    /// Reply along the route `arrival` came in on without blocking the loop
    fn spawn_reply(&self, arrival: MessageBase, confirm_route_id: RouteId, neighbor: PeerId) {
        let node = self.clone();
        tokio::spawn(async move {
            let send_back = !arrival.send_back;
            let (to, route_id) = if arrival.send_route_id.is_nil() {
                (neighbor, RouteId::NIL)
            } else {
                match node.inner.routes.decide(&arrival.send_route_id, send_back) {
                    RoutingDecision::Forward(hop) => (hop.peer, hop.rewrite_route_id),
                    _ => {
                        debug!(route_id = %arrival.send_route_id, "no way back for confirm");
                        return;
                    }
                }
            };
            let reply = SetRouteReply {
                base: MessageBase::new(route_id, send_back, node.inner.peer),
                confirm_route_id,
            };
            if let Err(e) = node.send_routed(to, RoutedMessage::SetRouteReply(reply)).await {
                warn!(peer = %node.inner.peer.short(), "confirm send failed: {}", e);
            }
        });
    }

    // ---- control ----

    async fn handle_command(&self, request: ControlRequest) {
        debug!(
            peer = %self.inner.peer.short(),
            sequence = request.sequence,
            command = request.command.name(),
            "control command"
        );
        match request.command {
            NodeCommand::AddTransport {
                transport_id,
                remote_peer,
                physical,
                response_tx,
            } => {
                let _ = response_tx.send(self.add_transport(transport_id, remote_peer, physical));
            }
            NodeCommand::AddRoute { route, response_tx } => {
                let _ = response_tx.send(self.apply_add_route(route));
            }
            NodeCommand::ListRoutes { response_tx } => {
                let _ = response_tx.send(self.list_routes());
            }
            NodeCommand::ListTransports { response_tx } => {
                let _ = response_tx.send(self.list_transports());
            }
        }
    }

    /// Close every transport and stop the node's tasks
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.closing.send(true);

        let transports: Vec<_> = self
            .inner
            .transports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, t)| t)
            .collect();
        for result in futures::future::join_all(transports.iter().map(|t| t.close())).await {
            if let Err(e) = result {
                debug!(peer = %self.inner.peer.short(), "transport close failed: {}", e);
            }
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(peer = %self.inner.peer, "Node closed");
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

async fn incoming_loop(node: Node, mut incoming: mpsc::Receiver<Delivered>) {
    let mut closing = node.inner.closing.subscribe();
    loop {
        tokio::select! {
            _ = closing.changed() => break,
            delivered = incoming.recv() => match delivered {
                Some(d) => node.handle_incoming(d).await,
                None => break,
            },
        }
    }
    debug!(peer = %node.inner.peer.short(), "incoming loop exited");
}

async fn control_loop(node: Node, mut requests: mpsc::Receiver<ControlRequest>) {
    let mut closing = node.inner.closing.subscribe();
    loop {
        tokio::select! {
            _ = closing.changed() => break,
            request = requests.recv() => match request {
                Some(r) => node.handle_command(r).await,
                None => break,
            },
        }
    }
    debug!(peer = %node.inner.peer.short(), "control loop exited");
}

async fn sweep_loop(node: Node) {
    let mut closing = node.inner.closing.subscribe();
    let mut ticker = tokio::time::interval(node.inner.config.route_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closing.changed() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let routes = node.inner.routes.expire(now);
                let partials = node
                    .inner
                    .reassembler
                    .lock()
                    .map(|mut r| r.expire(node.inner.config.reassembly_timeout, now))
                    .unwrap_or(0);
                if routes + partials > 0 {
                    debug!(peer = %node.inner.peer.short(), routes, partials, "sweep removed entries");
                }
            }
        }
    }
    debug!(peer = %node.inner.peer.short(), "sweep loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_transport::{MemoryTransport, TransportConfig};

    fn config() -> NodeConfig {
        NodeConfig {
            transport: TransportConfig::with_retransmit(Duration::from_millis(20)),
            route_sweep_interval: Duration::from_millis(20),
            control_timeout: Duration::from_millis(500),
            ..NodeConfig::default()
        }
    }

    fn link(a: &Node, b: &Node, mtu: usize) -> (TransportId, TransportId) {
        let (ta, tb) = MemoryTransport::pair(a.peer(), b.peer(), mtu);
        let ida = a
            .add_transport(TransportId::new(), b.peer(), Arc::new(ta))
            .unwrap();
        let idb = b
            .add_transport(TransportId::new(), a.peer(), Arc::new(tb))
            .unwrap();
        (ida, idb)
    }

    #[tokio::test]
    async fn test_direct_send_and_reply() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        link(&a, &b, 1400);

        let route = RouteId::new();
        a.add_route(route, b.peer()).unwrap();
        b.apply_add_route(AddRouteControlMessage {
            incoming_transport: b.list_transports().first().map(|t| t.transport_id),
            outgoing_transport: None,
            incoming_route_id: Some(route),
            outgoing_route_id: None,
        })
        .unwrap();

        let (tx_b, mut rx_b) = mpsc::channel(4);
        b.set_receive_channel(tx_b);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        a.set_receive_channel(tx_a);

        a.send_message_thru_route(route, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.contents, Bytes::from_static(b"hi"));
        assert_eq!(got.reply_to.from_peer_id, a.peer());
        assert_eq!(got.reply_to.route_id, route);

        b.send_message_back_thru_route(got.reply_to, Bytes::from_static(b"back"))
            .await
            .unwrap();
        assert_eq!(rx_a.recv().await.unwrap().contents, Bytes::from_static(b"back"));

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_message_fragments() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        link(&a, &b, 300);

        let route = RouteId::new();
        a.add_route(route, b.peer()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        b.set_receive_channel(tx);
        let back = Hop {
            peer: a.peer(),
            rewrite_route_id: route,
        };
        b.inner
            .routes
            .install_new(route, Route::new(Hop::TERMINAL, back, Expiry::Never))
            .unwrap();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        a.send_message_thru_route(route, Bytes::from(payload.clone()))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.contents.as_ref(), payload.as_slice());
        assert_eq!(b.pending_reassembly(), 0);
    }

    #[tokio::test]
    async fn test_send_errors() {
        let a = Node::spawn(config());
        let peer = PeerId::random();
        assert!(matches!(
            a.send_message_thru_route(RouteId::new(), Bytes::new()).await,
            Err(NodeError::NoRoute(_))
        ));

        let route = RouteId::new();
        a.add_route(route, peer).unwrap();
        assert!(matches!(
            a.send_message_thru_route(route, Bytes::new()).await,
            Err(NodeError::NoTransport(p)) if p == peer
        ));
        assert!(matches!(
            a.add_route(route, peer),
            Err(NodeError::Route(mesh_routing::RouteError::RouteExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_transport_rejected() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        link(&a, &b, 1400);
        let (ta, _tb) = MemoryTransport::pair(a.peer(), b.peer(), 1400);
        assert!(matches!(
            a.add_transport(TransportId::new(), b.peer(), Arc::new(ta)),
            Err(NodeError::TransportExists(_))
        ));
        assert_eq!(a.list_transports().len(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_transport_lock_reported() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        let holder = a.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = holder.inner.transports.write().unwrap();
            panic!("poison the transport table");
        })
        .join();
        assert!(panicked.is_err());

        let (ta, _tb) = MemoryTransport::pair(a.peer(), b.peer(), 1400);
        assert!(matches!(
            a.add_transport(TransportId::new(), b.peer(), Arc::new(ta)),
            Err(NodeError::LockPoisoned("transports"))
        ));
        assert!(!a.is_closed());

        // consumer table is a separate lock and stays usable
        let (tx, _rx) = mpsc::channel(1);
        a.set_receive_channel(tx);
        assert!(a.inner.receive_tx.read().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_route_on_peer_confirms() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        link(&a, &b, 1400);

        let id = RouteId::new();
        let forward = Hop {
            peer: PeerId::random(),
            rewrite_route_id: RouteId::new(),
        };
        let backward = Hop {
            peer: a.peer(),
            rewrite_route_id: RouteId::new(),
        };
        a.set_route_on_peer(b.peer(), id, forward, backward, Some(Duration::from_secs(30)))
            .await
            .unwrap();

        let route = b.route(&id).unwrap();
        assert_eq!(route.forward, forward);
        assert_eq!(route.backward, backward);
        assert!(matches!(route.expiry, Expiry::At(_)));

        // last write wins
        let forward2 = Hop {
            peer: PeerId::random(),
            rewrite_route_id: RouteId::new(),
        };
        a.set_route_on_peer(b.peer(), id, forward2, backward, None)
            .await
            .unwrap();
        assert_eq!(b.route(&id).unwrap().forward, forward2);
        assert_eq!(b.list_routes().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_set_route_never_installed() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        link(&a, &b, 1400);

        let result = a
            .set_route_on_peer(b.peer(), RouteId::NIL, Hop::TERMINAL, Hop::TERMINAL, None)
            .await;
        assert!(matches!(result, Err(NodeError::ControlTimeout)));
        assert!(b.list_routes().is_empty());
    }

    #[tokio::test]
    async fn test_expired_routes_swept() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        link(&a, &b, 1400);

        let id = RouteId::new();
        let backward = Hop {
            peer: a.peer(),
            rewrite_route_id: id,
        };
        a.set_route_on_peer(
            b.peer(),
            id,
            Hop::TERMINAL,
            backward,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert!(b.route(&id).is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b.route(&id).is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let a = Node::spawn(config());
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(
            a.add_transport(TransportId::new(), PeerId::random(), {
                let (t, _) = MemoryTransport::pair(a.peer(), PeerId::random(), 1400);
                Arc::new(t)
            }),
            Err(NodeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_control_handle_drives_node() {
        let a = Node::spawn(config());
        let b = Node::spawn(config());
        let (ta, _tb) = MemoryTransport::pair(a.peer(), b.peer(), 1400);
        let control = a.control();

        let id = control
            .add_transport(TransportId::new(), b.peer(), Arc::new(ta))
            .await
            .unwrap();
        let out = RouteId::new();
        control
            .add_route(AddRouteControlMessage {
                incoming_transport: None,
                outgoing_transport: Some(id),
                incoming_route_id: None,
                outgoing_route_id: Some(out),
            })
            .await
            .unwrap();

        let routes = control.list_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].forward_to_peer_id, b.peer());
        assert_eq!(routes[0].expires_in_ms, None);
        assert_eq!(control.list_transports().await.unwrap()[0].transport_id, id);

        let unknown = control
            .add_route(AddRouteControlMessage {
                incoming_transport: Some(TransportId::new()),
                outgoing_transport: None,
                incoming_route_id: Some(RouteId::new()),
                outgoing_route_id: None,
            })
            .await;
        assert!(matches!(unknown, Err(NodeError::UnknownTransport(_))));
    }
}
