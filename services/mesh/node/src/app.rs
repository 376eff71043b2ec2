//! Request/response application running over a node.
//!
//! [`EchoClient`] sends an [`AppRequest`] down a route and blocks on a
//! per-request oneshot until the matching [`AppResponse`] comes back or the
//! application timeout elapses. [`EchoServer`] answers every request with
//! its payload suffixed `-reply`.

use crate::consumer::{Consumer, MeshMessage};
use crate::error::{NodeError, Result};
use crate::node::Node;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use mesh_wire::{AppMessage, AppRequest, AppResponse, PeerId, RouteId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const REPLY_SUFFIX: &[u8] = b"-reply";

/// Answers every request with its payload suffixed `-reply`
pub struct EchoServer {
    node: Node,
}

impl EchoServer {
    /// Register an echo server on `node` for messages from `peer`.
    ///
    /// Use [`PeerId::ZERO`] to answer requests arriving from any neighbor.
    pub fn attach(node: &Node, peer: PeerId) -> Arc<Self> {
        let server = Arc::new(Self { node: node.clone() });
        node.register_consumer(peer, server.clone());
        server
    }
}

#[async_trait]
impl Consumer for EchoServer {
    async fn consume(&self, message: MeshMessage) {
        let request = match AppMessage::decode(&message.contents) {
            Ok(AppMessage::Request(request)) => request,
            Ok(other) => {
                debug!(kind = ?other, "echo server ignoring non-request");
                return;
            }
            Err(e) => {
                warn!(from = %message.reply_to.from_peer_id.short(), "undecodable app message: {}", e);
                return;
            }
        };

        let mut payload = BytesMut::with_capacity(request.payload.len() + REPLY_SUFFIX.len());
        payload.put_slice(&request.payload);
        payload.put_slice(REPLY_SUFFIX);
        let response = AppMessage::Response(AppResponse {
            request_id: request.request_id,
            payload: payload.freeze(),
            error: None,
        });

        let result = match response.encode() {
            Ok(bytes) => {
                self.node
                    .send_message_back_thru_route(message.reply_to, bytes)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(request_id = request.request_id, "echo reply failed: {}", e);
        }
    }
}

/// Client side: requests along one route, correlated by request id
pub struct EchoClient {
    node: Node,
    route_id: RouteId,
    timeout: Duration,
    next_request_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<AppResponse>>,
}

impl EchoClient {
    /// Create a client sending on `route_id` and register it for responses
    /// arriving from `first_hop`
    pub fn attach(node: &Node, route_id: RouteId, first_hop: PeerId) -> Arc<Self> {
        let client = Arc::new(Self {
            node: node.clone(),
            route_id,
            timeout: node.config().application_timeout,
            next_request_id: AtomicU64::new(1),
            pending: DashMap::new(),
        });
        node.register_consumer(first_hop, client.clone());
        client
    }

    /// Requests still waiting for a response
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Send `payload` and wait for the response
    pub async fn request(&self, payload: Bytes) -> Result<Bytes> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let sent = match AppMessage::Request(AppRequest {
            request_id,
            payload,
        })
        .encode()
        {
            Ok(bytes) => self.node.send_message_thru_route(self.route_id, bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.pending.remove(&request_id);
        match outcome {
            Ok(Ok(AppResponse {
                error: Some(error), ..
            })) => Err(NodeError::App(error)),
            Ok(Ok(response)) => Ok(response.payload),
            Ok(Err(_)) => Err(NodeError::Closed),
            Err(_) => Err(NodeError::AppTimeout),
        }
    }
}

#[async_trait]
impl Consumer for EchoClient {
    async fn consume(&self, message: MeshMessage) {
        match AppMessage::decode(&message.contents) {
            Ok(AppMessage::Response(response)) => {
                match self.pending.remove(&response.request_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!(
                        request_id = response.request_id,
                        "response for unknown or timed out request"
                    ),
                }
            }
            Ok(other) => debug!(kind = ?other, "echo client ignoring non-response"),
            Err(e) => warn!("undecodable app message: {}", e),
        }
    }
}
