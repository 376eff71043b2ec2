//! Mesh node: label-switched forwarding, route control and delivery.
//!
//! A [`Node`] owns a route table, one reliable transport per neighbor and the
//! tasks that move routed messages between them:
//!
//! - **incoming**: every message delivered by a transport is looked up by its
//!   route id and either rewritten and forwarded or handled here
//! - **control**: commands from the manager ([`NodeControl`])
//! - **sweep**: expired routes and stale partial messages
//!
//! Applications receive reassembled payloads through a [`Consumer`] or a
//! receive channel, and answer along the same route with
//! [`Node::send_message_back_thru_route`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod config;
pub mod consumer;
pub mod control;
pub mod error;
pub mod node;

pub use app::{EchoClient, EchoServer};
pub use config::NodeConfig;
pub use consumer::{Consumer, MeshMessage, ReplyTo};
pub use control::{AddRouteControlMessage, ControlRequest, NodeCommand, NodeControl};
pub use error::{NodeError, Result};
pub use node::Node;
