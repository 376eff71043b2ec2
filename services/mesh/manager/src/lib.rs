//! Node manager and control RPC for mesh.
//!
//! The [`NodeManager`] starts nodes, links pairs of them with in-memory
//! transports, keeps the resulting route graph and installs routes hop by
//! hop through each node's control channel. [`RpcServer`] exposes it over
//! UDP; [`RpcClient`] is the matching caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;
pub mod rpc;

pub use config::{ManagerConfig, DEFAULT_MAX_NODES_PER_CALL};
pub use error::{ManagerError, Result, RpcError};
pub use manager::{LinkRecord, NodeManager};
pub use rpc::{RpcClient, RpcServer, MAX_RPC_DATAGRAM};
