//! Route graph of direct links and cached shortest-path search for mesh.
//!
//! The graph is the union of every direct link the manager has created.
//! Shortest paths are computed with Dijkstra's algorithm and cached per
//! source until the graph changes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod graph;

pub use graph::*;
