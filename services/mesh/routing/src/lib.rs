//! Label-switching route tables and forwarding decisions for mesh.
//!
//! Every node keeps a table of locally scoped route ids. A routed message
//! names the id its receiver should look up; the matching rule says which
//! neighbor gets the message next and which id to rewrite into it. A zero
//! next peer means the message terminates at this node.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod route;
pub mod router;
pub mod table;

pub use error::RouteError;
pub use route::{Expiry, Hop, Route};
pub use router::{DropReason, Router, RouterStats, RoutingDecision};
pub use table::{RoutingTable, DEFAULT_MAX_ROUTE_LIFETIME};
