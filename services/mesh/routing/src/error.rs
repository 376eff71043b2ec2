//! Route table errors.

use mesh_wire::RouteId;
use thiserror::Error;

/// Route table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Id already names a route
    #[error("route {0} already exists")]
    RouteExists(RouteId),

    /// Id names no route
    #[error("route {0} not found")]
    RouteNotFound(RouteId),

    /// Route would never forward anywhere, or its id is nil
    #[error("invalid route: {0}")]
    InvalidRoute(String),
}
