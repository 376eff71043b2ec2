//! Node configuration.

use mesh_routing::DEFAULT_MAX_ROUTE_LIFETIME;
use mesh_transport::TransportConfig;
use std::time::Duration;

/// Configuration for a node
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Settings for every transport the node owns
    pub transport: TransportConfig,
    /// Horizon route expiries are clamped to
    pub max_route_lifetime: Duration,
    /// Interval of the route and reassembly sweep
    pub route_sweep_interval: Duration,
    /// Partial messages older than this are discarded
    pub reassembly_timeout: Duration,
    /// Wait for control replies and route confirms
    pub control_timeout: Duration,
    /// Wait for application responses
    pub application_timeout: Duration,
    /// Capacity of the node's internal channels
    pub channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_route_lifetime: DEFAULT_MAX_ROUTE_LIFETIME,
            route_sweep_interval: Duration::from_secs(1),
            reassembly_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(5),
            application_timeout: Duration::from_secs(10),
            channel_capacity: 1024,
        }
    }
}
