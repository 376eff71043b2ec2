//! Manager configuration.

use mesh_node::NodeConfig;
use mesh_topology::DEFAULT_LINK_WEIGHT;
use mesh_transport::DEFAULT_MEMORY_MTU;
use std::time::Duration;

/// Default cap on a single `AddNodes` call
pub const DEFAULT_MAX_NODES_PER_CALL: usize = 256;

/// Configuration for a node manager
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Config every managed node is started with
    pub node: NodeConfig,
    /// MTU of links created by `connect_nodes`
    pub link_mtu: usize,
    /// Graph weight of links created by `connect_nodes`
    pub link_weight: i64,
    /// Cap on a single `add_nodes` call
    pub max_nodes_per_call: usize,
    /// Wait for node control replies and RPC responses
    pub control_timeout: Duration,
}

impl ManagerConfig {
    /// Node config with the manager's control timeout applied
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            control_timeout: self.control_timeout,
            ..self.node.clone()
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            control_timeout: node.control_timeout,
            node,
            link_mtu: DEFAULT_MEMORY_MTU,
            link_weight: DEFAULT_LINK_WEIGHT,
            max_nodes_per_call: DEFAULT_MAX_NODES_PER_CALL,
        }
    }
}
