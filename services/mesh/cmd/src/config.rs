//! Configuration handling for the mesh binary.
//!
//! Settings come from a YAML file, then `MESH_*` environment variables, then
//! command-line flags. Durations use humantime notation (`200ms`, `10s`).

use anyhow::{Context, Result};
use mesh_manager::ManagerConfig;
use mesh_node::NodeConfig;
use mesh_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Control RPC settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    /// Addresses to serve on, one receive loop each
    pub listen: Vec<SocketAddr>,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([127, 0, 0, 1], 7400))],
        }
    }
}

/// Reliable transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    /// Resend interval for unacked frames
    #[serde(with = "duration_str")]
    pub retransmit: Duration,
    /// Give up on a frame after this long
    #[serde(with = "duration_str")]
    pub send_deadline: Duration,
    /// Dedup window for delivered ids
    #[serde(with = "duration_str")]
    pub remember_received: Duration,
    /// Expiry sweep interval
    #[serde(with = "duration_str")]
    pub expire_interval: Duration,
    /// Inbound channel capacity
    pub channel_capacity: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        let t = TransportConfig::default();
        Self {
            retransmit: t.retransmit_duration,
            send_deadline: t.send_deadline,
            remember_received: t.remember_received_duration,
            expire_interval: t.expire_interval,
            channel_capacity: t.channel_capacity,
        }
    }
}

/// Node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Horizon route expiries are clamped to
    #[serde(with = "duration_str")]
    pub max_route_lifetime: Duration,
    /// Expired route sweep interval
    #[serde(with = "duration_str")]
    pub route_sweep_interval: Duration,
    /// Partial messages older than this are dropped
    #[serde(with = "duration_str")]
    pub reassembly_timeout: Duration,
    /// Wait for application responses
    #[serde(with = "duration_str")]
    pub application_timeout: Duration,
}

impl Default for NodeSection {
    fn default() -> Self {
        let n = NodeConfig::default();
        Self {
            max_route_lifetime: n.max_route_lifetime,
            route_sweep_interval: n.route_sweep_interval,
            reassembly_timeout: n.reassembly_timeout,
            application_timeout: n.application_timeout,
        }
    }
}

/// Manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    /// MTU of in-memory links
    pub link_mtu: usize,
    /// Graph weight of new links
    pub link_weight: i64,
    /// Cap on one AddNodes call
    pub max_nodes_per_call: usize,
    /// Wait for node control replies
    #[serde(with = "duration_str")]
    pub control_timeout: Duration,
}

impl Default for ManagerSection {
    fn default() -> Self {
        let m = ManagerConfig::default();
        Self {
            link_mtu: m.link_mtu,
            link_weight: m.link_weight,
            max_nodes_per_call: m.max_nodes_per_call,
            control_timeout: m.control_timeout,
        }
    }
}

/// Topology created at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    /// Nodes to start
    pub nodes: usize,
    /// Node index pairs to connect
    pub links: Vec<(usize, usize)>,
}

/// Mesh binary configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Control RPC
    pub rpc: RpcSection,
    /// Reliable transport
    pub transport: TransportSection,
    /// Nodes
    pub node: NodeSection,
    /// Node manager
    pub manager: ManagerSection,
    /// Startup topology
    pub bootstrap: BootstrapSection,
}

impl MeshConfig {
    /// Load `config_path` and apply environment overrides.
    ///
    /// A missing file means defaults; a malformed one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let parsed: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                parsed
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MESH_*` overrides read through `lookup`
    pub fn apply_environment_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("MESH_RPC_LISTEN") {
            let addrs: Vec<SocketAddr> = raw
                .split(',')
                .filter_map(|a| a.trim().parse().ok())
                .collect();
            if addrs.is_empty() {
                warn!("Ignoring MESH_RPC_LISTEN={:?}: no valid address", raw);
            } else {
                info!("RPC listen addresses overridden by environment: {:?}", addrs);
                self.rpc.listen = addrs;
            }
        }

        if let Some(mtu) = lookup("MESH_LINK_MTU").and_then(|v| v.parse().ok()) {
            self.manager.link_mtu = mtu;
            info!("Link MTU overridden by environment: {}", mtu);
        }

        if let Some(d) = lookup("MESH_RETRANSMIT").and_then(|v| humantime::parse_duration(&v).ok()) {
            self.transport.retransmit = d;
            self.transport.send_deadline = d * 3;
            info!("Retransmit overridden by environment: {:?}", d);
        }

        if let Some(d) = lookup("MESH_CONTROL_TIMEOUT").and_then(|v| humantime::parse_duration(&v).ok())
        {
            self.manager.control_timeout = d;
            info!("Control timeout overridden by environment: {:?}", d);
        }

        if let Some(n) = lookup("MESH_BOOTSTRAP_NODES").and_then(|v| v.parse().ok()) {
            self.bootstrap.nodes = n;
            info!("Bootstrap node count overridden by environment: {}", n);
        }
    }

    /// Reject settings the mesh cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.rpc.listen.is_empty() {
            anyhow::bail!("rpc.listen must name at least one address");
        }
        self.transport_config()
            .validate()
            .context("transport section")?;
        if self.node.route_sweep_interval.is_zero() {
            anyhow::bail!("node.route_sweep_interval must be non-zero");
        }
        if self.node.reassembly_timeout.is_zero() {
            anyhow::bail!("node.reassembly_timeout must be non-zero");
        }
        if self.manager.link_weight <= 0 {
            anyhow::bail!("manager.link_weight must be positive");
        }
        for (i, j) in &self.bootstrap.links {
            if *i >= self.bootstrap.nodes || *j >= self.bootstrap.nodes {
                anyhow::bail!(
                    "bootstrap link ({}, {}) names a node past {}",
                    i,
                    j,
                    self.bootstrap.nodes
                );
            }
        }
        Ok(())
    }

    /// Transport settings for every link
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            retransmit_duration: self.transport.retransmit,
            send_deadline: self.transport.send_deadline,
            remember_received_duration: self.transport.remember_received,
            expire_interval: self.transport.expire_interval,
            channel_capacity: self.transport.channel_capacity,
        }
    }

    /// Manager settings, with node and transport settings folded in
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            node: NodeConfig {
                transport: self.transport_config(),
                max_route_lifetime: self.node.max_route_lifetime,
                route_sweep_interval: self.node.route_sweep_interval,
                reassembly_timeout: self.node.reassembly_timeout,
                application_timeout: self.node.application_timeout,
                control_timeout: self.manager.control_timeout,
                ..NodeConfig::default()
            },
            link_mtu: self.manager.link_mtu,
            link_weight: self.manager.link_weight,
            max_nodes_per_call: self.manager.max_nodes_per_call,
            control_timeout: self.manager.control_timeout,
        }
    }
}
