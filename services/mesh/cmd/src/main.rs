//! Mesh overlay manager binary.
//!
//! Starts a node manager, optionally creates a startup topology, and serves
//! the control RPC over UDP until interrupted.

#[macro_use]
mod logging;
mod config;

use clap::Parser;
use config::MeshConfig;
use logging::MeshLogFormatter;
use mesh_manager::{NodeManager, RpcServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Label-switched mesh overlay with a UDP control RPC
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Mesh overlay manager")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// RPC listen address (repeatable); replaces the configured list
    #[arg(long)]
    rpc_listen: Vec<SocketAddr>,

    /// Nodes to start before serving
    #[arg(long)]
    nodes: Option<usize>,

    /// Connect every consecutive pair of startup nodes
    #[arg(long)]
    line: bool,

    /// MTU of in-memory links
    #[arg(long)]
    link_mtu: Option<usize>,

    /// Retransmit interval, e.g. 200ms; the send deadline becomes three times this
    #[arg(long)]
    retransmit: Option<humantime::Duration>,

    /// Control timeout, e.g. 5s
    #[arg(long)]
    control_timeout: Option<humantime::Duration>,
}

impl Args {
    fn apply(&self, config: &mut MeshConfig) {
        if !self.rpc_listen.is_empty() {
            config.rpc.listen = self.rpc_listen.clone();
        }
        if let Some(n) = self.nodes {
            config.bootstrap.nodes = n;
        }
        if self.line {
            config.bootstrap.links = (1..config.bootstrap.nodes).map(|i| (i - 1, i)).collect();
        }
        if let Some(mtu) = self.link_mtu {
            config.manager.link_mtu = mtu;
        }
        if let Some(d) = self.retransmit {
            config.transport.retransmit = d.into();
            config.transport.send_deadline = config.transport.retransmit * 3;
        }
        if let Some(d) = self.control_timeout {
            config.manager.control_timeout = d.into();
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let mut env_filter = EnvFilter::new("warn");
    for target in [
        "mesh",
        "mesh_wire",
        "mesh_transport",
        "mesh_routing",
        "mesh_topology",
        "mesh_node",
        "mesh_manager",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();
    Ok(())
}

async fn bootstrap(manager: &NodeManager, config: &MeshConfig) -> anyhow::Result<()> {
    if config.bootstrap.nodes == 0 {
        return Ok(());
    }
    let peers = manager.add_nodes(config.bootstrap.nodes)?;
    for (i, peer) in peers.iter().enumerate() {
        component_info!("bootstrap", index = i, peer = %peer, "Node ready");
    }
    for (i, j) in &config.bootstrap.links {
        manager.connect_nodes(*i, *j).await?;
    }
    component_info!(
        "bootstrap",
        nodes = peers.len(),
        links = config.bootstrap.links.len(),
        "Startup topology created"
    );
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => component_warn!("signal", "SIGTERM handler unavailable: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        component_error!("signal", "waiting for Ctrl+C failed: {}", e);
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting mesh v{}", env!("CARGO_PKG_VERSION"));

    let mut mesh_config = MeshConfig::load_from_file(&args.config)?;
    args.apply(&mut mesh_config);
    mesh_config.validate()?;

    let manager = NodeManager::new(mesh_config.manager_config());
    bootstrap(&manager, &mesh_config).await?;

    let server = RpcServer::bind(Arc::clone(&manager), &mesh_config.rpc.listen).await?;
    for addr in server.local_addrs() {
        component_info!("rpc", addr = %addr, "Control RPC ready");
    }

    wait_for_signal().await;

    info!("Mesh shutting down");
    server.shutdown().await;
    manager.shutdown().await;
    info!("Mesh shutdown complete");
    Ok(())
}
