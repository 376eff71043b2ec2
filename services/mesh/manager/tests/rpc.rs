//! Control RPC surface over a real UDP socket.

use anyhow::Result;
use mesh_manager::{ManagerConfig, NodeManager, RpcClient, RpcError, RpcServer};
use mesh_wire::{RpcErrorKind, TransportStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn serve(max_nodes: usize) -> Result<(Arc<NodeManager>, RpcServer, RpcClient)> {
    let manager = NodeManager::new(ManagerConfig {
        max_nodes_per_call: max_nodes,
        ..ManagerConfig::default()
    });
    let any: SocketAddr = "127.0.0.1:0".parse()?;
    let server = RpcServer::bind(manager.clone(), &[any]).await?;
    let client = RpcClient::connect(server.local_addrs()[0], Duration::from_secs(2)).await?;
    Ok((manager, server, client))
}

#[tokio::test]
async fn test_full_rpc_surface() -> Result<()> {
    let (manager, server, client) = serve(16).await?;

    let first = client.add_node().await?;
    let rest = client.add_nodes(2).await?;
    assert_eq!(rest.len(), 2);
    assert_eq!(manager.peers(), vec![first, rest[0], rest[1]]);

    let pair = client.connect_nodes(0, 1).await?;
    client.connect_nodes(1, 2).await?;

    let transports = client.list_transports(0).await?;
    assert_eq!(transports.len(), 1);
    assert_eq!(transports[0].transport_id, pair[0]);
    assert_eq!(transports[0].from_peer, first);
    assert_eq!(transports[0].to_peer, rest[0]);
    assert_eq!(transports[0].status, TransportStatus::Connected);
    assert_eq!(client.list_all_transports().await?.len(), 4);

    let built = client.build_route(vec![0, 1, 2]).await?;
    assert_eq!(built.len(), 2);
    let found = client.find_route(2, 0).await?;
    assert_eq!(found.len(), 2);
    assert_ne!(built, found);

    let relay = client.list_routes(1).await?;
    assert_eq!(relay.len(), 4);
    let origin = client.list_routes(0).await?;
    assert!(origin.iter().any(|r| r.route_id == built[0]));
    assert_eq!(client.pending(), 0);

    client.close().await;
    server.shutdown().await;
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rpc_errors_carry_kind() -> Result<()> {
    let (manager, server, client) = serve(4).await?;

    let err = client.add_nodes(5).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(RpcErrorKind::TooManyNodes));

    client.add_nodes(2).await?;
    let err = client.connect_nodes(0, 7).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(RpcErrorKind::NodeIndexOutOfRange));
    let err = client.connect_nodes(1, 1).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(RpcErrorKind::ConnectedToItself));

    client.connect_nodes(0, 1).await?;
    let err = client.connect_nodes(1, 0).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(RpcErrorKind::AlreadyConnected));

    client.add_node().await?;
    let err = client.find_route(0, 2).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(RpcErrorKind::NoRoute));
    let err = client.build_route(vec![0, 2]).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(RpcErrorKind::RouteBuild));

    server.shutdown().await;
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_silent_server_times_out() -> Result<()> {
    // a bound socket nobody answers on
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let client = RpcClient::connect(silent.local_addr()?, Duration::from_millis(100)).await?;

    let err = client.add_node().await.unwrap_err();
    assert!(matches!(err, RpcError::ControlTimeout(1)));
    assert_eq!(client.pending(), 0);
    client.close().await;
    Ok(())
}
