use bytes::Bytes;
use mesh_transport::{Delivered, ReliableTransport, TransportConfig, UdpTransport, DEFAULT_UDP_MTU};
use mesh_wire::{PeerId, TransportId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn free_addr() -> SocketAddr {
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

#[tokio::test]
async fn reliable_over_udp() -> anyhow::Result<()> {
    let a_peer = PeerId::random();
    let b_peer = PeerId::random();
    let a_addr = free_addr();
    let b_addr = free_addr();

    let a_phys = UdpTransport::connect(a_addr, b_addr, b_peer, DEFAULT_UDP_MTU).await?;
    let b_phys = UdpTransport::connect(b_addr, a_addr, a_peer, DEFAULT_UDP_MTU).await?;

    let config = TransportConfig::with_retransmit(Duration::from_millis(50));
    let (a_tx, _a_rx) = mpsc::channel::<Delivered>(16);
    let (b_tx, mut b_rx) = mpsc::channel::<Delivered>(16);
    let a = ReliableTransport::spawn(
        TransportId::new(),
        a_peer,
        b_peer,
        Arc::new(a_phys),
        config.clone(),
        a_tx,
    );
    let b = ReliableTransport::spawn(
        TransportId::new(),
        b_peer,
        a_peer,
        Arc::new(b_phys),
        config,
        b_tx,
    );

    for i in 0..5u8 {
        a.send_and_wait(Bytes::from(vec![i; 100]), Duration::from_secs(1))
            .await?;
    }

    let mut got = Vec::new();
    for _ in 0..5 {
        let d = tokio::time::timeout(Duration::from_secs(1), b_rx.recv())
            .await?
            .expect("channel open");
        assert_eq!(d.from_peer, a_peer);
        got.push(d.contents[0]);
    }
    got.sort();
    assert_eq!(got, vec![0, 1, 2, 3, 4]);
    assert_eq!(a.pending(), 0);

    a.close().await?;
    b.close().await?;
    Ok(())
}
