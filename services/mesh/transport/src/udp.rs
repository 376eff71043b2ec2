//! UDP physical transport bound to a single remote peer.

use crate::error::{Result, TransportError};
use crate::physical::PhysicalTransport;
use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::PeerId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default MTU for UDP links
pub const DEFAULT_UDP_MTU: usize = 1400;

/// Largest datagram the receive loop accepts
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// UDP socket connected to one remote address
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote_addr: SocketAddr,
    remote_peer: PeerId,
    mtu: usize,
    closed: AtomicBool,
    closing: watch::Sender<bool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind `local_addr` and connect it to `remote_addr`
    pub async fn connect(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        remote_peer: PeerId,
        mtu: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(remote_addr).await?;
        info!(
            local = %socket.local_addr()?,
            remote = %remote_addr,
            peer = %remote_peer.short(),
            "UDP transport connected"
        );

        let (closing, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            remote_addr,
            remote_peer,
            mtu,
            closed: AtomicBool::new(false),
            closing,
            recv_task: Mutex::new(None),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Address datagrams are sent to
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Bytes>,
    mut closing: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = closing.changed() => break,
            res = socket.recv(&mut buf) => match res {
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    warn!("UDP receive failed: {}", e);
                }
            },
        }
    }
    debug!("UDP receive loop exited");
}

#[async_trait]
impl PhysicalTransport for UdpTransport {
    fn connected_to_peer(&self, peer: &PeerId) -> bool {
        !self.closed.load(Ordering::SeqCst) && *peer == self.remote_peer
    }

    fn max_message_size_to_peer(&self, _peer: &PeerId) -> usize {
        self.mtu
    }

    async fn send_message(&self, peer: &PeerId, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if *peer != self.remote_peer {
            return Err(TransportError::NotConnected(*peer));
        }
        if bytes.len() > self.mtu {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max: self.mtu,
            });
        }
        self.socket.send(&bytes).await?;
        Ok(())
    }

    fn set_receive_channel(&self, tx: mpsc::Sender<Bytes>) {
        let task = tokio::spawn(recv_loop(
            self.socket.clone(),
            tx,
            self.closing.subscribe(),
        ));
        if let Ok(mut slot) = self.recv_task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.closing.send(true);
        let task = match self.recv_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_pair() {
        let a_peer = PeerId::random();
        let b_peer = PeerId::random();

        let probe_a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let probe_b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let a_addr = probe_a.local_addr().unwrap();
        let b_addr = probe_b.local_addr().unwrap();
        drop(probe_a);
        drop(probe_b);

        let a = UdpTransport::connect(a_addr, b_addr, b_peer, DEFAULT_UDP_MTU)
            .await
            .unwrap();
        let b = UdpTransport::connect(b_addr, a_addr, a_peer, DEFAULT_UDP_MTU)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        b.set_receive_channel(tx);

        a.send_message(&b_peer, Bytes::from_static(b"datagram"))
            .await
            .unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"datagram"));

        b.close().await.unwrap();
        assert!(!b.connected_to_peer(&a_peer));
        assert!(matches!(
            b.send_message(&a_peer, Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        a.close().await.unwrap();
    }
}
