//! In-process physical transport with loss injection.

use crate::error::{Result, TransportError};
use crate::physical::PhysicalTransport;
use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::PeerId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Default MTU of an in-memory link
pub const DEFAULT_MEMORY_MTU: usize = 1400;

type Slot = Arc<Mutex<Option<mpsc::Sender<Bytes>>>>;

/// Drop controls for one direction of a link
#[derive(Debug, Clone, Default)]
pub struct LossControl {
    drop_next: Arc<AtomicUsize>,
    drop_all: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
}

impl LossControl {
    /// Drop the next `n` datagrams sent through this end
    pub fn drop_next(&self, n: usize) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    /// Drop every datagram until switched off
    pub fn set_drop_all(&self, on: bool) {
        self.drop_all.store(on, Ordering::SeqCst);
    }

    /// Datagrams dropped so far
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn should_drop(&self) -> bool {
        let lost = self.drop_all.load(Ordering::SeqCst)
            || self
                .drop_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lost {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        lost
    }
}

/// One end of an in-memory link
pub struct MemoryTransport {
    local: PeerId,
    remote: PeerId,
    mtu: usize,
    inbox: Slot,
    remote_inbox: Slot,
    loss: LossControl,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create both ends of a link between `a` and `b`
    pub fn pair(a: PeerId, b: PeerId, mtu: usize) -> (MemoryTransport, MemoryTransport) {
        let a_inbox: Slot = Arc::new(Mutex::new(None));
        let b_inbox: Slot = Arc::new(Mutex::new(None));

        let a_end = MemoryTransport {
            local: a,
            remote: b,
            mtu,
            inbox: a_inbox.clone(),
            remote_inbox: b_inbox.clone(),
            loss: LossControl::default(),
            closed: AtomicBool::new(false),
        };
        let b_end = MemoryTransport {
            local: b,
            remote: a,
            mtu,
            inbox: b_inbox,
            remote_inbox: a_inbox,
            loss: LossControl::default(),
            closed: AtomicBool::new(false),
        };

        (a_end, b_end)
    }

    /// Loss controls for datagrams sent from this end
    pub fn loss(&self) -> LossControl {
        self.loss.clone()
    }

    /// Peer owning this end
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Peer at the other end
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }
}

#[async_trait]
impl PhysicalTransport for MemoryTransport {
    fn connected_to_peer(&self, peer: &PeerId) -> bool {
        !self.closed.load(Ordering::SeqCst) && *peer == self.remote
    }

    fn max_message_size_to_peer(&self, _peer: &PeerId) -> usize {
        self.mtu
    }

    async fn send_message(&self, peer: &PeerId, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if *peer != self.remote {
            return Err(TransportError::NotConnected(*peer));
        }
        if bytes.len() > self.mtu {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max: self.mtu,
            });
        }
        if self.loss.should_drop() {
            debug!(from = %self.local.short(), to = %self.remote.short(), len = bytes.len(), "datagram dropped");
            return Ok(());
        }

        let tx = match self.remote_inbox.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => match tx.try_send(bytes) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(to = %self.remote.short(), "peer inbox full, datagram lost");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(to = %self.remote.short(), "peer inbox closed, datagram lost");
                }
            },
            None => debug!(to = %self.remote.short(), "peer not listening, datagram lost"),
        }
        Ok(())
    }

    fn set_receive_channel(&self, tx: mpsc::Sender<Bytes>) {
        if let Ok(mut slot) = self.inbox.lock() {
            *slot = Some(tx);
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.inbox.lock() {
            slot.take();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers() {
        let (a, b) = MemoryTransport::pair(PeerId::random(), PeerId::random(), 64);
        let (tx, mut rx) = mpsc::channel(4);
        b.set_receive_channel(tx);

        a.send_message(&b.local_peer(), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
        assert!(a.connected_to_peer(&b.local_peer()));
        assert!(!a.connected_to_peer(&a.local_peer()));
    }

    #[tokio::test]
    async fn test_mtu_and_wrong_peer() {
        let (a, _b) = MemoryTransport::pair(PeerId::random(), PeerId::random(), 4);
        let err = a
            .send_message(&a.remote_peer(), Bytes::from_static(b"too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { len: 8, max: 4 }));

        let stranger = PeerId::random();
        let err = a.send_message(&stranger, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(p) if p == stranger));
    }

    #[tokio::test]
    async fn test_loss_injection() {
        let (a, b) = MemoryTransport::pair(PeerId::random(), PeerId::random(), 64);
        let (tx, mut rx) = mpsc::channel(8);
        b.set_receive_channel(tx);

        a.loss().drop_next(2);
        for i in 0..3u8 {
            a.send_message(&b.local_peer(), Bytes::from(vec![i]))
                .await
                .unwrap();
        }
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(vec![2u8]));
        assert_eq!(a.loss().dropped(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (a, b) = MemoryTransport::pair(PeerId::random(), PeerId::random(), 64);
        a.close().await.unwrap();
        let err = a
            .send_message(&b.local_peer(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
