//! Acked, retransmitting, deduplicating transport over one physical link.
//!
//! Each [`ReliableTransport`] runs three tasks:
//!
//! - **receive**: decodes inbound frames, acks every `SendMessage` and delivers
//!   first sightings to the output channel
//! - **retransmit**: every `retransmit_duration`, resends unacked frames whose
//!   deadline has not passed
//! - **expire**: every `expire_interval`, drops sent entries past their
//!   deadline and seen ids past their remember window
//!
//! All three exit when the transport is closed.

use crate::error::{Result, TransportError};
use crate::ledger::{SeenSet, SentLedger, SentState};
use crate::physical::PhysicalTransport;
use bytes::Bytes;
use mesh_wire::{
    MessageId, PeerId, ReplyMessage, SendMessage, TransportFrame, TransportId, TransportInfo,
    TransportStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for a reliable transport
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Interval between resends of an unacked frame
    pub retransmit_duration: Duration,
    /// How long a frame is retried before it is dropped
    pub send_deadline: Duration,
    /// How long a delivered id is remembered for dedup
    pub remember_received_duration: Duration,
    /// Interval of the expiry sweep
    pub expire_interval: Duration,
    /// Capacity of the inbound datagram channel
    pub channel_capacity: usize,
}

impl TransportConfig {
    /// Config with `retransmit` and a deadline of three retransmit periods
    pub fn with_retransmit(retransmit: Duration) -> Self {
        Self {
            retransmit_duration: retransmit,
            send_deadline: retransmit * 3,
            ..Self::default()
        }
    }

    /// Reject settings that stall the loops or break dedup.
    ///
    /// Intervals must be non-zero, and a delivered id must be remembered at
    /// least as long as the sender may still retransmit it.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TransportError::InvalidConfig(msg.to_string()));
        if self.retransmit_duration.is_zero() {
            return invalid("retransmit_duration must be non-zero");
        }
        if self.expire_interval.is_zero() {
            return invalid("expire_interval must be non-zero");
        }
        if self.channel_capacity == 0 {
            return invalid("channel_capacity must be non-zero");
        }
        if self.send_deadline < self.retransmit_duration {
            return invalid("send_deadline must be at least retransmit_duration");
        }
        if self.remember_received_duration < self.send_deadline {
            return invalid("remember_received_duration must be at least send_deadline");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retransmit_duration: Duration::from_millis(200),
            send_deadline: Duration::from_millis(600),
            remember_received_duration: Duration::from_secs(10),
            expire_interval: Duration::from_millis(500),
            channel_capacity: 1024,
        }
    }
}

/// Payload handed up by a transport
#[derive(Debug, Clone)]
pub struct Delivered {
    /// Transport it arrived on
    pub transport_id: TransportId,
    /// Peer at the other end
    pub from_peer: PeerId,
    /// Contents of the `SendMessage`
    pub contents: Bytes,
}

struct Shared {
    id: TransportId,
    local_peer: PeerId,
    remote_peer: PeerId,
    physical: Arc<dyn PhysicalTransport>,
    config: TransportConfig,
    sent: SentLedger,
    seen: SeenSet,
    closed: AtomicBool,
    closing: watch::Sender<bool>,
}

/// Reliable transport to one peer
#[derive(Clone)]
pub struct ReliableTransport {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ReliableTransport {
    /// Wrap `physical` and start the background loops.
    ///
    /// Delivered payloads are written to `output`.
    pub fn spawn(
        id: TransportId,
        local_peer: PeerId,
        remote_peer: PeerId,
        physical: Arc<dyn PhysicalTransport>,
        config: TransportConfig,
        output: mpsc::Sender<Delivered>,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        physical.set_receive_channel(inbound_tx);

        let shared = Arc::new(Shared {
            id,
            local_peer,
            remote_peer,
            physical,
            config,
            sent: SentLedger::new(),
            seen: SeenSet::new(),
            closed: AtomicBool::new(false),
            closing,
        });

        let tasks = vec![
            tokio::spawn(receive_loop(shared.clone(), inbound_rx, output)),
            tokio::spawn(retransmit_loop(shared.clone())),
            tokio::spawn(expire_loop(shared.clone())),
        ];

        info!(
            transport_id = %id,
            local = %local_peer.short(),
            remote = %remote_peer.short(),
            "Reliable transport started"
        );

        Self {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    /// Send `contents` to the peer without waiting for the ack
    pub async fn send(&self, contents: Bytes) -> Result<MessageId> {
        self.send_inner(contents, None).await
    }

    /// Send `contents` and wait up to `timeout` for the ack.
    ///
    /// On timeout the entry stays in the ledger and keeps being retransmitted
    /// until the expiry sweep removes it.
    pub async fn send_and_wait(&self, contents: Bytes, timeout: Duration) -> Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        let id = self.send_inner(contents, Some(tx)).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(_)) | Err(_) => Err(TransportError::TransportTimeout(id)),
        }
    }

    async fn send_inner(
        &self,
        contents: Bytes,
        waiter: Option<oneshot::Sender<()>>,
    ) -> Result<MessageId> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let message_id = MessageId::new();
        let bytes = TransportFrame::Send(SendMessage {
            message_id,
            from_peer_id: shared.local_peer,
            contents,
        })
        .encode()?;

        let max = self.max_message_size();
        if bytes.len() > max {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max,
            });
        }

        // Recorded before the write so an immediate ack finds it
        shared.sent.insert(
            message_id,
            SentState {
                to_peer: shared.remote_peer,
                bytes: bytes.clone(),
                deadline: Instant::now() + shared.config.send_deadline,
                attempts: 0,
                waiter,
            },
        );

        if let Err(e) = shared
            .physical
            .send_message(&shared.remote_peer, bytes)
            .await
        {
            shared.sent.remove(&message_id);
            return Err(e);
        }

        debug!(transport_id = %shared.id, message_id = %message_id, "sent");
        Ok(message_id)
    }

    /// Transport id
    pub fn id(&self) -> TransportId {
        self.shared.id
    }

    /// Peer owning this end
    pub fn local_peer(&self) -> PeerId {
        self.shared.local_peer
    }

    /// Peer at the other end
    pub fn remote_peer(&self) -> PeerId {
        self.shared.remote_peer
    }

    /// MTU of the underlying link
    pub fn max_message_size(&self) -> usize {
        self.shared
            .physical
            .max_message_size_to_peer(&self.shared.remote_peer)
    }

    /// Whether the transport is open
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Messages awaiting an ack
    pub fn pending(&self) -> usize {
        self.shared.sent.len()
    }

    /// Resend count of a message still awaiting its ack
    pub fn attempts(&self, id: &MessageId) -> Option<u32> {
        self.shared.sent.attempts(id)
    }

    /// Delivered ids still remembered
    pub fn remembered(&self) -> usize {
        self.shared.seen.len()
    }

    /// Snapshot for listings
    pub fn info(&self) -> TransportInfo {
        TransportInfo {
            transport_id: self.shared.id,
            status: if self.is_closed() {
                TransportStatus::Closed
            } else {
                TransportStatus::Connected
            },
            from_peer: self.shared.local_peer,
            to_peer: self.shared.remote_peer,
        }
    }

    /// Stop the loops and close the physical link
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shared.closing.send(true);
        let result = self.shared.physical.close().await;

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }

        info!(transport_id = %self.shared.id, "Reliable transport closed");
        result
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<Delivered>,
) {
    let mut closing = shared.closing.subscribe();
    loop {
        let datagram = tokio::select! {
            _ = closing.changed() => break,
            datagram = inbound.recv() => match datagram {
                Some(d) => d,
                None => break,
            },
        };

        let frame = match TransportFrame::decode(&datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(transport_id = %shared.id, "dropping undecodable datagram: {}", e);
                continue;
            }
        };

        match frame {
            TransportFrame::Send(msg) => {
                // Acked unconditionally; the sender may have missed our last ack
                let ack = TransportFrame::Reply(ReplyMessage {
                    message_id: msg.message_id,
                });
                match ack.encode() {
                    Ok(bytes) => {
                        if let Err(e) = shared
                            .physical
                            .send_message(&shared.remote_peer, bytes)
                            .await
                        {
                            debug!(transport_id = %shared.id, "ack send failed: {}", e);
                        }
                    }
                    Err(e) => warn!(transport_id = %shared.id, "ack encode failed: {}", e),
                }

                let forget_at = Instant::now() + shared.config.remember_received_duration;
                if !shared.seen.first_sighting(msg.message_id, forget_at) {
                    debug!(transport_id = %shared.id, message_id = %msg.message_id, "duplicate suppressed");
                    continue;
                }

                let delivered = Delivered {
                    transport_id: shared.id,
                    from_peer: msg.from_peer_id,
                    contents: msg.contents,
                };
                if output.send(delivered).await.is_err() {
                    debug!(transport_id = %shared.id, "output channel closed");
                    break;
                }
            }
            TransportFrame::Reply(ack) => {
                if !shared.sent.ack(&ack.message_id) {
                    debug!(transport_id = %shared.id, message_id = %ack.message_id, "ack for unknown message");
                }
            }
        }
    }
    debug!(transport_id = %shared.id, "receive loop exited");
}

async fn retransmit_loop(shared: Arc<Shared>) {
    let mut closing = shared.closing.subscribe();
    let mut ticker = tokio::time::interval(shared.config.retransmit_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closing.changed() => break,
            _ = ticker.tick() => {
                for (id, peer, bytes) in shared.sent.due(Instant::now()) {
                    debug!(transport_id = %shared.id, message_id = %id, "retransmit");
                    if let Err(e) = shared.physical.send_message(&peer, bytes).await {
                        debug!(transport_id = %shared.id, message_id = %id, "retransmit failed: {}", e);
                    }
                }
            }
        }
    }
    debug!(transport_id = %shared.id, "retransmit loop exited");
}

async fn expire_loop(shared: Arc<Shared>) {
    let mut closing = shared.closing.subscribe();
    let mut ticker = tokio::time::interval(shared.config.expire_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closing.changed() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let sent = shared.sent.expire(now);
                let seen = shared.seen.expire(now);
                if sent + seen > 0 {
                    debug!(transport_id = %shared.id, sent, seen, "expired ledger entries");
                }
            }
        }
    }
    debug!(transport_id = %shared.id, "expire loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    struct Link {
        a: ReliableTransport,
        b: ReliableTransport,
        a_phys_loss: crate::memory::LossControl,
        b_phys_loss: crate::memory::LossControl,
        a_out: mpsc::Receiver<Delivered>,
        b_out: mpsc::Receiver<Delivered>,
    }

    fn link(config: TransportConfig) -> Link {
        let a_peer = PeerId::random();
        let b_peer = PeerId::random();
        let (a_phys, b_phys) = MemoryTransport::pair(a_peer, b_peer, 1400);
        let a_phys_loss = a_phys.loss();
        let b_phys_loss = b_phys.loss();
        let (a_tx, a_out) = mpsc::channel(64);
        let (b_tx, b_out) = mpsc::channel(64);
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
        Link {
            a,
            b,
            a_phys_loss,
            b_phys_loss,
            a_out,
            b_out,
        }
    }

    fn fast() -> TransportConfig {
        TransportConfig {
            retransmit_duration: Duration::from_millis(20),
            send_deadline: Duration::from_millis(400),
            remember_received_duration: Duration::from_millis(400),
            expire_interval: Duration::from_millis(25),
            channel_capacity: 64,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivered>) -> Delivered {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_send_delivers_and_acks() {
        let mut l = link(fast());
        let id = l
            .a
            .send_and_wait(Bytes::from_static(b"hello"), Duration::from_secs(1))
            .await
            .unwrap();
        let got = recv(&mut l.b_out).await;
        assert_eq!(got.contents, Bytes::from_static(b"hello"));
        assert_eq!(got.from_peer, l.a.local_peer());
        assert_eq!(got.transport_id, l.b.id());
        assert_eq!(l.a.pending(), 0);
        assert!(l.a.attempts(&id).is_none());
        assert!(l.a_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lost_send_is_retransmitted() {
        let mut l = link(fast());
        l.a_phys_loss.drop_next(1);
        l.a.send_and_wait(Bytes::from_static(b"again"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(recv(&mut l.b_out).await.contents, Bytes::from_static(b"again"));
        assert_eq!(l.a_phys_loss.dropped(), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_delivers_once() {
        let mut l = link(fast());
        // drop b's first ack so a retransmits a frame b already delivered
        l.b_phys_loss.drop_next(1);
        l.a.send_and_wait(Bytes::from_static(b"once"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(recv(&mut l.b_out).await.contents, Bytes::from_static(b"once"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(l.b_out.try_recv().is_err());
        assert_eq!(l.b_phys_loss.dropped(), 1);
    }

    #[tokio::test]
    async fn test_timeout_then_sweep() {
        let l = link(fast());
        l.a_phys_loss.set_drop_all(true);
        let err = l
            .a
            .send_and_wait(Bytes::from_static(b"void"), Duration::from_millis(50))
            .await
            .unwrap_err();
        let id = match err {
            TransportError::TransportTimeout(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        // still in the ledger and being retried
        assert_eq!(l.a.pending(), 1);
        assert!(l.a.attempts(&id).unwrap_or(0) >= 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(l.a.pending(), 0);
    }

    #[tokio::test]
    async fn test_seen_ids_expire() {
        let mut l = link(fast());
        l.a.send(Bytes::from_static(b"x")).await.unwrap();
        recv(&mut l.b_out).await;
        assert_eq!(l.b.remembered(), 1);
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(l.b.remembered(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_send() {
        let l = link(fast());
        l.a.close().await.unwrap();
        assert!(matches!(
            l.a.send(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(l.a.info().status, TransportStatus::Closed);
        assert_eq!(l.b.info().status, TransportStatus::Connected);
        l.b.close().await.unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(TransportConfig::default().validate().is_ok());
        assert!(fast().validate().is_ok());

        let zero_retransmit = TransportConfig {
            retransmit_duration: Duration::ZERO,
            ..fast()
        };
        assert!(matches!(
            zero_retransmit.validate(),
            Err(TransportError::InvalidConfig(_))
        ));

        let zero_expire = TransportConfig {
            expire_interval: Duration::ZERO,
            ..fast()
        };
        assert!(zero_expire.validate().is_err());

        // ids forgotten while the sender still retransmits would be redelivered
        let short_memory = TransportConfig {
            remember_received_duration: Duration::from_millis(10),
            ..fast()
        };
        assert!(matches!(
            short_memory.validate(),
            Err(TransportError::InvalidConfig(_))
        ));
    }
}
