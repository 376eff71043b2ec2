//! In-flight and recently-seen message bookkeeping.

use bytes::Bytes;
use dashmap::DashMap;
use mesh_wire::{MessageId, PeerId};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// State of one unacknowledged send
pub struct SentState {
    /// Destination peer
    pub to_peer: PeerId,
    /// Encoded frame, resent verbatim
    pub bytes: Bytes,
    /// Entry is dropped by the sweep after this
    pub deadline: Instant,
    /// Resend count
    pub attempts: u32,
    /// Notified when the ack arrives
    pub waiter: Option<oneshot::Sender<()>>,
}

/// Sender-side ledger of messages awaiting an ack
#[derive(Default)]
pub struct SentLedger {
    entries: DashMap<MessageId, SentState>,
}

impl SentLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send
    pub fn insert(&self, id: MessageId, state: SentState) {
        self.entries.insert(id, state);
    }

    /// Remove an entry on ack; returns false for an unknown id
    pub fn ack(&self, id: &MessageId) -> bool {
        match self.entries.remove(id) {
            Some((_, mut state)) => {
                if let Some(waiter) = state.waiter.take() {
                    let _ = waiter.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Remove without notifying
    pub fn remove(&self, id: &MessageId) {
        self.entries.remove(id);
    }

    /// Frames still due for a resend at `now`
    pub fn due(&self, now: Instant) -> Vec<(MessageId, PeerId, Bytes)> {
        self.entries
            .iter_mut()
            .filter(|e| e.deadline > now)
            .map(|mut e| {
                e.attempts += 1;
                (*e.key(), e.to_peer, e.bytes.clone())
            })
            .collect()
    }

    /// Drop entries past their deadline; waiters observe a closed channel
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, state| {
            let keep = state.deadline > now;
            if !keep {
                debug!(message_id = %id, attempts = state.attempts, "giving up on unacked message");
            }
            keep
        });
        before - self.entries.len()
    }

    /// Resend count of an entry
    pub fn attempts(&self, id: &MessageId) -> Option<u32> {
        self.entries.get(id).map(|e| e.attempts)
    }

    /// Entries awaiting an ack
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receiver-side set of recently delivered message ids
#[derive(Default)]
pub struct SeenSet {
    entries: DashMap<MessageId, Instant>,
}

impl SeenSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` until `forget_at`; false if it was already present
    pub fn first_sighting(&self, id: MessageId, forget_at: Instant) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(forget_at);
                true
            }
        }
    }

    /// Forget ids whose remember window has passed
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, forget_at| *forget_at > now);
        before - self.entries.len()
    }

    /// Ids remembered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state(deadline: Instant) -> SentState {
        SentState {
            to_peer: PeerId::random(),
            bytes: Bytes::from_static(b"frame"),
            deadline,
            attempts: 0,
            waiter: None,
        }
    }

    #[tokio::test]
    async fn test_ack_notifies_waiter() {
        let ledger = SentLedger::new();
        let id = MessageId::new();
        let (tx, rx) = oneshot::channel();
        let mut s = state(Instant::now() + Duration::from_secs(1));
        s.waiter = Some(tx);
        ledger.insert(id, s);

        assert!(ledger.ack(&id));
        assert!(rx.await.is_ok());
        assert!(!ledger.ack(&id));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_due_and_expire() {
        let ledger = SentLedger::new();
        let now = Instant::now();
        let live = MessageId::new();
        let stale = MessageId::new();
        ledger.insert(live, state(now + Duration::from_secs(5)));
        ledger.insert(stale, state(now));

        let due = ledger.due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, live);
        assert_eq!(ledger.attempts(&live), Some(1));

        assert_eq!(ledger.expire(now), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_seen_set() {
        let seen = SeenSet::new();
        let now = Instant::now();
        let id = MessageId::new();
        assert!(seen.first_sighting(id, now + Duration::from_secs(1)));
        assert!(!seen.first_sighting(id, now + Duration::from_secs(1)));
        assert_eq!(seen.expire(now), 0);
        assert_eq!(seen.expire(now + Duration::from_secs(2)), 1);
        assert!(seen.first_sighting(id, now + Duration::from_secs(3)));
    }
}
