//! Fragmentation and reassembly of user payloads.
//!
//! A payload is split into [`UserMessage`] fragments no larger than the next
//! hop allows. Fragments share a [`MessageId`] and are reassembled by index,
//! so arrival order does not matter.

use crate::error::WireError;
use crate::ids::MessageId;
use crate::messages::{MessageBase, UserMessage};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Largest fragment count a message may carry
pub const MAX_FRAGMENTS: u32 = 1 << 16;

/// Split `contents` into fragments of at most `max_len` bytes.
///
/// An empty payload still yields one (empty) fragment so the receiver
/// observes the message.
pub fn fragment(
    base: MessageBase,
    message_id: MessageId,
    contents: &Bytes,
    max_len: usize,
) -> Result<Vec<UserMessage>, WireError> {
    if max_len == 0 {
        return Err(WireError::InvalidFragment("zero fragment size".to_string()));
    }

    let total = if contents.is_empty() {
        1
    } else {
        (contents.len() + max_len - 1) / max_len
    };
    let count = u32::try_from(total)
        .ok()
        .filter(|c| *c <= MAX_FRAGMENTS)
        .ok_or_else(|| WireError::InvalidFragment(format!("{} fragments", total)))?;

    let mut fragments = Vec::with_capacity(total);
    for index in 0..count {
        let start = index as usize * max_len;
        let end = std::cmp::min(start + max_len, contents.len());
        let mut frag_base = base;
        if index > 0 {
            frag_base.nonce = rand::random();
        }
        fragments.push(UserMessage {
            base: frag_base,
            message_id,
            index,
            count,
            contents: contents.slice(start..end),
        });
    }

    Ok(fragments)
}

/// A fully reassembled payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Envelope of the fragment that completed the message
    pub base: MessageBase,
    /// Shared message id
    pub message_id: MessageId,
    /// Concatenated contents
    pub contents: Bytes,
}

struct Partial {
    count: u32,
    fragments: BTreeMap<u32, Bytes>,
    started: Instant,
}

/// Buffers fragments until every index of a message is present
pub struct Reassembler {
    partials: HashMap<MessageId, Partial>,
    max_fragments: u32,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_max_fragments(MAX_FRAGMENTS)
    }
}

impl Reassembler {
    /// Create an empty reassembler accepting up to [`MAX_FRAGMENTS`] per message
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty reassembler with its own fragment cap
    pub fn with_max_fragments(max_fragments: u32) -> Self {
        Self {
            partials: HashMap::new(),
            max_fragments,
        }
    }

    /// Add a fragment; returns the payload once all fragments are present.
    pub fn insert(&mut self, msg: UserMessage) -> Result<Option<Reassembled>, WireError> {
        self.insert_at(msg, Instant::now())
    }

    /// Add a fragment observed at `now`
    pub fn insert_at(
        &mut self,
        msg: UserMessage,
        now: Instant,
    ) -> Result<Option<Reassembled>, WireError> {
        if msg.count == 0 {
            return Err(WireError::InvalidFragment("count is zero".to_string()));
        }
        if msg.count > self.max_fragments {
            return Err(WireError::InvalidFragment(format!(
                "count {} above limit {}",
                msg.count, self.max_fragments
            )));
        }
        if msg.index >= msg.count {
            return Err(WireError::InvalidFragment(format!(
                "index {} >= count {}",
                msg.index, msg.count
            )));
        }
        if let Some(existing) = self.partials.get(&msg.message_id) {
            if existing.count != msg.count {
                return Err(WireError::InvalidFragment(format!(
                    "count {} disagrees with {} for {}",
                    msg.count, existing.count, msg.message_id
                )));
            }
        }

        if msg.count == 1 {
            return Ok(Some(Reassembled {
                base: msg.base,
                message_id: msg.message_id,
                contents: msg.contents,
            }));
        }

        let partial = self
            .partials
            .entry(msg.message_id)
            .or_insert_with(|| Partial {
                count: msg.count,
                fragments: BTreeMap::new(),
                started: now,
            });

        if partial.fragments.contains_key(&msg.index) {
            debug!(message_id = %msg.message_id, index = msg.index, "duplicate fragment ignored");
            return Ok(None);
        }
        partial.fragments.insert(msg.index, msg.contents);

        if (partial.fragments.len() as u64) < u64::from(partial.count) {
            return Ok(None);
        }

        let partial = match self.partials.remove(&msg.message_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        let total_len = partial.fragments.values().map(Bytes::len).sum();
        let mut contents = BytesMut::with_capacity(total_len);
        for piece in partial.fragments.into_values() {
            contents.extend_from_slice(&piece);
        }

        Ok(Some(Reassembled {
            base: msg.base,
            message_id: msg.message_id,
            contents: contents.freeze(),
        }))
    }

    /// Drop partial messages started more than `timeout` before `now`
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> usize {
        let before = self.partials.len();
        self.partials
            .retain(|_, p| now.saturating_duration_since(p.started) < timeout);
        before - self.partials.len()
    }

    /// Number of incomplete messages
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PeerId, RouteId};

    fn base() -> MessageBase {
        MessageBase::new(RouteId::new(), false, PeerId::random())
    }

    #[test]
    fn test_fragment_sizes() {
        let payload = Bytes::from(vec![7u8; 1000]);
        let frags = fragment(base(), MessageId::new(), &payload, 300).unwrap();
        assert_eq!(frags.len(), 4);
        assert!(frags.iter().all(|f| f.count == 4));
        assert_eq!(frags[3].contents.len(), 100);
        assert!(frags.iter().all(|f| f.contents.len() <= 300));
    }

    #[test]
    fn test_empty_payload_one_fragment() {
        let frags = fragment(base(), MessageId::new(), &Bytes::new(), 64).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].count, 1);

        let mut r = Reassembler::new();
        let done = r.insert(frags[0].clone()).unwrap().unwrap();
        assert!(done.contents.is_empty());
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let payload: Bytes = (0..=255u8).cycle().take(2_000).collect::<Vec<_>>().into();
        let id = MessageId::new();
        let mut frags = fragment(base(), id, &payload, 170).unwrap();
        frags.reverse();
        frags.swap(1, 5);

        let mut r = Reassembler::new();
        let mut result = None;
        for (i, f) in frags.into_iter().enumerate() {
            let out = r.insert(f).unwrap();
            if out.is_some() {
                assert!(result.is_none(), "delivered twice at fragment {}", i);
                result = out;
            }
        }
        let done = result.unwrap();
        assert_eq!(done.message_id, id);
        assert_eq!(done.contents, payload);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let payload = Bytes::from_static(b"abcdefghij");
        let frags = fragment(base(), MessageId::new(), &payload, 4).unwrap();
        let mut r = Reassembler::new();
        assert!(r.insert(frags[0].clone()).unwrap().is_none());
        assert!(r.insert(frags[0].clone()).unwrap().is_none());
        assert!(r.insert(frags[1].clone()).unwrap().is_none());
        let done = r.insert(frags[2].clone()).unwrap().unwrap();
        assert_eq!(done.contents, payload);
    }

    #[test]
    fn test_invalid_fragments() {
        let mut r = Reassembler::new();
        let mut msg = fragment(base(), MessageId::new(), &Bytes::from_static(b"xyz"), 1)
            .unwrap()
            .remove(0);

        let mut bad = msg.clone();
        bad.index = 3;
        assert!(matches!(r.insert(bad), Err(WireError::InvalidFragment(_))));

        let mut zero = msg.clone();
        zero.count = 0;
        zero.index = 0;
        assert!(matches!(r.insert(zero), Err(WireError::InvalidFragment(_))));

        assert!(r.insert(msg.clone()).unwrap().is_none());
        msg.index = 1;
        msg.count = 5;
        assert!(matches!(r.insert(msg), Err(WireError::InvalidFragment(_))));
    }

    #[test]
    fn test_oversized_count_rejected() {
        let mut msg = fragment(base(), MessageId::new(), &Bytes::from_static(b"x"), 8)
            .unwrap()
            .remove(0);
        msg.count = u32::MAX;
        let mut r = Reassembler::new();
        assert!(matches!(r.insert(msg.clone()), Err(WireError::InvalidFragment(_))));
        assert_eq!(r.pending(), 0);

        let mut small = Reassembler::with_max_fragments(4);
        msg.count = 5;
        assert!(matches!(small.insert(msg.clone()), Err(WireError::InvalidFragment(_))));
        msg.count = 4;
        assert!(small.insert(msg).unwrap().is_none());
    }

    #[test]
    fn test_fragment_refuses_too_many_pieces() {
        let payload = Bytes::from(vec![0u8; MAX_FRAGMENTS as usize + 1]);
        assert!(matches!(
            fragment(base(), MessageId::new(), &payload, 1),
            Err(WireError::InvalidFragment(_))
        ));
    }

    #[test]
    fn test_single_fragment_with_conflicting_count_rejected() {
        let id = MessageId::new();
        let frags = fragment(base(), id, &Bytes::from_static(b"abcd"), 2).unwrap();
        let mut r = Reassembler::new();
        assert!(r.insert(frags[0].clone()).unwrap().is_none());

        let mut single = frags[1].clone();
        single.index = 0;
        single.count = 1;
        assert!(matches!(r.insert(single), Err(WireError::InvalidFragment(_))));
        assert_eq!(r.pending(), 1);

        let done = r.insert(frags[1].clone()).unwrap().unwrap();
        assert_eq!(done.contents, Bytes::from_static(b"abcd"));
    }

    #[test]
    fn test_expire_partials() {
        let frags = fragment(base(), MessageId::new(), &Bytes::from_static(b"abcd"), 2).unwrap();
        let mut r = Reassembler::new();
        let t0 = Instant::now();
        r.insert_at(frags[0].clone(), t0).unwrap();
        assert_eq!(r.expire(Duration::from_secs(5), t0 + Duration::from_secs(1)), 0);
        assert_eq!(r.expire(Duration::from_secs(5), t0 + Duration::from_secs(6)), 1);
        assert_eq!(r.pending(), 0);
    }
}
