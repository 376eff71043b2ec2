//! Routed and transport-level messages.
//!
//! Two serializers live here. [`ROUTED`] covers everything a node forwards
//! along a route (user fragments and route control). [`TRANSPORT`] covers the
//! reliable transport's own envelope and ack, which wrap routed bytes for a
//! single hop.

use crate::codec::Serializer;
use crate::error::WireError;
use crate::ids::{MessageId, PeerId, RouteId};
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Prefix of [`UserMessage`]
pub const USER_MESSAGE_PREFIX: u8 = 1;
/// Prefix of [`SetRouteMessage`]
pub const SET_ROUTE_PREFIX: u8 = 2;
/// Prefix of [`RefreshRouteMessage`]
pub const REFRESH_ROUTE_PREFIX: u8 = 3;
/// Prefix of [`DeleteRouteMessage`]
pub const DELETE_ROUTE_PREFIX: u8 = 4;
/// Prefix of [`SetRouteReply`]
pub const SET_ROUTE_REPLY_PREFIX: u8 = 5;

/// Prefix of [`SendMessage`]
pub const SEND_MESSAGE_PREFIX: u8 = 1;
/// Prefix of [`ReplyMessage`]
pub const REPLY_MESSAGE_PREFIX: u8 = 2;

/// Headroom for the byte-string length header of a non-empty payload
const LENGTH_HEADER_GROWTH: usize = 4;

/// Envelope common to every routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBase {
    /// Route id the receiver looks up
    pub send_route_id: RouteId,
    /// Follow the backward side of the receiver's rule
    pub send_back: bool,
    /// Peer that put the message on this hop
    pub from_peer_id: PeerId,
    /// Regenerated at every hop
    pub nonce: u64,
}

impl MessageBase {
    /// Create a base with a fresh nonce
    pub fn new(send_route_id: RouteId, send_back: bool, from_peer_id: PeerId) -> Self {
        Self {
            send_route_id,
            send_back,
            from_peer_id,
            nonce: rand::random(),
        }
    }

    /// Rewrite for the next hop
    pub fn rewrite(&mut self, send_route_id: RouteId, from_peer_id: PeerId) {
        self.send_route_id = send_route_id;
        self.from_peer_id = from_peer_id;
        self.nonce = rand::random();
    }
}

/// One fragment of an application payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Routing envelope
    pub base: MessageBase,
    /// Shared by every fragment of one payload
    pub message_id: MessageId,
    /// Position of this fragment
    pub index: u32,
    /// Total fragments
    pub count: u32,
    /// Fragment bytes
    pub contents: Bytes,
}

/// Install a route at the node where the message terminates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRouteMessage {
    /// Routing envelope
    pub base: MessageBase,
    /// Id to install
    pub set_route_id: RouteId,
    /// Correlates the [`SetRouteReply`]
    pub confirm_route_id: RouteId,
    /// Forward next peer, zero to terminate
    pub forward_to_peer_id: PeerId,
    /// Id written on forward traffic
    pub forward_rewrite_route_id: RouteId,
    /// Backward next peer, zero to terminate
    pub backward_to_peer_id: PeerId,
    /// Id written on backward traffic
    pub backward_rewrite_route_id: RouteId,
    /// Requested lifetime; the receiver clamps it
    pub duration_hint_ms: Option<u64>,
}

/// Extend the lifetime of a route at every hop it crosses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRouteMessage {
    /// Routing envelope
    pub base: MessageBase,
    /// Correlates the [`SetRouteReply`]
    pub confirm_route_id: RouteId,
    /// Requested lifetime; the receiver clamps it
    pub duration_hint_ms: Option<u64>,
}

/// Remove a route at every hop it crosses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRouteMessage {
    /// Routing envelope
    pub base: MessageBase,
}

/// Acknowledges a set or refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRouteReply {
    /// Routing envelope
    pub base: MessageBase,
    /// Copied from the request
    pub confirm_route_id: RouteId,
}

/// Any message a node may forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedMessage {
    /// Payload fragment
    User(UserMessage),
    /// Route install
    SetRoute(SetRouteMessage),
    /// Route refresh
    RefreshRoute(RefreshRouteMessage),
    /// Route removal
    DeleteRoute(DeleteRouteMessage),
    /// Set/refresh acknowledgement
    SetRouteReply(SetRouteReply),
}

macro_rules! routed_from {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RoutedMessage {
                fn from(msg: $ty) -> Self {
                    RoutedMessage::$variant(msg)
                }
            }
        )*
    };
}

routed_from!(
    UserMessage => User,
    SetRouteMessage => SetRoute,
    RefreshRouteMessage => RefreshRoute,
    DeleteRouteMessage => DeleteRoute,
    SetRouteReply => SetRouteReply,
);

/// Serializer for routed messages
pub static ROUTED: Lazy<Serializer<RoutedMessage>> = Lazy::new(|| {
    Serializer::new()
        .with::<UserMessage>(USER_MESSAGE_PREFIX)
        .with::<SetRouteMessage>(SET_ROUTE_PREFIX)
        .with::<RefreshRouteMessage>(REFRESH_ROUTE_PREFIX)
        .with::<DeleteRouteMessage>(DELETE_ROUTE_PREFIX)
        .with::<SetRouteReply>(SET_ROUTE_REPLY_PREFIX)
});

impl RoutedMessage {
    /// Routing envelope of any variant
    pub fn base(&self) -> &MessageBase {
        match self {
            RoutedMessage::User(m) => &m.base,
            RoutedMessage::SetRoute(m) => &m.base,
            RoutedMessage::RefreshRoute(m) => &m.base,
            RoutedMessage::DeleteRoute(m) => &m.base,
            RoutedMessage::SetRouteReply(m) => &m.base,
        }
    }

    /// Mutable routing envelope
    pub fn base_mut(&mut self) -> &mut MessageBase {
        match self {
            RoutedMessage::User(m) => &mut m.base,
            RoutedMessage::SetRoute(m) => &mut m.base,
            RoutedMessage::RefreshRoute(m) => &mut m.base,
            RoutedMessage::DeleteRoute(m) => &mut m.base,
            RoutedMessage::SetRouteReply(m) => &mut m.base,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RoutedMessage::User(_) => "user",
            RoutedMessage::SetRoute(_) => "set_route",
            RoutedMessage::RefreshRoute(_) => "refresh_route",
            RoutedMessage::DeleteRoute(_) => "delete_route",
            RoutedMessage::SetRouteReply(_) => "set_route_reply",
        }
    }

    /// Encode with the variant's prefix
    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            RoutedMessage::User(m) => ROUTED.encode(m),
            RoutedMessage::SetRoute(m) => ROUTED.encode(m),
            RoutedMessage::RefreshRoute(m) => ROUTED.encode(m),
            RoutedMessage::DeleteRoute(m) => ROUTED.encode(m),
            RoutedMessage::SetRouteReply(m) => ROUTED.encode(m),
        }
    }

    /// Decode any routed message
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        ROUTED.decode(bytes)
    }
}

/// Reliable-transport envelope carrying routed bytes for one hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    /// Ack and dedup key
    pub message_id: MessageId,
    /// Sender of this hop
    pub from_peer_id: PeerId,
    /// Encoded routed message
    pub contents: Bytes,
}

/// Reliable-transport acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    /// Id of the acknowledged [`SendMessage`]
    pub message_id: MessageId,
}

/// Anything read off a physical transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// Data to deliver and ack
    Send(SendMessage),
    /// Ack for an earlier send
    Reply(ReplyMessage),
}

impl From<SendMessage> for TransportFrame {
    fn from(msg: SendMessage) -> Self {
        TransportFrame::Send(msg)
    }
}

impl From<ReplyMessage> for TransportFrame {
    fn from(msg: ReplyMessage) -> Self {
        TransportFrame::Reply(msg)
    }
}

/// Serializer for transport frames
pub static TRANSPORT: Lazy<Serializer<TransportFrame>> = Lazy::new(|| {
    Serializer::new()
        .with::<SendMessage>(SEND_MESSAGE_PREFIX)
        .with::<ReplyMessage>(REPLY_MESSAGE_PREFIX)
});

impl TransportFrame {
    /// Encode with the variant's prefix
    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            TransportFrame::Send(m) => TRANSPORT.encode(m),
            TransportFrame::Reply(m) => TRANSPORT.encode(m),
        }
    }

    /// Decode a frame
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        TRANSPORT.decode(bytes)
    }
}

/// Bytes a [`SendMessage`] adds around its contents, prefix included
pub fn send_envelope_overhead() -> Result<usize, WireError> {
    let empty = SendMessage {
        message_id: MessageId::new(),
        from_peer_id: PeerId([0xff; crate::ids::PEER_ID_LEN]),
        contents: Bytes::new(),
    };
    Ok(TRANSPORT.encode(&empty)?.len() + LENGTH_HEADER_GROWTH)
}

/// Bytes a [`UserMessage`] adds around its contents, prefix included
pub fn user_envelope_overhead() -> Result<usize, WireError> {
    let empty = UserMessage {
        base: MessageBase {
            send_route_id: RouteId::new(),
            send_back: false,
            from_peer_id: PeerId([0xff; crate::ids::PEER_ID_LEN]),
            nonce: u64::MAX,
        },
        message_id: MessageId::new(),
        index: u32::MAX,
        count: u32::MAX,
        contents: Bytes::new(),
    };
    Ok(ROUTED.encode(&empty)?.len() + LENGTH_HEADER_GROWTH)
}

/// Largest fragment that fits one physical datagram of `mtu` bytes
pub fn max_content_length(mtu: usize) -> Result<usize, WireError> {
    let overhead = send_envelope_overhead()? + user_envelope_overhead()?;
    match mtu.checked_sub(overhead) {
        Some(room) if room > 0 => Ok(room),
        _ => Err(WireError::Encode(format!(
            "mtu {} leaves no room after {} bytes of envelope",
            mtu, overhead
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MessageBase {
        MessageBase::new(RouteId::new(), false, PeerId::random())
    }

    #[test]
    fn test_routed_dispatch() {
        let msg = RoutedMessage::SetRoute(SetRouteMessage {
            base: base(),
            set_route_id: RouteId::new(),
            confirm_route_id: RouteId::new(),
            forward_to_peer_id: PeerId::random(),
            forward_rewrite_route_id: RouteId::new(),
            backward_to_peer_id: PeerId::ZERO,
            backward_rewrite_route_id: RouteId::NIL,
            duration_hint_ms: Some(5_000),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], SET_ROUTE_PREFIX);
        assert_eq!(RoutedMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_rewrite_changes_nonce() {
        let mut b = base();
        let before = b.nonce;
        let next = RouteId::new();
        let me = PeerId::random();
        // a collision is possible in principle; two draws make it negligible
        b.rewrite(next, me);
        if b.nonce == before {
            b.rewrite(next, me);
        }
        assert_eq!(b.send_route_id, next);
        assert_eq!(b.from_peer_id, me);
        assert_ne!(b.nonce, before);
    }

    #[test]
    fn test_transport_prefixes_distinct_from_routed() {
        let ack = TransportFrame::Reply(ReplyMessage {
            message_id: MessageId::new(),
        });
        let bytes = ack.encode().unwrap();
        assert_eq!(bytes[0], REPLY_MESSAGE_PREFIX);
        assert_eq!(TransportFrame::decode(&bytes).unwrap(), ack);
    }

    #[test]
    fn test_fragment_fits_mtu() {
        let mtu = 512;
        let room = max_content_length(mtu).unwrap();
        let user = UserMessage {
            base: base(),
            message_id: MessageId::new(),
            index: 7,
            count: 9,
            contents: Bytes::from(vec![0xaa; room]),
        };
        let routed = ROUTED.encode(&user).unwrap();
        let frame = TRANSPORT
            .encode(&SendMessage {
                message_id: MessageId::new(),
                from_peer_id: PeerId::random(),
                contents: routed,
            })
            .unwrap();
        assert!(frame.len() <= mtu, "{} > {}", frame.len(), mtu);
    }

    #[test]
    fn test_tiny_mtu_rejected() {
        assert!(max_content_length(16).is_err());
    }
}
