//! Identifiers shared by every mesh component.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Length of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 32;

/// Public-key identifier of a node. The all-zero value means "no peer".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; PEER_ID_LEN]);

impl PeerId {
    /// The zero peer, used as "terminate here" in route rules
    pub const ZERO: PeerId = PeerId([0u8; PEER_ID_LEN]);

    /// Generate a fresh random identifier
    pub fn random() -> Self {
        loop {
            let bytes: [u8; PEER_ID_LEN] = rand::random();
            if bytes != [0u8; PEER_ID_LEN] {
                return PeerId(bytes);
            }
        }
    }

    /// Whether this is the zero peer
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; PEER_ID_LEN]
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Short hex prefix for log lines
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PeerIdVisitor;

        impl<'de> Visitor<'de> for PeerIdVisitor {
            type Value = PeerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} bytes", PEER_ID_LEN)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<PeerId, E> {
                let bytes: [u8; PEER_ID_LEN] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(PeerId(bytes))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<PeerId, A::Error> {
                let mut bytes = [0u8; PEER_ID_LEN];
                for (i, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(PeerId(bytes))
            }
        }

        deserializer.deserialize_bytes(PeerIdVisitor)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// The nil identifier
            pub const NIL: $name = $name(Uuid::nil());

            /// Generate a fresh random identifier
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            /// Whether this is the nil identifier
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

uuid_id!(
    /// Locally scoped name of an entry in a node's forwarding table
    RouteId
);
uuid_id!(
    /// Identifies one (possibly fragmented) message
    MessageId
);
uuid_id!(
    /// Identifies one end of a point-to-point transport
    TransportId
);
