//! Prefix-tagged message serializer.
//!
//! Every message on the wire is a one-byte type prefix followed by the
//! canonical CBOR encoding of the registered struct:
//!
//! ```text
//! +-----------+-------------------------------+
//! | u8 prefix | CBOR body (self-delimiting)   |
//! +-----------+-------------------------------+
//! ```
//!
//! A [`Serializer`] is parameterised over the sum type `M` its registered
//! structs convert into, so decoding yields a tagged union that callers
//! dispatch on with an exhaustive `match`.

use crate::error::WireError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;

type DecodeFn<M> = fn(&[u8]) -> Result<M, WireError>;

struct Registration<M> {
    decode: DecodeFn<M>,
    type_name: &'static str,
}

/// Registry of one-byte prefixes to message structs
pub struct Serializer<M> {
    by_prefix: HashMap<u8, Registration<M>>,
    by_type: HashMap<TypeId, u8>,
}

impl<M: 'static> Serializer<M> {
    /// Create an empty serializer
    pub fn new() -> Self {
        Self {
            by_prefix: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    /// Associate `T` with `prefix`.
    ///
    /// # Panics
    ///
    /// Panics if the prefix or the type is already registered. Registration
    /// happens once at startup, so a clash is a build-time mistake.
    pub fn register<T>(&mut self, prefix: u8) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Into<M> + 'static,
    {
        if let Some(existing) = self.by_prefix.get(&prefix) {
            panic!(
                "prefix {:#04x} already registered for {}",
                prefix, existing.type_name
            );
        }
        if let Some(existing) = self.by_type.get(&TypeId::of::<T>()) {
            panic!(
                "{} already registered with prefix {:#04x}",
                type_name::<T>(),
                existing
            );
        }

        self.by_prefix.insert(
            prefix,
            Registration {
                decode: decode_into::<T, M>,
                type_name: type_name::<T>(),
            },
        );
        self.by_type.insert(TypeId::of::<T>(), prefix);
        self
    }

    /// Builder form of [`Serializer::register`]
    pub fn with<T>(mut self, prefix: u8) -> Self
    where
        T: Serialize + DeserializeOwned + Into<M> + 'static,
    {
        self.register::<T>(prefix);
        self
    }

    /// Prefix registered for `T`, if any
    pub fn prefix_of<T: 'static>(&self) -> Option<u8> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Encode a registered struct with its prefix
    pub fn encode<T: Serialize + 'static>(&self, msg: &T) -> Result<Bytes, WireError> {
        let prefix = self
            .prefix_of::<T>()
            .ok_or(WireError::UnregisteredType(type_name::<T>()))?;

        let mut buf = Vec::with_capacity(64);
        buf.push(prefix);
        ciborium::into_writer(msg, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;

        Ok(Bytes::from(buf))
    }

    /// Decode bytes into the sum type
    pub fn decode(&self, bytes: &[u8]) -> Result<M, WireError> {
        let (&prefix, body) = bytes.split_first().ok_or(WireError::ShortBuffer)?;
        let registration = self
            .by_prefix
            .get(&prefix)
            .ok_or(WireError::UnknownMessageType(prefix))?;
        (registration.decode)(body)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.by_prefix.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty()
    }
}

impl<M: 'static> Default for Serializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Serializer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self
            .by_prefix
            .iter()
            .map(|(prefix, reg)| (*prefix, reg.type_name))
            .collect();
        entries.sort();
        f.debug_struct("Serializer")
            .field("registered", &entries)
            .finish()
    }
}

fn decode_into<T, M>(body: &[u8]) -> Result<M, WireError>
where
    T: DeserializeOwned + Into<M>,
{
    decode_body::<T>(body).map(Into::into)
}

/// Decode a CBOR body that must fill `body` exactly
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    let mut cursor = Cursor::new(body);
    let value: T = ciborium::from_reader(&mut cursor).map_err(|e| match e {
        ciborium::de::Error::Io(_) => WireError::ShortBuffer,
        other => WireError::Malformed(other.to_string()),
    })?;

    let consumed = cursor.position() as usize;
    if consumed != body.len() {
        return Err(WireError::TrailingData(body.len() - consumed));
    }

    Ok(value)
}

/// Encoded length of a struct body without prefix
pub fn encoded_len<T: Serialize>(value: &T) -> Result<usize, WireError> {
    let mut buf = Vec::with_capacity(64);
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    #[derive(Debug, PartialEq)]
    enum Test {
        Ping(Ping),
        Pong(Pong),
    }

    impl From<Ping> for Test {
        fn from(p: Ping) -> Self {
            Test::Ping(p)
        }
    }

    impl From<Pong> for Test {
        fn from(p: Pong) -> Self {
            Test::Pong(p)
        }
    }

    fn serializer() -> Serializer<Test> {
        Serializer::new().with::<Ping>(1).with::<Pong>(2)
    }

    #[test]
    fn test_encode_prefix() {
        let ser = serializer();
        let bytes = ser.encode(&Pong { seq: 7 }).unwrap();
        assert_eq!(bytes[0], 2);
        assert_eq!(ser.decode(&bytes).unwrap(), Test::Pong(Pong { seq: 7 }));
    }

    #[test]
    fn test_decode_dispatch() {
        let ser = serializer();
        let ping = Ping {
            seq: 1,
            note: "hello".to_string(),
        };
        let bytes = ser.encode(&ping).unwrap();
        match ser.decode(&bytes).unwrap() {
            Test::Ping(decoded) => assert_eq!(decoded, ping),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_prefix() {
        let ser = serializer();
        assert_eq!(
            ser.decode(&[9, 0xa0]).unwrap_err(),
            WireError::UnknownMessageType(9)
        );
        assert_eq!(ser.decode(&[]).unwrap_err(), WireError::ShortBuffer);
    }

    #[test]
    fn test_short_and_trailing() {
        let ser = serializer();
        let bytes = ser
            .encode(&Ping {
                seq: 3,
                note: "abcdef".to_string(),
            })
            .unwrap();

        let short = &bytes[..bytes.len() - 2];
        assert_eq!(ser.decode(short).unwrap_err(), WireError::ShortBuffer);

        let mut long = bytes.to_vec();
        long.extend_from_slice(&[0, 0, 0]);
        assert_eq!(ser.decode(&long).unwrap_err(), WireError::TrailingData(3));
    }

    #[test]
    fn test_unregistered_type() {
        let ser: Serializer<Test> = Serializer::new().with::<Ping>(1);
        assert!(matches!(
            ser.encode(&Pong { seq: 1 }),
            Err(WireError::UnregisteredType(_))
        ));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_prefix_panics() {
        let _ = Serializer::<Test>::new().with::<Ping>(1).with::<Pong>(1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_type_panics() {
        let _ = Serializer::<Test>::new().with::<Ping>(1).with::<Ping>(2);
    }
}
