//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before a complete message was decoded
    #[error("short buffer")]
    ShortBuffer,

    /// Bytes left over after the registered struct was decoded
    #[error("trailing data: {0} bytes")]
    TrailingData(usize),

    /// No type registered for this prefix
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// Type was never registered with the serializer
    #[error("type not registered: {0}")]
    UnregisteredType(&'static str),

    /// Body does not decode as the registered struct
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Struct could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// Fragment fields are inconsistent
    #[error("invalid fragment: {0}")]
    InvalidFragment(String),
}
