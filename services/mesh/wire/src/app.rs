//! Application-level messages carried opaquely inside user payloads.

use crate::codec::Serializer;
use crate::error::WireError;
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Prefix of [`AppRequest`]
pub const APP_REQUEST_PREFIX: u8 = 0x20;
/// Prefix of [`AppResponse`]
pub const APP_RESPONSE_PREFIX: u8 = 0x21;
/// Prefix of [`ProxyMessage`]
pub const PROXY_MESSAGE_PREFIX: u8 = 0x22;

/// Client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRequest {
    /// Correlates the response
    pub request_id: u64,
    /// Request body
    pub payload: Bytes,
}

/// Server response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppResponse {
    /// Copied from the request
    pub request_id: u64,
    /// Response body
    pub payload: Bytes,
    /// Server-side failure, if any
    pub error: Option<String>,
}

/// One chunk of a multiplexed external connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMessage {
    /// Bytes read from the connection
    pub data: Bytes,
    /// Remote address keying the sub-connection
    pub remote_addr: String,
    /// Close the sub-connection after `data`
    pub need_close: bool,
}

/// Any application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    /// Request
    Request(AppRequest),
    /// Response
    Response(AppResponse),
    /// Proxy traffic
    Proxy(ProxyMessage),
}

impl From<AppRequest> for AppMessage {
    fn from(msg: AppRequest) -> Self {
        AppMessage::Request(msg)
    }
}

impl From<AppResponse> for AppMessage {
    fn from(msg: AppResponse) -> Self {
        AppMessage::Response(msg)
    }
}

impl From<ProxyMessage> for AppMessage {
    fn from(msg: ProxyMessage) -> Self {
        AppMessage::Proxy(msg)
    }
}

/// Serializer for application messages
pub static APP: Lazy<Serializer<AppMessage>> = Lazy::new(|| {
    Serializer::new()
        .with::<AppRequest>(APP_REQUEST_PREFIX)
        .with::<AppResponse>(APP_RESPONSE_PREFIX)
        .with::<ProxyMessage>(PROXY_MESSAGE_PREFIX)
});

impl AppMessage {
    /// Encode with the variant's prefix
    pub fn encode(&self) -> Result<Bytes, WireError> {
        match self {
            AppMessage::Request(m) => APP.encode(m),
            AppMessage::Response(m) => APP.encode(m),
            AppMessage::Proxy(m) => APP.encode(m),
        }
    }

    /// Decode any application message
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        APP.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_message() {
        let msg = AppMessage::Proxy(ProxyMessage {
            data: Bytes::from_static(b"GET / HTTP/1.1\r\n"),
            remote_addr: "10.0.0.7:51234".to_string(),
            need_close: true,
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], PROXY_MESSAGE_PREFIX);
        assert_eq!(AppMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_routed_prefix_not_app() {
        assert!(matches!(
            AppMessage::decode(&[0x01, 0xa0]),
            Err(WireError::UnknownMessageType(0x01))
        ));
    }
}
