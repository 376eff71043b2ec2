//! Wire protocol for mesh: serializer, identifiers, messages and fragmentation.
//!
//! Every message on the wire is a single datagram of the form
//!
//! ```text
//! +-----------+----------------------------+
//! | u8 prefix | canonical CBOR struct body |
//! +-----------+----------------------------+
//! ```
//!
//! ## Layers
//!
//! - **Transport frames** (`SendMessage`, `ReplyMessage`): one hop, acked and
//!   deduplicated by the reliable transport
//! - **Routed messages** (`UserMessage` and route control): carried inside a
//!   `SendMessage`, rewritten at every hop
//! - **Application messages**: opaque to the mesh, carried in user payloads
//! - **Control RPC**: manager procedures over UDP

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod chunk;
pub mod codec;
pub mod control;
pub mod error;
pub mod ids;
pub mod messages;

// Re-export main types
pub use app::{AppMessage, AppRequest, AppResponse, ProxyMessage, APP};
pub use chunk::{fragment, Reassembled, Reassembler, MAX_FRAGMENTS};
pub use codec::{decode_body, encoded_len, Serializer};
pub use control::{
    RouteRule, RpcCall, RpcErrorKind, RpcFailure, RpcMessage, RpcReply, RpcRequest, RpcResponse,
    TransportInfo, TransportStatus, RPC,
};
pub use error::WireError;
pub use ids::{MessageId, PeerId, RouteId, TransportId, PEER_ID_LEN};
pub use messages::{
    max_content_length, DeleteRouteMessage, MessageBase, RefreshRouteMessage, ReplyMessage,
    RoutedMessage, SendMessage, SetRouteMessage, SetRouteReply, TransportFrame, UserMessage,
    ROUTED, TRANSPORT,
};
