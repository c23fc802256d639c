//! Server-side WebSocket upgrade for legacy and current protocol revisions.
//!
//! This crate answers the HTTP upgrade handshake for draft-75, draft-76 and the
//! draft-07/08/13 family, then exchanges messages in the framing the client negotiated.
//!
//! Fragmented messages, ping/pong, 64-bit payload lengths and extensions are not
//! handled; receiving any of them ends the connection with an error.
pub mod codec;
pub(crate) mod connection;
pub mod config;
pub mod errors;
pub mod handshake;

pub use codec::Message;
pub use config::AcceptorConfig;
pub use connection::server::{Acceptor, DEFAULT_MAX_REQUEST_SIZE, DeclineReason, Upgrade};
pub use connection::{CloseHandle, Connection, ConnectionState, WebSocketStream};
pub use errors::{CodecError, ConfigError, ConnectionError, HandshakeError};
pub use handshake::{
    AllowedPaths, HandshakeRequest, HandshakeResponse, PathPattern, ProtocolRevision, negotiate,
};
