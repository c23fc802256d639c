//! Error types for the hybi-upgrade crate.

use http::StatusCode;
use thiserror::Error;

/// Body sent with the 400 response when a draft-76 client omits its challenge keys.
pub const OLD_PROTOCOL_MESSAGE: &str = "Client using old/invalid protocol implementation";

/// Errors produced while negotiating the upgrade.
///
/// Every variant except [`HandshakeError::NotAnUpgradeRequest`] is fatal to the upgrade
/// attempt: the peer gets an HTTP error response and the stream is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The request does not ask for a WebSocket upgrade; serve it as plain HTTP.
    #[error("Not a WebSocket upgrade request")]
    NotAnUpgradeRequest,
    /// `Sec-WebSocket-Version` names a revision this crate does not speak.
    #[error("Version not supported: {0}")]
    UnsupportedVersion(String),
    /// A draft-76 request is missing `Sec-WebSocket-Key1` or `Sec-WebSocket-Key2`.
    #[error("Client using old/invalid protocol implementation")]
    MissingChallengeKeys,
    /// A draft-76 key is not an integral multiple of its space count.
    #[error("Malformed challenge key: {0}")]
    MalformedChallengeKey(String),
    /// The caller negotiated a draft-76 request without supplying the 8 body bytes.
    #[error("Missing draft-76 challenge body")]
    MissingChallengeBody,
    /// A draft-07/08/13 request has no `Sec-WebSocket-Key`.
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,
    /// A draft-75/76 request has no `Host` to build the location from.
    #[error("Missing Host header")]
    MissingHost,
}

impl HandshakeError {
    /// The status and plain-text body to answer a failed upgrade with.
    ///
    /// Returns `None` for [`HandshakeError::NotAnUpgradeRequest`], which is a routing
    /// decision rather than a failure.
    #[must_use]
    pub fn rejection(&self) -> Option<(StatusCode, String)> {
        match self {
            HandshakeError::NotAnUpgradeRequest => None,
            HandshakeError::MissingChallengeKeys => {
                Some((StatusCode::BAD_REQUEST, OLD_PROTOCOL_MESSAGE.to_owned()))
            }
            other => Some((StatusCode::BAD_REQUEST, other.to_string())),
        }
    }
}

/// Errors produced by the frame codecs. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A draft-07/08/13 client frame arrived without the MASK bit.
    #[error("Client sent unmasked data")]
    UnmaskedClientFrame,
    /// The opcode in the frame is not one this crate handles.
    #[error("Received unknown opcode {0}")]
    UnknownOpcode(u8),
    /// FIN was clear or a continuation frame arrived.
    #[error("Fragmentation not supported")]
    FragmentationUnsupported,
    /// The frame needs a 64-bit length.
    #[error("64-bit payload lengths not supported")]
    ExtendedLengthUnsupported,
    /// The peer sent a ping, which would require a pong.
    #[error("Ping received; pong not supported")]
    PingUnsupported,
    /// The declared or accumulated payload exceeds the configured bound.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u64),
    /// A draft-75/76 frame started with a type byte other than 0x00 or 0xFF.
    #[error("Invalid frame type 0x{0:02x}")]
    InvalidFrameType(u8),
    /// A draft-07/08/13 text frame did not carry UTF-8.
    #[error("Invalid UTF-8 in text frame")]
    InvalidUtf8,
    /// Only text messages can be sent.
    #[error("Binary messages cannot be sent")]
    BinaryUnsupported,
    /// An underlying I/O error occurred while reading or writing frames.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors produced by the connection and the accept path.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was used after it was closed.
    #[error("WebSocket closed")]
    ConnectionClosed,
    /// Negotiation failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// An error occurred in the frame codec.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    /// The request head exceeded the configured size.
    #[error("Handshake request too large")]
    HandshakeRequestTooLarge,
    /// The stream ended before the request head (or draft-76 challenge bytes) arrived.
    #[error("Incomplete handshake request")]
    IncompleteHandshakeRequest,
    /// The request head could not be parsed.
    #[error("Failed to parse handshake request")]
    ParseHandshakeFailed,
    /// The parsed request could not be represented as an `http::Request`.
    #[error("Failed to build handshake request")]
    BuildHandshakeRequestFailed,
    /// An underlying I/O error occurred during the handshake.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Errors produced while loading an [`AcceptorConfig`](crate::config::AcceptorConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid TOML for the expected schema.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but makes no sense.
    #[error("Validation failed: {0}")]
    Validation(&'static str),
}
