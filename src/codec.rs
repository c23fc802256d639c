//! Frame codecs for the supported protocol revisions.
//!
//! Each revision has its own wire format: the draft-75/76 family delimits text with
//! sentinel bytes, the draft-07/08/13 family uses opcode headers with masked client
//! payloads. [`FrameCodec`] picks one of them once, at negotiation time, and forwards
//! the `tokio_util` [`Decoder`]/[`Encoder`] calls to it.

pub(crate) mod hixie;
pub(crate) mod hybi;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::CodecError;
use crate::handshake::ProtocolRevision;

pub use hixie::HixieCodec;
pub use hybi::HybiCodec;

/// Default bound on a single incoming message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A message exchanged with the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A string of text
    Text(String),
    /// A block of binary data
    Binary(Vec<u8>),
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::Text(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::Text(value.to_owned())
    }
}

/// One decoded unit off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete text frame.
    Text(String),
    /// A complete binary or length-prefixed frame.
    Binary(Vec<u8>),
    /// The peer asked to close the connection.
    Close,
}

/// The codec negotiated for a connection.
#[derive(Debug)]
pub enum FrameCodec {
    /// Draft-75 and draft-76 framing.
    Hixie(HixieCodec),
    /// Draft-07, draft-08 and draft-13 framing.
    Hybi(HybiCodec),
}

impl FrameCodec {
    /// Create the codec that speaks `revision`.
    ///
    /// `max_message_size` bounds incoming payloads; larger frames fail with
    /// [`CodecError::FrameTooLarge`].
    #[must_use]
    pub fn for_revision(revision: ProtocolRevision, max_message_size: usize) -> Self {
        match revision {
            ProtocolRevision::Draft75 | ProtocolRevision::Draft76 => {
                FrameCodec::Hixie(HixieCodec::new(max_message_size))
            }
            ProtocolRevision::Draft07to13 { .. } => {
                FrameCodec::Hybi(HybiCodec::new(max_message_size))
            }
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            FrameCodec::Hixie(codec) => codec.decode(src),
            FrameCodec::Hybi(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    // The peer went away mid-frame; treat it like any other connection loss.
                    tracing::debug!(remaining = buf.len(), "discarding truncated frame at EOF");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            FrameCodec::Hixie(codec) => codec.encode(item, dst),
            FrameCodec::Hybi(codec) => codec.encode(item, dst),
        }
    }
}
