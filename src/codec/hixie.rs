//! Draft-75/76 framing.
//!
//! Text frames are `0x00 <utf-8> 0xFF`. Frames whose type byte has the high bit set
//! carry a base-128 length followed by that many payload bytes; a zero length is the
//! closing handshake.

use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, Message};
use crate::errors::CodecError;

const TYPE_HIGH_BIT: u8 = 0x80;
const TEXT_FRAME: u8 = 0x00;
const LENGTH_FRAME: u8 = 0xFF;
const SENTINEL: u8 = 0xFF;
const LENGTH_CONTINUES: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

#[derive(Debug)]
pub struct HixieCodec {
    max_length: usize,
    /// Text payload bytes already searched for the sentinel.
    scanned: usize,
}

impl HixieCodec {
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
        }
    }

    fn decode_text(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let payload = &src[1..];
        let from = self.scanned.min(payload.len());
        let Some(found) = payload[from..].iter().position(|&b| b == SENTINEL) else {
            self.scanned = payload.len();
            if self.scanned > self.max_length {
                return Err(CodecError::FrameTooLarge(self.scanned as u64));
            }
            return Ok(None);
        };
        let end = from + found;
        self.scanned = 0;
        if end > self.max_length {
            return Err(CodecError::FrameTooLarge(end as u64));
        }

        src.advance(1);
        let text = String::from_utf8_lossy(&src.split_to(end)).into_owned();
        src.advance(1);
        Ok(Some(Frame::Text(text)))
    }

    fn decode_length_prefixed(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let mut length: u64 = 0;
        let mut header_len = 1;
        loop {
            let Some(&byte) = src.get(header_len) else {
                return Ok(None);
            };
            header_len += 1;
            length = length.saturating_mul(128) + u64::from(byte & LENGTH_MASK);
            if length > self.max_length as u64 {
                return Err(CodecError::FrameTooLarge(length));
            }
            if byte & LENGTH_CONTINUES == 0 {
                break;
            }
        }

        if length == 0 {
            src.advance(header_len);
            return Ok(Some(Frame::Close));
        }

        #[allow(
            clippy::cast_possible_truncation,
            reason = "Bounded by max_length above"
        )]
        let length = length as usize;
        if src.len() < header_len + length {
            src.reserve(header_len + length - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(length).to_vec();
        Ok(Some(Frame::Binary(payload)))
    }
}

impl Decoder for HixieCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&frame_type) = src.first() else {
            return Ok(None);
        };

        if frame_type & TYPE_HIGH_BIT == 0 {
            if frame_type != TEXT_FRAME {
                return Err(CodecError::InvalidFrameType(frame_type));
            }
            self.decode_text(src)
        } else {
            if frame_type != LENGTH_FRAME {
                return Err(CodecError::InvalidFrameType(frame_type));
            }
            self.decode_length_prefixed(src)
        }
    }
}

impl Encoder<Message> for HixieCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let Message::Text(text) = item else {
            return Err(CodecError::BinaryUnsupported);
        };
        dst.reserve(text.len() + 2);
        dst.put_u8(TEXT_FRAME);
        dst.extend_from_slice(text.as_bytes());
        dst.put_u8(SENTINEL);
        Ok(())
    }
}
