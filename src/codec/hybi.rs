//! Draft-07/08/13 framing, server side.
//!
//! Incoming frames must be masked and unfragmented; outgoing frames are unmasked text.
//! Payloads that would need the 64-bit length form are refused in both directions.

use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, Message};
use crate::errors::CodecError;

const FIN_MASK: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const MASKBIT_MASK: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const MASK_KEY_LEN: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    ContinuationFrame = 0x0,
    TextFrame = 0x1,
    BinaryFrame = 0x2,
    ConnectionClose = 0x8,
    Ping = 0x9,
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::ContinuationFrame),
            0x1 => Ok(Self::TextFrame),
            0x2 => Ok(Self::BinaryFrame),
            0x8 => Ok(Self::ConnectionClose),
            0x9 => Ok(Self::Ping),
            x => Err(CodecError::UnknownOpcode(x)),
        }
    }
}

#[derive(Debug)]
pub struct HybiCodec {
    max_length: usize,
}

impl HybiCodec {
    /// Create a server-side codec.
    ///
    /// `max_length` is the maximum allowed payload length for incoming frames; larger
    /// frames result in a `FrameTooLarge` error.
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Decoder for HybiCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        if first & FIN_MASK == 0 {
            return Err(CodecError::FragmentationUnsupported);
        }
        let opcode = match Opcode::try_from(first & OPCODE_MASK)? {
            Opcode::ConnectionClose => {
                src.clear();
                return Ok(Some(Frame::Close));
            }
            Opcode::Ping => return Err(CodecError::PingUnsupported),
            Opcode::ContinuationFrame => return Err(CodecError::FragmentationUnsupported),
            data => data,
        };

        let Some(&second) = src.get(1) else {
            return Ok(None);
        };
        if second & MASKBIT_MASK == 0 {
            return Err(CodecError::UnmaskedClientFrame);
        }

        let (header_len, payload_len) = match second & LENGTH_MASK {
            len @ 0..=125 => (2, len as usize),
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (4, u16::from_be_bytes([src[2], src[3]]) as usize)
            }
            _ => return Err(CodecError::ExtendedLengthUnsupported),
        };
        if payload_len > self.max_length {
            return Err(CodecError::FrameTooLarge(payload_len as u64));
        }

        let total_len = header_len + MASK_KEY_LEN + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let key = src.split_to(MASK_KEY_LEN);
        let mask = [key[0], key[1], key[2], key[3]];

        let mut payload = src.split_to(payload_len).to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        match opcode {
            Opcode::TextFrame => String::from_utf8(payload)
                .map(|text| Some(Frame::Text(text)))
                .map_err(|_| CodecError::InvalidUtf8),
            _ => Ok(Some(Frame::Binary(payload))),
        }
    }
}

impl Encoder<Message> for HybiCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // We only send text messages.
        let Message::Text(text) = item else {
            return Err(CodecError::BinaryUnsupported);
        };
        let payload = text.as_bytes();
        let len = payload.len();

        dst.reserve(4 + len);
        dst.put_u8(FIN_MASK | Opcode::TextFrame as u8);
        #[allow(
            clippy::cast_possible_truncation,
            reason = "The lengths have been checked"
        )]
        match len {
            ..=125 => dst.put_u8(len as u8),
            126..=0xFFFF => {
                dst.put_u8(126);
                dst.put_u16(len as u16);
            }
            _ => {
                // Undo the opcode byte so nothing partial reaches the wire.
                dst.truncate(dst.len() - 1);
                return Err(CodecError::ExtendedLengthUnsupported);
            }
        }
        dst.extend_from_slice(payload);
        Ok(())
    }
}
