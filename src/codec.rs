//! WebSocket frame codec.
//!
//! Decoding turns one inbound transport delivery into a [`Decoded`] event;
//! encoding turns one outbound payload into a single, unmasked, final text
//! frame. Both directions are stateless: a frame split across deliveries is
//! not reassembled.

use serde::Serialize;
use tokio_util::bytes::{BufMut as _, BytesMut};

use crate::errors::WebsocketCodecError;

const FIN_MASK: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const MASKBIT_MASK: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;

/// Largest payload length carried directly in the second header byte.
const MAX_SHORT_LENGTH: usize = 125;
/// Length marker announcing a 16-bit extended length.
const EXTENDED_16: u8 = 126;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    TextFrame = 0x1,
    ConnectionClose = 0x8,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    /// Only the opcodes this engine acts on convert; the rest are returned
    /// as the error and decode as [`Decoded::Ignored`].
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(Self::TextFrame),
            0x8 => Ok(Self::ConnectionClose),
            x => Err(x),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value as u8
    }
}

/// The outcome of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete text message.
    Message(String),
    /// The peer sent a close frame.
    Closing,
    /// A frame type this engine does not act on.
    Ignored,
}

fn truncated(needed: usize, buf: &[u8]) -> WebsocketCodecError {
    WebsocketCodecError::Truncated {
        needed,
        available: buf.len(),
    }
}

fn byte_at(buf: &[u8], index: usize) -> Result<u8, WebsocketCodecError> {
    buf.get(index).copied().ok_or_else(|| truncated(index + 1, buf))
}

/// Decode the frame at the start of `buf`.
///
/// Only the first byte is inspected for close frames and unsupported
/// opcodes. Text frames are unmasked if the mask bit is set and must carry
/// valid UTF-8.
///
/// # Errors
///
/// Returns [`WebsocketCodecError::Truncated`] if `buf` is shorter than the
/// header and payload it announces, [`WebsocketCodecError::UnsupportedPayload`]
/// for the 64-bit length form, and [`WebsocketCodecError::InvalidUtf8`] for a
/// payload that is not UTF-8.
pub fn decode(buf: &[u8]) -> Result<Decoded, WebsocketCodecError> {
    let first = byte_at(buf, 0)?;
    match Opcode::try_from(first & OPCODE_MASK) {
        Ok(Opcode::ConnectionClose) => return Ok(Decoded::Closing),
        Ok(Opcode::TextFrame) => {}
        Err(_) => return Ok(Decoded::Ignored),
    }

    let second = byte_at(buf, 1)?;
    let masked = second & MASKBIT_MASK != 0;
    let (mut header_len, payload_len) = match second & LENGTH_MASK {
        len @ 0..=125 => (2, usize::from(len)),
        EXTENDED_16 => {
            let len = u16::from_be_bytes([byte_at(buf, 2)?, byte_at(buf, 3)?]);
            (4, usize::from(len))
        }
        other => return Err(WebsocketCodecError::UnsupportedPayload(other)),
    };

    let masking_key = if masked {
        let key = buf
            .get(header_len..header_len + 4)
            .ok_or_else(|| truncated(header_len + 4, buf))?;
        header_len += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    let end = header_len + payload_len;
    let payload = buf.get(header_len..end).ok_or_else(|| truncated(end, buf))?;

    let text = match masking_key {
        Some(mask) => {
            let unmasked: Vec<u8> = payload
                .iter()
                .enumerate()
                .map(|(i, byte)| byte ^ mask[i % 4])
                .collect();
            String::from_utf8(unmasked).map_err(|e| e.utf8_error())?
        }
        None => std::str::from_utf8(payload)?.to_owned(),
    };
    Ok(Decoded::Message(text))
}

/// Encode `text` as a single final, unmasked text frame.
///
/// # Errors
///
/// Returns [`WebsocketCodecError::PayloadTooLarge`] for payloads longer than
/// 65535 bytes, which would need the 64-bit length form.
pub fn encode_text(text: &str) -> Result<BytesMut, WebsocketCodecError> {
    let payload = text.as_bytes();
    let len = payload.len();
    let mut dst = BytesMut::with_capacity(4 + len);
    dst.put_u8(FIN_MASK | u8::from(Opcode::TextFrame));
    #[allow(
        clippy::cast_possible_truncation,
        reason = "The lengths have been checked"
    )]
    match len {
        ..=MAX_SHORT_LENGTH => dst.put_u8(len as u8),
        126..=0xFFFF => {
            dst.put_u8(EXTENDED_16);
            dst.put_u16(len as u16);
        }
        _ => return Err(WebsocketCodecError::PayloadTooLarge(len)),
    }
    dst.extend_from_slice(payload);
    Ok(dst)
}

/// Serialize `value` to compact JSON and encode it as a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the JSON text is too large
/// for [`encode_text`].
pub fn encode_json<T>(value: &T) -> Result<BytesMut, crate::errors::ConnectionError>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_string(value)?;
    Ok(encode_text(&json)?)
}

/// Encode an empty, final close frame.
#[must_use]
pub fn encode_close() -> BytesMut {
    let mut dst = BytesMut::with_capacity(2);
    dst.put_u8(FIN_MASK | u8::from(Opcode::ConnectionClose));
    dst.put_u8(0);
    dst
}
