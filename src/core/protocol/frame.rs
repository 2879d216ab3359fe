// src/core/protocol/frame.rs

//! Implements the `Message` wire frame and the corresponding `Encoder` and
//! `Decoder` for network communication.
//!
//! Frame layout: `u32` big-endian byte length of the UTF-8 sender, the sender
//! bytes, `u32` big-endian byte length of the UTF-8 text, the text bytes.
//! Length prefixing lets a message of unbounded text length be framed without
//! delimiter-escaping ambiguity.

use crate::core::RelayError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Byte width of each length prefix.
const LEN_PREFIX: usize = 4;

// Protocol-level limit to prevent denial-of-service via absurd length prefixes.
const MAX_FIELD_SIZE: usize = 16 * 1024 * 1024; // 16MB per field.

/// The sender name used for system notices (connect/disconnect, replies).
pub const SYSTEM_SENDER: &str = "<server>";

/// A single chat message: a display name and the message body. Immutable
/// value, constructed fresh per send/receive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub sender: String,
    pub text: String,
}

impl Message {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }

    /// A notice authored by the server itself.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, text)
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `Message` frames.
#[derive(Debug)]
pub struct MessageCodec;

impl MessageCodec {
    fn put_field(dst: &mut BytesMut, field: &str) -> Result<(), RelayError> {
        let bytes = field.as_bytes();
        if bytes.len() > MAX_FIELD_SIZE {
            return Err(RelayError::MalformedFrame(format!(
                "field of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_FIELD_SIZE
            )));
        }
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(bytes);
        Ok(())
    }

    fn check_len(len: usize, what: &str) -> Result<(), RelayError> {
        if len > MAX_FIELD_SIZE {
            return Err(RelayError::MalformedFrame(format!(
                "{what} length prefix of {len} bytes exceeds the {MAX_FIELD_SIZE} byte limit"
            )));
        }
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(2 * LEN_PREFIX + item.sender.len() + item.text.len());
        Self::put_field(dst, &item.sender)?;
        Self::put_field(dst, &item.text)?;
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = RelayError;

    /// Decodes one complete `Message` or returns `Ok(None)` when the buffer
    /// does not yet hold a full frame. A partial message is never returned.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Validate against a peek cursor first so nothing is consumed until
        // the whole frame is present.
        let mut peek: &[u8] = &src[..];

        if peek.remaining() < LEN_PREFIX {
            return Ok(None);
        }
        let sender_len = peek.get_u32() as usize;
        Self::check_len(sender_len, "sender")?;
        if peek.remaining() < sender_len + LEN_PREFIX {
            return Ok(None);
        }
        peek.advance(sender_len);
        let text_len = peek.get_u32() as usize;
        Self::check_len(text_len, "text")?;
        if peek.remaining() < text_len {
            src.reserve(text_len - peek.remaining());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let sender_bytes = src.split_to(sender_len);
        src.advance(LEN_PREFIX);
        let text_bytes = src.split_to(text_len);

        let sender = String::from_utf8(sender_bytes.to_vec())
            .map_err(|_| RelayError::MalformedFrame("sender is not valid UTF-8".into()))?;
        let text = String::from_utf8(text_bytes.to_vec())
            .map_err(|_| RelayError::MalformedFrame("text is not valid UTF-8".into()))?;

        Ok(Some(Message { sender, text }))
    }
}
