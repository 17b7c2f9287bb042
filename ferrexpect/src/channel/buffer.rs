//! Accumulation of decoded, cleaned shell output.
//!
//! Incoming bytes are decoded with the session encoding, stripped of `\r`,
//! optionally stripped of control sequences, and appended. Decoder and
//! stripper state survive [`OutputBuffer::clear`], since a multi-byte
//! character or escape sequence may straddle two expect calls.

use std::borrow::Cow;

use encoding_rs::{CoderResult, Decoder, Encoding};

use super::ansi::{AnsiStripper, remove_carriage_returns};
use crate::error::ChannelError;

/// Text buffer fed with raw channel bytes.
pub struct OutputBuffer {
    encoding: &'static Encoding,
    decoder: Decoder,
    stripper: AnsiStripper,
    text: String,
}

impl OutputBuffer {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            decoder: encoding.new_decoder(),
            stripper: AnsiStripper::new(),
            text: String::with_capacity(4096),
        }
    }

    /// Buffer for an encoding label such as `"utf8"` or `"latin1"`.
    pub fn for_label(label: &str) -> Result<Self, ChannelError> {
        Ok(Self::new(lookup_encoding(label)?))
    }

    /// Decode and clean `data`, appending it to the buffer.
    pub fn extend(&mut self, data: &[u8], strip_ansi: bool) {
        let decoded = self.decode(data);
        let decoded = remove_carriage_returns(&decoded);
        if strip_ansi {
            self.stripper.strip_into(&decoded, &mut self.text);
        } else {
            self.text.push_str(&decoded);
        }
    }

    fn decode(&mut self, data: &[u8]) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(data.len())
            .unwrap_or(data.len() * 3);
        let mut decoded = String::with_capacity(capacity);

        let mut input = data;
        loop {
            let (result, read, _) = self.decoder.decode_to_string(input, &mut decoded, false);
            input = &input[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => decoded.reserve(input.len() * 3 + 4),
            }
        }
        decoded
    }

    /// Encode outbound text with the same encoding.
    pub fn encode<'a>(&self, text: &'a str) -> Cow<'a, [u8]> {
        self.encoding.encode(text).0
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Drop the accumulated text.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Take the accumulated text and reset.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.text)
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("encoding", &self.encoding.name())
            .field("len", &self.text.len())
            .finish()
    }
}

/// Resolve a WHATWG encoding label.
pub fn lookup_encoding(label: &str) -> Result<&'static Encoding, ChannelError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ChannelError::UnknownEncoding(label.to_string()))
}
