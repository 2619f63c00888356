// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Newline-delimited JSON-RPC codec.
//!
//! One message per line. A line that does not hold a JSON-RPC envelope is
//! reported as [`Frame::Malformed`] instead of a decoder error, because a
//! decoder error ends a `FramedRead` and one bad line from the child must not
//! take down the shared connection. Oversized lines are skipped up to the next
//! newline and reported the same way.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::constants::limits;
use crate::error::{ProtocolError, TransportError};
use crate::jsonrpc::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Malformed(ProtocolError),
}

pub struct NdjsonCodec {
    max_line: usize,
    /// Resume scanning here; bytes before it are known to hold no newline.
    next_index: usize,
    /// Inside an oversized line, dropping bytes until its newline.
    discarding: Option<usize>,
}

impl NdjsonCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(limits::MAX_MESSAGE_SIZE_BYTES)
    }

    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            max_line,
            next_index: 0,
            discarding: None,
        }
    }

    fn parse_line(line: &[u8]) -> Option<Frame> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let frame = match std::str::from_utf8(line) {
            Err(_) => Frame::Malformed(ProtocolError::Utf8),
            Ok(text) => match serde_json::from_str(text) {
                Ok(value) => match Message::from_value(value) {
                    Ok(message) => Frame::Message(message),
                    Err(e) => Frame::Malformed(e),
                },
                Err(e) => Frame::Malformed(ProtocolError::Json(e.to_string())),
            },
        };
        trace!("Decoded frame: {:?}", frame);
        Some(frame)
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(end) = newline else {
                if let Some(dropped) = self.discarding.as_mut() {
                    *dropped += src.len();
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_line {
                    self.discarding = Some(src.len());
                    src.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let line = src.split_to(end + 1);
            self.next_index = 0;

            if let Some(dropped) = self.discarding.take() {
                return Ok(Some(Frame::Malformed(ProtocolError::FrameTooLarge(
                    dropped + line.len(),
                ))));
            }
            if line.len() > self.max_line + 1 {
                return Ok(Some(Frame::Malformed(ProtocolError::FrameTooLarge(line.len()))));
            }
            if let Some(frame) = Self::parse_line(&line) {
                return Ok(Some(frame));
            }
            // blank line, keep going
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if let Some(dropped) = self.discarding.take() {
            src.clear();
            return Ok(Some(Frame::Malformed(ProtocolError::FrameTooLarge(dropped))));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Final line without a trailing newline.
        let line = src.split_to(src.len());
        self.next_index = 0;
        Ok(Self::parse_line(&line))
    }
}

impl<'a> Encoder<&'a Message> for NdjsonCodec {
    type Error = TransportError;

    fn encode(&mut self, item: &'a Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        let line = item.to_line()?;
        dst.reserve(line.len() + 1);
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        Ok(())
    }
}
