//! Line codec for the chat wire format
//!
//! Inbound bytes are split on `\n`. Lines are decoded lossily, so invalid
//! UTF-8 never fails the stream, and an over-long line is skipped up to its
//! terminator and reported as `Inbound::Overlong` instead of ending the
//! session. Outbound lines get a single `\n` appended.

use std::cmp;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_LINE_LENGTH;

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete line, terminator and trailing `\r` stripped
    Line(String),
    /// A line longer than the limit; its bytes were discarded
    Overlong,
}

/// Newline-delimited codec with a per-line length limit
#[derive(Debug, Clone)]
pub struct ChatCodec {
    max_length: usize,
    /// Where the next newline scan starts
    next_index: usize,
    /// Inside an over-long line, dropping bytes until its newline
    discarding: bool,
}

impl ChatCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for ChatCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for ChatCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        loop {
            if self.discarding {
                return match src.iter().position(|b| *b == b'\n') {
                    Some(offset) => {
                        src.advance(offset + 1);
                        self.discarding = false;
                        Ok(Some(Inbound::Overlong))
                    }
                    None => {
                        src.clear();
                        Ok(None)
                    }
                };
            }

            let read_to = cmp::min(self.max_length.saturating_add(1), src.len());
            match src[self.next_index..read_to].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let frame = src.split_to(end + 1);
                    return Ok(Some(Inbound::Line(decode_line(&frame[..end]))));
                }
                None if src.len() > self.max_length => {
                    self.next_index = 0;
                    self.discarding = true;
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if self.discarding {
            // Over-long last line cut off by EOF
            self.discarding = false;
            src.clear();
            return Ok(Some(Inbound::Overlong));
        }

        if src.is_empty() {
            return Ok(None);
        }

        self.next_index = 0;
        let frame = src.split_to(src.len());
        Ok(Some(Inbound::Line(decode_line(&frame))))
    }
}

impl Encoder<String> for ChatCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
