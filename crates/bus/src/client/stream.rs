//! Message stream utilities.
use thiserror::Error;

use crate::message::{InvalidMessage, Message};

/// A line that refuses to become a message, or a stream that stopped
/// looking like lines at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{source}")]
pub struct DecodeError {
    /// Best-effort first token of the offending line, for the UNKNOWN reply.
    pub token: String,
    pub source: InvalidMessage,
}

impl DecodeError {
    /// Whether the stream is beyond recovery and the connection should go.
    pub fn is_fatal(&self) -> bool {
        matches!(self.source, InvalidMessage::LineTooLong)
    }
}

/// An unterminated line longer than this is not a protocol line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Message stream decoder.
///
/// Turns a byte stream into LF-terminated lines and parses each into a
/// [`Message`].
#[derive(Debug, Default)]
pub struct Decoder {
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns [`None`] once no full
    /// line is buffered. Blank lines are skipped.
    pub fn decode_next(&mut self) -> Result<Option<Message>, DecodeError> {
        loop {
            let Some(at) = self.unparsed.iter().position(|b| *b == b'\n') else {
                if self.unparsed.len() > MAX_LINE_LENGTH {
                    self.unparsed.clear();
                    return Err(DecodeError {
                        token: String::new(),
                        source: InvalidMessage::LineTooLong,
                    });
                }
                return Ok(None);
            };

            let line: Vec<u8> = self.unparsed.drain(..=at).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();

            if line.trim().is_empty() {
                continue;
            }

            return match Message::from_line(&line) {
                Ok(msg) => Ok(Some(msg)),
                Err(source) => Err(DecodeError {
                    token: line
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_owned(),
                    source,
                }),
            };
        }
    }
}
