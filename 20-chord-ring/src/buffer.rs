//! Per-connection reassembly of newline-delimited messages.
//!
//! TCP delivers a byte stream: one `read` may return half a message, several
//! messages, or a message plus the start of the next. Each link owns one
//! [`ConnectionBuffer`] that turns those arbitrary chunks back into lines.

use std::io;

use thiserror::Error;

use crate::message::{DELIMITER, MAX_MESSAGE_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{0} bytes buffered without a delimiter, the limit is 64")]
    Oversized(usize),
}

/// Outcome of feeding one read into a buffer.
#[derive(Debug)]
pub enum Received {
    /// A full line, delimiter included.
    Complete(String),
    /// Bytes were buffered but no delimiter has arrived yet.
    Partial,
    /// The peer closed the connection.
    Disconnected,
    /// The read itself failed.
    Failed(io::Error),
}

#[derive(Debug, Default)]
pub struct ConnectionBuffer {
    bytes: Vec<u8>,
}

impl ConnectionBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(MAX_MESSAGE_LEN),
        }
    }

    /// Folds the result of a socket read into the buffer and extracts the
    /// first complete line, if any.
    pub fn receive(&mut self, read: io::Result<&[u8]>) -> Result<Received, FrameError> {
        match read {
            Ok([]) => Ok(Received::Disconnected),
            Ok(chunk) => {
                self.bytes.extend_from_slice(chunk);
                Ok(match self.next_line()? {
                    Some(line) => Received::Complete(line),
                    None => Received::Partial,
                })
            }
            Err(err) => Ok(Received::Failed(err)),
        }
    }

    /// Pops the first complete line out of the buffer.
    ///
    /// Fails once [`MAX_MESSAGE_LEN`] bytes are held without a delimiter: the
    /// buffer never grows past one maximal message.
    pub fn next_line(&mut self) -> Result<Option<String>, FrameError> {
        let window = self.bytes.len().min(MAX_MESSAGE_LEN);
        match self.bytes[..window].iter().position(|b| *b == DELIMITER) {
            Some(end) => {
                let line: Vec<u8> = self.bytes.drain(..=end).collect();
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None if self.bytes.len() >= MAX_MESSAGE_LEN => {
                Err(FrameError::Oversized(self.bytes.len()))
            }
            None => Ok(None),
        }
    }

    /// Whether [`next_line`](Self::next_line) would make progress without
    /// another read: a complete line is waiting, or the buffer is already
    /// over the limit.
    pub fn has_backlog(&self) -> bool {
        let window = self.bytes.len().min(MAX_MESSAGE_LEN);
        self.bytes.len() >= MAX_MESSAGE_LEN || self.bytes[..window].contains(&DELIMITER)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Discards any partial message.
    pub fn reset(&mut self) {
        self.bytes.clear();
    }
}
