//! Record framing errors
//!
//! Failure modes of reading and writing framed records on a stream.
//! All of them are fatal for the stream they occur on except where the
//! caller decides otherwise.

use std::fmt;
use std::fmt::Display;

/// Errors produced by the record reader and writer.
#[derive(Debug)]
pub enum RecordError {
    /// AEAD authentication failed on a received record.
    ///
    /// Every subsequent record from the same peer would fail the same
    /// way (the peer derived its key from a different secret), so the
    /// stream is closed rather than retried.
    KeyMismatch,

    /// A payload does not fit the 16-bit length field.
    TooLarge(usize),

    /// Sealing a record failed.
    Crypto(crate::Error),

    /// The underlying stream failed or ended mid-record.
    Io(std::io::Error),
}

impl std::error::Error for RecordError {}

impl Display for RecordError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordError::KeyMismatch => "fail to match key".fmt(fmt),
            RecordError::TooLarge(n) => write!(fmt, "payload of {} bytes exceeds record limit", n),
            RecordError::Crypto(e) => write!(fmt, "seal failed: {}", e),
            RecordError::Io(e) => write!(fmt, "stream error: {}", e),
        }
    }
}

impl From<std::io::Error> for RecordError {
    fn from(e: std::io::Error) -> Self {
        RecordError::Io(e)
    }
}
