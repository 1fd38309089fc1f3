//! Offset framing for the reset-position exchange.
//!
//! After a stall the host tells the device where to seek by writing the byte
//! offset as ASCII decimal between two marker sequences that cannot occur in
//! decimal text. The device answers with the offset it actually seeked to,
//! framed the same way.
//!
//! ```text
//! +----------------+-------------------+----------------+
//! |  START MARKER  |  ASCII decimal    |   END MARKER   |
//! +----------------+-------------------+----------------+
//! | FF FE FD       |  "10240"          | FD FE FF       |
//! +----------------+-------------------+----------------+
//! ```

use crate::error::{Error, Result};

/// Marker preceding a framed offset.
pub const START_MARKER: [u8; 3] = [0xFF, 0xFE, 0xFD];

/// Marker following a framed offset.
pub const END_MARKER: [u8; 3] = [0xFD, 0xFE, 0xFF];

/// A byte offset framed for the reset-position exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeFrame {
    offset: u64,
}

impl ResumeFrame {
    /// Frame for the given byte offset.
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Frame for the start of a chunk.
    pub fn for_chunk(chunk_index: u64, chunk_size: usize) -> Self {
        Self::new(chunk_index * chunk_size as u64)
    }

    /// The framed offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Build the wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let digits = self.offset.to_string();
        let mut buf = Vec::with_capacity(START_MARKER.len() + digits.len() + END_MARKER.len());
        buf.extend_from_slice(&START_MARKER);
        buf.extend_from_slice(digits.as_bytes());
        buf.extend_from_slice(&END_MARKER);
        buf
    }

    /// Find and parse the first complete frame in `data`.
    ///
    /// Returns `Ok(None)` when no complete frame is present yet, so callers
    /// can keep accumulating. Bytes before the start marker are ignored.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let Some(start) = find(data, &START_MARKER) else {
            return Ok(None);
        };
        let body = &data[start + START_MARKER.len()..];
        let Some(end) = find(body, &END_MARKER) else {
            return Ok(None);
        };

        let digits = std::str::from_utf8(&body[..end])
            .map_err(|_| Error::Protocol("framed offset is not ASCII".into()))?;
        let offset = digits
            .parse::<u64>()
            .map_err(|_| Error::Protocol(format!("framed offset {digits:?} is not decimal")))?;

        Ok(Some(Self { offset }))
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
