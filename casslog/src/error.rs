//! Error types for casslog.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for casslog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for casslog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial link, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Fewer than two ports matched the logger's name pattern.
    #[error("Logger not found: {found} port(s) match {pattern:?}, need 2")]
    HardwareNotFound {
        /// Name pattern used for discovery.
        pattern: String,
        /// Number of matching ports.
        found: usize,
    },

    /// More than two ports matched the logger's name pattern.
    #[error("Ambiguous logger ports: {}", ports.join(", "))]
    AmbiguousDevice {
        /// Names of all matching ports.
        ports: Vec<String>,
    },

    /// Neither link answered the identify opcode in time.
    #[error("No identify response after {}ms", timeout.as_millis())]
    HandshakeTimeout {
        /// Handshake window.
        timeout: Duration,
    },

    /// The device answered in a way the link negotiation cannot interpret.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A stalled chunk could not be resumed.
    #[error("Resume failed at chunk {chunk_index} (offset {offset}): {reason}")]
    ResumeFailed {
        /// Index of the chunk being received.
        chunk_index: u64,
        /// Byte offset the host asked the device to seek to.
        offset: u64,
        /// What went wrong.
        reason: String,
    },

    /// No record layout exists for the firmware variant.
    #[error("Unsupported firmware version: {0}")]
    UnsupportedFirmware(String),

    /// A bounded wait for a device response expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed response payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A device session is already open in this process.
    #[error("A logger session is already open")]
    SessionActive,
}
