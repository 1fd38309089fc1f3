//! Link abstraction for the logger's two serial connections.
//!
//! The logger enumerates as two anonymous USB serial devices. Both are
//! byte-oriented duplex links; which one carries commands and which one
//! carries payload is only known after negotiation (see [`crate::session`]).
//!
//! ```text
//! +---------------------+  +----------------------+
//! |   Protocol Engine   |  | File Transfer Engine |
//! +----------+----------+  +-----------+----------+
//!            |                         |
//!            v                         v
//! +----------+-------------------------+----------+
//! |        DeviceSession (Data + Command)         |
//! +----------+-------------------------+----------+
//!            |                         |
//!            v                         v
//! +----------+----------+   +----------+----------+
//! |  NativePort         |   |  SimPort            |
//! |  (serialport)       |   |  (in-process device)|
//! +---------------------+   +---------------------+
//! ```
//!
//! Reads are polled: callers ask [`Port::bytes_to_read`] and only read what
//! is already buffered, so the caller owns every timeout decision.

#[cfg(feature = "native")]
pub mod native;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate the logger firmware expects on both links.
pub const DEFAULT_BAUD: u32 = 9600;

/// Serial link configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/tty.usbmodem1234", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Timeout applied to blocking reads and writes.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One byte-oriented duplex link to the logger.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&mut self) -> Result<usize>;

    /// Discard pending input.
    fn clear_input(&mut self) -> Result<()>;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Whether the link is still open.
    fn is_open(&self) -> bool;

    /// Close the link and release the OS handle.
    ///
    /// After calling this method the link cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until they have left the host.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Read up to `max` bytes that are already buffered, never blocking.
    ///
    /// Returns an empty vector when nothing is pending.
    fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        let pending = self.bytes_to_read()?.min(max);
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        let n = Read::read(self, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
