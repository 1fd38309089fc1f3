//! # casslog
//!
//! A library for talking to Cass data loggers.
//!
//! The logger enumerates as two USB serial ports. One carries single-byte
//! opcodes from the host, the other carries every response and all file
//! payload back. This crate provides:
//!
//! - Port discovery and role negotiation for the two links
//! - The opcode/sentinel command protocol
//! - Chunked file download with stall recovery
//! - Access to the device id, firmware version, RTC and battery epoch
//! - Decoding of downloaded log files for each firmware variant
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `sim`: an in-process logger simulator, `port::sim`, for tests
//!
//! Without `native` the protocol, transfer and decoder layers still build and
//! run against any [`Port`] implementation.
//!
//! ## Example
//!
//! ```rust,no_run
//! use casslog::{DriverConfig, ProtocolEngine, download_all};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DriverConfig::load();
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut session = casslog::connect(&config)?;
//!         let mut engine = ProtocolEngine::with_config(&mut session, config.engine());
//!
//!         if let Some(summary) =
//!             download_all(&mut engine, &config.download.output_dir, &config.transfer())?
//!         {
//!             for report in &summary.reports {
//!                 println!("{}: {} bytes", report.filename, report.bytes_received);
//!             }
//!             let fw = &summary.firmware_version;
//!             for report in &summary.reports {
//!                 let table = casslog::decode_file(&summary.directory.join(&report.filename), fw)?;
//!                 println!("{}: {} records", report.filename, table.len());
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod download;
pub mod error;
pub mod fields;
pub mod port;
pub mod protocol;
pub mod record;
pub mod session;
pub mod transfer;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::native::NativePort;
#[cfg(feature = "native")]
pub use session::connect;
pub use {
    config::DriverConfig,
    device::{DetectedPort, format_port_list, select_logger_ports},
    download::{DownloadSummary, METADATA_FILE, download_all},
    error::{Error, Result},
    fields::DeviceField,
    port::{Port, SerialConfig},
    protocol::{EngineConfig, FileDescriptor, Opcode, ProtocolEngine, ResumeFrame},
    record::{DecodedTable, FirmwareRecordLayout, LayoutKey, LayoutRegistry, decode, decode_file},
    session::{DeviceSession, LinkRole, SessionLock, negotiate},
    transfer::{CHUNK_SIZE, DownloadedFile, FileTransfer, TransferConfig, TransferReport},
};
