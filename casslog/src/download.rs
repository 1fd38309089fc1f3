//! Download every file on the logger into a fresh directory.
//!
//! Layout of one download:
//!
//! ```text
//! <output root>/
//!   tmp_<unix seconds>/
//!     <device file 1>
//!     <device file 2>
//!     metadata.txt      "Firmware Ver: <v>" and "Device ID: <id>"
//! ```
//!
//! The firmware version in the sidecar is what later selects the record
//! layout when the files are decoded.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::engine::ProtocolEngine;
use crate::transfer::{FileTransfer, TransferConfig, TransferReport};
use chrono::Utc;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the metadata sidecar.
pub const METADATA_FILE: &str = "metadata.txt";

/// Result of a completed [`download_all`].
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    /// Directory the files were written to.
    pub directory: PathBuf,
    /// One report per downloaded file, in listing order.
    pub reports: Vec<TransferReport>,
    /// Firmware version read after the downloads.
    pub firmware_version: String,
    /// Device id read after the downloads.
    pub device_id: String,
}

/// Text of the metadata sidecar.
pub fn metadata_contents(firmware_version: &str, device_id: &str) -> String {
    format!("Firmware Ver: {firmware_version}\nDevice ID: {device_id}\n")
}

/// Write the metadata sidecar into `dir`.
pub fn write_metadata(dir: &Path, firmware_version: &str, device_id: &str) -> Result<PathBuf> {
    let path = dir.join(METADATA_FILE);
    fs::write(&path, metadata_contents(firmware_version, device_id))?;
    Ok(path)
}

/// Create `tmp_<unix seconds>` under `root`, adding a suffix if it exists.
pub fn create_session_dir(root: &Path) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let stamp = Utc::now().timestamp();

    let mut dir = root.join(format!("tmp_{stamp}"));
    let mut attempt = 1;
    loop {
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                dir = root.join(format!("tmp_{stamp}_{attempt}"));
                attempt += 1;
            },
            Err(e) => return Err(e.into()),
        }
    }
}

/// Local path for a device file name, refusing names that would escape `dir`.
fn local_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let base = Path::new(name)
        .file_name()
        .filter(|base| *base == name)
        .ok_or_else(|| Error::Protocol(format!("unsafe file name {name:?}")))?;
    Ok(dir.join(base))
}

/// Download every file on the device into a new directory under `output_root`.
///
/// Returns `None` without creating anything when the device has no files.
/// The whole sequence runs on the engine's single session.
pub fn download_all<P: Port>(
    engine: &mut ProtocolEngine<'_, P>,
    output_root: &Path,
    config: &TransferConfig,
) -> Result<Option<DownloadSummary>> {
    let files = engine.list_file_descriptors()?;
    if files.is_empty() {
        info!("No files on the logger");
        return Ok(None);
    }

    let directory = create_session_dir(output_root)?;
    info!(
        "Downloading {} file(s) to {}",
        files.len(),
        directory.display()
    );

    let mut reports = Vec::with_capacity(files.len());
    for file in &files {
        let path = local_path(&directory, &file.name)?;
        let downloaded = FileTransfer::new(engine, file, config.clone()).run(|done, total| {
            debug!("{}: {done}/{total} bytes", file.name);
        })?;

        fs::write(&path, &downloaded.data)?;
        info!(
            "Saved {} ({} bytes)",
            path.display(),
            downloaded.report.bytes_received
        );
        reports.push(downloaded.report);
    }

    let firmware_version = engine.get_firmware_version()?;
    let device_id = engine.get_device_id()?;
    write_metadata(&directory, &firmware_version, &device_id)?;

    Ok(Some(DownloadSummary {
        directory,
        reports,
        firmware_version,
        device_id,
    }))
}
