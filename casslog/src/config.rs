//! Driver configuration.
//!
//! Configuration is layered from the following sources (highest priority first):
//! 1. Local config file (./casslog.toml)
//! 2. Global config file (~/.config/casslog/config.toml or the platform equivalent)
//! 3. Built-in defaults
//!
//! Layers merge key by key, so a local file that only sets `[port]` keeps the
//! global `[timing]` values.
//!
//! ```toml
//! [port]
//! name_pattern = "usbmodem"
//! baud = 9600
//!
//! [timing]
//! handshake_timeout_ms = 3000
//! stall_timeout_ms = 100
//!
//! [download]
//! output_dir = "downloads"
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::DEFAULT_NAME_PATTERN;
use crate::port::DEFAULT_BAUD;
use crate::protocol::engine::EngineConfig;
use crate::session::NegotiationConfig;
use crate::transfer::TransferConfig;

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "casslog.toml";

/// Port discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Substring a port name must contain to be considered a logger link.
    pub name_pattern: String,
    /// Baud rate for both links.
    pub baud: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            baud: DEFAULT_BAUD,
        }
    }
}

/// Protocol timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Window for either link to answer the identify opcode.
    pub handshake_timeout_ms: u64,
    /// Silence tolerated mid-chunk before a resume is attempted.
    pub stall_timeout_ms: u64,
    /// Bound on waiting for any other device response.
    pub response_timeout_ms: u64,
    /// Sleep between polls of an idle link.
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 3000,
            stall_timeout_ms: 100,
            response_timeout_ms: 3000,
            poll_interval_ms: 1,
        }
    }
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory under which session directories are created.
    pub output_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Port discovery.
    pub port: PortConfig,
    /// Protocol timing.
    pub timing: TimingConfig,
    /// Downloads.
    pub download: DownloadConfig,
}

impl DriverConfig {
    /// Load configuration from all available sources.
    ///
    /// Keys set in the local file override the same keys in the global
    /// file; everything else keeps the global value or the default.
    pub fn load() -> Self {
        Self::load_layered(
            Self::global_config_path().as_deref(),
            Path::new(LOCAL_CONFIG_FILE),
        )
    }

    /// Layer `local` over `global` key by key, on top of the defaults.
    /// Missing or unreadable files are skipped.
    pub fn load_layered(global: Option<&Path>, local: &Path) -> Self {
        let mut merged = toml::Table::new();
        for path in global.into_iter().chain([local]) {
            if let Some(layer) = read_table(path) {
                debug!("Layering config from {}", path.display());
                merge_tables(&mut merged, layer);
            }
        }
        Self::from_table(merged)
    }

    /// Load configuration from one explicit file, falling back to defaults.
    pub fn load_from_path(path: &Path) -> Self {
        match read_table(path) {
            Some(table) => Self::from_table(table),
            None => {
                warn!("No usable config at {}, using defaults", path.display());
                Self::default()
            },
        }
    }

    /// Path of the per-user config file, e.g. `~/.config/casslog/config.toml`.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "casslog").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn from_table(table: toml::Table) -> Self {
        toml::Value::Table(table).try_into().unwrap_or_else(|e| {
            warn!("Invalid config values, using defaults: {e}");
            Self::default()
        })
    }

    /// Settings for link negotiation.
    pub fn negotiation(&self) -> NegotiationConfig {
        NegotiationConfig {
            timeout: Duration::from_millis(self.timing.handshake_timeout_ms),
            poll_interval: self.poll_interval(),
        }
    }

    /// Settings for command/response exchanges.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            response_timeout: Duration::from_millis(self.timing.response_timeout_ms),
            poll_interval: self.poll_interval(),
        }
    }

    /// Settings for chunked downloads.
    pub fn transfer(&self) -> TransferConfig {
        TransferConfig {
            stall_timeout: Duration::from_millis(self.timing.stall_timeout_ms),
            poll_interval: self.poll_interval(),
            ..TransferConfig::default()
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.poll_interval_ms)
    }
}

/// Parse one config file into a raw table.
fn read_table(path: &Path) -> Option<toml::Table> {
    if !path.exists() {
        return None;
    }
    let content = fs::read_to_string(path)
        .map_err(|e| warn!("Failed to read config file {}: {e}", path.display()))
        .ok()?;
    toml::from_str(&content)
        .map_err(|e| warn!("Failed to parse config file {}: {e}", path.display()))
        .ok()
}

/// Overlay `layer` onto `base`, recursing into tables present in both.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match value {
            toml::Value::Table(inner) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, inner),
                _ => {
                    base.insert(key, toml::Value::Table(inner));
                },
            },
            value => {
                base.insert(key, value);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::CHUNK_SIZE;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.port.name_pattern, "usbmodem");
        assert_eq!(config.port.baud, 9600);
        assert_eq!(config.negotiation().timeout, Duration::from_secs(3));
        assert_eq!(config.transfer().stall_timeout, Duration::from_millis(100));
        assert_eq!(config.transfer().chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DriverConfig = toml::from_str(
            r#"
            [port]
            name_pattern = "ttyACM"

            [timing]
            stall_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.port.name_pattern, "ttyACM");
        assert_eq!(config.port.baud, 9600);
        assert_eq!(config.timing.stall_timeout_ms, 250);
        assert_eq!(config.timing.handshake_timeout_ms, 3000);
        assert_eq!(config.download.output_dir, PathBuf::from("."));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("casslog.toml");
        fs::write(&path, "[download]\noutput_dir = \"/data/logger\"\n").unwrap();

        let config = DriverConfig::load_from_path(&path);
        assert_eq!(config.download.output_dir, PathBuf::from("/data/logger"));
    }

    #[test]
    fn test_local_file_overrides_global_key_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("config.toml");
        let local = dir.path().join("casslog.toml");
        fs::write(
            &global,
            "[port]\nbaud = 19200\nname_pattern = \"ttyACM\"\n\n[timing]\nstall_timeout_ms = 400\n",
        )
        .unwrap();
        fs::write(&local, "[port]\nname_pattern = \"usbserial\"\n").unwrap();

        let config = DriverConfig::load_layered(Some(&global), &local);
        assert_eq!(config.port.name_pattern, "usbserial");
        assert_eq!(config.port.baud, 19200);
        assert_eq!(config.timing.stall_timeout_ms, 400);
        assert_eq!(config.timing.handshake_timeout_ms, 3000);
    }

    #[test]
    fn test_layering_skips_missing_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("config.toml");
        let local = dir.path().join("casslog.toml");
        fs::write(&global, "[timing]\nresponse_timeout_ms = 800\n").unwrap();

        let config = DriverConfig::load_layered(Some(&global), &local);
        assert_eq!(config.timing.response_timeout_ms, 800);

        fs::write(&local, "[timing\n").unwrap();
        let config = DriverConfig::load_layered(Some(&global), &local);
        assert_eq!(config.timing.response_timeout_ms, 800);

        let config = DriverConfig::load_layered(None, &dir.path().join("absent.toml"));
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn test_load_from_malformed_path_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[port\nbaud = ").unwrap();

        assert_eq!(DriverConfig::load_from_path(&path), DriverConfig::default());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = DriverConfig::default();
        config.timing.response_timeout_ms = 1500;
        let text = toml::to_string(&config).unwrap();
        let parsed: DriverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
