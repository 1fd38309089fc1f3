//! Logger port discovery.
//!
//! The logger (a Teensy running dual-serial USB firmware) shows up as two
//! serial ports whose names share a platform-specific pattern, e.g.
//! `/dev/tty.usbmodem1363449` and `/dev/tty.usbmodem1363443` on macOS.
//! Discovery must find exactly two; anything else means the logger is
//! unplugged or something else on the bus looks like it.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Default substring a logger port name contains.
pub const DEFAULT_NAME_PATTERN: &str = "usbmodem";

/// USB vendor id of PJRC Teensy boards.
pub const TEENSY_VID: u16 = 0x16C0;

/// Discovered serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/tty.usbmodem1234" or "COM3").
    pub name: String,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// A port known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port name contains `pattern`.
    pub fn matches(&self, pattern: &str) -> bool {
        self.name.contains(pattern)
    }

    /// Whether the USB descriptor identifies a Teensy.
    pub fn is_teensy(&self) -> bool {
        self.vid == Some(TEENSY_VID)
    }
}

/// Detect all available serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort::named(port_info.port_name.clone());

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                        port_info.port_name, usb_info.vid, usb_info.pid
                    );
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Pick the logger's two links out of `ports`.
///
/// Exactly two names must contain `pattern`. The pair is returned sorted by
/// name; roles are assigned later by negotiation, never by position.
pub fn select_logger_ports(ports: &[DetectedPort], pattern: &str) -> Result<[DetectedPort; 2]> {
    let mut matched: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.matches(pattern))
        .cloned()
        .collect();

    if matched.len() < 2 {
        return Err(Error::HardwareNotFound {
            pattern: pattern.to_string(),
            found: matched.len(),
        });
    }

    matched.sort_by(|a, b| a.name.cmp(&b.name));
    <[DetectedPort; 2]>::try_from(matched).map_err(|all| Error::AmbiguousDevice {
        ports: all.into_iter().map(|p| p.name).collect(),
    })
}

/// Discover the logger's two links on this host.
#[cfg(feature = "native")]
pub fn find_logger_ports(pattern: &str) -> Result<[DetectedPort; 2]> {
    let pair = select_logger_ports(&detect_ports(), pattern)?;
    info!("Found logger ports: {} and {}", pair[0].name, pair[1].name);
    Ok(pair)
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.is_teensy() {
                " [Teensy]".to_string()
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(names: &[&str]) -> Vec<DetectedPort> {
        names.iter().map(|n| DetectedPort::named(*n)).collect()
    }

    #[test]
    fn test_select_requires_two_matches() {
        let none = ports(&["/dev/ttyS0", "/dev/ttyUSB0"]);
        assert!(matches!(
            select_logger_ports(&none, DEFAULT_NAME_PATTERN),
            Err(Error::HardwareNotFound { found: 0, .. })
        ));

        let one = ports(&["/dev/tty.usbmodem11", "/dev/ttyS0"]);
        assert!(matches!(
            select_logger_ports(&one, DEFAULT_NAME_PATTERN),
            Err(Error::HardwareNotFound { found: 1, .. })
        ));
    }

    #[test]
    fn test_select_rejects_more_than_two() {
        let three = ports(&[
            "/dev/tty.usbmodem11",
            "/dev/tty.usbmodem13",
            "/dev/tty.usbmodem15",
        ]);
        match select_logger_ports(&three, DEFAULT_NAME_PATTERN) {
            Err(Error::AmbiguousDevice { ports }) => assert_eq!(ports.len(), 3),
            other => panic!("expected AmbiguousDevice, got {other:?}"),
        }
    }

    #[test]
    fn test_select_sorts_pair_by_name() {
        let list = ports(&[
            "/dev/tty.usbmodem13",
            "/dev/tty.Bluetooth-Incoming-Port",
            "/dev/tty.usbmodem11",
        ]);
        let [a, b] = select_logger_ports(&list, DEFAULT_NAME_PATTERN).unwrap();
        assert_eq!(a.name, "/dev/tty.usbmodem11");
        assert_eq!(b.name, "/dev/tty.usbmodem13");
    }

    #[test]
    fn test_format_port_list() {
        let list = vec![
            DetectedPort {
                name: "/dev/tty.usbmodem11".to_string(),
                vid: Some(TEENSY_VID),
                pid: Some(0x0489),
                manufacturer: Some("Teensyduino".to_string()),
                product: Some("Dual Serial".to_string()),
                serial: None,
            },
            DetectedPort::named("/dev/ttyS0"),
        ];

        let formatted = format_port_list(&list);
        assert_eq!(formatted.len(), 2);
        assert_eq!(formatted[0], "/dev/tty.usbmodem11 [Teensy] - Dual Serial");
        assert_eq!(formatted[1], "/dev/ttyS0");
    }
}
