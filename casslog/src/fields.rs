//! Device-resident scalar fields.
//!
//! The logger keeps four settings in non-volatile storage. Each has a get and
//! a put opcode sharing the scalar framing of the protocol engine: gets return
//! the text before the `x` sentinel, puts return whether the device echoed the
//! value back unchanged.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::engine::ProtocolEngine;
use crate::protocol::opcode::{Opcode, SCALAR_SENTINEL};
use chrono::{DateTime, Utc};
use log::{info, warn};

/// Wall-clock format the RTC put expects.
pub const RTC_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A scalar setting stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceField {
    /// Free-form device identifier.
    DeviceId,
    /// Firmware version string; selects the record layout.
    FirmwareVersion,
    /// Real-time clock.
    Rtc,
    /// When the RTC backup battery was installed, in Unix seconds.
    InstallEpoch,
}

impl DeviceField {
    /// Every field.
    pub const ALL: [Self; 4] = [
        Self::DeviceId,
        Self::FirmwareVersion,
        Self::Rtc,
        Self::InstallEpoch,
    ];

    /// Opcode that reads the field.
    pub fn get_opcode(self) -> Opcode {
        match self {
            Self::DeviceId => Opcode::GetDeviceId,
            Self::FirmwareVersion => Opcode::GetFirmwareVersion,
            Self::Rtc => Opcode::GetRtc,
            Self::InstallEpoch => Opcode::GetInstallEpoch,
        }
    }

    /// Opcode that writes the field.
    pub fn put_opcode(self) -> Opcode {
        match self {
            Self::DeviceId => Opcode::PutDeviceId,
            Self::FirmwareVersion => Opcode::PutFirmwareVersion,
            Self::Rtc => Opcode::SetRtc,
            Self::InstallEpoch => Opcode::PutInstallEpoch,
        }
    }
}

impl<P: Port> ProtocolEngine<'_, P> {
    /// Read a field as raw text.
    pub fn get_field(&mut self, field: DeviceField) -> Result<String> {
        self.get_text(field.get_opcode())
    }

    /// Write a field as raw text and report whether the device accepted it.
    pub fn put_field(&mut self, field: DeviceField, value: &str) -> Result<bool> {
        match field {
            DeviceField::Rtc => self.put_rtc_text(value),
            _ => self.put_text(field.put_opcode(), value),
        }
    }

    /// Read the device id.
    pub fn get_device_id(&mut self) -> Result<String> {
        self.get_field(DeviceField::DeviceId)
    }

    /// Write the device id.
    pub fn put_device_id(&mut self, id: &str) -> Result<bool> {
        self.put_field(DeviceField::DeviceId, id)
    }

    /// Read the firmware version.
    pub fn get_firmware_version(&mut self) -> Result<String> {
        self.get_field(DeviceField::FirmwareVersion)
    }

    /// Write the firmware version.
    pub fn put_firmware_version(&mut self, version: &str) -> Result<bool> {
        self.put_field(DeviceField::FirmwareVersion, version)
    }

    /// Read the RTC. The reply is returned as-is, unvalidated.
    pub fn get_rtc(&mut self) -> Result<String> {
        self.get_field(DeviceField::Rtc)
    }

    /// Set the RTC to `time`.
    pub fn set_rtc(&mut self, time: DateTime<Utc>) -> Result<bool> {
        self.put_rtc_text(&time.format(RTC_FORMAT).to_string())
    }

    /// Set the RTC to the host's current UTC time.
    pub fn set_rtc_now(&mut self) -> Result<bool> {
        self.set_rtc(Utc::now())
    }

    /// The device answers an RTC put with its new Unix time rather than an
    /// echo of the value.
    fn put_rtc_text(&mut self, value: &str) -> Result<bool> {
        self.flush_all()?;
        self.send(Opcode::SetRtc)?;
        self.write_terminated(value)?;

        let reply = self.read_until_sentinel(SCALAR_SENTINEL)?;
        let reply = String::from_utf8_lossy(&reply);
        let reply = reply.trim();

        if reply.parse::<i64>().is_ok() {
            info!("RTC set to {value} (device time {reply})");
            Ok(true)
        } else {
            warn!("RTC set to {value} not confirmed (reply {reply:?})");
            Ok(false)
        }
    }

    /// Read the battery install epoch, in Unix seconds, as text.
    pub fn get_install_epoch(&mut self) -> Result<String> {
        self.get_field(DeviceField::InstallEpoch)
    }

    /// Write the battery install epoch.
    pub fn put_install_epoch(&mut self, unix_seconds: i64) -> Result<bool> {
        self.put_field(DeviceField::InstallEpoch, &unix_seconds.to_string())
    }

    /// Record that the battery was installed now.
    pub fn put_install_epoch_now(&mut self) -> Result<bool> {
        self.put_install_epoch(Utc::now().timestamp())
    }
}
