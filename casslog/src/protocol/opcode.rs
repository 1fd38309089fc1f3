//! Single-byte opcodes understood by the logger firmware.

/// Terminator for scalar text responses and for values written to the device.
pub const SCALAR_SENTINEL: &[u8] = b"x";

/// Terminator for the file-listing stream.
pub const LISTING_SENTINEL: &[u8] = b"xxx";

/// Byte the device answers an [`Opcode::Identify`] with on its command link.
pub const IDENTIFY_ACK: u8 = b'x';

/// Logger opcodes, always written to the Command link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// List file names (`l`).
    ListFiles = b'l',
    /// List file sizes as base-2 text lines (`z`).
    ListSizes = b'z',
    /// Open a file for reading (`o`).
    OpenFile = b'o',
    /// Send the next chunk of the open file (`t`).
    NextChunk = b't',
    /// Close the open file (`c`).
    CloseFile = b'c',
    /// Delete a file (`x`).
    DeleteFile = b'x',
    /// Seek the open file to a framed byte offset (`n`).
    ResetPosition = b'n',
    /// Read the device id (`g`).
    GetDeviceId = b'g',
    /// Write the device id (`p`).
    PutDeviceId = b'p',
    /// Read the firmware version (`a`).
    GetFirmwareVersion = b'a',
    /// Write the firmware version (`b`).
    PutFirmwareVersion = b'b',
    /// Set the RTC wall clock (`e`).
    SetRtc = b'e',
    /// Read the RTC wall clock (`h`).
    GetRtc = b'h',
    /// Read the RTC battery install epoch (`i`).
    GetInstallEpoch = b'i',
    /// Write the RTC battery install epoch (`j`).
    PutInstallEpoch = b'j',
    /// Ask which link is the command link (`u`).
    Identify = b'u',
}

impl Opcode {
    /// All opcodes, in wire-byte order of the firmware's dispatch table.
    pub const ALL: [Self; 16] = [
        Self::ListFiles,
        Self::ListSizes,
        Self::OpenFile,
        Self::NextChunk,
        Self::CloseFile,
        Self::DeleteFile,
        Self::ResetPosition,
        Self::GetDeviceId,
        Self::PutDeviceId,
        Self::GetFirmwareVersion,
        Self::PutFirmwareVersion,
        Self::SetRtc,
        Self::GetRtc,
        Self::GetInstallEpoch,
        Self::PutInstallEpoch,
        Self::Identify,
    ];

    /// The byte written on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.byte() == byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_opcode_bytes_are_unique() {
        let bytes: HashSet<u8> = Opcode::ALL.iter().map(|op| op.byte()).collect();
        assert_eq!(bytes.len(), Opcode::ALL.len());
    }

    #[test]
    fn test_opcode_wire_bytes() {
        assert_eq!(Opcode::ListFiles.byte(), b'l');
        assert_eq!(Opcode::NextChunk.byte(), b't');
        assert_eq!(Opcode::ResetPosition.byte(), b'n');
        assert_eq!(Opcode::Identify.byte(), b'u');
        assert_eq!(Opcode::from_byte(b'j'), Some(Opcode::PutInstallEpoch));
        assert_eq!(Opcode::from_byte(b'q'), None);
    }
}
