//! Bulk-Only Transport wrapper parsing and serialization
//!
//! This module handles the binary framing of the USB Mass Storage Class
//! Bulk-Only Transport: the 31-byte Command Block Wrapper sent by the host
//! and the 13-byte Command Status Wrapper returned by the device.
//!
//! All wrapper fields are little-endian. The SCSI command block carried inside
//! the CBW is opaque here; its own fields are big-endian and decoded by
//! [`crate::scsi`].

use crate::error::{UmsError, UmsResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// CBW size in bytes
pub const CBW_SIZE: usize = 31;

/// CSW size in bytes
pub const CSW_SIZE: usize = 13;

/// Maximum command block length carried by a CBW
pub const MAX_CB_LENGTH: usize = 16;

/// "USBC", little-endian
pub const CBW_SIGNATURE: u32 = 0x4342_5355;

/// "USBS", little-endian
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Interface class triple presented to the host
pub mod interface {
    /// Mass Storage class
    pub const CLASS: u8 = 0x08;
    /// SCSI transparent command set
    pub const SUBCLASS_SCSI: u8 = 0x06;
    /// Bulk-Only Transport
    pub const PROTOCOL_BOT: u8 = 0x50;
}

/// bmCBWFlags bits
pub mod flags {
    /// Data-In: device to host
    pub const DATA_IN: u8 = 0x80;
    /// Data-Out: host to device
    pub const DATA_OUT: u8 = 0x00;
}

/// Direction of a data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// CSW status byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CswStatus {
    Good = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

impl CswStatus {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(CswStatus::Good),
            0x01 => Some(CswStatus::Failed),
            0x02 => Some(CswStatus::PhaseError),
            _ => None,
        }
    }
}

/// Command Block Wrapper - 31 bytes
///
/// ```text
///  offset  size  field
///       0     4  dCBWSignature          (0x43425355, "USBC")
///       4     4  dCBWTag                (echoed in the CSW)
///       8     4  dCBWDataTransferLength
///      12     1  bmCBWFlags             (bit 7: device-to-host)
///      13     1  bCBWLUN
///      14     1  bCBWCBLength           (1..=16)
///      15    16  CBWCB
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; MAX_CB_LENGTH],
}

impl Cbw {
    /// Build a well-formed CBW around a command block
    ///
    /// Command blocks longer than 16 bytes are truncated.
    pub fn new(tag: u32, data_transfer_length: u32, direction: DataDirection, command: &[u8]) -> Self {
        let mut cb = [0u8; MAX_CB_LENGTH];
        let len = command.len().min(MAX_CB_LENGTH);
        cb[..len].copy_from_slice(&command[..len]);

        Cbw {
            signature: CBW_SIGNATURE,
            tag,
            data_transfer_length,
            flags: match direction {
                DataDirection::In => flags::DATA_IN,
                DataDirection::Out => flags::DATA_OUT,
            },
            lun: 0,
            cb_length: len as u8,
            cb,
        }
    }

    /// Parse a CBW from the bytes received on the bulk-out endpoint
    ///
    /// Only the length is checked here; the signature is validated separately
    /// so a caller can log what it received before dropping it.
    pub fn from_bytes(buf: &[u8]) -> UmsResult<Self> {
        if buf.len() < CBW_SIZE {
            return Err(UmsError::InvalidWrapper(format!(
                "CBW too short: {} bytes, need {}",
                buf.len(),
                CBW_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);
        let signature = cursor.read_u32::<LittleEndian>()?;
        let tag = cursor.read_u32::<LittleEndian>()?;
        let data_transfer_length = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u8()?;
        let lun = cursor.read_u8()?;
        let cb_length = cursor.read_u8()?;
        let mut cb = [0u8; MAX_CB_LENGTH];
        cursor.read_exact(&mut cb)?;

        Ok(Cbw {
            signature,
            tag,
            data_transfer_length,
            flags,
            lun,
            cb_length,
            cb,
        })
    }

    /// Serialize into exactly 31 bytes
    pub fn to_bytes(&self) -> [u8; CBW_SIZE] {
        let mut buf = [0u8; CBW_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        // Writes into a fixed 31-byte array cannot run short.
        let _ = cursor.write_u32::<LittleEndian>(self.signature);
        let _ = cursor.write_u32::<LittleEndian>(self.tag);
        let _ = cursor.write_u32::<LittleEndian>(self.data_transfer_length);
        let _ = cursor.write_u8(self.flags);
        let _ = cursor.write_u8(self.lun);
        let _ = cursor.write_u8(self.cb_length);
        buf[15..].copy_from_slice(&self.cb);
        buf
    }

    pub fn has_valid_signature(&self) -> bool {
        self.signature == CBW_SIGNATURE
    }

    pub fn direction(&self) -> DataDirection {
        if self.flags & flags::DATA_IN != 0 {
            DataDirection::In
        } else {
            DataDirection::Out
        }
    }

    /// SCSI operation code (first command block byte)
    pub fn opcode(&self) -> u8 {
        self.cb[0]
    }

    /// The valid portion of the command block
    pub fn command_block(&self) -> &[u8] {
        let len = (self.cb_length as usize).clamp(1, MAX_CB_LENGTH);
        &self.cb[..len]
    }
}

/// Command Status Wrapper - 13 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    pub signature: u32,
    pub tag: u32,
    pub data_residue: u32,
    pub status: CswStatus,
}

impl Csw {
    pub fn new(tag: u32, data_residue: u32, status: CswStatus) -> Self {
        Csw {
            signature: CSW_SIGNATURE,
            tag,
            data_residue,
            status,
        }
    }

    /// Status for a completed command
    ///
    /// A failed command reports the whole expected transfer length as residue,
    /// even when part of a chunked data phase already moved.
    pub fn for_command(cbw: &Cbw, succeeded: bool) -> Self {
        if succeeded {
            Csw::new(cbw.tag, 0, CswStatus::Good)
        } else {
            Csw::new(cbw.tag, cbw.data_transfer_length, CswStatus::Failed)
        }
    }

    pub fn to_bytes(&self) -> [u8; CSW_SIZE] {
        let mut buf = [0u8; CSW_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        let _ = cursor.write_u32::<LittleEndian>(self.signature);
        let _ = cursor.write_u32::<LittleEndian>(self.tag);
        let _ = cursor.write_u32::<LittleEndian>(self.data_residue);
        let _ = cursor.write_u8(self.status as u8);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> UmsResult<Self> {
        if buf.len() < CSW_SIZE {
            return Err(UmsError::InvalidWrapper(format!(
                "CSW too short: {} bytes, need {}",
                buf.len(),
                CSW_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);
        let signature = cursor.read_u32::<LittleEndian>()?;
        let tag = cursor.read_u32::<LittleEndian>()?;
        let data_residue = cursor.read_u32::<LittleEndian>()?;
        let raw_status = cursor.read_u8()?;
        let status = CswStatus::from_u8(raw_status).ok_or_else(|| {
            UmsError::InvalidWrapper(format!("reserved CSW status 0x{:02x}", raw_status))
        })?;

        if signature != CSW_SIGNATURE {
            return Err(UmsError::InvalidWrapper(format!(
                "bad CSW signature 0x{:08x}",
                signature
            )));
        }

        Ok(Csw {
            signature,
            tag,
            data_residue,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbw_wire_layout() {
        let cbw = Cbw::new(0xDEAD_BEEF, 1024, DataDirection::In, &[0x28, 0, 0, 0, 0, 5, 0, 0, 2, 0]);
        let bytes = cbw.to_bytes();

        assert_eq!(&bytes[0..4], b"USBC");
        assert_eq!(&bytes[4..8], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&bytes[8..12], &[0x00, 0x04, 0x00, 0x00]);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[13], 0);
        assert_eq!(bytes[14], 10);
        assert_eq!(bytes[15], 0x28);
        assert_eq!(bytes[20], 5);
    }

    #[test]
    fn test_cbw_parse() {
        let mut raw = [0u8; CBW_SIZE];
        raw[0..4].copy_from_slice(b"USBC");
        raw[4..8].copy_from_slice(&7u32.to_le_bytes());
        raw[8..12].copy_from_slice(&36u32.to_le_bytes());
        raw[12] = 0x80;
        raw[14] = 6;
        raw[15] = 0x12;
        raw[19] = 36;

        let cbw = Cbw::from_bytes(&raw).unwrap();
        assert!(cbw.has_valid_signature());
        assert_eq!(cbw.tag, 7);
        assert_eq!(cbw.data_transfer_length, 36);
        assert_eq!(cbw.direction(), DataDirection::In);
        assert_eq!(cbw.opcode(), 0x12);
        assert_eq!(cbw.command_block(), &[0x12, 0, 0, 0, 36, 0]);
    }

    #[test]
    fn test_cbw_too_short() {
        let result = Cbw::from_bytes(&[0u8; 30]);
        assert!(matches!(result, Err(UmsError::InvalidWrapper(_))));
    }

    #[test]
    fn test_cbw_bad_signature_still_parses() {
        let mut raw = Cbw::new(1, 0, DataDirection::Out, &[0x00]).to_bytes();
        raw[0] = b'X';
        let cbw = Cbw::from_bytes(&raw).unwrap();
        assert!(!cbw.has_valid_signature());
    }

    #[test]
    fn test_csw_wire_layout() {
        let csw = Csw::new(0x0102_0304, 512, CswStatus::Failed);
        let bytes = csw.to_bytes();
        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[0..4], b"USBS");
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[8..12], &[0x00, 0x02, 0x00, 0x00]);
        assert_eq!(bytes[12], 1);
    }

    #[test]
    fn test_csw_for_failed_command_reports_full_residue() {
        let cbw = Cbw::new(42, 1024, DataDirection::In, &[0x28]);
        let csw = Csw::for_command(&cbw, false);
        assert_eq!(csw.tag, 42);
        assert_eq!(csw.data_residue, 1024);
        assert_eq!(csw.status, CswStatus::Failed);

        let ok = Csw::for_command(&cbw, true);
        assert_eq!(ok.data_residue, 0);
        assert_eq!(ok.status, CswStatus::Good);
    }

    #[test]
    fn test_csw_rejects_reserved_status() {
        let mut bytes = Csw::new(1, 0, CswStatus::Good).to_bytes();
        bytes[12] = 0x07;
        assert!(Csw::from_bytes(&bytes).is_err());
    }
}
