//! SCSI command processing
//!
//! This module implements the small SCSI Primary/Block command subset generic
//! host mass-storage drivers need: identification, capacity, sense reporting
//! and READ(10)/WRITE(10). Each handler either writes a fixed-format response
//! through the bulk transport or moves blocks between the transport and the
//! backing device. A failing handler returns the sense data describing the
//! fault; the dispatcher records it for the next REQUEST SENSE.
//!
//! All multi-byte fields inside command blocks and SCSI responses are
//! big-endian.

use crate::bot::Cbw;
use crate::dma::DmaBuffer;
use crate::error::{UmsError, UmsResult};
use crate::session::DeviceState;
use crate::transfer::Transport;
use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes handled by the gadget
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    AllowMediumRemoval = 0x1E,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Verify10 = 0x2F,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x03 => Some(ScsiOpcode::RequestSense),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x1B => Some(ScsiOpcode::StartStopUnit),
            0x1E => Some(ScsiOpcode::AllowMediumRemoval),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x2F => Some(ScsiOpcode::Verify10),
            _ => None,
        }
    }
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const DATA_PHASE_ERROR: u8 = 0x4B;
}

/// Fixed-format sense data length
pub const SENSE_DATA_LEN: usize = 18;

/// Standard INQUIRY response length
pub const INQUIRY_DATA_LEN: usize = 36;

/// READ CAPACITY(10) response: last LBA and block length
pub const READ_CAPACITY_DATA_LEN: usize = 8;

/// MODE SENSE(6) header without block descriptors or pages
pub const MODE_SENSE_6_DATA_LEN: usize = 4;

/// Pending sense triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData { sense_key, asc, ascq }
    }

    pub fn no_sense() -> Self {
        SenseData::default()
    }

    pub fn is_no_sense(&self) -> bool {
        self.sense_key == sense_key::NO_SENSE
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> [u8; SENSE_DATA_LEN] {
        let mut data = [0u8; SENSE_DATA_LEN];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        // Additional sense length: remaining bytes after this field
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }

    pub fn medium_not_present() -> Self {
        SenseData::new(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT, 0)
    }

    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    /// LBA or block count outside the medium
    pub fn lba_out_of_range() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn write_protected() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::WRITE_PROTECTED, 0)
    }

    pub fn read_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0)
    }

    pub fn write_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR, 0)
    }

    /// The data phase could not be completed on the bus
    pub fn data_phase_error() -> Self {
        SenseData::new(sense_key::ABORTED_COMMAND, asc::DATA_PHASE_ERROR, 0)
    }
}

/// Identification strings reported by INQUIRY
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryIdentity {
    /// 8 characters max
    pub vendor: String,
    /// 16 characters max
    pub product: String,
    /// 4 characters max
    pub revision: String,
}

impl Default for InquiryIdentity {
    fn default() -> Self {
        InquiryIdentity {
            vendor: "Generic".to_string(),
            product: "Mass Storage".to_string(),
            revision: "1.0".to_string(),
        }
    }
}

impl InquiryIdentity {
    pub fn validate(&self) -> UmsResult<()> {
        for (field, value, max) in [
            ("vendor", &self.vendor, 8),
            ("product", &self.product, 16),
            ("revision", &self.revision, 4),
        ] {
            if value.len() > max || !value.is_ascii() {
                return Err(UmsError::Config(format!(
                    "INQUIRY {} '{}' must be at most {} ASCII characters",
                    field, value, max
                )));
            }
        }
        Ok(())
    }
}

/// Standard INQUIRY data for a removable direct-access device
pub fn inquiry_data(identity: &InquiryIdentity) -> [u8; INQUIRY_DATA_LEN] {
    let mut data = [b' '; INQUIRY_DATA_LEN];
    data[..8].fill(0);

    // Peripheral device type: direct access block device
    data[0] = 0x00;
    // RMB: removable medium
    data[1] = 0x80;
    // Version: SPC-2
    data[2] = 0x04;
    // Response data format
    data[3] = 0x02;
    data[4] = (INQUIRY_DATA_LEN - 5) as u8;

    copy_padded(&mut data[8..16], &identity.vendor);
    copy_padded(&mut data[16..32], &identity.product);
    copy_padded(&mut data[32..36], &identity.revision);
    data
}

fn copy_padded(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    field[n..].fill(b' ');
}

/// READ CAPACITY(10) data: last LBA and block length
pub fn read_capacity_data(block_count: u64, block_size: u32) -> [u8; READ_CAPACITY_DATA_LEN] {
    let mut data = [0u8; READ_CAPACITY_DATA_LEN];
    let last_lba = block_count.saturating_sub(1);
    // 0xFFFFFFFF tells the host the medium is too large for this command
    let last_lba_32 = u32::try_from(last_lba).unwrap_or(u32::MAX);
    BigEndian::write_u32(&mut data[0..4], last_lba_32);
    BigEndian::write_u32(&mut data[4..8], block_size);
    data
}

/// MODE SENSE(6) parameter header without block descriptors or pages
pub fn mode_sense_6_data(read_only: bool) -> [u8; MODE_SENSE_6_DATA_LEN] {
    [
        3,                                   // Mode data length (excluding this byte)
        0,                                   // Medium type
        if read_only { 0x80 } else { 0x00 }, // Device-specific parameter: WP bit
        0,                                   // Block descriptor length
    ]
}

/// Parse LBA and transfer length from a READ/WRITE(10) CDB
pub fn parse_rw10_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    if cdb.len() < 10 {
        return None;
    }
    let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
    let length = BigEndian::read_u16(&cdb[7..9]) as u32;
    Some((lba, length))
}

/// Outcome of one command: success, or the sense describing the failure
pub type CommandResult = Result<(), SenseData>;

/// Everything a handler may touch while executing one command
pub struct CommandContext<'a> {
    pub device: &'a mut DeviceState,
    pub transport: &'a mut Transport,
    /// Bulk transfer buffer; its length is a whole number of blocks
    pub buffer: &'a mut DmaBuffer,
    pub identity: &'a InquiryIdentity,
}

/// SCSI command dispatcher
pub struct ScsiProcessor;

impl ScsiProcessor {
    /// Execute the command carried by `cbw`, returning whether it succeeded
    ///
    /// On failure the handler's sense data replaces the pending sense.
    pub fn execute(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> bool {
        match Self::dispatch(cbw, ctx) {
            Ok(()) => true,
            Err(sense) => {
                log::debug!(
                    "SCSI 0x{:02x} failed: key=0x{:02x} asc=0x{:02x} ascq=0x{:02x}",
                    cbw.opcode(),
                    sense.sense_key,
                    sense.asc,
                    sense.ascq
                );
                ctx.device.set_sense(sense);
                false
            }
        }
    }

    fn dispatch(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        let opcode = cbw.opcode();

        match ScsiOpcode::from_u8(opcode) {
            Some(ScsiOpcode::TestUnitReady) => Self::handle_test_unit_ready(ctx),
            Some(ScsiOpcode::RequestSense) => Self::handle_request_sense(cbw, ctx),
            Some(ScsiOpcode::Inquiry) => Self::handle_inquiry(cbw, ctx),
            Some(ScsiOpcode::ReadCapacity10) => Self::handle_read_capacity_10(cbw, ctx),
            Some(ScsiOpcode::Read10) => Self::handle_read_10(cbw, ctx),
            Some(ScsiOpcode::Write10) => Self::handle_write_10(cbw, ctx),
            Some(ScsiOpcode::ModeSense6) => Self::handle_mode_sense_6(cbw, ctx),
            Some(ScsiOpcode::StartStopUnit)
            | Some(ScsiOpcode::AllowMediumRemoval)
            | Some(ScsiOpcode::Verify10) => {
                log::trace!("Accepting SCSI 0x{:02x} as a no-op", opcode);
                Ok(())
            }
            None => {
                log::debug!("Unsupported SCSI command 0x{:02x}", opcode);
                Err(SenseData::invalid_command())
            }
        }
    }

    /// Handle TEST UNIT READY (0x00)
    fn handle_test_unit_ready(ctx: &mut CommandContext<'_>) -> CommandResult {
        if !ctx.device.is_mounted() {
            return Err(SenseData::medium_not_present());
        }
        ctx.device.clear_sense();
        Ok(())
    }

    /// Handle REQUEST SENSE (0x03)
    fn handle_request_sense(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        let sense = ctx.device.take_sense();
        log::trace!("REQUEST SENSE -> {:?}", sense);
        // Reporting never fails the command; the sense is consumed either way.
        let _ = Self::send_response(cbw, ctx, &sense.to_bytes());
        Ok(())
    }

    /// Handle INQUIRY (0x12)
    fn handle_inquiry(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        let data = inquiry_data(ctx.identity);
        // Identification is informational; a lost data phase is not a SCSI fault.
        let _ = Self::send_response(cbw, ctx, &data);
        Ok(())
    }

    /// Handle READ CAPACITY (10) - 0x25
    fn handle_read_capacity_10(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        if !ctx.device.is_mounted() {
            return Err(SenseData::medium_not_present());
        }
        let data = read_capacity_data(ctx.device.block_count(), ctx.device.block_size());
        Self::send_response(cbw, ctx, &data)
    }

    /// Handle MODE SENSE (6) - 0x1A
    fn handle_mode_sense_6(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        let data = mode_sense_6_data(ctx.device.is_read_only());
        let _ = Self::send_response(cbw, ctx, &data);
        Ok(())
    }

    /// Handle READ (10) - 0x28
    fn handle_read_10(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        if !ctx.device.has_medium() {
            return Err(SenseData::medium_not_present());
        }
        let (lba, blocks) = parse_rw10_cdb(&cbw.cb).ok_or_else(SenseData::invalid_command)?;
        ctx.device.check_range(lba, blocks)?;

        log::trace!("READ(10) lba={} blocks={}", lba, blocks);

        let block_size = ctx.device.block_size() as usize;
        let per_chunk = Self::blocks_per_chunk(ctx)?;
        let mut lba = lba;
        let mut remaining = blocks as u64;

        while remaining > 0 {
            let count = remaining.min(per_chunk);
            let bytes = count as usize * block_size;
            let offset = lba * block_size as u64;

            let storage = ctx.device.storage_mut().ok_or_else(SenseData::medium_not_present)?;
            if let Err(e) = storage.read(offset, &mut ctx.buffer.as_mut_slice()[..bytes]) {
                log::error!("Backing read at offset {} ({} bytes) failed: {}", offset, bytes, e);
                return Err(SenseData::read_error());
            }

            let sent = ctx.transport.write(&*ctx.buffer, bytes).map_err(|e| {
                log::warn!("READ(10) data phase failed at lba {}: {}", lba, e);
                SenseData::data_phase_error()
            })?;
            if sent < bytes {
                log::warn!("Host ended READ(10) early: {} of {} bytes at lba {}", sent, bytes, lba);
                return Err(SenseData::data_phase_error());
            }

            lba += count;
            remaining -= count;
        }
        Ok(())
    }

    /// Handle WRITE (10) - 0x2A
    fn handle_write_10(cbw: &Cbw, ctx: &mut CommandContext<'_>) -> CommandResult {
        if !ctx.device.has_medium() {
            return Err(SenseData::medium_not_present());
        }
        if ctx.device.is_read_only() {
            return Err(SenseData::write_protected());
        }
        let (lba, blocks) = parse_rw10_cdb(&cbw.cb).ok_or_else(SenseData::invalid_command)?;
        ctx.device.check_range(lba, blocks)?;

        log::trace!("WRITE(10) lba={} blocks={}", lba, blocks);

        let block_size = ctx.device.block_size() as usize;
        let per_chunk = Self::blocks_per_chunk(ctx)?;
        let mut lba = lba;
        let mut remaining = blocks as u64;

        while remaining > 0 {
            let count = remaining.min(per_chunk);
            let bytes = count as usize * block_size;
            let offset = lba * block_size as u64;

            let received = ctx.transport.read(&mut *ctx.buffer, bytes).map_err(|e| {
                log::warn!("WRITE(10) data phase failed at lba {}: {}", lba, e);
                SenseData::data_phase_error()
            })?;
            if received < bytes {
                log::warn!("Host ended WRITE(10) early: {} of {} bytes at lba {}", received, bytes, lba);
                return Err(SenseData::data_phase_error());
            }

            let storage = ctx.device.storage_mut().ok_or_else(SenseData::medium_not_present)?;
            if let Err(e) = storage.write(offset, &ctx.buffer.as_slice()[..bytes]) {
                log::error!("Backing write at offset {} ({} bytes) failed: {}", offset, bytes, e);
                return Err(SenseData::write_error());
            }

            lba += count;
            remaining -= count;
        }
        Ok(())
    }

    fn blocks_per_chunk(ctx: &CommandContext<'_>) -> Result<u64, SenseData> {
        let per_chunk = (ctx.buffer.len() / ctx.device.block_size() as usize) as u64;
        if per_chunk == 0 {
            log::error!(
                "Transfer buffer of {} bytes cannot hold a {} byte block",
                ctx.buffer.len(),
                ctx.device.block_size()
            );
            return Err(SenseData::medium_not_present());
        }
        Ok(per_chunk)
    }

    /// Send a fixed response, capped to the host's expected length
    fn send_response(cbw: &Cbw, ctx: &mut CommandContext<'_>, payload: &[u8]) -> CommandResult {
        let len = payload.len().min(cbw.data_transfer_length as usize);
        if len == 0 {
            return Ok(());
        }
        let len = ctx.buffer.fill_from(&payload[..len]);
        match ctx.transport.write(&*ctx.buffer, len) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("SCSI 0x{:02x} response not delivered: {}", cbw.opcode(), e);
                Err(SenseData::data_phase_error())
            }
        }
    }
}
