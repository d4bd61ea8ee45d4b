//! UMS session state and the Bulk-Only transport loop
//!
//! A session owns one [`DeviceState`] (the mounted partition and pending
//! sense) and one [`BotWorker`], the state machine that pulls CBWs off the
//! bulk-out endpoint, hands them to the SCSI processor and answers with a CSW.
//! The worker runs on its own thread; the only thing the controlling thread
//! shares with it is the active flag and the link-online event.

use crate::bot::{Cbw, Csw, CBW_SIZE, CSW_SIZE};
use crate::dma::DmaBuffer;
use crate::error::{UmsError, UmsResult};
use crate::scsi::{CommandContext, InquiryIdentity, ScsiProcessor, SenseData};
use crate::storage::{BlockDevice, BlockStorage};
use crate::sync::Event;
use crate::transfer::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Smallest block size accepted on mount
pub const MIN_BLOCK_SIZE: u32 = 512;

/// The exported partition and the sense pending for the host
pub struct DeviceState {
    storage: Option<Box<dyn BlockDevice>>,
    partition: Option<String>,
    block_count: u64,
    block_size: u32,
    mounted: bool,
    read_only: bool,
    sense: SenseData,
}

impl DeviceState {
    pub fn new(read_only: bool) -> Self {
        DeviceState {
            storage: None,
            partition: None,
            block_count: 0,
            block_size: 0,
            mounted: false,
            read_only,
            sense: SenseData::no_sense(),
        }
    }

    /// Open `name` (or the device labelled `name`) and record its geometry
    ///
    /// The geometry must be a power-of-two block size of at least 512 bytes
    /// and a non-zero block count; otherwise the handle is closed again.
    pub fn mount(&mut self, storage: &dyn BlockStorage, name: &str) -> UmsResult<()> {
        if self.mounted {
            self.unmount();
        }

        let mut dev = storage.open_by_name_or_label(name)?;
        let block_count = dev.block_count();
        let block_size = dev.block_size();

        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() || block_count == 0 {
            dev.close();
            return Err(UmsError::Mount(format!(
                "'{}' has unusable geometry: {} blocks of {} bytes",
                name, block_count, block_size
            )));
        }

        log::info!(
            "Mounted '{}': {} blocks of {} bytes ({} MiB){}",
            name,
            block_count,
            block_size,
            (block_count * block_size as u64) >> 20,
            if self.read_only { ", read-only" } else { "" }
        );

        self.storage = Some(dev);
        self.partition = Some(name.to_string());
        self.block_count = block_count;
        self.block_size = block_size;
        self.mounted = true;
        self.sense = SenseData::no_sense();
        Ok(())
    }

    /// Close the backing handle, if any
    pub fn unmount(&mut self) {
        if let Some(mut dev) = self.storage.take() {
            dev.close();
            log::info!("Unmounted '{}'", self.partition.as_deref().unwrap_or("?"));
        }
        self.mounted = false;
    }

    /// Unmount and return to the freshly created state
    pub fn clear(&mut self) {
        self.unmount();
        *self = DeviceState::new(false);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Mounted with a backing handle attached
    pub fn has_medium(&self) -> bool {
        self.mounted && self.storage.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    pub fn storage_mut(&mut self) -> Option<&mut (dyn BlockDevice + 'static)> {
        self.storage.as_deref_mut()
    }

    pub fn sense(&self) -> SenseData {
        self.sense
    }

    /// Replace the pending sense
    pub fn set_sense(&mut self, sense: SenseData) {
        self.sense = sense;
    }

    pub fn clear_sense(&mut self) {
        self.sense = SenseData::no_sense();
    }

    /// Return the pending sense and reset it to NO SENSE
    pub fn take_sense(&mut self) -> SenseData {
        std::mem::take(&mut self.sense)
    }

    /// Check that `blocks` blocks starting at `lba` lie on the medium
    pub fn check_range(&self, lba: u64, blocks: u32) -> Result<(), SenseData> {
        let end = lba.checked_add(blocks as u64);
        if lba >= self.block_count || end.map_or(true, |end| end > self.block_count) {
            log::debug!(
                "Rejecting access to lba {} + {} blocks on a {} block medium",
                lba,
                blocks,
                self.block_count
            );
            return Err(SenseData::lba_out_of_range());
        }
        Ok(())
    }
}

impl Drop for DeviceState {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl std::fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceState")
            .field("partition", &self.partition)
            .field("block_count", &self.block_count)
            .field("block_size", &self.block_size)
            .field("mounted", &self.mounted)
            .field("read_only", &self.read_only)
            .field("sense", &self.sense)
            .finish()
    }
}

/// Transport loop states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotState {
    Idle,
    /// Waiting for the host to connect and configure the device
    WaitLinkUp,
    /// Short pause after link-up while the host finishes enumeration
    WaitEnumerationSettle,
    ReceiveCbw,
    Dispatch(Cbw),
    SendCsw(Csw),
    Stopped,
}

/// Flags shared between the worker and the controlling thread
#[derive(Debug, Clone, Default)]
pub struct SessionSignals {
    /// Cleared by the controlling thread to end the session
    pub active: Arc<AtomicBool>,
    /// Signalled on link-up, and by `exit` to wake a waiting worker
    pub online: Arc<Event>,
}

impl SessionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// What the worker hands back when it stops
pub struct SessionParts {
    pub device: DeviceState,
    pub transport: Transport,
    pub buffer: DmaBuffer,
}

/// The Bulk-Only transport state machine for one session
pub struct BotWorker {
    device: DeviceState,
    transport: Transport,
    buffer: DmaBuffer,
    cbw_buf: DmaBuffer,
    csw_buf: DmaBuffer,
    identity: InquiryIdentity,
    signals: SessionSignals,
    settle_delay: Duration,
    state: BotState,
}

impl BotWorker {
    pub fn new(
        device: DeviceState,
        transport: Transport,
        buffer: DmaBuffer,
        identity: InquiryIdentity,
        signals: SessionSignals,
        settle_delay: Duration,
    ) -> UmsResult<Self> {
        Ok(BotWorker {
            device,
            transport,
            buffer,
            cbw_buf: DmaBuffer::for_wrapper(CBW_SIZE)?,
            csw_buf: DmaBuffer::for_wrapper(CSW_SIZE)?,
            identity,
            signals,
            settle_delay,
            state: BotState::Idle,
        })
    }

    /// Run until the active flag is cleared, then give back the resources
    pub fn run(mut self) -> SessionParts {
        log::debug!("Transport loop started");
        while self.state != BotState::Stopped {
            self.step();
        }
        log::debug!("Transport loop stopped");

        SessionParts {
            device: self.device,
            transport: self.transport,
            buffer: self.buffer,
        }
    }

    /// Advance the state machine by one state
    pub fn step(&mut self) {
        if !self.signals.is_active() {
            self.state = BotState::Stopped;
            return;
        }

        let state = std::mem::replace(&mut self.state, BotState::Idle);
        self.state = match state {
            BotState::Idle => BotState::WaitLinkUp,
            BotState::WaitLinkUp => {
                log::debug!("Waiting for host connection");
                self.signals.online.wait();
                self.transport.clear_link_lost();
                BotState::WaitEnumerationSettle
            }
            BotState::WaitEnumerationSettle => {
                thread::sleep(self.settle_delay);
                log::info!("Host connected, serving commands");
                BotState::ReceiveCbw
            }
            BotState::ReceiveCbw => match self.receive_cbw() {
                Ok(Some(cbw)) => BotState::Dispatch(cbw),
                Ok(None) => BotState::ReceiveCbw,
                Err(e) => {
                    if self.signals.is_active() {
                        log::warn!("Lost link while waiting for a command: {}", e);
                    }
                    BotState::WaitLinkUp
                }
            },
            BotState::Dispatch(cbw) => self.dispatch(cbw),
            BotState::SendCsw(csw) => self.send_csw(&csw),
            BotState::Stopped => BotState::Stopped,
        };
    }

    /// Receive one CBW; `None` means a short wrapper was dropped
    fn receive_cbw(&mut self) -> UmsResult<Option<Cbw>> {
        self.cbw_buf.zero();
        let received = self.transport.read(&mut self.cbw_buf, CBW_SIZE)?;
        let bytes = &self.cbw_buf.as_slice()[..received];

        if received != CBW_SIZE {
            log::warn!(
                "Dropping CBW of {} bytes (expected {}): {}",
                received,
                CBW_SIZE,
                hex::encode(bytes)
            );
            return Ok(None);
        }

        match Cbw::from_bytes(bytes) {
            Ok(cbw) => Ok(Some(cbw)),
            Err(e) => {
                log::warn!("Dropping unreadable CBW: {}", e);
                Ok(None)
            }
        }
    }

    fn dispatch(&mut self, cbw: Cbw) -> BotState {
        if !cbw.has_valid_signature() {
            log::warn!(
                "Dropping CBW with bad signature 0x{:08x}: {}",
                cbw.signature,
                hex::encode(cbw.to_bytes())
            );
            return BotState::ReceiveCbw;
        }

        log::trace!(
            "CBW tag=0x{:08x} len={} dir={:?} cb={}",
            cbw.tag,
            cbw.data_transfer_length,
            cbw.direction(),
            hex::encode(cbw.command_block())
        );

        let mut ctx = CommandContext {
            device: &mut self.device,
            transport: &mut self.transport,
            buffer: &mut self.buffer,
            identity: &self.identity,
        };
        let succeeded = ScsiProcessor::execute(&cbw, &mut ctx);

        if self.transport.link_lost() {
            // The host that sent this CBW is gone; a CSW would land on the next connection.
            log::warn!("Link lost during command tag 0x{:08x}, dropping its CSW", cbw.tag);
            return BotState::WaitLinkUp;
        }
        BotState::SendCsw(Csw::for_command(&cbw, succeeded))
    }

    fn send_csw(&mut self, csw: &Csw) -> BotState {
        self.csw_buf.fill_from(&csw.to_bytes());
        match self.transport.write(&self.csw_buf, CSW_SIZE) {
            Ok(sent) if sent == CSW_SIZE => {
                log::trace!("CSW tag=0x{:08x} status={:?} residue={}", csw.tag, csw.status, csw.data_residue);
                BotState::ReceiveCbw
            }
            Ok(sent) => {
                log::warn!("CSW for tag 0x{:08x} cut short at {} bytes", csw.tag, sent);
                BotState::ReceiveCbw
            }
            Err(e) => {
                if self.signals.is_active() {
                    log::warn!("Failed to send CSW for tag 0x{:08x}: {}", csw.tag, e);
                }
                BotState::WaitLinkUp
            }
        }
    }
}
