//! Shared harness for the loopback tests
//!
//! Each rig wires a `MassStorageGadget` to a `LoopbackController` and a
//! RAM-backed partition labelled "userdata", and hands back the simulated
//! host that talks to it.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use ums_gadget::bot::{Cbw, Csw, CswStatus, DataDirection};
use ums_gadget::host::{LoopbackController, UsbHost};
use ums_gadget::storage::{BlockStorage, DiskStats, RamStorage};
use ums_gadget::{ControllerKind, MassStorageGadget, MassStorageGadgetBuilder};

// ============================================================================
// Logging
// ============================================================================

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn init_logging() {
    Lazy::force(&LOGGER);
}

// ============================================================================
// Test Rig
// ============================================================================

pub const PARTITION_NAME: &str = "mmcblk0p20";
pub const PARTITION_LABEL: &str = "userdata";

pub struct TestRig {
    pub gadget: MassStorageGadget,
    pub controller: Arc<LoopbackController>,
    pub storage: Arc<RamStorage>,
    pub stats: Arc<DiskStats>,
}

impl TestRig {
    /// Build a gadget over a patterned `blocks` x `block_size` partition
    pub fn new(
        kind: ControllerKind,
        blocks: u64,
        block_size: u32,
        configure: impl FnOnce(MassStorageGadgetBuilder) -> MassStorageGadgetBuilder,
    ) -> Self {
        init_logging();

        let mut storage = RamStorage::new();
        let image = pattern(0, (blocks * block_size as u64) as usize);
        let stats = storage.add_image(PARTITION_NAME, Some(PARTITION_LABEL), block_size, image);
        let storage = Arc::new(storage);

        let controller = Arc::new(LoopbackController::new(kind));
        let identity = match kind {
            ControllerKind::HighSpeed => "ci",
            ControllerKind::SuperSpeed => "dwc3",
        };

        let builder = MassStorageGadget::builder()
            .controller_identity(identity)
            .driver(kind, controller.clone())
            .settle_delay(Duration::ZERO)
            .mount_backoff(Duration::from_millis(1))
            .key_poll_interval(Duration::from_millis(5));
        let storage_dyn: Arc<dyn BlockStorage> = storage.clone();
        let gadget = configure(builder).build(storage_dyn).expect("Failed to build gadget");

        TestRig {
            gadget,
            controller,
            storage,
            stats,
        }
    }

    /// High-speed rig with default settings
    pub fn high_speed(blocks: u64, block_size: u32) -> Self {
        Self::new(ControllerKind::HighSpeed, blocks, block_size, |b| b)
    }

    /// Start the session and plug in the host
    pub fn start_and_connect(&mut self) -> UsbHost {
        self.gadget.start(PARTITION_LABEL).expect("Failed to start gadget");
        let mut host = UsbHost::new(self.controller.clone());
        host.connect().expect("Failed to connect host");
        host
    }

    pub fn contents(&self) -> Vec<u8> {
        self.storage.contents(PARTITION_NAME).expect("partition missing")
    }
}

// ============================================================================
// Command Helpers
// ============================================================================

/// Deterministic test data, distinct per offset
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i % 251) as u8).wrapping_add(seed)).collect()
}

pub fn read10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let lba = lba.to_be_bytes();
    let blocks = blocks.to_be_bytes();
    [0x28, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0]
}

pub fn write10_cdb(lba: u32, blocks: u16) -> [u8; 10] {
    let mut cdb = read10_cdb(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}

pub fn read10(tag: u32, lba: u32, blocks: u16, block_size: u32) -> Cbw {
    Cbw::new(tag, blocks as u32 * block_size, DataDirection::In, &read10_cdb(lba, blocks))
}

pub fn write10(tag: u32, lba: u32, blocks: u16, block_size: u32) -> Cbw {
    Cbw::new(tag, blocks as u32 * block_size, DataDirection::Out, &write10_cdb(lba, blocks))
}

pub fn test_unit_ready(tag: u32) -> Cbw {
    Cbw::new(tag, 0, DataDirection::Out, &[0x00, 0, 0, 0, 0, 0])
}

pub fn request_sense(tag: u32) -> Cbw {
    Cbw::new(tag, 18, DataDirection::In, &[0x03, 0, 0, 0, 18, 0])
}

pub fn read_capacity(tag: u32) -> Cbw {
    Cbw::new(tag, 8, DataDirection::In, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0])
}

/// Fetch the pending sense as (key, asc, ascq)
pub fn fetch_sense(host: &mut UsbHost, tag: u32) -> (u8, u8, u8) {
    let (data, csw) = host.command_in(&request_sense(tag), 18).expect("REQUEST SENSE failed");
    assert_good(&csw, tag);
    assert_eq!(data[0], 0x70);
    (data[2] & 0x0F, data[12], data[13])
}

pub fn assert_good(csw: &Csw, tag: u32) {
    assert_eq!(csw.tag, tag, "CSW tag must echo the CBW tag");
    assert_eq!(csw.status, CswStatus::Good);
    assert_eq!(csw.data_residue, 0);
}

pub fn assert_failed(csw: &Csw, tag: u32, residue: u32) {
    assert_eq!(csw.tag, tag, "CSW tag must echo the CBW tag");
    assert_eq!(csw.status, CswStatus::Failed);
    assert_eq!(csw.data_residue, residue);
}
