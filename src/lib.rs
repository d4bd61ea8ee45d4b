//! USB Mass Storage gadget engine
//!
//! This library exports a block device to a USB host using the Mass Storage
//! Class Bulk-Only Transport with a minimal SCSI block command set. The
//! platform supplies the USB device controller driver(s) through
//! [`UdcController`], the partitions through [`BlockStorage`], and cache
//! maintenance through [`CacheMaintenance`]; the engine handles the protocol.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ums_gadget::{ControllerKind, MassStorageGadget, RamStorage, UdcController};
//! use ums_gadget::host::LoopbackController;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut storage = RamStorage::new();
//! storage.add_device("mmcblk0p20", Some("userdata"), 2048, 512);
//!
//! let controller: Arc<dyn UdcController> =
//!     Arc::new(LoopbackController::new(ControllerKind::HighSpeed));
//!
//! let mut gadget = MassStorageGadget::builder()
//!     .controller_identity("ci")
//!     .driver(ControllerKind::HighSpeed, controller)
//!     .build(Arc::new(storage))?;
//!
//! // Blocks until a key is pressed on the console.
//! gadget.enter("userdata")?;
//! # Ok(())
//! # }
//! ```

pub mod bot;
pub mod controller;
pub mod dma;
pub mod error;
pub mod gadget;
pub mod host;
pub mod scsi;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transfer;

pub use controller::{ControllerBinding, ControllerDrivers, ControllerKind, UdcController};
pub use dma::{CacheMaintenance, CoherentCache, DmaBuffer};
pub use error::{UmsError, UmsResult};
pub use gadget::{Console, GadgetIdentity, MassStorageGadget, MassStorageGadgetBuilder, UmsConfig};
pub use scsi::{InquiryIdentity, SenseData};
pub use storage::{BlockDevice, BlockStorage, RamStorage};
