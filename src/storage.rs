//! Backing block storage
//!
//! The gadget exports one partition of the platform's block storage. The
//! platform implements [`BlockStorage`] to resolve a partition by name or
//! label and [`BlockDevice`] for byte-addressed I/O on the opened handle.
//! All offsets and lengths the engine passes are whole blocks.

use crate::error::{UmsError, UmsResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// An opened partition
pub trait BlockDevice: Send {
    /// Total number of logical blocks
    fn block_count(&self) -> u64;

    /// Block size in bytes (a power of two, at least 512)
    fn block_size(&self) -> u32;

    /// Read `buf.len()` bytes starting at `offset`
    ///
    /// # Arguments
    /// * `offset` - Byte offset into the partition
    /// * `buf` - Destination, a whole number of blocks
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> UmsResult<()>;

    /// Write `data` starting at `offset`
    fn write(&mut self, offset: u64, data: &[u8]) -> UmsResult<()>;

    /// Release the handle
    fn close(&mut self) {}
}

/// A device known to the platform, for label lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub label: Option<String>,
}

/// Platform block storage
pub trait BlockStorage: Send + Sync {
    /// Open a device by its exact name
    fn open(&self, name: &str) -> UmsResult<Box<dyn BlockDevice>>;

    /// All devices currently published
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Open by name, falling back to a linear scan for a matching label
    fn open_by_name_or_label(&self, name: &str) -> UmsResult<Box<dyn BlockDevice>> {
        match self.open(name) {
            Ok(dev) => Ok(dev),
            Err(open_err) => {
                let by_label = self
                    .devices()
                    .into_iter()
                    .find(|info| info.label.as_deref() == Some(name));
                match by_label {
                    Some(info) => {
                        log::debug!("Resolved label '{}' to device '{}'", name, info.name);
                        self.open(&info.name)
                    }
                    None => Err(open_err),
                }
            }
        }
    }
}

/// I/O counters and fault switches shared by a [`RamDisk`] and its storage
#[derive(Debug, Default)]
pub struct DiskStats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl DiskStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

struct RamImage {
    name: String,
    label: Option<String>,
    block_size: u32,
    data: Arc<Mutex<Vec<u8>>>,
    stats: Arc<DiskStats>,
    /// Number of failed `open` calls before the device appears
    hidden_for: AtomicU64,
}

/// In-memory block storage
///
/// Useful on hosts without real partitions and as the backing store in
/// tests. A device can be made to appear only after a number of `open`
/// attempts to reproduce late enumeration at boot.
#[derive(Default)]
pub struct RamStorage {
    images: Vec<RamImage>,
}

impl RamStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a zero-filled device, returning its stats handle
    pub fn add_device(&mut self, name: &str, label: Option<&str>, block_count: u64, block_size: u32) -> Arc<DiskStats> {
        let data = vec![0u8; (block_count * block_size as u64) as usize];
        self.add_image(name, label, block_size, data)
    }

    /// Publish a device backed by `data`
    pub fn add_image(&mut self, name: &str, label: Option<&str>, block_size: u32, data: Vec<u8>) -> Arc<DiskStats> {
        let stats = Arc::new(DiskStats::default());
        self.images.push(RamImage {
            name: name.to_string(),
            label: label.map(str::to_string),
            block_size,
            data: Arc::new(Mutex::new(data)),
            stats: Arc::clone(&stats),
            hidden_for: AtomicU64::new(0),
        });
        stats
    }

    /// Make `name` invisible for the next `attempts` opens
    pub fn hide_until(&self, name: &str, attempts: u64) {
        if let Some(image) = self.images.iter().find(|i| i.name == name) {
            image.hidden_for.store(attempts, Ordering::SeqCst);
        }
    }

    /// Snapshot of a device's contents
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.images
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.data.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn visible(image: &RamImage) -> bool {
        image
            .hidden_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

impl BlockStorage for RamStorage {
    fn open(&self, name: &str) -> UmsResult<Box<dyn BlockDevice>> {
        let image = self
            .images
            .iter()
            .find(|i| i.name == name)
            .filter(|i| Self::visible(i))
            .ok_or_else(|| UmsError::Mount(format!("no block device named '{}'", name)))?;

        image.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RamDisk {
            block_size: image.block_size,
            data: Arc::clone(&image.data),
            stats: Arc::clone(&image.stats),
        }))
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.images
            .iter()
            .filter(|i| i.hidden_for.load(Ordering::SeqCst) == 0)
            .map(|i| DeviceInfo {
                name: i.name.clone(),
                label: i.label.clone(),
            })
            .collect()
    }
}

/// Handle onto a [`RamStorage`] device
pub struct RamDisk {
    block_size: u32,
    data: Arc<Mutex<Vec<u8>>>,
    stats: Arc<DiskStats>,
}

impl RamDisk {
    fn range(&self, offset: u64, len: usize, total: usize) -> UmsResult<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| UmsError::Storage(format!("offset {} out of range", offset)))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= total)
            .ok_or_else(|| {
                UmsError::Storage(format!("access beyond device end: offset {}, {} bytes", offset, len))
            })?;
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn block_count(&self) -> u64 {
        let len = self.data.lock().unwrap_or_else(|e| e.into_inner()).len() as u64;
        len / self.block_size as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> UmsResult<()> {
        if self.stats.fail_reads.load(Ordering::SeqCst) {
            return Err(UmsError::Storage("injected read failure".into()));
        }
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let range = self.range(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes_read.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn write(&mut self, offset: u64, payload: &[u8]) -> UmsResult<()> {
        if self.stats.fail_writes.load(Ordering::SeqCst) {
            return Err(UmsError::Storage("injected write failure".into()));
        }
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let range = self.range(offset, payload.len(), data.len())?;
        data[range].copy_from_slice(payload);
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes_written.fetch_add(payload.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}
