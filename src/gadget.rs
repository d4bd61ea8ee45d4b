//! Mass-storage gadget lifecycle
//!
//! [`MassStorageGadget`] ties the pieces together: it picks the controller
//! binding, brings up the controller and the gadget descriptor, mounts the
//! backing partition, sizes the transfer buffer, starts the link and runs the
//! transport loop on a worker thread. `exit` tears all of it down again.

use crate::bot::interface;
use crate::controller::{
    ControllerBinding, ControllerDrivers, ControllerKind, GadgetDescriptor, NotifyFn,
    UdcController, UdcDevice, UdcEvent,
};
use crate::dma::{CacheMaintenance, CoherentCache, DmaBuffer};
use crate::error::{UmsError, UmsResult};
use crate::scsi::InquiryIdentity;
use crate::session::{BotWorker, DeviceState, SessionParts, SessionSignals, MIN_BLOCK_SIZE};
use crate::storage::BlockStorage;
use crate::transfer::Transport;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Non-blocking single-key console input
pub trait Console: Send + Sync {
    /// Return a pending key press, if any
    fn poll_key(&self) -> Option<u8>;
}

/// A console that never reports a key
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConsole;

impl Console for NoConsole {
    fn poll_key(&self) -> Option<u8> {
        None
    }
}

/// Descriptors presented to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GadgetIdentity {
    pub usb: UdcDevice,
    pub inquiry: InquiryIdentity,
    /// Interface string descriptor
    pub interface_name: String,
}

impl Default for GadgetIdentity {
    fn default() -> Self {
        GadgetIdentity {
            usb: UdcDevice::default(),
            inquiry: InquiryIdentity::default(),
            interface_name: "Mass Storage".to_string(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct UmsConfig {
    /// Platform name of the USB controller, e.g. "ci" or "dwc3"
    pub controller_identity: String,
    /// Size of the shared scratch region the transfer buffer is carved from
    pub scratch_region_size: usize,
    /// Upper bound on the transfer buffer
    pub max_buffer_size: usize,
    pub mount_attempts: u32,
    pub mount_backoff: Duration,
    /// Pause between link-up and the first command
    pub settle_delay: Duration,
    pub key_poll_interval: Duration,
    pub read_only: bool,
    pub identity: GadgetIdentity,
}

impl Default for UmsConfig {
    fn default() -> Self {
        UmsConfig {
            controller_identity: "ci".to_string(),
            scratch_region_size: 8 * 1024 * 1024,
            max_buffer_size: 128 * 1024,
            mount_attempts: 10,
            mount_backoff: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            key_poll_interval: Duration::from_millis(100),
            read_only: false,
            identity: GadgetIdentity::default(),
        }
    }
}

impl UmsConfig {
    pub fn validate(&self) -> UmsResult<()> {
        if ControllerKind::from_identity(&self.controller_identity).is_none() {
            return Err(UmsError::Config(format!(
                "unknown USB controller identity '{}'",
                self.controller_identity
            )));
        }
        if self.mount_attempts == 0 {
            return Err(UmsError::Config("mount_attempts must be at least 1".to_string()));
        }
        if self.max_buffer_size < MIN_BLOCK_SIZE as usize {
            return Err(UmsError::Config(format!(
                "max_buffer_size must be at least {} bytes",
                MIN_BLOCK_SIZE
            )));
        }
        if self.scratch_region_size / 2 < MIN_BLOCK_SIZE as usize {
            return Err(UmsError::Config(format!(
                "scratch_region_size of {} bytes leaves no room for a transfer buffer",
                self.scratch_region_size
            )));
        }
        self.identity.inquiry.validate()
    }

    /// Transfer buffer size for a medium with `block_size` byte blocks
    ///
    /// At most half the scratch region and at most `max_buffer_size`, rounded
    /// down to whole blocks.
    pub fn transfer_buffer_size(&self, block_size: u32) -> UmsResult<usize> {
        let block_size = block_size as usize;
        if block_size == 0 {
            return Err(UmsError::Config("block size of zero".to_string()));
        }
        let cap = (self.scratch_region_size / 2).min(self.max_buffer_size);
        let size = cap - cap % block_size;
        if size == 0 {
            return Err(UmsError::Resource(format!(
                "transfer buffer cap of {} bytes cannot hold a {} byte block",
                cap, block_size
            )));
        }
        Ok(size)
    }
}

struct ActiveSession {
    binding: ControllerBinding,
    signals: SessionSignals,
    worker: JoinHandle<SessionParts>,
}

/// USB mass-storage gadget exporting one partition
pub struct MassStorageGadget {
    config: UmsConfig,
    drivers: ControllerDrivers,
    storage: Arc<dyn BlockStorage>,
    cache: Arc<dyn CacheMaintenance>,
    console: Arc<dyn Console>,
    session: Option<ActiveSession>,
}

impl MassStorageGadget {
    /// Create a new builder for configuring the gadget
    pub fn builder() -> MassStorageGadgetBuilder {
        MassStorageGadgetBuilder::new()
    }

    pub fn config(&self) -> &UmsConfig {
        &self.config
    }

    /// Whether a session is running
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.signals.active.load(Ordering::SeqCst))
    }

    /// Export `partition` and block until a key is pressed, then tear down
    ///
    /// Returns immediately if a session is already active.
    pub fn enter(&mut self, partition: &str) -> UmsResult<()> {
        if self.is_active() {
            log::info!("Mass storage mode already active");
            return Ok(());
        }

        self.start(partition)?;
        log::info!("Mass storage mode active, connect the USB cable. Press any key to exit.");

        while self.is_active() {
            if let Some(key) = self.console.poll_key() {
                log::info!("Key 0x{:02x} pressed, leaving mass storage mode", key);
                break;
            }
            thread::sleep(self.config.key_poll_interval);
        }

        self.exit();
        Ok(())
    }

    /// Give the user `window` to press a key; returns whether one was pressed
    pub fn entry_countdown(&self, window: Duration) -> bool {
        log::info!("Press any key within {}s to enter mass storage mode", window.as_secs());
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if self.console.poll_key().is_some() {
                log::info!("Key pressed, entering mass storage mode");
                return true;
            }
            thread::sleep(self.config.key_poll_interval);
        }
        log::info!("No key pressed, continuing");
        false
    }

    /// Bring up a session exporting `partition` without waiting for a key
    ///
    /// On failure every resource acquired so far is released and the gadget
    /// stays inactive.
    pub fn start(&mut self, partition: &str) -> UmsResult<()> {
        if self.session.is_some() {
            log::info!("Mass storage session already running");
            return Ok(());
        }

        let binding = ControllerBinding::select(&self.config.controller_identity, &self.drivers)?;
        let driver = binding.driver();

        driver
            .init(&self.config.identity.usb)
            .map_err(|e| controller_fault("init", e))?;

        let transport = Transport::open(binding.clone(), Arc::clone(&self.cache))?;

        let signals = SessionSignals::new();
        driver
            .register_gadget(&self.descriptor(&transport, &signals))
            .map_err(|e| controller_fault("gadget registration", e))?;

        let mut device = DeviceState::new(self.config.read_only);
        self.mount_with_retries(&mut device, partition)?;

        let buffer_len = self.config.transfer_buffer_size(device.block_size())?;
        let buffer = DmaBuffer::page_aligned(buffer_len)?;
        log::debug!(
            "Transfer buffer: {} bytes ({} blocks) at 0x{:x}",
            buffer_len,
            buffer_len / device.block_size() as usize,
            buffer.addr()
        );

        driver.start().map_err(|e| controller_fault("start", e))?;

        signals.active.store(true, Ordering::SeqCst);
        let worker = BotWorker::new(
            device,
            transport,
            buffer,
            self.config.identity.inquiry.clone(),
            signals.clone(),
            self.config.settle_delay,
        )
        .and_then(|worker| {
            thread::Builder::new()
                .name("ums".to_string())
                .spawn(move || worker.run())
                .map_err(UmsError::from)
        });

        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Failed to start transport worker: {}", e);
                signals.active.store(false, Ordering::SeqCst);
                stop_link(driver);
                return Err(e);
            }
        };

        log::info!("Mass storage session started on {}", binding.kind());
        self.session = Some(ActiveSession {
            binding,
            signals,
            worker,
        });
        Ok(())
    }

    /// End the session and release everything it holds
    ///
    /// Does nothing when no session is running.
    pub fn exit(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };

        log::info!("Exiting mass storage mode");
        session.signals.active.store(false, Ordering::SeqCst);
        stop_link(session.binding.driver());
        // Wake a worker still waiting for the host.
        session.signals.online.signal();

        match session.worker.join() {
            Ok(parts) => {
                let SessionParts {
                    mut device,
                    transport,
                    buffer,
                } = parts;
                device.clear();
                drop(transport);
                drop(buffer);
            }
            Err(_) => log::error!("Transport worker panicked"),
        }

        log::info!("Mass storage cleanup complete");
    }

    fn descriptor(&self, transport: &Transport, signals: &SessionSignals) -> GadgetDescriptor {
        let online = Arc::clone(&signals.online);
        let link_lost = transport.link_lost_flag();
        let notify: NotifyFn = Arc::new(move |event: UdcEvent| match event {
            UdcEvent::Online => {
                log::info!("USB link online");
                online.signal();
            }
            UdcEvent::Offline => {
                log::info!("USB link offline");
                link_lost.store(true, Ordering::SeqCst);
            }
        });

        GadgetDescriptor {
            ifc_class: interface::CLASS,
            ifc_subclass: interface::SUBCLASS_SCSI,
            ifc_protocol: interface::PROTOCOL_BOT,
            ifc_string: self.config.identity.interface_name.clone(),
            endpoints: transport.endpoints(),
            notify,
        }
    }

    /// The backing partition may be published late during boot
    fn mount_with_retries(&self, device: &mut DeviceState, partition: &str) -> UmsResult<()> {
        let attempts = self.config.mount_attempts;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match device.mount(self.storage.as_ref(), partition) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::debug!("Mount attempt {}/{} for '{}' failed: {}", attempt, attempts, partition, e);
                    last_err = Some(e);
                }
            }
            if attempt < attempts {
                thread::sleep(self.config.mount_backoff);
            }
        }

        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        log::error!("Giving up on '{}' after {} attempts", partition, attempts);
        Err(UmsError::Mount(format!(
            "'{}' not available after {} attempts: {}",
            partition, attempts, reason
        )))
    }
}

impl Drop for MassStorageGadget {
    fn drop(&mut self) {
        self.exit();
    }
}

fn controller_fault(step: &str, e: UmsError) -> UmsError {
    log::error!("Controller {} failed: {}", step, e);
    match e {
        UmsError::Controller(_) => e,
        other => UmsError::Controller(format!("{}: {}", step, other)),
    }
}

fn stop_link(driver: &dyn UdcController) {
    if let Err(e) = driver.stop() {
        log::warn!("Failed to stop USB controller: {}", e);
    }
}

/// Builder for configuring a mass-storage gadget
pub struct MassStorageGadgetBuilder {
    config: UmsConfig,
    drivers: ControllerDrivers,
    cache: Option<Arc<dyn CacheMaintenance>>,
    console: Option<Arc<dyn Console>>,
}

impl MassStorageGadgetBuilder {
    fn new() -> Self {
        Self {
            config: UmsConfig::default(),
            drivers: ControllerDrivers::new(),
            cache: None,
            console: None,
        }
    }

    /// Start from a complete configuration
    pub fn config(mut self, config: UmsConfig) -> Self {
        self.config = config;
        self
    }

    /// Platform controller identity (default: "ci")
    pub fn controller_identity(mut self, identity: &str) -> Self {
        self.config.controller_identity = identity.to_string();
        self
    }

    /// Register the driver for one controller kind
    pub fn driver(mut self, kind: ControllerKind, driver: Arc<dyn UdcController>) -> Self {
        self.drivers = self.drivers.with(kind, driver);
        self
    }

    /// Scratch region size (default: 8 MiB)
    pub fn scratch_region_size(mut self, size: usize) -> Self {
        self.config.scratch_region_size = size;
        self
    }

    /// Transfer buffer cap (default: 128 KiB)
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.config.max_buffer_size = size;
        self
    }

    pub fn mount_attempts(mut self, attempts: u32) -> Self {
        self.config.mount_attempts = attempts;
        self
    }

    pub fn mount_backoff(mut self, backoff: Duration) -> Self {
        self.config.mount_backoff = backoff;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    pub fn key_poll_interval(mut self, interval: Duration) -> Self {
        self.config.key_poll_interval = interval;
        self
    }

    /// Export the partition write-protected
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn usb_device(mut self, device: UdcDevice) -> Self {
        self.config.identity.usb = device;
        self
    }

    /// INQUIRY vendor (8), product (16) and revision (4) strings
    pub fn inquiry(mut self, vendor: &str, product: &str, revision: &str) -> Self {
        self.config.identity.inquiry = InquiryIdentity {
            vendor: vendor.to_string(),
            product: product.to_string(),
            revision: revision.to_string(),
        };
        self
    }

    /// Cache maintenance hooks (default: coherent, no-op)
    pub fn cache(mut self, cache: Arc<dyn CacheMaintenance>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Console polled for the exit key (default: none)
    pub fn console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = Some(console);
        self
    }

    /// Build the gadget on top of the platform's block storage
    pub fn build(self, storage: Arc<dyn BlockStorage>) -> UmsResult<MassStorageGadget> {
        self.config.validate()?;
        if self.drivers.is_empty() {
            return Err(UmsError::Config("no USB controller driver registered".to_string()));
        }

        Ok(MassStorageGadget {
            config: self.config,
            drivers: self.drivers,
            storage,
            cache: self.cache.unwrap_or_else(|| Arc::new(CoherentCache)),
            console: self.console.unwrap_or_else(|| Arc::new(NoConsole)),
            session: None,
        })
    }
}
