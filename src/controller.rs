//! USB device-controller binding
//!
//! Two physically different device controllers can sit under the engine: a
//! USB 2.0 high-speed controller and a USB 3.x SuperSpeed controller. Both are
//! driven through the same capability interface, [`UdcController`]. Which one
//! a session uses is decided once, from the identity string the platform
//! reports, and never changes afterwards; the per-controller limits come from
//! that identity alone.

use crate::error::{UmsError, UmsResult};
use crate::sync::CompletionSender;
use std::fmt;
use std::sync::Arc;

/// Largest single request on the high-speed controller
pub const HIGH_SPEED_MAX_TRANSFER: usize = 32 * 1024;

/// Largest single request on the SuperSpeed controller
pub const SUPER_SPEED_MAX_TRANSFER: usize = 16 * 1024 * 1024;

pub const HIGH_SPEED_MAX_PACKET: u16 = 512;

pub const SUPER_SPEED_MAX_PACKET: u16 = 1024;

/// Which physical controller the platform exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// USB 2.0 high-speed (ChipIdea-style)
    HighSpeed,
    /// USB 3.x SuperSpeed (DesignWare-style)
    SuperSpeed,
}

impl ControllerKind {
    /// Map a platform identity string to a controller kind
    ///
    /// Recognised: `"ci"`, `"hsusb"`, `"chipidea"` for high-speed and
    /// `"dwc"`, `"dwc3"` for SuperSpeed, case-insensitively.
    pub fn from_identity(identity: &str) -> Option<Self> {
        match identity.trim().to_ascii_lowercase().as_str() {
            "ci" | "hsusb" | "chipidea" => Some(ControllerKind::HighSpeed),
            "dwc" | "dwc3" => Some(ControllerKind::SuperSpeed),
            _ => None,
        }
    }

    /// Maximum bytes in one queued request
    pub fn max_transfer(self) -> usize {
        match self {
            ControllerKind::HighSpeed => HIGH_SPEED_MAX_TRANSFER,
            ControllerKind::SuperSpeed => SUPER_SPEED_MAX_TRANSFER,
        }
    }

    /// Bulk endpoint max packet size
    pub fn max_packet(self) -> u16 {
        match self {
            ControllerKind::HighSpeed => HIGH_SPEED_MAX_PACKET,
            ControllerKind::SuperSpeed => SUPER_SPEED_MAX_PACKET,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerKind::HighSpeed => write!(f, "USB2 high-speed"),
            ControllerKind::SuperSpeed => write!(f, "USB3 SuperSpeed"),
        }
    }
}

/// Endpoint handle returned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u8);

/// Request handle returned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

/// Endpoint direction and type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    BulkIn,
    BulkOut,
}

/// Link events reported through the gadget notify callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdcEvent {
    /// Host connected and configured the device
    Online,
    Offline,
}

/// Callback the controller invokes on link events
pub type NotifyFn = Arc<dyn Fn(UdcEvent) + Send + Sync>;

/// USB device descriptor constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdcDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub version_id: u16,
    pub manufacturer: String,
    pub product: String,
}

impl Default for UdcDevice {
    fn default() -> Self {
        UdcDevice {
            vendor_id: 0x1d6b,  // Linux Foundation
            product_id: 0x0104, // Multifunction Composite Gadget
            version_id: 0x0100,
            manufacturer: "Generic".to_string(),
            product: "Mass Storage".to_string(),
        }
    }
}

/// Interface descriptor registered with the controller
#[derive(Clone)]
pub struct GadgetDescriptor {
    pub ifc_class: u8,
    pub ifc_subclass: u8,
    pub ifc_protocol: u8,
    pub ifc_string: String,
    /// Bulk IN, then bulk OUT
    pub endpoints: [EndpointId; 2],
    pub notify: NotifyFn,
}

impl fmt::Debug for GadgetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GadgetDescriptor")
            .field("ifc_class", &self.ifc_class)
            .field("ifc_subclass", &self.ifc_subclass)
            .field("ifc_protocol", &self.ifc_protocol)
            .field("ifc_string", &self.ifc_string)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// One queued transfer
///
/// Allocated once per direction and reused for every transfer of the session.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: RequestId,
    /// Physical address of the DMA region
    pub buf: usize,
    pub length: usize,
    pub complete: CompletionSender,
}

/// Device-controller capability interface
///
/// All methods take `&self`: the controlling thread starts and stops the link
/// while the worker queues requests.
pub trait UdcController: Send + Sync {
    fn init(&self, device: &UdcDevice) -> UmsResult<()>;

    fn register_gadget(&self, gadget: &GadgetDescriptor) -> UmsResult<()>;

    fn start(&self) -> UmsResult<()>;

    /// Stop the link
    ///
    /// Any request still in flight must be retired with a non-`Ok`
    /// completion, and later `request_queue` calls must fail until `start`.
    fn stop(&self) -> UmsResult<()>;

    fn endpoint_alloc(&self, kind: EndpointKind, max_packet: u16) -> UmsResult<EndpointId>;

    /// Release an endpoint
    ///
    /// Optional: some controllers cannot free endpoints, which callers must
    /// tolerate.
    fn endpoint_free(&self, _ep: EndpointId) -> UmsResult<()> {
        Err(UmsError::Unsupported("endpoint free"))
    }

    fn request_alloc(&self) -> UmsResult<RequestId>;

    fn request_free(&self, req: RequestId) -> UmsResult<()>;

    /// Submit a request and return immediately
    ///
    /// The outcome is delivered later through `req.complete`. The region
    /// `[req.buf, req.buf + req.length)` stays valid and untouched by the CPU
    /// until that completion is delivered.
    fn request_queue(&self, ep: EndpointId, req: &TransferRequest) -> UmsResult<()>;
}

/// Controller drivers available on the platform
#[derive(Default, Clone)]
pub struct ControllerDrivers {
    high_speed: Option<Arc<dyn UdcController>>,
    super_speed: Option<Arc<dyn UdcController>>,
}

impl ControllerDrivers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ControllerKind, driver: Arc<dyn UdcController>) -> Self {
        match kind {
            ControllerKind::HighSpeed => self.high_speed = Some(driver),
            ControllerKind::SuperSpeed => self.super_speed = Some(driver),
        }
        self
    }

    pub fn get(&self, kind: ControllerKind) -> Option<Arc<dyn UdcController>> {
        match kind {
            ControllerKind::HighSpeed => self.high_speed.clone(),
            ControllerKind::SuperSpeed => self.super_speed.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.high_speed.is_none() && self.super_speed.is_none()
    }
}

/// The controller chosen for a session, with its limits
#[derive(Clone)]
pub struct ControllerBinding {
    kind: ControllerKind,
    driver: Arc<dyn UdcController>,
}

impl ControllerBinding {
    /// Select the driver matching the platform's controller identity
    pub fn select(identity: &str, drivers: &ControllerDrivers) -> UmsResult<Self> {
        let kind = ControllerKind::from_identity(identity).ok_or_else(|| {
            UmsError::Config(format!("unknown USB controller identity '{}'", identity))
        })?;
        let driver = drivers
            .get(kind)
            .ok_or_else(|| UmsError::Config(format!("no driver registered for {}", kind)))?;

        log::info!("Using {} controller ('{}')", kind, identity);
        Ok(ControllerBinding { kind, driver })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn max_transfer(&self) -> usize {
        self.kind.max_transfer()
    }

    pub fn max_packet(&self) -> u16 {
        self.kind.max_packet()
    }

    pub fn driver(&self) -> &dyn UdcController {
        self.driver.as_ref()
    }
}

impl fmt::Debug for ControllerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerBinding").field("kind", &self.kind).finish()
    }
}
