//! In-process USB host for testing
//!
//! This module plays both sides of the cable without hardware:
//! - [`LoopbackController`] implements [`UdcController`] in memory. Queued
//!   requests wait in a one-slot-per-direction mailbox until the host side
//!   services them.
//! - [`UsbHost`] is the host: it connects and disconnects the link, writes
//!   CBWs and data into OUT requests, reads IN requests and parses CSWs.
//!
//! Every host-side wait is bounded; running out of time yields
//! [`UmsError::Timeout`] instead of hanging the test.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ums_gadget::controller::ControllerKind;
//! use ums_gadget::host::{LoopbackController, UsbHost};
//! use ums_gadget::bot::{Cbw, DataDirection};
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = Arc::new(LoopbackController::new(ControllerKind::HighSpeed));
//! // ... hand the controller to a MassStorageGadget and start it ...
//! let mut host = UsbHost::new(controller);
//! host.connect()?;
//! let inquiry = Cbw::new(1, 36, DataDirection::In, &[0x12, 0, 0, 0, 36, 0]);
//! let (data, csw) = host.command_in(&inquiry, 36)?;
//! assert_eq!(csw.tag, 1);
//! # Ok(())
//! # }
//! ```

use crate::bot::{Cbw, Csw, CBW_SIZE, CSW_SIZE};
use crate::controller::{
    ControllerKind, EndpointId, EndpointKind, GadgetDescriptor, NotifyFn, RequestId,
    TransferRequest, UdcController, UdcDevice, UdcEvent,
};
use crate::error::{UmsError, UmsResult};
use crate::sync::TransferStatus;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Default bound on every host-side wait
pub const DEFAULT_HOST_TIMEOUT: Duration = Duration::from_secs(5);

/// Queued-request lengths kept for inspection; older entries are dropped
pub const QUEUED_LOG_LIMIT: usize = 1024;

/// Controller operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Init,
    RegisterGadget,
    Start,
    EndpointAlloc,
    RequestAlloc,
}

#[derive(Default)]
struct LoopbackState {
    device: Option<UdcDevice>,
    gadget: Option<GadgetDescriptor>,
    started: bool,
    connected: bool,
    endpoints: HashMap<EndpointId, EndpointKind>,
    requests: HashSet<RequestId>,
    next_in: u8,
    next_out: u8,
    next_request: u32,
    pending_in: Option<TransferRequest>,
    pending_out: Option<TransferRequest>,
    queued: VecDeque<(EndpointKind, usize)>,
    fail: HashSet<FailPoint>,
}

impl LoopbackState {
    fn retire_pending(&mut self) -> usize {
        let mut retired = 0;
        for req in [self.pending_in.take(), self.pending_out.take()].into_iter().flatten() {
            req.complete.complete(0, TransferStatus::Cancelled);
            retired += 1;
        }
        retired
    }
}

/// Software stand-in for a device controller
pub struct LoopbackController {
    kind: ControllerKind,
    state: Mutex<LoopbackState>,
    cond: Condvar,
}

impl LoopbackController {
    pub fn new(kind: ControllerKind) -> Self {
        LoopbackController {
            kind,
            state: Mutex::new(LoopbackState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Make the given operation fail until [`LoopbackController::clear_failures`]
    pub fn fail_on(&self, point: FailPoint) {
        self.lock().fail.insert(point);
    }

    pub fn clear_failures(&self) {
        self.lock().fail.clear();
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Device descriptor passed to the last `init`
    pub fn device(&self) -> Option<UdcDevice> {
        self.lock().device.clone()
    }

    /// Interface class, subclass and protocol of the registered gadget
    pub fn interface(&self) -> Option<(u8, u8, u8)> {
        self.lock()
            .gadget
            .as_ref()
            .map(|g| (g.ifc_class, g.ifc_subclass, g.ifc_protocol))
    }

    /// Endpoints allocated and not yet freed
    pub fn live_endpoints(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Requests allocated and not yet freed
    pub fn live_requests(&self) -> usize {
        self.lock().requests.len()
    }

    /// Lengths of the most recent requests queued on the given direction,
    /// oldest first (at most [`QUEUED_LOG_LIMIT`] across both directions)
    pub fn queued_lengths(&self, kind: EndpointKind) -> Vec<usize> {
        self.lock()
            .queued
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, len)| *len)
            .collect()
    }

    pub fn clear_queued_log(&self) {
        self.lock().queued.clear();
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_fail(state: &LoopbackState, point: FailPoint) -> UmsResult<()> {
        if state.fail.contains(&point) {
            return Err(UmsError::Controller(format!("injected {:?} failure", point)));
        }
        Ok(())
    }

    fn notify(&self, event: UdcEvent) {
        let notify: Option<NotifyFn> = self.lock().gadget.as_ref().map(|g| Arc::clone(&g.notify));
        if let Some(notify) = notify {
            notify(event);
        }
    }

    /// Wait for a request to be queued on `kind`, then take it
    fn take_pending(&self, kind: EndpointKind, timeout: Duration) -> UmsResult<TransferRequest> {
        let guard = self.lock();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| match kind {
                EndpointKind::BulkIn => s.pending_in.is_none(),
                EndpointKind::BulkOut => s.pending_out.is_none(),
            })
            .unwrap_or_else(|e| e.into_inner());

        let slot = match kind {
            EndpointKind::BulkIn => state.pending_in.take(),
            EndpointKind::BulkOut => state.pending_out.take(),
        };
        slot.ok_or_else(|| {
            UmsError::Timeout(format!("no {:?} request queued within {:?}", kind, timeout))
        })
    }

    fn wait_pending(&self, kind: EndpointKind, timeout: Duration) -> bool {
        let guard = self.lock();
        let (state, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| match kind {
                EndpointKind::BulkIn => s.pending_in.is_none(),
                EndpointKind::BulkOut => s.pending_out.is_none(),
            })
            .unwrap_or_else(|e| e.into_inner());
        match kind {
            EndpointKind::BulkIn => state.pending_in.is_some(),
            EndpointKind::BulkOut => state.pending_out.is_some(),
        }
    }
}

impl UdcController for LoopbackController {
    fn init(&self, device: &UdcDevice) -> UmsResult<()> {
        let mut state = self.lock();
        Self::check_fail(&state, FailPoint::Init)?;
        state.device = Some(device.clone());
        Ok(())
    }

    fn register_gadget(&self, gadget: &GadgetDescriptor) -> UmsResult<()> {
        let mut state = self.lock();
        Self::check_fail(&state, FailPoint::RegisterGadget)?;
        state.gadget = Some(gadget.clone());
        Ok(())
    }

    fn start(&self) -> UmsResult<()> {
        let mut state = self.lock();
        Self::check_fail(&state, FailPoint::Start)?;
        state.started = true;
        Ok(())
    }

    fn stop(&self) -> UmsResult<()> {
        let retired = {
            let mut state = self.lock();
            state.started = false;
            state.connected = false;
            state.retire_pending()
        };
        if retired > 0 {
            log::debug!("Loopback stop retired {} request(s)", retired);
        }
        self.cond.notify_all();
        Ok(())
    }

    fn endpoint_alloc(&self, kind: EndpointKind, _max_packet: u16) -> UmsResult<EndpointId> {
        let mut state = self.lock();
        Self::check_fail(&state, FailPoint::EndpointAlloc)?;
        let ep = match kind {
            EndpointKind::BulkIn => {
                state.next_in += 1;
                EndpointId(0x80 | state.next_in)
            }
            EndpointKind::BulkOut => {
                state.next_out += 1;
                EndpointId(state.next_out)
            }
        };
        state.endpoints.insert(ep, kind);
        Ok(ep)
    }

    fn endpoint_free(&self, ep: EndpointId) -> UmsResult<()> {
        if self.kind == ControllerKind::SuperSpeed {
            return Err(UmsError::Unsupported("endpoint free"));
        }
        self.lock()
            .endpoints
            .remove(&ep)
            .map(|_| ())
            .ok_or_else(|| UmsError::Resource(format!("endpoint {:?} not allocated", ep)))
    }

    fn request_alloc(&self) -> UmsResult<RequestId> {
        let mut state = self.lock();
        Self::check_fail(&state, FailPoint::RequestAlloc)?;
        state.next_request += 1;
        let req = RequestId(state.next_request);
        state.requests.insert(req);
        Ok(req)
    }

    fn request_free(&self, req: RequestId) -> UmsResult<()> {
        if self.lock().requests.remove(&req) {
            Ok(())
        } else {
            Err(UmsError::Resource(format!("request {:?} not allocated", req)))
        }
    }

    fn request_queue(&self, ep: EndpointId, req: &TransferRequest) -> UmsResult<()> {
        {
            let mut state = self.lock();
            if !state.started {
                return Err(UmsError::Transfer("controller is stopped".into()));
            }
            if !state.connected {
                return Err(UmsError::Transfer("no host connected".into()));
            }
            if !state.requests.contains(&req.id) {
                return Err(UmsError::Transfer(format!("request {:?} not allocated", req.id)));
            }
            let kind = *state
                .endpoints
                .get(&ep)
                .ok_or_else(|| UmsError::Transfer(format!("endpoint {:?} not allocated", ep)))?;

            let slot = match kind {
                EndpointKind::BulkIn => &mut state.pending_in,
                EndpointKind::BulkOut => &mut state.pending_out,
            };
            if slot.is_some() {
                return Err(UmsError::Transfer(format!("{:?} already has a request queued", ep)));
            }
            *slot = Some(req.clone());
            if state.queued.len() == QUEUED_LOG_LIMIT {
                state.queued.pop_front();
            }
            state.queued.push_back((kind, req.length));
        }
        self.cond.notify_all();
        Ok(())
    }
}

/// The simulated USB host
pub struct UsbHost {
    controller: Arc<LoopbackController>,
    timeout: Duration,
}

impl UsbHost {
    pub fn new(controller: Arc<LoopbackController>) -> Self {
        UsbHost {
            controller,
            timeout: DEFAULT_HOST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn controller(&self) -> &Arc<LoopbackController> {
        &self.controller
    }

    /// Plug in the cable and configure the device
    ///
    /// # Errors
    ///
    /// Fails unless a gadget is registered and the link is started.
    pub fn connect(&mut self) -> UmsResult<()> {
        {
            let mut state = self.controller.lock();
            if state.gadget.is_none() || !state.started {
                return Err(UmsError::Controller("device is not started".into()));
            }
            state.connected = true;
        }
        log::debug!("Host connected");
        self.controller.notify(UdcEvent::Online);
        Ok(())
    }

    /// Pull the cable; anything in flight is cancelled
    pub fn disconnect(&mut self) {
        {
            let mut state = self.controller.lock();
            state.connected = false;
            state.retire_pending();
        }
        self.controller.cond.notify_all();
        log::debug!("Host disconnected");
        self.controller.notify(UdcEvent::Offline);
    }

    /// Send one OUT transfer, returning how many bytes the device took
    ///
    /// Bytes beyond the queued request's length are not sent.
    pub fn send(&mut self, data: &[u8]) -> UmsResult<usize> {
        let req = self.controller.take_pending(EndpointKind::BulkOut, self.timeout)?;
        let n = data.len().min(req.length);
        // SAFETY: the device does not touch [buf, buf + length) until the
        // completion below is delivered.
        let region = unsafe { std::slice::from_raw_parts_mut(req.buf as *mut u8, n) };
        region.copy_from_slice(&data[..n]);
        req.complete.complete(n, TransferStatus::Ok);
        Ok(n)
    }

    /// Send `data` as a data-out phase, spread over as many requests as the
    /// device queues
    pub fn send_all(&mut self, data: &[u8]) -> UmsResult<()> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self.send(&data[sent..])?;
        }
        Ok(())
    }

    /// Send arbitrary bytes as a CBW-sized transfer
    pub fn send_raw(&mut self, bytes: &[u8]) -> UmsResult<usize> {
        self.send(bytes)
    }

    pub fn send_cbw(&mut self, cbw: &Cbw) -> UmsResult<()> {
        let sent = self.send(&cbw.to_bytes())?;
        if sent != CBW_SIZE {
            return Err(UmsError::Transfer(format!("device accepted {} of {} CBW bytes", sent, CBW_SIZE)));
        }
        Ok(())
    }

    /// Read one IN transfer of up to `max` bytes
    pub fn receive_once(&mut self, max: usize) -> UmsResult<Vec<u8>> {
        let req = self.controller.take_pending(EndpointKind::BulkIn, self.timeout)?;
        let n = max.min(req.length);
        // SAFETY: as in `send`.
        let region = unsafe { std::slice::from_raw_parts(req.buf as *const u8, n) };
        let data = region.to_vec();
        req.complete.complete(n, TransferStatus::Ok);
        Ok(data)
    }

    /// Read a data-in phase of exactly `len` bytes
    pub fn receive(&mut self, len: usize) -> UmsResult<Vec<u8>> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let chunk = self.receive_once(len - data.len())?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    pub fn receive_csw(&mut self) -> UmsResult<Csw> {
        let bytes = self.receive_once(CSW_SIZE)?;
        Csw::from_bytes(&bytes)
    }

    /// Whether the device queues an IN request within `timeout`
    pub fn has_pending_in(&self, timeout: Duration) -> bool {
        self.controller.wait_pending(EndpointKind::BulkIn, timeout)
    }

    /// Whether the device is waiting for OUT data within `timeout`
    pub fn has_pending_out(&self, timeout: Duration) -> bool {
        self.controller.wait_pending(EndpointKind::BulkOut, timeout)
    }

    /// Issue a command without a data phase
    pub fn command(&mut self, cbw: &Cbw) -> UmsResult<Csw> {
        self.send_cbw(cbw)?;
        self.receive_csw()
    }

    /// Issue a device-to-host command, reading `len` bytes before the CSW
    pub fn command_in(&mut self, cbw: &Cbw, len: usize) -> UmsResult<(Vec<u8>, Csw)> {
        self.send_cbw(cbw)?;
        let data = self.receive(len)?;
        let csw = self.receive_csw()?;
        Ok((data, csw))
    }

    /// Issue a host-to-device command carrying `data`
    pub fn command_out(&mut self, cbw: &Cbw, data: &[u8]) -> UmsResult<Csw> {
        self.send_cbw(cbw)?;
        self.send_all(data)?;
        self.receive_csw()
    }
}
