//! Bulk transfer primitives
//!
//! [`Transport`] owns the two bulk endpoints, one reusable request per
//! direction and the session's completion signal. Its `write` and `read`
//! move an arbitrary-length [`DmaBuffer`] region by splitting it into
//! controller-sized chunks, each issued as a blocking queue/complete round
//! trip. Only one request is ever outstanding.
//!
//! A failed queue or a request retired without completing marks the link as
//! lost. Further transfers are refused until the worker has seen the link
//! come back and cleared the mark, so nothing from an interrupted command
//! leaks onto the next connection.

use crate::controller::{
    ControllerBinding, EndpointId, EndpointKind, RequestId, TransferRequest, UdcController,
};
use crate::dma::{CacheMaintenance, DmaBuffer};
use crate::error::{UmsError, UmsResult};
use crate::sync::{completion_channel, CompletionWaiter, TransferStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bulk IN/OUT transport for one session
pub struct Transport {
    binding: ControllerBinding,
    cache: Arc<dyn CacheMaintenance>,
    ep_in: EndpointId,
    ep_out: EndpointId,
    req_in: TransferRequest,
    req_out: TransferRequest,
    waiter: CompletionWaiter,
    link_lost: Arc<AtomicBool>,
}

impl Transport {
    /// Allocate endpoints and requests on the bound controller
    ///
    /// On failure everything allocated so far is released again.
    pub fn open(binding: ControllerBinding, cache: Arc<dyn CacheMaintenance>) -> UmsResult<Self> {
        let driver = binding.driver();
        let max_packet = binding.max_packet();

        let ep_in = driver
            .endpoint_alloc(EndpointKind::BulkIn, max_packet)
            .map_err(|e| UmsError::Resource(format!("bulk IN endpoint: {}", e)))?;
        let ep_out = match driver.endpoint_alloc(EndpointKind::BulkOut, max_packet) {
            Ok(ep) => ep,
            Err(e) => {
                release_endpoint(driver, ep_in);
                return Err(UmsError::Resource(format!("bulk OUT endpoint: {}", e)));
            }
        };

        let requests = driver.request_alloc().and_then(|req_in| match driver.request_alloc() {
            Ok(req_out) => Ok((req_in, req_out)),
            Err(e) => {
                release_request(driver, req_in);
                Err(e)
            }
        });
        let (req_in, req_out) = match requests {
            Ok(pair) => pair,
            Err(e) => {
                release_endpoint(driver, ep_out);
                release_endpoint(driver, ep_in);
                return Err(UmsError::Resource(format!("transfer request: {}", e)));
            }
        };

        let (complete, waiter) = completion_channel();
        log::debug!(
            "Transport ready on {}: IN={:?} OUT={:?}, max transfer {} bytes",
            binding.kind(),
            ep_in,
            ep_out,
            binding.max_transfer()
        );

        Ok(Transport {
            ep_in,
            ep_out,
            req_in: TransferRequest {
                id: req_in,
                buf: 0,
                length: 0,
                complete: complete.clone(),
            },
            req_out: TransferRequest {
                id: req_out,
                buf: 0,
                length: 0,
                complete,
            },
            waiter,
            link_lost: Arc::new(AtomicBool::new(false)),
            binding,
            cache,
        })
    }

    /// Bulk IN and bulk OUT endpoints, in that order
    pub fn endpoints(&self) -> [EndpointId; 2] {
        [self.ep_in, self.ep_out]
    }

    pub fn binding(&self) -> &ControllerBinding {
        &self.binding
    }

    /// Flag the controller's OFFLINE notification should set
    pub fn link_lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.link_lost)
    }

    pub fn link_lost(&self) -> bool {
        self.link_lost.load(Ordering::SeqCst)
    }

    /// Accept transfers again after the host reconnected
    pub fn clear_link_lost(&self) {
        self.link_lost.store(false, Ordering::SeqCst);
    }

    /// Send the first `length` bytes of `buf` to the host
    ///
    /// Returns the number of bytes the host accepted; a short completion ends
    /// the transfer early without being an error.
    pub fn write(&mut self, buf: &DmaBuffer, length: usize) -> UmsResult<usize> {
        check_length(buf, length)?;
        if length == 0 {
            return Ok(0);
        }

        // The controller reads memory, not the cache.
        self.cache.clean_invalidate(buf.addr(), length);

        let max = self.binding.max_transfer();
        let mut sent = 0;
        while sent < length {
            let chunk = (length - sent).min(max);
            let done = self.submit(EndpointKind::BulkIn, buf.addr() + sent, chunk)?;
            sent += done;
            if done < chunk {
                log::debug!("Short IN transfer: {} of {} bytes, stopping at {}", done, chunk, sent);
                break;
            }
        }
        Ok(sent)
    }

    /// Receive up to `length` bytes from the host into the front of `buf`
    pub fn read(&mut self, buf: &mut DmaBuffer, length: usize) -> UmsResult<usize> {
        check_length(buf, length)?;
        if length == 0 {
            return Ok(0);
        }

        let max = self.binding.max_transfer();
        let mut received = 0;
        while received < length {
            let chunk = (length - received).min(max);
            let addr = buf.addr() + received;
            let done = self.submit(EndpointKind::BulkOut, addr, chunk)?;
            // Make the DMA-written bytes visible to the CPU.
            self.cache.invalidate(addr, done);
            received += done;
            if done < chunk {
                log::debug!(
                    "Short OUT transfer: {} of {} bytes, stopping at {}",
                    done,
                    chunk,
                    received
                );
                break;
            }
        }
        Ok(received)
    }

    /// Queue one request and block until it completes
    fn submit(&mut self, kind: EndpointKind, addr: usize, length: usize) -> UmsResult<usize> {
        let (ep, req) = match kind {
            EndpointKind::BulkIn => (self.ep_in, &mut self.req_in),
            EndpointKind::BulkOut => (self.ep_out, &mut self.req_out),
        };
        req.buf = addr;
        req.length = length;

        if self.link_lost.load(Ordering::SeqCst) {
            return Err(UmsError::Transfer(format!("link lost, not queueing on {:?}", ep)));
        }

        self.waiter.drain();
        if let Err(e) = self.binding.driver().request_queue(ep, req) {
            self.link_lost.store(true, Ordering::SeqCst);
            return Err(UmsError::Transfer(format!("queue on {:?} failed: {}", ep, e)));
        }

        let result = self.waiter.wait()?;
        if result.status != TransferStatus::Ok {
            self.link_lost.store(true, Ordering::SeqCst);
            return Err(UmsError::Transfer(format!(
                "{:?} request on {:?} ended with {:?} after {} bytes",
                kind, ep, result.status, result.actual
            )));
        }
        if result.actual > length {
            log::warn!(
                "Controller reported {} bytes for a {} byte request",
                result.actual,
                length
            );
            return Ok(length);
        }
        Ok(result.actual)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let driver = self.binding.driver();
        release_request(driver, self.req_in.id);
        release_request(driver, self.req_out.id);
        release_endpoint(driver, self.ep_in);
        release_endpoint(driver, self.ep_out);
        log::debug!("Transport released");
    }
}

fn check_length(buf: &DmaBuffer, length: usize) -> UmsResult<()> {
    if length > buf.len() {
        return Err(UmsError::Transfer(format!(
            "transfer of {} bytes exceeds {} byte buffer",
            length,
            buf.len()
        )));
    }
    Ok(())
}

fn release_request(driver: &dyn UdcController, req: RequestId) {
    if let Err(e) = driver.request_free(req) {
        log::warn!("Failed to free request {:?}: {}", req, e);
    }
}

fn release_endpoint(driver: &dyn UdcController, ep: EndpointId) {
    match driver.endpoint_free(ep) {
        Ok(()) => {}
        Err(UmsError::Unsupported(_)) => {
            log::debug!("Controller cannot free endpoint {:?}, leaving it allocated", ep);
        }
        Err(e) => log::warn!("Failed to free endpoint {:?}: {}", ep, e),
    }
}
