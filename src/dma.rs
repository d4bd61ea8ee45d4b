//! Device-visible buffers and cache maintenance
//!
//! The controller moves data by DMA straight to and from memory, bypassing the
//! CPU data cache. Every region handed to hardware is therefore a [`DmaBuffer`]:
//! a heap allocation aligned to at least a cache line, padded to whole cache
//! lines, and never placed on a stack frame. While a request referencing the
//! buffer is queued the engine does not touch its contents; ownership returns
//! to the CPU only once the completion has been received.
//!
//! Physical and virtual addresses are identical in the boot environment this
//! engine targets, so [`DmaBuffer::addr`] is what gets programmed into the
//! controller.

use crate::error::{UmsError, UmsResult};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Cache line size assumed for alignment and padding
pub const CACHE_LINE_SIZE: usize = 64;

/// Page size used for the bulk transfer buffer
pub const PAGE_SIZE: usize = 4096;

/// Cache maintenance hooks provided by the platform
pub trait CacheMaintenance: Send + Sync {
    /// Write back and invalidate `[addr, addr + len)` before the controller
    /// DMA-reads it.
    fn clean_invalidate(&self, addr: usize, len: usize);

    /// Invalidate `[addr, addr + len)` after the controller DMA-wrote it.
    fn invalidate(&self, addr: usize, len: usize);
}

/// Cache maintenance for coherent platforms (and the loopback host)
#[derive(Debug, Default, Clone, Copy)]
pub struct CoherentCache;

impl CacheMaintenance for CoherentCache {
    fn clean_invalidate(&self, _addr: usize, _len: usize) {}

    fn invalidate(&self, _addr: usize, _len: usize) {}
}

/// A zero-initialised, DMA-capable region
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl DmaBuffer {
    /// Allocate `len` usable bytes aligned to `align`
    ///
    /// The allocation is rounded up to whole cache lines so cache operations on
    /// the buffer never touch a neighbouring object.
    pub fn new(len: usize, align: usize) -> UmsResult<Self> {
        if len == 0 {
            return Err(UmsError::Resource("zero-length DMA buffer".into()));
        }

        let align = align.max(CACHE_LINE_SIZE);
        let padded = len
            .checked_add(CACHE_LINE_SIZE - 1)
            .map(|n| n & !(CACHE_LINE_SIZE - 1))
            .ok_or_else(|| UmsError::Resource(format!("DMA buffer of {} bytes overflows", len)))?;
        let layout = Layout::from_size_align(padded, align)
            .map_err(|e| UmsError::Resource(format!("bad DMA buffer layout: {}", e)))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            UmsError::Resource(format!("failed to allocate {} byte DMA buffer", padded))
        })?;

        Ok(DmaBuffer { ptr, len, layout })
    }

    /// Allocate a buffer for one bus wrapper (CBW or CSW)
    pub fn for_wrapper(len: usize) -> UmsResult<Self> {
        Self::new(len, CACHE_LINE_SIZE)
    }

    /// Allocate a page-aligned bulk transfer buffer
    pub fn page_aligned(len: usize) -> UmsResult<Self> {
        Self::new(len, PAGE_SIZE)
    }

    /// Address programmed into the controller
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy a payload to the front of the buffer, returning the copied length
    pub fn fill_from(&mut self, payload: &[u8]) -> usize {
        let n = payload.len().min(self.len);
        self.as_mut_slice()[..n].copy_from_slice(&payload[..n]);
        n
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("0x{:x}", self.addr()))
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

// SAFETY: the buffer is a uniquely owned heap allocation.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_buffer_is_cache_line_aligned() {
        let buf = DmaBuffer::for_wrapper(31).unwrap();
        assert_eq!(buf.addr() % CACHE_LINE_SIZE, 0);
        assert_eq!(buf.len(), 31);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_transfer_buffer_is_page_aligned() {
        let buf = DmaBuffer::page_aligned(128 * 1024).unwrap();
        assert_eq!(buf.addr() % PAGE_SIZE, 0);
        assert_eq!(buf.align(), PAGE_SIZE);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(DmaBuffer::new(0, 64), Err(UmsError::Resource(_))));
    }

    #[test]
    fn test_fill_from_truncates() {
        let mut buf = DmaBuffer::for_wrapper(4).unwrap();
        assert_eq!(buf.fill_from(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        buf.zero();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0]);
    }
}
