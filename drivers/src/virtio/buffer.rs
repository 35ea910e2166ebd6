//! DMA transfer buffers.
//!
//! A [`PortBuffer`] owns a device-reachable block from the DMA arena. While
//! a buffer sits on a ring the driver holds no handle to it; the descriptor's
//! physical address is the record of ownership, and the buffer is rebuilt
//! from it on completion (or during queue teardown).

use vport_abi::PAGE_SIZE_USIZE;
use vport_abi::addr::PhysAddr;
use vport_mm::dma::{self, AllocFlags, DmaBlock};
use vport_mm::error::MmError;

/// Allocation marker carried in diagnostics for transport buffers.
pub const PORT_BUFFER_TAG: &str = "vprt";

/// A page-granular buffer published to (or drained from) a virtqueue.
#[derive(Debug)]
pub struct PortBuffer {
    block: DmaBlock,
    /// Bytes of valid payload, set from the used-ring length on completion.
    len: u32,
}

impl PortBuffer {
    /// Allocate a zeroed buffer of at least `bytes`, rounded up to whole
    /// pages, reachable by a device limited to addresses below `limit`.
    pub fn alloc(bytes: usize, limit: u64) -> Result<PortBuffer, MmError> {
        let pages = bytes.div_ceil(PAGE_SIZE_USIZE) as u32;
        let block = dma::alloc_contiguous(pages, AllocFlags::ZERO, limit)?;
        Ok(PortBuffer { block, len: 0 })
    }

    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.block.phys()
    }

    /// Usable capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.block.len() as u32
    }

    /// Valid payload length (0 until a completion sets it).
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.block.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.block.as_mut_ptr()
    }

    /// Park the buffer in a ring descriptor, keeping only its physical
    /// address. Ownership is resumed by [`PortBuffer::reclaim`].
    pub fn into_phys(self) -> PhysAddr {
        self.block.into_phys()
    }

    /// Resume ownership of a buffer parked with [`PortBuffer::into_phys`],
    /// recording `len` bytes of valid payload.
    ///
    /// # Safety
    ///
    /// Same contract as [`dma::reclaim`]: the caller must be the party that
    /// parked the buffer, exactly once per park.
    pub unsafe fn reclaim(phys: PhysAddr, len: u32) -> Option<PortBuffer> {
        let block = dma::reclaim(phys)?;
        Some(PortBuffer { block, len })
    }
}
