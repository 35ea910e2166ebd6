//! Volatile access to memory-mapped device registers.
//!
//! The embedding environment owns the page tables, so this module does not
//! map pages itself. It is handed a physical-to-virtual translation
//! function once at startup (for a kernel this is typically the direct
//! map) and builds [`MmioRegion`] windows on top of it. All register
//! access goes through `read`/`write`, which are volatile and bounds
//! checked in debug builds.

use core::ptr::{read_volatile, write_volatile};

use spin::Once;

use crate::error::MmError;
use vport_abi::addr::PhysAddr;

/// Translate a physical range to a CPU-addressable virtual base.
///
/// Returns `None` when the range cannot be made visible.
pub type PhysToVirtFn = fn(phys: PhysAddr, size: usize) -> Option<u64>;

static PHYS_TO_VIRT: Once<PhysToVirtFn> = Once::new();

/// Install the translation used by [`MmioRegion::map`]. First caller wins.
pub fn mmio_register_translation(translate: PhysToVirtFn) {
    PHYS_TO_VIRT.call_once(|| translate);
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    virt_base: u64,
    phys_base: u64,
    size: usize,
}

impl MmioRegion {
    #[inline]
    pub const fn empty() -> Self {
        Self {
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// Build a register window over `size` bytes of physical space at `phys`.
    pub fn map(phys: PhysAddr, size: usize) -> Result<Self, MmError> {
        if phys.is_null() || size == 0 {
            return Err(MmError::InvalidAddress);
        }
        if phys.checked_offset(size as u64).is_none() {
            return Err(MmError::InvalidAddress);
        }

        let translate = PHYS_TO_VIRT.get().ok_or(MmError::NotInitialized)?;
        let virt_base = translate(phys, size).ok_or(MmError::MappingFailed)?;

        Ok(Self {
            virt_base,
            phys_base: phys.as_u64(),
            size,
        })
    }

    /// Build a region over an already CPU-addressable range.
    ///
    /// # Safety
    ///
    /// `virt` must be valid for volatile reads and writes of `size` bytes
    /// for as long as the region is used.
    pub unsafe fn from_raw_parts(virt: *mut u8, phys: PhysAddr, size: usize) -> Self {
        Self {
            virt_base: virt as u64,
            phys_base: phys.as_u64(),
            size,
        }
    }

    /// Drop the window. The region reads as empty afterwards.
    pub fn unmap(&mut self) {
        *self = Self::empty();
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.virt_base != 0
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn virt_base(&self) -> u64 {
        self.virt_base
    }

    #[inline]
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr(self.phys_base)
    }

    /// Check that `offset..offset+size` stays inside the region.
    #[inline]
    pub fn is_valid_offset(&self, offset: usize, size: usize) -> bool {
        match offset.checked_add(size) {
            Some(end) => end <= self.size,
            None => false,
        }
    }

    #[inline]
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        let size = core::mem::size_of::<T>();

        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO read out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(
            offset % size == 0,
            "MMIO read misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset as u64) as *const T;
        unsafe { read_volatile(ptr) }
    }

    #[inline]
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        let size = core::mem::size_of::<T>();

        debug_assert!(
            self.is_valid_offset(offset, size),
            "MMIO write out of bounds: offset={}, size={}, region_size={}",
            offset,
            size,
            self.size
        );
        debug_assert!(
            offset % size == 0,
            "MMIO write misaligned: offset={}, align={}",
            offset,
            size
        );

        let ptr = (self.virt_base + offset as u64) as *mut T;
        unsafe { write_volatile(ptr, value) }
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.read(offset)
    }

    #[inline]
    pub fn read_u16(&self, offset: usize) -> u16 {
        self.read(offset)
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.read(offset)
    }

    #[inline]
    pub fn write_u8(&self, offset: usize, value: u8) {
        self.write(offset, value)
    }

    #[inline]
    pub fn write_u16(&self, offset: usize, value: u16) {
        self.write(offset, value)
    }

    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }
}
