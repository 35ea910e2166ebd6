//! Typed physical and virtual addresses.
//!
//! Device rings and guest buffers live at physical addresses while the
//! driver touches them through virtual mappings. Keeping the two as
//! distinct `#[repr(transparent)]` newtypes means handing a virtual
//! pointer to a device register (or dereferencing a physical address)
//! fails to compile instead of corrupting memory at runtime.

use crate::PAGE_SIZE;

/// A physical memory address, as seen by the device.
///
/// Never dereferenced directly; it must be translated to a [`VirtAddr`]
/// first. x86_64 caps physical addresses at 52 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// A virtual memory address, as seen by the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

// =============================================================================
// PhysAddr implementation
// =============================================================================

impl PhysAddr {
    /// The null physical address.
    pub const NULL: Self = Self(0);

    /// Largest representable physical address (52-bit space).
    pub const MAX: Self = Self((1 << 52) - 1);

    /// Create a new physical address from a raw u64 value.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the 52-bit physical address limit.
    #[inline]
    pub fn new(addr: u64) -> Self {
        assert!(addr <= Self::MAX.0, "PhysAddr out of range: 0x{:x}", addr);
        Self(addr)
    }

    /// Create a new physical address if it is in range.
    #[inline]
    pub const fn try_new(addr: u64) -> Option<Self> {
        if addr <= Self::MAX.0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw u64 value of this address.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add an offset to this address (wrapping on overflow).
    #[inline]
    pub const fn offset(self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }

    /// Add an offset, returning None on overflow.
    #[inline]
    pub const fn checked_offset(self, off: u64) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Align address down to the given power-of-two alignment.
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "align must be power of two");
        Self(self.0 & !(align - 1))
    }

    /// Align address up to the given power-of-two alignment.
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "align must be power of two");
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Check if address is aligned to the given alignment.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

// =============================================================================
// VirtAddr implementation
// =============================================================================

impl VirtAddr {
    /// The null virtual address.
    pub const NULL: Self = Self(0);

    /// Create a new virtual address from a raw u64 value.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub fn new(addr: u64) -> Self {
        assert!(
            Self::is_canonical(addr),
            "VirtAddr not canonical: 0x{:x}",
            addr
        );
        Self(addr)
    }

    /// Create a new virtual address if it is canonical.
    #[inline]
    pub const fn try_new(addr: u64) -> Option<Self> {
        if Self::is_canonical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw u64 value of this address.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Convert to a const pointer of type T.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Convert to a mut pointer of type T.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Add an offset to this address (wrapping on overflow).
    #[inline]
    pub const fn offset(self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }

    /// Align address up to the given alignment.
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Check if address is aligned to the given alignment.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Returns true if the raw address is canonical on x86_64.
    #[inline]
    pub const fn is_canonical(addr: u64) -> bool {
        let sign = (addr >> 47) & 1;
        let upper = addr >> 48;
        if sign == 0 { upper == 0 } else { upper == 0xFFFF }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<PhysAddr> for u64 {
    #[inline]
    fn from(addr: PhysAddr) -> Self {
        addr.0
    }
}

impl From<VirtAddr> for u64 {
    #[inline]
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

impl<T> From<*const T> for VirtAddr {
    #[inline]
    fn from(ptr: *const T) -> Self {
        Self::new(ptr as u64)
    }
}

impl<T> From<*mut T> for VirtAddr {
    #[inline]
    fn from(ptr: *mut T) -> Self {
        Self::new(ptr as u64)
    }
}

// =============================================================================
// Display implementations
// =============================================================================

impl core::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl core::fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}
