//! Contiguous DMA arena.
//!
//! Virtqueue rings and transfer buffers must be physically contiguous and
//! visible to the device, so they come from a dedicated arena handed to us
//! by the embedding environment at startup. Allocation is first-fit over a
//! page-granular run table; each run carries a reference count so a block
//! can be shared and is returned to the arena exactly once, when the last
//! [`DmaBlock`] for it drops.
//!
//! Ownership of a block can be parked in device-visible structures (a ring
//! descriptor holds only the physical address) via [`DmaBlock::into_phys`]
//! and resumed later with [`reclaim`].

use core::ptr;

use bitflags::bitflags;

use crate::error::MmError;
use vport_abi::addr::PhysAddr;
use vport_abi::{PAGE_SIZE, PAGE_SIZE_USIZE};
use vport_lib::{IrqMutex, klog_warn};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the block before returning it.
        const ZERO = 1 << 0;
    }
}

/// Upper bound on arena size: 1024 pages (4 MiB).
pub const MAX_ARENA_PAGES: usize = 1024;

/// Marker for continuation pages inside a run.
const RUN_CONT: u16 = u16::MAX;

struct DmaArena {
    base_virt: u64,
    base_phys: u64,
    page_count: u32,
    free_pages: u32,
    initialized: bool,
    /// Run table: 0 = free, N = head of an N-page run, RUN_CONT = interior.
    run: [u16; MAX_ARENA_PAGES],
    /// Reference count, valid at run heads only.
    refs: [u16; MAX_ARENA_PAGES],
}

impl DmaArena {
    const fn new() -> Self {
        Self {
            base_virt: 0,
            base_phys: 0,
            page_count: 0,
            free_pages: 0,
            initialized: false,
            run: [0; MAX_ARENA_PAGES],
            refs: [0; MAX_ARENA_PAGES],
        }
    }

    fn page_index(&self, phys: PhysAddr) -> Option<usize> {
        let addr = phys.as_u64();
        if addr < self.base_phys {
            return None;
        }
        let idx = ((addr - self.base_phys) / PAGE_SIZE) as usize;
        if idx >= self.page_count as usize {
            return None;
        }
        Some(idx)
    }

    /// Index of a run head, or None for free/interior/foreign addresses.
    fn head_index(&self, phys: PhysAddr) -> Option<usize> {
        if !phys.is_aligned(PAGE_SIZE) {
            return None;
        }
        let idx = self.page_index(phys)?;
        match self.run[idx] {
            0 | RUN_CONT => None,
            _ => Some(idx),
        }
    }
}

static ARENA: IrqMutex<DmaArena> = IrqMutex::new(DmaArena::new());

/// Hand the arena its backing memory. Callable once.
///
/// # Safety
///
/// `virt` must point to `size` bytes of memory that stays valid and
/// exclusively owned by the arena, physically contiguous starting at
/// `phys`, with both addresses page aligned.
pub unsafe fn dma_init(virt: *mut u8, phys: PhysAddr, size: usize) -> Result<(), MmError> {
    if virt.is_null() || phys.is_null() {
        return Err(MmError::InvalidAddress);
    }
    if !phys.is_aligned(PAGE_SIZE) || (virt as u64) % PAGE_SIZE != 0 {
        return Err(MmError::NotAligned {
            address: phys.as_u64(),
            required: PAGE_SIZE,
        });
    }

    let mut pages = size / PAGE_SIZE_USIZE;
    if pages == 0 {
        return Err(MmError::InvalidAddress);
    }
    if pages > MAX_ARENA_PAGES {
        klog_warn!(
            "dma: arena truncated from {} to {} pages",
            pages,
            MAX_ARENA_PAGES
        );
        pages = MAX_ARENA_PAGES;
    }

    let mut arena = ARENA.lock();
    if arena.initialized {
        return Err(MmError::AlreadyInitialized);
    }
    arena.base_virt = virt as u64;
    arena.base_phys = phys.as_u64();
    arena.page_count = pages as u32;
    arena.free_pages = pages as u32;
    arena.initialized = true;
    Ok(())
}

/// Number of pages currently available for allocation.
pub fn free_page_count() -> u32 {
    ARENA.lock().free_pages
}

/// Reference count of the run starting at `phys`, or 0 if no such run.
pub fn block_refcount(phys: PhysAddr) -> u16 {
    let arena = ARENA.lock();
    match arena.head_index(phys) {
        Some(idx) => arena.refs[idx],
        None => 0,
    }
}

/// A physically contiguous, page-granular allocation from the arena.
///
/// The block returns to the arena when the last reference drops.
#[derive(Debug)]
pub struct DmaBlock {
    phys: PhysAddr,
    virt: *mut u8,
    pages: u32,
}

// SAFETY: the block is an exclusive (or refcounted) handle to arena memory;
// nothing about it is tied to a particular thread.
unsafe impl Send for DmaBlock {}

impl DmaBlock {
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    #[inline]
    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    #[inline]
    pub fn pages(&self) -> u32 {
        self.pages
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pages as usize * PAGE_SIZE_USIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.virt as *const T
    }

    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.virt as *mut T
    }

    /// Take another counted reference to the same block.
    pub fn clone_ref(&self) -> DmaBlock {
        let mut arena = ARENA.lock();
        if let Some(idx) = arena.head_index(self.phys) {
            arena.refs[idx] = arena.refs[idx].saturating_add(1);
        }
        DmaBlock {
            phys: self.phys,
            virt: self.virt,
            pages: self.pages,
        }
    }

    /// Park ownership in a device-visible structure: forget the handle and
    /// keep only the physical address. Pair with [`reclaim`]; the reference
    /// taken by this block stays held in the arena.
    pub fn into_phys(self) -> PhysAddr {
        let phys = self.phys;
        core::mem::forget(self);
        phys
    }
}

impl Drop for DmaBlock {
    fn drop(&mut self) {
        release(self.phys);
    }
}

/// Allocate `pages` contiguous pages whose physical range ends at or below
/// `limit` (exclusive upper bound on the end address).
pub fn alloc_contiguous(
    pages: u32,
    flags: AllocFlags,
    limit: u64,
) -> Result<DmaBlock, MmError> {
    if pages == 0 || pages as usize > MAX_ARENA_PAGES {
        return Err(MmError::NoMemory);
    }

    let mut arena = ARENA.lock();
    if !arena.initialized {
        return Err(MmError::NotInitialized);
    }

    let want = pages as usize;
    let count = arena.page_count as usize;
    let mut start = 0usize;
    'scan: while start + want <= count {
        for i in start..start + want {
            if arena.run[i] != 0 {
                start = i + 1;
                continue 'scan;
            }
        }

        let end_phys = arena.base_phys + ((start + want) as u64) * PAGE_SIZE;
        if end_phys > limit {
            return Err(MmError::OutOfRange {
                requested: end_phys,
                limit,
            });
        }

        arena.run[start] = pages as u16;
        for i in start + 1..start + want {
            arena.run[i] = RUN_CONT;
        }
        arena.refs[start] = 1;
        arena.free_pages -= pages;

        let phys = PhysAddr(arena.base_phys + (start as u64) * PAGE_SIZE);
        let virt = (arena.base_virt + (start as u64) * PAGE_SIZE) as *mut u8;
        drop(arena);

        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the run was just carved out of arena memory we own.
            unsafe { ptr::write_bytes(virt, 0, want * PAGE_SIZE_USIZE) };
        }

        return Ok(DmaBlock { phys, virt, pages });
    }

    Err(MmError::NoMemory)
}

/// Resume ownership of a block previously parked with [`DmaBlock::into_phys`].
///
/// Returns None if `phys` is not the head of a live run.
///
/// # Safety
///
/// The caller must be the party that parked the block; calling this twice
/// for one `into_phys` double-frees when both handles drop.
pub unsafe fn reclaim(phys: PhysAddr) -> Option<DmaBlock> {
    let arena = ARENA.lock();
    let idx = arena.head_index(phys)?;
    let pages = arena.run[idx] as u32;
    let virt = (arena.base_virt + (idx as u64) * PAGE_SIZE) as *mut u8;
    Some(DmaBlock { phys, virt, pages })
}

fn release(phys: PhysAddr) {
    let mut arena = ARENA.lock();
    let Some(idx) = arena.head_index(phys) else {
        klog_warn!("dma: release of unknown block {:#x}", phys);
        return;
    };

    let refs = arena.refs[idx];
    if refs > 1 {
        arena.refs[idx] = refs - 1;
        return;
    }

    let pages = arena.run[idx] as usize;
    for i in idx..idx + pages {
        arena.run[i] = 0;
    }
    arena.refs[idx] = 0;
    arena.free_pages += pages as u32;
}
