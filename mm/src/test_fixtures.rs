//! Shared fixtures for in-kernel tests.
//!
//! Tests run in whatever environment hosts the suite runner, so they feed
//! the DMA arena from a static buffer and register an identity
//! physical-to-virtual translation. `ensure_test_environment()` is
//! idempotent; every test that touches the arena or MMIO mapping calls it
//! first.

use core::cell::UnsafeCell;

use crate::dma;
use crate::mmio;
use vport_abi::PAGE_SIZE_USIZE;
use vport_abi::addr::PhysAddr;
use vport_lib::InitFlag;

/// Pages of backing handed to the arena for test runs.
pub const TEST_ARENA_PAGES: usize = 64;

#[repr(C, align(4096))]
struct ArenaBacking(UnsafeCell<[u8; TEST_ARENA_PAGES * PAGE_SIZE_USIZE]>);

// SAFETY: the buffer is only ever accessed through the arena, which
// serializes access behind its own lock.
unsafe impl Sync for ArenaBacking {}

static ARENA_BACKING: ArenaBacking =
    ArenaBacking(UnsafeCell::new([0; TEST_ARENA_PAGES * PAGE_SIZE_USIZE]));
static ARENA_READY: InitFlag = InitFlag::new();

fn identity_translate(phys: PhysAddr, _size: usize) -> Option<u64> {
    Some(phys.as_u64())
}

/// Point the DMA arena and MMIO translation at the static backing, with
/// physical equal to virtual. First caller does the work; later calls are
/// no-ops.
pub fn ensure_test_environment() {
    if !ARENA_READY.claim() {
        return;
    }
    mmio::mmio_register_translation(identity_translate);

    let virt = ARENA_BACKING.0.get() as *mut u8;
    let phys = PhysAddr::new(virt as u64);
    // SAFETY: the backing is a static, page-aligned buffer reserved for the
    // arena and nothing else.
    if unsafe { dma::dma_init(virt, phys, TEST_ARENA_PAGES * PAGE_SIZE_USIZE) }.is_err() {
        ARENA_READY.reset();
    }
}
