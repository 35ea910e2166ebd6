//! Tests for the contiguous DMA arena: allocation, limits, reference
//! counting, and the park/reclaim ownership handoff.

use crate::dma::{self, AllocFlags, DmaBlock};
use crate::error::MmError;
use crate::test_fixtures::{TEST_ARENA_PAGES, ensure_test_environment};
use vport_abi::PAGE_SIZE;
use vport_abi::addr::PhysAddr;
use vport_lib::testing::TestResult;
use vport_lib::{assert_eq_test, assert_ok, assert_some, assert_test, pass};

pub fn test_dma_alloc_free_roundtrip() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();

    let block = assert_ok!(dma::alloc_contiguous(4, AllocFlags::ZERO, u64::MAX));
    assert_eq_test!(block.pages(), 4);
    assert_test!(block.phys().is_aligned(PAGE_SIZE), "block not page aligned");
    assert_eq_test!(dma::free_page_count(), before - 4);

    let bytes = unsafe { core::slice::from_raw_parts(block.virt(), block.len()) };
    assert_test!(bytes.iter().all(|&b| b == 0), "block not zeroed");

    drop(block);
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

pub fn test_dma_exhaustion_returns_no_memory() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();

    let mut held: [Option<DmaBlock>; TEST_ARENA_PAGES] = [const { None }; TEST_ARENA_PAGES];
    let mut taken = 0usize;
    while taken < TEST_ARENA_PAGES {
        match dma::alloc_contiguous(1, AllocFlags::empty(), u64::MAX) {
            Ok(block) => {
                held[taken] = Some(block);
                taken += 1;
            }
            Err(MmError::NoMemory) => break,
            Err(e) => {
                drop(held);
                return unexpected(e);
            }
        }
    }

    assert_eq_test!(taken as u32, before, "arena should drain completely");
    assert_test!(
        matches!(
            dma::alloc_contiguous(1, AllocFlags::empty(), u64::MAX),
            Err(MmError::NoMemory)
        ),
        "exhausted arena must report NoMemory"
    );

    drop(held);
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

fn unexpected(e: MmError) -> TestResult {
    vport_lib::fail!("unexpected arena error: {:?}", e)
}

pub fn test_dma_address_limit_enforced() -> TestResult {
    ensure_test_environment();

    // The static backing lives far above one page, so a one-page limit can
    // never be satisfied.
    match dma::alloc_contiguous(1, AllocFlags::empty(), PAGE_SIZE) {
        Err(MmError::OutOfRange { .. }) => pass!(),
        other => vport_lib::fail!("expected OutOfRange, got {:?}", other.map(|b| b.phys())),
    }
}

pub fn test_dma_refcount_shared_release() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();

    let block = assert_ok!(dma::alloc_contiguous(1, AllocFlags::empty(), u64::MAX));
    let phys = block.phys();
    assert_eq_test!(dma::block_refcount(phys), 1);

    let shared = block.clone_ref();
    assert_eq_test!(dma::block_refcount(phys), 2);

    drop(block);
    assert_eq_test!(dma::free_page_count(), before - 1, "still referenced");
    assert_eq_test!(dma::block_refcount(phys), 1);

    drop(shared);
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

pub fn test_dma_park_and_reclaim() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();

    let block = assert_ok!(dma::alloc_contiguous(2, AllocFlags::empty(), u64::MAX));
    let virt = block.virt();
    let phys = block.into_phys();
    assert_eq_test!(dma::free_page_count(), before - 2, "parked block stays allocated");

    // SAFETY: resuming the ownership parked by into_phys above.
    let resumed = assert_some!(unsafe { dma::reclaim(phys) });
    assert_eq_test!(resumed.phys(), phys);
    assert_eq_test!(resumed.virt(), virt);
    assert_eq_test!(resumed.pages(), 2);

    drop(resumed);
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

pub fn test_dma_reclaim_rejects_foreign_address() -> TestResult {
    ensure_test_environment();

    // SAFETY: a foreign address is rejected before any ownership changes.
    let resumed = unsafe { dma::reclaim(PhysAddr::new(PAGE_SIZE)) };
    assert_test!(resumed.is_none(), "foreign address must not reclaim");
    pass!()
}
