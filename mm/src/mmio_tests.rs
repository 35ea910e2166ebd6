use crate::dma::{self, AllocFlags};
use crate::error::MmError;
use crate::mmio::MmioRegion;
use crate::test_fixtures::ensure_test_environment;
use vport_abi::addr::PhysAddr;
use vport_lib::testing::TestResult;
use vport_lib::{assert_eq_test, assert_ok, assert_test, pass};

pub fn test_mmio_empty_region_state() -> TestResult {
    let region = MmioRegion::empty();

    assert_test!(!region.is_mapped(), "empty region should not be mapped");
    assert_eq_test!(region.size(), 0);
    assert_eq_test!(region.virt_base(), 0);
    assert_test!(region.phys_base().is_null(), "empty phys_base should be null");
    pass!()
}

pub fn test_mmio_is_valid_offset_overflow() -> TestResult {
    let region = MmioRegion::empty();

    assert_test!(!region.is_valid_offset(usize::MAX, 1));
    assert_test!(!region.is_valid_offset(usize::MAX - 10, 20));
    assert_test!(region.is_valid_offset(0, 0));
    assert_test!(!region.is_valid_offset(1, 0));
    pass!()
}

pub fn test_mmio_read_write_roundtrip() -> TestResult {
    let mut backing = [0u64; 8];
    // SAFETY: the stack buffer outlives the region and is used through it only.
    let region = unsafe {
        MmioRegion::from_raw_parts(backing.as_mut_ptr() as *mut u8, PhysAddr::new(0x1000), 64)
    };

    region.write_u32(8, 0xA1B2_C3D4);
    assert_eq_test!(region.read_u32(8), 0xA1B2_C3D4);
    assert_eq_test!(region.read_u8(8), 0xD4, "little-endian low byte");
    assert_eq_test!(region.read_u8(11), 0xA1, "little-endian high byte");

    region.write_u16(0, 0xBEEF);
    assert_eq_test!(region.read_u16(0), 0xBEEF);

    drop(region);
    assert_eq_test!(backing[1] as u32, 0xA1B2_C3D4);
    pass!()
}

pub fn test_mmio_map_through_translation() -> TestResult {
    ensure_test_environment();

    let block = assert_ok!(dma::alloc_contiguous(1, AllocFlags::ZERO, u64::MAX));
    let region = assert_ok!(MmioRegion::map(block.phys(), block.len()));
    assert_test!(region.is_mapped());
    assert_eq_test!(region.phys_base(), block.phys());

    region.write_u32(16, 0x1234_5678);
    let raw = unsafe { core::ptr::read_volatile(block.virt().add(16) as *const u32) };
    assert_eq_test!(raw, 0x1234_5678, "region writes must land in the backing");
    pass!()
}

pub fn test_mmio_map_rejects_null_and_empty() -> TestResult {
    assert_test!(matches!(
        MmioRegion::map(PhysAddr::NULL, 16),
        Err(MmError::InvalidAddress)
    ));
    assert_test!(matches!(
        MmioRegion::map(PhysAddr::new(0x1000), 0),
        Err(MmError::InvalidAddress)
    ));
    pass!()
}

pub fn test_mmio_unmap_clears_region() -> TestResult {
    let mut backing = [0u8; 16];
    // SAFETY: see test_mmio_read_write_roundtrip.
    let mut region =
        unsafe { MmioRegion::from_raw_parts(backing.as_mut_ptr(), PhysAddr::new(0x2000), 16) };
    assert_test!(region.is_mapped());

    region.unmap();
    assert_test!(!region.is_mapped());
    assert_eq_test!(region.size(), 0);
    pass!()
}
