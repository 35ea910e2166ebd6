//! Tests for the split-ring virtqueue: layout math, the publish/complete
//! buffer cycle, full-ring and shutdown behavior, and ring stocking.
//!
//! The device side is played by [`crate::test_fixtures::device_complete`],
//! which writes used-ring entries through the identity-translated arena
//! exactly like a host would.

use vport_abi::PAGE_SIZE_USIZE;
use vport_lib::testing::TestResult;
use vport_lib::{IrqMutex, assert_eq_test, assert_ok, assert_some, assert_test, fail, pass};
use vport_mm::dma::{self, AllocFlags, DmaBlock};
use vport_mm::test_fixtures::ensure_test_environment;

use crate::test_fixtures::{device_complete, device_peek_avail};
use crate::virtio::buffer::PortBuffer;
use crate::virtio::queue::{QueueError, Virtqueue, vring_size, vring_used_offset};
use crate::virtio_serial::{DriverError, fill_queue};

const RING: u16 = 8;

fn make_queue(index: u16, size: u16) -> Virtqueue {
    let pages = vring_size(size).div_ceil(PAGE_SIZE_USIZE) as u32;
    let block = dma::alloc_contiguous(pages, AllocFlags::ZERO, u64::MAX)
        .expect("ring block allocation");
    Virtqueue::new(index, size, block)
}

pub fn test_vring_layout() -> TestResult {
    // Used ring starts on its own page for every legal ring size.
    let mut size = 1u16;
    while size <= 64 {
        let used = vring_used_offset(size);
        assert_test!(used % PAGE_SIZE_USIZE == 0, "used ring not page aligned");
        assert_test!(
            used >= 16 * size as usize + 6 + 2 * size as usize,
            "used ring overlaps avail ring"
        );
        assert_test!(
            vring_size(size) >= used + 6 + 8 * size as usize,
            "ring block too small for used ring"
        );
        size *= 2;
    }

    // The 64-entry ring fills exactly two pages.
    assert_eq_test!(vring_used_offset(64), PAGE_SIZE_USIZE);
    assert_eq_test!(vring_size(64), 2 * PAGE_SIZE_USIZE);
    pass!()
}

pub fn test_queue_publish_complete_roundtrip() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();
    {
        let mut vq = make_queue(0, RING);
        let buf = assert_ok!(PortBuffer::alloc(PAGE_SIZE_USIZE, u64::MAX));
        let data = buf.as_mut_ptr::<u8>();
        // SAFETY: the buffer spans a full page.
        unsafe {
            for i in 0..16u8 {
                data.add(i as usize).write(0xA0 | (i & 0x0F));
            }
        }
        let written_phys = buf.phys();

        assert_ok!(vq.publish(buf, true).map_err(|(e, _)| e));
        assert_eq_test!(vq.outstanding(), 1);
        assert_test!(!vq.has_used(), "no completion yet");

        // SAFETY: ring lives in the identity-translated arena.
        let desc_id = unsafe { device_peek_avail(&vq, 0) };
        unsafe { device_complete(&vq, desc_id, 16) };
        assert_test!(vq.has_used(), "completion visible");

        let (buf, len) = assert_some!(vq.pop_used());
        assert_eq_test!(len, 16);
        assert_eq_test!(buf.phys(), written_phys);
        assert_eq_test!(vq.outstanding(), 0);

        // SAFETY: same page, same bytes.
        let echoed = unsafe { buf.as_ptr::<u8>().add(5).read() };
        assert_eq_test!(echoed, 0xA5);
    }
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

pub fn test_queue_ring_full() -> TestResult {
    ensure_test_environment();
    let mut vq = make_queue(0, RING);

    for _ in 0..RING {
        let buf = assert_ok!(PortBuffer::alloc(PAGE_SIZE_USIZE, u64::MAX));
        assert_ok!(vq.publish(buf, true).map_err(|(e, _)| e));
    }
    assert_eq_test!(vq.outstanding(), u32::from(RING));

    let extra = assert_ok!(PortBuffer::alloc(PAGE_SIZE_USIZE, u64::MAX));
    match vq.publish(extra, true) {
        Err((QueueError::RingFull, returned)) => {
            // Ownership came back with the error.
            assert_test!(returned.capacity() as usize == PAGE_SIZE_USIZE, "buffer intact");
        }
        Err((other, _)) => return fail!("expected RingFull, got {:?}", other),
        Ok(()) => return fail!("publish on a full ring must fail"),
    }
    pass!()
}

pub fn test_queue_shutdown_drains_and_rejects() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();
    let mut vq = make_queue(0, RING);
    let ring_pages = (vring_size(RING).div_ceil(PAGE_SIZE_USIZE)) as u32;

    for _ in 0..3 {
        let buf = assert_ok!(PortBuffer::alloc(PAGE_SIZE_USIZE, u64::MAX));
        assert_ok!(vq.publish(buf, true).map_err(|(e, _)| e));
    }
    assert_eq_test!(vq.outstanding(), 3);

    vq.shutdown();
    assert_test!(!vq.is_accepting(), "queue still accepting after shutdown");
    assert_eq_test!(vq.outstanding(), 0);
    // In-flight buffers went back; only the ring block is still held.
    assert_eq_test!(dma::free_page_count(), before - ring_pages);

    let late = assert_ok!(PortBuffer::alloc(PAGE_SIZE_USIZE, u64::MAX));
    match vq.publish(late, true) {
        Err((QueueError::Shutdown, _)) => {}
        other => return fail!("expected Shutdown, got {:?}", other.map_err(|(e, _)| e)),
    }

    drop(vq);
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

pub fn test_queue_ignores_bad_used_id() -> TestResult {
    ensure_test_environment();
    let mut vq = make_queue(0, RING);

    let buf = assert_ok!(PortBuffer::alloc(PAGE_SIZE_USIZE, u64::MAX));
    assert_ok!(vq.publish(buf, true).map_err(|(e, _)| e));

    // A used entry naming a descriptor that was never published.
    // SAFETY: ring lives in the identity-translated arena.
    unsafe { device_complete(&vq, 42, 4) };
    assert_test!(vq.pop_used().is_none(), "bad id must not yield a buffer");
    assert_eq_test!(vq.outstanding(), 1, "real buffer still parked");
    pass!()
}

pub fn test_fill_queue_stocks_ring() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();
    {
        let mut vq = make_queue(2, RING);
        let lock = IrqMutex::new(());

        let stocked = assert_ok!(fill_queue(&mut vq, &lock, u64::MAX));
        assert_eq_test!(stocked, u32::from(RING));
        assert_eq_test!(vq.outstanding(), u32::from(RING));

        // A second pass finds the ring already full and adds nothing.
        let again = assert_ok!(fill_queue(&mut vq, &lock, u64::MAX));
        assert_eq_test!(again, 0);
    }
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}

pub fn test_fill_queue_propagates_exhaustion() -> TestResult {
    ensure_test_environment();
    let before = dma::free_page_count();
    {
        let mut vq = make_queue(2, RING);
        let lock = IrqMutex::new(());

        // Drain the arena so the first stocking allocation must fail.
        let mut held: [Option<DmaBlock>; 64] = [const { None }; 64];
        let mut taken = 0usize;
        while taken < held.len() {
            match dma::alloc_contiguous(1, AllocFlags::empty(), u64::MAX) {
                Ok(block) => {
                    held[taken] = Some(block);
                    taken += 1;
                }
                Err(_) => break,
            }
        }

        match fill_queue(&mut vq, &lock, u64::MAX) {
            Err(DriverError::NoMemory) => {}
            other => return fail!("expected NoMemory, got {:?}", other),
        }
        assert_eq_test!(vq.outstanding(), 0);
    }
    assert_eq_test!(dma::free_page_count(), before);
    pass!()
}
