//! Legacy split-ring virtqueues.
//!
//! Descriptor table, available ring, and used ring live in one physically
//! contiguous block, with the used ring starting on its own page boundary.
//! The device is handed the block's page frame number once; after that the
//! only cross-visible writes are ring entries and indices, ordered by the
//! barriers in [`super::virtio_wmb`] / [`super::virtio_rmb`].

use core::ptr;

use vport_abi::PAGE_SIZE_USIZE;
use vport_abi::addr::PhysAddr;
use vport_lib::align_up_usize;
use vport_lib::klog_warn;

use super::buffer::PortBuffer;
use super::{VIRTQ_DESC_F_WRITE, VIRTQ_MAX_SIZE, virtio_rmb, virtio_wmb};
use vport_mm::dma::DmaBlock;

/// The used ring must start on this boundary within the ring block.
pub const VRING_ALIGN: usize = PAGE_SIZE_USIZE;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

// VirtqAvail and VirtqUsed have variable-size ring arrays.
// We use accessor functions instead of fixed-size structs.

/// Byte offset of the used ring inside the ring block.
pub const fn vring_used_offset(num: u16) -> usize {
    let num = num as usize;
    // desc table + avail header/ring/used_event, rounded up to VRING_ALIGN.
    align_up_usize(16 * num + 6 + 2 * num, VRING_ALIGN)
}

/// Total bytes of a ring block for a `num`-entry queue.
pub const fn vring_size(num: u16) -> usize {
    let used = 6 + 8 * (num as usize);
    vring_used_offset(num) + align_up_usize(used, VRING_ALIGN)
}

/// Why a buffer could not be placed on a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Every descriptor is in flight.
    RingFull,
    /// The queue has been shut down and accepts nothing.
    Shutdown,
}

/// One legacy split-ring queue and the buffers it has in flight.
pub struct Virtqueue {
    index: u16,
    size: u16,
    block: DmaBlock,
    desc: *mut VirtqDesc,
    avail: *mut u8,
    used: *mut u8,
    free_head: u16,
    num_free: u16,
    next_avail: u16,
    last_used_idx: u16,
    accepting: bool,
    /// Bit per descriptor that currently holds a parked buffer.
    in_flight: u64,
}

// SAFETY: the raw pointers target the queue's own DMA block, which the
// queue exclusively owns for its whole lifetime.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// Build a queue over a zeroed ring block.
    ///
    /// `block` must span at least [`vring_size`]`(size)` bytes.
    pub fn new(index: u16, size: u16, block: DmaBlock) -> Self {
        debug_assert!(size > 0 && size <= VIRTQ_MAX_SIZE);
        debug_assert!(size.is_power_of_two());
        debug_assert!(block.len() >= vring_size(size));

        let desc = block.as_mut_ptr::<VirtqDesc>();
        // SAFETY: offsets stay inside the block per the debug_assert above.
        let avail = unsafe { block.as_mut_ptr::<u8>().add(16 * size as usize) };
        let used = unsafe { block.as_mut_ptr::<u8>().add(vring_used_offset(size)) };

        // Chain every descriptor into the free list.
        for i in 0..size {
            let next = if i + 1 < size { i + 1 } else { 0 };
            // SAFETY: i < size, inside the descriptor table.
            unsafe {
                ptr::write_volatile(
                    desc.add(i as usize),
                    VirtqDesc {
                        addr: 0,
                        len: 0,
                        flags: 0,
                        next,
                    },
                );
            }
        }

        Self {
            index,
            size,
            block,
            desc,
            avail,
            used,
            free_head: 0,
            num_free: size,
            next_avail: 0,
            last_used_idx: 0,
            accepting: true,
            in_flight: 0,
        }
    }

    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    #[inline]
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Physical base of the ring block (what the PFN register points at).
    #[inline]
    pub fn ring_phys(&self) -> PhysAddr {
        self.block.phys()
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Buffers currently parked on the ring.
    #[inline]
    pub fn outstanding(&self) -> u32 {
        self.in_flight.count_ones()
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        // SAFETY: avail header is inside the block.
        unsafe { (self.avail as *mut u16).add(1) }
    }

    fn avail_ring_ptr(&self, idx: u16) -> *mut u16 {
        // SAFETY: ring slot idx % size is inside the avail ring.
        unsafe { (self.avail as *mut u16).add(2 + (idx % self.size) as usize) }
    }

    fn used_idx_ptr(&self) -> *const u16 {
        // SAFETY: used header is inside the block.
        unsafe { (self.used as *const u16).add(1) }
    }

    fn used_ring_elem_ptr(&self, idx: u16) -> *const VirtqUsedElem {
        // SAFETY: ring slot idx % size is inside the used ring.
        let ring_base = unsafe { self.used.add(4) };
        unsafe { (ring_base as *const VirtqUsedElem).add((idx % self.size) as usize) }
    }

    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        debug_assert!(idx < self.size);
        // SAFETY: idx < size per the debug_assert.
        unsafe { self.desc.add(idx as usize) }
    }

    /// Place a buffer on the ring and publish it to the device.
    ///
    /// Ownership of the buffer moves into the ring. On failure the buffer
    /// comes back with the error so the caller decides its fate.
    pub fn publish(
        &mut self,
        buf: PortBuffer,
        device_writable: bool,
    ) -> Result<(), (QueueError, PortBuffer)> {
        if !self.accepting {
            return Err((QueueError::Shutdown, buf));
        }
        if self.num_free == 0 {
            return Err((QueueError::RingFull, buf));
        }

        let head = self.free_head;
        let desc = self.desc_ptr(head);
        // SAFETY: desc is a valid descriptor slot; only we touch next fields.
        let next_free = unsafe { ptr::read_volatile(desc) }.next;

        let capacity = buf.capacity();
        let phys = buf.into_phys();
        let flags = if device_writable { VIRTQ_DESC_F_WRITE } else { 0 };

        // SAFETY: writing the descriptor we just pulled off the free list.
        unsafe {
            ptr::write_volatile(
                desc,
                VirtqDesc {
                    addr: phys.as_u64(),
                    len: capacity,
                    flags,
                    next: 0,
                },
            );
            ptr::write_volatile(self.avail_ring_ptr(self.next_avail), head);
        }
        virtio_wmb();
        self.next_avail = self.next_avail.wrapping_add(1);
        // SAFETY: avail index write after the ring entry is fenced above.
        unsafe { ptr::write_volatile(self.avail_idx_ptr(), self.next_avail) };

        self.free_head = next_free;
        self.num_free -= 1;
        self.in_flight |= 1u64 << head;
        Ok(())
    }

    /// Has the device consumed entries we have not collected yet?
    pub fn has_used(&self) -> bool {
        virtio_rmb();
        // SAFETY: reading the device-written used index.
        let used_idx = unsafe { ptr::read_volatile(self.used_idx_ptr()) };
        used_idx != self.last_used_idx
    }

    /// Collect one completion, resuming ownership of its buffer.
    pub fn pop_used(&mut self) -> Option<(PortBuffer, u32)> {
        virtio_rmb();
        // SAFETY: reading the device-written used index.
        let used_idx = unsafe { ptr::read_volatile(self.used_idx_ptr()) };
        if used_idx == self.last_used_idx {
            return None;
        }

        // SAFETY: the fenced index read above covers this entry.
        let elem = unsafe { ptr::read_volatile(self.used_ring_elem_ptr(self.last_used_idx)) };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let head = elem.id as u16;
        if head >= self.size || self.in_flight & (1u64 << head) == 0 {
            klog_warn!(
                "virtq {}: used entry names bad descriptor {}",
                self.index,
                elem.id
            );
            return None;
        }

        let buf = self.retire_descriptor(head, elem.len)?;
        Some((buf, elem.len))
    }

    /// Stop accepting buffers and drain everything still parked on the ring.
    pub fn shutdown(&mut self) {
        self.accepting = false;
        let mut flight = self.in_flight;
        while flight != 0 {
            let head = flight.trailing_zeros() as u16;
            flight &= flight - 1;
            drop(self.retire_descriptor(head, 0));
        }
    }

    /// Pull the buffer out of descriptor `head` and put the slot back on
    /// the free list.
    fn retire_descriptor(&mut self, head: u16, len: u32) -> Option<PortBuffer> {
        let desc = self.desc_ptr(head);
        // SAFETY: head is in flight, so the descriptor holds a parked buffer.
        let entry = unsafe { ptr::read_volatile(desc) };

        // SAFETY: returning the slot to the driver-owned free list.
        unsafe {
            ptr::write_volatile(
                desc,
                VirtqDesc {
                    addr: 0,
                    len: 0,
                    flags: 0,
                    next: self.free_head,
                },
            );
        }
        self.free_head = head;
        self.num_free += 1;
        self.in_flight &= !(1u64 << head);

        let phys = PhysAddr::try_new(entry.addr)?;
        // SAFETY: the descriptor held the park record for exactly this buffer.
        unsafe { PortBuffer::reclaim(phys, len) }
    }
}

impl Drop for Virtqueue {
    fn drop(&mut self) {
        // Buffers still in flight must go back to the arena before the
        // ring block itself does.
        self.shutdown();
    }
}
