//! VirtIO common infrastructure
//!
//! Shared constants, the device-operations trait, split-ring queues, and
//! the DMA-backed transfer buffers used by the serial transport.

pub mod buffer;
pub mod device;
pub mod queue;

// =============================================================================
// VirtIO Device Status Bits
// =============================================================================

/// Device status: OS has found the device
pub const VIRTIO_STATUS_ACKNOWLEDGE: u8 = 0x01;
/// Device status: OS knows how to drive the device
pub const VIRTIO_STATUS_DRIVER: u8 = 0x02;
/// Device status: Driver is ready to drive the device
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 0x04;
/// Device status: Something went wrong (device should be reset)
pub const VIRTIO_STATUS_FAILED: u8 = 0x80;

// =============================================================================
// VirtIO Queue Descriptor Flags
// =============================================================================

/// Descriptor continues via the `next` field
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Buffer is device-writable (vs device-readable)
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

// =============================================================================
// Transport-wide limits
// =============================================================================

/// Hard cap on queues a single device may expose.
pub const MAX_QUEUES_PER_DEVICE: u32 = 32;

/// Largest ring the driver is prepared to drive.
pub const VIRTQ_MAX_SIZE: u16 = 64;

/// Exclusive upper bound on device-visible physical addresses. The legacy
/// register interface carries 40 usable address bits, so every ring and
/// buffer must sit below this line.
pub const DMA_ADDR_LIMIT: u64 = 1 << 40;

// =============================================================================
// VirtIO Memory Barrier Abstractions
// =============================================================================

/// VirtIO write memory barrier.
///
/// Descriptor and ring-entry writes must be visible to the device before
/// the avail index that publishes them.
#[inline(always)]
pub fn virtio_wmb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}

/// VirtIO read memory barrier.
///
/// The used index must be observed before the completion entries it covers.
#[inline(always)]
pub fn virtio_rmb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
}
