//! Recording doubles for transport tests: a fake register bank that
//! journals every side effect, a port sink that journals every callback,
//! and a device-side helper that completes published buffers the way the
//! host would.

use vport_abi::PAGE_SHIFT;
use vport_abi::addr::PhysAddr;

use crate::virtio::device::{RegisterWindow, VirtioDeviceOps};
use crate::virtio::queue::{Virtqueue, vring_used_offset};
use crate::virtio::{MAX_QUEUES_PER_DEVICE, virtio_wmb};
use crate::virtio_serial::{
    CONSOLE_CFG_MAX_NR_PORTS, ControlMessage, PortSink, VIRTIO_CONSOLE_F_MULTIPORT,
};

// =============================================================================
// Fake register bank
// =============================================================================

const JOURNAL_CAP: usize = 256;
const QUEUE_COUNT: usize = MAX_QUEUES_PER_DEVICE as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeEvent {
    Reset,
    StatusAdded(u8),
    StatusRemoved(u8),
    QueueBound { index: u16, pfn: u32 },
    QueueUnbound(u16),
    Notified(u16),
}

/// [`VirtioDeviceOps`] double. Holds the register state in plain fields
/// and appends every state-changing call to a journal so tests can assert
/// on ordering, not just final state.
pub struct FakeDevice {
    pub host_features: u32,
    pub guest_features: u32,
    pub status: u8,
    pub isr: u8,
    pub max_nr_ports: u32,
    pub dma_limit: u64,
    queue_sizes: [u16; QUEUE_COUNT],
    bound_pfns: [u32; QUEUE_COUNT],
    window: RegisterWindow,
    journal: [FakeEvent; JOURNAL_CAP],
    journal_len: usize,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            host_features: 0,
            guest_features: 0,
            status: 0,
            isr: 0,
            max_nr_ports: 0,
            // The arena backing tests lives in static memory, far above
            // any realistic device address bound.
            dma_limit: u64::MAX,
            queue_sizes: [0; QUEUE_COUNT],
            bound_pfns: [0; QUEUE_COUNT],
            window: RegisterWindow::Empty,
            journal: [FakeEvent::Reset; JOURNAL_CAP],
            journal_len: 0,
        }
    }

    /// A device without the multiport feature; one implicit port.
    pub fn singleport(ring_size: u16) -> Self {
        let mut dev = Self::new();
        dev.queue_sizes[0] = ring_size;
        dev.queue_sizes[1] = ring_size;
        dev
    }

    /// A multiport device advertising `ports` ports with uniform rings.
    pub fn multiport(ports: u32, ring_size: u16) -> Self {
        let mut dev = Self::new();
        dev.host_features = 1 << VIRTIO_CONSOLE_F_MULTIPORT;
        dev.max_nr_ports = ports;
        dev.queue_sizes = [ring_size; QUEUE_COUNT];
        dev
    }

    pub fn set_queue_size(&mut self, index: u16, size: u16) {
        self.queue_sizes[index as usize] = size;
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.window, RegisterWindow::Empty)
    }

    /// The register window the transport handed over, so tests can check
    /// that port-space resources are not driven through memory accesses.
    pub fn window(&self) -> RegisterWindow {
        self.window
    }

    pub fn bound_pfn(&self, index: u16) -> u32 {
        self.bound_pfns[index as usize]
    }

    pub fn journal(&self) -> &[FakeEvent] {
        &self.journal[..self.journal_len]
    }

    pub fn notify_count(&self, index: u16) -> usize {
        self.journal()
            .iter()
            .filter(|e| **e == FakeEvent::Notified(index))
            .count()
    }

    fn record(&mut self, event: FakeEvent) {
        if self.journal_len < JOURNAL_CAP {
            self.journal[self.journal_len] = event;
            self.journal_len += 1;
        }
    }
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtioDeviceOps for FakeDevice {
    fn attach(&mut self, window: RegisterWindow) {
        self.window = window;
    }

    fn detach(&mut self) -> RegisterWindow {
        core::mem::replace(&mut self.window, RegisterWindow::Empty)
    }

    fn reset(&mut self) {
        self.status = 0;
        self.guest_features = 0;
        self.record(FakeEvent::Reset);
    }

    fn get_status(&self) -> u8 {
        self.status
    }

    fn add_status(&mut self, bits: u8) {
        self.status |= bits;
        self.record(FakeEvent::StatusAdded(bits));
    }

    fn remove_status(&mut self, bits: u8) {
        self.status &= !bits;
        self.record(FakeEvent::StatusRemoved(bits));
    }

    fn has_host_feature(&self, bit: u32) -> bool {
        self.host_features & (1 << bit) != 0
    }

    fn enable_guest_feature(&mut self, bit: u32) {
        self.guest_features |= 1 << bit;
    }

    fn queue_max_size(&mut self, index: u16) -> u16 {
        self.queue_sizes
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    fn bind_queue(&mut self, index: u16, ring_phys: PhysAddr) {
        let pfn = (ring_phys.as_u64() >> PAGE_SHIFT) as u32;
        self.bound_pfns[index as usize] = pfn;
        self.record(FakeEvent::QueueBound { index, pfn });
    }

    fn unbind_queue(&mut self, index: u16) {
        self.bound_pfns[index as usize] = 0;
        self.record(FakeEvent::QueueUnbound(index));
    }

    fn notify_queue(&mut self, index: u16) {
        self.record(FakeEvent::Notified(index));
    }

    fn read_isr(&mut self) -> u8 {
        let isr = self.isr;
        self.isr = 0;
        isr
    }

    fn read_config_u32(&self, offset: usize) -> u32 {
        match offset {
            CONSOLE_CFG_MAX_NR_PORTS => self.max_nr_ports,
            _ => 0,
        }
    }

    fn dma_address_limit(&self) -> u64 {
        self.dma_limit
    }
}

// =============================================================================
// Recording port sink
// =============================================================================

const SINK_JOURNAL_CAP: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Renewed,
    Shutdown,
    Sent { port_id: u32, event: u16, value: u16 },
    Received { id: u32, event: u16, value: u16 },
}

/// [`PortSink`] double that journals every callback.
pub struct RecordingSink {
    journal: [SinkEvent; SINK_JOURNAL_CAP],
    journal_len: usize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            journal: [SinkEvent::Renewed; SINK_JOURNAL_CAP],
            journal_len: 0,
        }
    }

    pub fn journal(&self) -> &[SinkEvent] {
        &self.journal[..self.journal_len]
    }

    fn record(&mut self, event: SinkEvent) {
        if self.journal_len < SINK_JOURNAL_CAP {
            self.journal[self.journal_len] = event;
            self.journal_len += 1;
        }
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PortSink for RecordingSink {
    fn renew_all_ports(&mut self) {
        self.record(SinkEvent::Renewed);
    }

    fn shutdown_all_ports(&mut self) {
        self.record(SinkEvent::Shutdown);
    }

    fn send_control_message(&mut self, port_id: u32, event: u16, value: u16) {
        self.record(SinkEvent::Sent {
            port_id,
            event,
            value,
        });
    }

    fn handle_control_event(&mut self, msg: &ControlMessage) {
        self.record(SinkEvent::Received {
            id: msg.id,
            event: msg.event,
            value: msg.value,
        });
    }
}

// =============================================================================
// Device-side completion
// =============================================================================

/// Complete one published descriptor the way the host would: write a used
/// element and advance the used index.
///
/// # Safety
///
/// The ring must live in the identity-translated test arena and `desc_id`
/// must name a descriptor the driver has published.
pub unsafe fn device_complete(vq: &Virtqueue, desc_id: u32, len: u32) {
    let base = vq.ring_phys().as_u64() as *mut u8;
    let used = base.add(vring_used_offset(vq.size()));

    let idx_ptr = used.add(2) as *mut u16;
    let idx = idx_ptr.read_volatile();
    let slot = idx as usize % vq.size() as usize;

    let elem = used.add(4 + slot * 8) as *mut u32;
    elem.write_volatile(desc_id);
    elem.add(1).write_volatile(len);

    virtio_wmb();
    idx_ptr.write_volatile(idx.wrapping_add(1));
}

/// Read the buffer address out of descriptor `desc_id`, so the device
/// side can write into a buffer the driver published.
///
/// # Safety
///
/// Same requirements as [`device_complete`].
pub unsafe fn device_desc_addr(vq: &Virtqueue, desc_id: u32) -> u64 {
    let base = vq.ring_phys().as_u64() as *const u8;
    let addr_field = base.add(desc_id as usize * 16) as *const u64;
    addr_field.read_volatile()
}

/// Read the descriptor id the driver most recently placed on the avail
/// ring, so a completion can echo it back.
///
/// # Safety
///
/// Same requirements as [`device_complete`].
pub unsafe fn device_peek_avail(vq: &Virtqueue, position: u16) -> u32 {
    let base = vq.ring_phys().as_u64() as *const u8;
    // Avail ring follows the descriptor table: flags, idx, then the ring.
    let avail = base.add(vq.size() as usize * 16);
    let slot = position as usize % vq.size() as usize;
    let entry = avail.add(4 + slot * 2) as *const u16;
    entry.read_volatile() as u32
}
