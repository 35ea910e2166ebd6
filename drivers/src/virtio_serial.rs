//! Transport core for the virtio serial (console) device.
//!
//! Owns everything between the register bank and the port layer: feature
//! negotiation, queue-pair provisioning out of the DMA arena, the
//! power/lifecycle state machine, and the single interrupt line. Port
//! naming, flow control, and data transfer live above, behind the
//! [`PortSink`] trait.
//!
//! Queue-pair layout follows the device contract: pair ordinal `i` uses
//! device queues `2*i` and `2*i + 1`. With the multiport feature active,
//! ordinal 1 is the control pair and the remaining ordinals map to port
//! slots in discovery order.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use vport_abi::PAGE_SIZE_USIZE;
use vport_abi::addr::PhysAddr;
use vport_lib::{IrqMutex, klog_debug, klog_error, klog_info, klog_warn};
use vport_mm::dma::{self, AllocFlags};
use vport_mm::error::MmError;
use vport_mm::mmio::MmioRegion;

use crate::virtio::buffer::{PORT_BUFFER_TAG, PortBuffer};
use crate::virtio::device::{RegisterWindow, VirtioDeviceOps};
use crate::virtio::queue::{Virtqueue, vring_size};
use crate::virtio::{
    MAX_QUEUES_PER_DEVICE, VIRTIO_STATUS_ACKNOWLEDGE, VIRTIO_STATUS_DRIVER,
    VIRTIO_STATUS_DRIVER_OK, VIRTIO_STATUS_FAILED, VIRTQ_MAX_SIZE,
};

// =============================================================================
// Device contract constants
// =============================================================================

/// Feature bit: device supports multiple ports and a control queue pair.
pub const VIRTIO_CONSOLE_F_MULTIPORT: u32 = 1;

/// Port id used for messages that concern the device, not any port.
pub const PORT_BAD_ID: u32 = 0xFFFF_FFFF;

/// Console config space: columns (u16).
pub const CONSOLE_CFG_COLS: usize = 0;
/// Console config space: rows (u16).
pub const CONSOLE_CFG_ROWS: usize = 2;
/// Console config space: number of ports the device exposes (u32).
pub const CONSOLE_CFG_MAX_NR_PORTS: usize = 4;

/// Control event: driver (value 1) or device (value 0) readiness handshake.
pub const CTRL_DEVICE_READY: u16 = 0;
/// Control event: device added a port.
pub const CTRL_PORT_ADD: u16 = 1;
/// Control event: device removed a port.
pub const CTRL_PORT_REMOVE: u16 = 2;
/// Control event: driver accepted a port.
pub const CTRL_PORT_READY: u16 = 3;
/// Control event: port is a console.
pub const CTRL_CONSOLE_PORT: u16 = 4;
/// Control event: console resize.
pub const CTRL_RESIZE: u16 = 5;
/// Control event: port open state changed.
pub const CTRL_PORT_OPEN: u16 = 6;
/// Control event: port name follows the message.
pub const CTRL_PORT_NAME: u16 = 7;

/// Message format of the control queues.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ControlMessage {
    pub id: u32,
    pub event: u16,
    pub value: u16,
}

/// Queue-pair slots a device context carries.
pub const MAX_QUEUE_PAIRS: usize = (MAX_QUEUES_PER_DEVICE / 2) as usize;

/// Pair ordinal reserved for the control queues under multiport.
pub const CONTROL_PAIR_ORDINAL: u32 = 1;

/// Bytes per buffer stocked on the control receive queue.
const CONTROL_BUFFER_SIZE: usize = PAGE_SIZE_USIZE;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// No usable I/O resource was offered during hardware prepare.
    NoPortResource,
    /// The register bank could not be mapped.
    MappingFailed,
    /// The DMA arena could not satisfy an allocation.
    NoMemory,
    /// Interrupt handlers were already registered.
    IrqRegistration,
    /// Operation invalid in the current lifecycle state.
    NotReady,
}

impl core::fmt::Display for DriverError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoPortResource => write!(f, "no usable I/O port resource"),
            Self::MappingFailed => write!(f, "register bank mapping failed"),
            Self::NoMemory => write!(f, "out of DMA memory"),
            Self::IrqRegistration => write!(f, "interrupt handlers already registered"),
            Self::NotReady => write!(f, "invalid lifecycle state for operation"),
        }
    }
}

impl From<MmError> for DriverError {
    fn from(e: MmError) -> Self {
        match e {
            MmError::MappingFailed | MmError::InvalidAddress | MmError::NotAligned { .. } => {
                Self::MappingFailed
            }
            MmError::NoMemory
            | MmError::OutOfRange { .. }
            | MmError::NotInitialized
            | MmError::AlreadyInitialized => Self::NoMemory,
        }
    }
}

// =============================================================================
// Resources, lifecycle, collaborators
// =============================================================================

/// Hardware resources offered to [`PortsDevice::prepare_hardware`].
#[derive(Debug, Clone, Copy)]
pub enum HwResource {
    /// Register bank, either memory-mapped or in I/O port space.
    Port {
        base: PhysAddr,
        len: usize,
        memory_mapped: bool,
    },
    /// The device's interrupt line.
    Interrupt { line: u32 },
}

/// Where the device sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Fresh context, hardware not yet prepared.
    Removed,
    /// Registers mapped, features negotiated.
    HardwarePrepared,
    /// Queues live (or device marked FAILED), in D0.
    PoweredOn,
    /// Queues torn down, still prepared.
    PoweredOff,
    /// Registers unmapped, context dead.
    HardwareReleased,
}

/// Where the device is coming from when power returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrevPowerState {
    /// Light sleep; the device kept its configuration.
    Suspend,
    /// Full off; the device lost everything and the host must be re-told
    /// we are ready.
    FullOff,
}

/// The port layer above the transport.
///
/// The transport tells it when queues come and go and when control
/// messages arrive; it owns per-port state and outbound control traffic.
pub trait PortSink {
    /// Queues are live again after a power transition.
    fn renew_all_ports(&mut self);

    /// Queues are about to go away; stop all port activity.
    fn shutdown_all_ports(&mut self);

    /// Send a control message to the device on behalf of `port_id`.
    fn send_control_message(&mut self, port_id: u32, event: u16, value: u16);

    /// A control message arrived from the device.
    fn handle_control_event(&mut self, msg: &ControlMessage);
}

/// Process-wide source of device instance indices.
pub struct DeviceRegistry {
    next_index: AtomicU32,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            next_index: AtomicU32::new(0),
        }
    }

    /// Hand out the next instance index. Indices are never reused.
    pub fn allocate_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry used by production embedders.
pub static DEVICE_REGISTRY: DeviceRegistry = DeviceRegistry::new();

/// Interrupt-service function: returns true if the interrupt was ours.
pub type IsrFn = fn(device_index: u32) -> bool;
/// Deferred-procedure function: drains queues outside interrupt context.
pub type DpcFn = fn(device_index: u32);

/// The device's single interrupt line and its two-stage handlers.
pub struct InterruptBridge {
    isr: Option<IsrFn>,
    dpc: Option<DpcFn>,
    enabled: bool,
}

impl InterruptBridge {
    pub const fn new() -> Self {
        Self {
            isr: None,
            dpc: None,
            enabled: false,
        }
    }

    /// Register the handler pair. A second registration is refused.
    pub fn register(&mut self, isr: IsrFn, dpc: DpcFn) -> Result<(), DriverError> {
        if self.isr.is_some() || self.dpc.is_some() {
            return Err(DriverError::IrqRegistration);
        }
        self.isr = Some(isr);
        self.dpc = Some(dpc);
        Ok(())
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn dpc(&self) -> Option<DpcFn> {
        self.dpc
    }
}

impl Default for InterruptBridge {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Queue helpers
// =============================================================================

/// Port-array slot for a queue-pair ordinal, or None for the control pair.
pub(crate) fn slot_for_ordinal(ordinal: u32, multiport: bool) -> Option<u32> {
    if !multiport {
        return Some(ordinal);
    }
    match ordinal {
        CONTROL_PAIR_ORDINAL => None,
        o if o > CONTROL_PAIR_ORDINAL => Some(o - 1),
        o => Some(o),
    }
}

/// Query, allocate, and bind one queue.
///
/// Returns None when the device does not expose the queue, exposes an
/// unusable ring, or the arena cannot back it. Callers tolerate missing
/// queues; teardown and ordinal mapping stay consistent either way.
pub fn find_virtual_queue<D: VirtioDeviceOps>(dev: &mut D, index: u16) -> Option<Virtqueue> {
    let size = dev.queue_max_size(index);
    if size == 0 {
        return None;
    }
    if size > VIRTQ_MAX_SIZE || !size.is_power_of_two() {
        klog_error!("virtq {}: unusable ring size {}", index, size);
        return None;
    }

    let pages = vring_size(size).div_ceil(PAGE_SIZE_USIZE) as u32;
    let block = match dma::alloc_contiguous(pages, AllocFlags::ZERO, dev.dma_address_limit()) {
        Ok(block) => block,
        Err(e) => {
            klog_error!("virtq {}: ring allocation failed: {}", index, e);
            return None;
        }
    };

    // Ring state is initialized in the zeroed block before the device
    // learns its address.
    let vq = Virtqueue::new(index, size, block);
    dev.bind_queue(index, vq.ring_phys());
    Some(vq)
}

/// Shut a queue down, unbind it from the device, and release its memory.
/// An empty slot is a no-op.
pub fn delete_queue<D: VirtioDeviceOps>(dev: &mut D, slot: &mut Option<Virtqueue>) {
    if let Some(mut vq) = slot.take() {
        vq.shutdown();
        dev.unbind_queue(vq.index());
    }
}

/// Stock `vq` with device-writable buffers until its ring is full.
///
/// Buffers are allocated outside the lock; only the publish itself runs
/// under it. A full ring ends the loop normally; an allocation failure is
/// an error and propagates with nothing held.
pub fn fill_queue(
    vq: &mut Virtqueue,
    lock: &IrqMutex<()>,
    dma_limit: u64,
) -> Result<u32, DriverError> {
    let mut published = 0u32;
    loop {
        let buf = match PortBuffer::alloc(CONTROL_BUFFER_SIZE, dma_limit) {
            Ok(buf) => buf,
            Err(e) => {
                klog_error!(
                    "virtq {}: '{}' buffer allocation failed: {}",
                    vq.index(),
                    PORT_BUFFER_TAG,
                    e
                );
                return Err(DriverError::NoMemory);
            }
        };
        let guard = lock.lock();
        match vq.publish(buf, true) {
            Ok(()) => {
                drop(guard);
                published += 1;
            }
            Err((_, buf)) => {
                drop(guard);
                drop(buf);
                break;
            }
        }
    }
    Ok(published)
}

// =============================================================================
// Device context
// =============================================================================

/// Per-device transport context.
///
/// Generic over the register access so tests can substitute a recording
/// fake for the real register bank.
pub struct PortsDevice<D: VirtioDeviceOps> {
    device: D,
    device_index: u32,
    power_state: PowerState,
    pub(crate) device_ok: bool,
    host_multiport: bool,
    max_ports: u32,
    num_slots: u32,
    queues_live: bool,
    in_vqs: [Option<Virtqueue>; MAX_QUEUE_PAIRS],
    out_vqs: [Option<Virtqueue>; MAX_QUEUE_PAIRS],
    c_ivq: Option<Virtqueue>,
    c_ovq: Option<Virtqueue>,
    /// Serializes control-queue access between thread and DPC context.
    /// Present only when multiport is active.
    cvq_lock: Option<IrqMutex<()>>,
    interrupts: InterruptBridge,
}

impl<D: VirtioDeviceOps> PortsDevice<D> {
    pub fn new(registry: &DeviceRegistry, device: D) -> Self {
        Self {
            device,
            device_index: registry.allocate_index(),
            power_state: PowerState::Removed,
            device_ok: false,
            host_multiport: false,
            max_ports: 0,
            num_slots: 0,
            queues_live: false,
            in_vqs: [const { None }; MAX_QUEUE_PAIRS],
            out_vqs: [const { None }; MAX_QUEUE_PAIRS],
            c_ivq: None,
            c_ovq: None,
            cvq_lock: None,
            interrupts: InterruptBridge::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    #[inline]
    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    #[inline]
    pub fn is_device_ok(&self) -> bool {
        self.device_ok
    }

    #[inline]
    pub fn is_multiport(&self) -> bool {
        self.host_multiport
    }

    #[inline]
    pub fn max_ports(&self) -> u32 {
        self.max_ports
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn control_in(&self) -> Option<&Virtqueue> {
        self.c_ivq.as_ref()
    }

    pub fn control_out(&self) -> Option<&Virtqueue> {
        self.c_ovq.as_ref()
    }

    pub fn port_in(&self, slot: usize) -> Option<&Virtqueue> {
        self.in_vqs.get(slot)?.as_ref()
    }

    pub fn port_out(&self, slot: usize) -> Option<&Virtqueue> {
        self.out_vqs.get(slot)?.as_ref()
    }

    /// Number of port slots with a live receive queue.
    pub fn provisioned_port_pairs(&self) -> usize {
        self.in_vqs.iter().filter(|q| q.is_some()).count()
    }

    // -------------------------------------------------------------------------
    // Interrupt plumbing
    // -------------------------------------------------------------------------

    pub fn register_interrupts(&mut self, isr: IsrFn, dpc: DpcFn) -> Result<(), DriverError> {
        self.interrupts.register(isr, dpc)
    }

    pub fn enable_interrupts(&mut self) {
        self.interrupts.enable();
    }

    pub fn disable_interrupts(&mut self) {
        self.interrupts.disable();
    }

    #[inline]
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.is_enabled()
    }

    /// Interrupt-service check: reads (and thereby acknowledges) the ISR
    /// register. Returns true when the interrupt was this device's and a
    /// DPC should run.
    pub fn interrupt_service(&mut self) -> bool {
        if !self.interrupts.is_enabled() {
            return false;
        }
        self.device.read_isr() != 0
    }

    // -------------------------------------------------------------------------
    // Hardware prepare / release
    // -------------------------------------------------------------------------

    /// Find the register resource, map it, and bring the device through
    /// reset, acknowledge, and feature negotiation.
    ///
    /// Failures before the registers are reachable leave the context in
    /// `Removed`; failures after leave it `HardwarePrepared` with the
    /// device not OK, so a later power-up marks the device FAILED instead
    /// of touching queues.
    pub fn prepare_hardware(&mut self, resources: &[HwResource]) -> Result<(), DriverError> {
        let port = resources.iter().find_map(|r| match *r {
            HwResource::Port {
                base,
                len,
                memory_mapped,
            } => Some((base, len, memory_mapped)),
            _ => None,
        });
        let Some((base, len, memory_mapped)) = port else {
            klog_error!("vioserial{}: no usable port resource", self.device_index);
            return Err(DriverError::NoPortResource);
        };

        let window = if memory_mapped {
            match MmioRegion::map(base, len) {
                Ok(region) => RegisterWindow::Memory(region),
                Err(e) => {
                    klog_error!(
                        "vioserial{}: mapping registers at {:#x} failed: {}",
                        self.device_index,
                        base,
                        e
                    );
                    return Err(DriverError::MappingFailed);
                }
            }
        } else {
            // Port space is 16 bits wide; plain loads never reach it.
            let Ok(port_base) = u16::try_from(base.as_u64()) else {
                klog_error!(
                    "vioserial{}: port base {:#x} is outside I/O port space",
                    self.device_index,
                    base
                );
                return Err(DriverError::MappingFailed);
            };
            RegisterWindow::PortIo { base: port_base }
        };
        self.device.attach(window);
        self.power_state = PowerState::HardwarePrepared;

        self.device.reset();
        self.device
            .add_status(VIRTIO_STATUS_ACKNOWLEDGE | VIRTIO_STATUS_DRIVER);

        self.max_ports = 1;
        self.host_multiport = self.device.has_host_feature(VIRTIO_CONSOLE_F_MULTIPORT);
        if self.host_multiport {
            self.device.enable_guest_feature(VIRTIO_CONSOLE_F_MULTIPORT);
            let advertised = self.device.read_config_u32(CONSOLE_CFG_MAX_NR_PORTS);
            let ceiling = MAX_QUEUES_PER_DEVICE / 2 - 1;
            self.max_ports = if advertised > ceiling {
                klog_warn!(
                    "vioserial{}: device advertises {} ports, clamping to {}",
                    self.device_index,
                    advertised,
                    ceiling
                );
                ceiling
            } else {
                advertised
            };
            self.cvq_lock = Some(IrqMutex::new(()));
        }

        self.reserve_queue_slots(self.max_ports)?;
        self.device_ok = true;
        klog_info!(
            "vioserial{}: hardware prepared, {} port(s), multiport={}",
            self.device_index,
            self.max_ports,
            self.host_multiport
        );
        Ok(())
    }

    fn reserve_queue_slots(&mut self, ports: u32) -> Result<(), DriverError> {
        if ports as usize > MAX_QUEUE_PAIRS {
            klog_error!(
                "vioserial{}: no room for {} port queue pairs",
                self.device_index,
                ports
            );
            return Err(DriverError::NoMemory);
        }
        self.num_slots = ports;
        Ok(())
    }

    /// Drop every queue handle and give the register window back.
    /// Idempotent; safe from any state.
    pub fn release_hardware(&mut self) {
        for slot in 0..MAX_QUEUE_PAIRS {
            self.in_vqs[slot] = None;
            self.out_vqs[slot] = None;
        }
        self.c_ivq = None;
        self.c_ovq = None;
        self.cvq_lock = None;
        self.queues_live = false;
        self.num_slots = 0;

        if let RegisterWindow::Memory(mut region) = self.device.detach() {
            if region.is_mapped() {
                region.unmap();
            }
        }
        self.device_ok = false;
        self.power_state = PowerState::HardwareReleased;
    }

    // -------------------------------------------------------------------------
    // Queue materialization / teardown
    // -------------------------------------------------------------------------

    /// Materialize every queue pair and stock the control receive queue.
    /// Idempotent per power cycle.
    pub fn init_all_queues(&mut self) -> Result<(), DriverError> {
        if self.queues_live {
            klog_debug!("vioserial{}: queues already live", self.device_index);
            return Ok(());
        }

        let total_pairs = self.num_slots + if self.host_multiport { 1 } else { 0 };
        for ordinal in 0..total_pairs {
            let in_vq = find_virtual_queue(&mut self.device, (ordinal * 2) as u16);
            let out_vq = find_virtual_queue(&mut self.device, (ordinal * 2 + 1) as u16);
            match slot_for_ordinal(ordinal, self.host_multiport) {
                None => {
                    self.c_ivq = in_vq;
                    self.c_ovq = out_vq;
                }
                Some(slot) => {
                    self.in_vqs[slot as usize] = in_vq;
                    self.out_vqs[slot as usize] = out_vq;
                }
            }
        }

        if self.host_multiport {
            let limit = self.device.dma_address_limit();
            if let (Some(lock), Some(vq)) = (self.cvq_lock.as_ref(), self.c_ivq.as_mut()) {
                let stocked = fill_queue(vq, lock, limit)?;
                let index = vq.index();
                klog_debug!(
                    "vioserial{}: control rx stocked with {} buffers",
                    self.device_index,
                    stocked
                );
                self.device.notify_queue(index);
            }
        }

        self.queues_live = true;
        Ok(())
    }

    /// Tear down every queue. DRIVER_OK is withdrawn first so the device
    /// stops touching rings before any of them is unbound or freed.
    pub fn shutdown_all_queues(&mut self) {
        self.device.remove_status(VIRTIO_STATUS_DRIVER_OK);

        if let Some(lock) = self.cvq_lock.as_ref() {
            let _guard = lock.lock();
            delete_queue(&mut self.device, &mut self.c_ivq);
            delete_queue(&mut self.device, &mut self.c_ovq);
        }

        for slot in 0..MAX_QUEUE_PAIRS {
            delete_queue(&mut self.device, &mut self.in_vqs[slot]);
            delete_queue(&mut self.device, &mut self.out_vqs[slot]);
        }

        self.queues_live = false;
    }

    // -------------------------------------------------------------------------
    // Power transitions
    // -------------------------------------------------------------------------

    /// Enter D0: bring queues up, resume ports, declare DRIVER_OK. A
    /// context whose prepare went sour is marked FAILED instead.
    pub fn d0_entry(&mut self, sink: &mut dyn PortSink) -> Result<(), DriverError> {
        match self.power_state {
            PowerState::HardwarePrepared | PowerState::PoweredOff => {}
            other => {
                klog_warn!(
                    "vioserial{}: D0 entry refused from {:?}",
                    self.device_index,
                    other
                );
                return Err(DriverError::NotReady);
            }
        }

        if !self.device_ok {
            klog_info!(
                "vioserial{}: entering D0 with unusable device, flagging FAILED",
                self.device_index
            );
            self.device.add_status(VIRTIO_STATUS_FAILED);
        } else {
            self.init_all_queues()?;
            sink.renew_all_ports();
            self.device.add_status(VIRTIO_STATUS_DRIVER_OK);
        }

        self.power_state = PowerState::PoweredOn;
        Ok(())
    }

    /// Leave D0: ports stop first, then the queues they depend on.
    pub fn d0_exit(&mut self, sink: &mut dyn PortSink) -> Result<(), DriverError> {
        if self.power_state != PowerState::PoweredOn {
            klog_warn!(
                "vioserial{}: D0 exit refused from {:?}",
                self.device_index,
                self.power_state
            );
            return Err(DriverError::NotReady);
        }

        sink.shutdown_all_ports();
        self.shutdown_all_queues();
        self.power_state = PowerState::PoweredOff;
        Ok(())
    }

    /// Runs after the interrupt line is live, the earliest point where a
    /// control exchange can complete.
    ///
    /// An unusable device tells the host "not ready" (value 0); a device
    /// returning from full power-off re-announces readiness (value 1).
    /// Resume from light sleep needs neither.
    pub fn post_interrupts_enabled(
        &mut self,
        sink: &mut dyn PortSink,
        prev: PrevPowerState,
    ) -> Result<(), DriverError> {
        if !self.interrupts.is_enabled() {
            klog_warn!(
                "vioserial{}: readiness handshake before interrupts are live",
                self.device_index
            );
            return Err(DriverError::NotReady);
        }

        if !self.device_ok {
            sink.send_control_message(PORT_BAD_ID, CTRL_DEVICE_READY, 0);
        } else if prev == PrevPowerState::FullOff {
            sink.send_control_message(PORT_BAD_ID, CTRL_DEVICE_READY, 1);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Control queue draining (DPC path)
    // -------------------------------------------------------------------------

    /// Collect completed control messages, hand them to the sink, and
    /// restock their buffers. Runs in DPC context.
    pub fn drain_control_queue(&mut self, sink: &mut dyn PortSink) {
        let Some(lock) = self.cvq_lock.as_ref() else {
            return;
        };

        let mut processed = 0u32;
        loop {
            let popped = {
                let _guard = lock.lock();
                match self.c_ivq.as_mut() {
                    Some(vq) => vq.pop_used(),
                    None => None,
                }
            };
            let Some((buf, len)) = popped else {
                break;
            };

            if (len as usize) >= size_of::<ControlMessage>() {
                // SAFETY: the device wrote at least a full message into the
                // buffer we handed it.
                let msg = unsafe { ptr::read_unaligned(buf.as_ptr::<ControlMessage>()) };
                sink.handle_control_event(&msg);
                processed += 1;
            } else {
                klog_warn!(
                    "vioserial{}: runt control message ({} bytes)",
                    self.device_index,
                    len
                );
            }

            let _guard = lock.lock();
            if let Some(vq) = self.c_ivq.as_mut() {
                if let Err((_, buf)) = vq.publish(buf, true) {
                    drop(buf);
                }
            }
        }

        if processed > 0 {
            if let Some(index) = self.c_ivq.as_ref().map(|vq| vq.index()) {
                self.device.notify_queue(index);
            }
        }
    }
}
