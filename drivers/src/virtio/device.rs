//! Device register access.
//!
//! [`VirtioDeviceOps`] is the seam between transport logic and the bus:
//! the serial core drives everything through it, [`VirtioIoDevice`] backs
//! it with the legacy register bank, and tests substitute a recording
//! fake. The register bank itself is reached through a [`RegisterWindow`]:
//! either a memory-mapped region or a base in x86 I/O port space, where
//! plain loads and stores do not reach the device and access must go
//! through `in`/`out` instructions.

use x86_64::instructions::port::Port;

use vport_abi::PAGE_SHIFT;
use vport_abi::addr::PhysAddr;
use vport_mm::mmio::MmioRegion;

// =============================================================================
// Legacy register bank layout
// =============================================================================

/// Host-supported feature bits (u32, read).
pub const REG_HOST_FEATURES: usize = 0x00;
/// Driver-acknowledged feature bits (u32, write).
pub const REG_GUEST_FEATURES: usize = 0x04;
/// Page frame number of the selected queue's ring (u32, read/write).
pub const REG_QUEUE_PFN: usize = 0x08;
/// Ring size of the selected queue (u16, read).
pub const REG_QUEUE_SIZE: usize = 0x0C;
/// Queue selector (u16, write).
pub const REG_QUEUE_SELECT: usize = 0x0E;
/// Queue notify doorbell (u16, write).
pub const REG_QUEUE_NOTIFY: usize = 0x10;
/// Device status (u8, read/write).
pub const REG_DEVICE_STATUS: usize = 0x12;
/// Interrupt status, read-to-ack (u8, read).
pub const REG_ISR_STATUS: usize = 0x13;
/// Start of device-specific configuration space.
pub const REG_DEVICE_CONFIG: usize = 0x14;

use super::DMA_ADDR_LIMIT;

/// Where a device's register bank lives and how to reach it.
#[derive(Debug, Clone, Copy)]
pub enum RegisterWindow {
    /// Nothing attached.
    Empty,
    /// Memory-mapped register bank, accessed with volatile loads/stores.
    Memory(MmioRegion),
    /// Register bank in x86 I/O port space, accessed with `in`/`out`.
    PortIo { base: u16 },
}

/// Operations the transport core needs from a virtio device.
///
/// Mirrors the legacy register protocol: a queue is addressed by first
/// writing the selector, then touching the size/PFN registers.
pub trait VirtioDeviceOps {
    /// Adopt a register window. Called once during hardware prepare.
    fn attach(&mut self, window: RegisterWindow);

    /// Give the register window back for unmapping.
    fn detach(&mut self) -> RegisterWindow;

    /// Write status 0, returning the device to its post-reset state.
    fn reset(&mut self);

    fn get_status(&self) -> u8;

    /// OR `bits` into the status register.
    fn add_status(&mut self, bits: u8);

    /// Clear `bits` from the status register.
    fn remove_status(&mut self, bits: u8);

    /// Does the host offer feature bit `bit`?
    fn has_host_feature(&self, bit: u32) -> bool;

    /// Acknowledge feature bit `bit` back to the host.
    fn enable_guest_feature(&mut self, bit: u32);

    /// Ring size of queue `index`; 0 means the queue is not exposed.
    fn queue_max_size(&mut self, index: u16) -> u16;

    /// Point queue `index` at a ring block starting at `ring_phys`.
    fn bind_queue(&mut self, index: u16, ring_phys: PhysAddr);

    /// Detach queue `index` from its ring.
    fn unbind_queue(&mut self, index: u16);

    /// Ring the doorbell for queue `index`.
    fn notify_queue(&mut self, index: u16);

    /// Read and acknowledge the interrupt status register.
    fn read_isr(&mut self) -> u8;

    /// Read a u32 from device-specific configuration space.
    fn read_config_u32(&self, offset: usize) -> u32;

    /// Exclusive upper bound on physical addresses this device can reach.
    fn dma_address_limit(&self) -> u64 {
        DMA_ADDR_LIMIT
    }
}

/// Legacy register-bank implementation of [`VirtioDeviceOps`].
pub struct VirtioIoDevice {
    window: RegisterWindow,
    guest_features: u32,
}

impl VirtioIoDevice {
    pub const fn new() -> Self {
        Self {
            window: RegisterWindow::Empty,
            guest_features: 0,
        }
    }

    pub fn is_attached(&self) -> bool {
        !matches!(self.window, RegisterWindow::Empty)
    }

    fn reg_read_u8(&self, offset: usize) -> u8 {
        match self.window {
            RegisterWindow::Memory(region) => region.read_u8(offset),
            // SAFETY: the window names a register bank this device owns.
            RegisterWindow::PortIo { base } => unsafe {
                Port::<u8>::new(base + offset as u16).read()
            },
            RegisterWindow::Empty => 0,
        }
    }

    fn reg_read_u16(&self, offset: usize) -> u16 {
        match self.window {
            RegisterWindow::Memory(region) => region.read_u16(offset),
            // SAFETY: the window names a register bank this device owns.
            RegisterWindow::PortIo { base } => unsafe {
                Port::<u16>::new(base + offset as u16).read()
            },
            RegisterWindow::Empty => 0,
        }
    }

    fn reg_read_u32(&self, offset: usize) -> u32 {
        match self.window {
            RegisterWindow::Memory(region) => region.read_u32(offset),
            // SAFETY: the window names a register bank this device owns.
            RegisterWindow::PortIo { base } => unsafe {
                Port::<u32>::new(base + offset as u16).read()
            },
            RegisterWindow::Empty => 0,
        }
    }

    fn reg_write_u8(&self, offset: usize, value: u8) {
        match self.window {
            RegisterWindow::Memory(region) => region.write_u8(offset, value),
            // SAFETY: the window names a register bank this device owns.
            RegisterWindow::PortIo { base } => unsafe {
                Port::<u8>::new(base + offset as u16).write(value)
            },
            RegisterWindow::Empty => {}
        }
    }

    fn reg_write_u16(&self, offset: usize, value: u16) {
        match self.window {
            RegisterWindow::Memory(region) => region.write_u16(offset, value),
            // SAFETY: the window names a register bank this device owns.
            RegisterWindow::PortIo { base } => unsafe {
                Port::<u16>::new(base + offset as u16).write(value)
            },
            RegisterWindow::Empty => {}
        }
    }

    fn reg_write_u32(&self, offset: usize, value: u32) {
        match self.window {
            RegisterWindow::Memory(region) => region.write_u32(offset, value),
            // SAFETY: the window names a register bank this device owns.
            RegisterWindow::PortIo { base } => unsafe {
                Port::<u32>::new(base + offset as u16).write(value)
            },
            RegisterWindow::Empty => {}
        }
    }
}

impl Default for VirtioIoDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtioDeviceOps for VirtioIoDevice {
    fn attach(&mut self, window: RegisterWindow) {
        self.window = window;
        self.guest_features = 0;
    }

    fn detach(&mut self) -> RegisterWindow {
        core::mem::replace(&mut self.window, RegisterWindow::Empty)
    }

    fn reset(&mut self) {
        self.reg_write_u8(REG_DEVICE_STATUS, 0);
        self.guest_features = 0;
    }

    fn get_status(&self) -> u8 {
        self.reg_read_u8(REG_DEVICE_STATUS)
    }

    fn add_status(&mut self, bits: u8) {
        let status = self.get_status();
        self.reg_write_u8(REG_DEVICE_STATUS, status | bits);
    }

    fn remove_status(&mut self, bits: u8) {
        let status = self.get_status();
        self.reg_write_u8(REG_DEVICE_STATUS, status & !bits);
    }

    fn has_host_feature(&self, bit: u32) -> bool {
        let features = self.reg_read_u32(REG_HOST_FEATURES);
        features & (1 << bit) != 0
    }

    fn enable_guest_feature(&mut self, bit: u32) {
        self.guest_features |= 1 << bit;
        self.reg_write_u32(REG_GUEST_FEATURES, self.guest_features);
    }

    fn queue_max_size(&mut self, index: u16) -> u16 {
        self.reg_write_u16(REG_QUEUE_SELECT, index);
        self.reg_read_u16(REG_QUEUE_SIZE)
    }

    fn bind_queue(&mut self, index: u16, ring_phys: PhysAddr) {
        self.reg_write_u16(REG_QUEUE_SELECT, index);
        self.reg_write_u32(REG_QUEUE_PFN, (ring_phys.as_u64() >> PAGE_SHIFT) as u32);
    }

    fn unbind_queue(&mut self, index: u16) {
        self.reg_write_u16(REG_QUEUE_SELECT, index);
        self.reg_write_u32(REG_QUEUE_PFN, 0);
    }

    fn notify_queue(&mut self, index: u16) {
        self.reg_write_u16(REG_QUEUE_NOTIFY, index);
    }

    fn read_isr(&mut self) -> u8 {
        self.reg_read_u8(REG_ISR_STATUS)
    }

    fn read_config_u32(&self, offset: usize) -> u32 {
        self.reg_read_u32(REG_DEVICE_CONFIG + offset)
    }
}
