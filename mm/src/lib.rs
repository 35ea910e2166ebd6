//! Memory plumbing for the transport stack: the contiguous DMA arena that
//! backs virtqueue rings and data buffers, and volatile MMIO register access.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod dma;
pub mod dma_tests;
pub mod error;
pub mod mmio;
pub mod mmio_tests;
pub mod test_fixtures;

pub use dma::{AllocFlags, DmaBlock};
pub use error::{MmError, MmResult};
pub use mmio::MmioRegion;
