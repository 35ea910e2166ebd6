//! Shared type definitions for the vport transport stack.
//!
//! Everything here is `no_std` and dependency-free so that every other
//! crate in the workspace can pull these types in without cycles.

#![no_std]

pub mod addr;

pub use addr::{PhysAddr, VirtAddr};

/// Granularity of the DMA arena and of MMIO mappings, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `PAGE_SIZE` as a `usize`, for pointer and length arithmetic.
pub const PAGE_SIZE_USIZE: usize = PAGE_SIZE as usize;

/// Number of low-order zero bits in a page-aligned address.
pub const PAGE_SHIFT: u32 = 12;
