//! Error type shared by the DMA arena and MMIO mapping.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    NoMemory,
    MappingFailed,
    InvalidAddress,
    NotAligned { address: u64, required: u64 },
    AlreadyInitialized,
    NotInitialized,
    OutOfRange { requested: u64, limit: u64 },
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of contiguous DMA memory"),
            Self::MappingFailed => write!(f, "physical-to-virtual mapping failed"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::NotAligned { address, required } => {
                write!(f, "address {:#x} not aligned to {:#x}", address, required)
            }
            Self::AlreadyInitialized => write!(f, "arena already initialized"),
            Self::NotInitialized => write!(f, "arena not initialized"),
            Self::OutOfRange { requested, limit } => {
                write!(f, "allocation end {:#x} above limit {:#x}", requested, limit)
            }
        }
    }
}

/// Convenience result type for memory operations.
pub type MmResult<T = ()> = Result<T, MmError>;
