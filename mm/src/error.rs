//! Unified error types for the memory management subsystem.
//!
//! This module consolidates error types shared by the page allocator and the
//! compaction engine so both report failures through one `Result` shape
//! instead of ad hoc sentinel integers.

use core::fmt;

/// Unified memory management error.
///
/// Variants are organized by the subsystem that typically produces them,
/// but any MM operation may return any variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    NoMemory,
    InvalidAddress,
    InvalidPhysicalAddress { address: u64 },
    NotAligned { address: u64, required: u64 },
    /// The PFN named does not belong to the zone it was looked up against.
    PfnOutOfZone { pfn: u32 },
    /// A capture slot was already occupied when the capture path tried to
    /// publish a newly-isolated block into it.
    CaptureSlotOccupied,
    /// No zone in the caller's zonelist matched the request.
    NoSuitableZone,
    /// The request's order makes compaction pointless (order 0: a single
    /// page never needs consolidating) or otherwise impermissible.
    CompactionNotPermitted,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory for page allocation"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::InvalidPhysicalAddress { address } => {
                write!(f, "invalid physical address {:#x}", address)
            }
            Self::NotAligned { address, required } => {
                write!(f, "address {:#x} not aligned to {:#x}", address, required)
            }
            Self::PfnOutOfZone { pfn } => write!(f, "pfn {} is outside the target zone", pfn),
            Self::CaptureSlotOccupied => write!(f, "capture slot already holds a page"),
            Self::NoSuitableZone => write!(f, "no zone in the zonelist admits this request"),
            Self::CompactionNotPermitted => {
                write!(f, "compaction is not permitted for this request")
            }
        }
    }
}

/// Convenience result type for memory management operations.
pub type MmResult<T = ()> = Result<T, MmError>;
