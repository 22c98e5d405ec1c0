//! Higher Half Direct Map (HHDM) translation.
//!
//! This module is the **single source of truth** for HHDM offset storage.
//! All HHDM translation should go through this module.
//!
//! # Usage
//!
//! ```ignore
//! use talus_abi::addr::PhysAddr;
//! use talus_mm::hhdm::{self, PhysAddrHhdm};
//!
//! // Initialize once during boot
//! hhdm::init(limine_hhdm_offset);
//!
//! // Convert physical to virtual
//! let phys = PhysAddr::new(0x1000);
//! let virt = phys.to_virt();  // Panics if HHDM not initialized
//!
//! // Or check availability first
//! if let Some(virt) = phys.try_to_virt() {
//!     // use virt
//! }
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use talus_abi::addr::{PhysAddr, VirtAddr};
use talus_lib::InitFlag;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static HHDM_INIT: InitFlag = InitFlag::new();

pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);

    if !HHDM_INIT.init_once() {
        panic!("HHDM already initialized - init() called twice!");
    }
}

#[inline]
pub fn is_available() -> bool {
    HHDM_INIT.is_set()
}

/// Get the raw HHDM offset value.
///
/// # Panics
///
/// Debug-panics if HHDM has not been initialized. In release builds,
/// returns 0 (which will cause incorrect translations).
#[inline]
pub fn offset() -> u64 {
    debug_assert!(
        is_available(),
        "HHDM not initialized - call hhdm::init() first"
    );
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Get the HHDM offset, returning None if not initialized.
#[inline]
pub fn try_offset() -> Option<u64> {
    if is_available() {
        Some(HHDM_OFFSET.load(Ordering::Acquire))
    } else {
        None
    }
}

/// Extension trait adding HHDM translation methods to `PhysAddr`.
pub trait PhysAddrHhdm {
    /// Convert physical address to virtual address via HHDM.
    ///
    /// Returns `VirtAddr::NULL` for null physical addresses.
    ///
    /// # Panics
    ///
    /// Panics if HHDM has not been initialized.
    fn to_virt(self) -> VirtAddr;

    /// Try to convert physical to virtual.
    ///
    /// Returns `None` if the address is null or HHDM is not available.
    fn try_to_virt(self) -> Option<VirtAddr>;

    /// Convert physical to virtual, returning `None` on overflow instead of
    /// panicking. Idempotent for addresses already past the HHDM base.
    fn to_virt_checked(self) -> Option<VirtAddr>;
}

impl PhysAddrHhdm for PhysAddr {
    #[inline]
    fn to_virt(self) -> VirtAddr {
        if self.is_null() {
            return VirtAddr::NULL;
        }
        assert!(is_available(), "HHDM not initialized");
        VirtAddr::new(self.as_u64() + offset())
    }

    #[inline]
    fn try_to_virt(self) -> Option<VirtAddr> {
        if self.is_null() {
            return None;
        }
        let off = try_offset()?;
        Some(VirtAddr::new(self.as_u64() + off))
    }

    fn to_virt_checked(self) -> Option<VirtAddr> {
        if self.is_null() {
            return None;
        }

        let hhdm = try_offset()?;

        if self.as_u64() >= hhdm {
            return Some(VirtAddr::new(self.as_u64()));
        }

        let virt = self.as_u64().checked_add(hhdm)?;
        Some(VirtAddr::new(virt))
    }
}

/// Extension trait adding HHDM reverse translation to `VirtAddr`.
pub trait VirtAddrHhdm {
    /// Convert virtual address back to physical assuming HHDM mapping.
    ///
    /// Returns `PhysAddr::NULL` for null virtual addresses.
    fn to_phys_hhdm(self) -> PhysAddr;
}

impl VirtAddrHhdm for VirtAddr {
    #[inline]
    fn to_phys_hhdm(self) -> PhysAddr {
        if self.is_null() {
            return PhysAddr::NULL;
        }
        PhysAddr::new(self.as_u64().wrapping_sub(offset()))
    }
}
