//! Memory and paging constants.
//!
//! This module re-exports memory and paging constants from
//! `talus_abi::arch::x86_64`. All code should use the type-safe `PageFlags`
//! bitflags for page table operations.

// INVALID_PROCESS_ID is canonical in the task module.
pub use talus_abi::task::INVALID_PROCESS_ID;

// Re-export paging constants from abi.
pub use talus_abi::arch::x86_64::paging::{
    ENTRIES_PER_PAGE_TABLE, PAGE_ALIGN, PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_SIZE_4KB,
    PAGE_SIZE_4KB_USIZE, STACK_ALIGN,
};

// Re-export PageFlags for type-safe flag manipulation.
pub use talus_abi::arch::x86_64::paging::PageFlags;
