//! Task-related ABI constants shared between the scheduler and the memory
//! manager. Only the sentinel the memory manager needs lives here; the rest
//! of the task/process ABI belongs to the scheduler crate.

/// Sentinel value for "no process" / "no owner", mirrored by the page
/// allocator's `INVALID_PAGE_FRAME` convention.
pub const INVALID_PROCESS_ID: u32 = 0xFFFF_FFFF;
