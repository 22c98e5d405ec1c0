//! Process-wide compaction knobs, mirrored on the style of
//! [`talus_lib::klog`]'s level atomic and the page allocator's watermark
//! constants: plain atomics, no singleton struct or DI container.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// `extfrag_threshold` sysctl: fragmentation index values below this are
/// considered "too fragmented to be worth compacting toward," per
/// [`super::suitability::fragmentation_index`]'s documented range.
static EXTFRAG_THRESHOLD: AtomicI32 = AtomicI32::new(500);

pub fn extfrag_threshold() -> i32 {
    EXTFRAG_THRESHOLD.load(Ordering::Relaxed)
}

/// Clamps to `fragmentation_index`'s `[-1000, 1000]` range before storing.
pub fn set_extfrag_threshold(value: i32) {
    EXTFRAG_THRESHOLD.store(value.clamp(-1000, 1000), Ordering::Relaxed);
}

/// Stand-in for `fatal_signal_pending(current)`: tests flip this to verify
/// that a synchronous compaction run aborts cleanly mid-scan instead of
/// spinning forever.
static SHOULD_ABORT: AtomicBool = AtomicBool::new(false);

pub fn compaction_should_abort() -> bool {
    SHOULD_ABORT.load(Ordering::Relaxed)
}

pub fn request_abort() {
    SHOULD_ABORT.store(true, Ordering::Relaxed);
}

pub fn clear_abort_request() {
    SHOULD_ABORT.store(false, Ordering::Relaxed);
}

/// Stand-in for `need_resched()`: no real scheduler backs this crate, so
/// callers that want to exercise the async-abort-on-contention path in
/// tests set this directly instead of waiting for a timer tick.
static RESCHED_PENDING: AtomicBool = AtomicBool::new(false);

pub fn need_resched() -> bool {
    RESCHED_PENDING.load(Ordering::Relaxed)
}

pub fn set_resched_pending(pending: bool) {
    RESCHED_PENDING.store(pending, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extfrag_threshold_clamps_to_valid_range() {
        set_extfrag_threshold(5000);
        assert_eq!(extfrag_threshold(), 1000);
        set_extfrag_threshold(-5000);
        assert_eq!(extfrag_threshold(), -1000);
        set_extfrag_threshold(500);
    }
}
