//! Once-init tracking flags.
//!
//! `InitFlag` guards the common "run this exactly once" pattern (HHDM offset
//! storage, the PCP warm-up, …) without pulling in a full `Once<T>` wrapper
//! when callers just need to know whether setup already happened.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// A boolean latch that can only move from unset to set.
pub struct InitFlag {
    set: AtomicBool,
}

impl InitFlag {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Attempt to claim first-time initialization.
    ///
    /// Returns `true` the first time it is called on a given flag, `false`
    /// on every subsequent call.
    #[inline]
    pub fn init_once(&self) -> bool {
        self.set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally mark the flag as set, without the once-only check.
    #[inline]
    pub fn mark_set(&self) {
        self.set.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Reset back to unset. Only safe when the caller knows no one else is
    /// observing this flag concurrently (e.g. test teardown).
    #[inline]
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}

const STATE_NOT_STARTED: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_DONE: u8 = 2;

/// A three-state latch for setup that has an in-progress window, e.g. when
/// one CPU is populating a structure other CPUs must wait for rather than
/// race to also initialize.
pub struct StateFlag {
    state: AtomicU8,
}

impl StateFlag {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_NOT_STARTED),
        }
    }

    /// Attempt to move from not-started to in-progress. Returns `true` if
    /// this call won the race and should perform the initialization.
    #[inline]
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_NOT_STARTED,
                STATE_IN_PROGRESS,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark initialization complete. Only the caller that won `try_begin`
    /// should call this.
    #[inline]
    pub fn complete(&self) {
        self.state.store(STATE_DONE, Ordering::Release);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DONE
    }

    #[inline]
    pub fn is_in_progress(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_IN_PROGRESS
    }
}

impl Default for StateFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_flag_fires_once() {
        let flag = InitFlag::new();
        assert!(flag.init_once());
        assert!(!flag.init_once());
        assert!(flag.is_set());
    }

    #[test]
    fn state_flag_sequences_begin_and_complete() {
        let flag = StateFlag::new();
        assert!(flag.try_begin());
        assert!(!flag.try_begin());
        assert!(flag.is_in_progress());
        flag.complete();
        assert!(flag.is_done());
    }
}
