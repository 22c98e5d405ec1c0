//! Contention-aware lock acquisition shared by both cursors.
//!
//! Async (best-effort) compaction runs must never block a caller for long;
//! sync runs are allowed to wait but still need to notice an abort request
//! partway through a scan. These two helpers are the only places either
//! cursor touches the zone or LRU lock directly.

use talus_lib::{IrqMutex, IrqMutexGuard};

use super::config;

/// Result of a contention-aware lock attempt.
pub enum LockOutcome<'a, T> {
    Locked(IrqMutexGuard<'a, T>),
    Aborted,
}

/// `compact_trylock_irqsave`: async mode never blocks — a contended lock
/// sets `*contended` and returns [`LockOutcome::Aborted`]. Sync mode always
/// blocks until it gets the lock.
pub fn compact_trylock<'a, T>(
    lock: &'a IrqMutex<T>,
    sync: bool,
    contended: &mut bool,
) -> LockOutcome<'a, T> {
    if sync {
        return LockOutcome::Locked(lock.lock());
    }
    match lock.try_lock() {
        Some(guard) => LockOutcome::Locked(guard),
        None => {
            *contended = true;
            LockOutcome::Aborted
        }
    }
}

/// `compact_unlock_should_abort`: drop `guard` (if held), then decide
/// whether the caller should stop scanning. An abort request always wins;
/// a pending reschedule aborts async runs but only yields sync ones.
pub fn compact_unlock_should_abort<T>(
    guard: Option<IrqMutexGuard<'_, T>>,
    sync: bool,
    contended: &mut bool,
) -> bool {
    drop(guard);

    if config::compaction_should_abort() {
        *contended = true;
        return true;
    }

    if config::need_resched() {
        if !sync {
            *contended = true;
            return true;
        }
        cond_resched();
    }

    false
}

/// `cond_resched`: voluntary yield point. No real scheduler backs this
/// crate; this just clears the test-injected reschedule flag.
pub fn cond_resched() {
    config::set_resched_pending(false);
}

/// `too_many_isolated`: throttle check run before each migrate-scanner
/// batch — half the zone's LRU pages already pulled aside means we're
/// outrunning the migration engine.
pub fn too_many_isolated(nr_isolated: u32, nr_lru_pages: usize) -> bool {
    (nr_isolated as usize) > nr_lru_pages / 2
}

/// `congestion_wait`-equivalent: the suspension point `isolate_migratepages_range`
/// parks at when [`too_many_isolated`] is true. Nothing to actually wait on
/// in this crate, so this just clears the test-injected reschedule flag
/// and gives the caller a named point to retry from.
pub fn congestion_wait() {
    config::set_resched_pending(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use talus_lib::IrqMutex;

    #[test]
    fn sync_lock_always_succeeds() {
        let lock = IrqMutex::new(42u32);
        let mut contended = false;
        match compact_trylock(&lock, true, &mut contended) {
            LockOutcome::Locked(guard) => assert_eq!(*guard, 42),
            LockOutcome::Aborted => panic!("sync lock must not abort"),
        }
        assert!(!contended);
    }

    #[test]
    fn too_many_isolated_trips_at_half() {
        assert!(!too_many_isolated(4, 10));
        assert!(too_many_isolated(6, 10));
    }
}
