//! The migrate-scanner (low) cursor: pulls movable in-use pages off the
//! zone's LRU list, a batch at a time, for the migration engine to
//! relocate.

use talus_lib::klog_debug;

use super::driver::CompactControl;
use super::lock_helper::{self, LockOutcome};
use super::scan::{self, PfnIndex};
use super::zone::MigrateType;
use super::{COMPACT_CLUSTER_MAX, MAX_ORDER, SWAP_CLUSTER_MAX};

/// Outcome of one [`isolate_migratepages_range`] call, mirroring the
/// `ISOLATE_ABORT` / `ISOLATE_NONE` / `ISOLATE_SUCCESS` states
/// `compact_zone`'s main loop dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateOutcome {
    /// Contention or an abort request ended the scan before it made any
    /// durable progress; any partial batch was already put back to the LRU.
    Abort,
    /// The scan ran to completion (or was throttled) without isolating
    /// anything; the caller should advance and retry.
    None,
    /// At least one page is now sitting in `cc.migratepages`, ready for
    /// the migration engine.
    Success,
}

/// Returns any partially-isolated batch to the LRU and zeroes the
/// associated counters, so an aborted scan never leaves pages stranded off
/// both the LRU and the migration engine.
fn putback_partial(cc: &mut CompactControl<'_>) {
    if cc.migratepages.is_empty() {
        return;
    }
    cc.zone
        .lru
        .lock()
        .putback_lru_pages(&cc.migratepages, &cc.migratepages_file);
    cc.migratepages.clear();
    cc.migratepages_file.clear();
    cc.nr_migratepages = 0;
}

/// `isolate_migratepages_range`: scan `[cc.migrate_pfn, end_pfn)` upward,
/// isolating movable pages into `cc.migratepages` until either the batch
/// cap is reached or the cursor catches up with `end_pfn`.
pub fn isolate_migratepages_range(
    cc: &mut CompactControl<'_>,
    end_pfn: PfnIndex,
) -> IsolateOutcome {
    let zone = cc.zone;
    let nr_lru_pages = zone.lru.lock().nr_lru();
    if lock_helper::too_many_isolated(zone.lru.lock().nr_isolated(), nr_lru_pages) {
        super::stats::record_stall();
        if !cc.sync {
            // Async never blocks: bail out now and let the driver retry
            // (or give up) on its own schedule, per spec §4.5.
            return IsolateOutcome::None;
        }
        // Sync waits out the congestion once, then proceeds to scan in
        // this same call instead of returning a no-op `None` — nothing
        // in a single-task run would ever shrink `nr_isolated` while the
        // driver spins on a repeated no-progress retry, so "wait and
        // retry" has to mean "wait, then go ahead", not "wait, then ask
        // again forever".
        lock_helper::congestion_wait();
    }

    let mut pfn = cc.migrate_pfn;
    let mut last_lock_pfn = pfn;
    let mut aborted = false;
    let mut guard = match lock_helper::compact_trylock(&zone.lru, cc.sync, &mut cc.contended) {
        LockOutcome::Locked(guard) => Some(guard),
        LockOutcome::Aborted => {
            cc.migrate_pfn = pfn;
            return IsolateOutcome::Abort;
        }
    };

    while pfn < end_pfn && cc.migratepages.len() < COMPACT_CLUSTER_MAX {
        if pfn.0 % (1 << MAX_ORDER) == 0 && !scan::pageblock_chunk_valid(zone, pfn) {
            pfn = pfn.align_up(MAX_ORDER);
            continue;
        }

        if !scan::pfn_valid_within(zone, pfn, pfn) {
            pfn = pfn.offset(1);
            continue;
        }

        let block_start = pfn.pageblock_start();
        let migratetype = scan::get_pageblock_migratetype(zone, block_start);
        if !cc.sync && !migratetype.is_async_suitable() {
            pfn = scan::next_pageblock(pfn);
            continue;
        }

        if pfn.0 - last_lock_pfn.0 >= SWAP_CLUSTER_MAX {
            if lock_helper::compact_unlock_should_abort(guard.take(), cc.sync, &mut cc.contended) {
                aborted = true;
                break;
            }
            guard = match lock_helper::compact_trylock(&zone.lru, cc.sync, &mut cc.contended) {
                LockOutcome::Locked(g) => Some(g),
                LockOutcome::Aborted => {
                    aborted = true;
                    break;
                }
            };
            last_lock_pfn = pfn;
        }

        if scan::page_trans_huge(zone, pfn) {
            let compound_order = {
                let area = zone.free_area.lock();
                area.pages[pfn.0 as usize].compound_order as u32
            };
            pfn = pfn.offset(1 << compound_order.min(MAX_ORDER));
            continue;
        }

        // `guard` is always held here: every path that would have dropped
        // it (contention abort) already `break`s out of the loop above.
        // Go through it directly instead of `scan::page_lru`/`zone.lru.lock()`,
        // which would take a second ticket on the same non-reentrant
        // `IrqMutex` and spin forever against the one we're still holding.
        let lru = guard.as_mut().expect("lru lock held while scanning");
        if !lru.is_queued(pfn.0) {
            pfn = pfn.offset(1);
            continue;
        }

        let file_backed = {
            let area = zone.free_area.lock();
            area.pages[pfn.0 as usize].file_backed
        };

        let isolated = guard
            .as_mut()
            .expect("lru lock held while scanning")
            .isolate_lru_page(pfn.0, file_backed);
        if isolated {
            cc.migratepages.push(pfn.0);
            cc.migratepages_file.push(file_backed);
            cc.nr_migratepages += 1;
            super::stats::record_isolated_migrate(1);
        }

        pfn = pfn.offset(1);
    }

    drop(guard);
    cc.migrate_pfn = pfn;

    if aborted {
        klog_debug!(
            "compaction: migrate scan aborted at pfn {}, putting {} pages back",
            pfn.0,
            cc.migratepages.len()
        );
        putback_partial(cc);
        return IsolateOutcome::Abort;
    }

    if cc.nr_migratepages > 0 {
        IsolateOutcome::Success
    } else {
        IsolateOutcome::None
    }
}

/// `acct_isolated`-equivalent partition: how many of the currently-pending
/// migrate candidates are anon vs file-backed, read back from the parallel
/// flag list rather than a fresh scan.
pub fn count_isolated(cc: &CompactControl<'_>) -> (u32, u32) {
    let file = cc.migratepages_file.iter().filter(|&&f| f).count() as u32;
    let anon = cc.migratepages_file.len() as u32 - file;
    (anon, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::zone::{Watermarks, Zone};
    use alloc::vec;

    #[test]
    fn isolates_lru_pages_into_batch() {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        zone.lru.lock().add_to_lru(3);
        zone.lru.lock().add_to_lru(4);

        let mut cc = CompactControl::new(&zone, 0, MigrateType::Movable, true);
        cc.migrate_pfn = PfnIndex(0);
        let outcome = isolate_migratepages_range(&mut cc, PfnIndex(8));

        assert_eq!(outcome, IsolateOutcome::Success);
        assert_eq!(cc.migratepages.len(), 2);
        assert!(cc.migratepages.contains(&3));
        assert!(cc.migratepages.contains(&4));
    }

    #[test]
    fn async_throttles_when_too_many_isolated() {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        for pfn in 0..10 {
            zone.lru.lock().add_to_lru(pfn);
        }
        for pfn in 0..6 {
            zone.lru.lock().isolate_lru_page(pfn, false);
        }

        let mut cc = CompactControl::new(&zone, 0, MigrateType::Movable, false);
        cc.migrate_pfn = PfnIndex(0);
        let outcome = isolate_migratepages_range(&mut cc, PfnIndex(64));
        assert_eq!(outcome, IsolateOutcome::None);
        assert!(cc.migratepages.is_empty());
    }

    #[test]
    fn sync_waits_out_the_throttle_then_still_makes_progress() {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        for pfn in 0..10 {
            zone.lru.lock().add_to_lru(pfn);
        }
        for pfn in 0..6 {
            zone.lru.lock().isolate_lru_page(pfn, false);
        }

        let mut cc = CompactControl::new(&zone, 0, MigrateType::Movable, true);
        cc.migrate_pfn = PfnIndex(0);
        // Sync must not return a no-op `None` here: with no other task to
        // shrink `nr_isolated`, that would spin the driver forever. It
        // waits out the congestion once and still isolates the remaining
        // LRU pages (6..10) in this same call.
        let outcome = isolate_migratepages_range(&mut cc, PfnIndex(64));
        assert_eq!(outcome, IsolateOutcome::Success);
        assert!(!cc.migratepages.is_empty());
    }
}
