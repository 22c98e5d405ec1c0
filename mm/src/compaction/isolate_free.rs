//! The free-scanner (high) cursor: pulls free pages off the buddy
//! free-area and splits them to order 0 so the migrate engine has
//! somewhere to relocate pages into.

use alloc::vec::Vec;

use talus_lib::klog_debug;

use super::driver::CompactControl;
use super::lock_helper::{self, LockOutcome};
use super::scan::{self, PfnIndex};
use super::zone::Zone;
use super::PAGEBLOCK_NR_PAGES;

/// `isolate_freepages_block`: scan `[start_pfn, end_pfn)` one page at a
/// time, splitting every free buddy block found into order-0 pages and
/// pushing them onto `freelist`. In `strict` mode any invalid or
/// non-buddy page aborts the whole call with zero isolated, since a
/// strict caller (CMA-style exact-range reservation) needs every page in
/// the range or none at all; a non-strict caller just skips past it.
pub fn isolate_freepages_block(
    zone: &Zone,
    start_pfn: PfnIndex,
    end_pfn: PfnIndex,
    freelist: &mut Vec<u32>,
    strict: bool,
) -> u32 {
    let mut pfn = start_pfn;
    let mut isolated = 0u32;
    let mut area = zone.free_area.lock();

    while pfn < end_pfn {
        if !scan::pfn_valid_within(zone, pfn, start_pfn) {
            if strict {
                return 0;
            }
            pfn = pfn.offset(1);
            continue;
        }

        let is_buddy = area
            .pages
            .get(pfn.0 as usize)
            .map(|d| d.present && d.buddy)
            .unwrap_or(false);
        if !is_buddy {
            if strict {
                return 0;
            }
            pfn = pfn.offset(1);
            continue;
        }

        let nr_pages = area.split_free_page(pfn);
        if nr_pages == 0 {
            if strict {
                return 0;
            }
            pfn = pfn.offset(1);
            continue;
        }

        for i in 0..nr_pages {
            freelist.push(pfn.0 + i);
        }
        isolated += nr_pages;
        pfn = pfn.offset(nr_pages);
    }

    isolated
}

/// `isolate_freepages`: the high-cursor driver. Walks whole page-blocks
/// downward from `cc.free_pfn` toward `cc.migrate_pfn`, skipping blocks
/// an async run can't safely touch, until it has gathered enough free
/// pages for the migrate engine or the cursors cross.
pub fn isolate_freepages(cc: &mut CompactControl<'_>) {
    let zone = cc.zone;
    // One pageblock of headroom below `migrate_pfn`: the two cursors never
    // scan the same block, per spec.
    let low_pfn = cc.migrate_pfn.offset(PAGEBLOCK_NR_PAGES);
    let mut block_start = cc.free_pfn.pageblock_start();

    while block_start > low_pfn && cc.freepages.len() < super::COMPACT_CLUSTER_MAX {
        let block_end = block_start.offset(PAGEBLOCK_NR_PAGES);

        if !scan::pageblock_chunk_valid(zone, block_start) {
            block_start = PfnIndex(block_start.0.saturating_sub(PAGEBLOCK_NR_PAGES));
            continue;
        }

        let migratetype = scan::get_pageblock_migratetype(zone, block_start);
        if !cc.sync && !migratetype.is_async_suitable() {
            block_start = PfnIndex(block_start.0.saturating_sub(PAGEBLOCK_NR_PAGES));
            continue;
        }

        let guard = match lock_helper::compact_trylock(&zone.free_area, cc.sync, &mut cc.contended)
        {
            LockOutcome::Locked(guard) => guard,
            LockOutcome::Aborted => break,
        };
        drop(guard);

        let isolated =
            isolate_freepages_block(zone, block_start, block_end, &mut cc.freepages, false);
        cc.nr_freepages += isolated;
        super::stats::record_isolated_free(isolated as u64);
        klog_debug!(
            "compaction: isolated {} free pages from block {}",
            isolated,
            block_start.0
        );

        if block_start.0 < PAGEBLOCK_NR_PAGES {
            break;
        }
        block_start = PfnIndex(block_start.0 - PAGEBLOCK_NR_PAGES);
    }

    cc.free_pfn = block_start;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::zone::{MigrateType, Watermarks};
    use alloc::vec;

    #[test]
    fn isolate_freepages_block_collects_split_pages() {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        zone.free_area.lock().seed_free_block(PfnIndex(0), 4);

        let mut freelist = Vec::new();
        let isolated =
            isolate_freepages_block(&zone, PfnIndex(0), PfnIndex(16), &mut freelist, false);
        assert_eq!(isolated, 16);
        assert_eq!(freelist.len(), 16);
    }

    #[test]
    fn strict_mode_aborts_on_non_buddy_page() {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        let mut freelist = Vec::new();
        let isolated =
            isolate_freepages_block(&zone, PfnIndex(0), PfnIndex(8), &mut freelist, true);
        assert_eq!(isolated, 0);
        assert!(freelist.is_empty());
    }
}
