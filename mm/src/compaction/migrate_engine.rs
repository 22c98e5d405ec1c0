//! The free-page allocator callback and a simplified page-migration
//! collaborator.
//!
//! Real page migration copies the full page payload (and remaps every PTE
//! pointing at it) to a freshly allocated destination frame. This crate
//! tracks compaction's bookkeeping, not a full migration subsystem, so
//! [`migrate_pages`] models the copy as moving a page's identity (its PFN)
//! from the migrate scanner's private list onto a previously isolated free
//! frame, without touching any payload bytes — the parts of the algorithm
//! compaction cares about (does a destination exist, did migration
//! succeed, what goes back to the LRU on failure) are unaffected by that
//! simplification.

use alloc::vec::Vec;

use super::driver::CompactControl;
use super::isolate_free;
use super::scan::PfnIndex;

/// `compaction_alloc`: the free-page source `migrate_pages` calls for each
/// page it needs to relocate a migrate candidate into. Pops the next
/// isolated free frame off `cc.freepages`, refilling via the free scanner
/// if the private list has run dry.
pub fn compaction_alloc(cc: &mut CompactControl<'_>) -> Option<u32> {
    if cc.freepages.is_empty() {
        isolate_free::isolate_freepages(cc);
    }
    let page = cc.freepages.pop()?;
    cc.nr_freepages = cc.nr_freepages.saturating_sub(1);
    Some(page)
}

/// `compaction_free`: a migrated-away source page, or an allocated
/// destination that went unused because migration failed, goes back onto
/// the free list it came from instead of leaking.
pub fn compaction_free(cc: &mut CompactControl<'_>, pfn: u32) {
    cc.freepages.push(pfn);
    cc.nr_freepages += 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateStats {
    pub migrated: u32,
    pub failed: u32,
}

/// `migrate_pages`: drain `cc.migratepages`, giving each one a destination
/// via [`compaction_alloc`]. A page with no destination (the free scanner
/// came up empty) goes back to the LRU as a failure rather than blocking;
/// compaction treats the whole batch's exhaustion as ENOMEM for the
/// driver's termination check.
pub fn migrate_pages(cc: &mut CompactControl<'_>) -> MigrateStats {
    let pending: Vec<(u32, bool)> = cc
        .migratepages
        .drain(..)
        .zip(cc.migratepages_file.drain(..))
        .collect();

    let mut migrated = 0u32;
    let mut failed_pfns = Vec::new();
    let mut failed_file = Vec::new();

    for (pfn, file_backed) in pending {
        match compaction_alloc(cc) {
            Some(_dest) => {
                migrated += 1;
                cc.zone.lru.lock().del_page_from_lru_list(pfn);
                cc.zone.lru.lock().uncount_isolated(file_backed);
                // The source frame's payload moved to `_dest`; `pfn` itself
                // is now free and coalesces back into the buddy free-area,
                // which is the entire point of compaction — without this
                // the zone's free-page count only ever shrinks and no
                // higher-order block can ever form.
                cc.zone.free_area.lock().seed_free_block(PfnIndex(pfn), 0);
            }
            None => {
                failed_pfns.push(pfn);
                failed_file.push(file_backed);
            }
        }
    }

    let failed = failed_pfns.len() as u32;
    if !failed_pfns.is_empty() {
        cc.zone.lru.lock().putback_lru_pages(&failed_pfns, &failed_file);
    }
    cc.nr_migratepages = 0;

    super::stats::record_migrated(migrated as u64);
    super::stats::record_failed(failed as u64);

    MigrateStats { migrated, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::zone::{MigrateType, Watermarks, Zone};
    use alloc::vec;

    fn small_zone() -> Zone {
        Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks { min: 4, low: 8, high: 16 },
        )
    }

    #[test]
    fn migrate_pages_succeeds_when_free_pages_available() {
        let zone = small_zone();
        zone.free_area.lock().seed_free_block(PfnIndex(32), 3);
        let mut cc = CompactControl::new(&zone, 0, MigrateType::Movable, true);
        cc.migratepages.push(0);
        cc.migratepages_file.push(false);

        let stats = migrate_pages(&mut cc);
        assert_eq!(stats.migrated, 1);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn migrate_pages_fails_back_to_lru_without_destination() {
        let zone = small_zone();
        let mut cc = CompactControl::new(&zone, 0, MigrateType::Movable, true);
        zone.lru.lock().add_to_lru(0);
        zone.lru.lock().isolate_lru_page(0, false);
        cc.migratepages.push(0);
        cc.migratepages_file.push(false);

        let stats = migrate_pages(&mut cc);
        assert_eq!(stats.migrated, 0);
        assert_eq!(stats.failed, 1);
    }
}
