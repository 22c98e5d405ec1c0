//! PFN-indexed block-scanner primitives shared by both cursors.
//!
//! A compaction pass walks a zone in whole `MAX_ORDER`-aligned chunks so a
//! single invalid PFN (a memory hole, a straddle across two zones) skips
//! the entire chunk rather than stepping through it one page at a time.

use super::zone::{MigrateType, Zone};
use super::{MAX_ORDER, PAGEBLOCK_NR_PAGES};

/// A page-frame number, zone-local (0-based from the zone's first page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PfnIndex(pub u32);

impl PfnIndex {
    #[inline]
    pub fn offset(self, delta: u32) -> PfnIndex {
        PfnIndex(self.0.saturating_add(delta))
    }

    #[inline]
    pub fn align_down(self, order: u32) -> PfnIndex {
        let mask = (1u32 << order) - 1;
        PfnIndex(self.0 & !mask)
    }

    #[inline]
    pub fn align_up(self, order: u32) -> PfnIndex {
        self.offset((1 << order) - 1).align_down(order)
    }

    #[inline]
    pub fn pageblock_start(self) -> PfnIndex {
        self.align_down(super::PAGEBLOCK_ORDER)
    }
}

/// `pfn_valid`: true if `pfn` lies within the zone's span and is backed by
/// present memory (not a hole punched by a firmware reservation).
pub fn pfn_valid(zone: &Zone, pfn: PfnIndex) -> bool {
    if pfn.0 >= zone.spanned_pages {
        return false;
    }
    zone.free_area.lock().pages[pfn.0 as usize].present
}

/// `pfn_valid_within`: like [`pfn_valid`] but additionally requires `pfn` to
/// fall in the same `MAX_ORDER`-aligned chunk as `block_start_pfn`, so a
/// caller stepping through a chunk knows whether to keep going or bail to
/// the next chunk.
pub fn pfn_valid_within(zone: &Zone, pfn: PfnIndex, block_start_pfn: PfnIndex) -> bool {
    let chunk_start = block_start_pfn.align_down(MAX_ORDER);
    let chunk_end = chunk_start.offset(1 << MAX_ORDER);
    pfn >= chunk_start && pfn < chunk_end && pfn_valid(zone, pfn)
}

/// True if `start`, the first PFN of a `2^MAX_ORDER`-aligned chunk, is
/// present. Per spec §4.1 the scanner only checks a chunk's lead PFN before
/// deciding whether to walk it or skip it whole — it does not validate
/// every PFN in the chunk, the same shortcut `pfn_valid_within` callers
/// take for granted once this check has passed.
pub fn pageblock_chunk_valid(zone: &Zone, start: PfnIndex) -> bool {
    pfn_valid(zone, start)
}

/// `get_pageblock_migratetype`: the movability tag carried by the whole
/// page-block `pfn` belongs to.
pub fn get_pageblock_migratetype(zone: &Zone, pfn: PfnIndex) -> MigrateType {
    zone.free_area.lock().pageblock_migratetype(pfn)
}

/// `PageBuddy`: true if `pfn` is currently the head of a free buddy block.
pub fn page_buddy(zone: &Zone, pfn: PfnIndex) -> bool {
    let area = zone.free_area.lock();
    area.pages
        .get(pfn.0 as usize)
        .map(|d| d.present && d.buddy)
        .unwrap_or(false)
}

/// `PageLRU`: true if `pfn` is currently queued on a zone LRU list (i.e. a
/// movable in-use page the migrate scanner may isolate).
pub fn page_lru(zone: &Zone, pfn: PfnIndex) -> bool {
    if !pfn_valid(zone, pfn) {
        return false;
    }
    zone.lru.lock().is_queued(pfn.0)
}

/// `PageTransHuge`: true if `pfn` is the head of a compound (transparent
/// huge) page, which compaction never attempts to migrate.
pub fn page_trans_huge(zone: &Zone, pfn: PfnIndex) -> bool {
    let area = zone.free_area.lock();
    area.pages
        .get(pfn.0 as usize)
        .map(|d| d.compound_order > 0)
        .unwrap_or(false)
}

/// Round up `pfn` to the start of the next page-block.
pub fn next_pageblock(pfn: PfnIndex) -> PfnIndex {
    pfn.pageblock_start().offset(PAGEBLOCK_NR_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_round_to_block_boundaries() {
        let pfn = PfnIndex(37);
        assert_eq!(pfn.pageblock_start(), PfnIndex(32));
        assert_eq!(next_pageblock(pfn), PfnIndex(64));
        assert_eq!(pfn.align_up(5), PfnIndex(64));
    }

    #[test]
    fn offset_saturates_instead_of_wrapping() {
        let pfn = PfnIndex(u32::MAX - 2);
        assert_eq!(pfn.offset(10), PfnIndex(u32::MAX));
    }
}
