//! Entry points callers actually reach for: `try_to_compact_pages` walks a
//! caller-supplied zone list and runs [`compact_zone`] against each zone in
//! turn, and `compact_zones`/`compact_node` sweep every zone unconditionally
//! (the manual "compact everything" trigger, e.g. a sysfs/sysctl write).
//!
//! The zonelist is an explicit, caller-constructed [`ZoneList`] rather than
//! a process-wide static: this crate has no NUMA node registry of its own,
//! and keeping it injectable is what lets the tests below build a zonelist
//! in a few lines instead of faking global node state.

use bitflags::bitflags;

use crate::error::{MmError, MmResult};

use super::driver::CompactResult;
use super::zone::{MigrateType, Zone};
use super::{compact_zone, CompactStatus};

bitflags! {
    /// Mirrors the subset of `gfp_mask`/`alloc_flags` that affects whether
    /// a zone is even allowed to satisfy a compaction-triggering request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Caller may sleep and wait for a synchronous compaction run.
        const CAN_WAIT   = 1 << 0;
        /// Caller wants a block published through the capture path if one
        /// becomes available, instead of just a status code.
        const CAPTURE    = 1 << 1;
        /// Caller will accept any migratetype, not just `Movable`.
        const ANY_MOVABLE = 1 << 2;
    }
}

/// A caller-supplied, ordered list of candidate zones (most to least
/// preferred), the same shape as `struct zonelist` a page allocator would
/// walk on the reclaim/compaction-retry path.
pub struct ZoneList<'a> {
    zones: alloc::vec::Vec<&'a Zone>,
}

impl<'a> ZoneList<'a> {
    pub fn new(zones: alloc::vec::Vec<&'a Zone>) -> Self {
        Self { zones }
    }

    pub fn iter(&self) -> impl Iterator<Item = &&'a Zone> {
        self.zones.iter()
    }
}

/// `try_to_compact_pages`: the page-allocator-facing entry point. Tries
/// each zone in `zonelist` in order, stopping at the first one that
/// publishes a captured block or reports anything other than `Skipped`.
///
/// Returns [`MmError::NoSuitableZone`] only if every zone in the list was
/// skipped outright — a `Complete` or `Partial` result from any zone is a
/// real answer, not an error, even if no page was captured.
///
/// Per spec §4.10, a request is filtered out before any zone is even
/// touched when `order == 0`: an order-0 allocation never needs
/// consolidating, so compaction has nothing to offer it.
pub fn try_to_compact_pages(
    zonelist: &ZoneList<'_>,
    order: u32,
    migratetype: MigrateType,
    flags: AllocFlags,
) -> MmResult<CompactResult> {
    if order == 0 {
        return Err(MmError::CompactionNotPermitted);
    }

    let sync = flags.contains(AllocFlags::CAN_WAIT);
    let request_capture = flags.contains(AllocFlags::CAPTURE);

    let mut all_skipped = true;
    let mut last = CompactResult {
        status: CompactStatus::Skipped,
        contended: false,
        captured: None,
    };

    for &zone in zonelist.iter() {
        let result = compact_zone(zone, order as i32, migratetype, sync, request_capture);
        if result.status != CompactStatus::Skipped {
            all_skipped = false;
        }
        last = result;
        if result.captured.is_some() || result.status != CompactStatus::Skipped {
            break;
        }
    }

    if all_skipped {
        return Err(MmError::NoSuitableZone);
    }
    Ok(last)
}

/// `compact_pgdat`-equivalent: unconditionally compact every zone in
/// `zonelist`, ignoring the preflight suitability gate (`order = -1`), for
/// a manual "compact everything" trigger rather than an allocation-failure
/// retry.
pub fn compact_zones(zonelist: &ZoneList<'_>, sync: bool) {
    for &zone in zonelist.iter() {
        compact_zone(zone, -1, MigrateType::Movable, sync, false);
    }
}

/// `compact_node`-equivalent: alias kept distinct from [`compact_zones`]
/// since a future multi-node build would give each node its own
/// [`ZoneList`] and this is the per-node entry point callers reach for.
pub fn compact_node(zonelist: &ZoneList<'_>, sync: bool) {
    compact_zones(zonelist, sync);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::scan::PfnIndex;
    use crate::compaction::zone::Watermarks;
    use alloc::vec;

    fn empty_zone(pages: u32) -> Zone {
        let blocks = pages.div_ceil(super::super::PAGEBLOCK_NR_PAGES) as usize;
        Zone::new(
            "test",
            pages,
            vec![MigrateType::Movable; blocks],
            Watermarks {
                min: 4,
                low: 8,
                high: 16,
            },
        )
    }

    #[test]
    fn no_suitable_zone_when_every_zone_is_deferred() {
        let zone = empty_zone(64);
        zone.deferral.defer(3);
        let zonelist = ZoneList::new(vec![&zone]);

        let result = try_to_compact_pages(&zonelist, 3, MigrateType::Movable, AllocFlags::CAN_WAIT);

        assert_eq!(result, Err(MmError::NoSuitableZone));
    }

    #[test]
    fn falls_through_to_the_second_zone_when_the_first_is_skipped() {
        let skipped = empty_zone(64);
        skipped.deferral.defer(3);

        let fragmented = empty_zone(256);
        {
            let mut area = fragmented.free_area.lock();
            for pfn in (0..256).step_by(2) {
                area.seed_free_block(PfnIndex(pfn), 0);
            }
        }
        {
            let mut lru = fragmented.lru.lock();
            for pfn in (1..256).step_by(2) {
                lru.add_to_lru(pfn);
            }
        }

        let zonelist = ZoneList::new(vec![&skipped, &fragmented]);
        let result = try_to_compact_pages(&zonelist, 4, MigrateType::Movable, AllocFlags::CAN_WAIT)
            .expect("second zone should be suitable");

        assert_ne!(result.status, CompactStatus::Skipped);
    }

    #[test]
    fn compact_zones_sweeps_every_zone_unconditionally() {
        let a = empty_zone(64);
        let b = empty_zone(64);
        let zonelist = ZoneList::new(vec![&a, &b]);
        // order = -1 bypasses the preflight gate entirely; this must not
        // panic even though neither zone has any free memory at all.
        compact_zones(&zonelist, true);
    }
}
