//! Preflight suitability check and per-order deferral policy.
//!
//! `compaction_suitable` decides, before a single page is scanned, whether
//! a zone is even worth compacting for the requested order: skip if the
//! watermark is already clearable without compaction, skip if the zone is
//! fragmented so badly that consolidating won't help either, and skip if
//! the zone is still in its post-failure backoff window.

use super::config;
use super::zone::Zone;
use super::{CompactStatus, MAX_ORDER};

/// `__fragmentation_index`: how much the zone's free memory is scattered
/// across small blocks rather than consolidated at `order` or above.
///
/// Returns a value in `[-1000, 1000]`:
/// - `0` if the zone has no free memory at all.
/// - `-1000` if enough blocks already exist at the requested order or
///   above — compaction has nothing left to do.
/// - `100` if there isn't even enough free memory in total to satisfy the
///   request, regardless of fragmentation — compaction can't help.
/// - otherwise, a measure of how fragmented the free memory is: closer to
///   `1000` means highly fragmented (compaction is likely to help), closer
///   to `0` means the free memory is already fairly consolidated.
pub fn fragmentation_index(zone: &Zone, order: u32) -> i32 {
    let requested = 1u64 << order;
    let area = zone.free_area.lock();

    let mut free_pages: u64 = 0;
    let mut free_blocks_total: u64 = 0;
    let mut free_blocks_suitable: u64 = 0;

    for o in 0..=MAX_ORDER {
        let blocks = area.free_blocks_at_order(o) as u64;
        free_blocks_total += blocks;
        free_pages += blocks * (1u64 << o);
        if o >= order {
            free_blocks_suitable += blocks;
        }
    }
    drop(area);

    if free_blocks_total == 0 {
        return 0;
    }
    if free_blocks_suitable > 0 {
        return -1000;
    }
    if order >= MAX_ORDER || free_pages < requested {
        return 100;
    }

    let numerator = 1000 + (free_pages * 1000 / requested);
    1000 - (numerator / free_blocks_total) as i32
}

/// `compaction_suitable`: the preflight gate `compact_zone` runs before
/// touching either cursor.
pub fn compaction_suitable(zone: &Zone, order: u32) -> CompactStatus {
    if zone.deferral.is_deferred(order) {
        return CompactStatus::Skipped;
    }

    // Watermark check at the requested order's reserve, one order up: if
    // the zone can't even clear that bar, there isn't enough free memory
    // in total for compaction to help — reclaim is needed first.
    let boosted_order = (order + 1).min(MAX_ORDER);
    if !zone.watermark_ok(zone.watermarks.low, boosted_order) {
        return CompactStatus::Skipped;
    }

    let index = fragmentation_index(zone, order);
    if index == -1000 {
        // Enough blocks already exist at this order or above. If the
        // watermark at the *requested* (not boosted) order is already
        // clear, the caller's allocation can be granted without a scan.
        return if zone.watermark_ok(zone.watermarks.low, order) {
            CompactStatus::Partial
        } else {
            CompactStatus::Skipped
        };
    }
    if (0..=config::extfrag_threshold()).contains(&index) {
        return CompactStatus::Skipped;
    }

    CompactStatus::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::zone::{MigrateType, Watermarks};
    use crate::compaction::PAGEBLOCK_NR_PAGES;
    use alloc::vec;

    fn zone_with_single_free_block(pages: u32, order: u32) -> Zone {
        let blocks = pages.div_ceil(PAGEBLOCK_NR_PAGES) as usize;
        let zone = Zone::new(
            "test",
            pages,
            vec![MigrateType::Movable; blocks],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        zone.free_area.lock().seed_free_block(super::super::scan::PfnIndex(0), order);
        zone
    }

    #[test]
    fn no_free_memory_yields_zero_index() {
        let zone = zone_with_single_free_block(64, 0);
        // seed order 0 then immediately drain it by capturing, leaving nothing.
        zone.free_area.lock().capture_free_page(0, MigrateType::Movable);
        assert_eq!(fragmentation_index(&zone, 3), 0);
    }

    #[test]
    fn already_suitable_block_yields_minus_1000() {
        let zone = zone_with_single_free_block(64, 5);
        assert_eq!(fragmentation_index(&zone, 3), -1000);
    }

    #[test]
    fn insufficient_total_memory_yields_100() {
        let zone = zone_with_single_free_block(64, 1);
        assert_eq!(fragmentation_index(&zone, 5), 100);
    }

    #[test]
    fn already_satisfied_zone_skips_straight_to_partial() {
        let blocks = (64u32).div_ceil(PAGEBLOCK_NR_PAGES) as usize;
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; blocks],
            Watermarks { min: 2, low: 4, high: 8 },
        );
        zone.free_area
            .lock()
            .seed_free_block(super::super::scan::PfnIndex(0), 5);
        assert_eq!(compaction_suitable(&zone, 3), CompactStatus::Partial);
    }

    #[test]
    fn mostly_empty_zone_is_skipped_for_lack_of_memory() {
        let blocks = (64u32).div_ceil(PAGEBLOCK_NR_PAGES) as usize;
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; blocks],
            Watermarks { min: 4, low: 8, high: 16 },
        );
        // No free memory seeded at all.
        assert_eq!(compaction_suitable(&zone, 3), CompactStatus::Skipped);
    }

    #[test]
    fn deferred_zone_is_skipped_regardless_of_fragmentation() {
        let zone = zone_with_single_free_block(64, 0);
        zone.deferral.defer(3);
        assert_eq!(compaction_suitable(&zone, 3), CompactStatus::Skipped);
    }
}
