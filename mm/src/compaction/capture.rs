//! The capture path (spec §4.9): after every successful migration batch,
//! opportunistically claim a newly-consolidated high-order free block for
//! the requester before any other allocator can race for it.
//!
//! The slot-handoff is the caller-supplied `cc.captured` out-slot: this
//! module only ever writes it once, and only on a genuine removal from the
//! free-area, never a speculative peek.

use talus_lib::klog_debug;

use super::driver::CompactControl;
use super::lock_helper::{self, LockOutcome};
use super::zone::MigrateType;
use super::MAX_ORDER;

/// `capture_control_hook`: scan the zone's free-area buckets at or above
/// the requested order and, if a block exists at an acceptable
/// migratetype, remove it and publish it through `cc.captured`.
///
/// Per spec, the zone lock here is acquired "never spinning" — even on a
/// synchronous run this always takes the non-blocking path, so a captured
/// lock never turns into an extra stall on top of whatever the migration
/// batch already cost.
pub fn try_capture(cc: &mut CompactControl<'_>) {
    if !cc.capture_requested || cc.captured.is_some() || cc.order < 0 {
        return;
    }
    let order = cc.order as u32;
    if order > MAX_ORDER {
        return;
    }

    let mut contended = false;
    let mut area = match lock_helper::compact_trylock(&cc.zone.free_area, false, &mut contended) {
        LockOutcome::Locked(guard) => guard,
        LockOutcome::Aborted => return,
    };

    // `[0, PCPTYPES)` for a MOVABLE request: consolidating a whole
    // pageblock-or-larger block makes any migratetype acceptable. Any
    // other request is restricted to exactly its own migratetype, so
    // compaction never pollutes a foreign pageblock's tag.
    let captured = if cc.migratetype == MigrateType::Movable {
        super::zone::PCP_TYPES
            .iter()
            .find_map(|&mt| area.capture_free_page(order, mt))
    } else {
        area.capture_free_page(order, cc.migratetype)
    };

    if let Some(pfn) = captured {
        cc.captured = Some(pfn);
        super::stats::record_capture();
        klog_debug!(
            "compaction: captured order-{} block at pfn {} for zone {}",
            order,
            pfn,
            cc.zone.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::scan::PfnIndex;
    use crate::compaction::zone::{Watermarks, Zone};
    use alloc::vec;

    fn zone_with_free_block(order: u32) -> Zone {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Movable; 2],
            Watermarks {
                min: 4,
                low: 8,
                high: 16,
            },
        );
        zone.free_area.lock().seed_free_block(PfnIndex(0), order);
        zone
    }

    #[test]
    fn captures_a_suitable_block() {
        let zone = zone_with_free_block(5);
        let mut cc = CompactControl::new(&zone, 3, MigrateType::Movable, true);
        cc.capture_requested = true;

        try_capture(&mut cc);

        assert_eq!(cc.captured, Some(0));
    }

    #[test]
    fn does_nothing_when_capture_not_requested() {
        let zone = zone_with_free_block(5);
        let mut cc = CompactControl::new(&zone, 3, MigrateType::Movable, true);

        try_capture(&mut cc);

        assert_eq!(cc.captured, None);
        assert_eq!(zone.free_area.lock().free_pages(), 32);
    }

    #[test]
    fn restricts_non_movable_requests_to_their_own_migratetype() {
        let zone = Zone::new(
            "test",
            64,
            vec![MigrateType::Unmovable; 2],
            Watermarks {
                min: 4,
                low: 8,
                high: 16,
            },
        );
        zone.free_area.lock().seed_free_block(PfnIndex(0), 5);
        let mut cc = CompactControl::new(&zone, 3, MigrateType::Reclaimable, true);
        cc.capture_requested = true;

        try_capture(&mut cc);

        assert_eq!(cc.captured, None);
    }
}
