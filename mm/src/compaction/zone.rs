//! The compactable zone: free-area buckets, per-pageblock migratetype tags,
//! watermarks and the per-order deferral table.
//!
//! The free-area here follows the same shape as [`crate::page_alloc`]'s
//! buddy structure — index-linked free lists per order, XOR-buddy
//! coalescing, detach-by-scan — generalized with a migratetype dimension
//! that the flat page allocator has no use for. Page contents are never
//! touched; a `Zone` only tracks the bookkeeping bits compaction needs
//! (buddy/LRU/compound-order flags, migratetype tags).

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use alloc::vec;
use alloc::vec::Vec;

use talus_lib::IrqMutex;

use super::scan::PfnIndex;
use super::{MAX_ORDER, PAGEBLOCK_NR_PAGES, PAGEBLOCK_ORDER};

const INVALID_PFN: u32 = u32::MAX;

/// Movability classification of a page-block. Only [`MigrateType::Movable`]
/// and [`MigrateType::Cma`] are async-suitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrateType {
    Unmovable = 0,
    Reclaimable = 1,
    Movable = 2,
    Cma = 3,
    Reserve = 4,
    Isolate = 5,
}

pub const MIGRATE_TYPES_COUNT: usize = 6;

/// `[0, PCPTYPES)` from spec §4.9: the migratetypes a MOVABLE capture
/// request is allowed to pull from, since consolidating a whole pageblock
/// makes any of these acceptable.
pub const PCP_TYPES: [MigrateType; 4] = [
    MigrateType::Unmovable,
    MigrateType::Reclaimable,
    MigrateType::Movable,
    MigrateType::Cma,
];

impl MigrateType {
    #[inline]
    pub fn is_async_suitable(self) -> bool {
        matches!(self, MigrateType::Movable | MigrateType::Cma)
    }
}

/// Per-frame bookkeeping. Mirrors `page_alloc::PageFrame` but adds the
/// compound/hole bits the compaction scanners read. LRU membership itself
/// lives in [`super::lru::LruLists`], not here — see
/// [`super::scan::page_lru`].
#[derive(Clone, Copy)]
pub struct PageDescriptor {
    pub present: bool,
    pub buddy: bool,
    pub buddy_order: u16,
    pub file_backed: bool,
    pub compound_order: u16,
    next_free: u32,
}

impl PageDescriptor {
    const fn hole() -> Self {
        Self {
            present: false,
            buddy: false,
            buddy_order: 0,
            file_backed: false,
            compound_order: 0,
            next_free: INVALID_PFN,
        }
    }

    const fn present_page() -> Self {
        Self {
            present: true,
            buddy: false,
            buddy_order: 0,
            file_backed: false,
            compound_order: 0,
            next_free: INVALID_PFN,
        }
    }
}

/// Free-area buckets: `free_lists[order][migratetype]` is the head of an
/// index-linked list of free blocks of that order tagged with that
/// migratetype.
pub struct ZoneFreeArea {
    pub pages: Vec<PageDescriptor>,
    pageblock_migratetype: Vec<MigrateType>,
    free_lists: Vec<[u32; MIGRATE_TYPES_COUNT]>,
    free_pages: u32,
}

impl ZoneFreeArea {
    fn new(total_pages: u32, pageblock_migratetype: Vec<MigrateType>) -> Self {
        Self {
            pages: vec![PageDescriptor::present_page(); total_pages as usize],
            pageblock_migratetype,
            free_lists: vec![[INVALID_PFN; MIGRATE_TYPES_COUNT]; (MAX_ORDER as usize) + 1],
            free_pages: 0,
        }
    }

    #[inline]
    fn order_pages(order: u32) -> u32 {
        1u32 << order
    }

    #[inline]
    pub fn total_pages(&self) -> u32 {
        self.pages.len() as u32
    }

    #[inline]
    pub fn free_pages(&self) -> u32 {
        self.free_pages
    }

    #[inline]
    pub fn pageblock_migratetype(&self, pfn: PfnIndex) -> MigrateType {
        let idx = (pfn.0 / PAGEBLOCK_NR_PAGES) as usize;
        self.pageblock_migratetype
            .get(idx)
            .copied()
            .unwrap_or(MigrateType::Unmovable)
    }

    pub fn set_pageblock_migratetype(&mut self, pfn: PfnIndex, migratetype: MigrateType) {
        let idx = (pfn.0 / PAGEBLOCK_NR_PAGES) as usize;
        if let Some(slot) = self.pageblock_migratetype.get_mut(idx) {
            *slot = migratetype;
        }
    }

    #[inline]
    pub fn mark_hole(&mut self, pfn: PfnIndex) {
        if let Some(desc) = self.pages.get_mut(pfn.0 as usize) {
            *desc = PageDescriptor::hole();
        }
    }

    fn free_list_push(&mut self, order: u32, pfn: u32, migratetype: MigrateType) {
        let mt = migratetype as usize;
        let head = self.free_lists[order as usize][mt];
        if let Some(desc) = self.pages.get_mut(pfn as usize) {
            desc.buddy = true;
            desc.buddy_order = order as u16;
            desc.next_free = head;
        }
        self.free_lists[order as usize][mt] = pfn;
    }

    fn free_list_detach(&mut self, order: u32, migratetype: MigrateType, target: u32) -> bool {
        let mt = migratetype as usize;
        let mut prev = INVALID_PFN;
        let mut current = self.free_lists[order as usize][mt];

        while current != INVALID_PFN {
            let next = self.pages[current as usize].next_free;
            if current == target {
                if prev == INVALID_PFN {
                    self.free_lists[order as usize][mt] = next;
                } else {
                    self.pages[prev as usize].next_free = next;
                }
                let desc = &mut self.pages[current as usize];
                desc.buddy = false;
                desc.next_free = INVALID_PFN;
                return true;
            }
            prev = current;
            current = next;
        }
        false
    }

    /// Pop any block from `free_lists[order][migratetype]`, if non-empty.
    fn free_list_pop_any(&mut self, order: u32, migratetype: MigrateType) -> Option<u32> {
        let mt = migratetype as usize;
        let head = self.free_lists[order as usize][mt];
        if head == INVALID_PFN {
            return None;
        }
        self.free_list_detach(order, migratetype, head);
        Some(head)
    }

    /// Seed one free block of `order` pages starting at `pfn` into the
    /// free-area, tagged by its pageblock's migratetype. Used at zone setup
    /// and to drain isolated-but-unused order-0 pages back.
    pub fn seed_free_block(&mut self, pfn: PfnIndex, order: u32) {
        let migratetype = self.pageblock_migratetype(pfn);
        self.insert_block_coalescing(pfn.0, order, migratetype);
    }

    fn insert_block_coalescing(&mut self, pfn: u32, order: u32, migratetype: MigrateType) {
        let mut curr_pfn = pfn;
        let mut curr_order = order;

        while curr_order < MAX_ORDER {
            let buddy = curr_pfn ^ Self::order_pages(curr_order);
            if buddy >= self.pages.len() as u32 {
                break;
            }
            let buddy_mt = self.pageblock_migratetype(PfnIndex(buddy));
            let can_merge = self.pages[buddy as usize].present
                && self.pages[buddy as usize].buddy
                && self.pages[buddy as usize].buddy_order == curr_order as u16
                && buddy_mt as u8 == migratetype as u8;
            if !can_merge {
                break;
            }
            if !self.free_list_detach(curr_order, buddy_mt, buddy) {
                break;
            }
            curr_pfn = curr_pfn.min(buddy);
            curr_order += 1;
        }

        self.free_list_push(curr_order, curr_pfn, migratetype);
        self.free_pages += Self::order_pages(curr_order);
    }

    /// Remove the free block headed exactly at `pfn`, given it is free at
    /// `order`. Mirrors `split_free_page`: on success the caller treats the
    /// `2^order` constituent pages as individually isolated order-0 pages.
    /// Returns `2^order` on success, `0` if `pfn` is not a free block head.
    pub fn split_free_page(&mut self, pfn: PfnIndex) -> u32 {
        let Some(desc) = self.pages.get(pfn.0 as usize) else {
            return 0;
        };
        if !desc.buddy {
            return 0;
        }
        let order = desc.buddy_order as u32;
        let migratetype = self.pageblock_migratetype(pfn);
        if !self.free_list_detach(order, migratetype, pfn.0) {
            return 0;
        }
        let pages = Self::order_pages(order);
        self.free_pages = self.free_pages.saturating_sub(pages);
        pages
    }

    /// Find and remove a free block of order `>= min_order` at exactly
    /// `migratetype`, splitting the remainder back in if the found block is
    /// larger than requested. Returns the head PFN of a block of exactly
    /// `min_order` pages.
    pub fn capture_free_page(&mut self, min_order: u32, migratetype: MigrateType) -> Option<u32> {
        for order in min_order..=MAX_ORDER {
            if let Some(block) = self.free_list_pop_any(order, migratetype) {
                self.free_pages = self
                    .free_pages
                    .saturating_sub(Self::order_pages(order));
                let mut current_order = order;
                let mut head = block;
                while current_order > min_order {
                    current_order -= 1;
                    let buddy = head + Self::order_pages(current_order);
                    self.free_list_push(current_order, buddy, migratetype);
                    self.free_pages += Self::order_pages(current_order);
                }
                let _ = head;
                head = block;
                return Some(head);
            }
        }
        None
    }

    /// True if a free block of order `>= pageblock_order` already exists at
    /// `migratetype` covering `pfn`'s pageblock, i.e. the whole block is a
    /// single free buddy entry.
    pub fn is_pageblock_free(&self, pfn: PfnIndex) -> bool {
        let block_start = (pfn.0 / PAGEBLOCK_NR_PAGES) * PAGEBLOCK_NR_PAGES;
        let Some(desc) = self.pages.get(block_start as usize) else {
            return false;
        };
        desc.buddy && desc.buddy_order as u32 >= PAGEBLOCK_ORDER
    }

    /// Count of free pages across all migratetypes at exactly `order`.
    pub fn free_count_at_order(&self, order: u32, migratetype: MigrateType) -> u32 {
        let mut count = 0;
        let mut current = self.free_lists[order as usize][migratetype as usize];
        while current != INVALID_PFN {
            count += 1;
            current = self.pages[current as usize].next_free;
        }
        count
    }

    /// Number of free *blocks* (not pages) at exactly `order`, summed over
    /// every migratetype. Feeds [`super::suitability::fragmentation_index`].
    pub fn free_blocks_at_order(&self, order: u32) -> u32 {
        let mut count = 0;
        for mt in 0..MIGRATE_TYPES_COUNT {
            let mut current = self.free_lists[order as usize][mt];
            while current != INVALID_PFN {
                count += 1;
                current = self.pages[current as usize].next_free;
            }
        }
        count
    }
}

#[derive(Clone, Copy)]
pub struct Watermarks {
    pub min: u32,
    pub low: u32,
    pub high: u32,
}

/// Per-order deferral bookkeeping (`zone->compact_considered`,
/// `compact_defer_shift`, `compact_order_failed` in the reference design).
pub struct ZoneDeferral {
    compact_considered: AtomicU32,
    compact_defer_shift: AtomicU32,
    /// Smallest order the last synchronous attempt failed at, or `-1` if
    /// none has failed yet.
    compact_order_failed: AtomicI32,
}

const MAX_COMPACT_DEFER_SHIFT: u32 = 6;

impl ZoneDeferral {
    const fn new() -> Self {
        Self {
            compact_considered: AtomicU32::new(0),
            compact_defer_shift: AtomicU32::new(0),
            compact_order_failed: AtomicI32::new(-1),
        }
    }

    /// `compaction_deferred`: true if this zone should be skipped for
    /// `order` because it is in its backoff window.
    pub fn is_deferred(&self, order: u32) -> bool {
        let failed_order = self.compact_order_failed.load(Ordering::Relaxed);
        if failed_order < 0 || order < failed_order as u32 {
            return false;
        }
        let considered = self.compact_considered.fetch_add(1, Ordering::Relaxed);
        let threshold = 1u32 << self.compact_defer_shift.load(Ordering::Relaxed);
        considered < threshold
    }

    /// `defer_compaction`: record a failed sync attempt at `order`, growing
    /// the backoff window.
    pub fn defer(&self, order: u32) {
        self.compact_considered.store(0, Ordering::Relaxed);
        let shift = self.compact_defer_shift.load(Ordering::Relaxed);
        self.compact_defer_shift
            .store((shift + 1).min(MAX_COMPACT_DEFER_SHIFT), Ordering::Relaxed);
        self.compact_order_failed.store(order as i32, Ordering::Relaxed);
    }

    /// `compaction_defer_reset`: record a successful attempt, raising the
    /// failure floor so weaker future requests don't retry needlessly.
    pub fn reset(&self, order: u32) {
        let failed_order = self.compact_order_failed.load(Ordering::Relaxed);
        if failed_order < 0 || order as i32 >= failed_order {
            self.compact_considered.store(0, Ordering::Relaxed);
            self.compact_defer_shift.store(0, Ordering::Relaxed);
            self.compact_order_failed
                .store(order as i32 + 1, Ordering::Relaxed);
        }
    }
}

pub struct Zone {
    pub name: &'static str,
    pub free_area: IrqMutex<ZoneFreeArea>,
    pub lru: IrqMutex<super::lru::LruLists>,
    pub watermarks: Watermarks,
    pub deferral: ZoneDeferral,
    pub spanned_pages: u32,
}

impl Zone {
    pub fn new(
        name: &'static str,
        total_pages: u32,
        pageblock_migratetype: Vec<MigrateType>,
        watermarks: Watermarks,
    ) -> Self {
        Self {
            name,
            free_area: IrqMutex::new(ZoneFreeArea::new(total_pages, pageblock_migratetype)),
            lru: IrqMutex::new(super::lru::LruLists::new(total_pages)),
            watermarks,
            deferral: ZoneDeferral::new(),
            spanned_pages: total_pages,
        }
    }

    #[inline]
    pub fn start_pfn(&self) -> PfnIndex {
        PfnIndex(0)
    }

    #[inline]
    pub fn end_pfn(&self) -> PfnIndex {
        PfnIndex(self.spanned_pages)
    }

    /// `zone_watermark_ok`: true if free pages minus the reserve for
    /// `order` clear the requested watermark level.
    pub fn watermark_ok(&self, watermark: u32, order: u32) -> bool {
        let free = self.free_area.lock().free_pages();
        if order == 0 {
            return free >= watermark;
        }
        // Reserve half the free pages at each smaller order, matching the
        // buddy allocator's usual "don't let a high-order request starve
        // lower orders" heuristic.
        let mut reserve = watermark;
        for o in 0..order {
            reserve += watermark >> (o + 1).min(31);
        }
        free >= reserve
    }

    pub fn pfn_valid(&self, pfn: PfnIndex) -> bool {
        (pfn.0 as usize) < self.free_area.lock().pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movable_zone(pages: u32) -> Zone {
        let blocks = pages.div_ceil(PAGEBLOCK_NR_PAGES) as usize;
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
    fn seed_and_split_round_trips_free_pages() {
        let zone = movable_zone(64);
        {
            let mut area = zone.free_area.lock();
            area.seed_free_block(PfnIndex(0), 5);
            assert_eq!(area.free_pages(), 32);
        }
        {
            let mut area = zone.free_area.lock();
            let isolated = area.split_free_page(PfnIndex(0));
            assert_eq!(isolated, 32);
            assert_eq!(area.free_pages(), 0);
        }
    }

    #[test]
    fn capture_splits_larger_block_down() {
        let zone = movable_zone(64);
        {
            let mut area = zone.free_area.lock();
            area.seed_free_block(PfnIndex(0), 5);
        }
        let mut area = zone.free_area.lock();
        let captured = area.capture_free_page(3, MigrateType::Movable);
        assert_eq!(captured, Some(0));
        // 32 pages minus the 8 captured leaves 24 redistributed among
        // smaller orders.
        assert_eq!(area.free_pages(), 24);
    }

    #[test]
    fn deferral_backs_off_after_failure() {
        let zone = movable_zone(64);
        assert!(!zone.deferral.is_deferred(3));
        zone.deferral.defer(3);
        assert!(zone.deferral.is_deferred(3));
        assert!(!zone.deferral.is_deferred(2));
    }
}
