//! LRU list bookkeeping for the migrate-scanner's isolation step.
//!
//! Real LRU reclaim splits pages across active/inactive and anon/file
//! lists; compaction only cares that a page is *on* an LRU list (so it is
//! movable in-use memory, not a buddy page or a pinned kernel page) and
//! which of anon/file it belongs to for throttling purposes. One intrusive
//! doubly-linked list covers both, keyed by `PageDescriptor::file_backed`.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::vec;
use alloc::vec::Vec;

const INVALID_PFN: u32 = u32::MAX;

struct LruLink {
    next: u32,
    prev: u32,
    queued: bool,
}

pub struct LruLists {
    links: Vec<LruLink>,
    head: u32,
    tail: u32,
    nr_isolated_anon: AtomicU32,
    nr_isolated_file: AtomicU32,
}

impl LruLists {
    pub fn new(total_pages: u32) -> Self {
        Self {
            links: (0..total_pages)
                .map(|_| LruLink {
                    next: INVALID_PFN,
                    prev: INVALID_PFN,
                    queued: false,
                })
                .collect(),
            head: INVALID_PFN,
            tail: INVALID_PFN,
            nr_isolated_anon: AtomicU32::new(0),
            nr_isolated_file: AtomicU32::new(0),
        }
    }

    /// Queue `pfn` onto the tail of the LRU list. Used both at zone setup
    /// and by [`Self::putback_lru_pages`].
    pub fn add_to_lru(&mut self, pfn: u32) {
        if self.links[pfn as usize].queued {
            return;
        }
        let prev_tail = self.tail;
        self.links[pfn as usize] = LruLink {
            next: INVALID_PFN,
            prev: prev_tail,
            queued: true,
        };
        if prev_tail == INVALID_PFN {
            self.head = pfn;
        } else {
            self.links[prev_tail as usize].next = pfn;
        }
        self.tail = pfn;
    }

    fn unlink(&mut self, pfn: u32) {
        let (prev, next) = {
            let link = &self.links[pfn as usize];
            (link.prev, link.next)
        };
        if prev == INVALID_PFN {
            self.head = next;
        } else {
            self.links[prev as usize].next = next;
        }
        if next == INVALID_PFN {
            self.tail = prev;
        } else {
            self.links[next as usize].prev = prev;
        }
        self.links[pfn as usize] = LruLink {
            next: INVALID_PFN,
            prev: INVALID_PFN,
            queued: false,
        };
    }

    /// `del_page_from_lru_list`: unconditionally drop `pfn` from the list,
    /// e.g. because the page was freed by a successful migration.
    pub fn del_page_from_lru_list(&mut self, pfn: u32) {
        if self.links[pfn as usize].queued {
            self.unlink(pfn);
        }
    }

    /// `PageLRU`: true if `pfn` currently sits on this list. The migrate
    /// scanner's only source of truth for "is this a movable in-use page",
    /// since membership here (not a flag mirrored onto the page descriptor)
    /// is what `isolate_lru_page` actually consults.
    #[inline]
    pub fn is_queued(&self, pfn: u32) -> bool {
        self.links[pfn as usize].queued
    }

    /// `__isolate_lru_page` (ISOLATE_ASYNC_MIGRATE mode): remove `pfn` from
    /// the LRU list for private handling by the migrate scanner, bumping
    /// the isolated-page counter used by the too-many-isolated throttle.
    pub fn isolate_lru_page(&mut self, pfn: u32, file_backed: bool) -> bool {
        if !self.links[pfn as usize].queued {
            return false;
        }
        self.unlink(pfn);
        if file_backed {
            self.nr_isolated_file.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nr_isolated_anon.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// `putback_lru_pages`: return a batch of previously isolated pages
    /// (migration failed, or we're tearing the private list down) to the
    /// LRU and drop the isolated counters back down.
    pub fn putback_lru_pages(&mut self, pfns: &[u32], file_backed: &[bool]) {
        for (&pfn, &file) in pfns.iter().zip(file_backed.iter()) {
            self.add_to_lru(pfn);
            if file {
                self.nr_isolated_file.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.nr_isolated_anon.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// One page's worth of isolation accounting reversal, for callers that
    /// track file/anon membership alongside their own private list instead
    /// of in parallel arrays.
    pub fn uncount_isolated(&self, file_backed: bool) {
        if file_backed {
            self.nr_isolated_file.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.nr_isolated_anon.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn nr_isolated(&self) -> u32 {
        self.nr_isolated_anon.load(Ordering::Relaxed) + self.nr_isolated_file.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nr_lru(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while cur != INVALID_PFN {
            count += 1;
            cur = self.links[cur as usize].next;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolate_and_putback_round_trips_counts() {
        let mut lru = LruLists::new(8);
        lru.add_to_lru(3);
        lru.add_to_lru(4);
        assert_eq!(lru.nr_lru(), 2);

        assert!(lru.isolate_lru_page(3, false));
        assert_eq!(lru.nr_lru(), 1);
        assert_eq!(lru.nr_isolated(), 1);

        lru.putback_lru_pages(&[3], &[false]);
        assert_eq!(lru.nr_lru(), 2);
        assert_eq!(lru.nr_isolated(), 0);
    }

    #[test]
    fn isolate_twice_fails_second_time() {
        let mut lru = LruLists::new(8);
        lru.add_to_lru(1);
        assert!(lru.isolate_lru_page(1, true));
        assert!(!lru.isolate_lru_page(1, true));
    }
}
