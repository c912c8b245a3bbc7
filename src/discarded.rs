//! The discarded-id set.
//!
//! Page ids waiting to be returned to the allocator's free pool, kept as
//! maximal contiguous ranges so the drain hands back allocation-sized
//! runs. Insertion coalesces with both neighbours in O(log n).

use crate::alloc::IdRun;
use crate::page_id::PageId;
use std::collections::BTreeMap;

/// A set of page ids organized as maximal `(start, len)` ranges.
#[derive(Default)]
pub struct DiscardedSet {
    // start -> len, ranges disjoint and non-adjacent
    ranges: BTreeMap<u64, u64>,
    total: u64,
}

impl DiscardedSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single id.
    pub fn add(&mut self, id: PageId) {
        self.add_range(id, 1);
    }

    /// Add the `len` ids starting at `start`.
    pub fn add_range(&mut self, start: PageId, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start.get();
        let mut end = start + len;

        // merge with a predecessor that touches or overlaps us
        if let Some((&p_start, &p_len)) = self.ranges.range(..=start).next_back() {
            let p_end = p_start + p_len;
            debug_assert!(p_end <= start, "id discarded twice");
            if p_end == start {
                self.ranges.remove(&p_start);
                self.total -= p_len;
                start = p_start;
            }
        }

        // merge successors that touch the new range
        loop {
            let next = self.ranges.range(start..).next().map(|(&s, &l)| (s, l));
            let Some((s_start, s_len)) = next else { break };
            if s_start > end {
                break;
            }
            debug_assert_eq!(s_start, end, "id discarded twice");
            self.ranges.remove(&s_start);
            self.total -= s_len;
            end = end.max(s_start + s_len);
        }

        self.total += end - start;
        self.ranges.insert(start, end - start);
    }

    /// Take every range out of the set, sorted by start. The set is left
    /// empty.
    pub fn drain_as_ranges(&mut self) -> Vec<IdRun> {
        self.total = 0;
        std::mem::take(&mut self.ranges)
            .into_iter()
            .map(|(start, len)| IdRun {
                base: PageId(start),
                len,
            })
            .collect()
    }

    /// Number of ids in the set.
    pub fn len(&self) -> u64 {
        self.total
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Whether `id` is in the set.
    pub fn contains(&self, id: PageId) -> bool {
        match self.ranges.range(..=id.get()).next_back() {
            Some((&start, &len)) => id.get() < start + len,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Gen, QuickCheck};

    #[test]
    fn adjacent_ids_coalesce() {
        let mut set = DiscardedSet::new();
        set.add(PageId(5));
        set.add(PageId(7));
        set.add(PageId(6));
        let runs = set.drain_as_ranges();
        assert_eq!(runs.len(), 1);
        assert_eq!((runs[0].base, runs[0].len), (PageId(5), 3));
        assert!(set.is_empty());
    }

    #[test]
    fn ranges_merge_both_sides() {
        let mut set = DiscardedSet::new();
        set.add_range(PageId(10), 3);
        set.add_range(PageId(20), 3);
        set.add_range(PageId(13), 7);
        assert_eq!(set.len(), 13);
        let runs = set.drain_as_ranges();
        assert_eq!(runs.len(), 1);
        assert_eq!((runs[0].base, runs[0].len), (PageId(10), 13));
    }

    #[test]
    fn disjoint_ranges_stay_sorted() {
        let mut set = DiscardedSet::new();
        set.add_range(PageId(100), 2);
        set.add(PageId(2));
        set.add_range(PageId(50), 5);
        let runs = set.drain_as_ranges();
        let got: Vec<_> = runs.iter().map(|r| (r.base.get(), r.len)).collect();
        assert_eq!(got, vec![(2, 1), (50, 5), (100, 2)]);
    }

    #[test]
    fn contains_tracks_membership() {
        let mut set = DiscardedSet::new();
        set.add_range(PageId(8), 4);
        assert!(set.contains(PageId(8)));
        assert!(set.contains(PageId(11)));
        assert!(!set.contains(PageId(12)));
        assert!(!set.contains(PageId(7)));
    }

    #[test]
    fn any_permutation_drains_as_one_range() {
        fn prop(mut order: Vec<u8>) -> bool {
            order.sort_unstable();
            order.dedup();
            if order.is_empty() {
                return true;
            }
            // insert 0..n in the arbitrary order induced by the input
            let n = order.len() as u64;
            let mut set = DiscardedSet::new();
            let mut ids: Vec<u64> = (0..n).collect();
            let mut seed = order.iter().map(|&b| b as usize).cycle();
            while !ids.is_empty() {
                let i = seed.next().unwrap() % ids.len();
                set.add(PageId(2 + ids.swap_remove(i)));
            }
            let runs = set.drain_as_ranges();
            runs.len() == 1 && runs[0].base == PageId(2) && runs[0].len == n
        }
        QuickCheck::new()
            .gen(Gen::new(64))
            .quickcheck(prop as fn(Vec<u8>) -> bool);
    }
}
