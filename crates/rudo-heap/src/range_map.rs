//! Ordered, self-coalescing set of disjoint ranges.
//!
//! `RangeMap` is the storage behind both the mapped-memory cache and the
//! virtual memory free lists. Entries are keyed by start offset in a
//! `BTreeMap`, which gives predecessor/successor lookups, arbitrary-key
//! removal and O(log n) access to both ends.
//!
//! # Invariants
//!
//! - Entries never overlap.
//! - No two entries are adjacent: an insert that touches a neighbor is merged
//!   into it.
//! - `size()` equals the sum of all entry sizes.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::range::VirtualRange;

/// An ordered set of disjoint, non-adjacent ranges.
#[derive(Debug, Default, Clone)]
pub struct RangeMap {
    /// start -> size
    entries: BTreeMap<usize, usize>,
    size: usize,
}

impl RangeMap {
    /// Creates an empty map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size: 0,
        }
    }

    /// Total bytes held.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in increasing address order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = VirtualRange> + '_ {
        self.entries
            .iter()
            .map(|(&start, &size)| VirtualRange::new(start, size))
    }

    /// The lowest entry.
    #[must_use]
    pub fn first(&self) -> Option<VirtualRange> {
        self.entries
            .first_key_value()
            .map(|(&start, &size)| VirtualRange::new(start, size))
    }

    /// The highest entry.
    #[must_use]
    pub fn last(&self) -> Option<VirtualRange> {
        self.entries
            .last_key_value()
            .map(|(&start, &size)| VirtualRange::new(start, size))
    }

    /// Returns `true` if `range` lies entirely inside one entry.
    #[must_use]
    pub fn contains(&self, range: VirtualRange) -> bool {
        self.entries
            .range(..=range.start())
            .next_back()
            .is_some_and(|(&start, &size)| range.end() <= start + size)
    }

    /// Inserts `range`, merging it with adjacent neighbors.
    ///
    /// # Panics
    ///
    /// Panics if `range` overlaps an existing entry (a double insert).
    pub fn insert(&mut self, range: VirtualRange) {
        assert!(!range.is_null() && range.size() > 0, "Inserting empty range");

        let start = range.start();
        let end = range.end();

        // Left neighbor: largest key <= start
        let left = self
            .entries
            .range(..=start)
            .next_back()
            .map(|(&s, &sz)| VirtualRange::new(s, sz));

        // Right neighbor: smallest key > start
        let right = self
            .entries
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
            .map(|(&s, &sz)| VirtualRange::new(s, sz));

        if let Some(left) = left {
            assert!(left.end() <= start, "Overlapping insert of {range:?} into {left:?}");
        }
        if let Some(right) = right {
            assert!(end <= right.start(), "Overlapping insert of {range:?} into {right:?}");
        }

        let merge_left = left.filter(|l| l.end() == start);
        let merge_right = right.filter(|r| r.start() == end);

        match (merge_left, merge_right) {
            (Some(l), Some(r)) => {
                // Bridge both neighbors into the left entry
                self.entries.remove(&r.start());
                self.entries.insert(l.start(), l.size() + range.size() + r.size());
            }
            (Some(l), None) => {
                self.entries.insert(l.start(), l.size() + range.size());
            }
            (None, Some(r)) => {
                self.entries.remove(&r.start());
                self.entries.insert(start, range.size() + r.size());
            }
            (None, None) => {
                self.entries.insert(start, range.size());
            }
        }

        self.size += range.size();
    }

    /// Removes `size` bytes from the front of the lowest entry that is large
    /// enough (first fit in increasing address order).
    pub fn remove_from_low(&mut self, size: usize) -> Option<VirtualRange> {
        let found = self
            .entries
            .iter()
            .find(|(_, &sz)| sz >= size)
            .map(|(&s, &sz)| VirtualRange::new(s, sz))?;

        Some(self.take_front(found, size))
    }

    /// Removes `size` bytes from the front of the lowest entry, or returns
    /// `None` if that entry is too small.
    pub fn remove_from_first(&mut self, size: usize) -> Option<VirtualRange> {
        let first = self.first().filter(|first| first.size() >= size)?;
        Some(self.take_front(first, size))
    }

    /// Removes `size` bytes from the back of the highest entry that is large
    /// enough (first fit in decreasing address order).
    pub fn remove_from_high(&mut self, size: usize) -> Option<VirtualRange> {
        let found = self
            .entries
            .iter()
            .rev()
            .find(|(_, &sz)| sz >= size)
            .map(|(&s, &sz)| VirtualRange::new(s, sz))?;

        Some(self.take_back(found, size))
    }

    /// Removes up to `size` bytes walking entries from the lowest address
    /// upwards. A final partial entry is split and its front is taken.
    ///
    /// Returns the number of bytes appended to `out`.
    pub fn remove_from_low_many(&mut self, size: usize, out: &mut Vec<VirtualRange>) -> usize {
        let mut removed = 0;

        while removed < size {
            let Some(first) = self.first() else {
                break;
            };

            let wanted = size - removed;
            let taken = self.take_front(first, wanted.min(first.size()));
            removed += taken.size();
            out.push(taken);
        }

        removed
    }

    /// Removes up to `size` bytes walking entries from the highest address
    /// downwards. A final partial entry is split and its tail is taken.
    ///
    /// Returns the number of bytes appended to `out`.
    pub fn remove_from_high_many(&mut self, size: usize, out: &mut Vec<VirtualRange>) -> usize {
        let mut removed = 0;

        while removed < size {
            let Some(last) = self.last() else {
                break;
            };

            let wanted = size - removed;
            let taken = self.take_back(last, wanted.min(last.size()));
            removed += taken.size();
            out.push(taken);
        }

        removed
    }

    fn take_front(&mut self, entry: VirtualRange, size: usize) -> VirtualRange {
        debug_assert!(size <= entry.size());
        self.entries.remove(&entry.start());

        let mut rest = entry;
        let taken = rest.shrink_from_front(size);
        if rest.size() > 0 {
            self.entries.insert(rest.start(), rest.size());
        }
        self.size -= size;

        taken
    }

    fn take_back(&mut self, entry: VirtualRange, size: usize) -> VirtualRange {
        debug_assert!(size <= entry.size());

        let mut rest = entry;
        let taken = rest.shrink_from_back(size);
        if rest.size() > 0 {
            self.entries.insert(rest.start(), rest.size());
        } else {
            self.entries.remove(&entry.start());
        }
        self.size -= size;

        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, size: usize) -> VirtualRange {
        VirtualRange::new(start, size)
    }

    fn entries(map: &RangeMap) -> Vec<(usize, usize)> {
        map.iter().map(|r| (r.start(), r.size())).collect()
    }

    #[test]
    fn test_insert_coalesces_either_order() {
        let mut forward = RangeMap::new();
        forward.insert(range(0, 100));
        forward.insert(range(100, 100));
        assert_eq!(entries(&forward), vec![(0, 200)]);

        let mut backward = RangeMap::new();
        backward.insert(range(100, 100));
        backward.insert(range(0, 100));
        assert_eq!(entries(&backward), vec![(0, 200)]);
    }

    #[test]
    fn test_insert_bridges_gap() {
        let mut map = RangeMap::new();
        map.insert(range(0, 100));
        map.insert(range(200, 100));
        assert_eq!(map.len(), 2);

        map.insert(range(100, 100));
        assert_eq!(entries(&map), vec![(0, 300)]);
        assert_eq!(map.size(), 300);
    }

    #[test]
    #[should_panic(expected = "Overlapping insert")]
    fn test_double_insert_panics() {
        let mut map = RangeMap::new();
        map.insert(range(0, 100));
        map.insert(range(50, 100));
    }

    #[test]
    fn test_remove_from_low_splits_front() {
        let mut map = RangeMap::new();
        map.insert(range(0, 50));
        map.insert(range(100, 200));

        assert_eq!(map.remove_from_low(100), Some(range(100, 100)));
        assert_eq!(entries(&map), vec![(0, 50), (200, 100)]);
        assert_eq!(map.remove_from_low(500), None);
    }

    #[test]
    fn test_remove_from_first_ignores_later_entries() {
        let mut map = RangeMap::new();
        map.insert(range(0, 100));
        map.insert(range(300, 500));

        assert_eq!(map.remove_from_first(200), None);
        assert_eq!(entries(&map), vec![(0, 100), (300, 500)]);

        assert_eq!(map.remove_from_first(60), Some(range(0, 60)));
        assert_eq!(entries(&map), vec![(60, 40), (300, 500)]);
        assert_eq!(map.size(), 540);
    }

    #[test]
    fn test_remove_from_high_splits_back() {
        let mut map = RangeMap::new();
        map.insert(range(0, 200));
        map.insert(range(300, 50));

        assert_eq!(map.remove_from_high(100), Some(range(100, 100)));
        assert_eq!(entries(&map), vec![(0, 100), (300, 50)]);
    }

    #[test]
    fn test_remove_from_high_many_splits_tail() {
        let mut map = RangeMap::new();
        for start in [0, 200, 400, 600] {
            map.insert(range(start, 100));
        }

        let mut out = Vec::new();
        assert_eq!(map.remove_from_high_many(150, &mut out), 150);
        assert_eq!(out, vec![range(600, 100), range(450, 50)]);
        assert_eq!(entries(&map), vec![(0, 100), (200, 100), (400, 50)]);
    }

    #[test]
    fn test_remove_from_low_many_splits_front() {
        let mut map = RangeMap::new();
        map.insert(range(0, 100));
        map.insert(range(200, 100));

        let mut out = Vec::new();
        assert_eq!(map.remove_from_low_many(150, &mut out), 150);
        assert_eq!(out, vec![range(0, 100), range(200, 50)]);
        assert_eq!(entries(&map), vec![(250, 50)]);

        // Asking for more than available drains the map
        out.clear();
        assert_eq!(map.remove_from_low_many(1000, &mut out), 50);
        assert!(map.is_empty());
    }

    #[test]
    fn test_contains_whole_range_only() {
        let mut map = RangeMap::new();
        map.insert(range(100, 100));
        map.insert(range(300, 100));
        assert!(map.contains(range(100, 100)));
        assert!(map.contains(range(150, 50)));
        assert!(!map.contains(range(150, 100)));
        assert!(!map.contains(range(50, 100)));

        // Touching inserts merge, so a range across the seam is contained
        map.insert(range(200, 100));
        assert!(map.contains(range(150, 200)));
    }
}
