//! Cache of mapped-but-unused memory.
//!
//! Freed pages keep their physical backing and their mapping. The virtual
//! range is inserted here (coalescing with neighbors) and handed out again by
//! later allocations without touching the operating system. The physical
//! backing of each cached granule is recorded in the physical mapping table,
//! so a cached range together with that table forms the mapped memory.
//!
//! All access happens under the allocator lock.

use crate::range::VirtualRange;
use crate::range_map::RangeMap;

/// Mapped memory cache of one partition.
#[derive(Debug)]
pub struct MappedCache {
    ranges: RangeMap,
    granule: usize,
    /// Lowest cache size observed since the last reset.
    min_size_watermark: usize,
}

impl MappedCache {
    /// Creates an empty cache for `granule`-aligned ranges.
    #[must_use]
    pub const fn new(granule: usize) -> Self {
        Self {
            ranges: RangeMap::new(),
            granule,
            min_size_watermark: 0,
        }
    }

    /// Total cached bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.ranges.size()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates cached entries in increasing address order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = VirtualRange> + '_ {
        self.ranges.iter()
    }

    /// Inserts a freed mapping, merging it with adjacent cached mappings.
    pub fn insert(&mut self, vmem: VirtualRange) {
        debug_assert!(vmem.size() % self.granule == 0, "Unaligned {vmem:?}");
        self.ranges.insert(vmem);
    }

    /// Removes one contiguous mapping of exactly `size` bytes.
    ///
    /// Granule-sized requests always take the lowest cached address. Larger
    /// requests take the first entry, in address order, that is large
    /// enough; an oversized entry is split and its front is returned.
    pub fn remove_contiguous(&mut self, size: usize) -> Option<VirtualRange> {
        debug_assert!(size > 0 && size % self.granule == 0);

        let vmem = if size == self.granule {
            // Every entry holds at least one granule
            self.ranges.remove_from_first(size)
        } else {
            self.ranges.remove_from_low(size)
        }?;

        self.update_min_size_watermark();
        Some(vmem)
    }

    /// Removes mappings totalling up to `size` bytes, highest addresses
    /// first. A final partial entry is split and its tail is taken.
    ///
    /// Returns the number of bytes appended to `out`.
    pub fn remove_mappings(&mut self, size: usize, out: &mut Vec<VirtualRange>) -> usize {
        let removed = self.ranges.remove_from_high_many(size, out);
        if removed > 0 {
            self.update_min_size_watermark();
        }
        removed
    }

    /// Removes mappings totalling up to `size` bytes for uncommitting,
    /// lowest addresses first.
    ///
    /// Returns the number of bytes appended to `out`.
    pub fn remove_from_min(&mut self, size: usize, out: &mut Vec<VirtualRange>) -> usize {
        let size = size - size % self.granule;
        let removed = self.ranges.remove_from_low_many(size, out);
        if removed > 0 {
            self.update_min_size_watermark();
        }
        removed
    }

    /// Lowest cache size since the last reset.
    #[must_use]
    pub const fn min_size_watermark(&self) -> usize {
        self.min_size_watermark
    }

    /// Restarts watermark tracking from the current size.
    pub const fn reset_min_size_watermark(&mut self) {
        self.min_size_watermark = self.ranges.size();
    }

    fn update_min_size_watermark(&mut self) {
        self.min_size_watermark = self.min_size_watermark.min(self.ranges.size());
    }
}
