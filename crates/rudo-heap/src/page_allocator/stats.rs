//! Page allocator statistics.

use crate::page::GenerationId;

/// Per-generation counters since the generation's last collection started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CollectionStats {
    pub(crate) used_high: usize,
    pub(crate) used_low: usize,
    pub(crate) freed: usize,
    pub(crate) promoted: usize,
    pub(crate) allocation_stalls: usize,
}

impl CollectionStats {
    pub(crate) const fn reset(&mut self, used: usize) {
        *self = Self {
            used_high: used,
            used_low: used,
            freed: 0,
            promoted: 0,
            allocation_stalls: 0,
        };
    }

    pub(crate) fn update_used(&mut self, used: usize) {
        self.used_high = self.used_high.max(used);
        self.used_low = self.used_low.min(used);
    }
}

/// Snapshot returned by [`PageAllocator::stats`].
///
/// [`PageAllocator::stats`]: crate::PageAllocator::stats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocatorStats {
    /// Generation the collection counters belong to.
    pub generation: GenerationId,
    /// Sum of the partitions' minimum capacities.
    pub min_capacity: usize,
    /// Sum of the partitions' maximum capacities.
    pub max_capacity: usize,
    /// Advisory ceiling.
    pub soft_max_capacity: usize,
    /// Sum of the partitions' current max capacities.
    pub current_max_capacity: usize,
    /// Committed bytes.
    pub capacity: usize,
    /// Bytes held by pages.
    pub used: usize,
    /// Highest `used` since the generation's statistics were reset.
    pub used_high: usize,
    /// Lowest `used` since the generation's statistics were reset.
    pub used_low: usize,
    /// Bytes held by pages of the generation.
    pub used_generation: usize,
    /// Bytes of the generation's pages freed since the reset.
    pub freed: usize,
    /// Bytes promoted into the generation since the reset.
    pub promoted: usize,
    /// Allocation stalls since the reset.
    pub allocation_stalls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_low_watermarks() {
        let mut stats = CollectionStats::default();
        stats.reset(10);
        stats.update_used(30);
        stats.update_used(5);
        stats.update_used(20);
        assert_eq!(stats.used_high, 30);
        assert_eq!(stats.used_low, 5);

        stats.freed = 7;
        stats.reset(20);
        assert_eq!(stats.used_low, 20);
        assert_eq!(stats.freed, 0);
    }
}
