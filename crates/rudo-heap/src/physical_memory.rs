//! Physical backing storage.
//!
//! Backing storage is addressed by offsets in `[0, max_capacity)` and handed
//! out a granule at a time. Each NUMA partition owns a contiguous slice of
//! the backing offsets. For every virtual granule of the heap, a mapping
//! table records which backing granule is assigned to it, so memory can be
//! remapped to a different virtual range without copying.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::PointerColors;
use crate::backend::MemoryBackend;
use crate::collaborators::MemoryTracker;
use crate::numa::Numa;
use crate::range::VirtualRange;
use crate::range_map::RangeMap;

/// Mapping table entry of a virtual granule without backing.
const INVALID_SEGMENT: u32 = u32::MAX;

/// Backing granules saved while their virtual range is being replaced.
pub type Stash = Vec<u32>;

/// A run of virtual granules backed by consecutive backing granules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    vmem_start: usize,
    offset: usize,
    size: usize,
}

/// Owner of the backing storage and the virtual to backing mapping table.
#[derive(Debug)]
pub struct PhysicalMemoryManager {
    backend: Arc<dyn MemoryBackend>,
    tracker: Arc<dyn MemoryTracker>,
    colors: Arc<PointerColors>,
    granule: usize,
    /// Free backing offsets, per NUMA partition.
    partitions: Vec<Mutex<RangeMap>>,
    /// Backing granule index per virtual granule.
    mappings: Box<[AtomicU32]>,
}

impl PhysicalMemoryManager {
    /// Creates a manager for `max_capacity` bytes of backing storage and a
    /// mapping table covering `[0, reserved_end)`.
    ///
    /// # Panics
    ///
    /// Panics if the backing storage has more granules than the mapping
    /// table can index.
    #[must_use]
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        tracker: Arc<dyn MemoryTracker>,
        colors: Arc<PointerColors>,
        max_capacity: usize,
        reserved_end: usize,
        numa: Numa,
        granule: usize,
    ) -> Self {
        assert!(
            max_capacity / granule < INVALID_SEGMENT as usize,
            "Too many backing granules"
        );

        let mut start = 0;
        let partitions = (0..numa.count())
            .map(|numa_id| {
                let share = numa.calculate_share(numa_id, max_capacity, granule);
                let mut free = RangeMap::new();
                if share > 0 {
                    free.insert(VirtualRange::new(start, share));
                }
                start += share;
                Mutex::new(free)
            })
            .collect();

        let mappings = (0..reserved_end / granule)
            .map(|_| AtomicU32::new(INVALID_SEGMENT))
            .collect();

        Self {
            backend,
            tracker,
            colors,
            granule,
            partitions,
            mappings,
        }
    }

    /// Free backing bytes in partition `numa_id`.
    #[must_use]
    pub fn free_size(&self, numa_id: usize) -> usize {
        self.partitions[numa_id].lock().size()
    }

    /// Backing offset assigned to the virtual granule at `offset`.
    #[must_use]
    pub fn backing_offset(&self, offset: usize) -> Option<usize> {
        let segment = self.entry(offset).load(Ordering::Acquire);
        (segment != INVALID_SEGMENT).then(|| segment as usize * self.granule)
    }

    /// Assigns backing granules of partition `numa_id` to every granule of
    /// `vmem`.
    ///
    /// # Panics
    ///
    /// Panics if the partition has less free backing than `vmem.size()`.
    /// Capacity accounting makes that impossible.
    pub fn alloc(&self, vmem: VirtualRange, numa_id: usize) {
        let mut ranges = Vec::new();
        let taken = self.partitions[numa_id]
            .lock()
            .remove_from_low_many(vmem.size(), &mut ranges);
        assert_eq!(taken, vmem.size(), "Backing storage exhausted");

        let mut index = self.index(vmem.start());
        for range in ranges {
            for offset in (range.start()..range.end()).step_by(self.granule) {
                let old = self.mappings[index].swap(self.segment(offset), Ordering::AcqRel);
                debug_assert_eq!(old, INVALID_SEGMENT, "Granule already backed");
                index += 1;
            }
        }
    }

    /// Returns the backing of `vmem` to partition `numa_id`.
    pub fn free(&self, vmem: VirtualRange, numa_id: usize) {
        let mut free = self.partitions[numa_id].lock();
        for index in self.indices(vmem) {
            let segment = self.mappings[index].swap(INVALID_SEGMENT, Ordering::AcqRel);
            debug_assert_ne!(segment, INVALID_SEGMENT, "Freeing unbacked granule");
            free.insert(VirtualRange::new(segment as usize * self.granule, self.granule));
        }
    }

    /// Commits the backing of `vmem`.
    ///
    /// Returns the number of bytes committed from the start of `vmem`.
    pub fn commit(&self, vmem: VirtualRange) -> usize {
        let mut committed = 0;
        for segment in self.segments(vmem) {
            let done = self.backend.commit(segment.offset, segment.size);
            if done > 0 {
                self.tracker.commit(segment.offset, done);
            }
            committed += done;
            if done < segment.size {
                break;
            }
        }
        committed
    }

    /// Uncommits the backing of `vmem`.
    ///
    /// Returns the number of bytes uncommitted from the start of `vmem`.
    pub fn uncommit(&self, vmem: VirtualRange) -> usize {
        let mut uncommitted = 0;
        for segment in self.segments(vmem) {
            let done = self.backend.uncommit(segment.offset, segment.size);
            if done > 0 {
                self.tracker.uncommit(segment.offset, done);
            }
            uncommitted += done;
            if done < segment.size {
                break;
            }
        }
        uncommitted
    }

    /// Maps the backing of `vmem` at its heap address.
    ///
    /// # Panics
    ///
    /// Panics if the backend refuses the mapping. The range is reserved and
    /// the backing committed, so failure means the process is out of kernel
    /// resources and the heap cannot continue.
    pub fn map(&self, vmem: VirtualRange) {
        for segment in self.segments(vmem) {
            let addr = self.colors.offset_to_address(segment.vmem_start);
            if let Err(err) = self.backend.map(addr, segment.size, segment.offset) {
                panic!("Failed to map {:#x}+{:#x}: {err}", addr, segment.size);
            }
            self.tracker.map(addr, segment.size, segment.offset);
        }
    }

    /// Unmaps `vmem`, keeping its backing assigned.
    ///
    /// # Panics
    ///
    /// Panics if the backend refuses the unmapping.
    pub fn unmap(&self, vmem: VirtualRange) {
        let addr = self.colors.offset_to_address(vmem.start());
        if let Err(err) = self.backend.unmap(addr, vmem.size()) {
            panic!("Failed to unmap {:#x}+{:#x}: {err}", addr, vmem.size());
        }
        self.tracker.unmap(addr, vmem.size());
    }

    /// Moves the backing of `from` to the granules starting at `to`.
    ///
    /// The entries of `from` are invalidated.
    pub fn copy_physical_segments(&self, to: usize, from: VirtualRange) {
        let to = self.index(to);
        for (i, index) in self.indices(from).enumerate() {
            let segment = self.mappings[index].swap(INVALID_SEGMENT, Ordering::AcqRel);
            let old = self.mappings[to + i].swap(segment, Ordering::AcqRel);
            debug_assert_eq!(old, INVALID_SEGMENT, "Overwriting backed granule");
        }
    }

    /// Saves and invalidates the backing of `ranges`, in order.
    pub fn stash(&self, ranges: &[VirtualRange]) -> Stash {
        ranges
            .iter()
            .flat_map(|&vmem| self.indices(vmem))
            .map(|index| self.mappings[index].swap(INVALID_SEGMENT, Ordering::AcqRel))
            .collect()
    }

    /// Assigns stashed backing to `ranges`, in order.
    ///
    /// # Panics
    ///
    /// Panics if `ranges` do not cover exactly the stashed granules.
    pub fn restore(&self, ranges: &[VirtualRange], stash: &Stash) {
        let mut segments = stash.iter();
        for index in ranges.iter().flat_map(|&vmem| self.indices(vmem)) {
            let Some(&segment) = segments.next() else {
                panic!("Stash smaller than the restored ranges");
            };
            self.mappings[index].store(segment, Ordering::Release);
        }
        assert!(segments.next().is_none(), "Stash larger than the restored ranges");
    }

    fn entry(&self, offset: usize) -> &AtomicU32 {
        &self.mappings[self.index(offset)]
    }

    const fn index(&self, offset: usize) -> usize {
        offset / self.granule
    }

    fn indices(&self, vmem: VirtualRange) -> std::ops::Range<usize> {
        let first = self.index(vmem.start());
        first..first + vmem.granule_count(self.granule)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn segment(&self, offset: usize) -> u32 {
        (offset / self.granule) as u32
    }

    /// Splits `vmem` into runs with consecutive backing.
    fn segments(&self, vmem: VirtualRange) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();
        for index in self.indices(vmem) {
            let segment = self.mappings[index].load(Ordering::Acquire);
            debug_assert_ne!(segment, INVALID_SEGMENT, "Unbacked granule");
            let offset = segment as usize * self.granule;
            let vmem_start = index * self.granule;

            match segments.last_mut() {
                Some(last)
                    if last.offset + last.size == offset
                        && last.vmem_start + last.size == vmem_start =>
                {
                    last.size += self.granule;
                }
                _ => segments.push(Segment {
                    vmem_start,
                    offset,
                    size: self.granule,
                }),
            }
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MIN_HEAP_BASE_SHIFT;
    use crate::backend::SimulatedBackend;
    use crate::collaborators::NoopTracker;
    use crate::globals::M;

    const G: usize = 2 * M;

    fn setup(max: usize, nodes: usize) -> (Arc<SimulatedBackend>, Arc<PointerColors>, PhysicalMemoryManager) {
        let backend = Arc::new(SimulatedBackend::new(max, G));
        let colors = Arc::new(PointerColors::new(MIN_HEAP_BASE_SHIFT));
        let base = colors.heap_base();
        assert!(backend.reserve(base, 4 * max).unwrap());
        let pmm = PhysicalMemoryManager::new(
            backend.clone(),
            Arc::new(NoopTracker),
            Arc::clone(&colors),
            max,
            4 * max,
            Numa::new(nodes),
            G,
        );
        (backend, colors, pmm)
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let (_, _, pmm) = setup(16 * M, 1);
        let vmem = VirtualRange::new(8 * M, 4 * M);

        pmm.alloc(vmem, 0);
        assert_eq!(pmm.free_size(0), 12 * M);
        assert_eq!(pmm.backing_offset(8 * M), Some(0));
        assert_eq!(pmm.backing_offset(10 * M), Some(G));

        pmm.free(vmem, 0);
        assert_eq!(pmm.free_size(0), 16 * M);
        assert_eq!(pmm.backing_offset(8 * M), None);
    }

    #[test]
    fn test_partitions_own_disjoint_backing() {
        let (_, _, pmm) = setup(16 * M, 2);
        pmm.alloc(VirtualRange::new(0, G), 1);
        assert_eq!(pmm.backing_offset(0), Some(8 * M));
        assert_eq!(pmm.free_size(0), 8 * M);
        assert_eq!(pmm.free_size(1), 6 * M);
    }

    #[test]
    fn test_commit_and_map_follow_backing() {
        let (backend, colors, pmm) = setup(16 * M, 1);
        let vmem = VirtualRange::new(4 * M, 4 * M);
        pmm.alloc(vmem, 0);

        assert_eq!(pmm.commit(vmem), 4 * M);
        assert_eq!(backend.committed(), 4 * M);

        pmm.map(vmem);
        assert_eq!(backend.mapped(), 4 * M);
        assert_eq!(backend.backing_offset(colors.offset_to_address(6 * M)), Some(G));

        pmm.unmap(vmem);
        assert_eq!(backend.mapped(), 0);
        assert_eq!(pmm.uncommit(vmem), 4 * M);
        assert_eq!(backend.committed(), 0);
    }

    #[test]
    fn test_partial_commit_reports_prefix() {
        let (backend, _, pmm) = setup(16 * M, 1);
        backend.set_commit_limit(Some(G));
        let vmem = VirtualRange::new(0, 4 * M);
        pmm.alloc(vmem, 0);
        assert_eq!(pmm.commit(vmem), G);
    }

    #[test]
    fn test_copy_moves_backing() {
        let (_, _, pmm) = setup(16 * M, 1);
        let a = VirtualRange::new(0, G);
        let b = VirtualRange::new(6 * M, G);
        pmm.alloc(a, 0);
        pmm.alloc(b, 0);

        pmm.copy_physical_segments(20 * M, a);
        pmm.copy_physical_segments(22 * M, b);
        assert_eq!(pmm.backing_offset(0), None);
        assert_eq!(pmm.backing_offset(20 * M), Some(0));
        assert_eq!(pmm.backing_offset(22 * M), Some(G));
    }

    #[test]
    fn test_stash_restore_onto_new_ranges() {
        let (_, _, pmm) = setup(16 * M, 1);
        let old = [VirtualRange::new(10 * M, G), VirtualRange::new(14 * M, G)];
        for vmem in old {
            pmm.alloc(vmem, 0);
        }

        let stash = pmm.stash(&old);
        assert_eq!(pmm.backing_offset(10 * M), None);

        let new = [VirtualRange::new(0, 2 * G)];
        pmm.restore(&new, &stash);
        assert_eq!(pmm.backing_offset(0), Some(0));
        assert_eq!(pmm.backing_offset(G), Some(G));
    }

    #[test]
    #[should_panic(expected = "Backing storage exhausted")]
    fn test_overallocation_panics() {
        let (_, _, pmm) = setup(4 * M, 1);
        pmm.alloc(VirtualRange::new(0, 6 * M), 0);
    }
}
