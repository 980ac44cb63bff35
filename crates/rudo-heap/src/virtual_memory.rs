//! Virtual address space management.
//!
//! The heap's address space is reserved once at startup, preferably as one
//! contiguous range, and split into per-NUMA partitions. Each partition keeps
//! a coalescing free list of unused offsets. Small and medium pages are
//! served from the low end of a partition and large pages from the high end,
//! which keeps the frequently recycled pages packed together.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::PointerColors;
use crate::backend::MemoryBackend;
use crate::collaborators::MemoryTracker;
use crate::globals::{align_down, align_up};
use crate::numa::Numa;
use crate::range::VirtualRange;
use crate::range_map::RangeMap;

/// Upper bound of contiguous placement attempts.
const MAX_CONTIGUOUS_ATTEMPTS: usize = 8192;

/// Discontiguous reservations stop splitting below `size / MAX_RESERVATIONS`.
const MAX_RESERVATIONS: usize = 100;

/// Outcome of reserving the heap's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationSummary {
    /// Bytes reserved.
    pub reserved: usize,
    /// Bytes asked for.
    pub requested: usize,
    /// Number of separate reservations.
    pub ranges: usize,
}

impl ReservationSummary {
    /// Returns `true` if the reservation is one range.
    #[must_use]
    pub const fn is_contiguous(&self) -> bool {
        self.ranges == 1
    }

    /// Returns `true` if less than requested was reserved.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.reserved < self.requested
    }
}

/// Reserves the heap's address space.
///
/// Offsets are relative to the heap base in `colors`; the backend sees
/// absolute addresses.
#[derive(Debug)]
pub struct VirtualMemoryReserver<'a> {
    backend: &'a dyn MemoryBackend,
    tracker: &'a dyn MemoryTracker,
    colors: &'a PointerColors,
    granule: usize,
    reserved: Vec<VirtualRange>,
}

impl<'a> VirtualMemoryReserver<'a> {
    /// Creates a reserver with nothing reserved.
    #[must_use]
    pub const fn new(
        backend: &'a dyn MemoryBackend,
        tracker: &'a dyn MemoryTracker,
        colors: &'a PointerColors,
        granule: usize,
    ) -> Self {
        Self {
            backend,
            tracker,
            colors,
            granule,
            reserved: Vec::new(),
        }
    }

    /// Reserves up to `size` bytes below the offset max.
    ///
    /// A single contiguous range is tried first at evenly spread start
    /// offsets. If that fails the space is reserved piecewise by recursive
    /// halving, giving up on pieces smaller than about a hundredth of `size`.
    ///
    /// # Errors
    ///
    /// Returns hard operating system errors from the backend.
    pub fn reserve(&mut self, size: usize) -> std::io::Result<ReservationSummary> {
        let size = align_down(size.min(self.colors.address_offset_max()), self.granule);

        let reserved = if self.reserve_contiguous(size)? {
            size
        } else {
            self.reserve_discontiguous(size)?
        };

        self.reserved.sort_by_key(VirtualRange::start);
        Ok(ReservationSummary {
            reserved,
            requested: size,
            ranges: self.reserved.len(),
        })
    }

    /// Releases everything reserved so far.
    pub fn unreserve_all(&mut self) {
        for range in self.reserved.drain(..) {
            let addr = self.colors.offset_to_address(range.start());
            self.backend.unreserve(addr, range.size());
            self.tracker.unreserve(addr, range.size());
        }
    }

    /// Hands over the reserved ranges, in address order.
    #[must_use]
    pub fn into_ranges(mut self) -> Vec<VirtualRange> {
        std::mem::take(&mut self.reserved)
    }

    fn reserve_contiguous(&mut self, size: usize) -> std::io::Result<bool> {
        let offset_max = self.colors.address_offset_max();
        if size == 0 || size > offset_max {
            return Ok(false);
        }

        let unused = offset_max - size;
        let increment = align_up(unused / MAX_CONTIGUOUS_ATTEMPTS, self.granule).max(self.granule);

        let mut start = 0;
        while start + size <= offset_max {
            if self.reserve_at(start, size)? {
                return Ok(true);
            }
            start += increment;
        }
        Ok(false)
    }

    fn reserve_discontiguous(&mut self, size: usize) -> std::io::Result<usize> {
        let offset_max = self.colors.address_offset_max();
        let min_range = align_up(size / MAX_RESERVATIONS, self.granule).max(self.granule);

        let mut start = 0;
        let mut reserved = 0;
        while reserved < size && start < offset_max {
            let remaining = (size - reserved).min(offset_max - start);
            reserved += self.reserve_discontiguous_at(start, remaining, min_range)?;
            start += remaining;
        }
        Ok(reserved)
    }

    fn reserve_discontiguous_at(
        &mut self,
        start: usize,
        size: usize,
        min_range: usize,
    ) -> std::io::Result<usize> {
        if size < min_range {
            return Ok(0);
        }

        if self.reserve_at(start, size)? {
            return Ok(size);
        }

        let half = size / 2;
        if half < min_range {
            return Ok(0);
        }

        // Divide and conquer
        let first_part = align_down(half, self.granule);
        let second_part = size - first_part;
        let first = self.reserve_discontiguous_at(start, first_part, min_range)?;
        let second = self.reserve_discontiguous_at(start + first_part, second_part, min_range)?;
        Ok(first + second)
    }

    fn reserve_at(&mut self, start: usize, size: usize) -> std::io::Result<bool> {
        let addr = self.colors.offset_to_address(start);
        if !self.backend.reserve(addr, size)? {
            return Ok(false);
        }

        self.tracker.reserve(addr, size);
        self.reserved.push(VirtualRange::new(start, size));
        Ok(true)
    }
}

impl Drop for VirtualMemoryReserver<'_> {
    fn drop(&mut self) {
        self.unreserve_all();
    }
}

/// Free virtual offsets of one NUMA partition.
#[derive(Debug)]
struct VirtualPartition {
    /// Reserved offsets owned by this partition. Reservations that touch
    /// are merged, matching how the free list sees them.
    owned: RangeMap,
    free: Mutex<RangeMap>,
}

/// Per-NUMA free lists over the reserved address space.
#[derive(Debug)]
pub struct VirtualMemoryManager {
    backend: Arc<dyn MemoryBackend>,
    tracker: Arc<dyn MemoryTracker>,
    colors: Arc<PointerColors>,
    reservations: Vec<VirtualRange>,
    reserved: usize,
    partitions: Vec<VirtualPartition>,
}

impl VirtualMemoryManager {
    /// Takes ownership of `reservations` and splits them between the NUMA
    /// nodes in address order.
    #[must_use]
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        tracker: Arc<dyn MemoryTracker>,
        colors: Arc<PointerColors>,
        reservations: Vec<VirtualRange>,
        numa: Numa,
        granule: usize,
    ) -> Self {
        let reserved: usize = reservations.iter().map(VirtualRange::size).sum();

        let mut pending = reservations.clone().into_iter();
        let mut current = pending.next();
        let partitions = (0..numa.count())
            .map(|numa_id| {
                let mut share = numa.calculate_share(numa_id, reserved, granule);
                let mut owned = RangeMap::new();
                let mut free = RangeMap::new();

                while share > 0 {
                    let Some(mut range) = current else { break };
                    let taken = range.shrink_from_front(share.min(range.size()));
                    share -= taken.size();
                    owned.insert(taken);
                    free.insert(taken);
                    current = if range.size() > 0 { Some(range) } else { pending.next() };
                }

                VirtualPartition {
                    owned,
                    free: Mutex::new(free),
                }
            })
            .collect();

        Self {
            backend,
            tracker,
            colors,
            reservations,
            reserved,
            partitions,
        }
    }

    /// Total bytes reserved.
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// One past the highest reserved offset.
    #[must_use]
    pub fn reserved_end(&self) -> usize {
        self.reservations.last().map_or(0, VirtualRange::end)
    }

    /// Returns `true` if the address space is a single reservation.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.reservations.len() == 1
    }

    /// Address of heap offset `offset`.
    #[must_use]
    pub fn address(&self, offset: usize) -> usize {
        self.colors.offset_to_address(offset)
    }

    /// Free bytes in partition `numa_id`.
    #[must_use]
    pub fn free_size(&self, numa_id: usize) -> usize {
        self.partitions[numa_id].free.lock().size()
    }

    /// Lowest free offset of partition `numa_id`, or `usize::MAX`.
    #[must_use]
    pub fn lowest_available_address(&self, numa_id: usize) -> usize {
        self.partitions[numa_id]
            .free
            .lock()
            .first()
            .map_or(usize::MAX, |range| range.start())
    }

    /// Allocates `size` contiguous bytes. Small and medium pages, and any
    /// request forcing it, come from the low end; the rest from the high end.
    pub fn alloc(&self, size: usize, numa_id: usize, force_low_address: bool) -> Option<VirtualRange> {
        let mut free = self.partitions[numa_id].free.lock();
        if force_low_address {
            free.remove_from_low(size)
        } else {
            free.remove_from_high(size)
        }
    }

    /// Allocates `size` bytes from the low end, possibly as several ranges.
    ///
    /// Returns the bytes appended to `out`.
    pub fn alloc_low_many(&self, size: usize, numa_id: usize, out: &mut Vec<VirtualRange>) -> usize {
        self.partitions[numa_id]
            .free
            .lock()
            .remove_from_low_many(size, out)
    }

    /// Returns `vmem` to the partition owning it.
    ///
    /// # Panics
    ///
    /// Panics if `vmem` is outside the reservation or already free.
    pub fn free(&self, vmem: VirtualRange) {
        let numa_id = self.partition_of(vmem);
        self.partitions[numa_id].free.lock().insert(vmem);
    }

    /// Frees `vmem` and allocates the same amount again from the low end of
    /// its partition, possibly split into several ranges.
    pub fn shuffle_vmem_to_low_addresses(&self, vmem: VirtualRange) -> Vec<VirtualRange> {
        let numa_id = self.partition_of(vmem);
        let mut free = self.partitions[numa_id].free.lock();
        free.insert(vmem);

        let mut out = Vec::new();
        let taken = free.remove_from_low_many(vmem.size(), &mut out);
        debug_assert_eq!(taken, vmem.size());
        out
    }

    /// Frees `mappings` and allocates one contiguous `size` byte range from
    /// the low end of partition `numa_id`.
    ///
    /// If no such range exists, the freed amount is allocated back from the
    /// low end in pieces and returned as the error.
    ///
    /// # Errors
    ///
    /// Returns the replacement ranges when no contiguous range fits.
    pub fn shuffle_vmem_to_low_addresses_contiguous(
        &self,
        size: usize,
        numa_id: usize,
        mappings: &[VirtualRange],
    ) -> Result<VirtualRange, Vec<VirtualRange>> {
        let mut free = self.partitions[numa_id].free.lock();
        for &vmem in mappings {
            debug_assert_eq!(self.partition_of(vmem), numa_id);
            free.insert(vmem);
        }

        if let Some(vmem) = free.remove_from_low(size) {
            return Ok(vmem);
        }

        let freed = mappings.iter().map(VirtualRange::size).sum();
        let mut out = Vec::new();
        free.remove_from_low_many(freed, &mut out);
        Err(out)
    }

    fn partition_of(&self, vmem: VirtualRange) -> usize {
        self.partitions
            .iter()
            .position(|partition| partition.owned.contains(vmem))
            .unwrap_or_else(|| panic!("{vmem:?} is outside the reserved address space"))
    }
}

impl Drop for VirtualMemoryManager {
    fn drop(&mut self) {
        for range in &self.reservations {
            let addr = self.colors.offset_to_address(range.start());
            self.backend.unreserve(addr, range.size());
            self.tracker.unreserve(addr, range.size());
        }
    }
}
