//! Per-NUMA capacity accounting.
//!
//! Each partition tracks four byte counts:
//!
//! - `capacity`: backing memory committed to the partition.
//! - `used`: bytes held by live pages.
//! - `claimed`: bytes taken out of the cache by the uncommitter.
//! - `current_max_capacity`: the ceiling for `capacity`, lowered permanently
//!   when the operating system fails to commit.
//!
//! The counters are only modified under the allocator lock but may be read
//! at any time. Whatever is committed and neither used nor claimed sits in
//! the partition's [`MappedCache`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::mapped_cache::MappedCache;
use crate::range::VirtualRange;

// ============================================================================
// UncommitCycle
// ============================================================================

/// State of the uncommitter's current cycle.
///
/// The epoch changes whenever a cycle starts or is cancelled, so a chunk
/// prepared under an old epoch is recognised as stale.
#[derive(Debug, Clone, Default)]
pub struct UncommitCycle {
    active: bool,
    epoch: u64,
    to_uncommit: usize,
    uncommitted: usize,
    cancel_time: Option<Instant>,
}

impl UncommitCycle {
    /// Starts a cycle that may uncommit up to `to_uncommit` bytes.
    pub fn start(&mut self, to_uncommit: usize) -> u64 {
        self.active = true;
        self.epoch += 1;
        self.to_uncommit = to_uncommit;
        self.uncommitted = 0;
        self.cancel_time = None;
        self.epoch
    }

    /// Cancels an active cycle. Returns `false` if none was running.
    pub fn cancel(&mut self, now: Instant) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.epoch += 1;
        self.cancel_time = Some(now);
        true
    }

    /// Ends the cycle normally.
    pub const fn finish(&mut self) {
        self.active = false;
    }

    /// Records uncommitted bytes.
    pub const fn record(&mut self, size: usize) {
        self.uncommitted += size;
    }

    /// Returns `true` between `start` and `finish` or `cancel`.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Current epoch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Bytes the cycle may still uncommit.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.to_uncommit.saturating_sub(self.uncommitted)
    }

    /// Bytes uncommitted so far in this cycle.
    #[must_use]
    pub const fn uncommitted(&self) -> usize {
        self.uncommitted
    }

    /// Time of the last cancellation, cleared when a cycle starts.
    #[must_use]
    pub const fn cancel_time(&self) -> Option<Instant> {
        self.cancel_time
    }
}

// ============================================================================
// PartitionState
// ============================================================================

/// Lock-protected part of a partition.
#[derive(Debug)]
pub struct PartitionState {
    /// Mapped, unused memory.
    pub cache: MappedCache,
    /// Time of the last capacity increase.
    pub last_commit: Instant,
    /// Uncommitter progress.
    pub uncommit: UncommitCycle,
}

impl PartitionState {
    /// Creates the state of an empty partition.
    #[must_use]
    pub fn new(granule: usize) -> Self {
        Self {
            cache: MappedCache::new(granule),
            last_commit: Instant::now(),
            uncommit: UncommitCycle::default(),
        }
    }
}

// ============================================================================
// Partition
// ============================================================================

/// Capacity counters of one NUMA partition.
#[derive(Debug)]
pub struct Partition {
    numa_id: usize,
    min_capacity: usize,
    max_capacity: usize,
    current_max_capacity: AtomicUsize,
    capacity: AtomicUsize,
    claimed: AtomicUsize,
    used: AtomicUsize,
}

impl Partition {
    /// Creates a partition with nothing committed.
    #[must_use]
    pub const fn new(numa_id: usize, min_capacity: usize, max_capacity: usize) -> Self {
        Self {
            numa_id,
            min_capacity,
            max_capacity,
            current_max_capacity: AtomicUsize::new(max_capacity),
            capacity: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        }
    }

    /// Node this partition belongs to.
    #[must_use]
    pub const fn numa_id(&self) -> usize {
        self.numa_id
    }

    /// Floor for uncommitting.
    #[must_use]
    pub const fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    /// Configured ceiling.
    #[must_use]
    pub const fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Effective ceiling.
    #[must_use]
    pub fn current_max_capacity(&self) -> usize {
        self.current_max_capacity.load(Ordering::Relaxed)
    }

    /// Committed bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Bytes held by the uncommitter.
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Bytes held by pages.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes that can still be handed to pages.
    #[must_use]
    pub fn available(&self) -> usize {
        self.current_max_capacity()
            .saturating_sub(self.used())
            .saturating_sub(self.claimed())
    }

    /// Checks `used + claimed <= capacity <= current_max <= max`.
    #[must_use]
    pub fn check_invariants(&self) -> bool {
        let capacity = self.capacity();
        let current_max = self.current_max_capacity();
        self.used() + self.claimed() <= capacity
            && capacity <= current_max
            && current_max <= self.max_capacity
    }

    pub(crate) fn increase_used(&self, size: usize) {
        self.used.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn decrease_used(&self, size: usize) {
        let old = self.used.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "Used underflow");
    }

    pub(crate) fn increase_claimed(&self, size: usize) {
        self.claimed.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn decrease_claimed(&self, size: usize) {
        let old = self.claimed.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "Claimed underflow");
    }

    /// Raises capacity by up to `size` bytes, bounded by the current max.
    ///
    /// Any increase restarts the uncommit delay, resets the cache watermark
    /// and cancels a running uncommit cycle. Returns the increase.
    pub(crate) fn increase_capacity(&self, state: &mut PartitionState, size: usize) -> usize {
        let capacity = self.capacity();
        let increased = size.min(self.current_max_capacity() - capacity);
        if increased == 0 {
            return 0;
        }

        self.capacity.store(capacity + increased, Ordering::Relaxed);

        let now = Instant::now();
        state.last_commit = now;
        state.cache.reset_min_size_watermark();
        state.uncommit.cancel(now);

        crate::tracing::internal::log_capacity_increase(self.numa_id, increased, capacity + increased);
        increased
    }

    /// Lowers capacity by `size` bytes. With `set_max`, the current max
    /// capacity is lowered to the new capacity for good.
    pub(crate) fn decrease_capacity(&self, size: usize, set_max: bool) {
        let old = self.capacity.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "Capacity underflow");

        if set_max {
            let capacity = old - size;
            self.current_max_capacity.store(capacity, Ordering::Relaxed);
            crate::tracing::internal::log_capacity_lowered(self.numa_id, size, capacity);
        }
    }

    /// Takes `size` bytes of capacity for a page.
    ///
    /// A single cached range of exactly `size` bytes is preferred. Otherwise
    /// capacity is increased and the remainder is harvested from the cache
    /// in pieces. With `cache_only`, only the first step is tried.
    ///
    /// On success the ranges are appended to `mappings` and the capacity
    /// increase is returned.
    pub(crate) fn claim_capacity(
        &self,
        state: &mut PartitionState,
        size: usize,
        cache_only: bool,
        mappings: &mut Vec<VirtualRange>,
    ) -> Option<usize> {
        if self.available() < size {
            return None;
        }

        if let Some(vmem) = state.cache.remove_contiguous(size) {
            mappings.push(vmem);
            self.increase_used(size);
            return Some(0);
        }

        if cache_only {
            return None;
        }

        let increased = self.increase_capacity(state, size);
        let remaining = size - increased;
        if remaining > 0 {
            let harvested = state.cache.remove_mappings(remaining, mappings);
            debug_assert_eq!(harvested, remaining, "Cache out of sync with capacity");
        }

        self.increase_used(size);
        Some(increased)
    }
}
