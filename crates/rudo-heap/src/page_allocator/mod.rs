//! The page allocator.
//!
//! [`PageAllocator`] hands out pages backed by committed, mapped memory. A
//! request is served, in order of preference, from one cached range of the
//! right size, from new capacity plus harvested cache fragments, or by
//! stalling until another thread frees memory. Freed pages go back to their
//! partition's cache.
//!
//! Per-partition background threads return unused cached memory to the
//! operating system, and a shared unmapper thread tears down fragments
//! replaced by harvesting.

mod allocation;
mod stats;
mod uncommit;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

pub use allocation::AllocationFlags;
pub use stats::PageAllocatorStats;

use allocation::StalledAllocation;
use stats::CollectionStats;

use crate::address::{probe_max_heap_base_shift, PointerColors};
use crate::backend::{self, MemoryBackend};
use crate::collaborators::{Collaborators, GcRequest};
use crate::config::HeapConfig;
use crate::error::{AllocError, HeapError};
use crate::globals::{is_aligned, PageSizes, PageType};
use crate::numa::Numa;
use crate::page::{GenerationId, Page, PageAge};
use crate::partition::{Partition, PartitionState};
use crate::physical_memory::PhysicalMemoryManager;
use crate::range::VirtualRange;
use crate::relocation_set_selector::RelocationSetSelector;
use crate::safe_delete::SafeDelete;
use crate::unmapper::Unmapper;
use crate::virtual_memory::{VirtualMemoryManager, VirtualMemoryReserver};

/// Everything guarded by the allocator lock.
#[derive(Debug)]
pub(crate) struct AllocatorState {
    pub(crate) partitions: Vec<PartitionState>,
    pub(crate) stalled: VecDeque<StalledAllocation>,
    pub(crate) stats: [CollectionStats; 2],
    pub(crate) stop: bool,
}

/// State shared with the background threads.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: HeapConfig,
    pub(crate) sizes: PageSizes,
    pub(crate) numa: Numa,
    pub(crate) colors: Arc<PointerColors>,
    pub(crate) vmm: Arc<VirtualMemoryManager>,
    pub(crate) pmm: Arc<PhysicalMemoryManager>,
    pub(crate) unmapper: Arc<Unmapper>,
    pub(crate) partitions: Box<[CachePadded<Partition>]>,
    pub(crate) state: Mutex<AllocatorState>,
    pub(crate) uncommit_wakeup: Condvar,
    used_generation: [AtomicUsize; 2],
    allocated: AtomicUsize,
    safe_delete: SafeDelete<Box<Page>>,
    pub(crate) collaborators: Collaborators,
}

/// Concurrent page allocator over a reserved, partitioned heap.
///
/// All methods take `&self` and may be called from any thread.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use rudo_heap::backend::SimulatedBackend;
/// use rudo_heap::{AllocationFlags, Collaborators, HeapConfig, PageAge, PageAllocator, PageType};
///
/// const M: usize = 1024 * 1024;
///
/// let config = HeapConfig::default()
///     .with_capacities(16 * M, 16 * M, 64 * M)
///     .with_heap_base_shift(36);
/// let backend = Arc::new(SimulatedBackend::new(64 * M, 2 * M));
/// let allocator = PageAllocator::with_backend(&config, backend, Collaborators::default())?;
///
/// let page = allocator
///     .alloc_page(PageType::Small, 2 * M, PageAge::EDEN, AllocationFlags::new())
///     .unwrap();
/// assert_eq!(allocator.used(), 2 * M);
///
/// allocator.free_page(page);
/// assert_eq!(allocator.used(), 0);
/// # Ok::<(), rudo_heap::HeapError>(())
/// ```
#[derive(Debug)]
pub struct PageAllocator {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl PageAllocator {
    /// Creates an allocator over the operating system backend.
    ///
    /// # Errors
    ///
    /// See [`with_backend`](Self::with_backend).
    pub fn new(config: &HeapConfig) -> Result<Self, HeapError> {
        let normalized = config.normalized();
        let backend = backend::default_backend(normalized.max_capacity, normalized.granule_size)?;
        Self::with_backend(config, backend, Collaborators::default())
    }

    /// Creates an allocator over `backend`.
    ///
    /// Reserves the address space, commits and caches the initial capacity
    /// and starts the background threads.
    ///
    /// # Errors
    ///
    /// - [`HeapError::InvalidConfig`] if `config` does not validate.
    /// - [`HeapError::ReservationFailed`] if less than the max capacity of
    ///   address space could be reserved at any heap base.
    /// - [`HeapError::InitialCommitFailed`] if the initial capacity could
    ///   not be committed.
    /// - [`HeapError::Io`] for backend or thread creation failures.
    pub fn with_backend(
        config: &HeapConfig,
        backend: Arc<dyn MemoryBackend>,
        collaborators: Collaborators,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        let config = config.normalized();
        let _span = crate::tracing::internal::trace_initialize(config.max_capacity, config.numa_nodes);

        let granule = config.granule_size;
        let numa = Numa::new(config.numa_nodes);

        let shift = config.heap_base_shift.unwrap_or_else(|| {
            probe_max_heap_base_shift(backend.page_size(), |addr| backend.probe_address(addr))
        });
        let colors = Arc::new(PointerColors::new(shift));

        let reservations = reserve_address_space(backend.as_ref(), &collaborators, &colors, &config)?;
        let vmm = Arc::new(VirtualMemoryManager::new(
            Arc::clone(&backend),
            Arc::clone(&collaborators.tracker),
            Arc::clone(&colors),
            reservations,
            numa,
            granule,
        ));
        let pmm = Arc::new(PhysicalMemoryManager::new(
            Arc::clone(&backend),
            Arc::clone(&collaborators.tracker),
            Arc::clone(&colors),
            config.max_capacity,
            vmm.reserved_end(),
            numa,
            granule,
        ));
        let unmapper = Arc::new(Unmapper::new(
            Arc::clone(&pmm),
            Arc::clone(&vmm),
            config.max_capacity,
            config.async_unmapping_limit_percent,
        ));

        let partitions = (0..numa.count())
            .map(|numa_id| {
                CachePadded::new(Partition::new(
                    numa_id,
                    numa.calculate_share(numa_id, config.min_capacity, granule),
                    numa.calculate_share(numa_id, config.max_capacity, granule),
                ))
            })
            .collect();

        let shared = Arc::new(Shared {
            sizes: PageSizes::new(granule, config.max_capacity),
            numa,
            colors,
            vmm,
            pmm,
            unmapper,
            partitions,
            state: Mutex::new(AllocatorState {
                partitions: (0..numa.count()).map(|_| PartitionState::new(granule)).collect(),
                stalled: VecDeque::new(),
                stats: [CollectionStats::default(); 2],
                stop: false,
            }),
            uncommit_wakeup: Condvar::new(),
            used_generation: [AtomicUsize::new(0), AtomicUsize::new(0)],
            allocated: AtomicUsize::new(0),
            safe_delete: SafeDelete::new(),
            collaborators,
            config,
        });

        shared.prime_cache()?;

        let mut allocator = Self {
            shared,
            workers: Vec::new(),
        };
        allocator.start_workers()?;
        Ok(allocator)
    }

    fn start_workers(&mut self) -> Result<(), HeapError> {
        let unmapper = Arc::clone(&self.shared.unmapper);
        self.workers.push(
            thread::Builder::new()
                .name("rudo-heap-unmapper".into())
                .spawn(move || unmapper.run())?,
        );

        if !self.shared.config.uncommit {
            return Ok(());
        }

        for partition in self.shared.partitions.iter() {
            if partition.min_capacity() == partition.max_capacity() {
                continue;
            }

            let numa_id = partition.numa_id();
            let shared = Arc::clone(&self.shared);
            self.workers.push(
                thread::Builder::new()
                    .name(format!("rudo-heap-uncommitter-{numa_id}"))
                    .spawn(move || shared.run_uncommitter(numa_id))?,
            );
        }
        Ok(())
    }

    // ---- allocation -----------------------------------------------------

    /// Allocates a page of `size` bytes.
    ///
    /// Small and medium pages must use the sizes in [`sizes`](Self::sizes);
    /// large pages any multiple of the granule. Unless `flags` says
    /// otherwise, a request that cannot be served stalls until memory is
    /// freed or the collector declares out of memory.
    ///
    /// # Errors
    ///
    /// - [`AllocError::WouldStall`] for a non-blocking request that would
    ///   have stalled.
    /// - [`AllocError::OutOfMemory`] if a stalled request was failed by
    ///   [`notify_out_of_memory`](Self::notify_out_of_memory).
    /// - [`AllocError::AddressSpaceExhausted`] if no contiguous virtual range
    ///   of `size` bytes exists.
    pub fn alloc_page(
        &self,
        page_type: PageType,
        size: usize,
        age: PageAge,
        flags: AllocationFlags,
    ) -> Result<Box<Page>, AllocError> {
        debug_assert!(size > 0 && is_aligned(size, self.shared.config.granule_size));
        debug_assert!(page_type == PageType::Large || size == self.shared.sizes.page_size_for(page_type, 0));

        let shared = &*self.shared;
        loop {
            let claim = shared.claim_or_stall(page_type, size, flags)?;
            let numa_id = claim.numa_id;
            // A failed commit lowers the capacity ceiling, so this terminates
            if let Some(vmem) = shared.prepare_memory(claim, page_type)? {
                return Ok(shared.create_page(page_type, vmem, age, numa_id, flags));
            }
        }
    }

    /// Returns a page.
    pub fn free_page(&self, page: Box<Page>) {
        self.free_pages(vec![page]);
    }

    /// Returns several pages under one lock acquisition.
    ///
    /// Stalled requests that fit into the freed memory are satisfied before
    /// this returns.
    pub fn free_pages(&self, pages: Vec<Box<Page>>) {
        let shared = &*self.shared;

        let freed: Vec<(usize, GenerationId, usize, Vec<VirtualRange>)> = pages
            .iter()
            .map(|page| {
                let defragment = shared.should_defragment(page);
                let ranges = if defragment {
                    shared.defragment(page.virtual_memory())
                } else {
                    vec![page.virtual_memory()]
                };
                crate::tracing::internal::log_page_free(
                    page.page_type(),
                    page.size(),
                    page.address(),
                    defragment,
                );
                (page.numa_id(), page.generation(), page.size(), ranges)
            })
            .collect();

        {
            let mut state = shared.state.lock();
            for (numa_id, generation, size, ranges) in freed {
                for vmem in ranges {
                    state.partitions[numa_id].cache.insert(vmem);
                }
                shared.partitions[numa_id].decrease_used(size);
                shared.decrease_used_generation(generation, size);
                state.stats[generation.index()].freed += size;
            }
            shared.update_used_stats(&mut state);
            shared.satisfy_stalled(&mut state);
        }

        for page in pages {
            shared.safe_delete.schedule_delete(page);
        }
    }

    // ---- collector coordination -----------------------------------------

    /// Returns `true` if any request is stalled.
    #[must_use]
    pub fn is_alloc_stalling(&self) -> bool {
        !self.shared.state.lock().stalled.is_empty()
    }

    /// Returns `true` if the oldest stalled request has already waited
    /// through a young collection, so an old collection is needed.
    #[must_use]
    pub fn is_alloc_stalling_for_old(&self) -> bool {
        let state = self.shared.state.lock();
        state
            .stalled
            .front()
            .is_some_and(|stalled| stalled.young_seqnum != self.shared.collaborators.driver.young_seqnum())
    }

    /// Called after a young collection; restarts collection if requests
    /// are still stalled.
    pub fn handle_alloc_stalling_for_young(&self) {
        let stalling = self.is_alloc_stalling();
        self.shared.restart_gc(stalling);
    }

    /// Called after an old collection. If it cleared all soft references,
    /// requests that have waited through it are failed. Collection restarts
    /// while requests remain stalled.
    pub fn handle_alloc_stalling_for_old(&self, cleared_all_soft_refs: bool) {
        let stalling = {
            let mut state = self.shared.state.lock();
            if cleared_all_soft_refs {
                self.shared.notify_out_of_memory(&mut state);
            }
            !state.stalled.is_empty()
        };
        self.shared.restart_gc(stalling);
    }

    /// Fails every stalled request that was queued before the current old
    /// collection started.
    pub fn notify_out_of_memory(&self) {
        let mut state = self.shared.state.lock();
        self.shared.notify_out_of_memory(&mut state);
    }

    // ---- capacity -------------------------------------------------------

    /// Sum of the partitions' minimum capacities.
    #[must_use]
    pub fn min_capacity(&self) -> usize {
        self.shared.partitions.iter().map(|p| p.min_capacity()).sum()
    }

    /// Sum of the partitions' maximum capacities.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.shared.partitions.iter().map(|p| p.max_capacity()).sum()
    }

    /// Effective ceiling, lowered by commit failures.
    #[must_use]
    pub fn current_max_capacity(&self) -> usize {
        self.shared.partitions.iter().map(|p| p.current_max_capacity()).sum()
    }

    /// Advisory ceiling, never above the current max capacity.
    #[must_use]
    pub fn soft_max_capacity(&self) -> usize {
        self.shared.config.soft_max_capacity.min(self.current_max_capacity())
    }

    /// Committed bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.partitions.iter().map(|p| p.capacity()).sum()
    }

    /// Bytes held by pages.
    #[must_use]
    pub fn used(&self) -> usize {
        self.shared.used()
    }

    /// Bytes held by pages of `generation`.
    #[must_use]
    pub fn used_generation(&self, generation: GenerationId) -> usize {
        self.shared.used_generation[generation.index()].load(Ordering::Relaxed)
    }

    /// Bytes of non-relocation pages allocated since startup.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Moves `size` bytes from the young to the old generation for pages
    /// promoted in place.
    pub fn promote_used(&self, size: usize) {
        self.shared.decrease_used_generation(GenerationId::Young, size);
        self.shared.increase_used_generation(GenerationId::Old, size);
        self.shared.state.lock().stats[GenerationId::Old.index()].promoted += size;
    }

    // ---- statistics -----------------------------------------------------

    /// Snapshot of the capacity counters and of `generation`'s collection
    /// statistics.
    #[must_use]
    pub fn stats(&self, generation: GenerationId) -> PageAllocatorStats {
        let collection = self.shared.state.lock().stats[generation.index()];
        PageAllocatorStats {
            generation,
            min_capacity: self.min_capacity(),
            max_capacity: self.max_capacity(),
            soft_max_capacity: self.soft_max_capacity(),
            current_max_capacity: self.current_max_capacity(),
            capacity: self.capacity(),
            used: self.used(),
            used_high: collection.used_high,
            used_low: collection.used_low,
            used_generation: self.used_generation(generation),
            freed: collection.freed,
            promoted: collection.promoted,
            allocation_stalls: collection.allocation_stalls,
        }
    }

    /// Starts a new statistics period for `generation`.
    pub fn reset_statistics(&self, generation: GenerationId) {
        let used = self.used();
        self.shared.state.lock().stats[generation.index()].reset(used);
    }

    /// Checks, under the allocator lock, that every partition satisfies
    /// `used + claimed <= capacity <= current_max <= max` and that its cache
    /// holds exactly the rest of its capacity.
    #[must_use]
    pub fn check_capacity_invariants(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.partitions.iter().all(|partition| {
            let cached = state.partitions[partition.numa_id()].cache.size();
            partition.check_invariants()
                && partition.used() + partition.claimed() + cached == partition.capacity()
        })
    }

    /// Bytes currently cached in partition `numa_id`.
    #[must_use]
    pub fn cached_bytes(&self, numa_id: usize) -> usize {
        self.shared.state.lock().partitions[numa_id].cache.size()
    }

    // ---- safe destruction -----------------------------------------------

    /// Defers dropping freed pages until the matching
    /// [`disable_safe_destroy`](Self::disable_safe_destroy).
    pub fn enable_safe_destroy(&self) {
        self.shared.safe_delete.enable_deferred_delete();
    }

    /// Ends a deferral window.
    ///
    /// # Panics
    ///
    /// Panics without a matching [`enable_safe_destroy`](Self::enable_safe_destroy).
    pub fn disable_safe_destroy(&self) {
        self.shared.safe_delete.disable_deferred_delete();
    }

    // ---- accessors ------------------------------------------------------

    /// Pointer color state.
    #[must_use]
    pub fn colors(&self) -> &PointerColors {
        &self.shared.colors
    }

    /// Page sizes of this heap.
    #[must_use]
    pub fn sizes(&self) -> PageSizes {
        self.shared.sizes
    }

    /// An empty relocation set selector for this heap's page sizes and
    /// fragmentation limit.
    #[must_use]
    pub fn relocation_set_selector<'a>(&self) -> RelocationSetSelector<'a> {
        let percent = self.shared.config.fragmentation_limit_percent;
        RelocationSetSelector::new(self.shared.sizes, percent)
    }

    /// Normalized configuration in use.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.shared.config
    }

    /// Bytes of reserved address space.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.shared.vmm.reserved()
    }

    /// Returns `true` if the address space is one reservation.
    #[must_use]
    pub fn is_reservation_contiguous(&self) -> bool {
        self.shared.vmm.is_contiguous()
    }

    /// Number of NUMA partitions.
    #[must_use]
    pub fn numa_count(&self) -> usize {
        self.shared.numa.count()
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.uncommit_wakeup.notify_all();
        self.shared.unmapper.stop();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Shared {
    fn used(&self) -> usize {
        self.partitions.iter().map(|p| p.used()).sum()
    }

    fn update_used_stats(&self, state: &mut AllocatorState) {
        let used = self.used();
        for stats in &mut state.stats {
            stats.update_used(used);
        }
    }

    fn increase_used_generation(&self, generation: GenerationId, size: usize) {
        self.used_generation[generation.index()].fetch_add(size, Ordering::Relaxed);
    }

    fn decrease_used_generation(&self, generation: GenerationId, size: usize) {
        let old = self.used_generation[generation.index()].fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "Generation used underflow");
    }

    fn count_allocated(&self, size: usize) {
        self.allocated.fetch_add(size, Ordering::Relaxed);
    }

    fn notify_out_of_memory(&self, state: &mut AllocatorState) {
        let old_seqnum = self.collaborators.driver.old_seqnum();
        while state
            .stalled
            .front()
            .is_some_and(|stalled| stalled.old_seqnum != old_seqnum)
        {
            if let Some(stalled) = state.stalled.pop_front() {
                stalled.fail(AllocError::OutOfMemory);
            }
        }
    }

    fn restart_gc(&self, stalling: bool) {
        if stalling {
            self.collaborators.driver.collect(GcRequest::allocation_stall());
        }
    }

    /// Commits, maps and caches each partition's share of the initial
    /// capacity.
    fn prime_cache(&self) -> Result<(), HeapError> {
        let granule = self.config.granule_size;
        let requested = self.config.initial_capacity;
        let mut committed = 0;

        for numa_id in 0..self.numa.count() {
            let size = self.numa.calculate_share(numa_id, requested, granule);
            if size == 0 {
                continue;
            }

            let increased = {
                let mut state = self.state.lock();
                self.partitions[numa_id].increase_capacity(&mut state.partitions[numa_id], size)
            };
            debug_assert_eq!(increased, size);

            let mut ranges = Vec::new();
            self.vmm.alloc_low_many(size, numa_id, &mut ranges);
            for vmem in ranges {
                self.pmm.alloc(vmem, numa_id);
                let done = self.pmm.commit(vmem);
                committed += done;
                if done < vmem.size() {
                    return Err(HeapError::InitialCommitFailed {
                        committed,
                        requested,
                    });
                }
                self.pmm.map(vmem);
                self.state.lock().partitions[numa_id].cache.insert(vmem);
            }
        }

        Ok(())
    }
}

/// Reserves `max_capacity * virtual_to_physical_ratio` bytes of address
/// space, lowering the heap base while less than `max_capacity` fits.
fn reserve_address_space(
    backend: &dyn MemoryBackend,
    collaborators: &Collaborators,
    colors: &PointerColors,
    config: &HeapConfig,
) -> Result<Vec<VirtualRange>, HeapError> {
    let required = config.max_capacity;
    let desired = required.saturating_mul(config.virtual_to_physical_ratio);

    loop {
        let mut reserver = VirtualMemoryReserver::new(
            backend,
            collaborators.tracker.as_ref(),
            colors,
            config.granule_size,
        );
        let summary = reserver.reserve(desired)?;

        if summary.reserved >= required {
            crate::tracing::internal::log_reservation(
                summary.reserved,
                summary.requested,
                summary.ranges,
                colors.heap_base(),
            );
            if summary.is_degraded() || !summary.is_contiguous() {
                crate::tracing::internal::log_reservation_degraded(
                    summary.reserved,
                    summary.requested,
                    summary.ranges,
                );
            }
            return Ok(reserver.into_ranges());
        }

        reserver.unreserve_all();
        if !colors.try_lowering_heap_base(required) {
            colors.reset_heap_base();
            return Err(HeapError::ReservationFailed {
                reserved: summary.reserved,
                required,
            });
        }
        crate::tracing::internal::log_heap_base_lowered(
            colors.heap_base_shift(),
            summary.reserved,
            required,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::collaborators::RecordingDriver;
    use crate::globals::M;
    use std::time::Duration;

    const G: usize = 2 * M;

    fn allocator(min: usize, initial: usize, max: usize) -> (Arc<SimulatedBackend>, PageAllocator) {
        let backend = Arc::new(SimulatedBackend::new(max, G));
        let config = HeapConfig::default()
            .with_capacities(min, initial, max)
            .with_heap_base_shift(36)
            .with_uncommit(false);
        let allocator =
            PageAllocator::with_backend(&config, backend.clone(), Collaborators::default()).unwrap();
        (backend, allocator)
    }

    fn small(allocator: &PageAllocator) -> Result<Box<Page>, AllocError> {
        allocator.alloc_page(PageType::Small, G, PageAge::EDEN, AllocationFlags::new())
    }

    #[test]
    fn test_selector_uses_configured_fragmentation_limit() {
        let select = |percent: f64| {
            let backend = Arc::new(SimulatedBackend::new(16 * M, G));
            let config = HeapConfig::default()
                .with_capacities(8 * M, 8 * M, 16 * M)
                .with_heap_base_shift(36)
                .with_uncommit(false)
                .with_fragmentation_limit_percent(percent);
            let allocator =
                PageAllocator::with_backend(&config, backend, Collaborators::default()).unwrap();

            // Both pages are 7/8 garbage
            let pages: Vec<_> = (0..2).map(|_| small(&allocator).unwrap()).collect();
            for page in &pages {
                page.inc_live(4, G / 8);
            }

            let selected = {
                let mut selector = allocator.relocation_set_selector();
                for page in &pages {
                    selector.register_live_page(page);
                }
                selector.select();
                selector.relocation_set().len()
            };
            allocator.free_pages(pages);
            selected
        };

        assert_eq!(select(25.0), 2);
        assert_eq!(select(90.0), 0);
    }

    #[test]
    fn test_priming_fills_cache() {
        let (backend, allocator) = allocator(8 * M, 8 * M, 32 * M);
        assert_eq!(allocator.capacity(), 8 * M);
        assert_eq!(allocator.cached_bytes(0), 8 * M);
        assert_eq!(backend.committed(), 8 * M);
        assert_eq!(backend.mapped(), 8 * M);
        assert!(allocator.check_capacity_invariants());
    }

    #[test]
    fn test_cached_page_is_reused() {
        let (backend, allocator) = allocator(8 * M, 8 * M, 32 * M);
        let page = small(&allocator).unwrap();
        let start = page.start();
        assert_eq!(start, 0);
        allocator.free_page(page);

        let page = small(&allocator).unwrap();
        assert_eq!(page.start(), start);
        assert_eq!(backend.commit_calls(), 1);
        allocator.free_page(page);
    }

    #[test]
    fn test_large_page_from_fragments() {
        let (_, allocator) = allocator(8 * M, 8 * M, 8 * M);
        let pages: Vec<_> = (0..4).map(|_| small(&allocator).unwrap()).collect();
        let mut pages = pages.into_iter();
        let a = pages.next().unwrap();
        let b = pages.next().unwrap();
        let c = pages.next().unwrap();
        let d = pages.next().unwrap();
        allocator.free_pages(vec![a, c]);

        // Two separate 2M fragments are harvested into one 4M page
        let large = allocator
            .alloc_page(PageType::Large, 4 * M, PageAge::OLD, AllocationFlags::new())
            .unwrap();
        assert_eq!(large.size(), 4 * M);
        assert_eq!(allocator.used(), 8 * M);
        assert_eq!(allocator.capacity(), 8 * M);
        assert_eq!(allocator.used_generation(GenerationId::Old), 4 * M);
        assert!(allocator.check_capacity_invariants());

        allocator.free_pages(vec![b, d, large]);
        assert_eq!(allocator.used(), 0);
        assert!(allocator.check_capacity_invariants());
    }

    #[test]
    fn test_non_blocking_would_stall() {
        let (_, allocator) = allocator(4 * M, 4 * M, 4 * M);
        let a = small(&allocator).unwrap();
        let b = small(&allocator).unwrap();
        let result = allocator.alloc_page(
            PageType::Small,
            G,
            PageAge::EDEN,
            AllocationFlags::new().non_blocking(),
        );
        assert_eq!(result.unwrap_err(), AllocError::WouldStall);
        assert!(!allocator.is_alloc_stalling());
        allocator.free_pages(vec![a, b]);
    }

    #[test]
    fn test_commit_failure_lowers_max_and_retries() {
        let (backend, allocator) = allocator(4 * M, 4 * M, 16 * M);
        backend.set_commit_limit(Some(6 * M));

        let pages: Vec<_> = (0..2).map(|_| small(&allocator).unwrap()).collect();
        // Needs 4M of new capacity but only 2M can be committed
        let result = allocator.alloc_page(
            PageType::Large,
            4 * M,
            PageAge::EDEN,
            AllocationFlags::new().non_blocking(),
        );
        assert_eq!(result.unwrap_err(), AllocError::WouldStall);
        assert_eq!(allocator.current_max_capacity(), 6 * M);
        assert_eq!(allocator.capacity(), 6 * M);
        assert_eq!(allocator.cached_bytes(0), 2 * M);
        assert!(allocator.check_capacity_invariants());

        allocator.free_pages(pages);
    }

    #[test]
    fn test_out_of_memory_after_old_collection() {
        let driver = Arc::new(RecordingDriver::new());
        let backend = Arc::new(SimulatedBackend::new(4 * M, G));
        let config = HeapConfig::default()
            .with_capacities(4 * M, 4 * M, 4 * M)
            .with_heap_base_shift(36);
        let allocator = Arc::new(
            PageAllocator::with_backend(
                &config,
                backend,
                Collaborators::default().with_driver(driver.clone()),
            )
            .unwrap(),
        );
        let held: Vec<_> = (0..2).map(|_| small(&allocator).unwrap()).collect();

        let waiter = {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || small(&allocator).map(|page| allocator.free_page(page)))
        };
        while driver.requests().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(allocator.is_alloc_stalling());

        // Nothing to fail until an old collection has started since the stall
        allocator.notify_out_of_memory();
        assert!(allocator.is_alloc_stalling());

        driver.start_old_collection();
        allocator.handle_alloc_stalling_for_old(true);
        assert_eq!(waiter.join().unwrap(), Err(AllocError::OutOfMemory));
        assert!(!allocator.is_alloc_stalling());

        allocator.free_pages(held);
    }

    #[test]
    fn test_stats_follow_usage() {
        let (_, allocator) = allocator(8 * M, 8 * M, 32 * M);
        allocator.reset_statistics(GenerationId::Young);

        let mut page = small(&allocator).unwrap();
        page.promote();
        allocator.promote_used(G);
        let stats = allocator.stats(GenerationId::Old);
        assert_eq!(stats.used_generation, G);
        assert_eq!(stats.promoted, G);
        assert_eq!(allocator.used_generation(GenerationId::Young), 0);

        allocator.free_page(page);
        let young = allocator.stats(GenerationId::Young);
        assert_eq!(young.used_high, G);
        assert_eq!(young.used_low, 0);
        assert_eq!(young.max_capacity, 32 * M);
    }

    #[test]
    fn test_safe_destroy_defers_page_drop() {
        let (_, allocator) = allocator(8 * M, 8 * M, 32 * M);
        allocator.enable_safe_destroy();
        let page = small(&allocator).unwrap();
        allocator.free_page(page);
        assert_eq!(allocator.shared.safe_delete.deferred_count(), 1);
        allocator.disable_safe_destroy();
        assert_eq!(allocator.shared.safe_delete.deferred_count(), 0);
    }
}
