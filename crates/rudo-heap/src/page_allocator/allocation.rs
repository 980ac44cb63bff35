//! Claiming capacity, stalling, and assembling page memory.

use crossbeam::channel::{self, Sender};

use super::{AllocatorState, Shared};
use crate::collaborators::{GcRequest, SuspendibleThreadSetLeaver};
use crate::error::AllocError;
use crate::globals::{align_down, PageType};
use crate::page::{GenerationId, Page, PageAge};
use crate::range::VirtualRange;

// ============================================================================
// AllocationFlags
// ============================================================================

/// Options of a page allocation request.
///
/// ```
/// use rudo_heap::AllocationFlags;
///
/// let flags = AllocationFlags::new().non_blocking().gc_relocation();
/// assert!(flags.is_non_blocking());
/// assert!(!flags.is_fast_medium());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocationFlags {
    non_blocking: bool,
    gc_relocation: bool,
    fast_medium: bool,
}

impl AllocationFlags {
    /// Blocking mutator allocation.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            non_blocking: false,
            gc_relocation: false,
            fast_medium: false,
        }
    }

    /// Fail with [`AllocError::WouldStall`] instead of stalling.
    #[must_use]
    pub const fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    /// The page is a relocation target and does not count as allocation.
    #[must_use]
    pub const fn gc_relocation(mut self) -> Self {
        self.gc_relocation = true;
        self
    }

    /// Try cached memory in every partition before committing anything.
    /// Only affects medium pages.
    #[must_use]
    pub const fn fast_medium(mut self) -> Self {
        self.fast_medium = true;
        self
    }

    /// See [`non_blocking`](Self::non_blocking).
    #[must_use]
    pub const fn is_non_blocking(&self) -> bool {
        self.non_blocking
    }

    /// See [`gc_relocation`](Self::gc_relocation).
    #[must_use]
    pub const fn is_gc_relocation(&self) -> bool {
        self.gc_relocation
    }

    /// See [`fast_medium`](Self::fast_medium).
    #[must_use]
    pub const fn is_fast_medium(&self) -> bool {
        self.fast_medium
    }
}

// ============================================================================
// Claims and stalled requests
// ============================================================================

/// Capacity taken from one partition for one page.
///
/// `mappings` are mapped ranges taken from the cache; `increased` bytes of
/// new capacity still need backing. Together they cover `size`.
#[derive(Debug)]
pub(crate) struct Claim {
    pub(crate) numa_id: usize,
    pub(crate) size: usize,
    pub(crate) mappings: Vec<VirtualRange>,
    pub(crate) increased: usize,
}

impl Claim {
    fn harvested(&self) -> usize {
        self.size - self.increased
    }
}

#[derive(Debug)]
pub(crate) struct StalledAllocation {
    page_type: PageType,
    size: usize,
    flags: AllocationFlags,
    numa_id: usize,
    pub(crate) young_seqnum: u32,
    pub(crate) old_seqnum: u32,
    result: Sender<Result<Claim, AllocError>>,
}

impl StalledAllocation {
    pub(crate) fn fail(self, error: AllocError) {
        crate::tracing::internal::log_stall_out_of_memory(self.size, self.old_seqnum);
        // The waiting thread is blocked in recv and holds the receiver
        let _ = self.result.send(Err(error));
    }
}

// ============================================================================
// Allocation protocol
// ============================================================================

impl Shared {
    /// Claims `size` bytes, starting at `preferred` and going round-robin.
    fn claim(
        &self,
        state: &mut AllocatorState,
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
        preferred: usize,
    ) -> Option<Claim> {
        if flags.is_fast_medium() && page_type == PageType::Medium {
            for numa_id in self.numa.round_robin(preferred) {
                if let Some(claim) = self.claim_in(state, numa_id, size, true) {
                    return Some(claim);
                }
            }
        }

        self.numa
            .round_robin(preferred)
            .find_map(|numa_id| self.claim_in(state, numa_id, size, false))
    }

    fn claim_in(
        &self,
        state: &mut AllocatorState,
        numa_id: usize,
        size: usize,
        cache_only: bool,
    ) -> Option<Claim> {
        let mut mappings = Vec::new();
        let increased = self.partitions[numa_id].claim_capacity(
            &mut state.partitions[numa_id],
            size,
            cache_only,
            &mut mappings,
        )?;

        self.update_used_stats(state);
        if increased > 0 {
            // A running uncommit cycle was cancelled
            self.uncommit_wakeup.notify_all();
        }

        Some(Claim {
            numa_id,
            size,
            mappings,
            increased,
        })
    }

    /// Gives a claim back that nobody is going to use.
    fn undo_claim(&self, state: &mut AllocatorState, claim: Claim) {
        let partition = &self.partitions[claim.numa_id];
        for vmem in claim.mappings {
            state.partitions[claim.numa_id].cache.insert(vmem);
        }
        partition.decrease_used(claim.size);
        partition.decrease_capacity(claim.increased, false);
        self.update_used_stats(state);
    }

    /// Claims capacity for a request, stalling until memory is freed if
    /// nothing is available.
    pub(crate) fn claim_or_stall(
        &self,
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
    ) -> Result<Claim, AllocError> {
        let preferred = self.numa.current_id();

        let receiver = {
            let mut state = self.state.lock();
            if let Some(claim) = self.claim(&mut state, page_type, size, flags, preferred) {
                return Ok(claim);
            }

            if flags.is_non_blocking() {
                return Err(AllocError::WouldStall);
            }

            let (sender, receiver) = channel::bounded(1);
            let driver = &self.collaborators.driver;
            state.stalled.push_back(StalledAllocation {
                page_type,
                size,
                flags,
                numa_id: preferred,
                young_seqnum: driver.young_seqnum(),
                old_seqnum: driver.old_seqnum(),
                result: sender,
            });
            for stats in &mut state.stats {
                stats.allocation_stalls += 1;
            }
            receiver
        };

        crate::tracing::internal::log_stall_start(page_type, size, preferred);
        self.collaborators.driver.collect(GcRequest::allocation_stall());

        let result = {
            let _leaver = SuspendibleThreadSetLeaver::new(self.collaborators.suspendible_threads.as_ref());
            receiver.recv().unwrap_or(Err(AllocError::OutOfMemory))
        };

        crate::tracing::internal::log_stall_end(page_type, size, result.is_ok());
        result
    }

    /// Hands capacity to stalled requests in FIFO order, stopping at the
    /// first request that cannot be claimed.
    pub(crate) fn satisfy_stalled(&self, state: &mut AllocatorState) {
        while let Some(front) = state.stalled.front() {
            let (page_type, size, flags, numa_id) =
                (front.page_type, front.size, front.flags, front.numa_id);

            let Some(claim) = self.claim(state, page_type, size, flags, numa_id) else {
                return;
            };

            let Some(stalled) = state.stalled.pop_front() else {
                return;
            };
            if let Err(err) = stalled.result.send(Ok(claim)) {
                if let Ok(claim) = err.into_inner() {
                    self.undo_claim(state, claim);
                }
            }
        }
    }

    /// Turns a claim into one contiguous, committed and mapped range.
    ///
    /// Returns `Ok(None)` if committing failed; the claim has then been
    /// rolled back and the capacity ceiling lowered, and the caller retries.
    pub(crate) fn prepare_memory(
        &self,
        claim: Claim,
        page_type: PageType,
    ) -> Result<Option<VirtualRange>, AllocError> {
        if claim.increased == 0 && claim.mappings.len() == 1 && claim.mappings[0].size() == claim.size {
            return Ok(Some(claim.mappings[0]));
        }

        let numa_id = claim.numa_id;
        let harvested = claim.harvested();

        let vmem = match self.vmm.alloc(claim.size, numa_id, page_type.prefers_low_address()) {
            Some(vmem) => {
                self.harvest(vmem, &claim.mappings);
                vmem
            }
            None => self.remap_to_low_address(&claim)?,
        };

        if harvested > 0 {
            self.pmm.map(vmem.first_part(harvested));
        }

        if claim.increased > 0 {
            let tail = vmem.last_part(harvested);
            self.pmm.alloc(tail, numa_id);

            let committed = align_down(self.pmm.commit(tail), self.config.granule_size);
            if committed < tail.size() {
                self.commit_failed(&claim, vmem, committed);
                return Ok(None);
            }

            self.pmm.map(tail);
        }

        Ok(Some(vmem))
    }

    /// Moves the backing of the claimed fragments into `vmem` and sends the
    /// fragments to the unmapper.
    fn harvest(&self, vmem: VirtualRange, mappings: &[VirtualRange]) {
        let mut to = vmem.start();
        for &fragment in mappings {
            self.pmm.copy_physical_segments(to, fragment);
            self.unmapper.unmap(fragment);
            to += fragment.size();
        }
    }

    /// Frees the claimed fragments and tries to find `size` contiguous bytes
    /// at the low end of the partition instead.
    fn remap_to_low_address(&self, claim: &Claim) -> Result<VirtualRange, AllocError> {
        let stash = self.pmm.stash(&claim.mappings);
        for &fragment in &claim.mappings {
            self.pmm.unmap(fragment);
        }

        match self
            .vmm
            .shuffle_vmem_to_low_addresses_contiguous(claim.size, claim.numa_id, &claim.mappings)
        {
            Ok(vmem) => {
                self.pmm.restore(&[vmem.first_part(claim.harvested())], &stash);
                Ok(vmem)
            }
            Err(ranges) => {
                self.pmm.restore(&ranges, &stash);
                for &vmem in &ranges {
                    self.pmm.map(vmem);
                }

                let mut state = self.state.lock();
                self.undo_claim(
                    &mut state,
                    Claim {
                        numa_id: claim.numa_id,
                        size: claim.size,
                        mappings: ranges,
                        increased: claim.increased,
                    },
                );
                self.satisfy_stalled(&mut state);
                Err(AllocError::AddressSpaceExhausted)
            }
        }
    }

    /// Keeps what could be committed in the cache and permanently gives up
    /// the rest of the capacity increase.
    fn commit_failed(&self, claim: &Claim, vmem: VirtualRange, committed: usize) {
        let numa_id = claim.numa_id;
        let harvested = claim.harvested();
        let tail = vmem.last_part(harvested);

        if committed > 0 {
            self.pmm.map(tail.first_part(committed));
        }

        let failed = tail.last_part(committed);
        self.pmm.free(failed, numa_id);
        self.vmm.free(failed);

        let usable = vmem.first_part(harvested + committed);
        let partition = &self.partitions[numa_id];

        let mut state = self.state.lock();
        if usable.size() > 0 {
            state.partitions[numa_id].cache.insert(usable);
        }
        partition.decrease_used(claim.size);
        partition.decrease_capacity(failed.size(), true);
        self.update_used_stats(&mut state);
        self.satisfy_stalled(&mut state);
    }

    /// Wraps prepared memory in a page.
    pub(crate) fn create_page(
        &self,
        page_type: PageType,
        vmem: VirtualRange,
        age: PageAge,
        numa_id: usize,
        flags: AllocationFlags,
    ) -> Box<Page> {
        let generation = age.generation();
        self.increase_used_generation(generation, vmem.size());
        if !flags.is_gc_relocation() {
            self.count_allocated(vmem.size());
        }

        let seqnum = match generation {
            GenerationId::Young => self.collaborators.driver.young_seqnum(),
            GenerationId::Old => self.collaborators.driver.old_seqnum(),
        };

        let address = self.vmm.address(vmem.start());
        crate::tracing::internal::log_page_alloc(page_type, vmem.size(), address);
        Box::new(Page::new(page_type, vmem, address, age, seqnum, numa_id))
    }

    /// Returns `true` if `page` should be moved to a lower address when
    /// freed.
    pub(crate) fn should_defragment(&self, page: &Page) -> bool {
        if page.page_type() == PageType::Large {
            return true;
        }

        page.start() >= self.vmm.reserved() / 2
            && page.start() > self.vmm.lowest_available_address(page.numa_id())
    }

    /// Remaps `vmem` to the lowest free addresses of its partition.
    pub(crate) fn defragment(&self, vmem: VirtualRange) -> Vec<VirtualRange> {
        let stash = self.pmm.stash(&[vmem]);
        self.pmm.unmap(vmem);

        let ranges = self.vmm.shuffle_vmem_to_low_addresses(vmem);
        self.pmm.restore(&ranges, &stash);
        for &range in &ranges {
            self.pmm.map(range);
        }
        ranges
    }
}
