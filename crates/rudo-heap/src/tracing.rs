//! Heap tracing support.
//!
//! When the `tracing` feature is enabled, this module emits structured
//! events for reservations, stalls, capacity changes and background work.
//! Without the feature every helper compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    use crate::globals::PageType;

    /// Create a span covering heap initialization.
    pub fn trace_initialize(max_capacity: usize, numa_nodes: usize) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "heap_initialize",
            max_capacity = max_capacity,
            numa_nodes = numa_nodes
        )
        .entered()
    }

    /// Log the outcome of the address space reservation.
    pub fn log_reservation(reserved: usize, requested: usize, ranges: usize, heap_base: usize) {
        tracing::info!(reserved, requested, ranges, heap_base, "address_space_reserved");
    }

    /// Log a reservation that is smaller than requested or split up.
    pub fn log_reservation_degraded(reserved: usize, requested: usize, ranges: usize) {
        tracing::warn!(reserved, requested, ranges, "address_space_degraded");
    }

    /// Log a failed reservation attempt before lowering the heap base.
    pub fn log_heap_base_lowered(heap_base_shift: u32, reserved: usize, required: usize) {
        tracing::debug!(heap_base_shift, reserved, required, "heap_base_lowered");
    }

    /// Log a capacity increase.
    pub fn log_capacity_increase(numa_id: usize, increased: usize, capacity: usize) {
        tracing::trace!(numa_id, increased, capacity, "capacity_increase");
    }

    /// Log a permanent lowering of the max capacity after a commit failure.
    pub fn log_capacity_lowered(numa_id: usize, failed: usize, current_max_capacity: usize) {
        tracing::warn!(numa_id, failed, current_max_capacity, "max_capacity_lowered");
    }

    /// Log a request that starts stalling.
    pub fn log_stall_start(page_type: PageType, size: usize, numa_id: usize) {
        tracing::debug!(page_type = ?page_type, size, numa_id, "allocation_stall_start");
    }

    /// Log a stalled request that was resolved.
    pub fn log_stall_end(page_type: PageType, size: usize, satisfied: bool) {
        tracing::debug!(page_type = ?page_type, size, satisfied, "allocation_stall_end");
    }

    /// Log a stalled request failed with out of memory.
    pub fn log_stall_out_of_memory(size: usize, old_seqnum: u32) {
        tracing::info!(size, old_seqnum, "allocation_stall_out_of_memory");
    }

    /// Log a page allocation.
    pub fn log_page_alloc(page_type: PageType, size: usize, address: usize) {
        tracing::trace!(page_type = ?page_type, size, address, "page_alloc");
    }

    /// Log a page free.
    pub fn log_page_free(page_type: PageType, size: usize, address: usize, defragmented: bool) {
        tracing::trace!(page_type = ?page_type, size, address, defragmented, "page_free");
    }

    /// Log that the unmapper queue is full. Callers emit this once.
    pub fn log_unmapper_saturated(queued: usize, limit: usize) {
        tracing::warn!(queued, limit, "unmapper_saturated");
    }

    /// Log one uncommitted chunk.
    pub fn log_uncommit_chunk(numa_id: usize, uncommitted: usize, remaining: usize) {
        tracing::debug!(numa_id, uncommitted, remaining, "uncommit_chunk");
    }

    /// Log the end of an uncommit cycle.
    pub fn log_uncommit_cycle_end(numa_id: usize, uncommitted: usize, cancelled: bool) {
        tracing::debug!(numa_id, uncommitted, cancelled, "uncommit_cycle_end");
    }

    /// Log bytes the backend refused to uncommit.
    pub fn log_uncommit_failed(numa_id: usize, kept: usize) {
        tracing::warn!(numa_id, kept, "uncommit_failed");
    }

    /// Log a memory tracking notification.
    pub fn log_memory_operation(operation: &'static str, start: usize, size: usize) {
        tracing::trace!(operation, start, size, "memory_operation");
    }

    /// Log the relocation set chosen for one page group.
    pub fn log_relocation_set_selected(
        page_type: PageType,
        candidates: usize,
        selected: usize,
        forwarding_entries: usize,
    ) {
        tracing::debug!(
            page_type = ?page_type,
            candidates,
            selected,
            forwarding_entries,
            "relocation_set_selected"
        );
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn, unused_variables)]
pub mod internal {
    use crate::globals::PageType;

    /// Stub span guard when tracing is disabled.
    #[derive(Debug)]
    pub struct EnteredSpan;

    /// Stub function when tracing is disabled.
    pub fn trace_initialize(max_capacity: usize, numa_nodes: usize) -> EnteredSpan {
        EnteredSpan
    }

    /// Stub function when tracing is disabled.
    pub fn log_reservation(reserved: usize, requested: usize, ranges: usize, heap_base: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_reservation_degraded(reserved: usize, requested: usize, ranges: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_heap_base_lowered(heap_base_shift: u32, reserved: usize, required: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_capacity_increase(numa_id: usize, increased: usize, capacity: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_capacity_lowered(numa_id: usize, failed: usize, current_max_capacity: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_stall_start(page_type: PageType, size: usize, numa_id: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_stall_end(page_type: PageType, size: usize, satisfied: bool) {}

    /// Stub function when tracing is disabled.
    pub fn log_stall_out_of_memory(size: usize, old_seqnum: u32) {}

    /// Stub function when tracing is disabled.
    pub fn log_page_alloc(page_type: PageType, size: usize, address: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_page_free(page_type: PageType, size: usize, address: usize, defragmented: bool) {}

    /// Stub function when tracing is disabled.
    pub fn log_unmapper_saturated(queued: usize, limit: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_uncommit_chunk(numa_id: usize, uncommitted: usize, remaining: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_uncommit_cycle_end(numa_id: usize, uncommitted: usize, cancelled: bool) {}

    /// Stub function when tracing is disabled.
    pub fn log_uncommit_failed(numa_id: usize, kept: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_memory_operation(operation: &'static str, start: usize, size: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_relocation_set_selected(
        page_type: PageType,
        candidates: usize,
        selected: usize,
        forwarding_entries: usize,
    ) {
    }
}
