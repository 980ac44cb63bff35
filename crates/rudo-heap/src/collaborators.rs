//! Interfaces of the subsystems around the page allocator.
//!
//! The allocator asks a [`CollectionDriver`] for collections when requests
//! stall, reports every reserve/commit/map operation to a [`MemoryTracker`],
//! and leaves the [`SuspendibleThreadSet`] while a thread is blocked so that
//! safepoints are not held up by stalled allocations.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::GenerationId;

// ============================================================================
// Collection driver
// ============================================================================

/// Why a collection is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum GcCause {
    /// An allocation request is stalled waiting for memory.
    AllocationStall,
}

/// A request for an asynchronous collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRequest {
    /// Why the collection is needed.
    pub cause: GcCause,
    /// Which generation to collect.
    pub generation: GenerationId,
}

impl GcRequest {
    /// A young collection on behalf of stalled allocations.
    #[must_use]
    pub const fn allocation_stall() -> Self {
        Self {
            cause: GcCause::AllocationStall,
            generation: GenerationId::Young,
        }
    }
}

/// The collector's cycle driver.
///
/// The sequence numbers are read while the allocator lock is held and must
/// not call back into the allocator.
pub trait CollectionDriver: Send + Sync + fmt::Debug {
    /// Starts a collection asynchronously. Must not block on the allocator.
    fn collect(&self, request: GcRequest);

    /// Sequence number of the current or last young collection.
    fn young_seqnum(&self) -> u32;

    /// Sequence number of the current or last old collection.
    fn old_seqnum(&self) -> u32;
}

/// Driver for heaps without a collector. Requests are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDriver;

impl CollectionDriver for NoopDriver {
    fn collect(&self, _request: GcRequest) {}

    fn young_seqnum(&self) -> u32 {
        0
    }

    fn old_seqnum(&self) -> u32 {
        0
    }
}

/// Driver that records requests and lets the embedder advance sequence
/// numbers by hand.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    young_seqnum: AtomicU32,
    old_seqnum: AtomicU32,
    requests: Mutex<Vec<GcRequest>>,
}

impl RecordingDriver {
    /// Creates a driver with both sequence numbers at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a new young collection.
    pub fn start_young_collection(&self) -> u32 {
        self.young_seqnum.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Marks the start of a new old collection.
    pub fn start_old_collection(&self) -> u32 {
        self.old_seqnum.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<GcRequest> {
        self.requests.lock().clone()
    }
}

impl CollectionDriver for RecordingDriver {
    fn collect(&self, request: GcRequest) {
        self.requests.lock().push(request);
    }

    fn young_seqnum(&self) -> u32 {
        self.young_seqnum.load(Ordering::SeqCst)
    }

    fn old_seqnum(&self) -> u32 {
        self.old_seqnum.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Memory tracking
// ============================================================================

/// Observer of memory operations.
///
/// Notifications are fire-and-forget and cannot fail the operation they
/// describe. Addresses are virtual; commit offsets are backing offsets.
pub trait MemoryTracker: Send + Sync + fmt::Debug {
    /// Address space was reserved.
    fn reserve(&self, _addr: usize, _size: usize) {}
    /// Address space was released.
    fn unreserve(&self, _addr: usize, _size: usize) {}
    /// Backing storage was committed.
    fn commit(&self, _offset: usize, _size: usize) {}
    /// Backing storage was uncommitted.
    fn uncommit(&self, _offset: usize, _size: usize) {}
    /// Backing storage was mapped at an address.
    fn map(&self, _addr: usize, _size: usize, _offset: usize) {}
    /// An address range was unmapped.
    fn unmap(&self, _addr: usize, _size: usize) {}
}

/// Tracker that ignores all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl MemoryTracker for NoopTracker {}

/// Tracker that forwards notifications as trace events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracker;

impl MemoryTracker for TracingTracker {
    fn reserve(&self, addr: usize, size: usize) {
        crate::tracing::internal::log_memory_operation("reserve", addr, size);
    }

    fn unreserve(&self, addr: usize, size: usize) {
        crate::tracing::internal::log_memory_operation("unreserve", addr, size);
    }

    fn commit(&self, offset: usize, size: usize) {
        crate::tracing::internal::log_memory_operation("commit", offset, size);
    }

    fn uncommit(&self, offset: usize, size: usize) {
        crate::tracing::internal::log_memory_operation("uncommit", offset, size);
    }

    fn map(&self, addr: usize, size: usize, _offset: usize) {
        crate::tracing::internal::log_memory_operation("map", addr, size);
    }

    fn unmap(&self, addr: usize, size: usize) {
        crate::tracing::internal::log_memory_operation("unmap", addr, size);
    }
}

// ============================================================================
// Suspendible thread set
// ============================================================================

/// Threads that take part in the collector's safepoint protocol.
pub trait SuspendibleThreadSet: Send + Sync + fmt::Debug {
    /// Returns `true` if the calling thread is currently joined.
    fn is_joined(&self) -> bool;
    /// Joins the calling thread.
    fn join(&self);
    /// Removes the calling thread.
    fn leave(&self);
}

/// Set that no thread is ever part of.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSuspendibleThreads;

impl SuspendibleThreadSet for NoSuspendibleThreads {
    fn is_joined(&self) -> bool {
        false
    }

    fn join(&self) {}

    fn leave(&self) {}
}

/// Leaves the suspendible thread set for the guard's lifetime if the
/// calling thread was joined.
#[must_use = "the thread rejoins when the guard is dropped"]
pub struct SuspendibleThreadSetLeaver<'a> {
    set: &'a dyn SuspendibleThreadSet,
    was_joined: bool,
}

impl<'a> SuspendibleThreadSetLeaver<'a> {
    /// Leaves `set` if joined.
    pub fn new(set: &'a dyn SuspendibleThreadSet) -> Self {
        let was_joined = set.is_joined();
        if was_joined {
            set.leave();
        }
        Self { set, was_joined }
    }
}

impl Drop for SuspendibleThreadSetLeaver<'_> {
    fn drop(&mut self) {
        if self.was_joined {
            self.set.join();
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Everything the page allocator needs from the rest of the collector.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Cycle driver.
    pub driver: Arc<dyn CollectionDriver>,
    /// Memory operation observer.
    pub tracker: Arc<dyn MemoryTracker>,
    /// Safepoint participation.
    pub suspendible_threads: Arc<dyn SuspendibleThreadSet>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            driver: Arc::new(NoopDriver),
            tracker: Arc::new(TracingTracker),
            suspendible_threads: Arc::new(NoSuspendibleThreads),
        }
    }
}

impl Collaborators {
    /// Replaces the driver.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn CollectionDriver>) -> Self {
        self.driver = driver;
        self
    }

    /// Replaces the tracker.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn MemoryTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Replaces the suspendible thread set.
    #[must_use]
    pub fn with_suspendible_threads(mut self, set: Arc<dyn SuspendibleThreadSet>) -> Self {
        self.suspendible_threads = set;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, Default)]
    struct ThreadSet {
        joined: AtomicU32,
    }

    thread_local! {
        static JOINED: Cell<bool> = const { Cell::new(true) };
    }

    impl SuspendibleThreadSet for ThreadSet {
        fn is_joined(&self) -> bool {
            JOINED.with(Cell::get)
        }

        fn join(&self) {
            JOINED.with(|j| j.set(true));
            self.joined.fetch_add(1, Ordering::SeqCst);
        }

        fn leave(&self) {
            JOINED.with(|j| j.set(false));
        }
    }

    #[test]
    fn test_leaver_rejoins_on_drop() {
        let set = ThreadSet::default();
        {
            let _leaver = SuspendibleThreadSetLeaver::new(&set);
            assert!(!set.is_joined());
        }
        assert!(set.is_joined());
        assert_eq!(set.joined.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_leaver_noop_when_not_joined() {
        let set = NoSuspendibleThreads;
        let leaver = SuspendibleThreadSetLeaver::new(&set);
        assert!(!leaver.was_joined);
    }

    #[test]
    fn test_recording_driver() {
        let driver = RecordingDriver::new();
        driver.collect(GcRequest::allocation_stall());
        assert_eq!(driver.start_old_collection(), 1);
        assert_eq!(driver.old_seqnum(), 1);
        assert_eq!(driver.young_seqnum(), 0);
        assert_eq!(driver.requests(), vec![GcRequest::allocation_stall()]);
    }
}
