//! NUMA partition placement.
//!
//! There is no portable way to ask which node a thread runs on, so threads
//! are bound to a preferred partition round-robin the first time they
//! allocate. Allocations start at that partition and wrap around the rest.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_NODE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static PREFERRED_NODE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// NUMA topology of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numa {
    count: usize,
}

impl Numa {
    /// Creates a topology with `count` nodes.
    #[must_use]
    pub const fn new(count: usize) -> Self {
        assert!(count > 0, "At least one NUMA node");
        Self { count }
    }

    /// Number of nodes.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Preferred node of the calling thread.
    #[must_use]
    pub fn current_id(&self) -> usize {
        let node = PREFERRED_NODE.with(|cell| {
            cell.get().unwrap_or_else(|| {
                let node = NEXT_NODE.fetch_add(1, Ordering::Relaxed);
                cell.set(Some(node));
                node
            })
        });
        node % self.count
    }

    /// Share of `total` assigned to `numa_id`, in multiples of `granule`.
    ///
    /// Granules are spread evenly and the first nodes take the remainder.
    #[must_use]
    pub const fn calculate_share(&self, numa_id: usize, total: usize, granule: usize) -> usize {
        let granules = total / granule;
        let base = granules / self.count;
        let extra = if numa_id < granules % self.count { 1 } else { 0 };
        (base + extra) * granule
    }

    /// Iterates nodes starting at `start`, wrapping around.
    pub fn round_robin(&self, start: usize) -> impl Iterator<Item = usize> {
        let count = self.count;
        (0..count).map(move |i| (start + i) % count)
    }
}
