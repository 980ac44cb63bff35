//! Asynchronous unmapping of replaced virtual ranges.
//!
//! When a page is assembled from several cached fragments, the fragments'
//! backing moves to the new range but the old ranges are still mapped.
//! Unmapping them is deferred to a background thread so the allocating
//! thread does not pay for it. The queue is bounded in bytes; when it is
//! full the caller unmaps synchronously.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::physical_memory::PhysicalMemoryManager;
use crate::range::VirtualRange;
use crate::virtual_memory::VirtualMemoryManager;

#[derive(Debug, Default)]
struct Queue {
    ranges: VecDeque<VirtualRange>,
    queued: usize,
    stop: bool,
}

/// Background unmap and free of virtual ranges.
#[derive(Debug)]
pub struct Unmapper {
    pmm: Arc<PhysicalMemoryManager>,
    vmm: Arc<VirtualMemoryManager>,
    queue: Mutex<Queue>,
    wakeup: Condvar,
    limit: usize,
    warned: AtomicBool,
}

impl Unmapper {
    /// Creates an unmapper that queues at most `max_capacity * percent / 100`
    /// bytes.
    #[must_use]
    pub fn new(
        pmm: Arc<PhysicalMemoryManager>,
        vmm: Arc<VirtualMemoryManager>,
        max_capacity: usize,
        percent: usize,
    ) -> Self {
        Self {
            pmm,
            vmm,
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            limit: max_capacity.saturating_mul(percent) / 100,
            warned: AtomicBool::new(false),
        }
    }

    /// Unmaps and frees `vmem`, in the background if the queue has room.
    pub fn unmap(&self, vmem: VirtualRange) {
        if !self.try_enqueue(vmem) {
            self.do_unmap(vmem);
        }
    }

    /// Bytes waiting to be unmapped.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().queued
    }

    fn try_enqueue(&self, vmem: VirtualRange) -> bool {
        let mut queue = self.queue.lock();
        if queue.stop {
            return false;
        }

        if queue.queued + vmem.size() > self.limit {
            if !self.warned.swap(true, Ordering::Relaxed) {
                crate::tracing::internal::log_unmapper_saturated(queue.queued, self.limit);
            }
            return false;
        }

        queue.ranges.push_back(vmem);
        queue.queued += vmem.size();
        self.wakeup.notify_one();
        true
    }

    fn do_unmap(&self, vmem: VirtualRange) {
        self.pmm.unmap(vmem);
        self.vmm.free(vmem);
    }

    /// Worker loop. Returns after [`stop`](Self::stop).
    pub fn run(&self) {
        loop {
            let vmem = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.stop {
                        return;
                    }
                    if let Some(vmem) = queue.ranges.pop_front() {
                        break vmem;
                    }
                    self.wakeup.wait(&mut queue);
                }
            };

            self.do_unmap(vmem);
            self.queue.lock().queued -= vmem.size();
        }
    }

    /// Makes the worker exit. Queued ranges are left alone.
    pub fn stop(&self) {
        self.queue.lock().stop = true;
        self.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{PointerColors, MIN_HEAP_BASE_SHIFT};
    use crate::backend::{MemoryBackend, SimulatedBackend};
    use crate::collaborators::NoopTracker;
    use crate::globals::M;
    use crate::numa::Numa;
    use crate::virtual_memory::VirtualMemoryReserver;
    use std::thread;
    use std::time::{Duration, Instant};

    const G: usize = 2 * M;

    fn setup(percent: usize) -> (Arc<SimulatedBackend>, Arc<VirtualMemoryManager>, Unmapper) {
        let backend = Arc::new(SimulatedBackend::new(16 * M, G));
        let colors = Arc::new(PointerColors::new(MIN_HEAP_BASE_SHIFT));
        let ranges = {
            let mut reserver = VirtualMemoryReserver::new(backend.as_ref(), &NoopTracker, &colors, G);
            reserver.reserve(16 * M).unwrap();
            reserver.into_ranges()
        };
        let vmm = Arc::new(VirtualMemoryManager::new(
            backend.clone(),
            Arc::new(NoopTracker),
            Arc::clone(&colors),
            ranges,
            Numa::new(1),
            G,
        ));
        let pmm = Arc::new(PhysicalMemoryManager::new(
            backend.clone(),
            Arc::new(NoopTracker),
            colors,
            16 * M,
            vmm.reserved_end(),
            Numa::new(1),
            G,
        ));
        let unmapper = Unmapper::new(pmm, Arc::clone(&vmm), 16 * M, percent);
        (backend, vmm, unmapper)
    }

    fn mapped_range(backend: &SimulatedBackend, vmm: &VirtualMemoryManager) -> VirtualRange {
        let vmem = vmm.alloc(G, 0, true).unwrap();
        backend.map(vmm.address(vmem.start()), G, 0).unwrap();
        vmem
    }

    #[test]
    fn test_zero_budget_unmaps_synchronously() {
        let (backend, vmm, unmapper) = setup(0);
        let vmem = mapped_range(&backend, &vmm);

        unmapper.unmap(vmem);
        assert_eq!(backend.mapped(), 0);
        assert_eq!(vmm.free_size(0), 16 * M);
        assert_eq!(unmapper.queued_bytes(), 0);
    }

    #[test]
    fn test_worker_drains_queue() {
        let (backend, vmm, unmapper) = setup(100);
        let unmapper = Arc::new(unmapper);
        let worker = {
            let unmapper = Arc::clone(&unmapper);
            thread::spawn(move || unmapper.run())
        };

        let vmem = mapped_range(&backend, &vmm);
        unmapper.unmap(vmem);

        let deadline = Instant::now() + Duration::from_secs(5);
        while vmm.free_size(0) != 16 * M && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(vmm.free_size(0), 16 * M);
        assert_eq!(backend.mapped(), 0);

        unmapper.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_stopped_unmapper_works_synchronously() {
        let (backend, vmm, unmapper) = setup(100);
        unmapper.stop();
        let vmem = mapped_range(&backend, &vmm);
        unmapper.unmap(vmem);
        assert_eq!(vmm.free_size(0), 16 * M);
    }
}
