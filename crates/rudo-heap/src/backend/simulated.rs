//! In-process memory backend.
//!
//! Records reservations, commits and mappings without touching the
//! operating system. Tests and benchmarks use it to run full allocator
//! scenarios deterministically, including commit failures and address space
//! holes.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use parking_lot::Mutex;

use super::{is_covered, not_reserved, MemoryBackend};

#[derive(Debug, Default)]
struct State {
    /// start -> size
    reservations: BTreeMap<usize, usize>,
    /// addr -> (size, backing offset)
    mappings: BTreeMap<usize, (usize, usize)>,
    /// Committed backing pages, by page index.
    committed: BTreeSet<usize>,
    commit_limit: Option<usize>,
    /// Most bytes a single uncommit call releases.
    uncommit_limit: Option<usize>,
    /// Address ranges that can never be reserved.
    holes: Vec<(usize, usize)>,
    commit_calls: usize,
    map_calls: usize,
    unmap_calls: usize,
}

/// [`MemoryBackend`] that only keeps books.
#[derive(Debug)]
pub struct SimulatedBackend {
    capacity: usize,
    page_size: usize,
    state: Mutex<State>,
}

impl SimulatedBackend {
    /// Creates a backend with `capacity` bytes of backing storage tracked in
    /// `page_size` units.
    #[must_use]
    pub fn new(capacity: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());
        Self {
            capacity,
            page_size,
            state: Mutex::new(State::default()),
        }
    }

    /// Caps the total committed bytes. Commits beyond the cap are partial.
    pub fn set_commit_limit(&self, limit: Option<usize>) {
        self.state.lock().commit_limit = limit;
    }

    /// Caps the bytes released by each uncommit call. Larger uncommits are
    /// partial.
    pub fn set_uncommit_limit(&self, limit: Option<usize>) {
        self.state.lock().uncommit_limit = limit;
    }

    /// Makes `[start, end)` impossible to reserve and to probe.
    pub fn add_address_hole(&self, start: usize, end: usize) {
        self.state.lock().holes.push((start, end));
    }

    /// Bytes currently committed.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.state.lock().committed.len() * self.page_size
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.state.lock().mappings.values().map(|&(size, _)| size).sum()
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.state.lock().reservations.values().sum()
    }

    /// Number of live reservations.
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Backing offset mapped at `addr`, if any.
    #[must_use]
    pub fn backing_offset(&self, addr: usize) -> Option<usize> {
        let state = self.state.lock();
        let (&start, &(size, offset)) = state.mappings.range(..=addr).next_back()?;
        (addr < start + size).then(|| offset + (addr - start))
    }

    /// Number of `commit` calls so far.
    #[must_use]
    pub fn commit_calls(&self) -> usize {
        self.state.lock().commit_calls
    }

    /// Number of `map` and `unmap` calls so far.
    #[must_use]
    pub fn map_calls(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.map_calls, state.unmap_calls)
    }

    fn is_reserved(state: &State, addr: usize, size: usize) -> bool {
        is_covered(&state.reservations, |&len| len, addr, size)
    }

    fn overlaps_hole(state: &State, addr: usize, size: usize) -> bool {
        state
            .holes
            .iter()
            .any(|&(start, end)| addr < end && start < addr + size)
    }

    /// Splits mappings so that `[addr, addr + size)` is covered by whole
    /// entries, then removes them. Returns the bytes removed.
    fn remove_mappings(state: &mut State, addr: usize, size: usize) -> usize {
        let end = addr + size;
        let overlapping: Vec<_> = state
            .mappings
            .range(..end)
            .filter(|(&start, &(len, _))| start + len > addr)
            .map(|(&start, &entry)| (start, entry))
            .collect();

        let mut removed = 0;
        for (start, (len, offset)) in overlapping {
            state.mappings.remove(&start);
            if start < addr {
                state.mappings.insert(start, (addr - start, offset));
            }
            if start + len > end {
                state
                    .mappings
                    .insert(end, (start + len - end, offset + (end - start)));
            }
            removed += (start + len).min(end) - start.max(addr);
        }
        removed
    }
}

impl MemoryBackend for SimulatedBackend {
    fn reserve(&self, addr: usize, size: usize) -> io::Result<bool> {
        let mut state = self.state.lock();
        if Self::overlaps_hole(&state, addr, size) {
            return Ok(false);
        }

        let overlaps = state
            .reservations
            .range(..addr + size)
            .next_back()
            .is_some_and(|(&start, &len)| start + len > addr);
        if overlaps {
            return Ok(false);
        }

        state.reservations.insert(addr, size);
        Ok(true)
    }

    fn unreserve(&self, addr: usize, size: usize) {
        let mut state = self.state.lock();
        let removed = state.reservations.remove(&addr);
        assert_eq!(removed, Some(size), "Unreserving unknown range {addr:#x}");
    }

    fn commit(&self, offset: usize, size: usize) -> usize {
        assert!(offset + size <= self.capacity, "Commit beyond backing storage");

        let mut state = self.state.lock();
        state.commit_calls += 1;

        let mut committed = 0;
        for page in (offset..offset + size).step_by(self.page_size) {
            let index = page / self.page_size;
            if !state.committed.contains(&index) {
                let total = state.committed.len() * self.page_size;
                if state.commit_limit.is_some_and(|limit| total >= limit) {
                    break;
                }
                state.committed.insert(index);
            }
            committed += self.page_size;
        }
        committed
    }

    fn uncommit(&self, offset: usize, size: usize) -> usize {
        let mut state = self.state.lock();
        let size = state
            .uncommit_limit
            .map_or(size, |limit| size.min(limit / self.page_size * self.page_size));
        for page in (offset..offset + size).step_by(self.page_size) {
            state.committed.remove(&(page / self.page_size));
        }
        size
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()> {
        let mut state = self.state.lock();
        if !Self::is_reserved(&state, addr, size) {
            return Err(not_reserved(addr, size));
        }
        if offset + size > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds backing storage",
            ));
        }

        // A fixed mapping replaces whatever was there
        Self::remove_mappings(&mut state, addr, size);
        state.mappings.insert(addr, (size, offset));
        state.map_calls += 1;
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        let mut state = self.state.lock();
        if !Self::is_reserved(&state, addr, size) {
            return Err(not_reserved(addr, size));
        }

        Self::remove_mappings(&mut state, addr, size);
        state.unmap_calls += 1;
        Ok(())
    }

    fn probe_address(&self, addr: usize) -> bool {
        let state = self.state.lock();
        !Self::overlaps_hole(&state, addr, self.page_size)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
