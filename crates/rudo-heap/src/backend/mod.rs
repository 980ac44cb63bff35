//! Operating system boundary of the heap.
//!
//! The allocator talks to memory only through [`MemoryBackend`]: address
//! space is reserved at exact addresses, backing storage is addressed by
//! offsets in `[0, max_capacity)`, and mapping places backing offsets at
//! reserved addresses.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::HeapError;

#[cfg(unix)]
mod os;
mod simulated;

#[cfg(unix)]
pub use os::OsBackend;
pub use simulated::SimulatedBackend;

/// Reservation, commit and mapping primitives.
///
/// Implementations must be callable from any thread. Every method is given
/// ranges that the allocator owns exclusively at the time of the call.
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Reserves `[addr, addr + size)`.
    ///
    /// Returns `Ok(false)` if the range cannot be reserved at exactly that
    /// address. Nothing stays reserved in that case.
    ///
    /// # Errors
    ///
    /// Returns the operating system error on hard failures.
    fn reserve(&self, addr: usize, size: usize) -> io::Result<bool>;

    /// Releases a range previously returned by a successful
    /// [`reserve`](MemoryBackend::reserve) with the same arguments.
    fn unreserve(&self, addr: usize, size: usize);

    /// Commits backing storage for `[offset, offset + size)`.
    ///
    /// Returns the number of bytes committed from the start of the range,
    /// which is less than `size` under memory pressure.
    fn commit(&self, offset: usize, size: usize) -> usize;

    /// Uncommits backing storage for `[offset, offset + size)`.
    ///
    /// Returns the number of bytes uncommitted from the start of the range.
    fn uncommit(&self, offset: usize, size: usize) -> usize;

    /// Maps backing `[offset, offset + size)` at `addr`.
    ///
    /// # Errors
    ///
    /// Fails if `addr` is outside the reserved ranges or the operating
    /// system refuses the mapping.
    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()>;

    /// Unmaps `[addr, addr + size)`, leaving it reserved.
    ///
    /// # Errors
    ///
    /// Fails if `addr` is outside the reserved ranges or the operating
    /// system refuses the unmapping.
    fn unmap(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Returns `true` if `addr` is a usable user-space address.
    fn probe_address(&self, addr: usize) -> bool {
        sys_alloc::probe_address(addr)
    }

    /// Smallest unit the backend maps.
    fn page_size(&self) -> usize {
        sys_alloc::page_size()
    }
}

/// Returns `true` if `[addr, addr + size)` is covered by `reservations`
/// (start -> entry, with `len` giving an entry's size).
///
/// A degraded reservation can consist of pieces that touch, and the
/// allocator treats touching pieces as one window, so a range may run across
/// several of them.
fn is_covered<V>(
    reservations: &BTreeMap<usize, V>,
    len: impl Fn(&V) -> usize,
    addr: usize,
    size: usize,
) -> bool {
    let Some((&start, entry)) = reservations.range(..=addr).next_back() else {
        return false;
    };

    let end = addr + size;
    let mut covered = start + len(entry);
    for (&next, entry) in reservations.range(covered..) {
        if covered >= end || next != covered {
            break;
        }
        covered = next + len(entry);
    }
    covered > addr && covered >= end
}

fn not_reserved(addr: usize, size: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("range {addr:#x}+{size:#x} is not reserved"),
    )
}

/// The operating system backend for this platform.
///
/// # Errors
///
/// Returns [`HeapError::UnsupportedPlatform`] where no operating system
/// backend exists, or the error from creating the backing store.
#[cfg(unix)]
pub fn default_backend(
    max_capacity: usize,
    granule: usize,
) -> Result<Arc<dyn MemoryBackend>, HeapError> {
    Ok(Arc::new(OsBackend::new(max_capacity, granule)?))
}

/// The operating system backend for this platform.
///
/// # Errors
///
/// Returns [`HeapError::UnsupportedPlatform`] where no operating system
/// backend exists, or the error from creating the backing store.
#[cfg(not(unix))]
pub fn default_backend(
    _max_capacity: usize,
    _granule: usize,
) -> Result<Arc<dyn MemoryBackend>, HeapError> {
    Err(HeapError::UnsupportedPlatform)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservations(entries: &[(usize, usize)]) -> BTreeMap<usize, usize> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_range_inside_one_reservation() {
        let map = reservations(&[(100, 100)]);
        assert!(is_covered(&map, |&len| len, 100, 100));
        assert!(is_covered(&map, |&len| len, 150, 10));
        assert!(!is_covered(&map, |&len| len, 50, 100));
        assert!(!is_covered(&map, |&len| len, 200, 10));
    }

    #[test]
    fn test_range_across_touching_reservations() {
        let map = reservations(&[(0, 100), (100, 100), (300, 100)]);
        assert!(is_covered(&map, |&len| len, 50, 150));
        // [200, 300) is not reserved
        assert!(!is_covered(&map, |&len| len, 150, 200));
        assert!(!is_covered(&map, |&len| len, 250, 100));
    }
}
