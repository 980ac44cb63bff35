//! File descriptor backed memory.
//!
//! Physical memory is an anonymous file sized to the max capacity. Offsets
//! into the file are backing offsets. Mapping uses shared fixed mappings, so
//! the same backing offset can be moved between virtual addresses without
//! copying data.

use std::collections::BTreeMap;
use std::io;

use parking_lot::Mutex;
use sys_alloc::{BackingFile, Reservation};

use super::{is_covered, not_reserved, MemoryBackend};
use crate::globals::align_down;

/// [`MemoryBackend`] over `sys_alloc`.
#[derive(Debug)]
pub struct OsBackend {
    file: BackingFile,
    granule: usize,
    /// Live reservations keyed by start address.
    reservations: Mutex<BTreeMap<usize, Reservation>>,
}

impl OsBackend {
    /// Creates a backend with `capacity` bytes of backing storage.
    ///
    /// # Errors
    ///
    /// Returns the error from creating or sizing the backing file.
    pub fn new(capacity: usize, granule: usize) -> io::Result<Self> {
        Ok(Self {
            file: BackingFile::new(capacity)?,
            granule,
            reservations: Mutex::new(BTreeMap::new()),
        })
    }

    fn check_reserved(&self, addr: usize, size: usize) -> io::Result<()> {
        let reservations = self.reservations.lock();
        if is_covered(&reservations, Reservation::len, addr, size) {
            Ok(())
        } else {
            Err(not_reserved(addr, size))
        }
    }
}

impl MemoryBackend for OsBackend {
    fn reserve(&self, addr: usize, size: usize) -> io::Result<bool> {
        // SAFETY: the heap window is only ever reserved through this backend,
        // and the kernel refuses or relocates hints that hit foreign mappings.
        let Some(reservation) = (unsafe { Reservation::at(addr, size)? }) else {
            return Ok(false);
        };

        self.reservations.lock().insert(addr, reservation);
        Ok(true)
    }

    fn unreserve(&self, addr: usize, size: usize) {
        let removed = self.reservations.lock().remove(&addr);
        debug_assert!(
            removed.as_ref().is_some_and(|r| r.len() == size),
            "Unreserving unknown range {addr:#x}+{size:#x}"
        );
        // Dropping the reservation releases the range
        drop(removed);
    }

    fn commit(&self, offset: usize, size: usize) -> usize {
        if self.file.commit(offset, size).is_ok() {
            return size;
        }

        // Failed, commit as much as possible by halving
        let mut start = offset;
        let mut end = offset + size;
        loop {
            let len = align_down((end - start) / 2, self.granule);
            if len < self.granule {
                return start - offset;
            }

            if self.file.commit(start, len).is_ok() {
                start += len;
            } else {
                end -= len;
            }
        }
    }

    fn uncommit(&self, offset: usize, size: usize) -> usize {
        match self.file.uncommit(offset, size) {
            Ok(()) => size,
            Err(_) => 0,
        }
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()> {
        self.check_reserved(addr, size)?;
        // SAFETY: the range lies inside our live reservations.
        unsafe { self.file.map(addr, size, offset) }
    }

    fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        self.check_reserved(addr, size)?;
        // SAFETY: the range lies inside our live reservations and the
        // allocator no longer hands it out.
        unsafe { self.file.unmap(addr, size) }
    }
}
