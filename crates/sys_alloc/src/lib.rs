//! Low-level virtual memory primitives.
//!
//! This crate is the operating system boundary of the heap: it reserves
//! address space at exact addresses, creates a file-descriptor backed store of
//! physical memory, and maps offsets of that store into reserved address
//! space.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

#[cfg(unix)]
pub use unix::BackingFile;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Reservation addresses should be aligned to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Returns `true` if `addr` is a representable user-space address.
///
/// The probe never faults: on Unix it first asks `msync` about the page and,
/// if the page is merely unmapped, tries a hinted `PROT_NONE` mapping at the
/// address. `addr` must be page aligned.
pub fn probe_address(addr: usize) -> bool {
    debug_assert_eq!(addr % page_size(), 0, "probe address must be page aligned");
    os::probe_address(addr)
}

/// A reserved, inaccessible range of address space.
///
/// The range is released when this handle is dropped.
#[derive(Debug)]
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Reserves `len` bytes at exactly `addr`.
    ///
    /// Returns `Ok(None)` when the operating system is unable to place the
    /// reservation at the requested address. Errors are reserved for invalid
    /// arguments and resource exhaustion.
    ///
    /// # Safety
    ///
    /// The caller must not reserve a range that overlaps memory owned by
    /// someone else through a mechanism that ignores hints.
    pub unsafe fn at(addr: usize, len: usize) -> io::Result<Option<Self>> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::ReservationInner::reserve_at(addr, len)? };
        Ok(inner.map(|inner| Self { inner }))
    }

    /// Returns the start address of the reservation.
    pub fn addr(&self) -> usize {
        self.inner.addr()
    }

    /// Returns the length of the reservation in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}
