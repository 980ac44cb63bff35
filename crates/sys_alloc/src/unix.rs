use std::io::{self, Error};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub fn probe_address(addr: usize) -> bool {
    let len = page_size();

    if unsafe { libc::msync(addr as *mut libc::c_void, len, libc::MS_ASYNC) } == 0 {
        // Already mapped, hence valid
        return true;
    }

    if Error::last_os_error().raw_os_error() != Some(libc::ENOMEM) {
        // msync has unspecified behavior for odd inputs, treat as invalid
        return false;
    }

    // Unmapped. Try to place a mapping there to see if the address is usable.
    let result = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_NONE,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };

    if result == libc::MAP_FAILED {
        return false;
    }

    unsafe {
        libc::munmap(result, len);
    }

    result as usize == addr
}

#[derive(Debug)]
pub struct ReservationInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of inaccessible address space at `addr`.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn reserve_at(addr: usize, len: usize) -> io::Result<Option<Self>> {
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                RESERVE_FLAGS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = Error::last_os_error();
            return match err.raw_os_error() {
                // Address range unusable, not a hard failure
                Some(libc::ENOMEM | libc::EINVAL) => Ok(None),
                _ => Err(err),
            };
        }

        if ptr as usize != addr {
            // The kernel placed the mapping elsewhere
            unsafe {
                libc::munmap(ptr, len);
            }
            return Ok(None);
        }

        Ok(Some(Self { ptr, len }))
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}

/// A file-descriptor backed store of physical memory.
///
/// Offsets into the file are the "physical" addresses of the heap. Committing
/// allocates file blocks, uncommitting punches holes, and mapping places file
/// offsets at fixed addresses inside a [`crate::Reservation`].
#[derive(Debug)]
pub struct BackingFile {
    fd: OwnedFd,
    size: usize,
}

impl BackingFile {
    /// Creates an anonymous backing file of `size` bytes.
    ///
    /// The file is sized up front but no blocks are allocated until
    /// [`BackingFile::commit`] is called.
    pub fn new(size: usize) -> io::Result<Self> {
        let fd = create_anonymous_fd()?;
        let len = libc::off_t::try_from(size)
            .map_err(|_| Error::new(io::ErrorKind::InvalidInput, "backing size too large"))?;

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
            return Err(Error::last_os_error());
        }

        Ok(Self { fd, size })
    }

    /// Returns the size of the file in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Allocates file blocks for `[offset, offset + len)`.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.fallocate(0, offset, len)
    }

    /// Allocates file blocks for `[offset, offset + len)`.
    ///
    /// Without `fallocate`, blocks materialize on first touch.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_bounds(offset, len)
    }

    /// Releases file blocks for `[offset, offset + len)`.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.fallocate(
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    }

    /// Releases file blocks for `[offset, offset + len)`.
    ///
    /// Hole punching is unavailable here, so the blocks stay resident.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_bounds(offset, len)
    }

    /// Maps `[offset, offset + len)` of the file read-write at exactly `addr`.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must lie inside a live reservation owned by the
    /// caller. Any previous mapping of that range is replaced.
    pub unsafe fn map(&self, addr: usize, len: usize, offset: usize) -> io::Result<()> {
        self.check_bounds(offset, len)?;
        let file_offset = libc::off_t::try_from(offset)
            .map_err(|_| Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;

        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd.as_raw_fd(),
                file_offset,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        debug_assert_eq!(ptr as usize, addr);
        Ok(())
    }

    /// Replaces the mapping at `[addr, addr + len)` with inaccessible
    /// reserved memory.
    ///
    /// # Safety
    ///
    /// `[addr, addr + len)` must lie inside a live reservation owned by the
    /// caller, and nothing may access the range afterwards.
    pub unsafe fn unmap(&self, addr: usize, len: usize) -> io::Result<()> {
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                RESERVE_FLAGS | libc::MAP_FIXED,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds backing file",
            )),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn fallocate(&self, mode: libc::c_int, offset: usize, len: usize) -> io::Result<()> {
        self.check_bounds(offset, len)?;
        let (Ok(offset), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len))
        else {
            return Err(Error::new(io::ErrorKind::InvalidInput, "range too large"));
        };

        loop {
            if unsafe { libc::fallocate(self.fd.as_raw_fd(), mode, offset, len) } == 0 {
                return Ok(());
            }

            let err = Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_anonymous_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::memfd_create(c"rudo_heap".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }

    // SAFETY: memfd_create returned a fresh descriptor that we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_anonymous_fd() -> io::Result<OwnedFd> {
    use std::ffi::CString;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let name = format!(
        "/rudo-heap-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name = CString::new(name).map_err(|e| Error::new(io::ErrorKind::InvalidInput, e))?;

    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }

    // The descriptor keeps the object alive, the name is no longer needed
    unsafe {
        libc::shm_unlink(name.as_ptr());
    }

    // SAFETY: shm_open returned a fresh descriptor that we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reservation;

    #[test]
    fn test_backing_file_bounds() {
        let file = BackingFile::new(page_size() * 4).expect("backing file");
        assert_eq!(file.size(), page_size() * 4);
        assert!(file.commit(0, page_size()).is_ok());
        assert!(file.commit(page_size() * 3, page_size() * 2).is_err());
    }

    #[test]
    fn test_map_shared_offsets_alias() {
        let ps = page_size();
        let file = BackingFile::new(ps * 2).expect("backing file");
        file.commit(0, ps * 2).expect("commit");

        // Reserve anywhere by probing a few hints
        let reservation = [0x5000_0000_0000usize, 0x5800_0000_0000, 0x2000_0000]
            .into_iter()
            .find_map(|hint| unsafe { Reservation::at(hint, ps * 2) }.ok().flatten());
        let Some(reservation) = reservation else {
            return;
        };

        let a = reservation.addr();
        let b = a + ps;
        unsafe {
            // Both virtual pages map the same file offset
            file.map(a, ps, 0).expect("map a");
            file.map(b, ps, 0).expect("map b");

            ptr::write_volatile(a as *mut u64, 0xfeed);
            assert_eq!(ptr::read_volatile(b as *const u64), 0xfeed);

            file.unmap(a, ps * 2).expect("unmap");
        }

        file.uncommit(0, ps * 2).expect("uncommit");
    }
}
