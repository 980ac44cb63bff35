use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub fn probe_address(addr: usize) -> bool {
    let len = allocation_granularity();
    let ptr = unsafe { VirtualAlloc(addr as *const _, len, MEM_RESERVE, PAGE_NOACCESS) };
    if ptr.is_null() {
        return false;
    }

    unsafe {
        VirtualFree(ptr, 0, MEM_RELEASE);
    }

    ptr as usize == addr
}

#[derive(Debug)]
pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of inaccessible address space at `addr`.
    pub unsafe fn reserve_at(addr: usize, len: usize) -> io::Result<Option<Self>> {
        let hint = if addr == 0 {
            ptr::null()
        } else {
            addr as *const std::ffi::c_void
        };

        let ptr = unsafe { VirtualAlloc(hint, len, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() {
            // VirtualAlloc refuses occupied or out of range addresses with
            // ERROR_INVALID_ADDRESS, which is not a hard failure here
            let err = Error::last_os_error();
            return match err.raw_os_error() {
                Some(487) => Ok(None),
                _ => Err(err),
            };
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
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
