use std::io::{self, Error};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info = MaybeUninit::<SYSTEM_INFO>::uninit();
        GetSystemInfo(info.as_mut_ptr());
        info.assume_init()
    }
}

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = system_info().dwPageSize as usize;
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Returns the allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    static GRANULARITY: AtomicUsize = AtomicUsize::new(0);

    match GRANULARITY.load(Ordering::Relaxed) {
        0 => {
            let granularity = system_info().dwAllocationGranularity as usize;
            GRANULARITY.store(granularity, Ordering::Relaxed);
            granularity
        }
        granularity => granularity,
    }
}

pub struct MapInner {
    ptr: *mut core::ffi::c_void,
    len: usize,
}

impl MapInner {
    /// Creates a new anonymous read-write mapping.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `VirtualAlloc`.
    pub unsafe fn map_anon(len: usize, _no_reserve: bool) -> io::Result<MapInner> {
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(MapInner { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
