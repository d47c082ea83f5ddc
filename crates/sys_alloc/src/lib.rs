//! Anonymous memory reservations for garbage-collected heap spaces.
//!
//! A heap space needs a contiguous, page-aligned, word-addressable region
//! that lives outside the Rust allocator. This crate provides exactly that:
//! anonymous read-write mappings obtained directly from the OS, released when
//! the owning [`Reservation`] is dropped.

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

/// Returns the system allocation granularity.
///
/// On Windows this is typically 64KB; on Unix it is the page size. Region
/// sizes are rounded up to this granularity before mapping.
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

/// An anonymous read-write memory region backing one heap space.
///
/// The region is unmapped when the reservation is dropped, so the owner must
/// outlive every pointer handed out into it.
pub struct Reservation {
    inner: os::MapInner,
}

impl Reservation {
    /// Reserves and commits `len` bytes of zeroed anonymous memory.
    ///
    /// `len` is rounded up to the allocation granularity. With `no_reserve`
    /// set, swap space is not reserved up front (Linux `MAP_NORESERVE`);
    /// useful for large spaces that may stay mostly untouched.
    pub fn anonymous(len: usize, no_reserve: bool) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        let granularity = allocation_granularity();
        let len = len.div_ceil(granularity) * granularity;
        // SAFETY: len is non-zero and granularity-aligned; the mapping is
        // private and anonymous, so it aliases nothing else in the process.
        let inner = unsafe { os::MapInner::map_anon(len, no_reserve)? };
        Ok(Self { inner })
    }

    /// Pointer to the start of the region. Page-aligned, hence word-aligned.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the region in bytes (after granularity rounding).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the region is empty. Always false for a live reservation.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

// SAFETY: the mapping is process-private memory owned by this handle; the
// raw pointer it wraps is valid for the lifetime of the handle on any thread.
unsafe impl Send for Reservation {}
// SAFETY: see Send impl; shared access is governed by the callers.
unsafe impl Sync for Reservation {}
