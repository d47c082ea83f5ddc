//! Heap spaces and the memory-manager view the collector runs against.
//!
//! The movable heap is a set of [`LocalSpace`]s: contiguous word-addressable
//! regions, each with its own bitmap and lock. Code areas and permanent
//! areas are separate region kinds; cells inside them are never shared, but
//! their pointer fields are scanned as roots.
//!
//! Regions are backed by anonymous OS mappings ([`sys_alloc::Reservation`])
//! and filled by a bump allocator: one header word followed by the payload
//! words of each cell.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use sys_alloc::Reservation;
use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::header::{self, CellFlags, CellPtr, WORD_BYTES};

/// Errors raised while constructing heap spaces.
#[derive(Debug, Error)]
pub enum HeapError {
    /// The OS refused the backing mapping.
    #[error("failed to map a space region: {0}")]
    Map(#[from] std::io::Error),
    /// The requested space cannot hold even one cell.
    #[error("space size of {words} words is too small")]
    SpaceTooSmall {
        /// The rejected size.
        words: usize,
    },
}

/// A contiguous run of words backed by one OS mapping.
pub(crate) struct Region {
    /// Owns the memory; dropped last.
    _mapping: Reservation,
    base: *mut usize,
    words: usize,
    /// Bump offset of the next free word.
    next: AtomicUsize,
}

// SAFETY: the region points into a process-private mapping owned by
// `_mapping`; accesses from multiple threads are coordinated by the
// collector's phase protocol, not by this type.
unsafe impl Send for Region {}
// SAFETY: see Send impl.
unsafe impl Sync for Region {}

impl Region {
    fn new(words: usize) -> Result<Self, HeapError> {
        if words < 2 {
            return Err(HeapError::SpaceTooSmall { words });
        }
        let mapping = Reservation::anonymous(words * WORD_BYTES, false)?;
        let base = mapping.ptr().cast::<usize>();
        let words = mapping.len() / WORD_BYTES;
        Ok(Self {
            _mapping: mapping,
            base,
            words,
            next: AtomicUsize::new(0),
        })
    }

    pub(crate) fn base_ptr(&self) -> *mut usize {
        self.base
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base as usize
    }

    pub(crate) fn words(&self) -> usize {
        self.words
    }

    pub(crate) fn allocated_words(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.base_addr() && addr < self.base_addr() + self.words * WORD_BYTES
    }

    fn alloc(&self, flags: CellFlags, payload: &[usize]) -> Option<CellPtr> {
        let need = payload.len() + 1;
        let off = self.next.fetch_add(need, Ordering::Relaxed);
        if off + need > self.words {
            self.next.fetch_sub(need, Ordering::Relaxed);
            return None;
        }
        // SAFETY: [off, off + need) is within the mapping and, thanks to the
        // bump counter, owned exclusively by this call.
        unsafe {
            let header_ptr = self.base.add(off);
            header_ptr.write(header::length_word(payload.len(), flags));
            let cell = CellPtr::from_addr(header_ptr.add(1) as usize);
            for (i, w) in payload.iter().enumerate() {
                cell.set(i, *w);
            }
            Some(cell)
        }
    }
}

/// One space of the movable heap.
///
/// Each local space carries a bitmap with one bit per word and a lock that
/// serializes the compound transitions of a collection: a bit may only be
/// cleared together with the header rewrite it vouches for.
pub struct LocalSpace {
    region: Region,
    bitmap: Bitmap,
    lock: Mutex<()>,
}

impl LocalSpace {
    fn new(words: usize) -> Result<Self, HeapError> {
        let region = Region::new(words)?;
        let bitmap = Bitmap::new(region.words());
        Ok(Self {
            region,
            bitmap,
            lock: Mutex::new(()),
        })
    }

    /// Size of the space in words.
    #[must_use]
    pub fn size_words(&self) -> usize {
        self.region.words()
    }

    /// Words handed out so far.
    #[must_use]
    pub fn allocated_words(&self) -> usize {
        self.region.allocated_words()
    }

    /// Whether `addr` (a byte address) lies within this space.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    /// Bitmap index of the word at byte address `addr`.
    ///
    /// # Panics
    ///
    /// Debug-asserts that `addr` lies within the space.
    #[must_use]
    pub fn word_no(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.region.base_addr()) / WORD_BYTES
    }

    /// The space's bitmap.
    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Takes the space lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Allocates an immutable cell with the given flags and payload words.
    ///
    /// Returns `None` when the space is full.
    pub fn alloc_words(&self, flags: CellFlags, payload: &[usize]) -> Option<CellPtr> {
        self.region.alloc(flags, payload)
    }

    /// Allocates a byte cell, zero-padding the last word.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Option<CellPtr> {
        let mut payload = vec![0usize; bytes.len().div_ceil(WORD_BYTES)];
        // SAFETY: the destination holds at least bytes.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                payload.as_mut_ptr().cast::<u8>(),
                bytes.len(),
            );
        }
        self.alloc_words(CellFlags::BYTE, &payload)
    }
}

/// A code area. Cells here hold compiled code and the constants embedded in
/// it; the constants are scanned as roots but the cells themselves are never
/// shared.
pub struct CodeSpace {
    region: Region,
}

impl CodeSpace {
    /// Allocates a code cell whose payload words are its embedded constants.
    pub fn alloc_code_cell(&self, constants: &[usize]) -> Option<CellPtr> {
        self.region.alloc(CellFlags::CODE, constants)
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }
}

/// A permanent area: cells that survive every collection in place.
///
/// Mutable, pointer-bearing permanent areas are scanned for roots into the
/// local heap; byte-only areas cannot hold pointers and are skipped.
pub struct PermanentSpace {
    region: Region,
    mutable_space: bool,
    byte_only: bool,
}

impl PermanentSpace {
    /// Whether cells in this area may still be written to.
    #[must_use]
    pub fn is_mutable(&self) -> bool {
        self.mutable_space
    }

    /// Whether this area holds only byte data.
    #[must_use]
    pub fn is_byte_only(&self) -> bool {
        self.byte_only
    }

    /// Allocates a cell in the permanent area.
    pub fn alloc_words(&self, flags: CellFlags, payload: &[usize]) -> Option<CellPtr> {
        self.region.alloc(flags, payload)
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }
}

/// The memory-manager view: every space of the heap, with address lookup.
#[derive(Default)]
pub struct Heap {
    locals: Vec<LocalSpace>,
    codes: Vec<CodeSpace>,
    permanents: Vec<PermanentSpace>,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a local (movable) space of `words` words. Returns its index.
    pub fn add_local_space(&mut self, words: usize) -> Result<usize, HeapError> {
        self.locals.push(LocalSpace::new(words)?);
        Ok(self.locals.len() - 1)
    }

    /// Adds a code area of `words` words. Returns its index.
    pub fn add_code_space(&mut self, words: usize) -> Result<usize, HeapError> {
        self.codes.push(CodeSpace {
            region: Region::new(words)?,
        });
        Ok(self.codes.len() - 1)
    }

    /// Adds a permanent area of `words` words. Returns its index.
    pub fn add_permanent_space(
        &mut self,
        words: usize,
        mutable_space: bool,
        byte_only: bool,
    ) -> Result<usize, HeapError> {
        self.permanents.push(PermanentSpace {
            region: Region::new(words)?,
            mutable_space,
            byte_only,
        });
        Ok(self.permanents.len() - 1)
    }

    /// The local spaces.
    #[must_use]
    pub fn local_spaces(&self) -> &[LocalSpace] {
        &self.locals
    }

    /// The code areas.
    #[must_use]
    pub fn code_spaces(&self) -> &[CodeSpace] {
        &self.codes
    }

    /// The permanent areas.
    #[must_use]
    pub fn permanent_spaces(&self) -> &[PermanentSpace] {
        &self.permanents
    }

    /// Finds the local space containing byte address `addr`, if any.
    ///
    /// Lookups use the address of a cell's header word, so a cell allocated
    /// flush against the start of a space still resolves to that space.
    #[must_use]
    pub fn local_space_for(&self, addr: usize) -> Option<&LocalSpace> {
        self.locals.iter().find(|space| space.contains(addr))
    }

    /// Allocates an immutable cell in the first local space with room.
    pub fn alloc_words(&self, flags: CellFlags, payload: &[usize]) -> Option<CellPtr> {
        self.locals
            .iter()
            .find_map(|space| space.alloc_words(flags, payload))
    }

    /// Allocates a byte cell in the first local space with room.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Option<CellPtr> {
        self.locals.iter().find_map(|space| space.alloc_bytes(bytes))
    }
}

/// Root slots handed over by the runtime.
///
/// Each slot is one word; pointer slots are resolved through any forwarding
/// pointers left by an earlier, interrupted collection and updated in place
/// while scanning.
#[derive(Default)]
pub struct RootTable {
    slots: Vec<usize>,
}

impl RootTable {
    /// Creates an empty root table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cell as a root.
    pub fn push_cell(&mut self, cell: CellPtr) {
        self.slots.push(cell.addr());
    }

    /// Registers a raw root word (may be tagged or outside the heap).
    pub fn push_word(&mut self, w: usize) {
        self.slots.push(w);
    }

    /// Number of root slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The current value of slot `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> usize {
        self.slots[i]
    }

    /// Slot `i` as a cell address.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not hold a pointer-shaped word.
    #[must_use]
    pub fn cell(&self, i: usize) -> CellPtr {
        assert!(header::is_data_ptr(self.slots[i]));
        CellPtr::from_addr(self.slots[i])
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [usize] {
        &mut self.slots
    }
}
