//! Object header codec.
//!
//! Every heap cell is a run of machine words prefixed by a one-word header.
//! Over the lifetime of a collection the same header word carries one of
//! three meanings:
//!
//! * a **length word**: cell length in words plus flag bits (the cell's true
//!   type and size);
//! * a **forwarding pointer**: the address of a cell that has subsumed this
//!   one, marked by the top bit;
//! * a **chain link**: the address of the next cell in an intrusive
//!   work list, encoded exactly like a forwarding pointer. The space bitmap
//!   disambiguates: bit set means chain link, bit clear means forwarding.
//!
//! Bit layout of a `usize` header word:
//!
//! ```text
//! bit  63     : forwarding tag (set => the word holds an address)
//! bits 56..62 : flag bits — BYTE | CODE | NEGATIVE | MUTABLE
//! bits  0..55 : length in words
//! ```
//!
//! Data slots inside cells use a one-bit tagged encoding: an odd word is a
//! small integer (value in the upper bits) and is never followed; an aligned
//! even word is a pointer candidate.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a machine word in bytes.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

const FORWARD_BIT: usize = 1 << (usize::BITS - 1);
const FLAGS_SHIFT: u32 = usize::BITS - 8;
const LENGTH_MASK: usize = (1 << FLAGS_SHIFT) - 1;

/// Largest length representable in a header word.
pub const MAX_LENGTH: usize = LENGTH_MASK;

/// Flag bits carried in a normal length word.
///
/// Only seven bits are available; the eighth position in the top byte is the
/// forwarding tag and can never appear in a flags value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CellFlags(u8);

impl CellFlags {
    /// No flags: an immutable word (pointer-bearing) cell.
    pub const NONE: Self = Self(0);
    /// Payload is raw bytes; contains no pointers.
    pub const BYTE: Self = Self(0x01);
    /// Compiled code. Never eligible for sharing.
    pub const CODE: Self = Self(0x02);
    /// Sign bit for long-precision arbitrary integers.
    pub const NEGATIVE: Self = Self(0x10);
    /// Cell contents may still be written to. Never eligible for sharing.
    pub const MUTABLE: Self = Self(0x40);

    /// Builds a flags value from raw bits, masking off the forwarding tag.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7f)
    }

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the byte flag is set.
    #[must_use]
    pub const fn is_byte(self) -> bool {
        self.contains(Self::BYTE)
    }

    /// Whether the code flag is set.
    #[must_use]
    pub const fn is_code(self) -> bool {
        self.contains(Self::CODE)
    }

    /// Whether the mutable flag is set.
    #[must_use]
    pub const fn is_mutable(self) -> bool {
        self.contains(Self::MUTABLE)
    }

    /// Whether the negative-sign flag is set.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.contains(Self::NEGATIVE)
    }
}

impl std::ops::BitOr for CellFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl fmt::Debug for CellFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellFlags({:#04x})", self.0)
    }
}

/// Builds a normal length word from a length and flag bits.
///
/// # Panics
///
/// Panics if `length` exceeds [`MAX_LENGTH`].
#[must_use]
pub const fn length_word(length: usize, flags: CellFlags) -> usize {
    assert!(length <= MAX_LENGTH, "cell length overflows the header");
    length | ((flags.bits() as usize) << FLAGS_SHIFT)
}

/// Length in words encoded in a normal length word.
#[must_use]
pub const fn header_length(hdr: usize) -> usize {
    hdr & LENGTH_MASK
}

/// Flag bits encoded in a normal length word.
#[must_use]
pub const fn header_flags(hdr: usize) -> CellFlags {
    CellFlags::from_bits((hdr >> FLAGS_SHIFT) as u8)
}

/// Whether the header carries an address (forwarding pointer or chain link).
#[must_use]
pub const fn contains_forwarding_ptr(hdr: usize) -> bool {
    hdr & FORWARD_BIT != 0
}

/// Whether the header is a normal length word.
#[must_use]
pub const fn is_normal_length(hdr: usize) -> bool {
    !contains_forwarding_ptr(hdr)
}

/// Address carried by a forwarding pointer or chain link header.
#[must_use]
pub const fn header_address(hdr: usize) -> usize {
    hdr & !FORWARD_BIT
}

const fn address_header(addr: usize) -> usize {
    addr | FORWARD_BIT
}

/// Encodes a small integer into a tagged data slot.
#[must_use]
pub const fn tag_int(v: isize) -> usize {
    ((v as usize) << 1) | 1
}

/// Decodes a tagged data slot back to its integer value.
#[must_use]
pub const fn untag_int(w: usize) -> isize {
    (w as isize) >> 1
}

/// Whether a data slot holds a tagged small integer.
#[must_use]
pub const fn is_tagged(w: usize) -> bool {
    w & 1 == 1
}

/// Whether a data slot can be a pointer: non-null and word-aligned.
///
/// This only filters by encoding; whether the address lies in a heap space
/// is up to the caller.
#[must_use]
pub const fn is_data_ptr(w: usize) -> bool {
    w != 0 && w & (WORD_BYTES - 1) == 0
}

/// Address of a heap cell: a pointer to its first payload word.
///
/// The header sits one word below the address, matching the runtime ABI
/// where pointer fields address cell payloads directly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellPtr(*mut usize);

impl CellPtr {
    /// Wraps a raw payload address.
    ///
    /// The address must be non-null and word-aligned; callers get undefined
    /// behaviour from the accessors otherwise.
    #[must_use]
    pub fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr % WORD_BYTES == 0);
        Self(addr as *mut usize)
    }

    /// The payload address as an integer.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// The address of the header word (one word below the payload).
    #[must_use]
    pub fn header_addr(self) -> usize {
        self.addr() - WORD_BYTES
    }

    /// Reads the header word.
    ///
    /// Header words are read by one phase task while another may be
    /// rewriting them, so the access is a relaxed atomic load; the
    /// transition protocol, not memory ordering, carries the correctness
    /// argument (forwarding pointers and restored length words are final).
    ///
    /// # Safety
    ///
    /// The cell must lie within a live heap space, with at least one word
    /// below `self` belonging to the same space.
    #[must_use]
    pub unsafe fn header(self) -> usize {
        // SAFETY: the header word is valid for atomic access per the
        // caller's contract.
        unsafe { AtomicUsize::from_ptr(self.0.sub(1)).load(Ordering::Relaxed) }
    }

    /// Overwrites the header word.
    ///
    /// # Safety
    ///
    /// Same as [`CellPtr::header`]; concurrent writers must follow the
    /// chain-link transition protocol (a chain link may become another chain
    /// link, a forwarding pointer or a length word; the latter two are final).
    pub unsafe fn set_header(self, w: usize) {
        // SAFETY: see `header`.
        unsafe { AtomicUsize::from_ptr(self.0.sub(1)).store(w, Ordering::Relaxed) };
    }

    /// Reads payload word `i`.
    ///
    /// # Safety
    ///
    /// `i` must be below the cell's length.
    #[must_use]
    pub unsafe fn get(self, i: usize) -> usize {
        unsafe { self.0.add(i).read() }
    }

    /// Writes payload word `i`.
    ///
    /// # Safety
    ///
    /// `i` must be below the cell's length.
    pub unsafe fn set(self, i: usize, w: usize) {
        unsafe { self.0.add(i).write(w) };
    }

    /// Raw pointer to payload word `i`, for in-place slot updates.
    ///
    /// # Safety
    ///
    /// `i` must be below the cell's length.
    #[must_use]
    pub unsafe fn slot(self, i: usize) -> *mut usize {
        unsafe { self.0.add(i) }
    }

    /// Replaces the header with a chain link to `next` (0 terminates).
    ///
    /// # Safety
    ///
    /// Same as [`CellPtr::set_header`].
    pub unsafe fn set_link(self, next: usize) {
        debug_assert!(next & FORWARD_BIT == 0, "link address uses the tag bit");
        unsafe { self.set_header(address_header(next)) };
    }

    /// Address stored in a chain-link or forwarding header (0 terminates).
    ///
    /// # Safety
    ///
    /// The header must currently carry an address.
    #[must_use]
    pub unsafe fn link(self) -> usize {
        let hdr = unsafe { self.header() };
        debug_assert!(contains_forwarding_ptr(hdr));
        header_address(hdr)
    }

    /// Replaces the header with a forwarding pointer to `target`.
    ///
    /// # Safety
    ///
    /// Same as [`CellPtr::set_header`]. The caller must have cleared the
    /// cell's bitmap bit first so the header reads as a true forwarding
    /// pointer, and `target` must carry a normal length word.
    pub unsafe fn set_forwarding(self, target: CellPtr) {
        unsafe { self.set_link(target.addr()) };
    }

    /// Target of a forwarding pointer.
    ///
    /// # Safety
    ///
    /// The header must be a forwarding pointer (not a chain link, whose
    /// address may be 0).
    #[must_use]
    pub unsafe fn forwarding(self) -> CellPtr {
        CellPtr::from_addr(unsafe { self.link() })
    }

    /// Restores a normal length word.
    ///
    /// # Safety
    ///
    /// Same as [`CellPtr::set_header`]; once restored, a header must never
    /// be turned back into a chain link within the same collection.
    pub unsafe fn set_length_word(self, hdr: usize) {
        debug_assert!(is_normal_length(hdr));
        unsafe { self.set_header(hdr) };
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellPtr({:#x})", self.addr())
    }
}
