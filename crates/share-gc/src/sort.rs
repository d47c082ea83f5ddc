//! Sort vectors: per-(kind, length) containers of cells awaiting merging.
//!
//! Cells of one kind and length are threaded into intrusive lists through
//! their own header words, so the pass costs no memory proportional to the
//! number of candidates. A vector hash-partitions its base list into 256
//! buckets by an additive byte hash, then quicksorts each bucket chain in
//! place: cells comparing equal to the pivot are merged into it, the rest
//! are partitioned and sorted recursively (recursing into the smaller side
//! to bound stack depth).
//!
//! Word vectors additionally run a partitioning pre-pass per round: a cell
//! whose field still points at a chained cell is deferred to the next
//! round; a field pointing at a merged cell is rewritten to the winner
//! first (counted as carry-over).
//!
//! Length words are updated without locks. Every header in a vector starts
//! as a chain link, and a chain link only ever becomes another chain link,
//! a forwarding pointer or a normal length word; the latter two are final.
//! A stale read can at worst defer a cell by one round and lose a little
//! sharing to a race; it can never merge unequal cells.

use std::cmp::Ordering as CmpOrdering;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::farm::{FarmHandle, SendRef};
use crate::header::{header_length, is_data_ptr, is_normal_length, CellPtr, WORD_BYTES};
use crate::heap::Heap;

/// Number of hash buckets per vector.
const HASH_BUCKETS: usize = 256;

/// What a pointer field's target currently is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ObjectState {
    /// A cell carrying a normal length word, or anything outside the local
    /// heap: safe to compare against.
    Real,
    /// Merged into another cell; the header holds the winner's address.
    Forwarded,
    /// Still threaded on some vector's list, awaiting processing.
    Chained,
}

/// Classifies a pointer target.
///
/// The header is peeked without the space lock first: a normal length word
/// is final, so that answer needs no lock. Only the chain-versus-forwarding
/// distinction consults the bitmap under the lock.
pub(crate) fn object_state(heap: &Heap, cell: CellPtr) -> ObjectState {
    let Some(space) = heap.local_space_for(cell.header_addr()) else {
        return ObjectState::Real;
    };
    // SAFETY: the cell lies in a live local space.
    if is_normal_length(unsafe { cell.header() }) {
        return ObjectState::Real;
    }
    let bit = space.word_no(cell.header_addr());
    let _guard = space.lock();
    if space.bitmap().test(bit) {
        ObjectState::Chained
    } else {
        ObjectState::Forwarded
    }
}

/// Merges `loser` into `winner`: clears the loser's chain bit and plants a
/// forwarding pointer. References to the loser resolve to the winner from
/// here on; a later compaction reclaims the loser's words.
pub(crate) fn share_with(heap: &Heap, loser: CellPtr, winner: CellPtr) {
    let space = heap
        .local_space_for(loser.header_addr())
        .expect("merged cell must lie in a local space");
    let bit = space.word_no(loser.header_addr());
    let _guard = space.lock();
    assert!(space.bitmap().test(bit), "merged cell is not on a chain");
    space.bitmap().clear(bit);
    // With the bit clear the tagged header now reads as true forwarding.
    // SAFETY: loser is a live cell exclusively owned by this bucket's task.
    unsafe { loser.set_forwarding(winner) };
}

/// Additive byte hash over a cell's payload.
fn content_hash(cell: CellPtr, words: usize) -> u8 {
    // SAFETY: the cell spans `words` payload words in a live space.
    let bytes = unsafe { slice::from_raw_parts(cell.addr() as *const u8, words * WORD_BYTES) };
    bytes.iter().fold(0u8, |h, b| h.wrapping_add(*b))
}

/// Bitwise payload comparison; any total order works for the partition.
fn content_cmp(a: CellPtr, b: CellPtr, bytes: usize) -> CmpOrdering {
    // SAFETY: both cells span `bytes` payload bytes in live spaces.
    let a = unsafe { slice::from_raw_parts(a.addr() as *const u8, bytes) };
    let b = unsafe { slice::from_raw_parts(b.addr() as *const u8, bytes) };
    a.cmp(b)
}

/// One intrusive chain with its counters.
struct ObjEntry {
    /// Address of the first cell, 0 when empty.
    head: AtomicUsize,
    count: AtomicUsize,
    shared: AtomicUsize,
}

impl ObjEntry {
    fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            shared: AtomicUsize::new(0),
        }
    }

    /// Prepends a cell, threading the old head through its header.
    fn push(&self, cell: CellPtr) {
        let old = self.head.load(Ordering::Relaxed);
        // SAFETY: the cell is exclusively owned by the pushing phase.
        unsafe { cell.set_link(old) };
        self.head.store(cell.addr(), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Empties the chain, returning its head.
    fn take(&self) -> usize {
        self.count.store(0, Ordering::Relaxed);
        self.head.swap(0, Ordering::Relaxed)
    }

    fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

/// All cells of one (kind, length) combination.
///
/// A vector is driven by at most one phase task per round; the per-bucket
/// sorting it fans out touches disjoint chains, so the only cross-task
/// traffic is the counters, which are atomic.
pub(crate) struct SortVector {
    base: ObjEntry,
    buckets: Box<[ObjEntry]>,
    total: AtomicUsize,
    /// The length word every cell of this vector gets back on restoration.
    length_word: usize,
    carry_over: AtomicUsize,
}

impl SortVector {
    pub(crate) fn new(length_word: usize) -> Self {
        Self {
            base: ObjEntry::new(),
            buckets: (0..HASH_BUCKETS).map(|_| ObjEntry::new()).collect(),
            total: AtomicUsize::new(0),
            length_word,
            carry_over: AtomicUsize::new(0),
        }
    }

    /// Payload length of this vector's cells, in words.
    pub(crate) fn length(&self) -> usize {
        header_length(self.length_word)
    }

    /// Adds a freshly scanned cell, overwriting its header with a chain
    /// link. The cell's bitmap bit must already be set.
    pub(crate) fn add(&self, cell: CellPtr) {
        self.base.push(cell);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Cells ever added.
    pub(crate) fn total_count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Cells currently awaiting processing on the base list.
    pub(crate) fn current_count(&self) -> usize {
        self.base.count.load(Ordering::Relaxed)
    }

    /// Cells merged away so far.
    pub(crate) fn shared(&self) -> usize {
        let mut n = self.base.shared.load(Ordering::Relaxed);
        for bucket in &*self.buckets {
            n += bucket.shared.load(Ordering::Relaxed);
        }
        n
    }

    /// Cells whose fields were rewritten to a winner this round.
    pub(crate) fn carry_over(&self) -> usize {
        self.carry_over.load(Ordering::Relaxed)
    }

    /// Hashes every base cell into the buckets and sorts them.
    ///
    /// Used for byte cells (which cannot contain pointers) and as the final
    /// best-effort pass over word cells that never became ready.
    pub(crate) fn hash_and_sort_all(&self, heap: &Heap, farm: &FarmHandle) {
        for bucket in &*self.buckets {
            bucket.reset();
        }
        let words = self.length();
        let mut h = self.base.take();
        while h != 0 {
            let cell = CellPtr::from_addr(h);
            // SAFETY: cells on the base list carry chain-link headers.
            let next = unsafe { cell.link() };
            self.buckets[content_hash(cell, words) as usize].push(cell);
            h = next;
        }
        self.sort_data(heap, farm);
    }

    /// One round over a word vector: defers cells that still point at
    /// chained cells, rewrites fields that point at winners, and hashes
    /// whatever became ready.
    pub(crate) fn word_data_pass(&self, heap: &Heap, farm: &FarmHandle) {
        let mut h = self.base.take();
        if h == 0 {
            return;
        }
        let words = self.length();
        self.carry_over.store(0, Ordering::Relaxed);
        for bucket in &*self.buckets {
            bucket.reset();
        }

        while h != 0 {
            let cell = CellPtr::from_addr(h);
            // SAFETY: cells on the base list carry chain-link headers.
            let next = unsafe { cell.link() };
            let mut deferred = false;
            for i in 0..words {
                // SAFETY: i is below the cell's length.
                let w = unsafe { cell.get(i) };
                if !is_data_ptr(w) {
                    continue;
                }
                let target = CellPtr::from_addr(w);
                match object_state(heap, target) {
                    ObjectState::Forwarded => {
                        // SAFETY: forwarding headers are final once set.
                        unsafe { cell.set(i, target.link()) };
                        self.carry_over.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    ObjectState::Chained => {
                        deferred = true;
                        break;
                    }
                    ObjectState::Real => {}
                }
            }
            if deferred {
                self.base.push(cell);
            } else {
                self.buckets[content_hash(cell, words) as usize].push(cell);
            }
            h = next;
        }
        self.sort_data(heap, farm);
    }

    /// Processes each bucket: trivial sizes inline, larger chains as
    /// parallel sorting tasks.
    fn sort_data(&self, heap: &Heap, farm: &FarmHandle) {
        let bytes = self.length() * WORD_BYTES;
        for (index, bucket) in self.buckets.iter().enumerate() {
            match bucket.count.load(Ordering::Relaxed) {
                0 => {}
                1 => {
                    let cell = CellPtr::from_addr(bucket.head.load(Ordering::Relaxed));
                    // Nothing to compare against this round.
                    // SAFETY: the cell is owned by this vector's task.
                    unsafe { cell.set_length_word(self.length_word) };
                }
                2 => {
                    let first = CellPtr::from_addr(bucket.head.load(Ordering::Relaxed));
                    // SAFETY: both cells are owned by this vector's task.
                    let second = CellPtr::from_addr(unsafe { first.link() });
                    unsafe { first.set_length_word(self.length_word) };
                    if content_cmp(first, second, bytes) == CmpOrdering::Equal {
                        share_with(heap, second, first);
                        bucket.shared.fetch_add(1, Ordering::Relaxed);
                    } else {
                        unsafe { second.set_length_word(self.length_word) };
                    }
                }
                n => {
                    let vector = SendRef::new(self);
                    let heap = SendRef::new(heap);
                    let head = bucket.head.load(Ordering::Relaxed);
                    farm.submit(move || {
                        // SAFETY: the driver's phase barrier keeps the
                        // vector and heap borrows live past this task.
                        let vector = unsafe { vector.get() };
                        let heap = unsafe { heap.get() };
                        vector.sort_list(heap, head, n, index);
                    });
                }
            }
        }
    }

    /// Intrusive quicksort of one bucket chain.
    ///
    /// The head cell is the pivot of each round; cells equal to it merge
    /// into it, the rest split into two chains. The smaller side recurses,
    /// the larger continues iteratively.
    fn sort_list(&self, heap: &Heap, mut head: usize, mut items: usize, bucket: usize) {
        let bytes = self.length() * WORD_BYTES;
        let entry = &self.buckets[bucket];

        while items > 2 {
            let pivot = CellPtr::from_addr(head);
            // SAFETY: every cell on the chain carries a chain-link header
            // and is owned by this task.
            head = unsafe { pivot.link() };
            unsafe { pivot.set_length_word(self.length_word) };

            let (mut less, mut greater) = (0usize, 0usize);
            let (mut less_n, mut greater_n) = (0usize, 0usize);
            let mut h = head;
            while h != 0 {
                let cell = CellPtr::from_addr(h);
                let next = unsafe { cell.link() };
                match content_cmp(cell, pivot, bytes) {
                    CmpOrdering::Equal => {
                        share_with(heap, cell, pivot);
                        entry.shared.fetch_add(1, Ordering::Relaxed);
                    }
                    CmpOrdering::Less => {
                        unsafe { cell.set_link(less) };
                        less = cell.addr();
                        less_n += 1;
                    }
                    CmpOrdering::Greater => {
                        unsafe { cell.set_link(greater) };
                        greater = cell.addr();
                        greater_n += 1;
                    }
                }
                h = next;
            }

            if less_n < greater_n {
                self.sort_list(heap, less, less_n, bucket);
                head = greater;
                items = greater_n;
            } else {
                self.sort_list(heap, greater, greater_n, bucket);
                head = less;
                items = less_n;
            }
        }

        if items == 1 {
            // SAFETY: sole owner of the chain remnant.
            unsafe { CellPtr::from_addr(head).set_length_word(self.length_word) };
        } else if items == 2 {
            let first = CellPtr::from_addr(head);
            // SAFETY: as above.
            let second = CellPtr::from_addr(unsafe { first.link() });
            unsafe { first.set_length_word(self.length_word) };
            if content_cmp(first, second, bytes) == CmpOrdering::Equal {
                share_with(heap, second, first);
                entry.shared.fetch_add(1, Ordering::Relaxed);
            } else {
                unsafe { second.set_length_word(self.length_word) };
            }
        }
    }
}
