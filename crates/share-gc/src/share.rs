//! The sharing pass: classification and the phase driver.
//!
//! The pass runs when the heap-sizing policy decides free space is short
//! enough to justify it. It scans the live graph, buckets small immutable
//! cells by kind and length, then merges bit-identical cells so a later
//! compaction can reclaim the losers' space.
//!
//! Phases, separated by task-farm barriers:
//!
//! 1. byte cells are hashed and merged in one round (no pointers inside);
//! 2. word cells go through repeated rounds, each processing the cells
//!    whose pointed-to cells have already been dealt with ("tails first"),
//!    until a progress heuristic says further rounds will not pay;
//! 3. a final bitwise round over whatever remains, cycle members included.

use std::time::Instant;

use tracing::debug;

use crate::farm::{FarmHandle, SendRef, TaskFarm};
use crate::header::{header_flags, header_length, length_word, CellFlags, CellPtr};
use crate::heap::{Heap, RootTable};
use crate::scan::{HeapScan, ScanSink};
use crate::sort::SortVector;
use crate::stats::{percent, ShareStats, SizeClassStats};

/// Byte cells of fewer than this many words are candidates. Byte cells
/// include strings, so comparatively large ones still share well.
const NUM_BYTE_VECTORS: usize = 23;

/// Word cells of fewer than this many words are candidates. Word cells
/// that share are mostly 2 or 3 words.
const NUM_WORD_VECTORS: usize = 11;

/// Configuration for one run of the sharing pass.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// Worker threads for the parallel phases. Zero runs every task inline
    /// on the calling thread, which makes phase order deterministic.
    pub gc_threads: usize,
}

impl ShareConfig {
    /// Configuration with an explicit thread count.
    #[must_use]
    pub fn with_threads(gc_threads: usize) -> Self {
        Self { gc_threads }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            gc_threads: TaskFarm::default_threads(),
        }
    }
}

/// Sort vectors plus classification counters.
struct Sharer {
    byte_vectors: Vec<SortVector>,
    word_vectors: Vec<SortVector>,
    byte_added: usize,
    word_added: usize,
    large_byte: usize,
    large_word: usize,
    excluded: usize,
}

impl Sharer {
    fn new() -> Self {
        Self {
            byte_vectors: (0..NUM_BYTE_VECTORS)
                .map(|len| SortVector::new(length_word(len, CellFlags::BYTE)))
                .collect(),
            word_vectors: (0..NUM_WORD_VECTORS)
                .map(|len| SortVector::new(length_word(len, CellFlags::NONE)))
                .collect(),
            byte_added: 0,
            word_added: 0,
            large_byte: 0,
            large_word: 0,
            excluded: 0,
        }
    }
}

impl ScanSink for Sharer {
    /// Buckets a completed cell, or counts why it cannot be bucketed.
    ///
    /// Only cells whose header carries no flag beyond BYTE are eligible:
    /// the chain link overwrites the whole header, so any other flag bit
    /// (code, mutable, the long-integer sign) would be lost.
    fn completed(&mut self, cell: CellPtr) {
        // SAFETY: the scan completes only live local cells, which still
        // carry their normal length word at this point.
        let hdr = unsafe { cell.header() };
        let flags = header_flags(hdr);
        let len = header_length(hdr);
        if flags == CellFlags::NONE {
            if len < NUM_WORD_VECTORS {
                self.word_vectors[len].add(cell);
            } else {
                self.large_word += 1;
            }
            self.word_added += 1;
        } else if flags == CellFlags::BYTE {
            if len < NUM_BYTE_VECTORS {
                self.byte_vectors[len].add(cell);
            } else {
                self.large_byte += 1;
            }
            self.byte_added += 1;
        } else if flags.is_code() || flags.is_mutable() {
            self.excluded += 1;
        } else if flags.is_byte() {
            self.large_byte += 1;
        } else {
            self.large_word += 1;
        }
    }
}

fn submit_hash_and_sort(handle: &FarmHandle, heap: &Heap, vector: &SortVector) {
    let heap = SendRef::new(heap);
    let vector = SendRef::new(vector);
    let inner = handle.clone();
    handle.submit(move || {
        // SAFETY: the driver waits for farm completion before the heap and
        // vector borrows end.
        unsafe { vector.get() }.hash_and_sort_all(unsafe { heap.get() }, &inner);
    });
}

fn submit_word_pass(handle: &FarmHandle, heap: &Heap, vector: &SortVector) {
    let heap = SendRef::new(heap);
    let vector = SendRef::new(vector);
    let inner = handle.clone();
    handle.submit(move || {
        // SAFETY: as in submit_hash_and_sort.
        unsafe { vector.get() }.word_data_pass(unsafe { heap.get() }, &inner);
    });
}

/// Runs the sharing pass over `heap` from the given roots.
///
/// On return every reachable cell either carries its original length word
/// or a forwarding pointer to the bit-identical representative that
/// replaced it. Root slots are updated in place only when they held stale
/// forwarding left by an earlier collection; references to cells merged by
/// this run resolve through one forwarding hop until compaction.
///
/// The returned [`ShareStats::words_recovered`] is the input to the heap
/// sizing model.
pub fn run_sharing_pass(heap: &Heap, roots: &mut RootTable, config: &ShareConfig) -> ShareStats {
    let farm = TaskFarm::new(config.gc_threads);
    let handle = farm.handle();
    let mut stats = ShareStats::default();

    for space in heap.local_spaces() {
        space.bitmap().clear_all();
    }

    let mut sharer = Sharer::new();
    let scan_started = Instant::now();
    {
        let mut scan = HeapScan::new(heap, &mut sharer);

        // Constants embedded in code first, then permanent mutable areas
        // that may hold pointers, then the runtime's own roots.
        for code in heap.code_spaces() {
            scan.scan_region(code.region());
        }
        debug!(
            visited = scan.visited,
            words = scan.visited_words,
            "scanned code constants"
        );

        for perm in heap.permanent_spaces() {
            if perm.is_mutable() && !perm.is_byte_only() {
                scan.scan_region(perm.region());
            }
        }
        debug!(
            visited = scan.visited,
            words = scan.visited_words,
            "scanned permanent areas"
        );

        for slot in roots.slots_mut() {
            scan.scan_root(slot);
        }
        debug!(
            visited = scan.visited,
            words = scan.visited_words,
            "scanned runtime roots"
        );

        stats.cells_visited = scan.visited;
        stats.words_visited = scan.visited_words;
    }
    stats.scan_duration = scan_started.elapsed();

    let merge_started = Instant::now();

    // Byte cells contain no pointers; one round settles them all.
    for vector in &sharer.byte_vectors {
        if vector.current_count() != 0 {
            submit_hash_and_sort(&handle, heap, vector);
        }
    }
    farm.wait_for_completion();

    // Word rounds, tails first: a round can only place cells whose pointer
    // fields all reach settled cells. Reference loops never settle, so
    // progress eventually stalls and the remainder goes to the final round.
    let mut last_count: usize = sharer
        .word_vectors
        .iter()
        .map(SortVector::current_count)
        .sum();
    let mut last_shared: usize = 0;
    let mut pass = 1usize;
    while last_count != 0 {
        for vector in &sharer.word_vectors {
            if vector.current_count() != 0 {
                submit_word_pass(&handle, heap, vector);
            }
        }
        farm.wait_for_completion();
        stats.word_passes += 1;

        let mut post_count = 0;
        let mut post_shared = 0;
        let mut carry_over = 0;
        for vector in &sharer.word_vectors {
            post_count += vector.current_count();
            post_shared += vector.shared();
            carry_over += vector.carry_over();
        }
        let removed = last_count - post_count;
        debug!(
            pass,
            removed,
            removed_percent = percent(removed, last_count),
            shared = post_shared - last_shared,
            remaining = post_count,
            carry_over,
            "word round"
        );

        // Removing under 10% of the remainder is not worth another round
        // unless the carry-over shows deep structures still resolving, and
        // under 0.1% never is. The first round only carries over byte
        // sharing, so at least two rounds always run.
        if pass > 1
            && removed * 10 < last_count
            && (carry_over * 2 < removed || removed * 1000 < last_count)
        {
            break;
        }
        last_count = post_count;
        last_shared = post_shared;
        pass += 1;
    }

    // Whatever is left points into loops (or starved behind them); merge
    // the bit-identical remainder as it stands.
    let remaining: usize = sharer
        .word_vectors
        .iter()
        .map(SortVector::current_count)
        .sum();
    for vector in &sharer.word_vectors {
        if vector.current_count() != 0 {
            stats.final_pass_vectors += 1;
            submit_hash_and_sort(&handle, heap, vector);
        }
    }
    farm.wait_for_completion();
    stats.merge_duration = merge_started.elapsed();

    let post_shared: usize = sharer.word_vectors.iter().map(SortVector::shared).sum();
    debug!(
        remaining,
        shared = post_shared - last_shared,
        "final word round"
    );

    stats.byte_candidates = sharer.byte_added;
    stats.word_candidates = sharer.word_added;
    stats.large_byte = sharer.large_byte;
    stats.large_word = sharer.large_word;
    stats.excluded = sharer.excluded;
    for vector in &sharer.byte_vectors {
        let class = SizeClassStats {
            length: vector.length(),
            total: vector.total_count(),
            shared: vector.shared(),
        };
        stats.total_objects += class.total;
        stats.total_shared += class.shared;
        stats.words_recovered += class.shared * (class.length + 1);
        stats.byte_sizes.push(class);
    }
    for vector in &sharer.word_vectors {
        let class = SizeClassStats {
            length: vector.length(),
            total: vector.total_count(),
            shared: vector.shared(),
        };
        stats.total_objects += class.total;
        stats.total_shared += class.shared;
        stats.words_recovered += class.shared * (class.length + 1);
        stats.word_sizes.push(class);
    }
    stats.log();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{contains_forwarding_ptr, is_normal_length, tag_int};

    fn classify(heap: &Heap, sharer: &mut Sharer, cell: CellPtr) {
        let space = heap.local_space_for(cell.header_addr()).unwrap();
        space.bitmap().set(space.word_no(cell.header_addr()));
        sharer.completed(cell);
    }

    #[test]
    fn test_classifier_buckets_eligible_cells() {
        let mut heap = Heap::new();
        heap.add_local_space(4096).unwrap();
        let mut sharer = Sharer::new();

        let word = heap.alloc_words(CellFlags::NONE, &[tag_int(1), tag_int(2)]).unwrap();
        let byte = heap.alloc_bytes(b"hello").unwrap();
        classify(&heap, &mut sharer, word);
        classify(&heap, &mut sharer, byte);

        assert_eq!(sharer.word_vectors[2].current_count(), 1);
        assert_eq!(sharer.byte_vectors[1].current_count(), 1);
        assert_eq!(sharer.word_added, 1);
        assert_eq!(sharer.byte_added, 1);
        assert_eq!(sharer.excluded, 0);

        // Bucketed cells now carry chain links.
        unsafe {
            assert!(contains_forwarding_ptr(word.header()));
            assert!(contains_forwarding_ptr(byte.header()));
        }
    }

    #[test]
    fn test_classifier_excludes_code_and_mutable() {
        let mut heap = Heap::new();
        heap.add_local_space(4096).unwrap();
        let mut sharer = Sharer::new();

        let mutable = heap
            .alloc_words(CellFlags::MUTABLE, &[tag_int(1)])
            .unwrap();
        let code = heap.alloc_words(CellFlags::CODE, &[tag_int(1)]).unwrap();
        classify(&heap, &mut sharer, mutable);
        classify(&heap, &mut sharer, code);

        assert_eq!(sharer.excluded, 2);
        assert_eq!(sharer.word_added, 0);
        assert_eq!(sharer.byte_added, 0);
        // Headers untouched: excluded cells are never chained.
        unsafe {
            assert!(is_normal_length(mutable.header()));
            assert!(is_normal_length(code.header()));
        }
    }

    #[test]
    fn test_classifier_counts_oversize_cells() {
        let mut heap = Heap::new();
        heap.add_local_space(4096).unwrap();
        let mut sharer = Sharer::new();

        let big_word = heap
            .alloc_words(CellFlags::NONE, &vec![tag_int(0); NUM_WORD_VECTORS])
            .unwrap();
        let big_byte = heap
            .alloc_bytes(&vec![7u8; NUM_BYTE_VECTORS * crate::header::WORD_BYTES])
            .unwrap();
        classify(&heap, &mut sharer, big_word);
        classify(&heap, &mut sharer, big_byte);

        assert_eq!(sharer.large_word, 1);
        assert_eq!(sharer.large_byte, 1);
        // Still counted as candidates of their kind.
        assert_eq!(sharer.word_added, 1);
        assert_eq!(sharer.byte_added, 1);
        unsafe {
            assert!(is_normal_length(big_word.header()));
            assert!(is_normal_length(big_byte.header()));
        }
    }

    #[test]
    fn test_classifier_counts_unusual_flags() {
        let mut heap = Heap::new();
        heap.add_local_space(4096).unwrap();
        let mut sharer = Sharer::new();

        // A negative long-precision integer: byte data plus the sign bit.
        let negative = heap
            .alloc_words(CellFlags::BYTE | CellFlags::NEGATIVE, &[1])
            .unwrap();
        classify(&heap, &mut sharer, negative);

        assert_eq!(sharer.large_byte, 1);
        assert_eq!(sharer.excluded, 0);
        assert_eq!(sharer.byte_added, 0);
        unsafe { assert!(is_normal_length(negative.header())) };
    }
}
