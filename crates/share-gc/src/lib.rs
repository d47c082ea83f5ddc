//! Parallel heap-data sharing for a mark-and-compact garbage collector.
//!
//! When heap space runs very short, a collector can buy room by merging
//! immutable cells whose contents are bit-identical, transitively through
//! their pointer fields. This crate implements that pass: it scans the live
//! graph, chains small immutable cells into per-(kind, length) sort vectors
//! threaded through the cells' own header words, and merges duplicates by
//! hash-partitioned intrusive quicksort. Losing cells are left carrying
//! forwarding pointers for the following compaction to consume; the pass
//! itself frees nothing and allocates nothing proportional to the heap.
//!
//! Byte cells settle in a single round. Word cells are processed tails
//! first over repeated rounds, since a cell can only be compared once the
//! cells it points to have settled; a progress heuristic cuts the loop off
//! when reference cycles stall it, and a final round merges whatever is
//! still bit-identical as it stands.
//!
//! # Quick start
//!
//! ```
//! use share_gc::heap::{Heap, RootTable};
//! use share_gc::{run_sharing_pass, ShareConfig};
//!
//! let mut heap = Heap::new();
//! heap.add_local_space(64 * 1024).unwrap();
//!
//! let mut roots = RootTable::new();
//! for _ in 0..2 {
//!     let cell = heap.alloc_bytes(b"duplicate").unwrap();
//!     roots.push_cell(cell);
//! }
//!
//! let stats = run_sharing_pass(&heap, &mut roots, &ShareConfig::with_threads(2));
//! assert_eq!(stats.total_shared, 1);
//! assert_eq!(stats.words_recovered, 3); // two payload words plus a header
//! ```
//!
//! # Concurrency
//!
//! Phases are separated by task-farm barriers. Within a round, every sort
//! vector is driven by at most one task, and bucket-sorting tasks own
//! disjoint chains. The single cross-task hazard is a pointer-field
//! rewrite racing a header read; that is benign by construction, because a
//! chain-link header only ever becomes a forwarding pointer or a normal
//! length word and both of those are final.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bitmap;
pub mod header;
pub mod heap;

mod farm;
mod scan;
mod share;
mod sort;
mod stats;

pub use farm::{FarmHandle, TaskFarm};
pub use header::{CellFlags, CellPtr};
pub use heap::{Heap, HeapError, RootTable};
pub use share::{run_sharing_pass, ShareConfig};
pub use stats::{ShareStats, SizeClassStats};
