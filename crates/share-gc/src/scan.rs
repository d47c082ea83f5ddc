//! Post-order traversal of the live pointer graph.
//!
//! The scan starts from root slots (and from whole code/permanent regions)
//! and visits every reachable cell in the local heap exactly once, marking
//! its bitmap bit on first contact. The sink's completion callback fires in
//! post-order: by the time a cell is reported, every cell it points into has
//! already been reported. The recursion is driven by an explicit frame stack
//! so arbitrarily deep structures cannot overflow the thread stack.
//!
//! Root slots are resolved through forwarding pointers left behind by an
//! earlier, interrupted collection, and the slot is updated in place with
//! the final address.
//!
//! The scan phase is producer-only: nothing clears bits concurrently, so
//! bitmap reads and writes here take no lock.

use crate::header::{
    contains_forwarding_ptr, header_address, header_flags, header_length, is_data_ptr,
    is_normal_length, CellPtr,
};
use crate::heap::{Heap, Region};

/// Completion callback for the scan.
pub(crate) trait ScanSink {
    /// Called once per visited local cell, after every cell it points into.
    fn completed(&mut self, cell: CellPtr);
}

struct Frame {
    cell: CellPtr,
    len: usize,
    idx: usize,
    scan_fields: bool,
}

/// One traversal over the live graph.
pub(crate) struct HeapScan<'a, S> {
    heap: &'a Heap,
    sink: &'a mut S,
    stack: Vec<Frame>,
    /// Cells visited so far.
    pub visited: usize,
    /// Their total size in words, headers included.
    pub visited_words: usize,
}

impl<'a, S: ScanSink> HeapScan<'a, S> {
    pub fn new(heap: &'a Heap, sink: &'a mut S) -> Self {
        Self {
            heap,
            sink,
            stack: Vec::new(),
            visited: 0,
            visited_words: 0,
        }
    }

    /// Scans one root slot, updating it in place through any forwarding.
    ///
    /// Non-pointer words and addresses outside the local heap are ignored.
    pub fn scan_root(&mut self, slot: *mut usize) {
        if self.consider(slot) {
            self.drain();
        }
    }

    /// Scans every pointer field of every cell in a code or permanent
    /// region. The region's own cells are roots, never candidates.
    pub fn scan_region(&mut self, region: &Region) {
        let base = region.base_ptr();
        let allocated = region.allocated_words();
        let mut off = 0;
        while off < allocated {
            // SAFETY: regions are bump-allocated runs of well-formed cells;
            // off always lands on a header word below the bump limit.
            let hdr = unsafe { base.add(off).read() };
            debug_assert!(is_normal_length(hdr), "region cell has no length word");
            let len = header_length(hdr);
            if !header_flags(hdr).is_byte() {
                for i in 0..len {
                    // SAFETY: slot i lies inside the cell's payload.
                    let slot = unsafe { base.add(off + 1 + i) };
                    self.scan_root(slot);
                }
            }
            off += len + 1;
        }
    }

    /// Resolves `*slot` and schedules the target if it is a fresh local
    /// cell. Returns whether a new frame was pushed.
    fn consider(&mut self, slot: *mut usize) -> bool {
        loop {
            // SAFETY: the caller hands in slots within live cells, regions
            // or root tables.
            let w = unsafe { slot.read() };
            if !is_data_ptr(w) {
                return false;
            }
            let cell = CellPtr::from_addr(w);
            let Some(space) = self.heap.local_space_for(cell.header_addr()) else {
                // Permanent data, code, or not a pointer at all.
                return false;
            };
            if space.bitmap().test(space.word_no(cell.header_addr())) {
                // Already scheduled; its header may be a chain link by now,
                // which must not be mistaken for forwarding.
                return false;
            }
            // SAFETY: the header word lies in the same space as the cell.
            let hdr = unsafe { cell.header() };
            if contains_forwarding_ptr(hdr) {
                // Left over from an interrupted minor collection.
                // SAFETY: slot validity as above.
                unsafe { slot.write(header_address(hdr)) };
                continue;
            }

            space.bitmap().set(space.word_no(cell.header_addr()));
            self.visited += 1;
            self.visited_words += header_length(hdr) + 1;
            self.stack.push(Frame {
                cell,
                len: header_length(hdr),
                idx: 0,
                scan_fields: !header_flags(hdr).is_byte(),
            });
            return true;
        }
    }

    /// Runs scheduled frames to exhaustion, reporting completions in
    /// post-order.
    fn drain(&mut self) {
        while !self.stack.is_empty() {
            let next_slot = {
                let frame = self.stack.last_mut().expect("scan stack is non-empty");
                if frame.scan_fields && frame.idx < frame.len {
                    // SAFETY: idx is below the cell's length.
                    let slot = unsafe { frame.cell.slot(frame.idx) };
                    frame.idx += 1;
                    Some(slot)
                } else {
                    None
                }
            };
            match next_slot {
                Some(slot) => {
                    self.consider(slot);
                }
                None => {
                    let frame = self.stack.pop().expect("scan stack is non-empty");
                    self.sink.completed(frame.cell);
                }
            }
        }
    }
}
