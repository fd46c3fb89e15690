//! Semispace copying collector for compiled L2 programs.
//!
//! The heap is a single word array split into two equal half-spaces; only
//! the current from-space is ever allocated into. `allocate` reserves
//! `n + 1` words and returns the address one word past the header, which
//! the caller (the emitted `new` sequence) stamps with the type's tag.
//! When from-space is exhausted the collector swaps spaces, walks the
//! mutator's stack through the saved-`%ebp` chain, forwards every root the
//! per-frame bitmaps mark, and Cheney-scans the copied objects.
//!
//! All addresses are 32-bit byte addresses in mutator terms: heap words
//! live at `HEAP_BASE` and up, and the stack is read and written through a
//! [`StackImage`] word buffer with its own base address. The low bit of a
//! header word is overloaded: 1 means a live header, 0 means the word has
//! been overwritten with a forwarding address. This works because every
//! object is word-aligned, so a real address always has its low bit clear.

use snafu::Snafu;

/// Bytes per heap word.
pub const WORD_BYTES: u32 = 4;

/// Byte address of the first heap word. Nonzero so that nil (0) is never a
/// valid object address.
pub const HEAP_BASE: u32 = 0x10000;

/// Raised when a collection cannot free enough space for an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("Out of memory."))]
pub struct OutOfMemoryError;

/// Statistics reported after each collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    pub live_objects: usize,
    pub live_words: usize,
}

/// Word-addressed view of the mutator's stack. The collector reads saved
/// frame pointers and bitmap words out of it and rewrites root slots in
/// place. Tests fabricate frames the same way the emitted prologues lay
/// them out.
pub struct StackImage {
    words: Vec<u32>,
    base: u32,
}

impl StackImage {
    pub fn new(base: u32, size_in_words: usize) -> Self {
        assert_eq!(base % WORD_BYTES, 0, "stack base must be word-aligned");
        StackImage {
            words: vec![0; size_in_words],
            base,
        }
    }

    fn index(&self, addr: u32) -> usize {
        assert_eq!(addr % WORD_BYTES, 0, "unaligned stack address {addr:#x}");
        let offset = addr
            .checked_sub(self.base)
            .unwrap_or_else(|| panic!("stack address {addr:#x} below base {:#x}", self.base));
        let index = (offset / WORD_BYTES) as usize;
        assert!(
            index < self.words.len(),
            "stack address {addr:#x} out of range"
        );
        index
    }

    pub fn read(&self, addr: u32) -> u32 {
        self.words[self.index(addr)]
    }

    pub fn write(&mut self, addr: u32, value: u32) {
        let index = self.index(addr);
        self.words[index] = value;
    }
}

/// The process-wide collector instance.
pub struct GcSemiSpace {
    heap: Vec<u32>,
    half_words: usize,
    /// Byte address of the half-space allocation currently happens in.
    from_base: u32,
    /// Byte address of the idle half-space.
    to_base: u32,
    /// Bump pointer: byte address of the next free word in from-space.
    alloc_ptr: u32,
    words_used: usize,
    /// Sentinel frame pointer: the frame immediately above `Entry`.
    base_frame: u32,
    stats: GcStats,
    report: Option<Box<dyn FnMut(GcStats)>>,
}

impl GcSemiSpace {
    /// `base_frame` is the frame pointer of the stack frame immediately
    /// above `Entry`; the stack walk stops when it reaches it.
    /// `heap_size_in_words` must be positive and even; each half-space
    /// gets half of it.
    pub fn new(base_frame: u32, heap_size_in_words: usize) -> Self {
        assert!(
            heap_size_in_words > 0 && heap_size_in_words % 2 == 0,
            "heap size must be a positive even number of words"
        );
        let half_words = heap_size_in_words / 2;
        GcSemiSpace {
            heap: vec![0; heap_size_in_words],
            half_words,
            from_base: HEAP_BASE,
            to_base: HEAP_BASE + (half_words as u32) * WORD_BYTES,
            alloc_ptr: HEAP_BASE,
            words_used: 0,
            base_frame,
            stats: GcStats::default(),
            report: None,
        }
    }

    /// Install a hook invoked with the statistics of every collection.
    pub fn set_report_hook(&mut self, hook: impl FnMut(GcStats) + 'static) {
        self.report = Some(Box::new(hook));
    }

    /// Statistics of the most recent collection.
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    fn word_index(&self, addr: u32) -> usize {
        assert_eq!(addr % WORD_BYTES, 0, "unaligned heap address {addr:#x}");
        let offset = addr
            .checked_sub(HEAP_BASE)
            .unwrap_or_else(|| panic!("heap address {addr:#x} below heap base"));
        let index = (offset / WORD_BYTES) as usize;
        assert!(index < self.heap.len(), "heap address {addr:#x} out of range");
        index
    }

    /// Read a heap word. Also used by the mutator side of the contract to
    /// load fields and headers.
    pub fn read_word(&self, addr: u32) -> u32 {
        self.heap[self.word_index(addr)]
    }

    /// Write a heap word. The emitted `new` sequence stores the header and
    /// zero-fills fields through this.
    pub fn write_word(&mut self, addr: u32, value: u32) {
        let index = self.word_index(addr);
        self.heap[index] = value;
    }

    /// Reserve `num_words + 1` words and return the address of the field
    /// region (one word past the header). The header word is left for the
    /// caller to initialize. Collects when from-space is exhausted and
    /// fails only if the live data plus the request still does not fit.
    pub fn allocate(
        &mut self,
        num_words: u32,
        frame_ptr: u32,
        stack: &mut StackImage,
    ) -> Result<u32, OutOfMemoryError> {
        let needed = num_words as usize + 1;
        if self.words_used + needed > self.half_words {
            self.collect(frame_ptr, stack);
            if self.words_used + needed > self.half_words {
                return Err(OutOfMemoryError);
            }
        }
        let object = self.alloc_ptr + WORD_BYTES;
        self.alloc_ptr += (needed as u32) * WORD_BYTES;
        self.words_used += needed;
        Ok(object)
    }

    /// Stop-the-world Cheney collection: swap half-spaces, forward every
    /// root the stack bitmaps mark, then scan the copied objects
    /// breadth-first forwarding their reference fields.
    pub fn collect(&mut self, frame_ptr: u32, stack: &mut StackImage) {
        std::mem::swap(&mut self.from_base, &mut self.to_base);
        self.alloc_ptr = self.from_base;
        self.words_used = 0;
        let mut live_objects = 0usize;

        // Walk frames from the allocation site up to the sentinel.
        let mut frame = frame_ptr;
        while frame != self.base_frame {
            let arg_info = stack.read(frame - 4);
            let local_info = stack.read(frame - 8);
            for i in 0..32 {
                if arg_info & (1 << i) != 0 {
                    let slot = frame + 8 + WORD_BYTES * i;
                    let forwarded = self.forward(stack.read(slot), &mut live_objects);
                    stack.write(slot, forwarded);
                }
            }
            for i in 0..32 {
                if local_info & (1 << i) != 0 {
                    let slot = frame - 12 - WORD_BYTES * i;
                    let forwarded = self.forward(stack.read(slot), &mut live_objects);
                    stack.write(slot, forwarded);
                }
            }
            frame = stack.read(frame);
        }

        // Cheney scan: the scan pointer chases the allocation pointer.
        let mut scan = self.from_base;
        while scan < self.alloc_ptr {
            let header = self.read_word(scan);
            assert!(header & 1 == 1, "forwarding pointer in to-space");
            let field_count = header >> 24;
            for i in 0..field_count {
                if header & (1 << (i + 1)) != 0 {
                    let field_addr = scan + WORD_BYTES + WORD_BYTES * i;
                    let forwarded = self.forward(self.read_word(field_addr), &mut live_objects);
                    self.write_word(field_addr, forwarded);
                }
            }
            scan += WORD_BYTES * (1 + field_count);
        }

        self.stats = GcStats {
            live_objects,
            live_words: self.words_used,
        };
        let stats = self.stats;
        if let Some(hook) = self.report.as_mut() {
            hook(stats);
        }
    }

    /// Forward one object pointer. Nil stays nil. A header with the low
    /// bit clear already holds the new address; otherwise the object is
    /// copied to the allocation pointer and its old header is overwritten
    /// with the forwarding address.
    fn forward(&mut self, ptr: u32, live_objects: &mut usize) -> u32 {
        if ptr == 0 {
            return 0;
        }
        let header = self.read_word(ptr - WORD_BYTES);
        if header & 1 == 0 {
            return header;
        }

        let total = 1 + (header >> 24);
        let dst = self.alloc_ptr;
        for i in 0..total {
            let word = self.read_word(ptr - WORD_BYTES + WORD_BYTES * i);
            self.write_word(dst + WORD_BYTES * i, word);
        }
        self.alloc_ptr += total * WORD_BYTES;
        self.words_used += total as usize;
        *live_objects += 1;

        let new_ptr = dst + WORD_BYTES;
        self.write_word(ptr - WORD_BYTES, new_ptr);
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const STACK_BASE: u32 = 0x1000;

    /// Tag for a one-int-field type: count 1, no reference bits, live.
    const ONE_INT_FIELD: u32 = 0x0100_0001;
    /// Tag for `struct Pair { int v; Pair next; }`: count 2, field 1 is a
    /// reference (bitmap bit 2), live.
    const PAIR_TAG: u32 = 0x0200_0005;

    /// A stack with a single mutator frame above the sentinel. Locals are
    /// at `fp - 12 - 4i`, arguments at `fp + 8 + 4i`.
    fn single_frame(local_info: u32, arg_info: u32) -> (StackImage, u32, u32) {
        let mut stack = StackImage::new(STACK_BASE, 64);
        let sentinel = STACK_BASE + 0xF8;
        let fp = STACK_BASE + 0xC0;
        stack.write(fp, sentinel);
        stack.write(fp - 4, arg_info);
        stack.write(fp - 8, local_info);
        (stack, fp, sentinel)
    }

    fn alloc_pair(gc: &mut GcSemiSpace, stack: &mut StackImage, fp: u32, v: u32, next: u32) -> u32 {
        let p = gc.allocate(2, fp, stack).unwrap();
        gc.write_word(p - 4, PAIR_TAG);
        gc.write_word(p, v);
        gc.write_word(p + 4, next);
        p
    }

    #[test]
    fn allocation_returns_the_word_past_the_header() {
        let (mut stack, fp, sentinel) = single_frame(0, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);
        let p = gc.allocate(1, fp, &mut stack).unwrap();
        assert_eq!(p, HEAP_BASE + 4);
        let q = gc.allocate(1, fp, &mut stack).unwrap();
        assert_eq!(q, HEAP_BASE + 12);
    }

    #[test]
    fn collection_with_no_roots_reclaims_everything() {
        let (mut stack, fp, sentinel) = single_frame(0, 0);
        // Half-space of 2 words: each one-field object fills it.
        let mut gc = GcSemiSpace::new(sentinel, 4);

        let p1 = gc.allocate(1, fp, &mut stack).unwrap();
        gc.write_word(p1 - 4, ONE_INT_FIELD);

        // Exhausted; the next allocation collects and succeeds.
        let p2 = gc.allocate(1, fp, &mut stack).unwrap();
        gc.write_word(p2 - 4, ONE_INT_FIELD);
        assert_eq!(gc.stats(), GcStats { live_objects: 0, live_words: 0 });

        // And again: a third allocation collects the second object away.
        let p3 = gc.allocate(1, fp, &mut stack).unwrap();
        gc.write_word(p3 - 4, ONE_INT_FIELD);
        assert_eq!(gc.stats(), GcStats { live_objects: 0, live_words: 0 });
    }

    #[test]
    fn retained_root_forces_out_of_memory() {
        let (mut stack, fp, sentinel) = single_frame(1, 0);
        let mut gc = GcSemiSpace::new(sentinel, 4);

        let p1 = gc.allocate(1, fp, &mut stack).unwrap();
        gc.write_word(p1 - 4, ONE_INT_FIELD);
        gc.write_word(p1, 41);
        // Root the object through local slot 0.
        stack.write(fp - 12, p1);

        // The live object survives the collection, leaving no room.
        let err = gc.allocate(1, fp, &mut stack).unwrap_err();
        assert_eq!(err, OutOfMemoryError);
        assert_eq!(gc.stats(), GcStats { live_objects: 1, live_words: 2 });

        // The root slot was rewritten to the copy, contents intact.
        let moved = stack.read(fp - 12);
        assert_ne!(moved, p1);
        assert_eq!(gc.read_word(moved), 41);
    }

    #[test]
    fn forwarding_preserves_object_graphs() {
        let (mut stack, fp, sentinel) = single_frame(1, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);

        let a = alloc_pair(&mut gc, &mut stack, fp, 7, 0);
        let b = alloc_pair(&mut gc, &mut stack, fp, 9, a);
        stack.write(fp - 12, b);

        gc.collect(fp, &mut stack);
        assert_eq!(gc.stats(), GcStats { live_objects: 2, live_words: 6 });

        let b2 = stack.read(fp - 12);
        assert_eq!(gc.read_word(b2 - 4), PAIR_TAG);
        assert_eq!(gc.read_word(b2), 9);
        let a2 = gc.read_word(b2 + 4);
        assert_ne!(a2, a);
        assert_eq!(gc.read_word(a2 - 4), PAIR_TAG);
        assert_eq!(gc.read_word(a2), 7);
        assert_eq!(gc.read_word(a2 + 4), 0);
    }

    #[test]
    fn shared_objects_are_copied_once() {
        // Two roots to the same object must agree after collection.
        let (mut stack, fp, sentinel) = single_frame(0b11, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);

        let shared = alloc_pair(&mut gc, &mut stack, fp, 5, 0);
        stack.write(fp - 12, shared);
        stack.write(fp - 16, shared);

        gc.collect(fp, &mut stack);
        assert_eq!(gc.stats(), GcStats { live_objects: 1, live_words: 3 });
        assert_eq!(stack.read(fp - 12), stack.read(fp - 16));
    }

    #[test]
    fn cycles_terminate() {
        let (mut stack, fp, sentinel) = single_frame(1, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);

        let a = alloc_pair(&mut gc, &mut stack, fp, 1, 0);
        let b = alloc_pair(&mut gc, &mut stack, fp, 2, a);
        gc.write_word(a + 4, b); // a -> b -> a
        stack.write(fp - 12, a);

        gc.collect(fp, &mut stack);
        assert_eq!(gc.stats(), GcStats { live_objects: 2, live_words: 6 });

        let a2 = stack.read(fp - 12);
        let b2 = gc.read_word(a2 + 4);
        assert_eq!(gc.read_word(b2 + 4), a2);
    }

    #[test]
    fn no_forwarding_pointers_survive_in_from_space() {
        let (mut stack, fp, sentinel) = single_frame(1, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);

        let a = alloc_pair(&mut gc, &mut stack, fp, 7, 0);
        let b = alloc_pair(&mut gc, &mut stack, fp, 9, a);
        stack.write(fp - 12, b);
        gc.collect(fp, &mut stack);

        // Every header between the space base and the bump pointer is live.
        let mut scan = gc.from_base;
        while scan < gc.alloc_ptr {
            let header = gc.read_word(scan);
            assert_eq!(header & 1, 1);
            scan += WORD_BYTES * (1 + (header >> 24));
        }
        assert_eq!(
            gc.alloc_ptr - gc.from_base,
            (gc.words_used as u32) * WORD_BYTES
        );
    }

    #[test]
    fn repeated_collections_are_idempotent() {
        let (mut stack, fp, sentinel) = single_frame(1, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);

        let a = alloc_pair(&mut gc, &mut stack, fp, 7, 0);
        let b = alloc_pair(&mut gc, &mut stack, fp, 9, a);
        stack.write(fp - 12, b);

        gc.collect(fp, &mut stack);
        let first = gc.stats();
        gc.collect(fp, &mut stack);
        assert_eq!(gc.stats(), first);

        let b2 = stack.read(fp - 12);
        assert_eq!(gc.read_word(b2), 9);
        assert_eq!(gc.read_word(gc.read_word(b2 + 4)), 7);
    }

    #[test]
    fn argument_roots_are_walked_through_the_frame_chain() {
        let mut stack = StackImage::new(STACK_BASE, 64);
        let sentinel = STACK_BASE + 0xF8;
        // Outer frame (Entry): one reference local.
        let outer = STACK_BASE + 0xC0;
        stack.write(outer, sentinel);
        stack.write(outer - 4, 0);
        stack.write(outer - 8, 1);
        // Inner frame (a called function): one reference argument.
        let inner = STACK_BASE + 0x80;
        stack.write(inner, outer);
        stack.write(inner - 4, 1);
        stack.write(inner - 8, 0);

        let mut gc = GcSemiSpace::new(sentinel, 16);
        let obj = alloc_pair(&mut gc, &mut stack, inner, 3, 0);
        stack.write(outer - 12, obj); // Entry's local
        stack.write(inner + 8, obj); // the pushed argument

        gc.collect(inner, &mut stack);
        assert_eq!(gc.stats().live_objects, 1);
        assert_eq!(stack.read(outer - 12), stack.read(inner + 8));
        assert_eq!(gc.read_word(stack.read(inner + 8)), 3);
    }

    #[test]
    fn report_hook_sees_every_cycle() {
        let seen: Rc<RefCell<Vec<GcStats>>> = Rc::default();
        let log = Rc::clone(&seen);

        let (mut stack, fp, sentinel) = single_frame(1, 0);
        let mut gc = GcSemiSpace::new(sentinel, 16);
        gc.set_report_hook(move |stats| log.borrow_mut().push(stats));

        let a = alloc_pair(&mut gc, &mut stack, fp, 1, 0);
        stack.write(fp - 12, a);
        gc.collect(fp, &mut stack);
        gc.collect(fp, &mut stack);

        assert_eq!(
            *seen.borrow(),
            vec![
                GcStats { live_objects: 1, live_words: 3 },
                GcStats { live_objects: 1, live_words: 3 },
            ]
        );
    }

    #[test]
    #[should_panic(expected = "positive even")]
    fn odd_heap_sizes_are_rejected() {
        GcSemiSpace::new(0, 5);
    }
}
