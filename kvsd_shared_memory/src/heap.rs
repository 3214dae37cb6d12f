//! Free-list allocator over the shared data segment.
//!
//! The segment starts with a [`HeapHeader`] followed by blocks. Each
//! block carries a size word whose low bit caches whether the *previous*
//! block is in use; free blocks additionally carry doubly linked
//! free-list offsets and duplicate their size in a trailing footer word
//! so coalescing can walk backwards. A zero-payload stop block terminates
//! the segment.
//!
//! Layout of a block at offset `b` (all words are `usize`):
//!
//! ```text
//! b + 0        size | prev_in_use
//! b + WORD     previous free block offset   (free blocks only)
//! b + 2*WORD   next free block offset       (free blocks only)
//! ...
//! b + size - WORD   footer = size           (free blocks only)
//! ```
//!
//! Growth creates the next segment generation, copies the old contents
//! verbatim, turns the old stop area into a fresh free block and
//! publishes the new generation through the update segment (§ see
//! [`crate::segment`]).

use crate::alloc::{Allocator, Offset, WORD};
use crate::error::{ShmError, ShmResult};
use crate::platform::{
    PAGE_SIZE, align_size, install_reattach_handler, is_process_group_leader,
    notify_process_group,
};
use crate::segment::{DataSegment, UpdateSegment};

/// Size of one block header word.
pub const BLOCK_HEADER: usize = WORD;

/// Minimum allocation granularity: two header words.
pub const CHUNK: usize = 2 * BLOCK_HEADER;

/// Segment header preceding the first block.
#[repr(C)]
struct HeapHeader {
    /// Offset of the free-list head, 0 when the list is empty.
    first_free: usize,
    /// Offset of the stop block area.
    stop: usize,
}

const HEAP_HEADER_SIZE: usize = std::mem::size_of::<HeapHeader>();

/// The shared free-list heap.
///
/// Created once by the server parent; forked processes inherit the
/// mapping and the update segment. Mutating entry points first compare
/// the remembered generation against the update segment and remap when
/// another process has grown the heap.
pub struct SharedHeap {
    namespace: String,
    update: UpdateSegment,
    data: DataSegment,
    /// Whether growth broadcasts the reattach nudge. Captured at
    /// creation: only a heap owned by a process-group leader (the
    /// daemonized server) signals its group.
    notify_group: bool,
}

impl SharedHeap {
    /// Create the heap for `namespace` with at least `capacity` usable bytes.
    pub fn create(namespace: &str, capacity: usize) -> ShmResult<Self> {
        let capacity = align_size(capacity.max(CHUNK) + BLOCK_HEADER, CHUNK);
        let segment_size = align_size(capacity + HEAP_HEADER_SIZE + CHUNK, PAGE_SIZE);
        // Usable bytes after page rounding.
        let capacity = segment_size - HEAP_HEADER_SIZE - CHUNK;

        let update = UpdateSegment::create(namespace)?;
        let data = DataSegment::create(namespace, 0, segment_size)?;
        install_reattach_handler()?;

        let mut heap = Self {
            namespace: namespace.to_string(),
            update,
            data,
            notify_group: is_process_group_leader(),
        };

        heap.header_mut().first_free = 0;

        // The whole usable area is one free block. Its previous-in-use
        // bit is set: there is nothing before it to coalesce with.
        let first = HEAP_HEADER_SIZE;
        heap.set_word(first, capacity | 1);
        heap.set_word(first + capacity - WORD, capacity);
        heap.push_free(first);

        heap.place_stop_block(segment_size);

        tracing::info!(
            namespace = %heap.namespace,
            size = segment_size,
            "shared heap segment initialized"
        );
        Ok(heap)
    }

    /// Total mapped size of the current data segment.
    pub fn segment_size(&self) -> usize {
        self.data.size()
    }

    /// Generation of the currently mapped data segment.
    pub fn generation(&self) -> u64 {
        self.data.generation()
    }

    /// Re-map the data segment if another process has grown it.
    ///
    /// Called by every mutating entry point; the storage engine also
    /// calls it right after acquiring the gate so that read-only offset
    /// resolution sees the current base.
    pub fn refresh(&mut self) -> ShmResult<()> {
        let published = self.update.generation();
        if published != self.data.generation() {
            self.data = DataSegment::attach(&self.namespace, published)?;
            tracing::debug!(generation = published, "reattached grown data segment");
        }
        Ok(())
    }

    /// Unlink all backing files (owner teardown).
    pub fn destroy(self) {
        tracing::info!(namespace = %self.namespace, "shared heap segment removed");
        self.data.unlink();
        self.update.destroy();
    }

    // ─── Word and block primitives ─────────────────────────────────

    fn header(&self) -> &HeapHeader {
        unsafe { &*(self.data.base() as *const HeapHeader) }
    }

    fn header_mut(&mut self) -> &mut HeapHeader {
        unsafe { &mut *(self.data.base() as *mut HeapHeader) }
    }

    fn word(&self, offset: usize) -> usize {
        debug_assert!(offset + WORD <= self.data.size());
        unsafe { *(self.data.base().add(offset) as *const usize) }
    }

    fn set_word(&mut self, offset: usize, value: usize) {
        debug_assert!(offset + WORD <= self.data.size());
        unsafe { *(self.data.base().add(offset) as *mut usize) = value };
    }

    fn block_size(&self, block: usize) -> usize {
        self.word(block) & !1
    }

    fn prev_in_use(&self, block: usize) -> bool {
        self.word(block) & 1 == 1
    }

    fn next_block(&self, block: usize) -> usize {
        block + self.block_size(block)
    }

    fn prev_block(&self, block: usize) -> usize {
        block - self.word(block - WORD)
    }

    fn in_use(&self, block: usize) -> bool {
        self.prev_in_use(self.next_block(block))
    }

    fn write_footer(&mut self, block: usize) {
        let size = self.block_size(block);
        self.set_word(block + size - WORD, size);
    }

    // ─── Free list ─────────────────────────────────────────────────

    fn free_prev(&self, block: usize) -> usize {
        self.word(block + WORD)
    }

    fn free_next(&self, block: usize) -> usize {
        self.word(block + 2 * WORD)
    }

    fn push_free(&mut self, block: usize) {
        let head = self.header().first_free;
        self.set_word(block + WORD, 0);
        self.set_word(block + 2 * WORD, head);
        if head != 0 {
            self.set_word(head + WORD, block);
        }
        self.header_mut().first_free = block;
    }

    fn unlink_free(&mut self, block: usize) {
        let prev = self.free_prev(block);
        let next = self.free_next(block);
        if prev != 0 {
            self.set_word(prev + 2 * WORD, next);
        } else {
            self.header_mut().first_free = next;
        }
        if next != 0 {
            self.set_word(next + WORD, prev);
        }
    }

    fn find_fit(&self, size: usize) -> Option<usize> {
        let mut block = self.header().first_free;
        while block != 0 {
            if self.block_size(block) >= size {
                return Some(block);
            }
            block = self.free_next(block);
        }
        None
    }

    // ─── Placement and coalescing ──────────────────────────────────

    /// Take `size` bytes out of free `block`, splitting off the tail
    /// when the remainder still holds a minimal block.
    fn place_block(&mut self, block: usize, size: usize) -> usize {
        self.unlink_free(block);
        let remaining = self.block_size(block) - size;

        if remaining >= 2 * CHUNK {
            let prev_bit = self.word(block) & 1;
            self.set_word(block, size | prev_bit);

            let tail = block + size;
            self.set_word(tail, remaining | 1);
            self.write_footer(tail);
            self.push_free(tail);
        } else {
            let next = self.next_block(block);
            let word = self.word(next);
            self.set_word(next, word | 1);
        }

        block
    }

    /// Merge `block` with free neighbors; returns the merged block.
    fn coalesce(&mut self, mut block: usize) -> usize {
        let prev_used = self.prev_in_use(block);
        let next_used = self.in_use(self.next_block(block));

        if prev_used && next_used {
            return block;
        }

        if !prev_used {
            let prev = self.prev_block(block);
            self.unlink_free(block);

            let merged = self.block_size(prev) + self.block_size(block);
            let prev_bit = self.word(prev) & 1;
            self.set_word(prev, merged | prev_bit);
            self.write_footer(prev);

            block = prev;
        }

        if !next_used {
            let next = self.next_block(block);
            self.unlink_free(next);

            let merged = self.block_size(block) + self.block_size(next);
            let prev_bit = self.word(block) & 1;
            self.set_word(block, merged | prev_bit);
            self.write_footer(block);
        }

        block
    }

    /// Write the stop block terminating coalescing at the segment end.
    fn place_stop_block(&mut self, segment_size: usize) {
        let stop = segment_size - CHUNK;
        self.header_mut().stop = stop;

        // One header-sized block whose successor word marks it in use.
        self.set_word(stop, BLOCK_HEADER);
        self.set_word(stop + BLOCK_HEADER, 1);
    }

    // ─── Growth ────────────────────────────────────────────────────

    /// Replace the data segment with a larger generation and return the
    /// resulting free block, which is guaranteed to hold `size` bytes.
    fn extend(&mut self, size: usize) -> ShmResult<usize> {
        let old_size = self.data.size();
        let mut additional = old_size;
        if size >= old_size {
            additional += align_size(size, PAGE_SIZE);
        }
        let new_size = old_size + additional;

        let generation = self.data.generation() + 1;
        let mut grown = DataSegment::create(&self.namespace, generation, new_size)?;
        grown.bytes_mut()[..old_size].copy_from_slice(self.data.bytes());

        let old = std::mem::replace(&mut self.data, grown);
        old.unlink();
        drop(old);

        // The old stop area becomes the head of the additional space.
        let free = self.header().stop;
        let prev_bit = self.word(free) & 1;
        self.set_word(free, additional | prev_bit);
        self.write_footer(free);
        self.push_free(free);

        self.place_stop_block(new_size);
        let free = self.coalesce(free);

        // Publish the new generation and nudge blocked siblings.
        self.update.publish(generation);
        if self.notify_group {
            notify_process_group();
        }

        tracing::info!(
            generation,
            size = new_size,
            "shared heap segment extended"
        );

        Ok(free)
    }

    // ─── Audit ─────────────────────────────────────────────────────

    /// Verify the heap invariants: block sizes sum to the segment size,
    /// footers mirror headers, no two adjacent free blocks, and the free
    /// list holds exactly the blocks whose successor marks them free.
    pub fn validate(&self) -> ShmResult<()> {
        let stop = self.header().stop;
        let corrupted = || ShmError::Corrupted {
            name: self.namespace.clone(),
        };

        let mut walked_free = Vec::new();
        let mut block = HEAP_HEADER_SIZE;
        let mut previous_free = false;
        while block < stop {
            let size = self.block_size(block);
            if size < CHUNK || size % CHUNK != 0 || block + size > stop {
                return Err(corrupted());
            }
            let free = !self.in_use(block);
            if free {
                if previous_free {
                    return Err(corrupted());
                }
                if self.word(block + size - WORD) != size {
                    return Err(corrupted());
                }
                walked_free.push(block);
            }
            if self.prev_in_use(block + size) == free {
                return Err(corrupted());
            }
            previous_free = free;
            block += size;
        }
        if block != stop {
            return Err(corrupted());
        }

        let mut listed_free = Vec::new();
        let mut cursor = self.header().first_free;
        while cursor != 0 {
            listed_free.push(cursor);
            cursor = self.free_next(cursor);
        }

        walked_free.sort_unstable();
        listed_free.sort_unstable();
        if walked_free != listed_free {
            return Err(corrupted());
        }
        Ok(())
    }
}

impl Allocator for SharedHeap {
    fn reserve(&mut self, size: usize) -> ShmResult<Offset> {
        self.refresh()?;
        let rounded = align_size(size.max(CHUNK) + BLOCK_HEADER, CHUNK);

        let block = match self.find_fit(rounded) {
            Some(block) => block,
            None => self.extend(rounded)?,
        };
        let block = self.place_block(block, rounded);

        Ok(Offset::new(block + BLOCK_HEADER))
    }

    fn resize(&mut self, offset: Offset, size: usize) -> ShmResult<Offset> {
        self.refresh()?;
        let needed = align_size(size.max(CHUNK) + BLOCK_HEADER, CHUNK);
        let block = offset.get() - BLOCK_HEADER;
        let current = self.block_size(block);

        if current >= needed {
            return Ok(offset);
        }

        let next = self.next_block(block);
        if !self.in_use(next) && current + self.block_size(next) >= needed {
            // Merge forward in place, splitting off any remainder.
            self.unlink_free(next);
            let combined = current + self.block_size(next);
            let prev_bit = self.word(block) & 1;

            let remaining = combined - needed;
            if remaining >= 2 * CHUNK {
                self.set_word(block, needed | prev_bit);
                let tail = block + needed;
                self.set_word(tail, remaining | 1);
                self.write_footer(tail);
                self.push_free(tail);
            } else {
                self.set_word(block, combined | prev_bit);
                let after = block + combined;
                let word = self.word(after);
                self.set_word(after, word | 1);
            }
            return Ok(offset);
        }

        // Relocate: allocate, copy the old payload, free the old block.
        let new_offset = self.reserve(size)?;
        let payload = current - BLOCK_HEADER;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.resolve(offset),
                self.resolve(new_offset),
                payload.min(size),
            );
        }
        self.release(offset)?;
        Ok(new_offset)
    }

    fn release(&mut self, offset: Offset) -> ShmResult<()> {
        self.refresh()?;
        let block = offset.get() - BLOCK_HEADER;

        let next = self.next_block(block);
        let word = self.word(next);
        self.set_word(next, word & !1);
        self.write_footer(block);

        self.push_free(block);
        self.coalesce(block);
        Ok(())
    }

    fn resolve(&self, offset: Offset) -> *mut u8 {
        debug_assert!(offset.get() < self.data.size());
        unsafe { self.data.base().add(offset.get()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::get_current_pid;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_heap(capacity: usize) -> SharedHeap {
        let ns = format!(
            "heaptest_{}_{}",
            get_current_pid(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        SharedHeap::create(&ns, capacity).unwrap()
    }

    #[test]
    fn fresh_heap_is_valid() {
        let heap = test_heap(1024);
        assert!(heap.validate().is_ok());
        assert_eq!(heap.segment_size() % PAGE_SIZE, 0);
        heap.destroy();
    }

    #[test]
    fn reserve_release_restores_one_free_block() {
        let mut heap = test_heap(1024);

        let a = heap.reserve(100).unwrap();
        let b = heap.reserve(200).unwrap();
        assert!(heap.validate().is_ok());

        heap.bytes_mut(a, 100).fill(0xAA);
        heap.bytes_mut(b, 200).fill(0xBB);
        assert!(heap.bytes(a, 100).iter().all(|&x| x == 0xAA));
        assert!(heap.bytes(b, 200).iter().all(|&x| x == 0xBB));

        heap.release(a).unwrap();
        assert!(heap.validate().is_ok());
        heap.release(b).unwrap();
        assert!(heap.validate().is_ok());
        heap.destroy();
    }

    #[test]
    fn coalescing_merges_both_neighbors() {
        let mut heap = test_heap(1024);

        let a = heap.reserve(64).unwrap();
        let b = heap.reserve(64).unwrap();
        let c = heap.reserve(64).unwrap();

        // Free outer blocks first, then the middle one: the middle free
        // must absorb both sides into one block.
        heap.release(a).unwrap();
        heap.release(c).unwrap();
        assert!(heap.validate().is_ok());
        heap.release(b).unwrap();
        assert!(heap.validate().is_ok());

        // Everything merged back: the next allocation reuses the front.
        let again = heap.reserve(64).unwrap();
        assert_eq!(again, a);
        heap.release(again).unwrap();
        heap.destroy();
    }

    #[test]
    fn growth_preserves_contents_and_offsets() {
        let mut heap = test_heap(256);
        let before = heap.segment_size();

        let small = heap.reserve(64).unwrap();
        heap.bytes_mut(small, 64).fill(0x5A);

        // A block larger than the whole segment forces growth.
        let big = heap.reserve(before).unwrap();
        assert!(heap.segment_size() > before);
        assert_eq!(heap.generation(), 1);
        assert!(heap.validate().is_ok());

        // Offsets issued before the growth still resolve to the data.
        assert!(heap.bytes(small, 64).iter().all(|&x| x == 0x5A));

        heap.release(big).unwrap();
        heap.release(small).unwrap();
        assert!(heap.validate().is_ok());
        heap.destroy();
    }

    #[test]
    fn repeated_growth() {
        let mut heap = test_heap(256);
        let mut held = Vec::new();
        for round in 0..6 {
            let offset = heap.reserve(1024 << round).unwrap();
            heap.bytes_mut(offset, 1).fill(round as u8);
            held.push(offset);
        }
        assert!(heap.generation() >= 1);
        assert!(heap.validate().is_ok());
        for (round, offset) in held.iter().enumerate() {
            assert_eq!(heap.bytes(*offset, 1)[0], round as u8);
        }
        for offset in held {
            heap.release(offset).unwrap();
        }
        assert!(heap.validate().is_ok());
        heap.destroy();
    }

    #[test]
    fn resize_merges_forward_when_next_is_free() {
        let mut heap = test_heap(1024);

        let a = heap.reserve(32).unwrap();
        heap.bytes_mut(a, 32).copy_from_slice(&[9u8; 32]);

        // Nothing allocated after `a`, so the big tail block is free and
        // the resize must stay in place.
        let grown = heap.resize(a, 128).unwrap();
        assert_eq!(grown, a);
        assert_eq!(&heap.bytes(grown, 128)[..32], &[9u8; 32]);
        assert!(heap.validate().is_ok());

        heap.release(grown).unwrap();
        heap.destroy();
    }

    #[test]
    fn resize_relocates_when_blocked() {
        let mut heap = test_heap(1024);

        let a = heap.reserve(32).unwrap();
        let _barrier = heap.reserve(32).unwrap();
        heap.bytes_mut(a, 32).copy_from_slice(&[3u8; 32]);

        let moved = heap.resize(a, 256).unwrap();
        assert_ne!(moved, a);
        assert_eq!(&heap.bytes(moved, 256)[..32], &[3u8; 32]);
        assert!(heap.validate().is_ok());
        heap.destroy();
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        /// Any interleaving of reserve and release keeps the heap sound:
        /// sizes sum up, footers mirror headers and the free list holds
        /// exactly the free blocks.
        #[test]
        fn random_reserve_release_preserves_invariants(
            ops in proptest::collection::vec((proptest::prelude::any::<bool>(), 1usize..700), 1..40)
        ) {
            let mut heap = test_heap(2048);
            let mut live: Vec<Offset> = Vec::new();

            for (is_release, size) in ops {
                if is_release && !live.is_empty() {
                    let offset = live.swap_remove(size % live.len());
                    heap.release(offset).unwrap();
                } else {
                    live.push(heap.reserve(size).unwrap());
                }
                proptest::prop_assert!(heap.validate().is_ok());
            }

            for offset in live {
                heap.release(offset).unwrap();
            }
            proptest::prop_assert!(heap.validate().is_ok());
            heap.destroy();
        }
    }

    #[test]
    fn first_fit_reuses_released_block() {
        let mut heap = test_heap(1024);

        let a = heap.reserve(128).unwrap();
        let _b = heap.reserve(128).unwrap();
        heap.release(a).unwrap();

        // The released front block fits and is found before the tail.
        let c = heap.reserve(64).unwrap();
        assert_eq!(c.get(), a.get());
        assert!(heap.validate().is_ok());
        heap.destroy();
    }
}
