//! The allocator seam.
//!
//! Everything stored in the shared heap is addressed by [`Offset`], a
//! typed handle relative to the segment base. Offsets survive segment
//! growth and re-mapping; process-local pointers do not, so a pointer may
//! only be materialized through [`Allocator::resolve`] and must not
//! outlive the call site's gate section.
//!
//! Two interchangeable implementations exist: [`PrivateAllocator`]
//! forwards to the process heap (offsets are addresses there), and
//! [`crate::heap::SharedHeap`] operates on the shared segment.

use crate::error::{ShmError, ShmResult};
use std::alloc::{Layout, alloc, dealloc};

/// Word used for block headers and free-list links.
pub const WORD: usize = std::mem::size_of::<usize>();

/// Handle to an allocation, relative to the owning allocator's base.
///
/// `Offset::NULL` (zero) never names a live allocation: the shared heap
/// keeps its segment header at offset zero and the private allocator
/// hands out nonzero addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Offset(usize);

impl Offset {
    /// The null handle.
    pub const NULL: Offset = Offset(0);

    /// Wrap a raw offset value.
    pub const fn new(raw: usize) -> Self {
        Offset(raw)
    }

    /// Raw offset value.
    pub const fn get(self) -> usize {
        self.0
    }

    /// True for the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Allocation interface shared by the private and the shared heap.
///
/// Callers own the discipline: `resize`/`release` only accept offsets
/// produced by `reserve` of the same allocator, and resolved pointers are
/// only dereferenced while the caller holds whatever lock guards the
/// allocator's memory.
pub trait Allocator {
    /// Allocate `size` bytes and return the payload handle.
    fn reserve(&mut self, size: usize) -> ShmResult<Offset>;

    /// Grow (or shrink) an allocation, preserving the payload prefix.
    /// The returned handle replaces `offset`.
    fn resize(&mut self, offset: Offset, size: usize) -> ShmResult<Offset>;

    /// Return an allocation to the allocator.
    fn release(&mut self, offset: Offset) -> ShmResult<()>;

    /// Materialize a handle as a pointer into this process.
    fn resolve(&self, offset: Offset) -> *mut u8;

    /// Borrow an allocation as bytes. See the trait-level contract.
    fn bytes(&self, offset: Offset, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.resolve(offset), len) }
    }

    /// Borrow an allocation as mutable bytes. See the trait-level contract.
    fn bytes_mut(&mut self, offset: Offset, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.resolve(offset), len) }
    }
}

/// Process-heap allocator: offsets are plain addresses.
///
/// The requested size is stored in a word ahead of the payload so that
/// `release` needs no layout from the caller, mirroring the shared heap's
/// block header.
#[derive(Debug, Default)]
pub struct PrivateAllocator;

impl PrivateAllocator {
    fn stored_size(offset: Offset) -> usize {
        unsafe { *((offset.get() - WORD) as *const usize) }
    }
}

impl Allocator for PrivateAllocator {
    fn reserve(&mut self, size: usize) -> ShmResult<Offset> {
        let total = size + WORD;
        let layout =
            Layout::from_size_align(total, WORD).map_err(|_| ShmError::InvalidSize { size })?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(ShmError::Exhausted { requested: total });
        }
        unsafe { *(ptr as *mut usize) = size };
        Ok(Offset::new(ptr as usize + WORD))
    }

    fn resize(&mut self, offset: Offset, size: usize) -> ShmResult<Offset> {
        let old_size = Self::stored_size(offset);
        if old_size >= size {
            return Ok(offset);
        }
        let new_offset = self.reserve(size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.resolve(offset), self.resolve(new_offset), old_size);
        }
        self.release(offset)?;
        Ok(new_offset)
    }

    fn release(&mut self, offset: Offset) -> ShmResult<()> {
        let size = Self::stored_size(offset);
        let ptr = (offset.get() - WORD) as *mut u8;
        unsafe { dealloc(ptr, Layout::from_size_align_unchecked(size + WORD, WORD)) };
        Ok(())
    }

    fn resolve(&self, offset: Offset) -> *mut u8 {
        offset.get() as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_offset_is_distinct() {
        assert!(Offset::NULL.is_null());
        assert!(!Offset::new(8).is_null());
        assert_eq!(Offset::new(8).get(), 8);
    }

    #[test]
    fn private_reserve_release_roundtrip() {
        let mut alloc = PrivateAllocator;
        let offset = alloc.reserve(32).unwrap();
        assert!(!offset.is_null());

        alloc.bytes_mut(offset, 32).copy_from_slice(&[7u8; 32]);
        assert_eq!(alloc.bytes(offset, 32), &[7u8; 32]);

        alloc.release(offset).unwrap();
    }

    #[test]
    fn private_resize_preserves_prefix() {
        let mut alloc = PrivateAllocator;
        let offset = alloc.reserve(8).unwrap();
        alloc.bytes_mut(offset, 8).copy_from_slice(b"abcdefgh");

        let bigger = alloc.resize(offset, 64).unwrap();
        assert_eq!(&alloc.bytes(bigger, 64)[..8], b"abcdefgh");

        // Shrinking stays in place.
        let same = alloc.resize(bigger, 4).unwrap();
        assert_eq!(same, bigger);

        alloc.release(same).unwrap();
    }
}
