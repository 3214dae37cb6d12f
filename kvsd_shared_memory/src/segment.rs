//! Update and data segments of the shared heap.
//!
//! The heap lives in a *data segment* whose file name carries a
//! generation number; growing the heap creates the next generation and
//! publishes its number through the page-sized *update segment*. Every
//! process compares its remembered generation against the update segment
//! before touching allocator state and remaps on mismatch, which makes
//! the base-address change transparent (all heap references are offsets).

use crate::error::{ShmError, ShmResult};
use crate::platform::{
    PAGE_SIZE, attach_segment_mmap, create_segment_mmap, segment_path, unlink_segment,
};
use memmap2::MmapMut;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic number validating a kvsd update segment.
const UPDATE_MAGIC: u64 = 0x4b56_5344_5550_4431; // "KVSDUPD1"

/// Header of the update segment.
#[repr(C)]
struct UpdateHeader {
    magic: u64,
    generation: AtomicU64,
}

/// Page-sized segment publishing the current data-segment generation.
///
/// Created once by the server parent; children inherit the shared mapping
/// across `fork`, so a plain atomic load observes the latest generation.
pub struct UpdateSegment {
    mmap: MmapMut,
    path: PathBuf,
}

impl UpdateSegment {
    /// Create the update segment for `namespace` with generation 0.
    pub fn create(namespace: &str) -> ShmResult<Self> {
        let path = segment_path(&format!("{namespace}_update"));
        let mut mmap = create_segment_mmap(&path, PAGE_SIZE)?;

        let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut UpdateHeader) };
        header.magic = UPDATE_MAGIC;
        header.generation = AtomicU64::new(0);

        Ok(Self { mmap, path })
    }

    fn header(&self) -> &UpdateHeader {
        unsafe { &*(self.mmap.as_ptr() as *const UpdateHeader) }
    }

    /// Currently published data-segment generation.
    pub fn generation(&self) -> u64 {
        self.header().generation.load(Ordering::Acquire)
    }

    /// Publish a new data-segment generation (grower only).
    pub fn publish(&self, generation: u64) {
        self.header().generation.store(generation, Ordering::Release);
    }

    /// Validate the magic word.
    pub fn validate(&self) -> ShmResult<()> {
        if self.header().magic != UPDATE_MAGIC {
            return Err(ShmError::Corrupted {
                name: self.path.display().to_string(),
            });
        }
        Ok(())
    }

    /// Remove the backing file (owner teardown).
    pub fn destroy(self) {
        unlink_segment(&self.path);
    }
}

/// One generation of the heap's data segment.
pub struct DataSegment {
    mmap: MmapMut,
    path: PathBuf,
    generation: u64,
    size: usize,
}

impl DataSegment {
    /// Create generation `generation` of the data segment for `namespace`.
    pub fn create(namespace: &str, generation: u64, size: usize) -> ShmResult<Self> {
        let path = segment_path(&format!("{namespace}_data_{generation}"));
        let mmap = create_segment_mmap(&path, size)?;
        Ok(Self {
            mmap,
            path,
            generation,
            size,
        })
    }

    /// Map an existing generation of the data segment.
    pub fn attach(namespace: &str, generation: u64) -> ShmResult<Self> {
        let path = segment_path(&format!("{namespace}_data_{generation}"));
        let mmap = attach_segment_mmap(&path)?;
        let size = mmap.len();
        Ok(Self {
            mmap,
            path,
            generation,
            size,
        })
    }

    /// Generation this mapping belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base address of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Segment contents as a byte slice.
    pub fn bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Segment contents as a mutable byte slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    /// Remove the backing file. The mapping itself stays valid until drop.
    pub fn unlink(&self) {
        unlink_segment(&self.path);
    }
}
