//! Offset-addressed hash map.
//!
//! An open-hash map whose header, bucket table and items all live in
//! allocator memory and reference each other by [`Offset`], so the same
//! structure works in the private heap and across address spaces in the
//! shared heap. Keys are stored inline behind each item header; values
//! are opaque offsets the caller manages.
//!
//! Collisions chain within a bucket; the bucket index is
//! `hash32(key) & (table_size - 1)` with `table_size` a power of two.
//! Exceeding one item per table slot on average doubles the table.

use crate::alloc::{Allocator, Offset, WORD};
use crate::error::ShmResult;

/// Smallest bucket table.
const INITIAL_TABLE_SIZE: usize = 8;

/// FNV-1a offset basis (32 bit).
const FNV_OFFSET_BASIS: u32 = 2166136261;
/// FNV-1a prime (32 bit).
const FNV_PRIME: u32 = 16777619;

/// FNV-1a hash of `key` (32 bit).
pub fn hash32(key: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in key {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map header, resident in allocator memory.
///
/// The low bit of `table_size` flags a shared-segment map; the real size
/// is always a power of two with the bit masked off, and the flag is
/// preserved across table growth.
#[repr(C)]
struct MapHeader {
    table: usize,
    table_size: usize,
    len: usize,
}

/// Item header; the key bytes follow inline.
#[repr(C)]
struct ItemHeader {
    next: usize,
    value: usize,
    key_len: usize,
}

const MAP_HEADER_SIZE: usize = std::mem::size_of::<MapHeader>();
const ITEM_HEADER_SIZE: usize = std::mem::size_of::<ItemHeader>();

/// Handle to an offset-addressed hash map.
///
/// The handle itself is plain data; every operation borrows the
/// allocator whose memory holds the map, and mutating operations require
/// the same exclusion the allocator requires.
#[derive(Debug, Clone, Copy)]
pub struct OffsetMap {
    root: Offset,
}

impl OffsetMap {
    /// Create a map sized for `capacity` items.
    pub fn create(alloc: &mut dyn Allocator, capacity: usize, shared: bool) -> ShmResult<Self> {
        let table_size = capacity.max(INITIAL_TABLE_SIZE).next_power_of_two();

        let root = alloc.reserve(MAP_HEADER_SIZE)?;
        let table = alloc.reserve(table_size * WORD)?;
        alloc.bytes_mut(table, table_size * WORD).fill(0);

        let header = unsafe { &mut *(alloc.resolve(root) as *mut MapHeader) };
        header.table = table.get();
        header.table_size = table_size | shared as usize;
        header.len = 0;

        Ok(Self { root })
    }

    /// Re-create a handle from a previously obtained root offset.
    pub fn from_root(root: Offset) -> Self {
        Self { root }
    }

    /// Root offset of the map header (stable across growth).
    pub fn root(&self) -> Offset {
        self.root
    }

    // ─── Header access ─────────────────────────────────────────────

    fn header<'a>(&self, alloc: &'a dyn Allocator) -> &'a MapHeader {
        unsafe { &*(alloc.resolve(self.root) as *const MapHeader) }
    }

    fn header_mut<'a>(&self, alloc: &'a mut dyn Allocator) -> &'a mut MapHeader {
        unsafe { &mut *(alloc.resolve(self.root) as *mut MapHeader) }
    }

    fn table_size(&self, alloc: &dyn Allocator) -> usize {
        self.header(alloc).table_size & !1
    }

    /// True when the map lives in a shared segment.
    pub fn is_shared(&self, alloc: &dyn Allocator) -> bool {
        self.header(alloc).table_size & 1 == 1
    }

    /// Number of items.
    pub fn len(&self, alloc: &dyn Allocator) -> usize {
        self.header(alloc).len
    }

    /// True when the map holds no items.
    pub fn is_empty(&self, alloc: &dyn Allocator) -> bool {
        self.len(alloc) == 0
    }

    fn bucket(&self, alloc: &dyn Allocator, index: usize) -> usize {
        let table = self.header(alloc).table;
        unsafe { *(alloc.resolve(Offset::new(table + index * WORD)) as *const usize) }
    }

    fn set_bucket(&self, alloc: &mut dyn Allocator, index: usize, item: usize) {
        let table = self.header(alloc).table;
        unsafe { *(alloc.resolve(Offset::new(table + index * WORD)) as *mut usize) = item };
    }

    // ─── Item access ───────────────────────────────────────────────

    fn item<'a>(&self, alloc: &'a dyn Allocator, item: usize) -> &'a ItemHeader {
        unsafe { &*(alloc.resolve(Offset::new(item)) as *const ItemHeader) }
    }

    fn item_mut<'a>(&self, alloc: &'a mut dyn Allocator, item: usize) -> &'a mut ItemHeader {
        unsafe { &mut *(alloc.resolve(Offset::new(item)) as *mut ItemHeader) }
    }

    /// Key bytes of an item returned by the cursor or `for_each`.
    pub fn key_bytes<'a>(&self, alloc: &'a dyn Allocator, item: Offset) -> &'a [u8] {
        let header = self.item(alloc, item.get());
        let key_len = header.key_len;
        unsafe {
            std::slice::from_raw_parts(
                alloc.resolve(Offset::new(item.get() + ITEM_HEADER_SIZE)),
                key_len,
            )
        }
    }

    /// Value offset of an item returned by the cursor or `for_each`.
    pub fn value_of(&self, alloc: &dyn Allocator, item: Offset) -> Offset {
        Offset::new(self.item(alloc, item.get()).value)
    }

    /// Walk the chain of `key`'s bucket.
    ///
    /// Returns `(bucket_index, predecessor, found)` with zero standing
    /// for "none"; when `found` is zero the predecessor is the chain
    /// tail, which is where an insert links in.
    fn find(&self, alloc: &dyn Allocator, key: &[u8]) -> (usize, usize, usize) {
        let index = hash32(key) as usize & (self.table_size(alloc) - 1);

        let mut prev = 0;
        let mut item = self.bucket(alloc, index);
        while item != 0 {
            if self.key_bytes(alloc, Offset::new(item)) == key {
                return (index, prev, item);
            }
            prev = item;
            item = self.item(alloc, item).next;
        }

        (index, prev, 0)
    }

    // ─── Operations ────────────────────────────────────────────────

    /// Value offset stored under `key`, or `None`.
    pub fn get(&self, alloc: &dyn Allocator, key: &[u8]) -> Option<Offset> {
        let (_, _, found) = self.find(alloc, key);
        (found != 0).then(|| self.value_of(alloc, Offset::new(found)))
    }

    /// True when `key` is present.
    pub fn contains(&self, alloc: &dyn Allocator, key: &[u8]) -> bool {
        let (_, _, found) = self.find(alloc, key);
        found != 0
    }

    /// Insert `key → value` if absent. When the key is already present
    /// the map is left unchanged and the *existing* value offset is
    /// returned so the caller can reclaim `value`.
    pub fn add(
        &self,
        alloc: &mut dyn Allocator,
        key: &[u8],
        value: Offset,
    ) -> ShmResult<Option<Offset>> {
        self.insert(alloc, key, value, false)
    }

    /// Insert `key → value`, swapping when the key is present. The
    /// *displaced* value offset is returned for the caller to reclaim.
    pub fn put(
        &self,
        alloc: &mut dyn Allocator,
        key: &[u8],
        value: Offset,
    ) -> ShmResult<Option<Offset>> {
        self.insert(alloc, key, value, true)
    }

    fn insert(
        &self,
        alloc: &mut dyn Allocator,
        key: &[u8],
        value: Offset,
        overwrite: bool,
    ) -> ShmResult<Option<Offset>> {
        let (index, tail, found) = self.find(alloc, key);

        if found != 0 {
            let item = self.item_mut(alloc, found);
            if overwrite {
                let displaced = item.value;
                item.value = value.get();
                return Ok(Some(Offset::new(displaced)));
            }
            return Ok(Some(Offset::new(item.value)));
        }

        let item = alloc.reserve(ITEM_HEADER_SIZE + key.len())?;
        {
            let header = self.item_mut(alloc, item.get());
            header.next = 0;
            header.value = value.get();
            header.key_len = key.len();
        }
        alloc
            .bytes_mut(Offset::new(item.get() + ITEM_HEADER_SIZE), key.len())
            .copy_from_slice(key);

        if tail != 0 {
            self.item_mut(alloc, tail).next = item.get();
        } else {
            self.set_bucket(alloc, index, item.get());
        }

        let header = self.header_mut(alloc);
        header.len += 1;
        let len = header.len;

        if len > self.table_size(alloc) {
            if let Err(e) = self.grow(alloc) {
                // The map stays consistent with longer chains.
                tracing::warn!("hash table growth failed: {e}");
            }
        }

        Ok(None)
    }

    /// Remove `key`, returning its value offset for the caller to
    /// reclaim, or `None` when absent.
    pub fn remove(&self, alloc: &mut dyn Allocator, key: &[u8]) -> ShmResult<Option<Offset>> {
        let (index, prev, found) = self.find(alloc, key);
        if found == 0 {
            return Ok(None);
        }

        let removed = self.item(alloc, found);
        let value = removed.value;
        let next = removed.next;

        if prev != 0 {
            self.item_mut(alloc, prev).next = next;
        } else {
            self.set_bucket(alloc, index, next);
        }
        self.header_mut(alloc).len -= 1;

        alloc.release(Offset::new(found))?;
        Ok(Some(Offset::new(value)))
    }

    /// Double the bucket table and re-hash every item into it.
    fn grow(&self, alloc: &mut dyn Allocator) -> ShmResult<()> {
        let old_size = self.table_size(alloc);
        let old_table = self.header(alloc).table;
        let new_size = old_size * 2;
        let shared_bit = self.header(alloc).table_size & 1;

        let new_table = alloc.reserve(new_size * WORD)?;
        alloc.bytes_mut(new_table, new_size * WORD).fill(0);

        {
            let header = self.header_mut(alloc);
            header.table = new_table.get();
            header.table_size = new_size | shared_bit;
        }

        // Relink one item at a time; within a bucket the order is free.
        for index in 0..old_size {
            let mut item =
                unsafe { *(alloc.resolve(Offset::new(old_table + index * WORD)) as *const usize) };
            while item != 0 {
                let next = self.item(alloc, item).next;

                let key = self.key_bytes(alloc, Offset::new(item));
                let new_index = hash32(key) as usize & (new_size - 1);

                let head = self.bucket(alloc, new_index);
                self.item_mut(alloc, item).next = head;
                self.set_bucket(alloc, new_index, item);

                item = next;
            }
        }

        alloc.release(Offset::new(old_table))?;
        Ok(())
    }

    /// Visit every `{key, value}` pair.
    pub fn for_each<F>(&self, alloc: &dyn Allocator, mut visit: F)
    where
        F: FnMut(&[u8], Offset),
    {
        for index in 0..self.table_size(alloc) {
            let mut item = self.bucket(alloc, index);
            while item != 0 {
                let header = self.item(alloc, item);
                let next = header.next;
                visit(
                    self.key_bytes(alloc, Offset::new(item)),
                    Offset::new(header.value),
                );
                item = next;
            }
        }
    }

    /// Release every item block and empty the buckets. Values are *not*
    /// reclaimed; drain them through [`OffsetMap::for_each`] first.
    pub fn clear(&self, alloc: &mut dyn Allocator) -> ShmResult<()> {
        for index in 0..self.table_size(alloc) {
            let mut item = self.bucket(alloc, index);
            while item != 0 {
                let next = self.item(alloc, item).next;
                alloc.release(Offset::new(item))?;
                item = next;
            }
            self.set_bucket(alloc, index, 0);
        }
        self.header_mut(alloc).len = 0;
        Ok(())
    }

    /// Release the bucket table and header. The map must be cleared.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> ShmResult<()> {
        let table = self.header(alloc).table;
        alloc.release(Offset::new(table))?;
        alloc.release(self.root)?;
        Ok(())
    }
}

/// Resumable item cursor.
///
/// `next(None)` restarts; `next(Some(previous))` continues behind the
/// item returned last. Each item is visited exactly once as long as the
/// map is not modified between calls.
#[derive(Debug, Default)]
pub struct MapCursor {
    bucket: usize,
}

impl MapCursor {
    /// Fresh cursor positioned at the first bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next item, or `None` past the last one.
    pub fn next(
        &mut self,
        alloc: &dyn Allocator,
        map: &OffsetMap,
        previous: Option<Offset>,
    ) -> Option<Offset> {
        match previous {
            None => self.bucket = 0,
            Some(item) => {
                let next = map.item(alloc, item.get()).next;
                if next != 0 {
                    return Some(Offset::new(next));
                }
            }
        }

        let table_size = map.table_size(alloc);
        while self.bucket < table_size {
            let head = map.bucket(alloc, self.bucket);
            self.bucket += 1;
            if head != 0 {
                return Some(Offset::new(head));
            }
        }
        None
    }
}
