//! Reference-counted page accessors.
//!
//! Two implementations share one object-safe backend trait: `BasicAccessor`
//! keeps every resident block in a hash map and writes back whenever a
//! block's refcount drops to zero; `CachedAccessor` groups blocks into
//! 1 MiB cache lines and only writes back a page when the caller marks its
//! `release` as dirty. Both own a `BitmapAllocator` over the same device,
//! mirroring the C++ source's `DriverAccesser` pairing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace};

use crate::allocator::BitmapAllocator;
use crate::block::{BlockDevice, BlockIndex, BLOCK_SIZE};
use crate::error::{Error, Result};

/// Backend shared by `PageHandle`; not meant to be used directly.
pub trait AccessorBackend {
    fn acquire_ptr(&mut self, index: BlockIndex) -> Result<*mut [u8; BLOCK_SIZE]>;
    fn release(&mut self, index: BlockIndex, dirty: bool) -> Result<()>;
    fn allocate_blocks(&mut self, length: u32, hint: BlockIndex) -> BlockIndex;
    fn free_blocks(&mut self, index: BlockIndex, length: u32);
    fn flush(&mut self) -> Result<()>;
}

pub type Accessor = Rc<RefCell<dyn AccessorBackend>>;

/// A scoped, single acquire of one block.
///
/// Releasing happens on `Drop`; cloning re-acquires (refcount +1). Every
/// mutation made through `as_mut_slice` must be released as dirty — there
/// is no way to prove immutability from a `&mut [u8]` borrow, so the
/// handle defaults `dirty` to `true` and callers opt out with
/// `mark_clean()` only when they are certain they only read.
pub struct PageHandle {
    accessor: Accessor,
    index: BlockIndex,
    ptr: *mut [u8; BLOCK_SIZE],
    dirty: bool,
}

impl PageHandle {
    pub fn acquire(accessor: &Accessor, index: BlockIndex) -> Result<Self> {
        let ptr = accessor.borrow_mut().acquire_ptr(index)?;
        Ok(PageHandle {
            accessor: accessor.clone(),
            index,
            ptr,
            dirty: true,
        })
    }

    pub fn index(&self) -> BlockIndex {
        self.index
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn as_slice(&self) -> &[u8; BLOCK_SIZE] {
        // SAFETY: the pointer stays valid as long as this handle (and
        // hence the refcount it holds) is alive; the backend never moves
        // or frees a block's buffer while its refcount is nonzero.
        unsafe { &*self.ptr }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8; BLOCK_SIZE] {
        unsafe { &mut *self.ptr }
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        PageHandle::acquire(&self.accessor, self.index)
            .expect("re-acquiring an already-resident block cannot fail")
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        let _ = self.accessor.borrow_mut().release(self.index, self.dirty);
    }
}

struct BasicEntry {
    buf: Box<[u8; BLOCK_SIZE]>,
    refcount: u32,
}

/// Plain reference-counted accessor: resident pages live in a hash map and
/// are written back unconditionally once their refcount reaches zero.
pub struct BasicAccessor<D: BlockDevice> {
    dev: D,
    allocator: BitmapAllocator,
    pages: HashMap<BlockIndex, BasicEntry>,
}

impl<D: BlockDevice> BasicAccessor<D> {
    pub fn new(dev: D, allocator: BitmapAllocator) -> Accessor {
        Rc::new(RefCell::new(BasicAccessor {
            dev,
            allocator,
            pages: HashMap::new(),
        }))
    }
}

impl<D: BlockDevice> AccessorBackend for BasicAccessor<D> {
    fn acquire_ptr(&mut self, index: BlockIndex) -> Result<*mut [u8; BLOCK_SIZE]> {
        if let Some(entry) = self.pages.get_mut(&index) {
            entry.refcount += 1;
            return Ok(entry.buf.as_mut() as *mut [u8; BLOCK_SIZE]);
        }

        let mut buf = Box::new([0u8; BLOCK_SIZE]);
        self.dev.read_block(index, buf.as_mut())?;
        let ptr = buf.as_mut() as *mut [u8; BLOCK_SIZE];
        self.pages.insert(index, BasicEntry { buf, refcount: 1 });
        Ok(ptr)
    }

    fn release(&mut self, index: BlockIndex, dirty: bool) -> Result<()> {
        let entry = self
            .pages
            .get_mut(&index)
            .ok_or_else(|| Error::Fatal(format!("release of non-resident block {index}")))?;
        entry.refcount -= 1;
        if dirty {
            self.dev.write_block(index, entry.buf.as_ref())?;
        }
        if entry.refcount == 0 {
            self.pages.remove(&index);
        }
        Ok(())
    }

    fn allocate_blocks(&mut self, length: u32, hint: BlockIndex) -> BlockIndex {
        self.allocator.allocate_blocks(length, hint)
    }

    fn free_blocks(&mut self, index: BlockIndex, length: u32) {
        self.allocator.free_blocks(index, length)
    }

    fn flush(&mut self) -> Result<()> {
        for (index, entry) in self.pages.iter() {
            self.dev.write_block(*index, entry.buf.as_ref())?;
        }
        self.allocator.flush(&mut self.dev)?;
        self.dev.flush()
    }
}

impl<D: BlockDevice> Drop for BasicAccessor<D> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

const CACHE_BLOCK_SIZE: usize = 1024 * 1024; // 1 MiB
const BLOCK_PER_CACHE: u32 = (CACHE_BLOCK_SIZE / BLOCK_SIZE) as u32;
const CACHE_MAX_LINES: usize = 100;

struct CacheLine {
    tag: BlockIndex,
    refcount: u32,
    accessed: u64,
    buf: Box<[u8; CACHE_BLOCK_SIZE]>,
}

/// LRU-bounded accessor: blocks are grouped into `BLOCK_PER_CACHE`-block
/// cache lines, and release only writes back when the caller asserts
/// `dirty`.
pub struct CachedAccessor<D: BlockDevice> {
    dev: D,
    allocator: BitmapAllocator,
    lines: Vec<CacheLine>,
    clock: u64,
}

impl<D: BlockDevice> CachedAccessor<D> {
    pub fn new(dev: D, allocator: BitmapAllocator) -> Accessor {
        Rc::new(RefCell::new(CachedAccessor {
            dev,
            allocator,
            lines: Vec::new(),
            clock: 0,
        }))
    }

    fn tag_of(index: BlockIndex) -> BlockIndex {
        index / BLOCK_PER_CACHE
    }

    fn offset_of(index: BlockIndex) -> usize {
        (index % BLOCK_PER_CACHE) as usize * BLOCK_SIZE
    }

    fn find_line(&self, tag: BlockIndex) -> Option<usize> {
        self.lines.iter().position(|l| l.tag == tag)
    }

    fn evict_one(&mut self) -> Result<()> {
        let victim = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.refcount == 0)
            .min_by_key(|(_, l)| l.accessed)
            .map(|(i, _)| i)
            .ok_or_else(|| Error::Fatal("cache exhausted: no evictable line".into()))?;
        self.lines.remove(victim);
        Ok(())
    }
}

impl<D: BlockDevice> AccessorBackend for CachedAccessor<D> {
    fn acquire_ptr(&mut self, index: BlockIndex) -> Result<*mut [u8; BLOCK_SIZE]> {
        let tag = Self::tag_of(index);
        self.clock += 1;

        if let Some(pos) = self.find_line(tag) {
            self.lines[pos].refcount += 1;
            self.lines[pos].accessed = self.clock;
            let offset = Self::offset_of(index);
            let ptr = unsafe {
                (self.lines[pos].buf.as_mut_ptr().add(offset)) as *mut [u8; BLOCK_SIZE]
            };
            return Ok(ptr);
        }

        if self.lines.len() == CACHE_MAX_LINES {
            self.evict_one()?;
            debug!("cached accessor: evicted a line to make room for tag {tag}");
        }

        let mut buf = Box::new([0u8; CACHE_BLOCK_SIZE]);
        self.dev
            .read_blocks(tag * BLOCK_PER_CACHE, BLOCK_PER_CACHE, buf.as_mut())?;
        self.lines.push(CacheLine {
            tag,
            refcount: 1,
            accessed: self.clock,
            buf,
        });
        let pos = self.lines.len() - 1;
        let offset = Self::offset_of(index);
        let ptr =
            unsafe { (self.lines[pos].buf.as_mut_ptr().add(offset)) as *mut [u8; BLOCK_SIZE] };
        Ok(ptr)
    }

    fn release(&mut self, index: BlockIndex, dirty: bool) -> Result<()> {
        let tag = Self::tag_of(index);
        let pos = self
            .find_line(tag)
            .ok_or_else(|| Error::Fatal(format!("release of non-resident block {index}")))?;
        self.lines[pos].refcount -= 1;

        if dirty {
            let offset = Self::offset_of(index);
            let slice = &self.lines[pos].buf[offset..offset + BLOCK_SIZE];
            self.dev.write_block(index, slice)?;
        }

        trace!("cached accessor: released block {index} dirty={dirty}");
        Ok(())
    }

    fn allocate_blocks(&mut self, length: u32, hint: BlockIndex) -> BlockIndex {
        self.allocator.allocate_blocks(length, hint)
    }

    fn free_blocks(&mut self, index: BlockIndex, length: u32) {
        self.allocator.free_blocks(index, length)
    }

    fn flush(&mut self) -> Result<()> {
        self.allocator.flush(&mut self.dev)?;
        self.dev.flush()
    }
}

impl<D: BlockDevice> Drop for CachedAccessor<D> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Convenience: allocate a single block through an accessor.
pub fn allocate_block(accessor: &Accessor, hint: BlockIndex) -> BlockIndex {
    accessor.borrow_mut().allocate_blocks(1, hint)
}

pub fn free_block(accessor: &Accessor, index: BlockIndex) {
    accessor.borrow_mut().free_blocks(index, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlockDevice;

    fn temp_device(name: &str) -> FileBlockDevice {
        let path =
            std::env::temp_dir().join(format!("cdb-accessor-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&path).ok();
        FileBlockDevice::open(&path).unwrap()
    }

    #[test]
    fn basic_accessor_round_trips_through_release() {
        let mut dev = temp_device("basic");
        let alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        let accessor = BasicAccessor::new(dev, alloc);

        {
            let mut handle = PageHandle::acquire(&accessor, 5).unwrap();
            handle.as_mut_slice()[0] = 42;
        }

        let handle = PageHandle::acquire(&accessor, 5).unwrap();
        assert_eq!(handle.as_slice()[0], 42);
    }

    #[test]
    fn clone_bumps_refcount_and_both_see_same_data() {
        let mut dev = temp_device("clone");
        let alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        let accessor = BasicAccessor::new(dev, alloc);

        let mut handle = PageHandle::acquire(&accessor, 3).unwrap();
        handle.as_mut_slice()[10] = 7;
        let handle2 = handle.clone();
        assert_eq!(handle2.as_slice()[10], 7);
    }

    #[test]
    fn cached_accessor_round_trips() {
        let mut dev = temp_device("cached");
        let alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        let accessor = CachedAccessor::new(dev, alloc);

        {
            let mut handle = PageHandle::acquire(&accessor, 2000).unwrap();
            handle.as_mut_slice()[3] = 99;
        }

        let handle = PageHandle::acquire(&accessor, 2000).unwrap();
        assert_eq!(handle.as_slice()[3], 99);
    }
}
