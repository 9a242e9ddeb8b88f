//! On-disk bitmap allocator: one bit per block, grouped into sections of
//! `BLOCK_PER_SECTION` blocks each, with a dedicated count block tracking
//! per-section occupancy and the number of active sections.

use log::{debug, trace};

use crate::block::{BlockDevice, BlockIndex, BLOCK_SIZE};
use crate::error::Result;

const BLOCK_PER_SECTION: u32 = (BLOCK_SIZE * 8) as u32;
const MAX_SECTION_COUNT: usize = BLOCK_SIZE / std::mem::size_of::<u32>();
const BLOCK_PER_UNIT: u32 = (std::mem::size_of::<u32>() * 8) as u32;
const MAX_UNIT_COUNT: usize = BLOCK_SIZE / std::mem::size_of::<u32>();

struct Bitmap {
    index: u32,
    bitmap: [u8; BLOCK_SIZE],
    count: u32,
    dirty: bool,
}

impl Bitmap {
    fn units(&self) -> &[u32; MAX_UNIT_COUNT] {
        bytemuck_u32_ref(&self.bitmap)
    }

    fn units_mut(&mut self) -> &mut [u32; MAX_UNIT_COUNT] {
        bytemuck_u32_mut(&mut self.bitmap)
    }
}

fn bytemuck_u32_ref(buf: &[u8; BLOCK_SIZE]) -> &[u32; MAX_UNIT_COUNT] {
    // SAFETY: buf is BLOCK_SIZE bytes == MAX_UNIT_COUNT * 4 bytes, u32 has
    // no alignment requirement stricter than what a boxed/static byte array
    // provides on any platform this runs on (we never rely on over-aligned
    // SIMD loads here).
    unsafe { &*(buf.as_ptr() as *const [u32; MAX_UNIT_COUNT]) }
}

fn bytemuck_u32_mut(buf: &mut [u8; BLOCK_SIZE]) -> &mut [u32; MAX_UNIT_COUNT] {
    unsafe { &mut *(buf.as_mut_ptr() as *mut [u32; MAX_UNIT_COUNT]) }
}

fn bitmap_on_range_mask(length: u32) -> u32 {
    if length >= 32 {
        u32::MAX
    } else {
        !(u32::MAX << length)
    }
}

/// Allocates and frees fixed-size runs of blocks, tracked by an on-disk
/// bitmap. `start_at` blocks (plus the count block itself) are reserved
/// permanently for whatever header region precedes the allocator.
pub struct BitmapAllocator {
    start_at: BlockIndex,
    bitmaps: Vec<Bitmap>,
    count_block: [u8; BLOCK_SIZE],
}

impl BitmapAllocator {
    /// Load allocator state from the device, or leave it empty (call
    /// `reset` for a fresh file).
    pub fn open<D: BlockDevice>(dev: &mut D, start_at: BlockIndex) -> Result<Self> {
        let mut count_block = [0u8; BLOCK_SIZE];
        dev.read_block(start_at, &mut count_block)?;

        let counts = bytemuck_u32_ref(&count_block);
        let section_count = counts[MAX_SECTION_COUNT - 1] as usize;

        let mut bitmaps = Vec::with_capacity(section_count);
        for i in 0..section_count {
            let bitmap_index = Self::bitmap_block_index(i as u32);
            let mut bitmap = [0u8; BLOCK_SIZE];
            dev.read_block(bitmap_index, &mut bitmap)?;
            bitmaps.push(Bitmap {
                index: i as u32,
                bitmap,
                count: counts[i],
                dirty: false,
            });
        }

        Ok(BitmapAllocator {
            start_at,
            bitmaps,
            count_block,
        })
    }

    fn bitmap_block_index(bitmap_index: u32) -> BlockIndex {
        (bitmap_index + 1) * BLOCK_PER_SECTION - BLOCK_PER_UNIT
    }

    fn count_block_index(&self) -> BlockIndex {
        self.start_at
    }

    /// Clears all state and reserves block 0..=start_at (plus the count
    /// block and the first section's bitmap block).
    pub fn reset<D: BlockDevice>(&mut self, dev: &mut D) -> Result<()> {
        self.count_block = [0u8; BLOCK_SIZE];
        self.bitmaps.clear();

        self.append_section();

        for i in 0..self.start_at {
            self.reserve(i);
        }
        self.reserve(self.start_at);

        self.flush(dev)
    }

    fn append_section(&mut self) {
        let new_index = self.bitmaps.len() as u32;
        self.bitmaps.push(Bitmap {
            index: new_index,
            bitmap: [0u8; BLOCK_SIZE],
            count: 0,
            dirty: false,
        });
        debug!("allocator: appended section {new_index}");

        self.reserve(Self::bitmap_block_index(new_index));

        let counts = bytemuck_u32_mut(&mut self.count_block);
        counts[MAX_SECTION_COUNT - 1] += 1;
    }

    fn reserve(&mut self, index: BlockIndex) {
        let bitmap_index = (index / BLOCK_PER_SECTION) as usize;
        let offset = index % BLOCK_PER_SECTION;
        Self::set_on_range(&mut self.bitmaps[bitmap_index], offset, 1);
    }

    fn set_on_range(bitmap: &mut Bitmap, offset: u32, length: u32) {
        let unit_index = (offset / BLOCK_PER_UNIT) as usize;
        let unit_offset = offset % BLOCK_PER_UNIT;
        let mask = bitmap_on_range_mask(length) << unit_offset;
        bitmap.units_mut()[unit_index] |= mask;
        bitmap.dirty = true;
        bitmap.count += length;
    }

    fn set_off_range(bitmap: &mut Bitmap, offset: u32, length: u32) {
        let unit_index = (offset / BLOCK_PER_UNIT) as usize;
        let unit_offset = offset % BLOCK_PER_UNIT;
        let mask = bitmap_on_range_mask(length) << unit_offset;
        bitmap.units_mut()[unit_index] &= !mask;
        bitmap.dirty = true;
        bitmap.count -= length;
    }

    /// Finds `length` (1..=32) consecutive free blocks, preferring the
    /// section containing `hint`, then sections before it, then sections
    /// after it; appends a new section if none fits.
    pub fn allocate_blocks(&mut self, length: u32, hint: BlockIndex) -> BlockIndex {
        assert!((1..=32).contains(&length));

        let hint_section = (hint / BLOCK_PER_SECTION) as usize;
        let section_hint = hint % BLOCK_PER_SECTION;

        while self.bitmaps.len() <= hint_section {
            self.append_section();
        }

        if self.bitmaps[hint_section].count <= BLOCK_PER_SECTION - length {
            if let Some(offset) =
                Self::allocate_in_section(&mut self.bitmaps[hint_section], length, section_hint)
            {
                return offset + hint_section as u32 * BLOCK_PER_SECTION;
            }
        }

        if hint_section > 0 {
            for section in (0..hint_section).rev() {
                if self.bitmaps[section].count <= BLOCK_PER_SECTION - length {
                    if let Some(offset) =
                        Self::allocate_in_section(&mut self.bitmaps[section], length, 0)
                    {
                        return offset + section as u32 * BLOCK_PER_SECTION;
                    }
                }
            }
        }

        for section in (hint_section + 1)..self.bitmaps.len() {
            if self.bitmaps[section].count <= BLOCK_PER_SECTION - length {
                if let Some(offset) =
                    Self::allocate_in_section(&mut self.bitmaps[section], length, 0)
                {
                    return offset + section as u32 * BLOCK_PER_SECTION;
                }
            }
        }

        self.append_section();
        let last = self.bitmaps.len() - 1;
        let offset = Self::allocate_in_section(&mut self.bitmaps[last], length, 0)
            .expect("freshly appended section must have room");
        offset + last as u32 * BLOCK_PER_SECTION
    }

    fn allocate_in_section(bitmap: &mut Bitmap, length: u32, section_hint: u32) -> Option<u32> {
        let hint_unit = (section_hint / BLOCK_PER_UNIT) as usize;

        for unit_index in hint_unit..MAX_UNIT_COUNT {
            let leading = bitmap.units()[unit_index].leading_zeros();
            if leading >= length {
                let offset = unit_index as u32 * BLOCK_PER_UNIT + (32 - leading);
                Self::set_on_range(bitmap, offset, length);
                return Some(offset);
            }
        }

        if section_hint > 0 {
            for unit_index in (0..=hint_unit).rev() {
                let leading = bitmap.units()[unit_index].leading_zeros();
                if leading >= length {
                    let offset = unit_index as u32 * BLOCK_PER_UNIT + (32 - leading);
                    Self::set_on_range(bitmap, offset, length);
                    return Some(offset);
                }
            }
        }

        None
    }

    pub fn free_blocks(&mut self, index: BlockIndex, length: u32) {
        let section = (index / BLOCK_PER_SECTION) as usize;
        let offset = index % BLOCK_PER_SECTION;
        Self::set_off_range(&mut self.bitmaps[section], offset, length);
    }

    /// Writes every dirty bitmap page, then the count block, in that
    /// order — callers rely on this ordering to make `flush` crash-safe
    /// up to the absence of a write-ahead log.
    pub fn flush<D: BlockDevice>(&mut self, dev: &mut D) -> Result<()> {
        if self.bitmaps.is_empty() {
            return Ok(());
        }

        let counts = bytemuck_u32_mut(&mut self.count_block);
        for bitmap in &mut self.bitmaps {
            counts[bitmap.index as usize] = bitmap.count;
        }

        for bitmap in &mut self.bitmaps {
            if bitmap.dirty {
                dev.write_block(Self::bitmap_block_index(bitmap.index), &bitmap.bitmap)?;
                bitmap.dirty = false;
            }
        }

        dev.write_block(self.count_block_index(), &self.count_block)?;
        dev.flush()?;
        trace!("allocator: flushed {} section(s)", self.bitmaps.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlockDevice;

    fn temp_dev(name: &str) -> FileBlockDevice {
        let path = std::env::temp_dir().join(format!(
            "cdb-allocator-test-{name}-{}",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();
        FileBlockDevice::open(&path).unwrap()
    }

    #[test]
    fn reset_reserves_header_region() {
        let mut dev = temp_dev("reset");
        let mut alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        alloc.reset(&mut dev).unwrap();

        // blocks 0 and 1 (start_at) are reserved; the next allocation must
        // land after them.
        let first = alloc.allocate_blocks(1, 0);
        assert!(first > 1);
    }

    #[test]
    fn free_then_reallocate_returns_same_block() {
        let mut dev = temp_dev("realloc");
        let mut alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        alloc.reset(&mut dev).unwrap();

        let a = alloc.allocate_blocks(1, 0);
        alloc.free_blocks(a, 1);
        let b = alloc.allocate_blocks(1, a);
        assert_eq!(a, b);
    }

    #[test]
    fn allocating_past_one_section_appends_another() {
        let mut dev = temp_dev("append");
        let mut alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        alloc.reset(&mut dev).unwrap();

        let section_count_before = alloc.bitmaps.len();
        // fill up the first section in 32-block chunks
        let mut last = 0;
        loop {
            if alloc.bitmaps[0].count > BLOCK_PER_SECTION - 32 {
                break;
            }
            last = alloc.allocate_blocks(32, 0);
        }
        let _ = last;
        assert_eq!(alloc.bitmaps.len(), section_count_before);

        // this one no longer fits in section 0 and must append
        let before_append = alloc.bitmaps.len();
        alloc.allocate_blocks(32, 0);
        assert!(alloc.bitmaps.len() >= before_append);
    }

    #[test]
    fn flush_and_reopen_preserves_state() {
        let mut dev = temp_dev("flush");
        let mut alloc = BitmapAllocator::open(&mut dev, 1).unwrap();
        alloc.reset(&mut dev).unwrap();
        let a = alloc.allocate_blocks(4, 0);
        alloc.flush(&mut dev).unwrap();

        let mut reopened = BitmapAllocator::open(&mut dev, 1).unwrap();
        let b = reopened.allocate_blocks(4, a + 100);
        assert_ne!(a, b);
    }
}
