//! Fixed-size block device over a regular file.
//!
//! Block 0 is reserved for the file header (magic tag, root table's tree
//! root, root table row count). All other blocks are opaque to this layer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace};

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 1024;
pub const MAGIC: &[u8; 8] = b"--CDB--\0";

pub type BlockIndex = u32;

/// A fixed-size block device: aligned reads/writes over an underlying file,
/// zero-filling reads past end-of-file and extending on write.
pub trait BlockDevice {
    fn read_block(&mut self, index: BlockIndex, dest: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, index: BlockIndex, src: &[u8]) -> Result<()>;

    fn read_blocks(&mut self, index: BlockIndex, count: u32, dest: &mut [u8]) -> Result<()> {
        for i in 0..count {
            let start = i as usize * BLOCK_SIZE;
            self.read_block(index + i, &mut dest[start..start + BLOCK_SIZE])?;
        }
        Ok(())
    }

    fn write_blocks(&mut self, index: BlockIndex, count: u32, src: &[u8]) -> Result<()> {
        for i in 0..count {
            let start = i as usize * BLOCK_SIZE;
            self.write_block(index + i, &src[start..start + BLOCK_SIZE])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()>;
}

pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(FileBlockDevice { file })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&mut self, index: BlockIndex, dest: &mut [u8]) -> Result<()> {
        assert_eq!(dest.len(), BLOCK_SIZE);
        trace!("read_block {index}");
        self.file.seek(SeekFrom::Start(index as u64 * BLOCK_SIZE as u64))?;
        let mut read_total = 0;
        loop {
            match self.file.read(&mut dest[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) => return Err(e.into()),
            }
            if read_total == dest.len() {
                break;
            }
        }
        if read_total < dest.len() {
            // past end-of-file: zero-fill the remainder
            for b in &mut dest[read_total..] {
                *b = 0;
            }
        }
        Ok(())
    }

    fn write_block(&mut self, index: BlockIndex, src: &[u8]) -> Result<()> {
        assert_eq!(src.len(), BLOCK_SIZE);
        debug!("write_block {index}");
        self.file.seek(SeekFrom::Start(index as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(src)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// The block-0 file header: magic tag, root table's tree root, row count.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    pub root_table_root: BlockIndex,
    pub root_table_count: u32,
}

impl FileHeader {
    pub fn read(buf: &[u8; BLOCK_SIZE]) -> Option<Self> {
        if &buf[0..8] != MAGIC {
            return None;
        }
        let root_table_root = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let root_table_count = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Some(FileHeader {
            root_table_root,
            root_table_count,
        })
    }

    pub fn write(&self, buf: &mut [u8; BLOCK_SIZE]) {
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.root_table_root.to_le_bytes());
        buf[12..16].copy_from_slice(&self.root_table_count.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_eof_zero_fills() {
        let dir = std::env::temp_dir().join(format!("cdb-block-test-{}", std::process::id()));
        let mut dev = FileBlockDevice::open(&dir).unwrap();
        let mut dest = [0xffu8; BLOCK_SIZE];
        dev.read_block(5, &mut dest).unwrap();
        assert!(dest.iter().all(|&b| b == 0));
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = std::env::temp_dir().join(format!("cdb-block-test2-{}", std::process::id()));
        let mut dev = FileBlockDevice::open(&dir).unwrap();
        let mut src = [0u8; BLOCK_SIZE];
        src[0] = 42;
        dev.write_block(2, &src).unwrap();
        let mut dest = [0u8; BLOCK_SIZE];
        dev.read_block(2, &mut dest).unwrap();
        assert_eq!(src, dest);
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn header_round_trips() {
        let header = FileHeader {
            root_table_root: 7,
            root_table_count: 3,
        };
        let mut buf = [0u8; BLOCK_SIZE];
        header.write(&mut buf);
        let read_back = FileHeader::read(&buf).unwrap();
        assert_eq!(read_back.root_table_root, 7);
        assert_eq!(read_back.root_table_count, 3);
    }

    #[test]
    fn missing_magic_is_none() {
        let buf = [0u8; BLOCK_SIZE];
        assert!(FileHeader::read(&buf).is_none());
    }
}
