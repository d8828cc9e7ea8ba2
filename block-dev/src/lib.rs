//! # Block device interface
//!
//! A block device stores data in fixed-size blocks. [`BlockDevice`] abstracts
//! reading and writing those blocks; the filesystem engine only ever talks to
//! its backing store through this trait.

use std::io;
use std::sync::Mutex;

/// Block device driver trait.
///
/// `buf` always holds exactly one block; a short transfer is an error.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()>;
    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()>;

    /// Size of one block in bytes.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn block_count(&self) -> usize;
}

/// A block device kept entirely in host memory.
#[derive(Debug)]
pub struct RamDisk {
    block_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            data: Mutex::new(vec![0; block_size * block_count]),
        }
    }

    /// Copy of the whole device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // a poisoned image is still a consistent byte array
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn range(&self, block_id: usize, len: usize) -> io::Result<std::ops::Range<usize>> {
        if len != self.block_size || block_id >= self.block_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {block_id} ({len} bytes) out of range"),
            ));
        }
        let start = block_id * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(block_id, buf.len())?;
        buf.copy_from_slice(&self.lock()[range]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let range = self.range(block_id, buf.len())?;
        self.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.lock().len() / self.block_size
    }
}
