use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use block_dev::BlockDevice;
use nufs::{BLOCK_COUNT, BLOCK_SIZE, IMAGE_SIZE};

/// A disk image stored in a host file.
#[derive(Debug)]
pub struct BlockFile(Mutex<File>);

impl BlockFile {
    pub fn new(fd: File) -> Self {
        Self(Mutex::new(fd))
    }

    /// Opens the image at `path`, creating it and fixing its length to
    /// `IMAGE_SIZE` when needed. Existing contents are kept.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if fd.metadata()?.len() != IMAGE_SIZE as u64 {
            fd.set_len(IMAGE_SIZE as u64)?;
        }

        Ok(Self::new(fd))
    }

    fn file(&self) -> MutexGuard<'_, File> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seek_to(file: &mut File, block_id: usize, len: usize) -> io::Result<()> {
        if len != BLOCK_SIZE || block_id >= BLOCK_COUNT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {block_id} ({len} bytes) outside the image"),
            ));
        }
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))?;
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file();
        Self::seek_to(&mut file, block_id, buf.len())?;
        file.read_exact(buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let mut file = self.file();
        Self::seek_to(&mut file, block_id, buf.len())?;
        file.write_all(buf)
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> usize {
        BLOCK_COUNT
    }
}
