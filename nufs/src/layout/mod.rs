//! # On-disk data structures
//!
//! nufs image layout (one block per cell, `BLOCK_SIZE` bytes each):
//! bitmaps | inode table (4 blocks) | data blocks
//!
//! Block 0 carries both bitmaps: the block bitmap first, the inode bitmap
//! packed right behind it. Every multi-byte field is little-endian.

mod bitmap;
pub use bitmap::Bitmap;

mod inode;
pub use inode::DiskInode;

mod dir_entry;
pub use dir_entry::{DirEntry, NAME_MAX};

use crate::{BLOCK_COUNT, BLOCK_SIZE, INODE_COUNT};

/// Bytes of block 0 taken by the block bitmap.
pub const BLOCK_BITMAP_SIZE: usize = BLOCK_COUNT.div_ceil(8);
/// Bytes of block 0 taken by the inode bitmap.
pub const INODE_BITMAP_SIZE: usize = INODE_COUNT.div_ceil(8);

pub const BLOCK_BITMAP: Bitmap = Bitmap::new(0, BLOCK_COUNT);
pub const INODE_BITMAP: Bitmap = Bitmap::new(BLOCK_BITMAP_SIZE, INODE_COUNT);

pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / DiskInode::SIZE;
/// First block of the inode table.
pub const INODE_TABLE_START: usize = 1;
pub const INODE_TABLE_BLOCKS: usize = INODE_COUNT.div_ceil(INODES_PER_BLOCK);
/// Blocks below this index are never handed out by the allocator.
pub const FIRST_DATA_BLOCK: usize = INODE_TABLE_START + INODE_TABLE_BLOCKS;

const _: () = assert!(BLOCK_BITMAP_SIZE + INODE_BITMAP_SIZE <= BLOCK_SIZE);
const _: () = assert!(FIRST_DATA_BLOCK < BLOCK_COUNT);

/// A fixed-size record with an explicit byte encoding.
pub trait OnDisk: Sized {
    const SIZE: usize;

    /// `bytes` is exactly [`Self::SIZE`] long.
    fn decode(bytes: &[u8]) -> Self;

    /// `bytes` is exactly [`Self::SIZE`] long.
    fn encode(&self, bytes: &mut [u8]);
}

#[inline]
fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn le_i64(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

#[inline]
fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_i64(bytes: &mut [u8], at: usize, value: i64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
