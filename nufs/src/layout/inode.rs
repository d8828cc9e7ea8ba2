use vfs::FileType;

use super::{le_i64, le_u32, put_i64, put_u32, OnDisk};
use crate::{BlockId, InodeId};

/// Marks the end of an extent chain.
const NO_CONTINUATION: u32 = u32::MAX;

/// An inode record as stored in the inode table.
///
/// `size` is the *suffix* size: the number of file bytes held by this node
/// and every node after it, not the occupancy of `block` alone.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiskInode {
    /// Hard link count
    pub refs: u32,
    /// Type and permission bits
    pub mode: u32,
    pub size: u32,
    /// The single data block owned by this node
    pub block: BlockId,
    /// Next node of the extent chain
    pub next: Option<InodeId>,
    pub atime: i64,
    pub mtime: i64,
}

impl DiskInode {
    pub const DEFAULT_MODE: u32 = 0o100644;

    #[inline]
    pub fn init(&mut self, block: BlockId, now: i64) {
        *self = Self {
            mode: Self::DEFAULT_MODE,
            block,
            atime: now,
            mtime: now,
            ..Default::default()
        }
    }

    #[inline]
    pub fn kind(&self) -> FileType {
        FileType::from_mode(self.mode).unwrap_or_default()
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind() == FileType::Directory
    }
}

impl OnDisk for DiskInode {
    const SIZE: usize = 64;

    fn decode(bytes: &[u8]) -> Self {
        let next = le_u32(bytes, 16);
        Self {
            refs: le_u32(bytes, 0),
            mode: le_u32(bytes, 4),
            size: le_u32(bytes, 8),
            block: le_u32(bytes, 12).into(),
            next: (next != NO_CONTINUATION).then_some(next.into()),
            atime: le_i64(bytes, 24),
            mtime: le_i64(bytes, 32),
        }
    }

    fn encode(&self, bytes: &mut [u8]) {
        bytes.fill(0);
        put_u32(bytes, 0, self.refs);
        put_u32(bytes, 4, self.mode);
        put_u32(bytes, 8, self.size);
        put_u32(bytes, 12, self.block.into());
        put_u32(bytes, 16, self.next.map_or(NO_CONTINUATION, u32::from));
        put_i64(bytes, 24, self.atime);
        put_i64(bytes, 32, self.mtime);
    }
}
