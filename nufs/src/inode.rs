//! # Inode table and extent chains
//!
//! Inode records sit packed in the inode table blocks and are addressed by
//! number. A file longer than one block is a chain of inodes, each owning one
//! data block; the head's `size` is the file length and every successor holds
//! `BLOCK_SIZE` bytes less than its predecessor. [`InodeTable::chain`] turns
//! that linked representation into an explicit [`Extent`] list, and every
//! operation below works on such a list, so the suffix-size invariant is
//! checked and restored in this module only.

use derive_more::{Display, From, Into};
use log::{debug, trace};
use vfs::{Error, Result};

use crate::arena::{BlockArena, BlockId};
use crate::layout::{DiskInode, OnDisk, INODES_PER_BLOCK, INODE_BITMAP, INODE_TABLE_START};
use crate::{now, BLOCK_SIZE, INODE_COUNT};

const BLOCK_BYTES: u32 = BLOCK_SIZE as u32;

/// Inode number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[repr(transparent)]
pub struct InodeId(u32);

impl InodeId {
    /// Never allocated, so that no live inode is numbered zero.
    pub const RESERVED: Self = Self(0);
    pub const ROOT: Self = Self(1);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of an extent chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub inode: InodeId,
    pub block: BlockId,
    /// Bytes from this node to the end of the file
    pub size: u32,
}

/// Number of chain nodes a file of `size` bytes occupies.
#[inline]
pub fn chain_len(size: u32) -> usize {
    (size as usize).div_ceil(BLOCK_SIZE).max(1)
}

#[derive(Debug)]
pub struct InodeTable {
    arena: BlockArena,
}

impl InodeTable {
    pub fn new(mut arena: BlockArena) -> Self {
        if !INODE_BITMAP.get(arena.bitmaps(), InodeId::RESERVED.index()) {
            INODE_BITMAP.put(arena.bitmaps_mut(), InodeId::RESERVED.index(), true);
        }
        Self { arena }
    }

    #[inline]
    pub fn arena(&self) -> &BlockArena {
        &self.arena
    }

    #[inline]
    pub fn arena_mut(&mut self) -> &mut BlockArena {
        &mut self.arena
    }

    /// Position of an inode record: **block** and **offset inside the block**.
    fn disk_inode_pos(inum: InodeId) -> (BlockId, usize) {
        let block_id = INODE_TABLE_START + inum.index() / INODES_PER_BLOCK;
        let offset = inum.index() % INODES_PER_BLOCK * DiskInode::SIZE;

        (BlockId::new(block_id as u32), offset)
    }

    pub fn is_allocated(&self, inum: InodeId) -> bool {
        inum.index() < INODE_COUNT && INODE_BITMAP.get(self.arena.bitmaps(), inum.index())
    }

    pub fn get(&self, inum: InodeId) -> Option<DiskInode> {
        self.on_disk(inum, |disk_inode| *disk_inode).ok()
    }

    /// Reads an allocated inode record and processes it.
    pub fn on_disk<V>(&self, inum: InodeId, f: impl FnOnce(&DiskInode) -> V) -> Result<V> {
        if !self.is_allocated(inum) {
            return Err(Error::NotFound);
        }
        let (block_id, offset) = Self::disk_inode_pos(inum);
        self.arena.map(block_id, offset, f)
    }

    /// Modifies an allocated inode record in place.
    pub fn on_disk_mut<V>(&mut self, inum: InodeId, f: impl FnOnce(&mut DiskInode) -> V) -> Result<V> {
        if !self.is_allocated(inum) {
            return Err(Error::NotFound);
        }
        let (block_id, offset) = Self::disk_inode_pos(inum);
        self.arena.map_mut(block_id, offset, f)
    }

    /// Allocates the first free inode together with its data block.
    pub fn allocate(&mut self) -> Result<InodeId> {
        let index = INODE_BITMAP
            .first_clear(self.arena.bitmaps(), 0)
            .ok_or(Error::Exhausted)?;
        let inum = InodeId(index as u32);
        self.claim(inum)?;
        Ok(inum)
    }

    /// Allocates one specific inode slot.
    pub(crate) fn claim(&mut self, inum: InodeId) -> Result<()> {
        if inum.index() >= INODE_COUNT {
            return Err(Error::InvalidArgument("inode number out of range"));
        }
        if self.is_allocated(inum) {
            return Err(Error::AlreadyExists);
        }

        let block = self.arena.alloc_block()?;
        INODE_BITMAP.put(self.arena.bitmaps_mut(), inum.index(), true);
        self.on_disk_mut(inum, |disk_inode| disk_inode.init(block, now()))?;
        trace!("alloc_inode() -> {inum}, block {block}");

        Ok(())
    }

    /// Frees an unreferenced inode and its whole extent chain.
    pub fn free(&mut self, inum: InodeId) -> Result<()> {
        let refs = self.on_disk(inum, |disk_inode| disk_inode.refs)?;
        if refs != 0 {
            return Err(Error::InvalidArgument("inode still has links"));
        }

        debug!("free_inode({inum})");
        let chain = self.chain(inum)?;
        for extent in chain.iter().rev() {
            self.release(extent.inode)?;
        }
        Ok(())
    }

    /// The extent chain starting at `head`, checked against the suffix-size
    /// invariant.
    pub fn chain(&self, head: InodeId) -> Result<Vec<Extent>> {
        let first = self.on_disk(head, |disk_inode| *disk_inode)?;
        let mut chain = Vec::with_capacity(chain_len(first.size));
        let mut cursor = (head, first);

        loop {
            let (inum, node) = cursor;
            if chain.len() == INODE_COUNT {
                return Err(Error::IntegrityViolation("extent chain loops"));
            }
            chain.push(Extent {
                inode: inum,
                block: node.block,
                size: node.size,
            });

            let next = match (node.size > BLOCK_BYTES, node.next) {
                (false, None) => return Ok(chain),
                (true, Some(next)) => next,
                (true, None) => {
                    return Err(Error::IntegrityViolation("extent chain ends early"));
                }
                (false, Some(_)) => {
                    return Err(Error::IntegrityViolation("extent chain continues past its end"));
                }
            };

            let successor = self
                .get(next)
                .ok_or(Error::IntegrityViolation("continuation inode is not allocated"))?;
            if successor.size != node.size - BLOCK_BYTES {
                return Err(Error::IntegrityViolation("continuation size is inconsistent"));
            }
            cursor = (next, successor);
        }
    }

    /// Lengthens the file by `delta` bytes.
    ///
    /// Continuations are allocated before anything is linked; when the image
    /// runs out of space the fresh nodes are released again and the chain is
    /// left untouched.
    pub fn grow(&mut self, head: InodeId, delta: u32) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        let chain = self.chain(head)?;
        let new_size = chain[0]
            .size
            .checked_add(delta)
            .ok_or(Error::InvalidArgument("file size overflows"))?;
        debug!("growing inode {head} from {} to {new_size}", chain[0].size);

        let needed = chain_len(new_size) - chain.len();
        let mut fresh = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.allocate() {
                Ok(inum) => fresh.push(inum),
                Err(err) => {
                    for inum in fresh {
                        self.release(inum)?;
                    }
                    return Err(err);
                }
            }
        }

        let mut tail = chain[chain.len() - 1].inode;
        for &inum in &fresh {
            self.on_disk_mut(tail, |disk_inode| disk_inode.next = Some(inum))?;
            tail = inum;
        }

        let mut size = new_size;
        for inum in chain.iter().map(|extent| extent.inode).chain(fresh) {
            self.on_disk_mut(inum, |disk_inode| disk_inode.size = size)?;
            size = size.saturating_sub(BLOCK_BYTES);
        }

        Ok(())
    }

    /// Shortens the file by `delta` bytes. At least one byte must remain; use
    /// [`InodeTable::clear`] to empty a file.
    pub fn shrink(&mut self, head: InodeId, delta: u32) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        let chain = self.chain(head)?;
        let new_size = chain[0]
            .size
            .checked_sub(delta)
            .filter(|&size| size > 0)
            .ok_or(Error::InvalidArgument("shrink would leave no bytes"))?;
        debug!("shrinking inode {head} from {} to {new_size}", chain[0].size);

        let (kept, dropped) = chain.split_at(chain_len(new_size));
        let tail = kept[kept.len() - 1];

        self.on_disk_mut(tail.inode, |disk_inode| disk_inode.next = None)?;
        for extent in dropped.iter().rev() {
            self.release(extent.inode)?;
        }
        for extent in kept {
            self.on_disk_mut(extent.inode, |disk_inode| disk_inode.size -= delta)?;
        }

        // bytes past the new end must read back as zeros after a later grow
        let tail_len = (tail.size - delta) as usize;
        self.arena.get_block_mut(tail.block)?[tail_len..].fill(0);

        Ok(())
    }

    /// Drops every byte of the file, keeping only the head node.
    pub fn clear(&mut self, head: InodeId) -> Result<()> {
        let chain = self.chain(head)?;
        debug!("clearing inode {head} ({} bytes)", chain[0].size);

        for extent in chain[1..].iter().rev() {
            self.release(extent.inode)?;
        }
        self.on_disk_mut(head, |disk_inode| {
            disk_inode.size = 0;
            disk_inode.next = None;
        })?;
        self.arena.get_block_mut(chain[0].block)?.fill(0);

        Ok(())
    }

    /// Sets the file length to `size`, growing or shrinking as needed.
    pub fn resize(&mut self, head: InodeId, size: u32) -> Result<()> {
        let current = self.on_disk(head, |disk_inode| disk_inode.size)?;
        match size {
            0 => self.clear(head),
            size if size >= current => self.grow(head, size - current),
            size => self.shrink(head, current - size),
        }
    }

    /// Copies file bytes starting at `offset` into `buf`; returns the number
    /// of bytes copied, which is short only at the end of the file.
    pub fn read_at(&self, head: InodeId, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let chain = self.chain(head)?;
        let size = chain[0].size as usize;
        if offset >= size {
            return Ok(0);
        }

        let len = buf.len().min(size - offset);
        let mut copied = 0;
        // whole blocks before `offset` are skipped, then the copy is split at
        // every block boundary
        for extent in chain.iter().skip(offset / BLOCK_SIZE) {
            if copied == len {
                break;
            }
            let start = (offset + copied) % BLOCK_SIZE;
            let count = (BLOCK_SIZE - start).min(len - copied);
            let block = self.arena.get_block(extent.block)?;
            buf[copied..copied + count].copy_from_slice(&block[start..start + count]);
            copied += count;
        }

        Ok(copied)
    }

    /// Copies `buf` into the file at `offset`, growing it first when the
    /// write ends past the current length.
    pub fn write_at(&mut self, head: InodeId, offset: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(buf.len())
            .and_then(|end| u32::try_from(end).ok())
            .ok_or(Error::InvalidArgument("write ends past the largest file size"))?;
        let size = self.on_disk(head, |disk_inode| disk_inode.size)?;
        if end > size {
            self.grow(head, end - size)?;
        }

        let chain = self.chain(head)?;
        let mut written = 0;
        for extent in chain.iter().skip(offset / BLOCK_SIZE) {
            if written == buf.len() {
                break;
            }
            let start = (offset + written) % BLOCK_SIZE;
            let count = (BLOCK_SIZE - start).min(buf.len() - written);
            let block = self.arena.get_block_mut(extent.block)?;
            block[start..start + count].copy_from_slice(&buf[written..written + count]);
            written += count;
        }

        Ok(written)
    }

    /// Number of inode slots still available.
    pub fn free_inodes(&self) -> usize {
        INODE_BITMAP.count_clear(self.arena.bitmaps())
    }
}

impl InodeTable {
    /// Frees one node: its block, its record and its bitmap bit.
    fn release(&mut self, inum: InodeId) -> Result<()> {
        let block = self.on_disk(inum, |disk_inode| disk_inode.block)?;
        trace!("release_inode({inum}), block {block}");

        self.arena.free_block(block)?;
        self.on_disk_mut(inum, |disk_inode| *disk_inode = DiskInode::default())?;
        INODE_BITMAP.put(self.arena.bitmaps_mut(), inum.index(), false);

        Ok(())
    }
}
