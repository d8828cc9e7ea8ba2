//! # Block arena
//!
//! The whole image stays resident in memory for the lifetime of the mount.
//! Callers reach it only through block indices: [`BlockArena::get_block`]
//! hands out one block at a time and [`BlockArena::map`] decodes typed
//! records at a checked offset. Modified blocks are remembered and written
//! back to the device by [`BlockArena::sync`].

use std::fmt;
use std::sync::Arc;

use block_dev::BlockDevice;
use derive_more::{Display, From, Into};
use log::trace;
use vfs::{Error, Result};

use crate::layout::{OnDisk, BLOCK_BITMAP, FIRST_DATA_BLOCK};
use crate::{DataBlock, BLOCK_COUNT, BLOCK_SIZE};

/// Index of a block inside the image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    /// The block holding both bitmaps.
    pub const BITMAPS: Self = Self(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct BlockArena {
    device: Arc<dyn BlockDevice>,
    blocks: Box<[DataBlock]>,
    /// Blocks changed since the last sync
    dirty: Vec<bool>,
}

impl BlockArena {
    /// Reads the whole image from `device` and marks the metadata blocks in
    /// use.
    pub fn load(device: Arc<dyn BlockDevice>) -> Result<Self> {
        if device.block_size() != BLOCK_SIZE || device.block_count() < BLOCK_COUNT {
            return Err(Error::InvalidArgument(
                "device geometry does not match the image layout",
            ));
        }

        let mut blocks = vec![[0u8; BLOCK_SIZE]; BLOCK_COUNT].into_boxed_slice();
        for (block_id, block) in blocks.iter_mut().enumerate() {
            device.read_block(block_id, block)?;
        }

        let mut arena = Self {
            device,
            blocks,
            dirty: vec![false; BLOCK_COUNT],
        };

        // bitmaps and inode table are always in use
        for index in 0..FIRST_DATA_BLOCK {
            if !BLOCK_BITMAP.get(arena.bitmaps(), index) {
                BLOCK_BITMAP.put(arena.bitmaps_mut(), index, true);
            }
        }

        Ok(arena)
    }

    pub fn get_block(&self, block_id: BlockId) -> Result<&DataBlock> {
        self.blocks
            .get(block_id.index())
            .ok_or(Error::InvalidArgument("block index out of range"))
    }

    pub fn get_block_mut(&mut self, block_id: BlockId) -> Result<&mut DataBlock> {
        let block = self
            .blocks
            .get_mut(block_id.index())
            .ok_or(Error::InvalidArgument("block index out of range"))?;
        self.dirty[block_id.index()] = true;
        Ok(block)
    }

    /// Decodes the `T` stored at `offset` of a block and hands it to `f`.
    pub fn map<T: OnDisk, V>(
        &self,
        block_id: BlockId,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> Result<V> {
        let block = self.get_block(block_id)?;
        let bytes = Self::record::<T>(block, offset)?;
        Ok(f(&T::decode(bytes)))
    }

    /// Like [`BlockArena::map`], but writes the record back once `f` returns.
    pub fn map_mut<T: OnDisk, V>(
        &mut self,
        block_id: BlockId,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> Result<V> {
        let block = self.get_block_mut(block_id)?;
        let bytes = Self::record_mut::<T>(block, offset)?;
        let mut record = T::decode(bytes);
        let value = f(&mut record);
        record.encode(bytes);
        Ok(value)
    }

    /// Allocates the first free data block and zero-fills it.
    pub fn alloc_block(&mut self) -> Result<BlockId> {
        let index = BLOCK_BITMAP
            .first_clear(self.bitmaps(), FIRST_DATA_BLOCK)
            .ok_or(Error::Exhausted)?;
        BLOCK_BITMAP.put(self.bitmaps_mut(), index, true);

        let block_id = BlockId(index as u32);
        self.get_block_mut(block_id)?.fill(0);
        trace!("alloc_block() -> {block_id}");

        Ok(block_id)
    }

    /// Returns a block to the free pool. The caller guarantees nothing refers
    /// to it any more.
    pub fn free_block(&mut self, block_id: BlockId) -> Result<()> {
        let index = block_id.index();
        if index < FIRST_DATA_BLOCK || index >= BLOCK_COUNT {
            return Err(Error::InvalidArgument("block is reserved or out of range"));
        }
        if !BLOCK_BITMAP.get(self.bitmaps(), index) {
            return Err(Error::IntegrityViolation("freeing a block that is not in use"));
        }

        trace!("free_block({block_id})");
        BLOCK_BITMAP.put(self.bitmaps_mut(), index, false);
        Ok(())
    }

    pub fn is_allocated(&self, block_id: BlockId) -> bool {
        block_id.index() < BLOCK_COUNT && BLOCK_BITMAP.get(self.bitmaps(), block_id.index())
    }

    /// Number of blocks the allocator can still hand out.
    pub fn free_blocks(&self) -> usize {
        BLOCK_BITMAP.count_clear(self.bitmaps())
    }

    /// Writes every modified block back to the device.
    pub fn sync(&mut self) -> Result<()> {
        for (index, dirty) in self.dirty.iter_mut().enumerate() {
            if *dirty {
                self.device.write_block(index, &self.blocks[index])?;
                *dirty = false;
            }
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn bitmaps(&self) -> &DataBlock {
        &self.blocks[BlockId::BITMAPS.index()]
    }

    #[inline]
    pub(crate) fn bitmaps_mut(&mut self) -> &mut DataBlock {
        self.dirty[BlockId::BITMAPS.index()] = true;
        &mut self.blocks[BlockId::BITMAPS.index()]
    }
}

impl BlockArena {
    fn record<T: OnDisk>(block: &DataBlock, offset: usize) -> Result<&[u8]> {
        block
            .get(offset..offset + T::SIZE)
            .ok_or(Error::InvalidArgument("record crosses the block boundary"))
    }

    fn record_mut<T: OnDisk>(block: &mut DataBlock, offset: usize) -> Result<&mut [u8]> {
        block
            .get_mut(offset..offset + T::SIZE)
            .ok_or(Error::InvalidArgument("record crosses the block boundary"))
    }
}

impl fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockArena")
            .field("free_blocks", &self.free_blocks())
            .field("dirty", &self.dirty.iter().filter(|&&dirty| dirty).count())
            .finish_non_exhaustive()
    }
}
