use crate::DataBlock;

/// A run of bits inside the bitmap block, one bit per tracked item.
///
/// Bit `i` lives in byte `offset + i / 8` at position `i % 8`; a set bit means
/// the item is in use.
#[derive(Debug, Clone, Copy)]
pub struct Bitmap {
    /// Byte offset of the bitmap inside its block
    offset: usize,
    /// Number of tracked items
    bits: usize,
}

impl Bitmap {
    #[inline]
    pub const fn new(offset: usize, bits: usize) -> Self {
        Self { offset, bits }
    }

    pub fn get(&self, block: &DataBlock, index: usize) -> bool {
        debug_assert!(index < self.bits);
        block[self.offset + index / 8] & (1 << (index % 8)) != 0
    }

    pub fn put(&self, block: &mut DataBlock, index: usize, used: bool) {
        debug_assert!(index < self.bits);
        let byte = &mut block[self.offset + index / 8];
        if used {
            *byte |= 1 << (index % 8);
        } else {
            *byte &= !(1 << (index % 8));
        }
    }

    /// Index of the first clear bit at or after `from`.
    pub fn first_clear(&self, block: &DataBlock, from: usize) -> Option<usize> {
        let bytes = &block[self.offset..self.offset + self.bits.div_ceil(8)];

        bytes
            .iter()
            .enumerate()
            .skip(from / 8)
            .find_map(|(byte_index, &bits)| {
                // bits below `from` in its own byte count as taken
                let bits = if byte_index == from / 8 {
                    bits | ((1u8 << (from % 8)) - 1)
                } else {
                    bits
                };
                (bits != u8::MAX).then(|| byte_index * 8 + bits.trailing_ones() as usize)
            })
            .filter(|&index| index < self.bits)
    }

    pub fn count_clear(&self, block: &DataBlock) -> usize {
        (0..self.bits).filter(|&index| !self.get(block, index)).count()
    }
}
