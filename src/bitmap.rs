use super::*;
use block_cache::BufferHandle;

use log::warn;

pub fn test_bit(data: &BlockData, bit: usize) -> bool {
    data[bit / 8] & (1 << (bit % 8)) != 0
}

pub fn set_bit(data: &mut BlockData, bit: usize) {
    data[bit / 8] |= 1 << (bit % 8);
}

/// clear `bit`, returning whether it was set
pub fn clear_bit(data: &mut BlockData, bit: usize) -> bool {
    let was_set = test_bit(data, bit);
    data[bit / 8] &= !(1 << (bit % 8));
    was_set
}

/// first 0 bit of the block
fn find_first_zero(data: &BlockData) -> Option<usize> {
    data.chunks_exact(8).enumerate().find_map(|(i, chunk)| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let word = u64::from_le_bytes(bytes);
        (word != u64::MAX).then(|| i * 64 + word.trailing_ones() as usize)
    })
}

/// A free-space bitmap made of up to 8 pinned cache blocks. Ordinal `n`
/// stands for number `base + n`; numbers at or past `end` do not exist.
pub struct BitMap {
    blocks: Vec<BufferHandle>,
    base: u32,
    end: u32,
}

impl BitMap {
    pub fn new(blocks: Vec<BufferHandle>, base: u32, end: u32) -> Self {
        assert!(blocks.len() <= I_MAP_SLOTS.max(Z_MAP_SLOTS));
        BitMap { blocks, base, end }
    }

    fn locate(&self, number: u32) -> (usize, usize) {
        let ordinal = number
            .checked_sub(self.base)
            .unwrap_or_else(|| panic!("number {} below bitmap base {}", number, self.base))
            as usize;
        (ordinal >> 13, ordinal & (BITS_PER_BLOCK - 1))
    }

    /// First-fit: the lowest clear bit of the first block that has one.
    pub fn alloc(&self) -> Option<u32> {
        for (slot, bh) in self.blocks.iter().enumerate() {
            let Some(bit) = bh.modify(|data| {
                let bit = find_first_zero(data)?;
                set_bit(data, bit);
                Some(bit)
            }) else {
                continue;
            };
            bh.mark_dirty();

            let number = self.base as usize + slot * BITS_PER_BLOCK + bit;
            if number >= self.end as usize {
                // the bit maps past the end; give it back rather than leak it
                warn!("bitmap: number {} beyond end {}", number, self.end);
                bh.modify(|data| clear_bit(data, bit));
                return None;
            }
            return Some(number as u32);
        }
        None
    }

    /// Clear the bit of `number`. Clearing a clear bit is fatal.
    pub fn free(&self, number: u32) {
        let (slot, bit) = self.locate(number);
        let bh = self
            .blocks
            .get(slot)
            .unwrap_or_else(|| panic!("no bitmap block for {}", number));
        let was_set = bh.modify(|data| clear_bit(data, bit));
        bh.mark_dirty();
        if !was_set {
            panic!("bit {} already cleared", number);
        }
    }

    pub fn is_set(&self, number: u32) -> bool {
        let (slot, bit) = self.locate(number);
        self.blocks
            .get(slot)
            .is_some_and(|bh| bh.read(|data| test_bit(data, bit)))
    }

    /// # of clear bits for existing numbers
    pub fn count_free(&self) -> usize {
        self.blocks
            .iter()
            .enumerate()
            .map(|(slot, bh)| {
                bh.read(|data| {
                    (0..BITS_PER_BLOCK)
                        .filter(|&bit| {
                            (self.base as usize + slot * BITS_PER_BLOCK + bit) < self.end as usize
                                && !test_bit(data, bit)
                        })
                        .count()
                })
            })
            .sum()
    }
}
