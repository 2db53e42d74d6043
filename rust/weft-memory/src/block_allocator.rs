use std::sync::atomic::Ordering;

use crate::Region;

/// Bitmap-based fixed-size block pool carved out of a [`Region`].
///
/// A set bit in the bitmap marks a free block; allocation clears it with a
/// compare-and-swap, freeing sets it again. Safe under concurrent use from
/// many threads on either side of the shared region.
pub struct BlockAllocator {
    region: Region,
    bitmap_offset: usize,
    blocks_offset: usize,
    block_size_words: usize,
    capacity: u32,
    bitmap_words: usize,
}

impl BlockAllocator {
    /// Number of words this allocator occupies for a given geometry.
    pub fn words_required(block_size_bytes: u32, capacity: u32) -> usize {
        let bitmap_words = (capacity as usize + 63) / 64;
        bitmap_words + (block_size_bytes as usize / 8) * capacity as usize
    }

    /// Lay an allocator over `region` starting at `base_offset` words. The
    /// bitmap occupies the first words, blocks follow.
    pub fn new(region: Region, base_offset: usize, block_size_bytes: u32, capacity: u32) -> Self {
        debug_assert!(block_size_bytes % 8 == 0 && block_size_bytes > 0);
        let bitmap_words = (capacity as usize + 63) / 64;
        Self {
            region,
            bitmap_offset: base_offset,
            blocks_offset: base_offset + bitmap_words,
            block_size_words: block_size_bytes as usize / 8,
            capacity,
            bitmap_words,
        }
    }

    pub fn block_size_bytes(&self) -> u32 {
        (self.block_size_words * 8) as u32
    }

    /// Mark every block free. Called once by the side that created the
    /// region, before sharing it.
    pub fn initialize(&self) {
        for word_index in 0..self.bitmap_words {
            let bits_here = (self.capacity as usize).saturating_sub(word_index * 64);
            let mask = if bits_here >= 64 {
                u64::MAX
            } else {
                (1u64 << bits_here) - 1
            };
            self.region
                .word(self.bitmap_offset + word_index)
                .store(mask, Ordering::Release);
        }
    }

    /// Claim a free block, or `None` if the pool is exhausted.
    pub fn try_alloc(&self) -> Option<u32> {
        for word_index in 0..self.bitmap_words {
            let word = self.region.word(self.bitmap_offset + word_index);
            let mut current = word.load(Ordering::Acquire);
            while current != 0 {
                let bit = current.trailing_zeros();
                let mask = 1u64 << bit;
                match word.compare_exchange_weak(
                    current,
                    current & !mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(word_index as u32 * 64 + bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Release a block back to the pool. Returns false on an invalid index
    /// or a double free.
    pub fn free(&self, index: u32) -> bool {
        if index >= self.capacity {
            return false;
        }
        let word = self.region.word(self.bitmap_offset + index as usize / 64);
        let mask = 1u64 << (index % 64);
        let previous = word.fetch_or(mask, Ordering::AcqRel);
        previous & mask == 0
    }

    pub(crate) fn block_offset(&self, index: u32) -> Option<usize> {
        if index >= self.capacity {
            return None;
        }
        Some(self.blocks_offset + index as usize * self.block_size_words)
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn allocator(block_size: u32, capacity: u32) -> BlockAllocator {
        let region = Region::allocate(BlockAllocator::words_required(block_size, capacity));
        let alloc = BlockAllocator::new(region, 0, block_size, capacity);
        alloc.initialize();
        alloc
    }

    #[test]
    fn allocates_every_block_exactly_once() {
        let alloc = allocator(64, 100);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let index = alloc.try_alloc().expect("pool should not be exhausted");
            assert!(seen.insert(index));
            assert!(index < 100);
        }
        assert_eq!(alloc.try_alloc(), None);
    }

    #[test]
    fn freed_blocks_are_reusable_and_double_free_is_rejected() {
        let alloc = allocator(64, 2);
        let a = alloc.try_alloc().unwrap();
        let _b = alloc.try_alloc().unwrap();
        assert_eq!(alloc.try_alloc(), None);

        assert!(alloc.free(a));
        assert!(!alloc.free(a));
        assert!(!alloc.free(77));
        assert_eq!(alloc.try_alloc(), Some(a));
    }

    #[test]
    fn concurrent_allocation_yields_distinct_blocks() {
        let alloc = Arc::new(allocator(64, 256));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                for _ in 0..64 {
                    mine.push(alloc.try_alloc().unwrap());
                }
                mine
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(all.insert(index), "block {index} allocated twice");
            }
        }
        assert_eq!(all.len(), 256);
        assert_eq!(alloc.try_alloc(), None);
    }
}
