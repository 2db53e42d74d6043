use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use weft_wire::{BlockDescriptor, BufferId, SublinkId};

use crate::{BlockAllocator, Region};

/// Upper bound on initial portals either side may request at connect time.
///
/// Sublinks below this value are implicitly owned by the handshake, so the
/// shared sublink generator starts here and neither side can collide with
/// the other's initial portals regardless of how many each requested.
pub const MAX_INITIAL_PORTALS: usize = 12;

/// Fixed block size classes carved out of the primary buffer, in bytes.
pub const BLOCK_CLASSES: [u32; 5] = [64, 256, 512, 1024, 2048];

/// Words reserved per router-link-state block in the primary buffer header.
pub const LINK_STATE_WORDS: usize = 4;

// Block counts per class in the primary buffer. Together with bitmaps and
// the reserved header this keeps the primary buffer just under 64 KiB.
const CLASS_CAPACITIES: [u32; 5] = [64, 48, 30, 11, 8];

// Primary buffer word layout.
const NEXT_BUFFER_ID_WORD: usize = 0;
const NEXT_SUBLINK_ID_WORD: usize = 1;
const INITIAL_LINK_STATES_OFFSET: usize = 8;
const CLASSES_OFFSET: usize = INITIAL_LINK_STATES_OFFSET + MAX_INITIAL_PORTALS * LINK_STATE_WORDS;

/// A handle to one allocated (or resolved) block of link memory.
///
/// Holds its own view of the backing region, so it stays valid for as long
/// as any side keeps the buffer alive.
#[derive(Clone)]
pub struct BlockRef {
    region: Region,
    offset_words: usize,
    size_words: usize,
    descriptor: BlockDescriptor,
}

impl BlockRef {
    pub fn words(&self) -> &[AtomicU64] {
        self.region.words(self.offset_words, self.size_words)
    }

    pub fn descriptor(&self) -> BlockDescriptor {
        self.descriptor
    }

    /// True if both refs address the same block of the same buffer.
    pub fn same_block(&self, other: &BlockRef) -> bool {
        self.region.same_memory(&other.region) && self.offset_words == other.offset_words
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockRef({} block {} x{}B)",
            self.descriptor.buffer, self.descriptor.block_index, self.descriptor.block_size
        )
    }
}

struct Buffer {
    allocators: Vec<BlockAllocator>,
}

/// Per-`NodeLink` shared memory: id generators plus block pools.
pub struct LinkMemory {
    primary: Region,
    buffers: Mutex<HashMap<BufferId, Buffer>>,
}

impl LinkMemory {
    /// Total words required for the primary buffer.
    pub fn primary_buffer_words() -> usize {
        let mut words = CLASSES_OFFSET;
        for (size, capacity) in BLOCK_CLASSES.iter().zip(CLASS_CAPACITIES) {
            words += BlockAllocator::words_required(*size, capacity);
        }
        words
    }

    /// Create and initialize a fresh primary buffer. The returned [`Region`]
    /// is the same memory and is what gets shared with the other side.
    pub fn create(primary: Region) -> (Self, Region) {
        debug_assert!(primary.len_words() >= Self::primary_buffer_words());
        let memory = Self::over(primary.clone());

        primary.word(NEXT_BUFFER_ID_WORD).store(1, Ordering::Relaxed);
        primary
            .word(NEXT_SUBLINK_ID_WORD)
            .store(MAX_INITIAL_PORTALS as u64, Ordering::Release);
        {
            let buffers = memory.buffers.lock();
            for allocator in &buffers[&BufferId::PRIMARY].allocators {
                allocator.initialize();
            }
        }

        (memory, primary)
    }

    /// Adopt an already-initialized primary buffer received from the peer.
    pub fn adopt(primary: Region) -> Self {
        Self::over(primary)
    }

    fn over(primary: Region) -> Self {
        let mut offset = CLASSES_OFFSET;
        let mut allocators = Vec::new();
        for (size, capacity) in BLOCK_CLASSES.iter().zip(CLASS_CAPACITIES) {
            allocators.push(BlockAllocator::new(primary.clone(), offset, *size, capacity));
            offset += BlockAllocator::words_required(*size, capacity);
        }

        let mut buffers = HashMap::new();
        buffers.insert(BufferId::PRIMARY, Buffer { allocators });
        Self {
            primary,
            buffers: Mutex::new(buffers),
        }
    }

    /// Mint a buffer id no other allocation through this primary buffer will
    /// ever reuse.
    pub fn allocate_new_buffer_id(&self) -> BufferId {
        BufferId::new(
            self.primary
                .word(NEXT_BUFFER_ID_WORD)
                .fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Reserve `count` consecutive sublink ids, returning the first.
    pub fn allocate_sublink_ids(&self, count: u64) -> SublinkId {
        SublinkId::new(
            self.primary
                .word(NEXT_SUBLINK_ID_WORD)
                .fetch_add(count, Ordering::Relaxed),
        )
    }

    /// The reserved link-state block for initial portal `index`.
    pub fn initial_link_state(&self, index: usize) -> Option<BlockRef> {
        if index >= MAX_INITIAL_PORTALS {
            return None;
        }
        Some(BlockRef {
            region: self.primary.clone(),
            offset_words: INITIAL_LINK_STATES_OFFSET + index * LINK_STATE_WORDS,
            size_words: LINK_STATE_WORDS,
            // Initial states are derived by index on both sides and never
            // referenced by wire descriptors.
            descriptor: BlockDescriptor::NULL,
        })
    }

    /// Allocate a block of at least `size` bytes from the smallest class
    /// that fits, searching the primary buffer first and then any expansion
    /// buffers. `None` means every eligible pool is exhausted.
    pub fn allocate_block(&self, size: u32) -> Option<BlockRef> {
        let buffers = self.buffers.lock();
        let mut candidates: Vec<(&BufferId, &BlockAllocator)> = Vec::new();
        for (id, buffer) in buffers.iter() {
            for allocator in &buffer.allocators {
                if allocator.block_size_bytes() >= size {
                    candidates.push((id, allocator));
                }
            }
        }
        candidates.sort_by_key(|(id, allocator)| (allocator.block_size_bytes(), id.value()));

        for (id, allocator) in candidates {
            if let Some(index) = allocator.try_alloc() {
                let offset = allocator.block_offset(index).unwrap();
                return Some(BlockRef {
                    region: allocator.region().clone(),
                    offset_words: offset,
                    size_words: allocator.block_size_bytes() as usize / 8,
                    descriptor: BlockDescriptor {
                        buffer: *id,
                        block_index: index,
                        block_size: allocator.block_size_bytes(),
                    },
                });
            }
        }
        None
    }

    /// Return a block to its pool. Returns false if the descriptor does not
    /// address a known buffer/class or the block was already free.
    pub fn free_block(&self, descriptor: &BlockDescriptor) -> bool {
        if descriptor.is_null() {
            return false;
        }
        let buffers = self.buffers.lock();
        let Some(buffer) = buffers.get(&descriptor.buffer) else {
            return false;
        };
        buffer
            .allocators
            .iter()
            .find(|a| a.block_size_bytes() == descriptor.block_size)
            .is_some_and(|a| a.free(descriptor.block_index))
    }

    /// Resolve a wire descriptor to a block handle.
    pub fn resolve(&self, descriptor: &BlockDescriptor) -> Option<BlockRef> {
        if descriptor.is_null() {
            return None;
        }
        let buffers = self.buffers.lock();
        let buffer = buffers.get(&descriptor.buffer)?;
        let allocator = buffer
            .allocators
            .iter()
            .find(|a| a.block_size_bytes() == descriptor.block_size)?;
        let offset = allocator.block_offset(descriptor.block_index)?;
        Some(BlockRef {
            region: allocator.region().clone(),
            offset_words: offset,
            size_words: descriptor.block_size as usize / 8,
            descriptor: *descriptor,
        })
    }

    /// Register an expansion buffer holding one block class. `initialize` is
    /// true on the side that allocated the region, false on the side that
    /// received it via `AddBlockBuffer`. Returns false if the id is already
    /// taken or the geometry is invalid.
    pub fn register_block_buffer(
        &self,
        id: BufferId,
        block_size: u32,
        region: Region,
        initialize: bool,
    ) -> bool {
        if block_size == 0 || block_size % 8 != 0 {
            return false;
        }
        // Solve for the largest capacity whose bitmap and blocks fit.
        let block_words = block_size as usize / 8;
        let mut capacity = (region.len_words() / block_words) as u32;
        while capacity > 0
            && BlockAllocator::words_required(block_size, capacity) > region.len_words()
        {
            capacity -= 1;
        }
        if capacity == 0 {
            return false;
        }

        let allocator = BlockAllocator::new(region, 0, block_size, capacity);
        if initialize {
            allocator.initialize();
        }

        let mut buffers = self.buffers.lock();
        if buffers.contains_key(&id) {
            return false;
        }
        buffers.insert(
            id,
            Buffer {
                allocators: vec![allocator],
            },
        );
        true
    }
}
