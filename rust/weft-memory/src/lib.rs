#![deny(unsafe_code)]

//! Shared memory services backing a node link.
//!
//! Each `NodeLink` owns a [`LinkMemory`]: a primary shared region carrying
//! atomic id generators and a set of fixed-size block allocators, plus any
//! expansion buffers registered later. All of it is safe for concurrent use
//! from arbitrary threads on either side of a link; ids come from shared
//! atomic counters so the two sides never mint colliding values.

mod region;
pub use region::Region;

mod block_allocator;
pub use block_allocator::BlockAllocator;

mod link_memory;
pub use link_memory::{BlockRef, LinkMemory, BLOCK_CLASSES, LINK_STATE_WORDS, MAX_INITIAL_PORTALS};
