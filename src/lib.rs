#![no_std]

//! A first-fit heap allocator built directly on page-granularity virtual
//! memory.
//!
//! The allocator keeps one logically contiguous arena that only ever grows
//! upward, in fixed-size chunks of [`CHUNK_SIZE`] bytes. Every block in the
//! arena starts with an 8-byte header holding the total size of the block;
//! the pointer handed to the caller sits just past that header. Free blocks
//! additionally carry `next`/`prev` links and live on an unordered,
//! doubly-linked free list.
//!
//! - Allocation does a first-fit scan of the free list, splitting the found
//!   block when the leftover is at least [`MIN_SPARE`] bytes. If nothing
//!   fits, the arena is grown by just enough chunks.
//! - Release merges the freed block with any free block that is physically
//!   adjacent in memory (not merely adjacent in list order), then pushes the
//!   result on the head of the free list.
//!
//! Memory is never returned to the operating system.
//!
//! ## Caller obligations
//!
//! [`RawAlloc::free`] must only be handed pointers returned by
//! [`RawAlloc::alloc`] on the same allocator, and each such pointer at most
//! once. Anything else (a foreign pointer, a double free, writing past the
//! requested size) corrupts block headers and is undefined behavior; none
//! of it is detected.
//!
//! ## Example
//!
//! ```
//! use chunk_allocator::{RawAlloc, ToyHeap};
//!
//! let mut memory = vec![0u8; 64 * 1024];
//! let mut allocator = RawAlloc::new(ToyHeap::new(&mut memory, 4096));
//!
//! let first = allocator.alloc(100).unwrap();
//! let _second = allocator.alloc(200).unwrap();
//! unsafe { allocator.free(first.as_ptr()).unwrap() };
//!
//! // First-fit hands the freed space straight back.
//! let third = allocator.alloc(50).unwrap();
//! assert_eq!(first, third);
//! assert_eq!(allocator.arena.chunks(), 1);
//! ```

use static_assertions::const_assert;

pub mod allocators;
pub mod blocklist;
pub mod region;
#[cfg(unix)]
pub mod unix;

pub use allocators::{AllocError, FreeError, GenericAllocator, RawAlloc};
#[cfg(unix)]
pub use allocators::{MemAlloc, UnixAllocator};
pub use blocklist::{Block, BlockList, Stats, Validity};
pub use region::{chunks_needed, Arena, RegionProvider, ToyHeap, ToyHeapError};
#[cfg(unix)]
pub use unix::{MmapError, MmapRegion};

/// Granularity, in bytes, at which the arena grows.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Bytes of bookkeeping in front of every block: the block's total size.
pub const HEADER_SIZE: usize = 8;

/// Every block size, and so every user pointer, is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Smallest leftover worth splitting off as its own free block. A free block
/// needs room for its size and both list links.
pub const MIN_SPARE: usize = 24;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(MIN_SPARE % ALIGNMENT == 0);
const_assert!(MIN_SPARE >= HEADER_SIZE + 2 * core::mem::size_of::<usize>());
const_assert!(CHUNK_SIZE % ALIGNMENT == 0);
