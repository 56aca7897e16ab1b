//! The allocation and release engines, plus the locked wrappers that make
//! them usable as a global allocator.
//!
//! ## Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded, non-thread-safe arena and freed memory
//! manager. It owns one [`Arena`] and one [`BlockList`]; nothing is global,
//! so any number of independent allocators can live side by side.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` combines `GenericAllocator` with [`MmapRegion`], so it
//! can be used as the global allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{null_mut, NonNull};

use spin::Mutex;

use crate::blocklist::{Block, BlockList, Stats, Validity};
use crate::region::{chunks_needed, Arena, RegionProvider};
#[cfg(unix)]
use crate::unix::MmapRegion;
use crate::{ALIGNMENT, HEADER_SIZE, MIN_SPARE};

// Round up value to the nearest multiple of increment, or None on overflow.
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    let steps = (value - 1) / increment + 1;
    steps.checked_mul(increment)
}

#[derive(Debug)]
pub enum AllocError<E> {
    /// The request plus its header does not fit in a usize.
    TooLarge { requested: usize },
    /// The region provider would not grow the arena.
    Reserve { chunks: usize, source: E },
}

impl<E: fmt::Display> fmt::Display for AllocError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::TooLarge { requested } => {
                write!(f, "request of {} bytes is too large to pad", requested)
            }
            AllocError::Reserve { chunks, source } => {
                write!(f, "reserving {} more chunks failed: {}", chunks, source)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FreeError {
    /// A null pointer was passed in.
    Null,
    /// The free list was empty, so there was nothing to merge with; the block
    /// is not reclaimed.
    EmptyRegistry,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::Null => write!(f, "can't free a null pointer"),
            FreeError::EmptyRegistry => write!(f, "free list is empty; block not reclaimed"),
        }
    }
}

#[cold]
#[inline(never)]
fn fatal<E: fmt::Display>(err: &AllocError<E>) -> ! {
    log::error!("memalloc: {}", err);
    panic!("memalloc: {}", err)
}

/// A raw allocator, capable of growing the arena, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Note: It never returns memory to the OS; that is not implemented.
pub struct RawAlloc<P> {
    pub arena: Arena<P>,
    pub blocks: BlockList,
}

impl<P: RegionProvider + Default> Default for RawAlloc<P> {
    fn default() -> Self {
        RawAlloc::new(P::default())
    }
}

impl<P> RawAlloc<P> {
    /// Create a new `RawAlloc`. Nothing is reserved until the first
    /// allocation.
    pub const fn new(provider: P) -> Self {
        RawAlloc {
            arena: Arena::new(provider),
            blocks: BlockList::new(),
        }
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    /// The size of the block that serves a request for `requested` bytes: the
    /// request plus its header, rounded up to `ALIGNMENT`, and never smaller
    /// than `MIN_SPARE` so the block can carry free-list links once it is
    /// freed.
    pub fn block_size(requested: usize) -> Option<usize> {
        let padded = round_up(requested.checked_add(HEADER_SIZE)?, ALIGNMENT)?;
        Some(padded.max(MIN_SPARE))
    }

    /// Bytes the caller may use behind `ptr`. At least what was requested;
    /// more when the block was handed out whole.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live pointer returned by [`RawAlloc::alloc`].
    pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
        Block::from_user(ptr).size() - HEADER_SIZE
    }
}

impl<P: RegionProvider> RawAlloc<P> {
    /// Allocate `size` bytes, returning `None` for a zero-sized request.
    ///
    /// Blocks are never smaller than `MIN_SPARE`, so `alloc(1..=8)` takes 24
    /// bytes rather than 16: a 16-byte block could not hold its free-list
    /// links once freed. See [`RawAlloc::block_size`].
    ///
    /// If the arena has to grow and the provider refuses, there is no way to
    /// recover: the failure is logged and this panics. Use
    /// [`RawAlloc::try_alloc`] to get the error instead.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        match self.try_alloc(size) {
            Ok(ptr) => ptr,
            Err(err) => fatal(&err),
        }
    }

    /// Allocate `size` bytes, returning `Ok(None)` for a zero-sized request.
    ///
    /// The returned pointer is `ALIGNMENT`-aligned and valid for at least
    /// `size` bytes until it is passed to [`RawAlloc::free`].
    pub fn try_alloc(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError<P::Err>> {
        if size == 0 {
            log::trace!("alloc(0): nothing to do");
            return Ok(None);
        }

        let needed =
            RawAlloc::<P>::block_size(size).ok_or(AllocError::TooLarge { requested: size })?;
        let block = self.take_block(needed)?;
        let block = self.split_off(block, needed);

        log::trace!("alloc({}) -> {:?}", size, block);
        Ok(Some(block.user_ptr()))
    }

    // First fit over the free list, in list order. On a miss, grow the arena
    // by just enough chunks; the new space is never merged with whatever
    // too-small block the scan passed over.
    fn take_block(&mut self, needed: usize) -> Result<Block, AllocError<P::Err>> {
        let found = self.blocks.iter().find(|b| b.size() >= needed);
        if let Some(block) = found {
            log::trace!("  First fit for {} bytes: {:?}", needed, block);
            unsafe { self.blocks.remove(block) };
            return Ok(block);
        }

        let chunks = chunks_needed(needed, self.arena.chunk_size());
        let region = self
            .arena
            .grow(chunks)
            .map_err(|source| AllocError::Reserve { chunks, source })?;

        let len = region.end.as_ptr() as usize - region.start.as_ptr() as usize;
        log::trace!("  No fit for {} bytes; grew {} bytes", needed, len);
        Ok(unsafe { Block::from_raw(region.start, len) })
    }

    // Keep the first `needed` bytes of a detached block. The rest goes back on
    // the free list if it is big enough to stand alone; otherwise it stays as
    // padding inside the allocation.
    fn split_off(&mut self, mut block: Block, needed: usize) -> Block {
        let spare = block.size() - needed;
        if spare >= MIN_SPARE {
            unsafe {
                let rest = block.split(needed);
                self.blocks.insert(rest);
            }
        } else if spare > 0 {
            log::trace!("  Handing out {} spare bytes as padding", spare);
        }
        block
    }

    /// Return a block to the free list, merging it with the free blocks
    /// directly before and after it in memory.
    ///
    /// Fails for a null pointer, and when the free list is empty; in the
    /// latter case the block is simply not reclaimed.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`RawAlloc::alloc`] on this allocator
    /// and not freed since. Nothing checks this; violating it corrupts the
    /// allocator.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        let ptr = NonNull::new(ptr).ok_or(FreeError::Null)?;
        if self.blocks.is_empty() {
            log::debug!("free({:p}): free list is empty, not reclaiming", ptr);
            return Err(FreeError::EmptyRegistry);
        }

        let mut freed = Block::from_user(ptr);

        let mut left = None;
        let mut right = None;
        for block in self.blocks.iter() {
            if block.end() == freed.start() {
                left = Some(block);
            } else if freed.end() == block.start() {
                right = Some(block);
            }
        }

        if let Some(block) = left {
            self.blocks.remove(block);
        }
        if let Some(block) = right {
            self.blocks.remove(block);
        }

        let merged = match (left, right) {
            (Some(mut left), Some(right)) => {
                left.absorb(freed);
                left.absorb(right);
                left
            }
            (Some(mut left), None) => {
                left.absorb(freed);
                left
            }
            (None, Some(right)) => {
                freed.absorb(right);
                freed
            }
            (None, None) => freed,
        };

        log::trace!(
            "free({:p}): left {:?}, right {:?} -> {:?}",
            ptr,
            left.map(|b| b.start()),
            right.map(|b| b.start()),
            merged
        );
        self.blocks.insert(merged);
        Ok(())
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator, so that was easy to add with a spin lock.
///
/// Requests with an alignment above `ALIGNMENT` are over-allocated; the
/// pointer `RawAlloc` returned is stored in the word just before the aligned
/// pointer, so `dealloc` can find it again.
///
/// Allocation failures return null, and the runtime's allocation error
/// handler takes it from there.
///
/// Log records are emitted while the lock is held; a logger that allocates
/// while output for this crate is enabled will deadlock.
pub struct GenericAllocator<P> {
    raw: Mutex<RawAlloc<P>>,
}

impl<P: Default> Default for GenericAllocator<P> {
    fn default() -> Self {
        GenericAllocator::new(P::default())
    }
}

impl<P> GenericAllocator<P> {
    pub const fn new(provider: P) -> Self {
        GenericAllocator {
            raw: Mutex::new(RawAlloc::new(provider)),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.raw.lock().stats()
    }
}

unsafe impl<P: RegionProvider + Send> GlobalAlloc for GenericAllocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.raw.lock();
        if layout.align() <= ALIGNMENT {
            return match raw.try_alloc(layout.size()) {
                Ok(Some(ptr)) => ptr.as_ptr(),
                _ => null_mut(),
            };
        }

        let padded = match layout.size().checked_add(layout.align()) {
            Some(padded) => padded,
            None => return null_mut(),
        };
        let base = match raw.try_alloc(padded) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            _ => return null_mut(),
        };

        // base is ALIGNMENT-aligned, so there are between one word and
        // `align` bytes to skip, and `size` bytes still fit after that.
        let word = core::mem::size_of::<usize>();
        let skip = (base as usize + word + layout.align() - 1) / layout.align() * layout.align()
            - base as usize;
        let aligned = base.add(skip);
        (aligned as *mut usize).sub(1).write(base as usize);
        aligned
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let base = if layout.align() <= ALIGNMENT {
            ptr
        } else {
            (ptr as *const usize).sub(1).read() as *mut u8
        };
        match self.raw.lock().free(base) {
            Ok(()) => {}
            // The block stays part of the arena but is never reused; dealloc
            // has no way to report it.
            Err(FreeError::EmptyRegistry) => {}
            // GlobalAlloc never hands null to dealloc.
            Err(FreeError::Null) => debug_assert!(false, "dealloc(null)"),
        }
    }
}

/// A `RawAlloc` over `mmap`: the single-threaded `memalloc`/`memfree` pair.
#[cfg(unix)]
pub type MemAlloc = RawAlloc<MmapRegion>;

/// A `GenericAllocator` over `mmap`, ready for `#[global_allocator]`.
#[cfg(unix)]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<MmapRegion>,
}

#[cfg(unix)]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(MmapRegion::new()),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(unix)]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }
}
