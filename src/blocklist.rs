use core::fmt;
use core::ops::Range;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::{ALIGNMENT, HEADER_SIZE, MIN_SPARE};

/// The header for our free blocks.
///
/// Only `size` survives while a block is handed out: it is the `HEADER_SIZE`
/// bytes in front of the user pointer, and counts the whole block including
/// itself. `next` and `prev` overlap the start of the payload and are only
/// meaningful while the block sits in a [`BlockList`].
///
/// ```text
/// +------------------+ <- block start
/// |       size       |
/// +------------------+ <- user pointer
/// |  next (if free)  |
/// |  prev (if free)  |
/// |       ...        |
/// +------------------+ <- block start + size
/// ```
#[repr(C)]
pub struct FreeHeader {
    size: u64,
    next: Option<Block>,
    prev: Option<Block>,
}

const_assert!(core::mem::size_of::<u64>() == HEADER_SIZE);
const_assert!(core::mem::size_of::<FreeHeader>() <= MIN_SPARE);
const_assert!(core::mem::align_of::<FreeHeader>() <= ALIGNMENT);

/// A handle to a block header somewhere in the arena.
///
/// Handles are plain addresses, so they are `Copy`; whoever creates one with
/// [`Block::from_raw`] or [`Block::from_user`] vouches that the header is
/// real. Every read and write of header memory goes through this type.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<FreeHeader>,
}

// A Block is sendable - as long as the whole arena moves with it, its fine.
//
// Nothing here is synchronized, so it is Send but not Sync; the wrapper in
// `allocators` puts the whole allocator behind a lock instead.
unsafe impl Send for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:p}, {})", self.header, self.size())
    }
}

impl Block {
    /// Claim `size` bytes at `ptr` as a block, writing a header with no links.
    ///
    /// # Safety
    ///
    /// `ptr` must be `ALIGNMENT`-aligned and point to `size` bytes of arena
    /// memory that nothing else (no live allocation, no other block) covers.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Block {
        debug_assert!(
            size >= MIN_SPARE && size % ALIGNMENT == 0,
            "Can't make a block of {} bytes",
            size
        );
        let header = ptr.cast::<FreeHeader>();
        header.as_ptr().write(FreeHeader {
            size: size as u64,
            next: None,
            prev: None,
        });
        Block { header }
    }

    /// Recover the block behind a pointer previously returned to a caller.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`Block::user_ptr`] on a block that is still
    /// intact; nothing else has a header in front of it.
    pub unsafe fn from_user(ptr: NonNull<u8>) -> Block {
        let header = ptr.as_ptr().sub(HEADER_SIZE) as *mut FreeHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The pointer handed to callers: just past the size field.
    pub fn user_ptr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Address of the first byte of the block (its header).
    pub fn start(&self) -> usize {
        self.header.as_ptr() as usize
    }

    /// Address one past the last byte of the block.
    pub fn end(&self) -> usize {
        self.start() + self.size()
    }

    /// Get the address range covered by this block.
    pub fn as_range(&self) -> Range<usize> {
        self.start()..self.end()
    }

    /// The size of the block, in bytes, header included.
    pub fn size(&self) -> usize {
        unsafe { ptr::addr_of!((*self.header.as_ptr()).size).read() as usize }
    }

    fn set_size(&mut self, size: usize) {
        unsafe { ptr::addr_of_mut!((*self.header.as_ptr()).size).write(size as u64) }
    }

    fn next(&self) -> Option<Block> {
        unsafe { ptr::addr_of!((*self.header.as_ptr()).next).read() }
    }

    fn set_next(&mut self, next: Option<Block>) {
        unsafe { ptr::addr_of_mut!((*self.header.as_ptr()).next).write(next) }
    }

    fn prev(&self) -> Option<Block> {
        unsafe { ptr::addr_of!((*self.header.as_ptr()).prev).read() }
    }

    fn set_prev(&mut self, prev: Option<Block>) {
        unsafe { ptr::addr_of_mut!((*self.header.as_ptr()).prev).write(prev) }
    }

    /// Truncate this block to `size` bytes and return the remainder as a new
    /// block with a fresh header.
    ///
    /// # Safety
    ///
    /// This block must not be on a list, and the remainder must be at least
    /// `MIN_SPARE` bytes so its header fits.
    pub unsafe fn split(&mut self, size: usize) -> Block {
        let self_size = self.size();
        debug_assert!(
            size % ALIGNMENT == 0 && size + MIN_SPARE <= self_size,
            "Can't split a block of size {} off of a block of size {}",
            size,
            self_size,
        );

        let rest_ptr = NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(size));
        let rest = Block::from_raw(rest_ptr, self_size - size);
        self.set_size(size);
        rest
    }

    /// Grow this block over `other`, which must start exactly where this one
    /// ends. `other`'s header becomes ordinary payload.
    pub fn absorb(&mut self, other: Block) {
        debug_assert_eq!(
            self.end(),
            other.start(),
            "Can only absorb a block that is physically adjacent"
        );
        let size = self.size() + other.size();
        self.set_size(size);
    }
}

/// A `BlockList` is the registry of free blocks.
///
/// It is an unordered, doubly-linked list threaded through the free blocks
/// themselves. New blocks always go on the head; the list order says nothing
/// about address or size.
///
/// It maintains a few internal invariants:
///
/// - Each block appears at most once.
/// - The head has no `prev`, the tail has no `next`.
/// - Links are symmetric: `a.next == b` exactly when `b.prev == a`.
pub struct BlockList {
    first: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: core::marker::PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

impl Default for BlockList {
    fn default() -> Self {
        BlockList::new()
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "FreeBlock({:#x}, {})", block.start(), block.size())?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks overlapping other blocks.
    ///
    /// This likely indicates corruption, such as a double free.
    pub overlaps: usize,

    /// Number of links that don't point back: a head with a `prev`, or a
    /// block whose `next` has some other `prev`.
    pub broken_links: usize,

    /// Number of blocks whose size is not a multiple of `ALIGNMENT`, or is
    /// too small to hold a free header.
    pub bad_sizes: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.broken_links == 0 && self.bad_sizes == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Number of free blocks.
    pub length: usize,
    /// Total bytes held in free blocks, headers included.
    pub size: usize,
    /// Size of the largest free block.
    pub largest: usize,
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList { first: None }
    }

    pub fn iter(&self) -> BlockIter {
        BlockIter {
            next: self.first,
            _list: core::marker::PhantomData,
        }
    }

    /// The most recently inserted block.
    pub fn first(&self) -> Option<Block> {
        self.first
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Push a block on the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must not already be on this (or any) list, and its memory must
    /// be owned by the list from now on.
    pub unsafe fn insert(&mut self, mut block: Block) {
        block.set_prev(None);
        block.set_next(self.first);
        if let Some(mut head) = self.first {
            head.set_prev(Some(block));
        }
        self.first = Some(block);
    }

    /// Detach a block from wherever it sits in the list.
    ///
    /// The block's own links are left as they were, so an iterator that has
    /// just yielded it can still move on.
    ///
    /// # Safety
    ///
    /// `block` must currently be on this list.
    pub unsafe fn remove(&mut self, block: Block) {
        let next = block.next();
        let prev = block.prev();

        if self.first == Some(block) {
            self.first = next;
        }
        if let Some(mut next) = next {
            next.set_prev(prev);
        }
        if let Some(mut prev) = prev {
            prev.set_next(next);
        }
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        if let Some(head) = self.first {
            if head.prev().is_some() {
                validity.broken_links += 1;
            }
        }

        for (ix, block) in self.iter().enumerate() {
            if let Some(next) = block.next() {
                if next.prev() != Some(block) {
                    validity.broken_links += 1;
                }
            }

            let size = block.size();
            if size % ALIGNMENT != 0 || size < MIN_SPARE {
                validity.bad_sizes += 1;
            }

            let range = block.as_range();
            for other in self.iter().skip(ix + 1) {
                let other = other.as_range();
                if range.start < other.end && other.start < range.end {
                    validity.overlaps += 1;
                }
            }

            stats.length += 1;
            stats.size += size;
            stats.largest = stats.largest.max(size);
        }

        (validity, stats)
    }
}
