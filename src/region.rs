//! Growing the arena.
//!
//! ### [`RegionProvider`](trait.RegionProvider.html)
//!
//! `RegionProvider` is a simple trait interface meant to abstract over the
//! calls to the OS that reserve chunks of zero-filled, read/write memory.
//!
//! ### [`Arena`](struct.Arena.html)
//!
//! `Arena` owns a provider and remembers where the arena starts and how many
//! chunks it already covers, so every growth lands directly after the last.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a borrowed slice that can pretend to be the OS, and
//! implements `RegionProvider` for such a purpose. It is mainly useful for
//! testing.

use core::fmt;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::{self, NonNull};

use crate::ALIGNMENT;

/// Number of `chunk_size` chunks needed to cover `size` bytes.
pub fn chunks_needed(size: usize, chunk_size: usize) -> usize {
    size / chunk_size + if size % chunk_size == 0 { 0 } else { 1 }
}

pub trait RegionProvider {
    type Err: fmt::Debug + fmt::Display;

    /// Size in bytes of one chunk. Must be a non-zero multiple of `ALIGNMENT`,
    /// and must not change.
    fn chunk_size(&self) -> usize;

    /// Reserve `chunks` chunks of zero-filled, read/write memory and return
    /// the start of it.
    ///
    /// With `at` set, the memory must start exactly at `at` or the request
    /// fails; without it, the provider picks the address.
    ///
    /// # Safety
    ///
    /// The returned memory must be available and untracked by any other rust
    /// code, including the allocator itself. Callers must only pass an `at`
    /// that directly follows memory this provider handed out before.
    unsafe fn reserve(
        &mut self,
        chunks: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, Self::Err>;
}

/// The one contiguous address range the allocator carves blocks from.
///
/// It only ever grows upward from `base`; nothing is handed back.
pub struct Arena<P> {
    provider: P,
    base: Option<NonNull<u8>>,
    chunks: usize,
}

// The arena is plain memory owned by whoever owns the Arena.
unsafe impl<P: Send> Send for Arena<P> {}

impl<P> Arena<P> {
    pub const fn new(provider: P) -> Self {
        Arena {
            provider,
            base: None,
            chunks: 0,
        }
    }

    /// Where the arena starts, once anything has been reserved.
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Number of chunks reserved so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P: RegionProvider> Arena<P> {
    pub fn chunk_size(&self) -> usize {
        self.provider.chunk_size()
    }

    /// Total bytes reserved.
    pub fn len(&self) -> usize {
        self.chunks * self.chunk_size()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    /// Whether `addr` falls inside the reserved range.
    pub fn contains(&self, addr: usize) -> bool {
        match self.base {
            None => false,
            Some(base) => {
                let start = base.as_ptr() as usize;
                addr >= start && addr < start + self.len()
            }
        }
    }

    /// Reserve `chunks` more chunks directly after the arena, and return the
    /// new range.
    pub fn grow(&mut self, chunks: usize) -> Result<Range<NonNull<u8>>, P::Err> {
        let chunk_size = self.chunk_size();
        let at = self
            .base
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(self.chunks * chunk_size)) });

        let start = unsafe { self.provider.reserve(chunks, at)? };
        let len = chunks * chunk_size;
        debug_assert!(at.map_or(true, |at| at == start), "Arena must stay contiguous");
        debug_assert_eq!(start.as_ptr() as usize % ALIGNMENT, 0);

        if self.base.is_none() {
            self.base = Some(start);
        }
        self.chunks += chunks;

        log::debug!(
            "Grew arena by {} chunks at {:p}; now {} chunks ({} bytes)",
            chunks,
            start,
            self.chunks,
            self.len(),
        );

        let end = unsafe { NonNull::new_unchecked(start.as_ptr().add(len)) };
        Ok(start..end)
    }
}

/// A `ToyHeap` hands out chunks of a borrowed byte slice, front to back.
///
/// The slice start is rounded up to `ALIGNMENT`; chunk boundaries are
/// counted from there. Each reservation is zero-filled before it is handed
/// out, like fresh pages from the OS.
pub struct ToyHeap<'h> {
    start: NonNull<u8>,
    capacity: usize,
    chunk_size: usize,
    used: usize,
    _heap: PhantomData<&'h mut [u8]>,
}

unsafe impl<'h> Send for ToyHeap<'h> {}

impl<'h> ToyHeap<'h> {
    /// Panics if `chunk_size` is zero or not a multiple of `ALIGNMENT`.
    pub fn new(heap: &'h mut [u8], chunk_size: usize) -> Self {
        assert!(
            chunk_size > 0 && chunk_size % ALIGNMENT == 0,
            "chunk size {} is not a positive multiple of {}",
            chunk_size,
            ALIGNMENT
        );

        let raw = heap.as_mut_ptr();
        let skip = (ALIGNMENT - raw as usize % ALIGNMENT) % ALIGNMENT;
        let capacity = heap.len().saturating_sub(skip);
        let start = unsafe { NonNull::new_unchecked(raw.add(skip.min(heap.len()))) };

        ToyHeap {
            start,
            capacity,
            chunk_size,
            used: 0,
            _heap: PhantomData,
        }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Whole chunks the slice can hold in total.
    pub fn capacity_chunks(&self) -> usize {
        self.capacity / self.chunk_size
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ToyHeapError {
    /// Not enough slice left for the request.
    Overflow { requested: usize, available: usize },
    /// The request asked for an address other than the next free chunk.
    NotContiguous { requested: usize, next: usize },
}

impl fmt::Display for ToyHeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToyHeapError::Overflow {
                requested,
                available,
            } => write!(
                f,
                "toy heap overflow: {} bytes requested, {} available",
                requested, available
            ),
            ToyHeapError::NotContiguous { requested, next } => write!(
                f,
                "toy heap can't place memory at {:#x}; next free byte is {:#x}",
                requested, next
            ),
        }
    }
}

impl<'h> RegionProvider for ToyHeap<'h> {
    type Err = ToyHeapError;

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    unsafe fn reserve(
        &mut self,
        chunks: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, ToyHeapError> {
        let available = self.capacity - self.used;
        let len = match chunks.checked_mul(self.chunk_size) {
            Some(len) if len <= available => len,
            _ => {
                return Err(ToyHeapError::Overflow {
                    requested: chunks.saturating_mul(self.chunk_size),
                    available,
                })
            }
        };

        let next = self.start.as_ptr().add(self.used);
        if let Some(at) = at {
            if at.as_ptr() != next {
                return Err(ToyHeapError::NotContiguous {
                    requested: at.as_ptr() as usize,
                    next: next as usize,
                });
            }
        }

        ptr::write_bytes(next, 0, len);
        self.used += len;
        Ok(NonNull::new_unchecked(next))
    }
}
