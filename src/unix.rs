//! Chunks of virtual memory straight from `mmap`.
//!
//! The arena has to stay contiguous, so extensions must land at one exact
//! address. Mapping there with a bare `MAP_FIXED` would silently replace
//! whatever else the process has mapped at that spot. Instead, the first
//! reservation maps a large `PROT_NONE` window of address space, and chunks
//! are committed read/write inside it; the window is ours, so `MAP_FIXED`
//! inside it can't clobber anything. A request that would run past the
//! window is denied.
//!
//! Address space can be limited (`RLIMIT_AS`), so a window that can't be
//! mapped is halved until it fits, down to the size of the first request.

use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::region::RegionProvider;
use crate::CHUNK_SIZE;

/// Chunks of address space the first reservation tries to set aside.
#[cfg(target_pointer_width = "64")]
pub const WINDOW_CHUNKS: usize = 4096;
#[cfg(not(target_pointer_width = "64"))]
pub const WINDOW_CHUNKS: usize = 64;

#[derive(Debug)]
pub enum MmapError {
    /// `mmap` itself failed.
    Map { len: usize, errno: Errno },
    /// The requested address range does not fit inside the reserved window.
    OutsideWindow { at: usize, len: usize },
    /// `CHUNK_SIZE` is not a multiple of the OS page size.
    PageSize { page_size: usize },
    /// `chunks * CHUNK_SIZE` does not fit in a usize.
    Overflow { chunks: usize },
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmapError::Map { len, errno } => write!(f, "mmap of {} bytes failed: {}", len, errno),
            MmapError::OutsideWindow { at, len } => write!(
                f,
                "can't extend the arena contiguously: {} bytes at {:#x} fall outside the reserved window",
                len, at
            ),
            MmapError::PageSize { page_size } => write!(
                f,
                "chunk size {} is not a multiple of the page size {}",
                CHUNK_SIZE, page_size
            ),
            MmapError::Overflow { chunks } => {
                write!(f, "{} chunks of {} bytes overflow usize", chunks, CHUNK_SIZE)
            }
        }
    }
}

/// `MmapRegion` uses virtual memory to grow the arena upon request.
#[derive(Default)]
pub struct MmapRegion {
    window: Option<NonNull<u8>>,
    window_len: usize,
    committed: usize,
}

// The window is process-wide address space; nothing ties it to a thread.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    pub const fn new() -> Self {
        MmapRegion {
            window: None,
            window_len: 0,
            committed: 0,
        }
    }

    /// Bytes committed read/write so far.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Bytes of address space set aside, committed or not.
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    unsafe fn open_window(&mut self, len: usize) -> Result<NonNull<u8>, MmapError> {
        let page_size = sysconf::page::pagesize();
        if CHUNK_SIZE % page_size != 0 {
            return Err(MmapError::PageSize { page_size });
        }

        let (window, window_len) =
            shrink_until_mapped(len, WINDOW_CHUNKS * CHUNK_SIZE, |size| {
                let ptr = libc::mmap(
                    // We don't care where the window goes.
                    null_mut(),
                    size,
                    // No access until a chunk is committed.
                    libc::PROT_NONE,
                    // MAP_ANONYMOUS: no file behind it. MAP_PRIVATE: not
                    // shared with any other process.
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    Err(errno::errno())
                } else {
                    Ok(NonNull::new_unchecked(ptr as *mut u8))
                }
            })?;

        log::debug!("Reserved a window of {} bytes at {:p}", window_len, window);

        self.window = Some(window);
        self.window_len = window_len;
        Ok(window)
    }

    // Give the whole window back; the next reservation starts over.
    unsafe fn close_window(&mut self) {
        if let Some(window) = self.window.take() {
            libc::munmap(window.as_ptr() as *mut libc::c_void, self.window_len);
            log::debug!("Released the window of {} bytes at {:p}", self.window_len, window);
        }
        self.window_len = 0;
        self.committed = 0;
    }

    fn covers(&self, at: NonNull<u8>, len: usize) -> bool {
        let start = match self.window {
            None => return false,
            Some(window) => window.as_ptr() as usize,
        };
        let at = at.as_ptr() as usize;
        at >= start && len <= self.window_len && at - start <= self.window_len - len
    }

    unsafe fn commit(&mut self, at: NonNull<u8>, len: usize) -> Result<NonNull<u8>, MmapError> {
        let ptr = libc::mmap(
            at.as_ptr() as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            // MAP_FIXED is safe here: `at..at + len` lies in our own window.
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(MmapError::Map {
                len,
                errno: errno::errno(),
            });
        }

        self.committed += len;
        log::debug!(
            "Committed {} bytes at {:p}; {} of {} window bytes in use",
            len,
            ptr,
            self.committed,
            self.window_len
        );
        Ok(NonNull::new_unchecked(ptr as *mut u8))
    }
}

/// Map `preferred` bytes (or `len`, if that is larger) with `map`, halving the
/// size in whole chunks each time `map` runs out of memory, but never going
/// below `len`. Returns the mapping and its size.
fn shrink_until_mapped<F>(
    len: usize,
    preferred: usize,
    mut map: F,
) -> Result<(NonNull<u8>, usize), MmapError>
where
    F: FnMut(usize) -> Result<NonNull<u8>, Errno>,
{
    let mut size = len.max(preferred);
    loop {
        match map(size) {
            Ok(ptr) => return Ok((ptr, size)),
            Err(errno) if errno.0 == libc::ENOMEM && size > len => {
                let smaller = (size / CHUNK_SIZE / 2 * CHUNK_SIZE).max(len);
                log::debug!(
                    "No room for a window of {} bytes, trying {}",
                    size,
                    smaller
                );
                size = smaller;
            }
            Err(errno) => return Err(MmapError::Map { len: size, errno }),
        }
    }
}

impl RegionProvider for MmapRegion {
    type Err = MmapError;

    fn chunk_size(&self) -> usize {
        CHUNK_SIZE
    }

    unsafe fn reserve(
        &mut self,
        chunks: usize,
        at: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, MmapError> {
        let len = chunks
            .checked_mul(CHUNK_SIZE)
            .ok_or(MmapError::Overflow { chunks })?;

        let opening = self.window.is_none();
        let target = match (self.window, at) {
            (None, None) => self.open_window(len)?,
            (Some(_), Some(at)) => at,
            (_, at) => {
                return Err(MmapError::OutsideWindow {
                    at: at.map_or(0, |at| at.as_ptr() as usize),
                    len,
                })
            }
        };

        if !self.covers(target, len) {
            return Err(MmapError::OutsideWindow {
                at: target.as_ptr() as usize,
                len,
            });
        }

        match self.commit(target, len) {
            // Nothing lives in a window that was just opened; keeping it would
            // leave every later first reservation outside it.
            Err(err) if opening => {
                self.close_window();
                Err(err)
            }
            result => result,
        }
    }
}
