//! OS memory provider.
//!
//! Thin wrapper over anonymous `mmap(2)`/`munmap(2)`. Every region handed out
//! here is zero-filled, aligned to the OS page size and sized in whole OS
//! pages. One platform call per map or unmap; no partial unmaps.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{MallocError, Result};

/// Used when `sysconf(_SC_PAGESIZE)` fails.
const FALLBACK_PAGE_SIZE: usize = 4096;

// 0 = unresolved.
static CACHED_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// A live anonymous mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    addr: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Start of the mapping.
    #[must_use]
    pub const fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Start of the mapping as an integer address.
    #[must_use]
    pub fn base(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rebuilds a region from a base address and length previously obtained
    /// from [`map`].
    ///
    /// # Safety
    ///
    /// `base` and `len` must describe a mapping returned by [`map`] that has
    /// not been unmapped yet.
    pub(crate) unsafe fn from_raw_parts(base: usize, len: usize) -> Self {
        Self {
            // SAFETY: caller guarantees `base` came from a successful mmap.
            addr: unsafe { NonNull::new_unchecked(base as *mut u8) },
            len,
        }
    }
}

/// Process-wide OS page size, resolved once.
#[must_use]
pub fn page_size() -> usize {
    let cached = CACHED_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 && (raw as usize).is_power_of_two() {
        raw as usize
    } else {
        FALLBACK_PAGE_SIZE
    };
    CACHED_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::ENOMEM)
}

/// Maps `len` bytes of fresh zero-filled memory.
///
/// `len` must be a non-zero multiple of [`page_size`].
pub fn map(len: usize) -> Result<Region> {
    debug_assert!(len > 0 && len % page_size() == 0, "unaligned map of {len}");

    // SAFETY: anonymous private mapping with no fixed address; no existing
    // memory is affected.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MallocError::OutOfMemory {
            size: len,
            errno: last_errno(),
        });
    }

    match NonNull::new(ptr.cast::<u8>()) {
        Some(addr) => Ok(Region { addr, len }),
        None => Err(MallocError::OutOfMemory {
            size: len,
            errno: libc::ENOMEM,
        }),
    }
}

/// Releases a region obtained from [`map`].
///
/// # Safety
///
/// `region` must come from [`map`] and must not have been unmapped already.
/// Nothing may access the region's memory afterwards.
pub unsafe fn unmap(region: Region) -> Result<()> {
    // SAFETY: caller guarantees the region is a live mapping of exactly
    // `region.len` bytes.
    let ret = unsafe { libc::munmap(region.addr.as_ptr().cast(), region.len) };
    if ret == 0 {
        Ok(())
    } else {
        Err(MallocError::Unmap {
            addr: region.base(),
            size: region.len,
            errno: last_errno(),
        })
    }
}
