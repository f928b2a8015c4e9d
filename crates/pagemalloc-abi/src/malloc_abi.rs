//! ABI layer for the allocator (`pagemalloc_malloc`, `pagemalloc_free`, ...).
//!
//! Failures follow the C conventions: a null return plus `errno` set to the
//! platform error (`ENOMEM` when out of memory).

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::OnceLock;

use pagemalloc_core::{AllocatorStats, LockedAllocator, MallocError};

/// Global allocator instance, configured from the environment on first use.
fn global_allocator() -> &'static LockedAllocator {
    static ALLOCATOR: OnceLock<LockedAllocator> = OnceLock::new();
    ALLOCATOR.get_or_init(LockedAllocator::new)
}

#[inline]
unsafe fn set_abi_errno(val: c_int) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: returns this thread's errno slot.
        let p = unsafe { libc::__errno_location() };
        // SAFETY: the slot is valid for the lifetime of the thread.
        unsafe { *p = val };
    }
    #[cfg(target_os = "macos")]
    {
        // SAFETY: returns this thread's errno slot.
        let p = unsafe { libc::__error() };
        // SAFETY: the slot is valid for the lifetime of the thread.
        unsafe { *p = val };
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    let _ = val;
}

fn fail(err: &MallocError) -> *mut c_void {
    // SAFETY: writes this thread's errno.
    unsafe { set_abi_errno(err.errno()) };
    std::ptr::null_mut()
}

/// Counter snapshot as seen from C.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PagemallocStats {
    pub allocs: usize,
    pub mmaps: usize,
    pub bytes: usize,
    pub large_blocks: usize,
}

impl From<AllocatorStats> for PagemallocStats {
    fn from(stats: AllocatorStats) -> Self {
        Self {
            allocs: stats.allocs,
            mmaps: stats.mmaps,
            bytes: stats.bytes,
            large_blocks: stats.large_blocks,
        }
    }
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// Allocates `size` bytes of uninitialized memory.
///
/// `size == 0` returns a unique pointer that must still be freed. Returns
/// null with `errno = ENOMEM` on failure.
///
/// # Safety
///
/// Caller must eventually `pagemalloc_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagemalloc_malloc(size: usize) -> *mut c_void {
    match global_allocator().lock().malloc_ptr(size) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(&err),
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// Allocates zeroed memory for `nmemb` elements of `size` bytes each.
///
/// Returns null with `errno = ENOMEM` if the multiplication overflows or the
/// allocation fails.
///
/// # Safety
///
/// Caller must eventually `pagemalloc_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagemalloc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        // SAFETY: writes this thread's errno.
        unsafe { set_abi_errno(libc::ENOMEM) };
        return std::ptr::null_mut();
    };
    match global_allocator().lock().calloc_ptr(total) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(err) => fail(&err),
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// Resizes a block.
///
/// - null `ptr` behaves like `pagemalloc_malloc(size)`;
/// - `size == 0` frees `ptr` and returns null;
/// - on failure returns null, sets `errno`, and leaves `ptr` valid.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator. On success the
/// old pointer must no longer be used unless it was returned again.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagemalloc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let mut allocator = global_allocator().lock();
    let block = NonNull::new(ptr.cast::<u8>()).map(|ptr| {
        // SAFETY: `ptr` is live per the caller contract.
        let len = unsafe { allocator.usable_size(ptr) };
        NonNull::slice_from_raw_parts(ptr, len)
    });
    // SAFETY: forwarded caller contract; the length is the usable size.
    match unsafe { allocator.realloc(block, size) } {
        Ok(Some(block)) => block.as_ptr().cast(),
        Ok(None) => std::ptr::null_mut(),
        Err(err) => fail(&err),
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// Releases a block. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator that has not been
/// freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagemalloc_free(ptr: *mut c_void) {
    let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
        return;
    };
    // SAFETY: forwarded caller contract.
    if let Err(err) = unsafe { global_allocator().lock().free_ptr(ptr) } {
        // The block is released either way; surface the unmap failure.
        // SAFETY: writes this thread's errno.
        unsafe { set_abi_errno(err.errno()) };
    }
}

// ---------------------------------------------------------------------------
// malloc_usable_size
// ---------------------------------------------------------------------------

/// Usable bytes of a live block; 0 for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagemalloc_malloc_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        // SAFETY: forwarded caller contract.
        Some(ptr) => unsafe { global_allocator().usable_size(ptr) },
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// stats
// ---------------------------------------------------------------------------

/// Writes the global allocator's counters to `out`.
///
/// Returns 0 on success, or -1 with `errno = EINVAL` if `out` is null.
///
/// # Safety
///
/// `out` must be null or valid for writing one `PagemallocStats`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pagemalloc_stats(out: *mut PagemallocStats) -> c_int {
    if out.is_null() {
        // SAFETY: writes this thread's errno.
        unsafe { set_abi_errno(libc::EINVAL) };
        return -1;
    }
    let stats = PagemallocStats::from(global_allocator().stats());
    // SAFETY: `out` is non-null and writable per the caller contract.
    unsafe { out.write(stats) };
    0
}
