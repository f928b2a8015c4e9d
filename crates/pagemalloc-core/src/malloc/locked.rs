//! Thread-safe wrapper around [`Allocator`].

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::config::AllocatorConfig;
use crate::error::Result;

use super::allocator::{Allocator, AllocatorStats};

/// An [`Allocator`] behind a `parking_lot::Mutex`.
///
/// Every call takes the lock for its whole duration, so operations from
/// different threads are serialized. Use [`LockedAllocator::lock`] to batch
/// several operations under one acquisition.
#[derive(Debug, Default)]
pub struct LockedAllocator {
    inner: Mutex<Allocator>,
}

impl LockedAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self {
            inner: Mutex::new(Allocator::with_config(config)),
        }
    }

    /// Exclusive access to the underlying allocator.
    pub fn lock(&self) -> MutexGuard<'_, Allocator> {
        self.inner.lock()
    }

    pub fn malloc(&self, size: usize) -> Result<NonNull<[u8]>> {
        self.inner.lock().malloc(size)
    }

    pub fn calloc(&self, size: usize) -> Result<NonNull<[u8]>> {
        self.inner.lock().calloc(size)
    }

    /// # Safety
    ///
    /// See [`Allocator::free`].
    pub unsafe fn free(&self, block: NonNull<[u8]>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().free(block) }
    }

    /// # Safety
    ///
    /// See [`Allocator::realloc`].
    pub unsafe fn realloc(
        &self,
        block: Option<NonNull<[u8]>>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>> {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().realloc(block, size) }
    }

    /// # Safety
    ///
    /// See [`Allocator::usable_size`].
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().usable_size(ptr) }
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }
}
