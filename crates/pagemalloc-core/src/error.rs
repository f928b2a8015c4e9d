//! Allocator error types.

use thiserror::Error;

/// Errors surfaced by the allocator.
///
/// Running out of address space is the only failure an allocation can
/// report. Foreign pointers and double frees are contract violations and are
/// never detected at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MallocError {
    /// The platform refused a mapping of `size` bytes, or the request was too
    /// large to round up to a whole number of OS pages.
    #[error("out of memory: cannot map {size} bytes (errno {errno})")]
    OutOfMemory { size: usize, errno: i32 },
    /// The platform rejected releasing a mapping. The mapping is no longer
    /// tracked by the allocator either way.
    #[error("munmap of {size} bytes at {addr:#x} failed (errno {errno})")]
    Unmap { addr: usize, size: usize, errno: i32 },
}

impl MallocError {
    /// C `errno` value matching this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => libc::ENOMEM,
            Self::Unmap { errno, .. } => *errno,
        }
    }

    /// Returns true for [`MallocError::OutOfMemory`].
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    pub(crate) const fn size_overflow(size: usize) -> Self {
        Self::OutOfMemory {
            size,
            errno: libc::ENOMEM,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MallocError>;
