//! # pagemalloc-abi
//!
//! `extern "C"` boundary for pagemalloc.
//!
//! Builds a `cdylib` exporting prefixed `pagemalloc_*` symbols backed by one
//! process-wide [`LockedAllocator`](pagemalloc_core::LockedAllocator). The
//! prefix keeps the library loadable next to the host libc without
//! interposing on `malloc`/`free`.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> LockedAllocator -> Allocator -> mmap
//! ```

pub mod malloc_abi;
