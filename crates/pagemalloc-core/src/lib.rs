//! # pagemalloc-core
//!
//! A small general-purpose allocator built directly on anonymous OS
//! mappings.
//!
//! Requests up to [`Allocator::max_slot_size`] are served from power-of-two
//! slots packed into *superpages*; larger requests get a dedicated mapping.
//! Every block can be traced back to its metadata by masking its address down
//! to the containing OS page, so `free` and `usable_size` need no side
//! tables.
//!
//! [`Allocator`] is single-threaded; [`LockedAllocator`] shares one between
//! threads.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
#[allow(unsafe_code)]
pub mod malloc;
#[allow(unsafe_code)]
pub mod mmap;

pub use config::AllocatorConfig;
pub use error::{MallocError, Result};
pub use malloc::{
    Allocator, AllocatorLogLevel, AllocatorLogRecord, AllocatorStats, BlockKind, Geometry,
    LockedAllocator,
};
