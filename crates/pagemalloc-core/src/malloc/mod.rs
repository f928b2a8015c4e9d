//! Memory allocation.
//!
//! Two-tier allocator over anonymous OS mappings:
//! - Small requests (<= max slot size): power-of-two slots carved out of
//!   per-class superpages
//! - Large requests: one dedicated mapping per block
//!
//! Both tiers keep their bookkeeping in-band, in headers reachable from any
//! block address by masking it down to its OS page.

pub mod allocator;
mod header;
mod large;
pub mod locked;
pub mod log;
pub mod size_class;
mod superpage;

pub use allocator::{Allocator, AllocatorStats};
pub use header::BlockKind;
pub use locked::LockedAllocator;
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use size_class::Geometry;
