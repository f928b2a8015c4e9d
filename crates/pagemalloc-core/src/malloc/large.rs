//! Large allocation handling (> max slot size).
//!
//! Every large request gets its own mapping: header plus payload, rounded up
//! to whole OS pages. The header sits at the start of the mapping and the
//! user pointer immediately after it, so the user pointer always masks back
//! to the header. Freeing unmaps the whole region.

use std::ptr::NonNull;

use crate::error::{MallocError, Result};
use crate::mmap::{self, Region};

use super::header::{self, HeaderView};
use super::size_class::Geometry;

/// A block handed out by [`LargeBlockManager::allocate_large`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct LargeGrant {
    pub ptr: NonNull<u8>,
    pub region: Region,
}

/// Tracks live large blocks.
#[derive(Debug, Default)]
pub(crate) struct LargeBlockManager {
    active: usize,
}

impl LargeBlockManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Maps a dedicated region for `size` user bytes.
    pub(crate) fn allocate_large(&mut self, geometry: &Geometry, size: usize) -> Result<LargeGrant> {
        let len = geometry
            .large_mapping_size(size)
            .ok_or(MallocError::size_overflow(size))?;
        let region = mmap::map(len)?;
        // SAFETY: fresh exclusive mapping of at least one OS page.
        let ptr = unsafe { header::init_large(region) };
        self.active += 1;
        Ok(LargeGrant { ptr, region })
    }

    /// Detaches a large block; the caller must unmap the returned region.
    ///
    /// # Safety
    ///
    /// `view` must be the header of a live large block from this manager.
    pub(crate) unsafe fn free_large(&mut self, view: HeaderView) -> Region {
        self.active -= 1;
        view.region()
    }

    /// Usable bytes of a large block whose mapping is `size` bytes long.
    pub(crate) const fn usable_size(geometry: &Geometry, size: usize) -> usize {
        size - geometry.header_bytes()
    }

    /// Live large blocks.
    pub(crate) fn active_count(&self) -> usize {
        self.active
    }

    pub(crate) fn reset(&mut self) {
        self.active = 0;
    }
}
