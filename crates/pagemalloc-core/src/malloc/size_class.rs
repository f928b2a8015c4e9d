//! Size classes and superpage geometry.
//!
//! Small requests are served from power-of-two slots. A request of `s` bytes
//! lands in class `log = ceil(log2(max(s, MIN_SLOT_SIZE)))`; exact powers of
//! two stay in their own class. The largest class is the biggest power of two
//! that still fits in one OS page next to a header copy; anything above it
//! takes the large-block path.
//!
//! Superpage layout (`page_size = superpage_pages * os_page_size`):
//!
//! ```text
//!   base                      base + os_page_size
//!   ┌────────┬──────┬──────┬──┬────────┬──────┬──────┬──┬─ ─ ─
//!   │ header │ slot │ slot │  │ header │ slot │ slot │  │
//!   └────────┴──────┴──────┴──┴────────┴──────┴──────┴──┴─ ─ ─
//! ```
//!
//! Every OS page starts with a header copy, so masking any slot address down
//! to its OS page finds one. Slots never straddle an OS page boundary.

use super::header::HEADER_BYTES;

/// Smallest slot exponent (16-byte slots).
pub const MIN_LOG: u32 = 4;

/// Smallest slot size in bytes. Large enough to hold a free-list link and
/// keeps every slot 16-byte aligned.
pub const MIN_SLOT_SIZE: usize = 1 << MIN_LOG;

/// Size-class exponent for a small request (`size <= max_slot_size`).
#[must_use]
pub const fn log_for(size: usize) -> u32 {
    let size = if size < MIN_SLOT_SIZE {
        MIN_SLOT_SIZE
    } else {
        size
    };
    usize::BITS - (size - 1).leading_zeros()
}

/// Slot size in bytes for class `log`.
#[must_use]
pub const fn slot_size(log: u32) -> usize {
    1 << log
}

/// Address-space layout shared by every block of one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    os_page_size: usize,
    page_size: usize,
    max_log: u32,
}

impl Geometry {
    /// Builds the geometry for a given OS page size and superpage length.
    ///
    /// `os_page_size` must be a power of two comfortably larger than the
    /// header; `superpage_pages` must be non-zero.
    #[must_use]
    pub fn new(os_page_size: usize, superpage_pages: usize) -> Self {
        debug_assert!(os_page_size.is_power_of_two());
        debug_assert!(os_page_size >= HEADER_BYTES + 2 * MIN_SLOT_SIZE);
        debug_assert!(superpage_pages > 0);
        let avail = os_page_size - HEADER_BYTES;
        Self {
            os_page_size,
            page_size: os_page_size * superpage_pages,
            max_log: usize::BITS - 1 - avail.leading_zeros(),
        }
    }

    #[must_use]
    pub const fn os_page_size(&self) -> usize {
        self.os_page_size
    }

    /// Superpage size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes reserved for the header copy at the start of every OS page.
    #[must_use]
    pub const fn header_bytes(&self) -> usize {
        HEADER_BYTES
    }

    #[must_use]
    pub const fn max_log(&self) -> u32 {
        self.max_log
    }

    /// Small/large routing threshold.
    #[must_use]
    pub const fn max_slot_size(&self) -> usize {
        slot_size(self.max_log)
    }

    /// Number of size classes.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        (self.max_log - MIN_LOG + 1) as usize
    }

    /// Size class for `size`, or `None` if it takes the large path.
    #[must_use]
    pub const fn class_for(&self, size: usize) -> Option<u32> {
        if size > self.max_slot_size() {
            None
        } else {
            Some(log_for(size))
        }
    }

    /// Index of class `log` into per-class tables.
    #[must_use]
    pub const fn class_index(&self, log: u32) -> usize {
        (log - MIN_LOG) as usize
    }

    #[must_use]
    pub const fn slots_per_os_page(&self, log: u32) -> usize {
        (self.os_page_size - HEADER_BYTES) >> log
    }

    #[must_use]
    pub const fn slots_per_superpage(&self, log: u32) -> usize {
        self.slots_per_os_page(log) * (self.page_size / self.os_page_size)
    }

    /// Address of slot `index` in the superpage at `base`.
    #[must_use]
    pub const fn slot_addr(&self, base: usize, index: usize, log: u32) -> usize {
        let per_page = self.slots_per_os_page(log);
        let page = index / per_page;
        let within = index % per_page;
        base + page * self.os_page_size + HEADER_BYTES + (within << log)
    }

    /// Inverse of [`Geometry::slot_addr`].
    #[must_use]
    pub const fn slot_index(&self, base: usize, addr: usize, log: u32) -> usize {
        let offset = addr - base;
        let page = offset / self.os_page_size;
        let within = (offset % self.os_page_size - HEADER_BYTES) >> log;
        page * self.slots_per_os_page(log) + within
    }

    /// Start of the OS page containing `addr`.
    #[must_use]
    pub const fn os_page_floor(&self, addr: usize) -> usize {
        addr & !(self.os_page_size - 1)
    }

    /// Mapping size for a large block holding `size` user bytes, or `None`
    /// if the rounding overflows.
    #[must_use]
    pub const fn large_mapping_size(&self, size: usize) -> Option<usize> {
        let mask = self.os_page_size - 1;
        match size.checked_add(HEADER_BYTES + mask) {
            Some(total) => Some(total & !mask),
            None => None,
        }
    }
}
