//! Block headers and pointer-to-header recovery.
//!
//! Every block handed out by the allocator can be traced back to its
//! bookkeeping with a single mask: round the address down to its OS page and
//! read the [`Header`] stored there. Superpages keep a copy of the header at
//! the start of each of their OS pages; large blocks have one header at the
//! start of their mapping, and the user pointer always lies in that first
//! page.
//!
//! Only the copy at the superpage base (the *primary*) carries live state
//! (`used`, `brk`, `free_head`, list links). The other copies are written
//! once when the superpage is mapped and only ever read for `log` and `base`.
//!
//! This is the only module that reinterprets raw addresses as headers.

use std::ptr::NonNull;

use crate::mmap::Region;

use super::size_class::Geometry;

/// `log` value reserved for large-block headers.
pub(crate) const LARGE_MARKER: u32 = u32::MAX;

/// Bytes reserved for a header, rounded up to keep slots 16-byte aligned.
pub(crate) const HEADER_BYTES: usize = (std::mem::size_of::<Header>() + 15) & !15;

/// On-page metadata record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    /// Slot exponent, or [`LARGE_MARKER`].
    pub log: u32,
    /// Start of the mapping this header belongs to.
    pub base: usize,
    /// Length of that mapping.
    pub size: usize,
    /// Allocated slots (primary only).
    pub used: usize,
    /// Slots ever handed out; indices `>= brk` were never touched.
    pub brk: usize,
    /// Slots in the superpage.
    pub slot_count: usize,
    /// First free slot address, 0 when the free list is empty.
    pub free_head: usize,
    /// Capacity-list neighbours (superpage bases), 0 for none.
    pub next: usize,
    pub prev: usize,
}

impl Header {
    const fn empty(log: u32, base: usize, size: usize) -> Self {
        Self {
            log,
            base,
            size,
            used: 0,
            brk: 0,
            slot_count: 0,
            free_head: 0,
            next: 0,
            prev: 0,
        }
    }

    #[inline]
    pub(crate) const fn is_full(&self) -> bool {
        self.used == self.slot_count
    }
}

/// What a header says about the block that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Slot of size `2^log` inside a superpage.
    Slotted { log: u32 },
    /// Dedicated mapping of `size` bytes, header included.
    Large { size: usize },
}

/// Read-only view of the header copy covering one address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderView {
    page: NonNull<Header>,
}

/// Locates the header covering `addr`.
///
/// # Safety
///
/// `addr` must lie inside the first OS page of a live large block or anywhere
/// inside a live superpage, both created with `geometry`.
#[inline]
pub(crate) unsafe fn header_at(addr: usize, geometry: &Geometry) -> HeaderView {
    let page = geometry.os_page_floor(addr);
    HeaderView {
        // SAFETY: a live block's OS page is mapped and never at address 0.
        page: unsafe { NonNull::new_unchecked(page as *mut Header) },
    }
}

impl HeaderView {
    #[inline]
    fn read(self) -> Header {
        // SAFETY: `header_at` only builds views over mapped header copies.
        unsafe { self.page.as_ptr().read() }
    }

    /// Decodes the block kind.
    #[inline]
    pub(crate) fn kind(self) -> BlockKind {
        let header = self.read();
        if header.log == LARGE_MARKER {
            BlockKind::Large { size: header.size }
        } else {
            BlockKind::Slotted { log: header.log }
        }
    }

    /// Primary header of the superpage (or large block) this copy belongs to.
    #[inline]
    pub(crate) fn primary(self) -> NonNull<Header> {
        let base = self.read().base;
        // SAFETY: `base` was written from a non-null mapping address.
        unsafe { NonNull::new_unchecked(base as *mut Header) }
    }

    /// Whole mapping this header describes.
    #[inline]
    pub(crate) fn region(self) -> Region {
        let header = self.read();
        // SAFETY: base/size were recorded from the mapping itself.
        unsafe { Region::from_raw_parts(header.base, header.size) }
    }
}

/// Mutable access to a primary header.
///
/// # Safety
///
/// `primary` must point at the primary header of a live superpage and no
/// other reference to it may be alive.
#[inline]
pub(crate) unsafe fn primary_mut<'a>(primary: NonNull<Header>) -> &'a mut Header {
    // SAFETY: upheld by the caller.
    unsafe { &mut *primary.as_ptr() }
}

/// Writes a header copy at the start of every OS page of a fresh superpage
/// and returns the primary.
///
/// # Safety
///
/// `region` must be a live, exclusively owned mapping of
/// `geometry.page_size()` bytes.
pub(crate) unsafe fn init_superpage(
    region: Region,
    geometry: &Geometry,
    log: u32,
) -> NonNull<Header> {
    debug_assert_eq!(region.len(), geometry.page_size());
    let mut header = Header::empty(log, region.base(), region.len());
    header.slot_count = geometry.slots_per_superpage(log);

    let mut page = region.base();
    let end = region.base() + region.len();
    while page < end {
        // SAFETY: `page` is an OS-page-aligned address inside the mapping and
        // the first HEADER_BYTES of every OS page are reserved for headers.
        unsafe { (page as *mut Header).write(header) };
        page += geometry.os_page_size();
    }
    region.addr().cast()
}

/// Writes the header of a fresh large block and returns the user pointer.
///
/// # Safety
///
/// `region` must be a live, exclusively owned mapping of at least one OS
/// page.
pub(crate) unsafe fn init_large(region: Region) -> NonNull<u8> {
    let header = Header::empty(LARGE_MARKER, region.base(), region.len());
    // SAFETY: the mapping is page-aligned and larger than a header.
    unsafe {
        region.addr().cast::<Header>().as_ptr().write(header);
        region.addr().add(HEADER_BYTES)
    }
}

/// Reads the free-list link stored in a free slot.
///
/// # Safety
///
/// `slot` must be a free slot whose first word holds a link.
#[inline]
pub(crate) unsafe fn read_link(slot: usize) -> usize {
    // SAFETY: slots are 16-byte aligned and at least 16 bytes long.
    unsafe { (slot as *const usize).read() }
}

/// Stores a free-list link in a slot that just became free.
///
/// # Safety
///
/// `slot` must be a slot of a live superpage that the caller gave up.
#[inline]
pub(crate) unsafe fn write_link(slot: usize, next: usize) {
    // SAFETY: slots are 16-byte aligned and at least 16 bytes long.
    unsafe { (slot as *mut usize).write(next) }
}
