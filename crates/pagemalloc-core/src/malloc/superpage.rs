//! Small-object path: superpages sliced into uniform slots.
//!
//! Each size class owns a doubly linked list of superpages that still have a
//! free slot (the *capacity list*). The list is threaded through the primary
//! headers, so the manager itself stores only one head per class.
//!
//! Inside a superpage a slot is in one of three states:
//! - never used (index `>= brk`): still zero from the OS;
//! - live: owned by the caller;
//! - free: its first word is the link to the next free slot of the same
//!   superpage (`free_head` chain).
//!
//! Nothing but allocator discipline separates "free link" from "live user
//! bytes": writing to a freed slot corrupts the chain.

use std::ptr::NonNull;

use crate::error::Result;
use crate::mmap::{self, Region};

use super::header::{self, Header, HeaderView};
use super::size_class::Geometry;

/// A slot handed out by [`SuperpageManager::allocate_slot`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotGrant {
    pub ptr: NonNull<u8>,
    /// The slot came off a free list and may hold stale bytes.
    pub reused: bool,
    /// A superpage was mapped to serve this request.
    pub mapped: Option<Region>,
}

/// Per-class capacity lists.
#[derive(Debug)]
pub(crate) struct SuperpageManager {
    heads: Vec<Option<NonNull<Header>>>,
}

impl SuperpageManager {
    pub(crate) fn new(geometry: &Geometry) -> Self {
        Self {
            heads: vec![None; geometry.num_classes()],
        }
    }

    /// Superpages with spare capacity in class `log`.
    pub(crate) fn capacity_len(&self, geometry: &Geometry, log: u32) -> usize {
        let mut len = 0;
        let mut cursor = self.heads[geometry.class_index(log)];
        while let Some(page) = cursor {
            len += 1;
            // SAFETY: list members are live primaries.
            let next = unsafe { page.as_ref() }.next;
            cursor = NonNull::new(next as *mut Header);
        }
        len
    }

    /// Forgets every list. Used after the mappings were released wholesale.
    pub(crate) fn reset(&mut self) {
        self.heads.iter_mut().for_each(|head| *head = None);
    }

    /// Takes one slot of class `log`, mapping a new superpage if the class
    /// has no spare capacity.
    pub(crate) fn allocate_slot(&mut self, geometry: &Geometry, log: u32) -> Result<SlotGrant> {
        let idx = geometry.class_index(log);
        let (primary, mapped) = match self.heads[idx] {
            Some(primary) => (primary, None),
            None => {
                let region = mmap::map(geometry.page_size())?;
                // SAFETY: fresh exclusive mapping of page_size bytes.
                let primary = unsafe { header::init_superpage(region, geometry, log) };
                self.push_front(idx, primary);
                (primary, Some(region))
            }
        };

        // SAFETY: `primary` heads the capacity list, so it is live; no other
        // reference to it exists while the manager is borrowed mutably.
        let page = unsafe { header::primary_mut(primary) };
        let (slot, reused) = if page.free_head != 0 {
            let slot = page.free_head;
            // SAFETY: free-list members hold a link in their first word.
            page.free_head = unsafe { header::read_link(slot) };
            (slot, true)
        } else {
            debug_assert!(page.brk < page.slot_count);
            let slot = geometry.slot_addr(page.base, page.brk, log);
            page.brk += 1;
            (slot, false)
        };
        page.used += 1;
        let full = page.is_full();

        if full {
            self.unlink(idx, primary);
        }

        Ok(SlotGrant {
            // SAFETY: slot addresses lie inside a non-null mapping.
            ptr: unsafe { NonNull::new_unchecked(slot as *mut u8) },
            reused,
            mapped,
        })
    }

    /// Returns a slot to its superpage.
    ///
    /// When the superpage becomes empty it is detached from the capacity
    /// list and its region returned; the caller must unmap it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live slot of class `log` obtained from this manager,
    /// and `view` the header covering it.
    pub(crate) unsafe fn free_slot(
        &mut self,
        geometry: &Geometry,
        ptr: NonNull<u8>,
        log: u32,
        view: HeaderView,
    ) -> Option<Region> {
        let idx = geometry.class_index(log);
        let primary = view.primary();
        // SAFETY: the slot is live, so its superpage is live.
        let page = unsafe { header::primary_mut(primary) };
        let slot = ptr.as_ptr() as usize;
        debug_assert!(
            geometry.slot_index(page.base, slot, log) < page.brk,
            "slot {slot:#x} was never handed out"
        );

        let was_full = page.is_full();
        // SAFETY: the caller gave the slot up; its bytes now carry the link.
        unsafe { header::write_link(slot, page.free_head) };
        page.free_head = slot;
        page.used -= 1;
        let empty = page.used == 0;

        if empty {
            if !was_full {
                self.unlink(idx, primary);
            }
            return Some(view.region());
        }
        if was_full {
            self.push_front(idx, primary);
        }
        None
    }

    fn push_front(&mut self, idx: usize, primary: NonNull<Header>) {
        let old = self.heads[idx];
        {
            // SAFETY: `primary` is a live superpage not currently linked.
            let page = unsafe { header::primary_mut(primary) };
            page.prev = 0;
            page.next = link_addr(old);
        }
        if let Some(old) = old {
            // SAFETY: list members are live primaries distinct from `primary`.
            unsafe { header::primary_mut(old) }.prev = primary.as_ptr() as usize;
        }
        self.heads[idx] = Some(primary);
    }

    fn unlink(&mut self, idx: usize, primary: NonNull<Header>) {
        let (prev, next) = {
            // SAFETY: `primary` is a live member of list `idx`.
            let page = unsafe { header::primary_mut(primary) };
            let links = (page.prev, page.next);
            page.prev = 0;
            page.next = 0;
            links
        };
        let prev = NonNull::new(prev as *mut Header);
        let next = NonNull::new(next as *mut Header);

        match prev {
            Some(prev) => {
                // SAFETY: neighbours are live list members.
                unsafe { header::primary_mut(prev) }.next = link_addr(next);
            }
            None => self.heads[idx] = next,
        }
        if let Some(next) = next {
            // SAFETY: neighbours are live list members.
            unsafe { header::primary_mut(next) }.prev = link_addr(prev);
        }
    }
}

fn link_addr(page: Option<NonNull<Header>>) -> usize {
    page.map_or(0, |p| p.as_ptr() as usize)
}
