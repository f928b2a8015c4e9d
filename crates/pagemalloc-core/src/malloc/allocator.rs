//! Allocator facade.
//!
//! Routes each request by size: up to `max_slot_size` to the superpage
//! manager, above it to the large-block manager. Frees and size queries are
//! routed by the header found under the pointer, never by a side table.
//!
//! The facade owns the usage counters:
//! - `allocs`: outstanding user allocations;
//! - `mmaps`: outstanding OS mappings (superpages plus large blocks);
//! - `bytes`: total bytes in those mappings.
//!
//! All three are zero exactly when nothing is outstanding.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use serde::Serialize;

use crate::config::{self, AllocatorConfig};
use crate::error::{MallocError, Result};
use crate::mmap::{self, Region};

use super::header::{self, BlockKind};
use super::large::LargeBlockManager;
use super::log::{AllocatorLogLevel, AllocatorLogRecord, LifecycleLog, LogFields};
use super::size_class::{Geometry, slot_size};
use super::superpage::SuperpageManager;

/// Snapshot of the usage counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Outstanding user allocations.
    pub allocs: usize,
    /// Outstanding OS mappings.
    pub mmaps: usize,
    /// Bytes currently mapped.
    pub bytes: usize,
    /// Outstanding large blocks (a subset of `mmaps`).
    pub large_blocks: usize,
}

/// Single-threaded superpage allocator.
///
/// The default value is a ready, empty allocator that holds no OS memory
/// until the first allocation. Instances are independent; wrap one in
/// [`LockedAllocator`](super::locked::LockedAllocator) to share it between
/// threads.
///
/// Blocks are returned as raw pointers. They stay valid until freed, or until
/// the allocator is closed or dropped.
#[derive(Debug)]
pub struct Allocator {
    geometry: Geometry,
    superpages: SuperpageManager,
    large: LargeBlockManager,
    allocs: usize,
    mmaps: usize,
    bytes: usize,
    /// Live mappings (base -> length). Only read by `close`.
    mappings: HashMap<usize, usize>,
    log: LifecycleLog,
}

// SAFETY: the raw pointers inside refer to mappings owned exclusively by this
// instance; nothing is shared with other instances or threads.
unsafe impl Send for Allocator {}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Creates an empty allocator using the process-wide configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(config::global())
    }

    /// Creates an empty allocator with an explicit configuration.
    #[must_use]
    pub fn with_config(config: AllocatorConfig) -> Self {
        let geometry = Geometry::new(mmap::page_size(), config.normalized_superpage_pages());
        Self {
            superpages: SuperpageManager::new(&geometry),
            large: LargeBlockManager::new(),
            geometry,
            allocs: 0,
            mmaps: 0,
            bytes: 0,
            mappings: HashMap::new(),
            log: LifecycleLog::new(config.log_level),
        }
    }

    /// Layout parameters of this instance.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Largest request served from a superpage.
    #[must_use]
    pub fn max_slot_size(&self) -> usize {
        self.geometry.max_slot_size()
    }

    /// Allocates `size` bytes. The contents are unspecified.
    ///
    /// `malloc(0)` returns a distinct zero-length block backed by the
    /// smallest size class; it must be freed like any other block.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<[u8]>> {
        let ptr = self.allocate("malloc", size, false)?;
        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    /// Allocates `size` zeroed bytes.
    pub fn calloc(&mut self, size: usize) -> Result<NonNull<[u8]>> {
        let ptr = self.allocate("calloc", size, true)?;
        Ok(NonNull::slice_from_raw_parts(ptr, size))
    }

    /// Like [`Allocator::malloc`], returning only the start address.
    pub fn malloc_ptr(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate("malloc", size, false)
    }

    /// Like [`Allocator::calloc`], returning only the start address.
    pub fn calloc_ptr(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate("calloc", size, true)
    }

    /// Frees a block.
    ///
    /// Only the start address is consulted, so any reslice of the block that
    /// keeps its start (including a zero-length one) frees the whole block.
    ///
    /// # Safety
    ///
    /// `block` must start at an address returned by this allocator that has
    /// not been freed yet. The block must not be accessed afterwards.
    pub unsafe fn free(&mut self, block: NonNull<[u8]>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.release("free", block.cast()) }
    }

    /// Frees a block by its start address.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::free`].
    pub unsafe fn free_ptr(&mut self, ptr: NonNull<u8>) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.release("free", ptr) }
    }

    /// Resizes a block.
    ///
    /// - `None` behaves like `malloc(size)`.
    /// - `size == 0` frees the block and returns `Ok(None)`.
    /// - If `size` fits in the block's usable size, the same block is
    ///   returned with the new length.
    /// - Otherwise the contents (up to the smaller length) move to a new
    ///   block and the old one is freed. On `OutOfMemory` the old block is
    ///   left untouched.
    ///
    /// # Safety
    ///
    /// A `Some` block must satisfy the [`Allocator::free`] contract, and its
    /// length must not exceed the block's usable size.
    pub unsafe fn realloc(
        &mut self,
        block: Option<NonNull<[u8]>>,
        size: usize,
    ) -> Result<Option<NonNull<[u8]>>> {
        let Some(block) = block else {
            let ptr = self.allocate("realloc", size, false)?;
            return Ok(Some(NonNull::slice_from_raw_parts(ptr, size)));
        };
        let old = block.cast::<u8>();
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.release("realloc", old) }?;
            return Ok(None);
        }

        // SAFETY: `old` is live per the caller contract.
        let usable = unsafe { self.usable_size(old) };
        if size <= usable {
            self.record(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_in_place",
                LogFields {
                    ptr: Some(old.as_ptr() as usize),
                    size: Some(size),
                    log: None,
                },
                "success",
                format_args!("usable={}", usable),
            );
            return Ok(Some(NonNull::slice_from_raw_parts(old, size)));
        }

        let new = self.allocate("realloc", size, false)?;
        let copy = block.len().min(size).min(usable);
        // SAFETY: `old` is readable for `copy <= usable` bytes, `new` is
        // writable for `size >= copy` bytes, and distinct live blocks never
        // overlap.
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copy) };
        // SAFETY: forwarded caller contract.
        if let Err(unmap_err) = unsafe { self.release("realloc", old) } {
            // The old block is gone either way and the failure is already in
            // the lifecycle log; returning it would leak the new block.
            debug_assert!(matches!(unmap_err, MallocError::Unmap { .. }));
        }
        Ok(Some(NonNull::slice_from_raw_parts(new, size)))
    }

    /// True capacity of a block, at least the size it was requested with.
    ///
    /// # Safety
    ///
    /// `ptr` must be the start address of a live block from this allocator.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: forwarded caller contract.
        match unsafe { self.block_kind(ptr) } {
            BlockKind::Slotted { log } => slot_size(log),
            BlockKind::Large { size } => LargeBlockManager::usable_size(&self.geometry, size),
        }
    }

    /// Decodes the header that owns `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a live slotted block, or into the first OS page
    /// of a live large block, from this allocator.
    #[must_use]
    pub unsafe fn block_kind(&self, ptr: NonNull<u8>) -> BlockKind {
        // SAFETY: forwarded caller contract.
        unsafe { header::header_at(ptr.as_ptr() as usize, &self.geometry) }.kind()
    }

    /// Releases every mapping still owned by this allocator and resets it to
    /// the empty state.
    ///
    /// Blocks that were never freed become invalid. Every mapping is
    /// released even if some unmap calls fail; the first failure is
    /// returned.
    pub fn close(&mut self) -> Result<()> {
        let mappings = std::mem::take(&mut self.mappings);
        let released = mappings.len();
        let mut first_err: Option<MallocError> = None;
        for (base, len) in mappings {
            // SAFETY: every registry entry is a live mapping from `mmap::map`.
            let region = unsafe { Region::from_raw_parts(base, len) };
            // SAFETY: the allocator is being emptied; its blocks are dead.
            if let Err(err) = unsafe { mmap::unmap(region) } {
                self.record_unmap_failure("close", region, &err);
                first_err.get_or_insert(err);
            }
        }

        let leaked = self.allocs;
        self.superpages.reset();
        self.large.reset();
        self.allocs = 0;
        self.mmaps = 0;
        self.bytes = 0;
        self.record(
            AllocatorLogLevel::Info,
            "close",
            "close",
            LogFields::default(),
            if first_err.is_some() { "partial" } else { "success" },
            format_args!("released_mappings={} outstanding_allocs={}", released, leaked),
        );
        first_err.map_or(Ok(()), Err)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocs: self.allocs,
            mmaps: self.mmaps,
            bytes: self.bytes,
            large_blocks: self.large.active_count(),
        }
    }

    /// Outstanding user allocations.
    #[must_use]
    pub fn allocs(&self) -> usize {
        self.allocs
    }

    /// Outstanding OS mappings.
    #[must_use]
    pub fn mmaps(&self) -> usize {
        self.mmaps
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// True when nothing is allocated and nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocs == 0 && self.mmaps == 0 && self.bytes == 0
    }

    /// Superpages of class `log` that currently have a free slot.
    #[must_use]
    pub fn superpages_with_capacity(&self, log: u32) -> usize {
        self.superpages.capacity_len(&self.geometry, log)
    }

    #[must_use]
    pub fn log_level(&self) -> AllocatorLogLevel {
        self.log.level()
    }

    pub fn set_log_level(&mut self, level: AllocatorLogLevel) {
        self.log.set_level(level);
    }

    /// Returns a view of allocator lifecycle log records.
    #[must_use]
    pub fn lifecycle_logs(&self) -> &[AllocatorLogRecord] {
        self.log.records()
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.log.drain()
    }

    /// Lifecycle records as JSON lines.
    pub fn export_lifecycle_jsonl(&self) -> serde_json::Result<String> {
        self.log.to_jsonl()
    }

    fn allocate(&mut self, symbol: &'static str, size: usize, zeroed: bool) -> Result<NonNull<u8>> {
        let geometry = self.geometry;
        match geometry.class_for(size) {
            Some(log) => {
                let grant = match self.superpages.allocate_slot(&geometry, log) {
                    Ok(grant) => grant,
                    Err(err) => {
                        self.record_oom(symbol, size, Some(log), &err);
                        return Err(err);
                    }
                };
                if let Some(region) = grant.mapped {
                    self.account_map(symbol, "superpage_map", region, Some(log));
                }
                if zeroed && grant.reused && size > 0 {
                    // SAFETY: the slot is ours and at least `size` bytes long.
                    unsafe { std::ptr::write_bytes(grant.ptr.as_ptr(), 0, size) };
                    self.record(
                        AllocatorLogLevel::Trace,
                        symbol,
                        "calloc_scrub",
                        LogFields {
                            ptr: Some(grant.ptr.as_ptr() as usize),
                            size: Some(size),
                            log: Some(log),
                        },
                        "zeroed",
                        format_args!("path=reused_slot"),
                    );
                }
                self.allocs += 1;
                let reused = grant.reused;
                self.record(
                    AllocatorLogLevel::Trace,
                    symbol,
                    "slot_alloc",
                    LogFields {
                        ptr: Some(grant.ptr.as_ptr() as usize),
                        size: Some(size),
                        log: Some(log),
                    },
                    "success",
                    format_args!(
                        "path={}",
                        if reused { "free_list" } else { "fresh_slot" }
                    ),
                );
                Ok(grant.ptr)
            }
            None => {
                let grant = match self.large.allocate_large(&geometry, size) {
                    Ok(grant) => grant,
                    Err(err) => {
                        self.record_oom(symbol, size, None, &err);
                        return Err(err);
                    }
                };
                // Fresh mappings are already zero; nothing to scrub.
                self.account_map(symbol, "large_map", grant.region, None);
                self.allocs += 1;
                Ok(grant.ptr)
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must be the start of a live block from this allocator.
    unsafe fn release(&mut self, symbol: &'static str, ptr: NonNull<u8>) -> Result<()> {
        let geometry = self.geometry;
        let addr = ptr.as_ptr() as usize;
        // SAFETY: forwarded caller contract.
        let view = unsafe { header::header_at(addr, &geometry) };

        match self.allocs.checked_sub(1) {
            Some(next) => self.allocs = next,
            None => self.record(
                AllocatorLogLevel::Error,
                symbol,
                "invariant_allocs_underflow",
                LogFields {
                    ptr: Some(addr),
                    size: None,
                    log: None,
                },
                "recovered",
                format_args!("free_with_no_outstanding_allocations"),
            ),
        }

        match view.kind() {
            BlockKind::Slotted { log } => {
                // SAFETY: forwarded caller contract; `view` covers `ptr`.
                let detached = unsafe { self.superpages.free_slot(&geometry, ptr, log, view) };
                self.record(
                    AllocatorLogLevel::Trace,
                    symbol,
                    "slot_free",
                    LogFields {
                        ptr: Some(addr),
                        size: Some(slot_size(log)),
                        log: Some(log),
                    },
                    "success",
                    format_args!("superpage_released={}", detached.is_some()),
                );
                match detached {
                    Some(region) => self.unmap_region(symbol, "superpage_unmap", region, Some(log)),
                    None => Ok(()),
                }
            }
            BlockKind::Large { .. } => {
                // SAFETY: `view` is the header of the live large block at `ptr`.
                let region = unsafe { self.large.free_large(view) };
                self.unmap_region(symbol, "large_unmap", region, None)
            }
        }
    }

    fn account_map(
        &mut self,
        symbol: &'static str,
        event: &'static str,
        region: Region,
        log: Option<u32>,
    ) {
        self.mmaps += 1;
        self.bytes += region.len();
        self.mappings.insert(region.base(), region.len());
        self.record(
            AllocatorLogLevel::Debug,
            symbol,
            event,
            LogFields {
                ptr: Some(region.base()),
                size: Some(region.len()),
                log,
            },
            "mapped",
            format_args!(""),
        );
    }

    fn unmap_region(
        &mut self,
        symbol: &'static str,
        event: &'static str,
        region: Region,
        log: Option<u32>,
    ) -> Result<()> {
        self.mmaps -= 1;
        self.bytes -= region.len();
        self.mappings.remove(&region.base());
        // SAFETY: the owning manager detached the region and no live block
        // remains inside it.
        match unsafe { mmap::unmap(region) } {
            Ok(()) => {
                self.record(
                    AllocatorLogLevel::Debug,
                    symbol,
                    event,
                    LogFields {
                        ptr: Some(region.base()),
                        size: Some(region.len()),
                        log,
                    },
                    "unmapped",
                    format_args!(""),
                );
                Ok(())
            }
            Err(err) => {
                self.record_unmap_failure(symbol, region, &err);
                Err(err)
            }
        }
    }

    fn record_oom(&mut self, symbol: &'static str, size: usize, log: Option<u32>, err: &MallocError) {
        let errno = err.errno();
        self.record(
            AllocatorLogLevel::Warn,
            symbol,
            "oom",
            LogFields {
                ptr: None,
                size: Some(size),
                log,
            },
            "oom",
            format_args!(
                "path={} errno={}",
                if log.is_some() { "superpage" } else { "large" },
                errno
            ),
        );
    }

    fn record_unmap_failure(&mut self, symbol: &'static str, region: Region, err: &MallocError) {
        let errno = err.errno();
        self.record(
            AllocatorLogLevel::Error,
            symbol,
            "unmap_failed",
            LogFields {
                ptr: Some(region.base()),
                size: Some(region.len()),
                log: None,
            },
            "error",
            format_args!("errno={}", errno),
        );
    }

    fn record(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        fields: LogFields,
        outcome: &'static str,
        details: fmt::Arguments<'_>,
    ) {
        let counters = (self.allocs, self.mmaps, self.bytes);
        self.log
            .record(level, symbol, event, fields, outcome, details, counters);
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if !self.mappings.is_empty() {
            let _ = self.close();
        }
    }
}
