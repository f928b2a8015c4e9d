//! Randomized end-to-end workloads.
//!
//! Each scenario allocates roughly `QUOTA` bytes of random sizes, stamps every
//! block with a pattern derived from a per-block seed, verifies the patterns
//! survive neighbouring traffic, frees everything, and checks that the
//! allocator returns every byte to the OS.

use std::ptr::NonNull;

use pagemalloc_core::{Allocator, AllocatorConfig, AllocatorStats, BlockKind};

const QUOTA: usize = 128 << 20;

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `1..=max`.
    fn size(&mut self, max: usize) -> usize {
        (self.next_u64() % max as u64) as usize + 1
    }
}

struct Block {
    ptr: NonNull<[u8]>,
    seed: u64,
}

fn allocator() -> Allocator {
    Allocator::with_config(AllocatorConfig::default())
}

/// Small workload: sizes up to two OS pages, mostly slotted.
fn small_max(alloc: &Allocator) -> usize {
    2 * alloc.geometry().os_page_size()
}

/// Big workload: sizes up to two superpages, mostly large blocks.
fn big_max(alloc: &Allocator) -> usize {
    2 * alloc.geometry().page_size()
}

fn pattern(seed: u64, index: usize) -> u8 {
    (seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 7) as u8
}

fn bytes<'a>(ptr: NonNull<[u8]>) -> &'a mut [u8] {
    // SAFETY: blocks are live and exactly as long as requested.
    unsafe { &mut *ptr.as_ptr() }
}

fn stamp(block: &Block) {
    for (i, byte) in bytes(block.ptr).iter_mut().enumerate() {
        *byte = pattern(block.seed, i);
    }
}

fn verify_and_clear(alloc: &Allocator, block: &Block) {
    let data = bytes(block.ptr);
    // SAFETY: live block.
    let usable = unsafe { alloc.usable_size(block.ptr.cast()) };
    assert!(data.len() <= usable, "len {} > usable {usable}", data.len());
    for (i, byte) in data.iter_mut().enumerate() {
        assert_eq!(
            *byte,
            pattern(block.seed, i),
            "corrupted heap at {:p}+{i}",
            block.ptr.cast::<u8>()
        );
        *byte = 0;
    }
}

fn free(alloc: &mut Allocator, block: Block) {
    // SAFETY: each block is freed exactly once.
    unsafe { alloc.free(block.ptr) }.unwrap();
}

fn fill(alloc: &mut Allocator, rng: &mut XorShift64, max: usize) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut rem = QUOTA as isize;
    while rem > 0 {
        let size = rng.size(max);
        rem -= size as isize;
        let block = Block {
            ptr: alloc.malloc(size).unwrap(),
            seed: rng.next_u64(),
        };
        assert_eq!(block.ptr.len(), size);
        stamp(&block);
        blocks.push(block);
    }
    blocks
}

fn assert_empty(alloc: &Allocator) {
    assert_eq!(alloc.stats(), AllocatorStats::default());
    assert!(alloc.is_empty());
}

/// Fill, verify all, shuffle, free all.
fn verify_then_free_shuffled(max_of: fn(&Allocator) -> usize, seed: u64) {
    let mut alloc = allocator();
    let max = max_of(&alloc);
    let mut rng = XorShift64::new(seed);
    let mut blocks = fill(&mut alloc, &mut rng, max);
    assert_eq!(alloc.allocs(), blocks.len());
    assert!(alloc.bytes() >= QUOTA);

    for block in &blocks {
        verify_and_clear(&alloc, block);
    }
    for i in (1..blocks.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        blocks.swap(i, j);
    }
    for block in blocks {
        free(&mut alloc, block);
    }
    assert_empty(&alloc);
}

/// Fill, then verify and free in allocation order.
fn verify_and_free_in_order(max_of: fn(&Allocator) -> usize, seed: u64) {
    let mut alloc = allocator();
    let max = max_of(&alloc);
    let mut rng = XorShift64::new(seed);
    let blocks = fill(&mut alloc, &mut rng, max);
    for block in blocks {
        verify_and_clear(&alloc, &block);
        free(&mut alloc, block);
    }
    assert_empty(&alloc);
}

/// Two thirds allocations, one third frees of a random live block, until the
/// live total reaches the quota.
fn interleaved(max_of: fn(&Allocator) -> usize, seed: u64) {
    let mut alloc = allocator();
    let max = max_of(&alloc);
    let mut rng = XorShift64::new(seed);
    let mut live: Vec<Block> = Vec::new();
    let mut rem = QUOTA as isize;

    while rem > 0 {
        if rng.next_u64() % 3 < 2 {
            let size = rng.size(max);
            rem -= size as isize;
            let block = Block {
                ptr: alloc.malloc(size).unwrap(),
                seed: rng.next_u64(),
            };
            stamp(&block);
            live.push(block);
        } else if !live.is_empty() {
            let idx = (rng.next_u64() % live.len() as u64) as usize;
            let block = live.swap_remove(idx);
            verify_and_clear(&alloc, &block);
            rem += block.ptr.len() as isize;
            free(&mut alloc, block);
        }
        assert_eq!(alloc.allocs(), live.len());
    }

    for block in live {
        verify_and_clear(&alloc, &block);
        free(&mut alloc, block);
    }
    assert_empty(&alloc);
}

#[test]
fn test1_small() {
    verify_then_free_shuffled(small_max, 0x1234_5678_9ABC_DEF1);
}

#[test]
fn test1_big() {
    verify_then_free_shuffled(big_max, 0x0BAD_CAFE_F00D_0001);
}

#[test]
fn test2_small() {
    verify_and_free_in_order(small_max, 0xDEAD_BEEF_0000_0002);
}

#[test]
fn test2_big() {
    verify_and_free_in_order(big_max, 0xFEED_FACE_0000_0003);
}

#[test]
fn test3_small() {
    interleaved(small_max, 0xA5A5_5A5A_0000_0004);
}

#[test]
fn test3_big() {
    interleaved(big_max, 0x5EED_0000_0000_0005);
}

#[test]
fn free_accepts_zero_length_reslice() {
    let mut alloc = allocator();
    let block = alloc.malloc(1).unwrap();
    let head = NonNull::slice_from_raw_parts(block.cast::<u8>(), 0);
    // SAFETY: frees the block allocated above, once.
    unsafe { alloc.free(head) }.unwrap();
    assert_empty(&alloc);
}

#[test]
fn malloc_max_slot_size_stays_slotted() {
    let mut alloc = allocator();
    let max = alloc.max_slot_size();
    let block = alloc.malloc(max).unwrap();
    // SAFETY: live block.
    match unsafe { alloc.block_kind(block.cast()) } {
        BlockKind::Slotted { log } => assert!(1usize << log <= max),
        other => panic!("expected a slot, got {other:?}"),
    }
    // SAFETY: live block, freed once.
    unsafe { alloc.free(NonNull::slice_from_raw_parts(block.cast::<u8>(), 0)) }.unwrap();
    assert_empty(&alloc);
}

#[test]
fn calloc_zeroes_after_dirty_reuse() {
    let mut alloc = allocator();
    for size in [16, 100, 1000, alloc.max_slot_size()] {
        let anchor = alloc.malloc(size).unwrap();
        let dirty = alloc.malloc(size).unwrap();
        bytes(dirty).fill(0xFF);
        // SAFETY: live block, freed once.
        unsafe { alloc.free(dirty) }.unwrap();

        let clean = alloc.calloc(size).unwrap();
        assert!(bytes(clean).iter().all(|&b| b == 0), "size {size}");
        // SAFETY: live blocks, freed once.
        unsafe {
            alloc.free(clean).unwrap();
            alloc.free(anchor).unwrap();
        }
    }
    assert_empty(&alloc);
}

#[test]
fn live_blocks_never_overlap() {
    let mut alloc = allocator();
    let mut rng = XorShift64::new(99);
    let max = big_max(&alloc);
    let mut spans: Vec<(usize, usize, NonNull<[u8]>)> = (0..2000)
        .map(|i| {
            let size = if i % 10 == 0 { rng.size(max) } else { rng.size(512) };
            let ptr = alloc.malloc(size).unwrap();
            let start = ptr.cast::<u8>().as_ptr() as usize;
            // SAFETY: live block.
            let usable = unsafe { alloc.usable_size(ptr.cast()) };
            (start, start + usable, ptr)
        })
        .collect();
    spans.sort_by_key(|&(start, ..)| start);
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:#x}..{:#x} overlaps {:#x}", pair[0].0, pair[0].1, pair[1].0);
    }
    for (.., ptr) in spans {
        // SAFETY: live block, freed once.
        unsafe { alloc.free(ptr) }.unwrap();
    }
    assert_empty(&alloc);
}

#[test]
fn usable_size_is_monotonic_in_request() {
    let mut alloc = allocator();
    let mut prev = 0;
    let limit = 3 * alloc.geometry().os_page_size();
    for size in (1..limit).step_by(7) {
        let ptr = alloc.malloc_ptr(size).unwrap();
        // SAFETY: live block.
        let usable = unsafe { alloc.usable_size(ptr) };
        assert!(usable >= size);
        assert!(usable >= prev, "usable shrank at {size}");
        prev = usable;
        // SAFETY: live block, freed once.
        unsafe { alloc.free_ptr(ptr) }.unwrap();
    }
    assert_empty(&alloc);
}

#[test]
fn failed_allocation_changes_nothing() {
    let mut alloc = allocator();
    let keep = alloc.malloc(4096 * 3).unwrap();
    let before = alloc.stats();
    assert!(alloc.malloc(usize::MAX).is_err());
    assert!(alloc.calloc(usize::MAX / 2).is_err());
    assert_eq!(alloc.stats(), before);
    // SAFETY: live block, freed once.
    unsafe { alloc.free(keep) }.unwrap();
    assert_empty(&alloc);
}

#[test]
fn drop_releases_outstanding_blocks() {
    let mut alloc = allocator();
    for size in [8, 800, 80_000, 8_000_000] {
        alloc.malloc(size).unwrap();
    }
    assert_eq!(alloc.allocs(), 4);
    drop(alloc);

    let mut alloc = allocator();
    alloc.malloc(64).unwrap();
    alloc.close().unwrap();
    assert_empty(&alloc);
}
