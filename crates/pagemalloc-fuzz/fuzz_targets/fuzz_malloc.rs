#![no_main]
use std::ptr::NonNull;

use libfuzzer_sys::fuzz_target;
use pagemalloc_core::{Allocator, AllocatorConfig};

struct Live {
    block: NonNull<[u8]>,
    fill: u8,
}

fn check(live: &Live) {
    // SAFETY: live blocks are valid for their length.
    let bytes = unsafe { live.block.as_ref() };
    assert!(bytes.iter().all(|&b| b == live.fill), "heap corruption");
}

fn stamp(block: NonNull<[u8]>, fill: u8) {
    // SAFETY: freshly returned blocks are writable for their length.
    unsafe { (*block.as_ptr()).fill(fill) };
}

fuzz_target!(|data: &[u8]| {
    // Parse data as a sequence of malloc/calloc/realloc/free operations.
    if data.len() < 4 {
        return;
    }

    let mut alloc = Allocator::with_config(AllocatorConfig::default().with_superpage_pages(2));
    let mut live: Vec<Live> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let fill = chunk[3];

        match op {
            0 => {
                let block = alloc.malloc(size).unwrap();
                stamp(block, fill);
                live.push(Live { block, fill });
            }
            1 => {
                let block = alloc.calloc(size).unwrap();
                // SAFETY: fresh block.
                assert!(unsafe { block.as_ref() }.iter().all(|&b| b == 0));
                stamp(block, fill);
                live.push(Live { block, fill });
            }
            2 if !live.is_empty() => {
                let idx = fill as usize % live.len();
                let entry = live.swap_remove(idx);
                check(&entry);
                // SAFETY: live block, freed once.
                unsafe { alloc.free(entry.block) }.unwrap();
            }
            3 if !live.is_empty() => {
                let idx = fill as usize % live.len();
                let entry = live.swap_remove(idx);
                check(&entry);
                let keep = entry.block.len().min(size);
                // SAFETY: live block; its length never exceeds its usable size.
                if let Some(block) = unsafe { alloc.realloc(Some(entry.block), size) }.unwrap() {
                    // SAFETY: resized block is valid for `size` bytes.
                    let bytes = unsafe { &mut *block.as_ptr() };
                    assert!(bytes[..keep].iter().all(|&b| b == entry.fill));
                    bytes.fill(entry.fill);
                    live.push(Live {
                        block,
                        fill: entry.fill,
                    });
                }
            }
            _ => {}
        }
        assert_eq!(alloc.allocs(), live.len());
    }

    for entry in live {
        check(&entry);
        // SAFETY: live block, freed once.
        unsafe { alloc.free(entry.block) }.unwrap();
    }
    assert!(alloc.is_empty());
});
