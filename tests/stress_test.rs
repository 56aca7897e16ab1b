use core::ptr::NonNull;

use chunk_allocator::{FreeError, RawAlloc, ToyHeap, ALIGNMENT, HEADER_SIZE};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_env_log::test;

const CHUNK: usize = 4096;
const SLOTS: usize = 128;

#[derive(Copy, Clone)]
struct Live {
    ptr: NonNull<u8>,
    requested: usize,
    fill: u8,
}

fn block_bytes(live: &Live) -> usize {
    unsafe { RawAlloc::<ToyHeap>::usable_size(live.ptr) + HEADER_SIZE }
}

fn validate(allocator: &RawAlloc<ToyHeap>, slots: &[Option<Live>], leaked: usize) {
    let (validity, stats) = allocator.stats();
    log::info!(
        "heap_size: {}; leaked: {}; Validity: {:?}, Stats: {:?}",
        allocator.arena.len(),
        leaked,
        validity,
        stats,
    );
    log::debug!("Blocks: {}", allocator.blocks);
    assert!(validity.is_valid());

    // Every byte of the arena is either free, handed out, or lost to a free
    // that found an empty free list.
    let outstanding: usize = slots.iter().flatten().map(block_bytes).sum();
    assert_eq!(allocator.arena.len(), stats.size + outstanding + leaked);

    // Outstanding blocks never overlap, with each other or with free blocks.
    let mut ranges: Vec<(usize, usize)> = slots
        .iter()
        .flatten()
        .map(|live| {
            let start = live.ptr.as_ptr() as usize - HEADER_SIZE;
            (start, start + block_bytes(live))
        })
        .chain(allocator.blocks.iter().map(|b| (b.start(), b.end())))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

fn check_contents(live: &Live) {
    let bytes = unsafe { core::slice::from_raw_parts(live.ptr.as_ptr(), live.requested) };
    assert!(
        bytes.iter().all(|&b| b == live.fill),
        "allocation at {:p} was overwritten",
        live.ptr
    );
}

#[test]
fn test_stress() {
    let mut memory = vec![0u8; 4 * 1024 * 1024];
    let mut allocator = RawAlloc::new(ToyHeap::new(&mut memory, CHUNK));

    let mut slots: [Option<Live>; SLOTS] = [None; SLOTS];
    let mut leaked: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for step in 0..1024 * 10 {
        let chosen = slots.choose_mut(&mut rng).unwrap();
        match *chosen {
            None => {
                // Let's try allocating
                let requested = range.sample(&mut rng) * range.sample(&mut rng);
                let ptr = allocator.alloc(requested).expect("non-zero request");
                log::info!("Allocated {:?} {}", ptr, requested);

                assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
                assert!(unsafe { RawAlloc::<ToyHeap>::usable_size(ptr) } >= requested);

                let fill = (step % 251) as u8;
                unsafe { core::ptr::write_bytes(ptr.as_ptr(), fill, requested) };
                *chosen = Some(Live {
                    ptr,
                    requested,
                    fill,
                });
            }
            Some(live) => {
                // Let's try freeing
                check_contents(&live);
                let bytes = block_bytes(&live);
                log::info!("Deallocating {:?} {}", live.ptr, live.requested);
                match unsafe { allocator.free(live.ptr.as_ptr()) } {
                    Ok(()) => {}
                    Err(FreeError::EmptyRegistry) => leaked += bytes,
                    Err(err) => panic!("unexpected free failure: {}", err),
                }
                *chosen = None;
            }
        }

        // And validate that everything is ok
        validate(&allocator, &slots, leaked);
    }

    for live in slots.iter().flatten() {
        check_contents(live);
    }
}

#[test]
fn test_free_everything_coalesces() {
    let mut memory = vec![0u8; 1024 * 1024];
    let mut allocator = RawAlloc::new(ToyHeap::new(&mut memory, CHUNK));

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 48);

    // Fill exactly one chunk's worth of small blocks without running past it.
    let mut pointers = Vec::new();
    let mut used = 0;
    loop {
        let requested = range.sample(&mut rng);
        let size = RawAlloc::<ToyHeap>::block_size(requested).unwrap();
        // Keep the tail big enough to stay on the free list.
        if used + size + 64 > CHUNK {
            break;
        }
        pointers.push(allocator.alloc(requested).unwrap());
        used += size;
    }
    assert_eq!(allocator.arena.chunks(), 1);
    assert_eq!(allocator.blocks.len(), 1);

    pointers.shuffle(&mut rng);
    for ptr in pointers {
        unsafe { allocator.free(ptr.as_ptr()).unwrap() };
        assert!(allocator.stats().0.is_valid());
    }

    // Order doesn't matter: physical neighbors always find each other.
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.length, 1);
    assert_eq!(stats.size, CHUNK);
}
