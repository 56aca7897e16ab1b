//! This is a very minimal example to show the arena growing chunk by chunk.

#[cfg(unix)]
fn main() {
    use chunk_allocator::{MemAlloc, CHUNK_SIZE};

    env_logger::init();

    let mut allocator = MemAlloc::default();

    let small = allocator.alloc(8).unwrap();
    println!(
        "alloc(8) -> {:p}; {} chunk(s) reserved",
        small,
        allocator.arena.chunks()
    );

    // Too big for what's left of the first chunk, so the arena grows in place.
    let large = allocator.alloc(2 * CHUNK_SIZE).unwrap();
    println!(
        "alloc({}) -> {:p}; {} chunk(s) reserved",
        2 * CHUNK_SIZE,
        large,
        allocator.arena.chunks()
    );

    unsafe {
        allocator.free(large.as_ptr()).unwrap();
        allocator.free(small.as_ptr()).unwrap();
    }
    println!("Free list: {}", allocator.blocks);
}

#[cfg(not(unix))]
fn main() {
    println!("The mmap-backed arena needs a Unix OS.");
}
