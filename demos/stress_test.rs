//! Churns the global allocator with a mix of vectors, strings and boxed
//! arrays, checking the free list and every live payload as it goes.
//!
//! No logger is installed: log records are emitted under the allocator's lock,
//! and a logger that allocates would deadlock.
//!
//! USAGE: stress_test [STEPS] [LIVE_OBJECTS] [LOG2_MAX_LEN]

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

#[cfg(unix)]
#[global_allocator]
static ALLOCATOR: chunk_allocator::UnixAllocator = chunk_allocator::UnixAllocator::new();

const STEPS: usize = 64 * 1024;
const LIVE_OBJECTS: usize = 1024;
const LOG2_MAX_LEN: u32 = 20;

enum Object {
    Words(Vec<u64>),
    Text(String),
    Boxed(Box<[u8; 4096]>),
}

impl Object {
    fn random<R: Rng>(rng: &mut R, log2_max_len: u32) -> Object {
        let len = 1usize << rng.gen_range(0, log2_max_len.max(1));
        let len = rng.gen_range(len / 2, len) + 1;
        match rng.gen_range(0, 3) {
            0 => Object::Words((0..len as u64).collect()),
            1 => Object::Text((0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect()),
            _ => {
                let mut page = Box::new([0u8; 4096]);
                for (i, b) in page.iter_mut().enumerate() {
                    *b = i as u8;
                }
                Object::Boxed(page)
            }
        }
    }

    fn bytes(&self) -> usize {
        match self {
            Object::Words(v) => v.len() * 8,
            Object::Text(s) => s.len(),
            Object::Boxed(b) => b.len(),
        }
    }

    // Every payload is a simple function of its index; anything else means two
    // objects were handed the same memory.
    fn intact(&self) -> bool {
        match self {
            Object::Words(v) => v.iter().enumerate().all(|(i, &w)| w == i as u64),
            Object::Text(s) => s
                .bytes()
                .enumerate()
                .all(|(i, c)| c == b'a' + (i % 26) as u8),
            Object::Boxed(b) => b.iter().enumerate().all(|(i, &x)| x == i as u8),
        }
    }
}

fn check_free_list() {
    #[cfg(unix)]
    {
        let (validity, _) = ALLOCATOR.stats();
        assert!(validity.is_valid(), "free list corrupted: {:?}", validity);
    }
}

fn arg<T: std::str::FromStr>(args: &[String], ix: usize, default: T) -> T {
    args.get(ix).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let steps: usize = arg(&args, 1, STEPS);
    let live_objects: usize = arg(&args, 2, LIVE_OBJECTS).max(1);
    let log2_max_len: u32 = arg(&args, 3, LOG2_MAX_LEN);

    let seed = rand::thread_rng().next_u64();
    println!(
        "steps: {}, live objects: {}, max length: 2^{}, seed: {}",
        steps, live_objects, log2_max_len, seed
    );
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut slots: Vec<Option<Object>> = (0..live_objects).map(|_| None).collect();
    let pick = Uniform::new(0, live_objects);

    for step in 1..=steps {
        let slot = &mut slots[pick.sample(&mut rng)];
        match slot.take() {
            Some(old) => assert!(old.intact(), "step {}: payload overwritten", step),
            None => *slot = Some(Object::random(&mut rng, log2_max_len)),
        }
        check_free_list();

        if step % 4096 == 0 {
            let live: Vec<&Object> = slots.iter().flatten().collect();
            let bytes: usize = live.iter().map(|o| o.bytes()).sum();
            println!("step {}: {} objects, {} bytes", step, live.len(), bytes);
            #[cfg(unix)]
            println!("    free list: {:?}", ALLOCATOR.stats().1);
        }
    }

    for object in slots.drain(..).flatten() {
        assert!(object.intact());
    }
    check_free_list();

    println!("Finished.");
    #[cfg(unix)]
    println!("    free list: {:?}", ALLOCATOR.stats().1);
}
