//! Demo target with a deliberate slow leak.
//!
//! Four worker threads allocate and free buffers at random; one of them
//! occasionally "forgets" a buffer. Run it under the tracer and watch
//! the leaking call stack float to the top:
//!
//! ```text
//! LD_PRELOAD=../target/release/libmemleak_trace.so ./target/release/leaky
//! memleak   # in another terminal, from the same directory
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const ITERATIONS: usize = 10_000_000;

static LEAKED: AtomicUsize = AtomicUsize::new(0);

/// Small deterministic PRNG so runs are comparable.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn do_work(queue: Arc<Mutex<VecDeque<Vec<u8>>>>, seed: u64, leak: bool) {
    let mut rng = XorShift(seed);
    for _ in 0..ITERATIONS {
        let r = rng.next();
        let allocate = r & 1 == 0;
        let size = ((r >> 3) & 0xff) as usize + 1;
        let leak_this_one = leak && (r >> 19) & 0xfff == 0;

        if allocate {
            queue.lock().unwrap().push_back(vec![0u8; size]);
        } else if let Some(buf) = queue.lock().unwrap().pop_front() {
            if leak_this_one {
                std::mem::forget(buf);
                LEAKED.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn main() {
    println!("leaky: PID {}", std::process::id());

    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || do_work(queue, 0x1234_aabc + i, i == 1))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let purged = queue.lock().unwrap().len();
    println!("leaky: purged {} allocations still queued.", purged);
    queue.lock().unwrap().clear();
    println!(
        "leaky: deliberate number of missed frees: {}",
        LEAKED.load(Ordering::Relaxed)
    );
}
