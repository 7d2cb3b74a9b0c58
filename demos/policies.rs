//! Runs the same allocation trace against every combination of placement
//! policy and coalescing, then prints the resulting statistics.
//!
//! Pass a policy name (`first-fit` or `best-fit`) to run only that policy.
//! Set `RUST_LOG=trace` to follow every split and merge.

use std::ptr::NonNull;

use roverheap::{ArenaMemory, Config, Heap, Policy};

const PAGE: usize = 4096;

/// Deterministic sizes between 1 and 2000 bytes.
fn trace(len: usize) -> Vec<usize> {
    let mut seed: u32 = 0x9e37_79b9;

    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            1 + seed as usize % 2000
        })
        .collect()
}

fn run(policy: Policy, coalescing: bool) {
    let config = Config::new()
        .with_page_size(PAGE)
        .with_policy(policy)
        .with_coalescing(coalescing);
    let mut heap = Heap::with_source(config, ArenaMemory::new(PAGE, 1024))
        .expect("invalid heap configuration");

    let mut live: Vec<NonNull<u8>> = Vec::new();
    for (i, nbytes) in trace(500).into_iter().enumerate() {
        // Every third step frees the oldest block still alive.
        if i % 3 == 2 && !live.is_empty() {
            heap.free(live.remove(0).as_ptr());
        } else {
            match heap.allocate(nbytes) {
                Ok(ptr) => live.push(ptr),
                Err(err) => {
                    eprintln!("{err}");
                    break;
                }
            }
        }
    }

    println!("== {policy}, coalescing {}", if coalescing { "on" } else { "off" });
    println!("-- while {} blocks are live", live.len());
    println!("{}\n", heap.stats());

    for ptr in live.drain(..) {
        heap.free(ptr.as_ptr());
    }
    heap.validate();

    println!("-- after freeing everything");
    println!("{}\n", heap.stats());
}

fn main() {
    env_logger::init();

    let policies = match std::env::args().nth(1) {
        Some(name) => match name.parse::<Policy>() {
            Ok(policy) => vec![policy],
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(2);
            }
        },
        None => vec![Policy::FirstFit, Policy::BestFit],
    };

    for policy in policies {
        for coalescing in [true, false] {
            run(policy, coalescing);
        }
    }
}
