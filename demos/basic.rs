use std::alloc::Layout;

use roverheap::{Config, Heap};

fn log_alloc(addr: *mut u8, layout: Layout) {
    println!("Requested {} bytes of memory", layout.size());
    println!("Received this address: {addr:?}");
}

fn main() {
    env_logger::init();

    let mut heap = Heap::new(Config::default()).expect("invalid heap configuration");

    let l1 = Layout::new::<u64>();
    let addr1 = heap.allocate_layout(l1).expect("out of memory").as_ptr();
    log_alloc(addr1, l1);

    let l2 = Layout::array::<u8>(8).unwrap();
    let addr2 = heap.allocate_layout(l2).expect("out of memory").as_ptr();
    log_alloc(addr2, l2);

    let l3 = Layout::array::<u8>(16).unwrap();
    let addr3 = heap.allocate_layout(l3).expect("out of memory").as_ptr();
    log_alloc(addr3, l3);

    println!("\nFree list after three allocations:");
    heap.print();

    heap.free(addr1);
    heap.free(addr2);
    heap.free(addr3);

    println!("\nFree list after freeing everything:");
    heap.print();
    println!("\n{}", heap.stats());
}
