use std::{alloc::Layout, ptr::NonNull};

use log::{debug, trace, warn};

use crate::{
    chunk::UnitAddr,
    config::{Config, Policy},
    error::HeapError,
    freelist::FreeList,
    kernel::{Kernel, MemorySource, SystemMemory},
    region::Regions,
    utils::{align, units_for},
};

/// A free-list heap on top of a page-granular [`MemorySource`].
///
/// The heap is an explicit context object: every piece of allocator state
/// (the free list, its rover, the growth counters) lives here and nothing is
/// global. It is single threaded by construction, the raw region pointers it
/// stores make it neither `Send` nor `Sync`.
pub struct Heap<S: MemorySource = SystemMemory> {
    pub(crate) config: Config,
    unit_size: usize,
    pub(crate) kernel: Kernel<S>,
    pub(crate) free_list: FreeList,
    regions: Regions,
}

impl Heap<SystemMemory> {
    /// Creates a heap that grows with memory from the operating system.
    pub fn new(config: Config) -> Result<Self, HeapError> {
        Self::with_source(config, SystemMemory)
    }
}

impl<S: MemorySource> Heap<S> {
    /// Creates a heap that grows with memory from `source`.
    ///
    /// Fails with [`HeapError::Config`] when the unit size does not evenly
    /// divide the page size or either of them is not a power of two.
    pub fn with_source(config: Config, source: S) -> Result<Self, HeapError> {
        let page_size = config.page_size.unwrap_or_else(|| source.page_size());
        config.validate(page_size)?;

        debug!(
            "new heap: {} bytes per page, {} bytes per unit, {}, coalescing {}",
            page_size,
            config.unit_size,
            config.policy,
            if config.coalescing { "on" } else { "off" }
        );

        Ok(Self {
            config,
            unit_size: config.unit_size,
            kernel: Kernel::new(source, page_size, config.unit_size),
            free_list: FreeList::new(),
            regions: Regions::new(config.unit_size),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bytes per growth request unit.
    pub fn page_size(&self) -> usize {
        self.kernel.page_size()
    }

    /// Bytes per chunk header, the granularity of every chunk.
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Returns a pointer to at least `nbytes` bytes of uninitialized memory.
    ///
    /// The block is carved out of a free chunk chosen by the configured
    /// [`Policy`], or out of freshly grown pages when no free chunk is large
    /// enough. The only error is the memory source running dry, which is also
    /// how requests too large for the address space are reported.
    ///
    /// # Panics
    ///
    /// When `nbytes` is zero.
    pub fn allocate(&mut self, nbytes: usize) -> Result<NonNull<u8>, HeapError> {
        assert!(nbytes > 0, "zero-byte allocation request");

        // Payload plus the header unit.
        let Some(units) = units_for(nbytes, self.unit_size).and_then(|units| units.checked_add(1))
        else {
            return Err(self.oversized(nbytes));
        };

        let found = if self.free_list.is_empty() {
            None
        } else {
            match self.config.policy {
                Policy::FirstFit => self.free_list.first_fit(units),
                Policy::BestFit => self.free_list.best_fit(units),
            }
        };

        let at = match found {
            Some(at) => at,
            None => self.grow_for(units)?,
        };

        debug_assert!(
            self.free_list
                .lookup(at)
                .is_some_and(|chunk| chunk.size == units && !chunk.is_free())
        );

        let payload = self.regions.payload(at);
        trace!("allocate({nbytes}) -> {payload:p} ({units} units at {at})");

        Ok(payload)
    }

    /// Same as [`Heap::allocate`] for a [`Layout`]. Payloads are aligned to
    /// the unit size, larger alignments are refused.
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.align() > self.unit_size {
            return Err(HeapError::UnsupportedAlignment {
                align: layout.align(),
                unit: self.unit_size,
            });
        }

        self.allocate(layout.size().max(1))
    }

    /// Grows the heap by enough pages for a chunk of `units` units and hands
    /// out its leading part. The rest of the new region goes to the free list.
    fn grow_for(&mut self, units: usize) -> Result<UnitAddr, HeapError> {
        let Some(bytes) = units
            .checked_mul(self.unit_size)
            .and_then(|bytes| align(bytes, self.kernel.page_size()))
        else {
            return Err(self.oversized(units.saturating_mul(self.unit_size)));
        };

        let base = self.kernel.grow(bytes)?;
        let start = self.regions.insert(base, bytes);
        let total = bytes / self.unit_size;

        self.free_list.adopt(start, units);

        // An exact fit hands out the whole region and leaves the free list
        // and its rover untouched.
        if total > units {
            let remainder = start + units;
            self.free_list.adopt(remainder, total - units);
            self.free_list.release(remainder, self.config.coalescing);
        }

        Ok(start)
    }

    /// A request whose size cannot be rounded to whole pages without
    /// overflowing. No source could ever grant it.
    fn oversized(&self, nbytes: usize) -> HeapError {
        let pages = nbytes / self.page_size() + 1;
        warn!("request of {nbytes} bytes does not fit in the address space");

        HeapError::OutOfMemory { bytes: nbytes, pages }
    }

    /// Gives the block at `ptr` back to the heap. A null pointer is ignored.
    ///
    /// # Panics
    ///
    /// When `ptr` was not returned by this heap or was already freed.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let at = self.header_of(ptr);

        match self.free_list.lookup(at) {
            Some(chunk) if !chunk.is_free() => {}
            Some(_) => panic!("double free of {ptr:p}"),
            None => panic!("{ptr:p} was not allocated by this heap"),
        }

        trace!("free({ptr:p}) at {at}");

        self.free_list.release(at, self.config.coalescing);
    }

    /// Usable bytes of the allocated block at `ptr`, or `None` when `ptr` is
    /// null or not a live allocation of this heap.
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr.addr();
        if addr < 2 * self.unit_size || addr % self.unit_size != 0 {
            return None;
        }

        self.free_list
            .lookup(self.header_of(ptr))
            .filter(|chunk| !chunk.is_free())
            .map(|chunk| (chunk.size - 1) * self.unit_size)
    }

    /// Unit address of the header in front of `ptr`.
    fn header_of(&self, ptr: *const u8) -> UnitAddr {
        let addr = ptr.addr();
        assert!(
            addr % self.unit_size == 0 && addr >= 2 * self.unit_size,
            "{ptr:p} is not a payload pointer of this heap"
        );

        UnitAddr(UnitAddr::from_byte_addr(addr, self.unit_size).0 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaMemory;

    const PAGE: usize = 4096;
    const UNIT: usize = 16;

    fn arena_heap(policy: Policy, coalescing: bool, pages: usize) -> Heap<ArenaMemory> {
        let config = Config::new()
            .with_page_size(PAGE)
            .with_unit_size(UNIT)
            .with_policy(policy)
            .with_coalescing(coalescing);

        Heap::with_source(config, ArenaMemory::new(PAGE, pages)).unwrap()
    }

    fn free_chunks(heap: &Heap<ArenaMemory>) -> usize {
        heap.free_list.iter().count() - 1
    }

    #[test]
    fn basic_alloc() {
        let mut heap = Heap::new(Config::default()).unwrap();

        let block = heap.allocate(std::mem::size_of::<u32>()).unwrap().cast::<u32>();
        unsafe {
            block.write(23);
            assert_eq!(23, block.read());
        }

        heap.free(block.as_ptr().cast());
        heap.validate();
    }

    #[test]
    fn rejects_misconfigured_units() {
        let config = Config::new().with_page_size(PAGE).with_unit_size(48);

        let err = Heap::with_source(config, ArenaMemory::new(PAGE, 1)).err();
        assert!(matches!(err, Some(HeapError::Config(_))));
    }

    #[test]
    fn capacity_is_within_one_unit_of_the_request() {
        for policy in [Policy::FirstFit, Policy::BestFit] {
            let mut heap = arena_heap(policy, true, 64);

            for nbytes in (1..200).chain([4080, 4081, 4096, 10_000]) {
                let ptr = heap.allocate(nbytes).unwrap();
                let capacity = heap.usable_size(ptr.as_ptr()).unwrap();

                assert!(capacity >= nbytes, "{nbytes} bytes got {capacity}");
                assert!(capacity < nbytes + UNIT, "{nbytes} bytes got {capacity}");
                assert_eq!(ptr.as_ptr().addr() % UNIT, 0);
            }

            heap.validate();
        }
    }

    #[test]
    fn blocks_are_usable_and_disjoint() {
        let mut heap = arena_heap(Policy::FirstFit, true, 4);

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();

        unsafe {
            a.as_ptr().write_bytes(0xAA, 100);
            b.as_ptr().write_bytes(0xBB, 100);

            assert!((0..100).all(|i| *a.as_ptr().add(i) == 0xAA));
            assert!((0..100).all(|i| *b.as_ptr().add(i) == 0xBB));
        }
    }

    #[test]
    fn first_fit_resumes_at_the_rover() {
        let mut heap = arena_heap(Policy::FirstFit, true, 4);

        let first = heap.allocate(4).unwrap();
        let _second = heap.allocate(8).unwrap();
        let third = heap.allocate(8).unwrap();

        heap.free(first.as_ptr());

        // The scan starts behind the last split, not at the hole in front.
        let fourth = heap.allocate(4).unwrap();
        assert_eq!(fourth, unsafe { third.add(2 * UNIT) });

        // Use up the tail of the page exactly, the next search wraps around.
        let _rest = heap.allocate(247 * UNIT).unwrap();
        let again = heap.allocate(4).unwrap();

        assert_eq!(again, first);
        assert_eq!(heap.stats().pages, 1);
        assert!(heap.free_list.is_empty());
        heap.validate();
    }

    #[test]
    fn growth_accounting_rounds_up_to_whole_pages() {
        let mut heap = arena_heap(Policy::FirstFit, true, 8);

        heap.allocate(PAGE * 7 / 2).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.pages, 4);
        assert_eq!(stats.growth_calls, 1);
    }

    #[test]
    fn small_requests_grow_a_single_page() {
        let mut heap = arena_heap(Policy::FirstFit, true, 8);

        heap.allocate(1).unwrap();

        assert_eq!(heap.stats().pages, 1);
    }

    #[test]
    fn requests_without_room_for_the_header_grow_two_pages() {
        // Anything above PAGE - UNIT bytes plus its header spills into a
        // second page, even below one page.
        for nbytes in [PAGE - UNIT + 1, PAGE - 6, PAGE - 1] {
            let mut heap = arena_heap(Policy::FirstFit, true, 8);

            let ptr = heap.allocate(nbytes).unwrap();

            assert_eq!(heap.stats().pages, 2, "{nbytes} bytes");
            assert_eq!(heap.stats().growth_calls, 1);
            assert_eq!(heap.usable_size(ptr.as_ptr()), Some(PAGE));
            heap.validate();
        }
    }

    #[test]
    fn oversized_requests_are_out_of_memory() {
        for policy in [Policy::FirstFit, Policy::BestFit] {
            let mut heap = arena_heap(policy, true, 4);
            let small = heap.allocate(100).unwrap();

            for nbytes in [usize::MAX, usize::MAX - 14, usize::MAX - 100, usize::MAX / 2] {
                let err = heap.allocate(nbytes).unwrap_err();
                assert!(
                    matches!(err, HeapError::OutOfMemory { .. }),
                    "{nbytes} bytes gave {err:?}"
                );
            }

            let stats = heap.stats();
            assert_eq!(stats.pages, 1);
            assert_eq!(stats.growth_calls, 1);
            heap.validate();

            // Nothing was carved out, the heap keeps serving normal requests.
            assert_eq!(stats.total_free_bytes, PAGE - 8 * UNIT);
            let other = heap.allocate(100).unwrap();
            heap.free(other.as_ptr());
            heap.free(small.as_ptr());
            assert!(heap.stats().no_leaks());
        }
    }

    #[test]
    fn a_full_page_request_needs_room_for_its_header() {
        let mut heap = arena_heap(Policy::FirstFit, true, 8);

        let ptr = heap.allocate(PAGE).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.pages, 2);
        assert_eq!(heap.usable_size(ptr.as_ptr()), Some(PAGE));
        // 2 pages = 512 units, 257 handed out.
        assert_eq!(stats.total_free_bytes, 255 * UNIT);
        heap.validate();
    }

    #[test]
    fn exact_single_page_fit_leaves_no_remainder() {
        for policy in [Policy::FirstFit, Policy::BestFit] {
            let mut heap = arena_heap(policy, true, 8);

            let ptr = heap.allocate(PAGE - UNIT).unwrap();

            assert_eq!(heap.stats().pages, 1);
            assert_eq!(free_chunks(&heap), 0);
            assert!(heap.free_list.is_empty());
            heap.validate();

            heap.free(ptr.as_ptr());

            let stats = heap.stats();
            assert_eq!(free_chunks(&heap), 1);
            assert_eq!(stats.total_free_bytes, PAGE);
            assert!(stats.no_leaks());
            heap.validate();
        }
    }

    #[test]
    fn exact_fit_growth_keeps_existing_free_chunks() {
        let mut heap = arena_heap(Policy::FirstFit, true, 8);

        let small = heap.allocate(64).unwrap();
        let rover = heap.free_list.rover();

        let whole = heap.allocate(PAGE - UNIT).unwrap();

        assert_eq!(heap.stats().pages, 2);
        assert_eq!(heap.free_list.rover(), rover);
        assert_eq!(free_chunks(&heap), 1);
        heap.validate();

        heap.free(whole.as_ptr());
        heap.free(small.as_ptr());
        assert!(heap.stats().no_leaks());
        assert_eq!(free_chunks(&heap), 1);
        heap.validate();
    }

    #[test]
    fn best_fit_picks_the_smallest_leftover() {
        let mut heap = arena_heap(Policy::BestFit, true, 1);

        // Carve one page so that three holes of 9, 6 and 13 units end up
        // separated by allocated blocks. Best fit hands out trailing ends, so
        // everything after the first block is laid out back to front.
        let h1 = heap.allocate(8 * UNIT).unwrap(); // units 0..9
        let _s1 = heap.allocate(UNIT).unwrap(); // 254..256
        let h3 = heap.allocate(12 * UNIT).unwrap(); // 241..254
        let _s2 = heap.allocate(UNIT).unwrap(); // 239..241
        let h2 = heap.allocate(5 * UNIT).unwrap(); // 233..239
        let _s3 = heap.allocate(UNIT).unwrap(); // 231..233
        let _filler = heap.allocate(221 * UNIT).unwrap(); // 9..231
        assert!(heap.free_list.is_empty());

        heap.free(h1.as_ptr());
        heap.free(h2.as_ptr());
        heap.free(h3.as_ptr());
        heap.validate();

        // Leftovers for a 4 unit chunk are 5, 2 and 9 in address order.
        let sizes: Vec<usize> = heap.free_list.iter().skip(1).map(|(_, c)| c.size).collect();
        assert_eq!(sizes, vec![9, 6, 13]);

        let block = heap.allocate(3 * UNIT).unwrap();

        assert_eq!(block, unsafe { h2.add(2 * UNIT) });
        let sizes: Vec<usize> = heap.free_list.iter().skip(1).map(|(_, c)| c.size).collect();
        assert_eq!(sizes, vec![9, 2, 13]);
        assert_eq!(heap.stats().pages, 1);
        heap.validate();
    }

    #[test]
    fn first_fit_splits_hand_out_leading_units() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);

        let a = heap.allocate(UNIT).unwrap();
        let b = heap.allocate(UNIT).unwrap();

        assert_eq!(b, unsafe { a.add(2 * UNIT) });
    }

    #[test]
    fn coalescing_bridges_three_regions() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let c = heap.allocate(100).unwrap();
        let _guard = heap.allocate(100).unwrap();

        heap.free(a.as_ptr());
        heap.free(c.as_ptr());
        assert_eq!(free_chunks(&heap), 3);
        heap.validate();

        heap.free(b.as_ptr());

        let chunks: Vec<_> = heap.free_list.iter().skip(1).map(|(at, c)| (at, c.size)).collect();
        assert_eq!(chunks.len(), 2);

        // 100 bytes take 7 payload units plus the header.
        let (at, size) = chunks[0];
        assert_eq!(at, UnitAddr(a.as_ptr().addr() / UNIT - 1));
        assert_eq!(size, 3 * 8);
        heap.validate();
    }

    #[test]
    fn without_coalescing_neighbours_stay_apart() {
        let mut heap = arena_heap(Policy::FirstFit, false, 1);

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();

        heap.free(a.as_ptr());
        heap.free(b.as_ptr());

        assert_eq!(free_chunks(&heap), 3);
        assert!(heap.stats().no_leaks());
        heap.validate();
    }

    #[test]
    fn round_trip_in_any_order_leaves_no_leaks() {
        for policy in [Policy::FirstFit, Policy::BestFit] {
            let mut heap = arena_heap(policy, true, 64);

            let sizes = [24, 500, 8, 4096, 1, 77, 3000, 16, 9000, 250, 40, 4080];
            let ptrs: Vec<_> = sizes.iter().map(|&n| heap.allocate(n).unwrap()).collect();
            heap.validate();

            // Free odd positions first, then the even ones backwards.
            for ptr in ptrs.iter().skip(1).step_by(2) {
                heap.free(ptr.as_ptr());
                heap.validate();
            }
            for ptr in ptrs.iter().step_by(2).rev() {
                heap.free(ptr.as_ptr());
                heap.validate();
            }

            let stats = heap.stats();
            assert_eq!(stats.total_free_bytes, stats.pages * PAGE);
            assert!(stats.no_leaks());
        }
    }

    #[test]
    fn mixed_workload_keeps_the_list_valid() {
        for (policy, coalescing) in [
            (Policy::FirstFit, true),
            (Policy::FirstFit, false),
            (Policy::BestFit, true),
            (Policy::BestFit, false),
        ] {
            let mut heap = arena_heap(policy, coalescing, 256);
            let mut live = Vec::new();

            // Deterministic pseudo random sizes and frees.
            let mut seed: u32 = 0x2545_f491;
            for round in 0..400 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;

                if round % 3 == 2 && !live.is_empty() {
                    let victim: NonNull<u8> = live.swap_remove(seed as usize % live.len());
                    heap.free(victim.as_ptr());
                } else {
                    let nbytes = 1 + seed as usize % 700;
                    live.push(heap.allocate(nbytes).unwrap());
                }

                assert_eq!(heap.check(), Ok(()));
            }

            for ptr in live.drain(..) {
                heap.free(ptr.as_ptr());
            }
            heap.validate();

            if coalescing {
                assert_eq!(free_chunks(&heap), 1);
            }
            assert!(heap.stats().no_leaks());
        }
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let mut heap = arena_heap(Policy::FirstFit, true, 2);

        let kept = heap.allocate(PAGE).unwrap();
        let err = heap.allocate(PAGE).unwrap_err();

        assert!(matches!(err, HeapError::OutOfMemory { bytes: 8192, pages: 2 }));
        assert_eq!(heap.stats().growth_calls, 1);
        heap.validate();

        // What is left still serves smaller requests.
        assert!(heap.allocate(PAGE / 2).is_ok());
        heap.free(kept.as_ptr());
        heap.validate();
    }

    #[test]
    fn growth_remainder_is_inserted_in_address_order() {
        let mut heap = arena_heap(Policy::FirstFit, true, 4);

        let small = heap.allocate(64).unwrap();
        let big = heap.allocate(2 * PAGE).unwrap();

        // 5 units in the first page, then 513 units out of three new pages.
        let tails: Vec<_> = heap.free_list.iter().skip(1).map(|(_, c)| c.size).collect();
        assert_eq!(tails, vec![251, 255]);
        heap.validate();

        // The arena grows contiguously, so the big block bridges both tails.
        heap.free(big.as_ptr());
        let tails: Vec<_> = heap.free_list.iter().skip(1).map(|(_, c)| c.size).collect();
        assert_eq!(tails, vec![251 + 513 + 255]);

        heap.free(small.as_ptr());
        assert_eq!(free_chunks(&heap), 1);
        assert!(heap.stats().no_leaks());
        heap.validate();
    }

    #[test]
    fn layouts_respect_the_unit_alignment() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);

        let ptr = heap.allocate_layout(Layout::new::<u64>()).unwrap();
        assert_eq!(heap.usable_size(ptr.as_ptr()), Some(UNIT));

        let zst = heap.allocate_layout(Layout::new::<()>()).unwrap();
        assert_eq!(heap.usable_size(zst.as_ptr()), Some(UNIT));

        let err = heap
            .allocate_layout(Layout::from_size_align(64, 64).unwrap())
            .unwrap_err();
        assert!(matches!(err, HeapError::UnsupportedAlignment { align: 64, unit: UNIT }));
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);

        heap.free(std::ptr::null_mut());

        assert_eq!(heap.stats().growth_calls, 0);
        assert!(heap.free_list.is_empty());
    }

    #[test]
    fn usable_size_ignores_foreign_pointers() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);
        let ptr = heap.allocate(10).unwrap();

        assert_eq!(heap.usable_size(std::ptr::null()), None);
        assert_eq!(heap.usable_size(unsafe { ptr.as_ptr().add(1) }), None);

        heap.free(ptr.as_ptr());
        assert_eq!(heap.usable_size(ptr.as_ptr()), None);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);
        let ptr = heap.allocate(10).unwrap();

        heap.free(ptr.as_ptr());
        heap.free(ptr.as_ptr());
    }

    #[test]
    #[should_panic(expected = "not allocated by this heap")]
    fn foreign_free_is_fatal() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);
        let mut local = [0u128; 4];

        heap.free(local.as_mut_ptr().cast::<u8>().wrapping_add(16));
    }

    #[test]
    #[should_panic(expected = "zero-byte allocation request")]
    fn zero_byte_requests_are_fatal() {
        let mut heap = arena_heap(Policy::FirstFit, true, 1);

        let _ = heap.allocate(0);
    }
}
