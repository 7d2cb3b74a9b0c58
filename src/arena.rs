use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::kernel::MemorySource;

/// A fixed-capacity memory source that behaves like a program break.
///
/// The whole capacity is reserved up front as one page-aligned buffer and
/// handed out front to back, so consecutive growth calls return adjacent
/// regions exactly like `sbrk` would. Once the buffer is used up the source
/// refuses further requests, which makes heap exhaustion reproducible.
///
/// ```text
///   base                     brk                        base + capacity
///    |                        |                               |
///    v                        v                               v
///    +------------------------+-------------------------------+
///    |   granted to the heap  |          still unused         |
///    +------------------------+-------------------------------+
/// ```
///
/// The buffer is released when the arena is dropped, so pointers handed out
/// by a heap built on top of it must not outlive the heap.
pub struct ArenaMemory {
    base: NonNull<u8>,
    layout: Layout,
    page_size: usize,
    /// Bytes handed out so far.
    brk: usize,
}

impl ArenaMemory {
    /// Reserves `pages` pages of `page_size` bytes. `page_size` must be a
    /// power of two and `pages` must be non-zero.
    pub fn new(page_size: usize, pages: usize) -> Self {
        assert!(pages > 0, "an arena needs at least one page");

        let layout = Layout::from_size_align(page_size * pages, page_size)
            .expect("arena page size must be a power of two");

        let base = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            alloc::handle_alloc_error(layout);
        };

        Self {
            base,
            layout,
            page_size,
            brk: 0,
        }
    }

    /// Total bytes this arena can grant.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes not handed out yet.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.brk
    }
}

unsafe impl MemorySource for ArenaMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        if len > self.remaining() {
            return None;
        }

        // `brk + len` never passes the end of the buffer.
        let region = unsafe { self.base.add(self.brk) };
        self.brk += len;

        Some(region)
    }
}

impl Drop for ArenaMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}
