use std::{ptr::NonNull, sync::OnceLock};

use log::{debug, warn};

use crate::error::HeapError;

/// This trait provides an abstraction over the low level call that extends
/// the heap. As the allocator, our top level view of this has nothing to do
/// with the concrete implementations / APIs offered by each kernel.
///
/// # Safety
///
/// Implementors must guarantee that every pointer returned by
/// [`MemorySource::request_memory`] is valid for reads and writes of `len`
/// bytes for as long as the source is alive, is aligned to
/// [`MemorySource::page_size`], and never overlaps memory handed out before.
pub unsafe trait MemorySource {
    /// Size in bytes of the pages this source grants.
    fn page_size(&self) -> usize;

    /// Request a fresh memory region of size `len`. It returns a pointer to
    /// the region or `None` if the source is exhausted.
    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// Memory straight from the operating system. Pages are never given back,
/// the OS reclaims them when the process exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

/// Virtual memory page size of the computer. This is usually 4096.
#[inline]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(platform::page_size)
}

unsafe impl MemorySource for SystemMemory {
    fn page_size(&self) -> usize {
        page_size()
    }

    fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        unsafe { platform::request_memory(len) }
    }
}

#[cfg(unix)]
mod platform {
    use libc::{mmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    pub(super) unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
        // mmap parameters.
        const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
        // Read-Write only memory.
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        let addr = unsafe { mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) };

        if addr == libc::MAP_FAILED {
            return None;
        }

        NonNull::new(addr.cast::<u8>())
    }

    pub(super) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(windows)]
mod platform {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    pub(super) unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
        // Read-Write only.
        let protection = Memory::PAGE_READWRITE;

        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        unsafe {
            let addr = Memory::VirtualAlloc(None, len, flags, protection);

            NonNull::new(addr.cast())
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

/// The heap growth manager. Every byte the allocator owns went through
/// [`Kernel::grow`], which is also where pages and growth calls are counted.
pub(crate) struct Kernel<S> {
    source: S,
    page_size: usize,
    unit_size: usize,
    /// Pages obtained so far.
    pages: usize,
    /// Successful calls to the memory source.
    calls: usize,
}

impl<S: MemorySource> Kernel<S> {
    /// `unit_size` must divide `page_size`; the heap checks this once when it
    /// validates its configuration.
    pub(crate) fn new(source: S, page_size: usize, unit_size: usize) -> Self {
        Self {
            source,
            page_size,
            unit_size,
            pages: 0,
            calls: 0,
        }
    }

    /// Requests `bytes` of fresh memory in one call to the source.
    ///
    /// `bytes` must be a positive multiple of the page size. Failure of the
    /// source is reported as [`HeapError::OutOfMemory`] and is never retried.
    pub(crate) fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        assert!(
            bytes > 0 && bytes % self.page_size == 0,
            "growth request of {bytes} bytes is not a positive multiple of the page size {}",
            self.page_size
        );

        let pages = bytes / self.page_size;

        let Some(base) = self.source.request_memory(bytes) else {
            warn!("memory source refused {pages} pages ({bytes} bytes)");
            return Err(HeapError::OutOfMemory { bytes, pages });
        };

        assert_eq!(
            base.as_ptr().addr() % self.unit_size,
            0,
            "memory source returned {base:p}, which is not aligned to the unit size"
        );

        self.calls += 1;
        self.pages += pages;

        debug!(
            "grew heap by {pages} pages at {base:p} (total {} pages in {} calls)",
            self.pages, self.calls
        );

        Ok(base)
    }

    #[inline]
    pub(crate) fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    pub(crate) fn calls(&self) -> usize {
        self.calls
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }
}
