//! # roverheap
//!
//! A free-list heap built directly on top of a page-granular memory source.
//!
//! Free chunks are kept in one circular, address-ordered, singly linked list
//! anchored by a dummy chunk of size zero. A cursor, the rover, remembers
//! where the last search or insertion stopped and the next scan starts there.
//!
//! ```text
//!                  rover
//!                    |
//!                    v
//!  +-------+    +---------+    +---------+    +---------+
//!  | dummy | -> |  free   | -> |  free   | -> |  free   | --+
//!  +-------+    +---------+    +---------+    +---------+   |
//!      ^                                                    |
//!      +----------------------------------------------------+
//! ```
//!
//! Every chunk is measured in units, the size of a chunk header. A chunk of
//! `size` units spans one header unit followed by `size - 1` payload units.
//! Requests are rounded up to whole units; when no free chunk fits, the heap
//! grows by whole pages and carves the request out of the new region.
//!
//! Placement follows a [`Policy`]:
//!
//! - [`Policy::FirstFit`]: first chunk large enough from the rover, handing
//!   out the leading part of a split chunk.
//! - [`Policy::BestFit`]: chunk with the fewest spare units over a full
//!   cycle, handing out the trailing part of a split chunk.
//!
//! With coalescing on, a freed chunk is merged with the free chunks directly
//! before and after it in memory.
//!
//! ## Quick Start
//!
//! ```rust
//! use roverheap::{ArenaMemory, Config, Heap, Policy};
//!
//! let config = Config::new().with_page_size(4096).with_policy(Policy::BestFit);
//! let mut heap = Heap::with_source(config, ArenaMemory::new(4096, 16)).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! unsafe { ptr.as_ptr().write_bytes(0, 100) };
//! heap.free(ptr.as_ptr());
//!
//! heap.validate();
//! assert!(heap.stats().no_leaks());
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: a [`Heap`] is neither `Send` nor `Sync`.
//! - **Pages are never returned**: memory obtained from the OS stays with
//!   the heap until the process exits.
//! - **Unit alignment**: payloads are aligned to the unit size and no more.

mod arena;
mod chunk;
mod config;
mod error;
mod freelist;
mod heap;
mod kernel;
mod region;
mod stats;
mod utils;

pub use arena::ArenaMemory;
pub use chunk::{HEADER_UNIT_SIZE, UnitAddr};
pub use config::{Config, Policy};
pub use error::{ConfigError, Corruption, HeapError};
pub use heap::Heap;
pub use kernel::{MemorySource, SystemMemory, page_size};
pub use stats::{ChunkLine, FreeListDump, HeapStats};
