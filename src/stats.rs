//! Read-only views of the heap: statistics, a dump of the free list and the
//! structural validator.

use std::fmt;

use crate::{
    chunk::UnitAddr,
    error::Corruption,
    freelist::DUMMY,
    heap::Heap,
    kernel::MemorySource,
};

/// Snapshot of the growth counters and the free list. Sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Pages obtained from the memory source.
    pub pages: usize,
    /// Successful growth calls.
    pub growth_calls: usize,
    /// Chunks in the free list, dummy included.
    pub chunk_count: usize,
    /// Smallest free chunk other than the dummy, 0 when there is none.
    pub min_size: usize,
    pub max_size: usize,
    /// Total over `chunk_count`, so the dummy pulls the average down.
    pub avg_size: usize,
    /// Bytes in the free list, headers included.
    pub total_free_bytes: usize,
    pub page_size: usize,
    pub unit_size: usize,
}

impl HeapStats {
    /// True when every page ever obtained is back in the free list.
    pub fn no_leaks(&self) -> bool {
        self.total_free_bytes == self.pages * self.page_size
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total number of pages = {}", self.pages)?;
        writeln!(f, "Memory source was called {} times", self.growth_calls)?;
        writeln!(f, "Chunks in free list = {}", self.chunk_count)?;
        writeln!(f, "Min chunk size = {} bytes", self.min_size)?;
        writeln!(f, "Max chunk size = {} bytes", self.max_size)?;
        writeln!(f, "Average chunk size = {} bytes", self.avg_size)?;
        writeln!(f, "Unit size = {} bytes", self.unit_size)?;
        write!(f, "Total bytes in free list = {}", self.total_free_bytes)?;

        if self.no_leaks() {
            write!(f, "\nall memory is in the free list -- no leaks are possible")?;
        }

        Ok(())
    }
}

/// One line of a [`FreeListDump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLine {
    /// Byte address of the chunk header.
    pub addr: usize,
    /// Size in bytes, header included.
    pub size: usize,
    /// Byte address of the successor.
    pub next: usize,
    pub is_dummy: bool,
}

/// The free list in list order, starting at the dummy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeListDump {
    pub chunks: Vec<ChunkLine>,
}

impl fmt::Display for FreeListDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in &self.chunks {
            write!(
                f,
                "p={:#x}, size={}, end={:#x}, next={:#x}",
                chunk.addr,
                chunk.size,
                chunk.addr + chunk.size,
                chunk.next
            )?;

            if chunk.is_dummy {
                f.write_str(" <-- dummy")?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

impl<S: MemorySource> Heap<S> {
    /// Counters and free list statistics.
    pub fn stats(&self) -> HeapStats {
        let unit = self.unit_size();

        let mut chunk_count = 0;
        let mut total_units = 0;
        let mut min_units = None::<usize>;
        let mut max_units = 0;

        for (at, chunk) in self.free_list.iter() {
            chunk_count += 1;
            total_units += chunk.size;
            max_units = max_units.max(chunk.size);

            if at != DUMMY {
                min_units = Some(min_units.map_or(chunk.size, |min| min.min(chunk.size)));
            }
        }

        HeapStats {
            pages: self.kernel.pages(),
            growth_calls: self.kernel.calls(),
            chunk_count,
            min_size: min_units.unwrap_or(0) * unit,
            max_size: max_units * unit,
            avg_size: total_units * unit / chunk_count.max(1),
            total_free_bytes: total_units * unit,
            page_size: self.page_size(),
            unit_size: unit,
        }
    }

    /// The free list as byte addresses, ready to be printed.
    pub fn dump(&self) -> FreeListDump {
        let unit = self.unit_size();

        let chunks = self
            .free_list
            .iter()
            .map(|(at, chunk)| ChunkLine {
                addr: at.byte_addr(unit),
                size: chunk.size * unit,
                next: chunk.next.unwrap_or(DUMMY).byte_addr(unit),
                is_dummy: at == DUMMY,
            })
            .collect();

        FreeListDump { chunks }
    }

    /// Prints the free list to stdout and validates it.
    pub fn print(&self) {
        print!("{}", self.dump());
        self.validate();
    }

    /// Walks the free list from the dummy and reports the first structural
    /// problem found.
    ///
    /// Always checked: the dummy is the only chunk of size zero, every link
    /// leads to a free chunk, the walk returns to the dummy and passes the
    /// rover. With coalescing on, the list must also be in address order with
    /// a single wrap, and no chunk may touch or overlap its successor. The link
    /// back to the dummy at unit zero is always that wrap.
    pub fn check(&self) -> Result<(), Corruption> {
        let list = &self.free_list;

        match list.lookup(DUMMY) {
            Some(dummy) if dummy.size == 0 && dummy.is_free() => {}
            _ => return Err(Corruption::MissingDummy),
        }

        let rover = list.rover();
        let mut found_rover = false;
        let mut wrap: Option<(UnitAddr, UnitAddr)> = None;

        let mut at = DUMMY;
        for _ in 0..list.descriptors() {
            if at == rover {
                found_rover = true;
            }

            let Some(chunk) = list.lookup(at) else {
                unreachable!("links are resolved before they are followed");
            };

            if at != DUMMY && chunk.size == 0 {
                return Err(Corruption::ZeroSizedChunk { at });
            }

            let Some(next) = chunk.next else {
                unreachable!("only free chunks are visited");
            };

            if !list.lookup(next).is_some_and(|c| c.is_free()) {
                return Err(Corruption::BrokenLink { at, next });
            }

            if self.config().coalescing {
                if at >= next {
                    if let Some((first, first_next)) = wrap {
                        return Err(Corruption::OutOfOrder {
                            first,
                            first_next,
                            second: at,
                            second_next: next,
                        });
                    }
                    wrap = Some((at, next));
                } else if at + chunk.size >= next {
                    return Err(Corruption::Overlap {
                        at,
                        end: at + chunk.size,
                        next,
                    });
                }
            }

            if next == DUMMY {
                if !found_rover {
                    return Err(Corruption::MissingRover { at: rover });
                }
                return Ok(());
            }

            at = next;
        }

        Err(Corruption::Unterminated)
    }

    /// Panics if [`Heap::check`] finds the free list corrupted.
    pub fn validate(&self) {
        if let Err(corruption) = self.check() {
            panic!("free list corrupted: {corruption}");
        }
    }
}
