use std::collections::HashMap;

use log::trace;

use crate::chunk::{Chunk, UnitAddr};

/// Unit address of the dummy chunk. Nothing else can live at address zero,
/// so the dummy is always the lowest chunk of the list.
pub(crate) const DUMMY: UnitAddr = UnitAddr(0);

/// Circular singly linked list of free chunks.
///
/// The list always contains the dummy, a chunk of size zero that can never be
/// handed out. Free chunks are kept in address order starting right after the
/// dummy, so the only place where addresses go down is the link from the
/// highest chunk back to the dummy:
///
/// ```text
///                  rover
///                    |
///                    v
///  +-------+    +---------+    +---------+    +---------+
///  | dummy | -> | u0x1000 | -> | u0x1040 | -> | u0x2000 | --+
///  +-------+    +---------+    +---------+    +---------+   |
///      ^                                                    |
///      +----------------------------------------------------+
/// ```
///
/// Descriptors of every chunk the heap knows about, free or handed out, are
/// stored in one side table keyed by unit address. A chunk is free exactly
/// when its descriptor has a successor.
pub(crate) struct FreeList {
    pub(crate) chunks: HashMap<UnitAddr, Chunk>,
    /// Where the next search or insertion scan starts. Always a member of the
    /// list.
    pub(crate) rover: UnitAddr,
}

pub(crate) struct Iter<'a> {
    list: &'a FreeList,
    current: Option<UnitAddr>,
    remaining: usize,
}

impl FreeList {
    /// Creates a list holding only the dummy, which is also the rover.
    pub fn new() -> Self {
        let mut chunks = HashMap::new();
        chunks.insert(DUMMY, Chunk { size: 0, next: Some(DUMMY) });

        Self { chunks, rover: DUMMY }
    }

    /// True when the dummy is the only chunk in the list.
    pub fn is_empty(&self) -> bool {
        self.next_of(DUMMY) == DUMMY
    }

    #[inline]
    pub fn rover(&self) -> UnitAddr {
        self.rover
    }

    /// Descriptor at `at`, free or not.
    #[inline]
    pub fn lookup(&self, at: UnitAddr) -> Option<&Chunk> {
        self.chunks.get(&at)
    }

    /// Number of descriptors in the side table, dummy included.
    #[inline]
    pub fn descriptors(&self) -> usize {
        self.chunks.len()
    }

    fn get(&self, at: UnitAddr) -> &Chunk {
        match self.chunks.get(&at) {
            Some(chunk) => chunk,
            None => panic!("no chunk descriptor at {at}"),
        }
    }

    fn get_mut(&mut self, at: UnitAddr) -> &mut Chunk {
        match self.chunks.get_mut(&at) {
            Some(chunk) => chunk,
            None => panic!("no chunk descriptor at {at}"),
        }
    }

    /// Successor of the free chunk `at`.
    pub fn next_of(&self, at: UnitAddr) -> UnitAddr {
        match self.get(at).next {
            Some(next) => next,
            None => panic!("chunk {at} is not in the free list"),
        }
    }

    /// Chunk whose successor is `target`.
    fn predecessor(&self, target: UnitAddr) -> UnitAddr {
        let mut current = target;

        for _ in 0..self.chunks.len() {
            let next = self.next_of(current);
            if next == target {
                return current;
            }
            current = next;
        }

        panic!("free list does not cycle back to {target}");
    }

    /// Records a chunk of `size` units at `at` that is not linked into the
    /// list yet.
    pub fn adopt(&mut self, at: UnitAddr, size: usize) {
        assert!(at != DUMMY && size > 0, "invalid chunk {at} of {size} units");

        let previous = self.chunks.insert(at, Chunk::detached(size));
        assert!(previous.is_none(), "chunk {at} is already known");
    }

    /// Removes the free chunk `at` from the list. The rover moves on to its
    /// successor.
    fn unlink(&mut self, at: UnitAddr) {
        let prev = self.predecessor(at);
        let next = self.next_of(at);

        self.get_mut(prev).next = Some(next);
        self.get_mut(at).next = None;
        self.rover = next;

        trace!("unlinked {at} whole");
    }

    /// Hands out the leading `units` of the free chunk `at`. The trailing
    /// remainder takes the place of `at` in the list and becomes the rover.
    ///
    /// ```text
    ///  before:  | at ...................................... |
    ///  after:   | at: units (handed out) | remainder (free) |
    /// ```
    fn split_leading(&mut self, at: UnitAddr, units: usize) -> UnitAddr {
        let chunk = *self.get(at);
        debug_assert!(chunk.size > units);

        let prev = self.predecessor(at);
        let remainder = at + units;

        self.chunks.insert(
            remainder,
            Chunk {
                size: chunk.size - units,
                next: chunk.next,
            },
        );
        self.get_mut(prev).next = Some(remainder);
        *self.get_mut(at) = Chunk::detached(units);
        self.rover = remainder;

        trace!("split {at}: leading {units} units handed out, {remainder} stays free");

        at
    }

    /// Hands out the trailing `units` of the free chunk `at`, which stays
    /// linked with whatever is left in front. The rover moves to the successor
    /// of `at`.
    ///
    /// ```text
    ///  before:  | at ...................................... |
    ///  after:   | at (free) | block: units (handed out)     |
    /// ```
    fn split_trailing(&mut self, at: UnitAddr, units: usize) -> UnitAddr {
        let chunk = self.get_mut(at);
        debug_assert!(chunk.size > units);

        chunk.size -= units;
        let block = at + chunk.size;

        self.chunks.insert(block, Chunk::detached(units));
        self.rover = self.next_of(at);

        trace!("split {at}: trailing {units} units handed out at {block}");

        block
    }

    /// First chunk of at least `units` units, walking from the rover. Returns
    /// the address of a detached chunk of exactly `units` units.
    pub fn first_fit(&mut self, units: usize) -> Option<UnitAddr> {
        let start = self.rover;
        let mut at = start;

        loop {
            let size = self.get(at).size;

            if size == units {
                self.unlink(at);
                return Some(at);
            }

            if size > units {
                return Some(self.split_leading(at, units));
            }

            at = self.next_of(at);
            if at == start {
                return None;
            }
        }
    }

    /// Chunk leaving the fewest spare units over one full cycle from the
    /// rover. Ties go to the chunk seen first and an exact fit ends the scan.
    pub fn best_fit(&mut self, units: usize) -> Option<UnitAddr> {
        let start = self.rover;
        let mut at = start;
        let mut best: Option<(UnitAddr, usize)> = None;

        loop {
            let size = self.get(at).size;

            if size == units {
                self.unlink(at);
                return Some(at);
            }

            if size > units {
                let leftover = size - units;
                if best.is_none_or(|(_, smallest)| leftover < smallest) {
                    best = Some((at, leftover));
                }
            }

            at = self.next_of(at);
            if at == start {
                break;
            }
        }

        best.map(|(at, _)| self.split_trailing(at, units))
    }

    /// Links the detached chunk `at` back into the list at its address-ordered
    /// position, merging it with adjacent free chunks when `coalescing` is on.
    /// The rover ends up on the successor of the resulting chunk.
    pub fn release(&mut self, at: UnitAddr, coalescing: bool) {
        assert!(!self.get(at).is_free(), "chunk {at} is already free");

        // The insertion point is the pair (prev, next) around `at`. The pair
        // (highest chunk, dummy) catches chunks above every free chunk.
        let mut prev = self.rover;
        let mut steps = self.chunks.len();
        let next = loop {
            let next = self.next_of(prev);
            if prev < at && (at < next || next == DUMMY) {
                break next;
            }

            assert!(steps > 0, "no insertion point for {at}, the free list is corrupted");
            steps -= 1;
            prev = next;
        };

        self.get_mut(prev).next = Some(at);
        self.get_mut(at).next = Some(next);

        trace!("released {at} between {prev} and {next}");

        let mut survivor = at;
        if coalescing {
            self.merge_with_next(at);
            survivor = self.merge_with_prev(prev, at);
        }

        self.rover = self.next_of(survivor);
    }

    /// Absorbs the successor of `at` if it starts right where `at` ends.
    fn merge_with_next(&mut self, at: UnitAddr) {
        let next = self.next_of(at);
        let chunk = *self.get(at);

        if next == DUMMY || at + chunk.size != next {
            return;
        }

        let Some(absorbed) = self.chunks.remove(&next) else {
            panic!("no chunk descriptor at {next}");
        };

        let chunk = self.get_mut(at);
        chunk.size += absorbed.size;
        chunk.next = absorbed.next;

        trace!("merged {next} into {at}, now {} units", chunk.size);
    }

    /// Merges `at` into its predecessor `prev` if `prev` ends right where `at`
    /// starts. Returns whichever chunk now covers `at`.
    fn merge_with_prev(&mut self, prev: UnitAddr, at: UnitAddr) -> UnitAddr {
        if prev == DUMMY || prev + self.get(prev).size != at {
            return at;
        }

        let Some(absorbed) = self.chunks.remove(&at) else {
            panic!("no chunk descriptor at {at}");
        };

        let chunk = self.get_mut(prev);
        chunk.size += absorbed.size;
        chunk.next = absorbed.next;

        trace!("merged {at} into {prev}, now {} units", chunk.size);

        prev
    }

    /// Walks the list once, starting at the dummy.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            current: Some(DUMMY),
            remaining: self.chunks.len(),
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (UnitAddr, &'a Chunk);

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.current?;
        if self.remaining == 0 {
            return None;
        }

        let chunk = self.list.chunks.get(&at)?;
        self.current = chunk.next.filter(|&next| next != DUMMY);
        self.remaining -= 1;

        Some((at, chunk))
    }
}
