use std::{collections::BTreeMap, ptr::NonNull};

use crate::chunk::UnitAddr;

/// A page-aligned extent granted by the memory source.
///
/// [`crate::kernel::MemorySource`] gives us memory regions aligned with the
/// page size, but we cannot assume those regions are adjacent. Chunks never
/// record which region they belong to: contiguity is inferred purely from unit
/// addresses, and a region is only consulted to turn a unit address back into
/// a pointer that carries the provenance of the original grant.
///
/// ```text
/// +-----------------------------------------+      +------------------------------+
/// | +-------+    +-------+    +-----------+ |      | +-------+    +-------------+ |
/// | | Chunk | -> | Chunk | -> |   Chunk   | | ...  | | Chunk | -> |    Chunk    | |
/// | +-------+    +-------+    +-----------+ |      | +-------+    +-------------+ |
/// +-----------------------------------------+      +------------------------------+
///   Region                                           Region
/// ```
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    /// Base pointer returned by the memory source.
    pub base: NonNull<u8>,
    /// Length of the region in units.
    pub units: usize,
}

/// Every region the heap has ever been granted, keyed by starting unit.
pub(crate) struct Regions {
    map: BTreeMap<UnitAddr, Region>,
    unit_size: usize,
}

impl Regions {
    pub fn new(unit_size: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            unit_size,
        }
    }

    /// Records a region of `bytes` bytes at `base` and returns its first unit.
    pub fn insert(&mut self, base: NonNull<u8>, bytes: usize) -> UnitAddr {
        let start = UnitAddr::from_byte_addr(base.as_ptr().addr(), self.unit_size);
        let units = bytes / self.unit_size;

        self.map.insert(start, Region { base, units });

        start
    }

    /// Region containing the unit `at`, if any.
    pub fn find(&self, at: UnitAddr) -> Option<(UnitAddr, &Region)> {
        let (&start, region) = self.map.range(..=at).next_back()?;

        (at.0 < start.0 + region.units).then_some((start, region))
    }

    /// Pointer to the payload of the chunk whose header sits at `at`.
    pub fn payload(&self, at: UnitAddr) -> NonNull<u8> {
        let payload = at + 1;

        let Some((start, region)) = self.find(payload) else {
            panic!("chunk {at} lies outside every heap region");
        };

        // In bounds: `payload` was found inside `region`.
        unsafe { region.base.add((payload.0 - start.0) * self.unit_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::ArenaMemory, kernel::MemorySource};

    #[test]
    fn payload_follows_the_header_unit() {
        let mut arena = ArenaMemory::new(4096, 1);
        let base = arena.request_memory(4096).unwrap();

        let mut regions = Regions::new(16);
        let start = regions.insert(base, 4096);

        assert_eq!(regions.payload(start), unsafe { base.add(16) });
        assert_eq!(regions.payload(start + 10), unsafe { base.add(11 * 16) });
    }

    #[test]
    fn lookups_stay_inside_regions() {
        let mut arena = ArenaMemory::new(4096, 1);
        let base = arena.request_memory(4096).unwrap();

        let mut regions = Regions::new(16);
        let start = regions.insert(base, 4096);

        assert!(regions.find(start + 255).is_some());
        assert!(regions.find(start + 256).is_none());
        assert!(regions.find(UnitAddr(start.0 - 1)).is_none());
    }
}
