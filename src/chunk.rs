use std::{fmt, mem, ops::Add};

/// Bytes per heap unit unless configured otherwise. This is the footprint of
/// a classic in-band chunk header (a link and a size), and every chunk still
/// reserves one unit for it in front of its payload.
pub const HEADER_UNIT_SIZE: usize = mem::size_of::<[usize; 2]>();

/// Address of a chunk measured in heap units, i.e. the byte address divided by
/// the unit size.
///
/// Two chunks `a` and `b` are physically adjacent when `a + a.size == b`, so
/// every contiguity check in the allocator is plain integer arithmetic.
///
/// ```text
///            a                      a + size
///            |                         |
///            v                         v
///  +--------+------------------------+--------
///  | header |        payload         | next chunk ...
///  +--------+------------------------+--------
///    1 unit       size - 1 units
/// ```
///
/// Unit address zero never belongs to a memory region, so it is used by the
/// free list dummy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitAddr(pub usize);

impl UnitAddr {
    /// Unit address of the byte address `addr`.
    #[inline]
    pub(crate) fn from_byte_addr(addr: usize, unit_size: usize) -> Self {
        Self(addr / unit_size)
    }

    /// Byte address this unit address stands for.
    #[inline]
    pub(crate) fn byte_addr(self, unit_size: usize) -> usize {
        self.0 * unit_size
    }
}

impl Add<usize> for UnitAddr {
    type Output = UnitAddr;

    #[inline]
    fn add(self, units: usize) -> UnitAddr {
        UnitAddr(self.0 + units)
    }
}

impl fmt::Display for UnitAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{:#x}", self.0)
    }
}

/// Chunk descriptor. Descriptors live in a side table keyed by [`UnitAddr`]
/// instead of in front of the payload, so recovering the header of a payload
/// pointer is a table lookup rather than pointer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk {
    /// Size in units, header unit included. Only the dummy has size zero.
    pub size: usize,
    /// Successor in the free list. `None` while the chunk is handed out.
    pub next: Option<UnitAddr>,
}

impl Chunk {
    /// Descriptor of a chunk that is not linked into the free list.
    #[inline]
    pub fn detached(size: usize) -> Self {
        Self { size, next: None }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.next.is_some()
    }
}
