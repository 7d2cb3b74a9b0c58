//! Helper arithmetic shared by the growth manager and the allocation engine.

/// It aligns `to_be_aligned` up to a multiple of `alignment`, which must be a
/// power of two.
///
/// This is used to round region sizes up to whole pages and request sizes up
/// to whole heap units. Returns `None` when the result does not fit in a
/// `usize`.
#[inline]
pub fn align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    Some(to_be_aligned.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Number of `unit_size` units needed to hold `nbytes`, `None` on overflow.
#[inline]
pub fn units_for(nbytes: usize, unit_size: usize) -> Option<usize> {
    Some(align(nbytes, unit_size)? / unit_size)
}
