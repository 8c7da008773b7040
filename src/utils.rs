//! Helper functions for the allocator. These don't particularly belong
//! to any concrete module of the program.


/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two. This is used to round region sizes to
/// a whole number of pages (see [`crate::kernel::PlatformMemory::page_size`])
/// and block capacities to the computer's word size, so that every header we
/// carve out of a split lands on an aligned address.
#[inline]
pub(crate) const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Larger of two sizes, usable in `const` context.
#[inline]
pub(crate) const fn size_max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}
