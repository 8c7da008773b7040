use std::{mem, ptr::NonNull};

use log::trace;

use crate::{list::Link, utils::{align, size_max}};


/// Smallest usable capacity ever given to a block. A free remainder smaller
/// than this is never split off.
pub const BLOCK_MIN_CAPACITY: usize = 24;

/// Header size of a block. Contents start right after it.
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Alignment of every header, and therefore of every pointer handed to the user.
pub const BLOCK_ALIGN: usize = mem::align_of::<BlockHeader>();

/// Capacities are multiples of the machine word so that headers created by a
/// split stay aligned.
const WORD_SIZE: usize = mem::size_of::<usize>();

/// This is the structure of a block. The fields are its metadata, content is
/// placed right after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        next         |        |
/// +---------------------+        |
/// |      capacity       |        | -> Header
/// +---------------------+        |
/// |    is_free (1b)     |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> `capacity` addressable bytes
/// |         ...         |        |
/// +---------------------+ <------+ <- block_after
/// ```
///
/// `next` follows the chain in list order. Two consecutive blocks are only
/// physically adjacent when they come from the same region (or from a region
/// the platform placed right after the previous one), see [`blocks_continuous`].
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    /// Next block in the chain, `None` for the last one.
    pub next: Link<BlockHeader>,
    /// Usable bytes, header excluded.
    pub capacity: usize,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
}

/// Total bytes taken by a block of usable capacity `capacity`.
#[inline]
pub const fn size_from_capacity(capacity: usize) -> usize {
    capacity + BLOCK_HEADER_SIZE
}

/// Usable bytes of a block spanning `size` bytes. `size` must cover at
/// least one header.
#[inline]
pub const fn capacity_from_size(size: usize) -> usize {
    size - BLOCK_HEADER_SIZE
}

/// Capacity actually given to a block asked for `query` bytes: word
/// granular and never below [`BLOCK_MIN_CAPACITY`].
#[inline]
pub(crate) const fn block_capacity_for(query: usize) -> usize {
    size_max(align(query, WORD_SIZE), BLOCK_MIN_CAPACITY)
}

/// Formats `size` bytes starting at `addr` as a single free block.
///
/// **SAFETY**: `addr` must be valid for writes of `size` bytes, aligned to
/// [`BLOCK_ALIGN`], and `size` must be at least a header plus
/// [`BLOCK_MIN_CAPACITY`].
pub(crate) unsafe fn block_init(
    addr: NonNull<u8>,
    size: usize,
    next: Link<BlockHeader>,
) -> NonNull<BlockHeader> {
    let block = addr.cast::<BlockHeader>();

    unsafe {
        block.as_ptr().write(BlockHeader {
            next,
            capacity: capacity_from_size(size),
            is_free: true,
        });
    }

    block
}

/// Address of the first content byte of `block`.
#[inline]
pub(crate) fn block_contents(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // Adding the header size to a non null header address can't yield null.
    unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

/// Address right after the contents of `block`. Only compared against, never
/// dereferenced, so it's computed with wrapping arithmetic.
///
/// **SAFETY**: `block` must point to an initialised header.
#[inline]
pub(crate) unsafe fn block_after(block: NonNull<BlockHeader>) -> *mut u8 {
    unsafe {
        let capacity = block.as_ref().capacity;
        block.as_ptr().cast::<u8>().wrapping_add(BLOCK_HEADER_SIZE).wrapping_add(capacity)
    }
}

/// Inverse of [`block_contents`]: the header a content pointer belongs to.
/// The result is only a candidate, it isn't dereferenced here.
#[inline]
pub(crate) fn block_get_header(contents: NonNull<u8>) -> *mut BlockHeader {
    contents.as_ptr().wrapping_sub(BLOCK_HEADER_SIZE).cast()
}

/// Cheap structural check run on every block the engine walks over. A well
/// formed block ends within the address space, so `size_from_capacity` and
/// address arithmetic on it can't overflow.
///
/// **SAFETY**: `block` must be readable as a header.
pub(crate) unsafe fn block_well_formed(block: NonNull<BlockHeader>) -> bool {
    let addr = block.as_ptr() as usize;

    if addr % BLOCK_ALIGN != 0 {
        return false;
    }

    let capacity = unsafe { block.as_ref().capacity };
    let ends = capacity
        .checked_add(BLOCK_HEADER_SIZE)
        .and_then(|size| addr.checked_add(size))
        .is_some();

    ends && capacity >= BLOCK_MIN_CAPACITY && capacity % WORD_SIZE == 0
}

/// A free block can be split if, after giving away the capacity needed for
/// `query`, the remainder still fits a header and [`BLOCK_MIN_CAPACITY`] bytes.
pub(crate) fn block_splittable(block: &BlockHeader, query: usize) -> bool {
    let query = block_capacity_for(query);

    block.is_free && query + BLOCK_HEADER_SIZE + BLOCK_MIN_CAPACITY <= block.capacity
}

/// Shrinks `block` to the capacity needed for `query` and formats the tail
/// as a new free block linked right after it. Returns whether it split.
///
/// ```text
///  Before:
/// +--------+--------------------------------------------+
/// | Header |                 capacity                   |
/// +--------+--------------------------------------------+
///
///  After:
/// +--------+---------+--------+-------------------------+
/// | Header |  query  | Header |  capacity - query - hdr |
/// +--------+---------+--------+-------------------------+
/// ```
///
/// **SAFETY**: `block` must point to an initialised header whose contents are
/// writable.
pub(crate) unsafe fn split_if_too_big(mut block: NonNull<BlockHeader>, query: usize) -> bool {
    unsafe {
        if !block_splittable(block.as_ref(), query) {
            return false;
        }

        let query = block_capacity_for(query);
        let remainder = block.as_ref().capacity - query;

        block.as_mut().capacity = query;

        // block_after now points to the freed tail, which lies within the old contents.
        let tail_addr = NonNull::new_unchecked(block_after(block));
        let tail = block_init(tail_addr, remainder, block.as_ref().next);
        block.as_mut().next = Some(tail);

        trace!(
            "split block {:p}: kept {} bytes, new free block {:p} with {} bytes",
            block.as_ptr(), query, tail.as_ptr(), tail.as_ref().capacity,
        );
    }

    true
}

/// `snd` starts exactly where the contents of `fst` end.
///
/// **SAFETY**: `fst` must point to an initialised header.
#[inline]
pub(crate) unsafe fn blocks_continuous(
    fst: NonNull<BlockHeader>,
    snd: NonNull<BlockHeader>,
) -> bool {
    unsafe { snd.as_ptr().cast::<u8>() == block_after(fst) }
}

/// Both blocks are free and physically adjacent.
///
/// **SAFETY**: both must point to initialised headers.
pub(crate) unsafe fn mergeable(fst: NonNull<BlockHeader>, snd: NonNull<BlockHeader>) -> bool {
    unsafe { fst.as_ref().is_free && snd.as_ref().is_free && blocks_continuous(fst, snd) }
}

/// Absorbs the next block into `block` if both are free and adjacent.
/// Returns whether a merge happened; calling it again once it returns
/// `false` is a no-op.
///
/// **SAFETY**: `block` and its successor (if any) must point to initialised headers.
pub(crate) unsafe fn try_merge_with_next(mut block: NonNull<BlockHeader>) -> bool {
    unsafe {
        let Some(next) = block.as_ref().next else {
            return false;
        };

        if !mergeable(block, next) {
            return false;
        }

        let next = next.as_ref();
        block.as_mut().capacity += size_from_capacity(next.capacity);
        block.as_mut().next = next.next;

        trace!("merged block {:p}, capacity is now {}", block.as_ptr(), block.as_ref().capacity);
    }

    true
}
