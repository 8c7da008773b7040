use std::ptr::NonNull;

use log::{debug, warn};

use crate::{
    block::{BlockHeader, block_capacity_for, block_init, size_from_capacity},
    error::HeapError,
    kernel::{Placement, PlatformMemory},
    utils::{align, size_max},
};


/// Smallest mapping ever requested, so that tiny allocations don't end up
/// with one syscall each.
pub const REGION_MIN_SIZE: usize = 2 * 4096 * 2;

/// A single memory mapping obtained from the platform.
///
/// Regions are never returned to the platform. Once created, the only thing
/// that represents them are the blocks carved out of them: at creation time
/// the whole span is formatted as one free [`BlockHeader`].
///
/// ```text
/// addr                                                 addr + size
/// +--------+---------------------------------------------------+
/// | Header |          capacity_from_size(size) bytes           |
/// +--------+---------------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    /// Start of the mapping, which is also its only block.
    pub addr: NonNull<u8>,
    /// Size of the mapping in bytes.
    pub size: usize,
    /// Whether the platform placed it at the requested address.
    pub placed: bool,
}

impl Region {
    /// The block spanning the whole region.
    #[inline]
    pub(crate) fn block(&self) -> NonNull<BlockHeader> {
        self.addr.cast()
    }
}

/// Size of the mapping needed to hold `query` bytes: whole pages, and never
/// below [`REGION_MIN_SIZE`]. `page_size` must be a power of two.
#[inline]
pub(crate) const fn region_actual_size(query: usize, page_size: usize) -> usize {
    size_max(align(query, page_size), REGION_MIN_SIZE)
}

/// This function returns a new memory [`Region`] able to hold a block of at
/// least `query` usable bytes.
///
/// The mapping is first requested exactly at `addr`. If the platform can't
/// place it there we accept whatever address it gives us. If that fails too,
/// nothing is formatted and [`HeapError::OutOfMemory`] is returned.
pub(crate) fn alloc_region<P: PlatformMemory>(
    platform: &P,
    page_size: usize,
    addr: usize,
    query: usize,
) -> Result<Region, HeapError> {
    // What we really need to map is the block capacity plus the overhead
    // introduced by its header.
    let needed = size_from_capacity(block_capacity_for(query));
    let size = region_actual_size(needed, page_size);

    let (mapped, placed) = match platform.map_pages(addr, size, Placement::Fixed) {
        Some(mapped) => (mapped, true),
        None => {
            warn!("could not map {size} bytes at {addr:#x}, letting the platform choose");

            let mapped = platform
                .map_pages(addr, size, Placement::Anywhere)
                .ok_or(HeapError::OutOfMemory { requested: size })?;

            (mapped, mapped.as_ptr() as usize == addr)
        }
    };

    debug!("mapped region {:p} of {size} bytes for a {query} bytes request", mapped.as_ptr());

    // The whole mapping becomes a single free block.
    unsafe { block_init(mapped, size, None) };

    Ok(Region { addr: mapped, size, placed })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{BLOCK_HEADER_SIZE, BLOCK_MIN_CAPACITY, capacity_from_size},
        kernel::{SystemMemory, testing::TestMemory},
    };

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn small_regions_get_the_minimum_size() {
        assert_eq!(REGION_MIN_SIZE, region_actual_size(0, PAGE_SIZE));
        assert_eq!(REGION_MIN_SIZE, region_actual_size(1, PAGE_SIZE));
        assert_eq!(REGION_MIN_SIZE, region_actual_size(REGION_MIN_SIZE, PAGE_SIZE));
    }

    #[test]
    fn big_regions_are_rounded_to_pages() {
        assert_eq!(REGION_MIN_SIZE + PAGE_SIZE, region_actual_size(REGION_MIN_SIZE + 1, PAGE_SIZE));
        assert_eq!(10 * PAGE_SIZE, region_actual_size(10 * PAGE_SIZE, PAGE_SIZE));
        assert_eq!(11 * PAGE_SIZE, region_actual_size(10 * PAGE_SIZE + 1, PAGE_SIZE));
    }

    #[test]
    fn new_region_is_one_free_block() {
        let page_size = SystemMemory.page_size();
        let region = alloc_region(&SystemMemory, page_size, 0, 8).unwrap();

        let expected = region_actual_size(BLOCK_HEADER_SIZE + BLOCK_MIN_CAPACITY, page_size);
        assert_eq!(expected, region.size);

        unsafe {
            let block = region.block().as_ref();
            assert!(block.is_free);
            assert!(block.next.is_none());
            assert_eq!(capacity_from_size(region.size), block.capacity);
        }
    }

    #[test]
    fn oversized_query_is_not_truncated() {
        let page_size = SystemMemory.page_size();
        let query = 3 * REGION_MIN_SIZE + 5;
        let region = alloc_region(&SystemMemory, page_size, 0, query).unwrap();

        assert!(region.size >= size_from_capacity(query));
        assert_eq!(0, region.size % page_size);
        assert!(unsafe { region.block().as_ref().capacity } >= query);
    }

    #[test]
    fn refused_placement_falls_back_to_any_address() {
        let platform = TestMemory::scattered();
        let page_size = platform.page_size();

        let region = alloc_region(&platform, page_size, 0, 8).unwrap();

        assert_eq!(2, platform.calls.get());
        assert_eq!(1, platform.mapped.get());
        assert!(!region.placed);
        assert!(unsafe { region.block().as_ref().is_free });
    }

    #[test]
    fn refused_mappings_leave_no_region() {
        let platform = TestMemory::limited(0);
        let page_size = platform.page_size();

        let result = alloc_region(&platform, page_size, 0, 8);

        assert_eq!(2, platform.calls.get());
        let requested = region_actual_size(BLOCK_HEADER_SIZE + BLOCK_MIN_CAPACITY, page_size);
        assert_eq!(Err(HeapError::OutOfMemory { requested }), result);
    }
}
