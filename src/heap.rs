use std::{fmt, ptr::NonNull};

use log::{debug, error};

use crate::{
    block::{
        BlockHeader, block_after, block_capacity_for, block_contents, block_get_header,
        block_well_formed, size_from_capacity, split_if_too_big, try_merge_with_next,
    },
    error::{HeapError, SearchResult},
    kernel::{PlatformMemory, SystemMemory},
    list::Iter,
    region::{REGION_MIN_SIZE, alloc_region},
};


/// Preferred address of the very first region.
pub const HEAP_START: usize = 0x0404_0000;

/// Requests above this can't be represented once headers and page rounding
/// are added, so they are refused before reaching the platform.
const MAX_QUERY: usize = isize::MAX as usize / 2;

/// Where and how big the first region of a [`Heap`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Address the first region is requested at. The platform may refuse it,
    /// in which case any address is accepted.
    pub preferred_base: usize,
    /// Usable bytes the first region should at least hold.
    pub initial_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            preferred_base: HEAP_START,
            initial_size: REGION_MIN_SIZE,
        }
    }
}

/// First-fit allocator over a chain of blocks carved out of platform
/// mappings.
///
/// ```text
///   head
/// +-------+    +-------+    +-------+           +-------+    +-------+
/// | Block | -> | Free  | -> | Block |  - - - -> | Free  | -> | Block |
/// +-------+    +-------+    +-------+           +-------+    +-------+
/// |<-------- first region -------->|            |<--- grown region -->|
/// ```
///
/// Blocks are kept in a single chain. Consecutive blocks of the same region
/// are physically adjacent, and so are regions the platform managed to place
/// right after the previous one. Only adjacent free blocks are coalesced.
///
/// There is no internal locking: a `Heap` is `Send` but not `Sync`. Wrap it
/// in a single lock to share it, see [`crate::MemAlloc`].
pub struct Heap<P: PlatformMemory = SystemMemory> {
    /// First block of the first region. Never changes.
    head: NonNull<BlockHeader>,
    /// Number of blocks in the chain.
    len: usize,
    /// Computer's page size, used to round region sizes.
    page_size: usize,
    /// Successful calls to the region provider, initial region included.
    regions_mapped: usize,
    platform: P,
}

// The heap exclusively owns every block reachable from `head`.
unsafe impl<P: PlatformMemory + Send> Send for Heap<P> {}

impl Heap<SystemMemory> {
    /// Heap backed by the operating system, with the default configuration.
    pub fn new() -> Result<Self, HeapError> {
        Self::init(HeapConfig::default(), SystemMemory)
    }
}

impl<P: PlatformMemory> Heap<P> {
    /// Maps the first region, preferably at `config.preferred_base`, and
    /// makes its only block the head of the heap.
    pub fn init(config: HeapConfig, platform: P) -> Result<Self, HeapError> {
        let page_size = platform.page_size();
        let region = alloc_region(
            &platform,
            page_size,
            config.preferred_base,
            config.initial_size,
        )?;

        debug!(
            "heap initialised at {:p} ({} bytes, preferred base honored: {})",
            region.addr.as_ptr(), region.size, region.placed,
        );

        Ok(Self {
            head: region.block(),
            len: 1,
            page_size,
            regions_mapped: 1,
            platform,
        })
    }

    /// Address of the first region.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.head.cast()
    }

    /// Number of regions obtained from the platform so far.
    #[inline]
    pub fn regions_mapped(&self) -> usize {
        self.regions_mapped
    }

    /// Number of blocks in the chain.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.len
    }

    /// Platform the regions are mapped from.
    #[inline]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns a pointer to at least `n` usable bytes.
    ///
    /// The pointer is aligned to [`crate::BLOCK_ALIGN`] and stays valid until
    /// it is given back with [`Heap::release`].
    pub fn acquire(&mut self, n: usize) -> Result<NonNull<u8>, HeapError> {
        if n > MAX_QUERY {
            return Err(HeapError::OutOfMemory { requested: n });
        }

        let block = self.memalloc(n)?;

        Ok(block_contents(block))
    }

    /// Gives back a pointer returned by [`Heap::acquire`] and coalesces its
    /// block with every free block physically following it.
    ///
    /// A null `ptr` is a no-op. Pointers this heap never handed out and
    /// blocks already released are reported instead of corrupting the chain.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(contents) = NonNull::new(ptr) else {
            return Ok(());
        };

        let mut block = self.lookup(contents)?;

        if !unsafe { block_well_formed(block) } {
            return Err(corrupted(block));
        }

        unsafe {
            if block.as_ref().is_free {
                return Err(HeapError::DoubleFree { addr: block.as_ptr() as usize });
            }

            block.as_mut().is_free = true;
        }

        self.merge_forward(block)
    }

    /// Usable bytes behind a pointer returned by [`Heap::acquire`]. Never
    /// less than what was asked for.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let block = self.lookup(ptr)?;

        unsafe {
            match block.as_ref() {
                header if header.is_free => {
                    Err(HeapError::InvalidPointer { addr: ptr.as_ptr() as usize })
                }
                header => Ok(header.capacity),
            }
        }
    }

    /// Walks the chain from the head, in list order.
    pub fn blocks(&self) -> Iter<'_> {
        unsafe { Iter::new(self.head, self.len) }
    }

    /// Verifies the structure of the whole chain: every block well formed,
    /// as many blocks as accounted for, a terminated chain and no two blocks
    /// sharing a byte.
    pub fn check(&self) -> Result<(), HeapError> {
        let mut spans = Vec::with_capacity(self.len);
        let mut current = Some(self.head);

        while let Some(block) = current {
            let addr = block.as_ptr() as usize;

            if spans.len() == self.len || !unsafe { block_well_formed(block) } {
                return Err(HeapError::Corrupted { addr });
            }

            let header = unsafe { block.as_ref() };
            spans.push((addr, addr + size_from_capacity(header.capacity)));
            current = header.next;
        }

        if spans.len() != self.len {
            return Err(HeapError::Corrupted { addr: self.head.as_ptr() as usize });
        }

        spans.sort_unstable();

        match spans.windows(2).find(|pair| pair[0].1 > pair[1].0) {
            Some(pair) => Err(HeapError::Corrupted { addr: pair[1].0 }),
            None => Ok(()),
        }
    }

    /// Finds the block whose contents start at `contents`.
    fn lookup(&self, contents: NonNull<u8>) -> Result<NonNull<BlockHeader>, HeapError> {
        let wanted = block_get_header(contents);
        let mut current = Some(self.head);

        for _ in 0..self.len {
            let Some(block) = current else { break };

            if block.as_ptr() == wanted {
                return Ok(block);
            }

            current = unsafe { block.as_ref().next };
        }

        Err(HeapError::InvalidPointer { addr: contents.as_ptr() as usize })
    }

    /// Coalesces `block` with its successors until it no longer can.
    fn merge_forward(&mut self, block: NonNull<BlockHeader>) -> Result<(), HeapError> {
        loop {
            if let Some(next) = unsafe { block.as_ref().next } {
                if !unsafe { block_well_formed(next) } {
                    return Err(corrupted(next));
                }
            }

            if !unsafe { try_merge_with_next(block) } {
                return Ok(());
            }

            self.len -= 1;
        }
    }

    /// Linear first-fit scan starting at `block`, coalescing every block with
    /// its successors on the way.
    fn find_good_or_last(
        &mut self,
        mut block: NonNull<BlockHeader>,
        min_capacity: usize,
    ) -> SearchResult {
        // More steps than blocks means the chain loops.
        for _ in 0..self.len {
            if !unsafe { block_well_formed(block) } {
                return SearchResult::Corrupted(corrupted(block));
            }

            if let Err(err) = self.merge_forward(block) {
                return SearchResult::Corrupted(err);
            }

            let header = unsafe { block.as_ref() };

            if header.is_free && header.capacity >= min_capacity {
                return SearchResult::Found(block);
            }

            match header.next {
                Some(next) => block = next,
                None => return SearchResult::ReachedEnd(block),
            }
        }

        SearchResult::Corrupted(corrupted(block))
    }

    /// Tries to serve `query` from the blocks we already have, without growing.
    fn try_memalloc_existing(&mut self, query: usize, start: NonNull<BlockHeader>) -> SearchResult {
        let query = block_capacity_for(query);

        let result = self.find_good_or_last(start, query);

        if let SearchResult::Found(mut block) = result {
            if unsafe { split_if_too_big(block, query) } {
                self.len += 1;
            }

            unsafe { block.as_mut().is_free = false };
        }

        result
    }

    /// Maps a new region for `query` right after `last`, and returns the block
    /// the search should resume from.
    ///
    /// If the region lands right after a free `last`, both become one block
    /// and `last` is returned. Otherwise the region's block is appended.
    fn grow_heap(
        &mut self,
        mut last: NonNull<BlockHeader>,
        query: usize,
    ) -> Result<NonNull<BlockHeader>, HeapError> {
        let addr = unsafe { block_after(last) } as usize;

        let region = alloc_region(&self.platform, self.page_size, addr, query)?;

        self.regions_mapped += 1;
        self.len += 1;

        unsafe { last.as_mut().next = Some(region.block()) };

        if unsafe { try_merge_with_next(last) } {
            self.len -= 1;
            debug!("heap grown in place, block {:p} extended", last.as_ptr());

            return Ok(last);
        }

        debug!("heap grown with a disjoint block at {:p}", region.addr.as_ptr());

        Ok(region.block())
    }

    /// Search, and grow the heap once every time the search reaches the end
    /// of the chain without a fit.
    fn memalloc(&mut self, query: usize) -> Result<NonNull<BlockHeader>, HeapError> {
        let query = block_capacity_for(query);
        let mut start = self.head;

        loop {
            match self.try_memalloc_existing(query, start) {
                SearchResult::Found(block) => return Ok(block),
                SearchResult::ReachedEnd(last) => start = self.grow_heap(last, query)?,
                SearchResult::Corrupted(err) => return Err(err),
            }
        }
    }
}

fn corrupted(block: NonNull<BlockHeader>) -> HeapError {
    error!("heap corrupted at block {:p}", block.as_ptr());

    HeapError::Corrupted { addr: block.as_ptr() as usize }
}

impl<P: PlatformMemory> fmt::Debug for Heap<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base())
            .field("regions_mapped", &self.regions_mapped)
            .field("blocks", &self.blocks().collect::<Vec<_>>())
            .finish()
    }
}
