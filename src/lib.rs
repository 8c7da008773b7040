//! A first-fit memory allocator built on top of platform memory mappings.
//!
//! Memory is obtained from the operating system in [regions](REGION_MIN_SIZE)
//! and handed out as blocks. Every block carries a small header right before
//! the pointer given to the user:
//!
//! ```text
//! +--------+-------------------+--------+------------------------------+
//! | Header |   user contents   | Header |         free contents        |
//! +--------+-------------------+--------+------------------------------+
//!          ^
//!          +-- pointer returned by `acquire`
//! ```
//!
//! Allocation walks the chain of blocks looking for the first free one big
//! enough, merging free neighbours on the way and splitting the block it
//! picks. When nothing fits, a new region is requested right after the last
//! block so that it can be merged into it.
//!
//! ```rust,no_run
//! use memheap::Heap;
//!
//! let mut heap = Heap::new()?;
//!
//! let ptr = heap.acquire(64)?;
//! unsafe { ptr.as_ptr().write_bytes(0, 64) };
//! heap.release(ptr.as_ptr())?;
//! # Ok::<(), memheap::HeapError>(())
//! ```
//!
//! [`MemAlloc`] wraps a lazily initialised [`Heap`] behind a lock so it can
//! be used as the `#[global_allocator]`.

mod block;
mod error;
mod heap;
mod kernel;
mod list;
mod region;
mod utils;

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::{Mutex, PoisonError},
};

pub use block::{
    BLOCK_ALIGN, BLOCK_HEADER_SIZE, BLOCK_MIN_CAPACITY, capacity_from_size, size_from_capacity,
};
pub use error::HeapError;
pub use heap::{HEAP_START, Heap, HeapConfig};
pub use kernel::{Placement, PlatformMemory, SystemMemory};
pub use list::{BlockInfo, Iter as Blocks};
pub use region::REGION_MIN_SIZE;

/// Thread safe front end over a single [`Heap`], usable as the global
/// allocator.
///
/// Errors are flattened to null pointers, as [`GlobalAlloc`] expects. Layouts
/// asking for more than [`BLOCK_ALIGN`] are refused.
///
/// Logging goes through the `log` facade; a logger that allocates would
/// recurse into this allocator, so don't install one when `MemAlloc` is the
/// global allocator.
pub struct MemAlloc {
    heap: Mutex<Option<Heap>>,
}

impl MemAlloc {
    pub const fn new() -> Self {
        Self { heap: Mutex::new(None) }
    }

    /// Runs `f` on the heap, mapping it on first use. `None` if the heap
    /// couldn't be initialised.
    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> Option<R> {
        let mut guard = self.heap.lock().unwrap_or_else(PoisonError::into_inner);

        if guard.is_none() {
            *guard = Heap::new().ok();
        }

        guard.as_mut().map(f)
    }

    /// Pointer to at least `n` bytes, or null if no memory could be obtained.
    pub fn acquire(&self, n: usize) -> *mut u8 {
        self.with_heap(|heap| heap.acquire(n).ok())
            .flatten()
            .map_or(ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    /// Gives back a pointer returned by [`MemAlloc::acquire`]. Null and
    /// unknown pointers are ignored.
    pub fn release(&self, ptr: *mut u8) {
        self.with_heap(|heap| {
            let _ = heap.release(ptr);
        });
    }
}

impl Default for MemAlloc {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for MemAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return ptr::null_mut();
        }

        self.acquire(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release(ptr);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_alloc() {
        let allocator = MemAlloc::new();

        unsafe {
            let layout = Layout::new::<u32>();
            // Allocated space for unsigned 32 bit integer.
            let block = allocator.alloc(layout).cast::<u32>();
            *block = 23;
            assert_eq!(23, *block);
            allocator.dealloc(block.cast(), layout);
        }
    }

    #[test]
    fn space_for_free_block_is_used() {
        let allocator = MemAlloc::new();

        unsafe {
            let first_block = allocator.alloc(Layout::new::<u32>());
            let _ = allocator.alloc(Layout::new::<u64>());
            let _ = allocator.alloc(Layout::new::<u64>());

            allocator.dealloc(first_block, Layout::new::<u32>());

            let second_block = allocator.alloc(Layout::new::<u32>());

            assert_eq!(first_block, second_block);
        }
    }

    #[test]
    fn over_aligned_layouts_are_refused() {
        let allocator = MemAlloc::new();
        let layout = Layout::from_size_align(64, 4 * BLOCK_ALIGN).unwrap();

        assert!(unsafe { allocator.alloc(layout) }.is_null());
    }

    #[test]
    fn misuse_is_ignored() {
        let allocator = MemAlloc::new();
        let ptr = allocator.acquire(16);

        allocator.release(ptr::null_mut());
        allocator.release(ptr);
        allocator.release(ptr);

        assert_eq!(ptr, allocator.acquire(16));
    }

    #[test]
    fn shared_between_threads() {
        let allocator = std::sync::Arc::new(MemAlloc::new());

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let ptr = allocator.acquire(128);
                        assert!(!ptr.is_null());
                        unsafe {
                            ptr.write_bytes(i, 128);
                            assert!(std::slice::from_raw_parts(ptr, 128).iter().all(|&b| b == i));
                        }
                        allocator.release(ptr);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
