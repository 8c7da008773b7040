use std::{marker::PhantomData, ptr::NonNull};

use crate::block::{BlockHeader, block_contents};


/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Read-only snapshot of one block, as seen while walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub addr: usize,
    /// Address handed to the user for this block.
    pub contents: usize,
    /// Usable bytes, header excluded.
    pub capacity: usize,
    pub is_free: bool,
    /// Address of the next block header, if any.
    pub next: Option<usize>,
}

impl BlockInfo {
    pub(crate) fn of(block: &BlockHeader, addr: NonNull<BlockHeader>) -> Self {
        Self {
            addr: addr.as_ptr() as usize,
            contents: block_contents(addr).as_ptr() as usize,
            capacity: block.capacity,
            is_free: block.is_free,
            next: block.next.map(|next| next.as_ptr() as usize),
        }
    }
}

/// Iterator over the block chain, in list order.
///
/// It borrows the heap it was created from, so the chain can't change
/// while it's being walked. It never yields more than the number of blocks
/// the heap accounts for, even if the chain loops.
pub struct Iter<'a> {
    current: Link<BlockHeader>,
    remaining: usize,
    marker: PhantomData<&'a BlockHeader>,
}

impl<'a> Iter<'a> {
    /// **SAFETY**: the first `len` blocks reachable from `head` must stay
    /// valid for `'a`.
    pub(crate) unsafe fn new(head: NonNull<BlockHeader>, len: usize) -> Self {
        Self {
            current: Some(head),
            remaining: len,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.current?;

        unsafe {
            let block = node.as_ref();
            self.current = block.next;
            self.remaining -= 1;

            Some(BlockInfo::of(block, node))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BLOCK_HEADER_SIZE, block_init, split_if_too_big};

    #[test]
    fn walks_every_block_in_order() {
        let mut words = vec![0usize; 64];
        let size = words.len() * std::mem::size_of::<usize>();
        let base = NonNull::new(words.as_mut_ptr()).unwrap().cast::<u8>();

        unsafe {
            let head = block_init(base, size, None);
            split_if_too_big(head, 32);

            let blocks: Vec<BlockInfo> = Iter::new(head, 2).collect();

            assert_eq!(2, blocks.len());
            assert_eq!(base.as_ptr() as usize, blocks[0].addr);
            assert_eq!(blocks[0].addr + BLOCK_HEADER_SIZE, blocks[0].contents);
            assert_eq!(32, blocks[0].capacity);
            assert_eq!(Some(blocks[1].addr), blocks[0].next);
            assert_eq!(blocks[0].contents + 32, blocks[1].addr);
            assert!(blocks[1].is_free);
            assert!(blocks[1].next.is_none());
        }
    }

    #[test]
    fn stops_after_the_accounted_blocks() {
        let mut words = vec![0usize; 64];
        let size = words.len() * std::mem::size_of::<usize>();
        let base = NonNull::new(words.as_mut_ptr()).unwrap().cast::<u8>();

        unsafe {
            let mut head = block_init(base, size, None);
            // A chain pointing back to itself.
            head.as_mut().next = Some(head);

            assert_eq!(3, Iter::new(head, 3).count());
        }
    }
}
