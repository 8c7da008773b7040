use std::ptr::NonNull;

use crate::block::BlockHeader;


/// Errors reported by the [`crate::Heap`].
///
/// [`HeapError::OutOfMemory`] is the only recoverable one: freeing something
/// and trying again may succeed. [`HeapError::Corrupted`] means the block
/// chain itself can't be trusted anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory: the platform refused to map {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("heap corrupted at block {addr:#x}")]
    Corrupted { addr: usize },
    #[error("pointer {addr:#x} was not returned by this heap")]
    InvalidPointer { addr: usize },
    #[error("block at {addr:#x} released twice")]
    DoubleFree { addr: usize },
}

impl HeapError {
    /// Whether freeing memory and retrying could make the request succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HeapError::OutOfMemory { .. })
    }
}

/// Outcome of a linear scan over the block chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchResult {
    /// First free block big enough for the query.
    Found(NonNull<BlockHeader>),
    /// No fit; this is the last block of the chain, grow from here.
    ReachedEnd(NonNull<BlockHeader>),
    /// The chain failed a structural check.
    Corrupted(HeapError),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_out_of_memory_is_retryable() {
        assert!(HeapError::OutOfMemory { requested: 8 }.is_retryable());
        assert!(!HeapError::Corrupted { addr: 0x10 }.is_retryable());
        assert!(!HeapError::DoubleFree { addr: 0x10 }.is_retryable());
        assert!(!HeapError::InvalidPointer { addr: 0x10 }.is_retryable());
    }

    #[test]
    fn messages_carry_addresses() {
        let err = HeapError::Corrupted { addr: 0x4040000 };
        assert_eq!("heap corrupted at block 0x4040000", err.to_string());
    }
}
