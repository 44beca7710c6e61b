//! Native Block Allocator
//!
//! The bridge only needs four things from its allocator: allocate N
//! zero-filled bytes, free a block, report whether a block belongs to it,
//! and release everything at teardown.
//!
//! `HeapAllocator` is the default implementation. It tracks every live
//! block so that `contains` is exact and `free_all` can return memory that
//! native code never released.

use crate::error::{BridgeError, Result};
use std::alloc::Layout;
use std::collections::BTreeMap;

/// Alignment of every block handed to native code
pub const BLOCK_ALIGNMENT: usize = 16;

/// Raw allocator used for native object memory
///
/// Implementations are only ever called with the bridge lock held.
pub trait Allocator: Send {
    /// Allocate `size` zero-filled bytes
    fn alloc(&mut self, size: usize) -> Result<usize>;

    /// Release a block previously returned by `alloc`
    fn free(&mut self, address: usize) -> Result<()>;

    /// Whether `address` is the start of a live block owned by this allocator
    fn contains(&self, address: usize) -> bool;

    /// Release every outstanding block, returning the number of bytes freed
    fn free_all(&mut self) -> usize;

    /// Bytes currently held in live blocks
    fn allocated_bytes(&self) -> usize;
}

/// Allocator backed by the global Rust allocator
pub struct HeapAllocator {
    /// Live blocks: address -> layout
    blocks: BTreeMap<usize, Layout>,

    /// Total bytes allocated
    total_allocated: usize,

    /// Optional upper bound on `total_allocated`
    limit: Option<usize>,
}

impl HeapAllocator {
    /// Create unbounded allocator
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            total_allocated: 0,
            limit: None,
        }
    }

    /// Create allocator refusing to hold more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        let mut allocator = Self::new();
        allocator.limit = Some(limit);
        allocator
    }

    /// Number of live blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn layout_for(&self, size: usize) -> Result<Layout> {
        Layout::from_size_align(size.max(1), BLOCK_ALIGNMENT).map_err(|_| BridgeError::OutOfMemory {
            requested: size,
            limit: self.limit.unwrap_or(isize::MAX as usize),
        })
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&mut self, size: usize) -> Result<usize> {
        let layout = self.layout_for(size)?;

        if let Some(limit) = self.limit {
            if layout.size() > limit.saturating_sub(self.total_allocated) {
                return Err(BridgeError::OutOfMemory {
                    requested: layout.size(),
                    limit,
                });
            }
        }

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(BridgeError::OutOfMemory {
                requested: layout.size(),
                limit: self.limit.unwrap_or(usize::MAX),
            });
        }

        let address = ptr as usize;
        self.blocks.insert(address, layout);
        self.total_allocated += layout.size();
        Ok(address)
    }

    fn free(&mut self, address: usize) -> Result<()> {
        let layout = self
            .blocks
            .remove(&address)
            .ok_or(BridgeError::InvalidPointer { address })?;

        // SAFETY: the block was produced by `alloc_zeroed` with this layout
        // and has just been removed from the live set.
        unsafe { std::alloc::dealloc(address as *mut u8, layout) };
        self.total_allocated -= layout.size();
        Ok(())
    }

    fn contains(&self, address: usize) -> bool {
        self.blocks.contains_key(&address)
    }

    fn free_all(&mut self) -> usize {
        let released = self.total_allocated;
        for (address, layout) in std::mem::take(&mut self.blocks) {
            // SAFETY: see `free`.
            unsafe { std::alloc::dealloc(address as *mut u8, layout) };
        }
        self.total_allocated = 0;
        released
    }

    fn allocated_bytes(&self) -> usize {
        self.total_allocated
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let mut alloc = HeapAllocator::new();
        let addr = alloc.alloc(40).unwrap();

        assert_eq!(addr % BLOCK_ALIGNMENT, 0);
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 40) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(alloc.contains(addr));
        assert_eq!(alloc.allocated_bytes(), 40);
    }

    #[test]
    fn test_free_unknown_block() {
        let mut alloc = HeapAllocator::new();
        assert!(matches!(
            alloc.free(0xdead0),
            Err(BridgeError::InvalidPointer { address: 0xdead0 })
        ));
    }

    #[test]
    fn test_limit() {
        let mut alloc = HeapAllocator::with_limit(64);
        alloc.alloc(48).unwrap();
        assert!(matches!(
            alloc.alloc(32),
            Err(BridgeError::OutOfMemory { limit: 64, .. })
        ));
    }

    #[test]
    fn test_oversized_request_is_out_of_memory() {
        let mut alloc = HeapAllocator::new();
        assert!(matches!(
            alloc.alloc(usize::MAX - 4),
            Err(BridgeError::OutOfMemory { requested, .. }) if requested == usize::MAX - 4
        ));

        let mut bounded = HeapAllocator::with_limit(64);
        assert!(matches!(
            bounded.alloc(usize::MAX / 2),
            Err(BridgeError::OutOfMemory { limit: 64, .. })
        ));
        assert_eq!(bounded.allocated_bytes(), 0);
    }

    #[test]
    fn test_free_all() {
        let mut alloc = HeapAllocator::new();
        let a = alloc.alloc(16).unwrap();
        let b = alloc.alloc(32).unwrap();

        assert_eq!(alloc.free_all(), 48);
        assert!(!alloc.contains(a));
        assert!(!alloc.contains(b));
        assert_eq!(alloc.block_count(), 0);
    }
}
