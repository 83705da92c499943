//! Kernel allocator interface consumed by the scheduler.
//!
//! The buddy allocator itself lives outside this workspace; the scheduler
//! only needs `allocate(size)` and `free(region)` for task stacks.

extern crate alloc;

use alloc::alloc::{Layout, alloc, dealloc};

use kestrel_abi::MemRegion;

/// Stack alignment handed out by [`HeapAllocator`].
pub const STACK_ALIGN: usize = 16;

pub trait KernelAllocator: Sync {
    /// Returns `None` when the request cannot be satisfied.
    fn allocate(&self, size: usize) -> Option<MemRegion>;

    /// Returns `false` if `region` was not handed out by this allocator.
    fn free(&self, region: MemRegion) -> bool;
}

/// Adapter over the registered `#[global_allocator]`.
pub struct HeapAllocator;

impl KernelAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Option<MemRegion> {
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(MemRegion::new(ptr as usize, size))
    }

    fn free(&self, region: MemRegion) -> bool {
        if region.is_empty() {
            return false;
        }
        let Ok(layout) = Layout::from_size_align(region.size, STACK_ALIGN) else {
            return false;
        };
        // SAFETY: regions are only produced by `allocate` above with the same
        // size and alignment.
        unsafe { dealloc(region.base as *mut u8, layout) };
        true
    }
}
