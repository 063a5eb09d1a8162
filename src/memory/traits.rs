/*!
 * Memory Traits
 * Allocator abstractions for code that only needs one side of the API
 */

use super::handle::Handle;
use super::manager::MemoryManager;
use super::types::*;
use super::usage::UsageSnapshot;
use crate::core::types::{Address, HeapId, Size};

/// Fixed-address block allocator
pub trait PointerAllocator: Send + Sync {
    /// Allocate a block that never moves on its own
    fn allocate(&self, size: Size) -> MemoryResult<Address>;

    /// Release a block; unknown addresses are ignored
    fn deallocate(&self, address: Address) -> MemoryResult<()>;

    /// Resize a block, returning the address the caller must adopt
    fn reallocate(&self, address: Address, new_size: Size) -> MemoryResult<Address>;

    /// Size of a block, 0 when unknown
    fn block_size(&self, address: Address) -> Size;
}

/// Relocatable block allocator
pub trait HandleAllocator: Send + Sync {
    fn allocate_handle(&self, size: Size) -> MemoryResult<Handle>;

    fn deallocate_handle(&self, handle: Handle) -> MemoryResult<()>;

    fn handle_size(&self, handle: Handle) -> Size;

    fn resize_handle(&self, handle: Handle, size: Size) -> MemoryResult<()>;

    /// Pin a handle and return its current address
    fn lock(&self, handle: Handle) -> MemoryResult<Address>;

    fn unlock(&self, handle: Handle) -> MemoryResult<()>;
}

/// Memory statistics provider
pub trait MemoryInfo: Send + Sync {
    /// Live bytes in pointer and handle space
    fn usage(&self) -> UsageSnapshot;

    fn stats(&self, heap: HeapId) -> MemoryResult<MemoryStats>;

    /// Pressure level of one heap
    fn pressure(&self, heap: HeapId) -> MemoryResult<MemoryPressure> {
        Ok(self.stats(heap)?.memory_pressure())
    }
}

impl PointerAllocator for MemoryManager {
    fn allocate(&self, size: Size) -> MemoryResult<Address> {
        self.new_ptr(size)
    }

    fn deallocate(&self, address: Address) -> MemoryResult<()> {
        self.free_ptr(address)
    }

    fn reallocate(&self, address: Address, new_size: Size) -> MemoryResult<Address> {
        self.realloc_ptr(address, new_size)
    }

    fn block_size(&self, address: Address) -> Size {
        self.get_ptr_size(address)
    }
}

impl HandleAllocator for MemoryManager {
    fn allocate_handle(&self, size: Size) -> MemoryResult<Handle> {
        self.new_handle(size)
    }

    fn deallocate_handle(&self, handle: Handle) -> MemoryResult<()> {
        self.free_handle(handle)
    }

    fn handle_size(&self, handle: Handle) -> Size {
        self.get_handle_size(handle)
    }

    fn resize_handle(&self, handle: Handle, size: Size) -> MemoryResult<()> {
        self.set_handle_size(handle, size)
    }

    fn lock(&self, handle: Handle) -> MemoryResult<Address> {
        self.h_lock(handle)
    }

    fn unlock(&self, handle: Handle) -> MemoryResult<()> {
        self.h_unlock(handle)
    }
}

impl MemoryInfo for MemoryManager {
    fn usage(&self) -> UsageSnapshot {
        MemoryManager::usage(self)
    }

    fn stats(&self, heap: HeapId) -> MemoryResult<MemoryStats> {
        self.heap_stats(heap)
    }
}
