/*!
 * Pointer Operations
 * Fixed-address blocks: allocate, free, resize and header access
 */

use super::call::zero_fill;
use super::MemoryManager;
use crate::core::types::{Address, BlockName, BlockType, OwnerId, Size, NIL};
use crate::memory::config::ErrorResetPolicy;
use crate::memory::heap::{BlockStore, Heap};
use crate::memory::metadata::check_name;
use crate::memory::types::{BlockKind, MemErr, MemoryError, MemoryResult};
use std::panic::Location;
use tracing::debug;

/// Byte range `[offset, offset + len)` of a block of `size` bytes
pub(super) fn span(size: Size, offset: Size, len: Size) -> MemoryResult<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(MemoryError::invalid(format!(
            "range {}..{} outside block of {} bytes",
            offset,
            offset.saturating_add(len),
            size
        ))),
    }
}

impl MemoryManager {
    /// Allocate a fixed-address block
    #[track_caller]
    pub fn new_ptr(&self, size: Size) -> MemoryResult<Address> {
        self.allocate_ptr("NewPtr", size, false, Location::caller())
    }

    /// Allocate a zero-filled fixed-address block
    #[track_caller]
    pub fn new_ptr_clear(&self, size: Size) -> MemoryResult<Address> {
        self.allocate_ptr("NewPtrClear", size, true, Location::caller())
    }

    fn allocate_ptr(
        &self,
        operation: &'static str,
        size: Size,
        clear: bool,
        location: &Location<'_>,
    ) -> MemoryResult<Address> {
        let ticket = self.enter(operation, Some(size), || None, location);
        let result = self
            .pointer_heap()
            .and_then(|heap| self.allocate_ptr_in(&heap, size, clear, location));
        self.leave(&ticket, &result, |address| Some(*address));
        result
    }

    fn allocate_ptr_in(
        &self,
        heap: &Heap,
        size: Size,
        clear: bool,
        location: &Location<'_>,
    ) -> MemoryResult<Address> {
        self.with_any(heap, |store| {
            let address = self.reserve(store, BlockKind::Pointer, size, location)?;
            if clear {
                zero_fill(store, address);
            }
            Ok(address)
        })
    }

    /// Release a pointer block
    ///
    /// Nil and addresses no live pointer block answers for are ignored.
    #[track_caller]
    pub fn free_ptr(&self, ptr: Address) -> MemoryResult<()> {
        let ticket = self.enter("FreePtr", None, || Some(ptr), Location::caller());
        let result = self.release_ptr(ptr);
        self.traps.leave(&ticket, None);

        match (&result, self.config.error_reset_policy) {
            (Err(e), _) => self.set_mem_error(MemErr::from(e)),
            (Ok(()), ErrorResetPolicy::ResetOnFree) => self.set_mem_error(MemErr::NoErr),
            (Ok(()), ErrorResetPolicy::Preserve) => {}
        }
        result
    }

    fn release_ptr(&self, ptr: Address) -> MemoryResult<()> {
        if ptr == NIL {
            return Ok(());
        }
        let Some(heap) = self.heap_of(ptr) else {
            self.unresolved("FreePtr", ptr);
            return Ok(());
        };

        let freed = self.with_any(&heap, |store| {
            match store.header_mut(ptr) {
                Some(header) if header.kind() == BlockKind::Pointer => {
                    header.unpin();
                }
                _ => return Ok(None),
            }
            let freed = store.release(ptr).map(|header| header.size());
            if let Some(size) = freed {
                self.usage.sub(BlockKind::Pointer, size);
            }
            store.trim();
            Ok(freed)
        })?;

        match freed {
            Some(size) => debug!(
                heap = heap.id(),
                address = format_args!("0x{:x}", ptr),
                size,
                "Freed pointer"
            ),
            None => self.unresolved("FreePtr", ptr),
        }
        Ok(())
    }

    /// Resize a pointer block, possibly moving it
    ///
    /// On failure the original block is left pinned and unchanged. A nil
    /// pointer allocates.
    #[track_caller]
    pub fn realloc_ptr(&self, ptr: Address, new_size: Size) -> MemoryResult<Address> {
        let location = Location::caller();
        if ptr == NIL {
            return self.allocate_ptr("ReallocPtr", new_size, false, location);
        }

        let ticket = self.enter("ReallocPtr", Some(new_size), || Some(ptr), location);
        let result = match self.heap_of(ptr) {
            Some(heap) => self.with_any(&heap, |store| self.resize_ptr(store, ptr, new_size)),
            None => Err(MemoryError::InvalidAddress(ptr)),
        };
        self.leave(&ticket, &result, |address| Some(*address));
        result
    }

    fn resize_ptr(
        &self,
        store: &mut dyn BlockStore,
        ptr: Address,
        new_size: Size,
    ) -> MemoryResult<Address> {
        let old_size = match store.header_mut(ptr) {
            Some(header) if header.kind() == BlockKind::Pointer => {
                header.unpin();
                header.size()
            }
            _ => return Err(MemoryError::InvalidAddress(ptr)),
        };

        match store.resize(ptr, new_size, true) {
            Some(moved) => {
                if let Some(header) = store.header_mut(moved) {
                    header.pin();
                }
                self.usage.adjust(BlockKind::Pointer, old_size, new_size);
                Ok(moved)
            }
            None => {
                if let Some(header) = store.header_mut(ptr) {
                    header.pin();
                }
                Err(self.out_of_memory(&*store, new_size))
            }
        }
    }

    /// Payload size; 0 for nil or unknown addresses
    #[track_caller]
    pub fn get_ptr_size(&self, ptr: Address) -> Size {
        self.enter("GetPtrSize", None, || Some(ptr), Location::caller());
        self.peek(ptr, |header| header.size()).unwrap_or(0)
    }

    #[track_caller]
    pub fn get_ptr_owner(&self, ptr: Address) -> OwnerId {
        self.enter("GetPtrOwner", None, || Some(ptr), Location::caller());
        self.peek(ptr, |header| header.owner()).unwrap_or(0)
    }

    #[track_caller]
    pub fn set_ptr_owner(&self, ptr: Address, owner: OwnerId) -> MemoryResult<()> {
        self.enter("SetPtrOwner", None, || Some(ptr), Location::caller());
        let result = self.poke(ptr, |header| header.set_owner(owner));
        self.record(&result);
        result
    }

    /// Explicit name; 0 when the block only carries a call-chain hash
    #[track_caller]
    pub fn get_ptr_name(&self, ptr: Address) -> BlockName {
        self.enter("GetPtrName", None, || Some(ptr), Location::caller());
        self.peek(ptr, |header| header.name()).unwrap_or(0)
    }

    #[track_caller]
    pub fn set_ptr_name(&self, ptr: Address, name: BlockName) -> MemoryResult<()> {
        self.enter("SetPtrName", None, || Some(ptr), Location::caller());
        let result =
            check_name(name).and_then(|name| self.poke(ptr, |header| header.set_name(name)));
        self.record(&result);
        result
    }

    #[track_caller]
    pub fn get_ptr_type(&self, ptr: Address) -> BlockType {
        self.enter("GetPtrType", None, || Some(ptr), Location::caller());
        self.peek(ptr, |header| header.block_type()).unwrap_or(0)
    }

    #[track_caller]
    pub fn set_ptr_type(&self, ptr: Address, block_type: BlockType) -> MemoryResult<()> {
        self.enter("SetPtrType", None, || Some(ptr), Location::caller());
        let result = self.poke(ptr, |header| header.set_block_type(block_type));
        self.record(&result);
        result
    }

    /// Copy `len` bytes out of a pointer block starting at `offset`
    pub fn read_ptr(&self, ptr: Address, offset: Size, len: Size) -> MemoryResult<Vec<u8>> {
        let heap = self.heap_of(ptr).ok_or(MemoryError::InvalidAddress(ptr))?;
        heap.with_store(|store| {
            let bytes = store.bytes(ptr).ok_or(MemoryError::InvalidAddress(ptr))?;
            Ok(bytes[span(bytes.len(), offset, len)?].to_vec())
        })
    }

    /// Write `data` into a pointer block starting at `offset`
    pub fn write_ptr(&self, ptr: Address, offset: Size, data: &[u8]) -> MemoryResult<()> {
        let heap = self.heap_of(ptr).ok_or(MemoryError::InvalidAddress(ptr))?;
        heap.with_store(|store| {
            let bytes = store
                .bytes_mut(ptr)
                .ok_or(MemoryError::InvalidAddress(ptr))?;
            let range = span(bytes.len(), offset, data.len())?;
            bytes[range].copy_from_slice(data);
            Ok(())
        })
    }
}
