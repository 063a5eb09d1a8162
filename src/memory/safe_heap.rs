/*!
 * Safe Heap
 *
 * Simple first-fit pool used before the OS is running and for heaps flagged
 * safe (reachable from interrupt context). Blocks never move on their own;
 * only an explicit resize may return a different address. Callers run it
 * without the semaphore and heap-switch sandwich of general heaps.
 */

use super::heap::BlockStore;
use super::metadata::BlockHeader;
use super::types::{BlockInfo, BlockKind, MemoryStats};
use crate::core::limits::reservation_for;
use crate::core::types::{Address, HeapId, Size};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct SafeHeap {
    id: HeapId,
    base: Address,
    capacity: Size,
    arena: Vec<u8>,
    /// Headers keyed by offset, kept in address order for first-fit
    blocks: BTreeMap<Size, BlockHeader>,
    reserved_live: Size,
}

impl SafeHeap {
    pub fn new(id: HeapId, base: Address, capacity: Size) -> Self {
        Self {
            id,
            base,
            capacity,
            arena: vec![0; capacity],
            blocks: BTreeMap::new(),
            reserved_live: 0,
        }
    }

    fn offset_of(&self, address: Address) -> Option<Size> {
        address
            .checked_sub(self.base)
            .filter(|offset| *offset < self.capacity)
    }

    /// Lowest gap of at least `reserved` bytes
    fn find_gap(&self, reserved: Size) -> Option<Size> {
        let mut cursor = 0;
        for (offset, header) in &self.blocks {
            if offset - cursor >= reserved {
                return Some(cursor);
            }
            cursor = offset + header.reserved();
        }
        (self.capacity - cursor >= reserved).then_some(cursor)
    }

    /// End of the room a block at `offset` may grow into
    fn room_after(&self, offset: Size) -> Size {
        self.blocks
            .range(offset + 1..)
            .next()
            .map_or(self.capacity, |(next, _)| *next)
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for SafeHeap {
    fn heap_id(&self) -> HeapId {
        self.id
    }

    fn allocate(&mut self, kind: BlockKind, size: Size) -> Option<Address> {
        let reserved = reservation_for(size).filter(|r| *r <= self.capacity)?;
        let offset = self.find_gap(reserved)?;
        self.blocks
            .insert(offset, BlockHeader::new(kind, size, reserved, self.id));
        self.reserved_live += reserved;
        Some(self.base + offset)
    }

    fn release(&mut self, address: Address) -> Option<BlockHeader> {
        let offset = self.offset_of(address)?;
        let header = self.blocks.remove(&offset)?;
        self.reserved_live -= header.reserved();
        Some(header)
    }

    fn resize(&mut self, address: Address, size: Size, may_move: bool) -> Option<Address> {
        let offset = self.offset_of(address)?;
        let (old_size, old_reserved) = self
            .blocks
            .get(&offset)
            .map(|h| (h.size(), h.reserved()))?;
        let new_reserved = reservation_for(size).filter(|r| *r <= self.capacity)?;

        let target = if offset + new_reserved <= self.room_after(offset) {
            offset
        } else if may_move {
            let target = self.find_gap(new_reserved)?;
            let keep = old_size.min(size);
            self.arena.copy_within(offset..offset + keep, target);
            let header = self.blocks.remove(&offset)?;
            self.blocks.insert(target, header);
            target
        } else {
            return None;
        };

        if size > old_size {
            self.arena[target + old_size..target + size].fill(0);
        }
        self.reserved_live = self.reserved_live - old_reserved + new_reserved;
        self.blocks.get_mut(&target)?.set_extent(size, new_reserved);
        Some(self.base + target)
    }

    fn header(&self, address: Address) -> Option<&BlockHeader> {
        self.blocks.get(&self.offset_of(address)?)
    }

    fn header_mut(&mut self, address: Address) -> Option<&mut BlockHeader> {
        let offset = self.offset_of(address)?;
        self.blocks.get_mut(&offset)
    }

    fn bytes(&self, address: Address) -> Option<&[u8]> {
        let offset = self.offset_of(address)?;
        let size = self.blocks.get(&offset)?.size();
        self.arena.get(offset..offset + size)
    }

    fn bytes_mut(&mut self, address: Address) -> Option<&mut [u8]> {
        let offset = self.offset_of(address)?;
        let size = self.blocks.get(&offset)?.size();
        self.arena.get_mut(offset..offset + size)
    }

    fn capacity(&self) -> Size {
        self.capacity
    }

    fn available(&self) -> Size {
        self.capacity - self.reserved_live
    }

    fn trim(&mut self) -> Size {
        // The pool is allocated up front and never returns memory
        0
    }

    fn compact(&mut self) -> usize {
        // Safe heaps hold pointers only, which never move
        0
    }

    fn release_master(&mut self, _slot: u32) {}

    fn stats(&self) -> MemoryStats {
        let mut free_fragments = 0;
        let mut largest = 0;
        let mut cursor = 0;
        for (offset, header) in &self.blocks {
            if *offset > cursor {
                free_fragments += 1;
                largest = largest.max(offset - cursor);
            }
            cursor = offset + header.reserved();
        }
        if self.capacity > cursor {
            free_fragments += 1;
            largest = largest.max(self.capacity - cursor);
        }

        MemoryStats {
            heap: self.id,
            safe: true,
            capacity: self.capacity,
            used: self.reserved_live,
            available: self.available(),
            largest_free_block: largest,
            usage_percentage: (self.reserved_live as f64 / self.capacity.max(1) as f64) * 100.0,
            pointer_blocks: self.blocks.len(),
            handle_blocks: 0,
            free_fragments,
        }
    }

    fn block_infos(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .map(|(offset, header)| header.info(self.base + offset, self.id))
            .collect()
    }
}
