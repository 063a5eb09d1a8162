/*!
 * Heaps
 *
 * A heap owns a bounded arena inside its own address window. General heaps
 * keep a coalesced segregated free list, a side table of block headers and
 * the master pointer table for handles; safe heaps delegate to the simpler
 * non-relocating pool in `safe_heap`.
 */

use super::config::HeapConfig;
use super::free_list::{FreeBlock, SegregatedFreeList};
use super::metadata::BlockHeader;
use super::safe_heap::SafeHeap;
use super::types::{BlockInfo, BlockKind, MemoryError, MemoryResult, MemoryStats};
use crate::core::limits::{reservation_for, HEAP_ADDRESS_STRIDE, MAX_HEAP_CAPACITY};
use crate::core::sync::Semaphore;
use crate::core::types::{Address, HeapId, Size};
use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// First address of a heap's window
pub fn heap_base(id: HeapId) -> Option<Address> {
    (id as usize).checked_add(1)?.checked_mul(HEAP_ADDRESS_STRIDE)
}

/// Heap whose window contains `address`
pub fn heap_for_address(address: Address) -> Option<HeapId> {
    if address < HEAP_ADDRESS_STRIDE {
        return None;
    }
    HeapId::try_from(address / HEAP_ADDRESS_STRIDE - 1).ok()
}

/// Storage primitives shared by general and safe heaps
pub(crate) trait BlockStore {
    fn heap_id(&self) -> HeapId;

    /// Reserve a block; `None` when the heap cannot satisfy the request
    fn allocate(&mut self, kind: BlockKind, size: Size) -> Option<Address>;

    /// Release a block, returning its header
    fn release(&mut self, address: Address) -> Option<BlockHeader>;

    /// Resize a block, in place when possible and by moving it when allowed.
    /// Bytes `[0, min(old, new))` survive; grown bytes are zeroed.
    fn resize(&mut self, address: Address, size: Size, may_move: bool) -> Option<Address>;

    fn header(&self, address: Address) -> Option<&BlockHeader>;

    fn header_mut(&mut self, address: Address) -> Option<&mut BlockHeader>;

    fn bytes(&self, address: Address) -> Option<&[u8]>;

    fn bytes_mut(&mut self, address: Address) -> Option<&mut [u8]>;

    fn capacity(&self) -> Size;

    fn available(&self) -> Size;

    /// Give free space at the top of the heap back; returns bytes released
    fn trim(&mut self) -> Size;

    /// Slide unlocked handle blocks toward the bottom; returns blocks moved
    fn compact(&mut self) -> usize;

    /// Retire a master pointer cell; handles naming it stop resolving
    fn release_master(&mut self, slot: u32);

    fn stats(&self) -> MemoryStats;

    fn block_infos(&self) -> Vec<BlockInfo>;
}

/// Master pointer cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MasterPointer {
    pub target: Option<Address>,
    pub generation: u32,
    pub live: bool,
}

/// Mutable state of a general (relocatable) heap
#[derive(Debug)]
pub(crate) struct HeapState {
    pub(super) id: HeapId,
    pub(super) base: Address,
    pub(super) capacity: Size,
    /// Arena length is the heap frontier
    pub(super) arena: Vec<u8>,
    pub(super) free_list: SegregatedFreeList,
    pub(super) blocks: HashMap<Address, BlockHeader, RandomState>,
    pub(super) masters: Vec<MasterPointer>,
    pub(super) free_masters: Vec<u32>,
    pub(super) reserved_live: Size,
}

impl HeapState {
    pub fn new(id: HeapId, base: Address, capacity: Size) -> Self {
        Self {
            id,
            base,
            capacity,
            arena: Vec::new(),
            free_list: SegregatedFreeList::new(),
            blocks: HashMap::with_hasher(RandomState::new()),
            masters: Vec::new(),
            free_masters: Vec::new(),
            reserved_live: 0,
        }
    }

    #[inline]
    fn frontier(&self) -> Size {
        self.arena.len()
    }

    /// Carve `reserved` bytes out of the free list or the frontier
    fn reserve_region(&mut self, reserved: Size) -> Option<Size> {
        if let Some(block) = self.free_list.find_best_fit(reserved) {
            if block.size > reserved {
                self.free_list.insert(FreeBlock {
                    offset: block.offset + reserved,
                    size: block.size - reserved,
                });
            }
            return Some(block.offset);
        }

        let frontier = self.frontier();
        let tail = self.free_list.take_ending_at(frontier);
        let offset = tail.map_or(frontier, |t| t.offset);
        match offset.checked_add(reserved) {
            Some(end) if end <= self.capacity => {
                self.arena.resize(end, 0);
                Some(offset)
            }
            _ => {
                if let Some(tail) = tail {
                    self.free_list.insert(tail);
                }
                None
            }
        }
    }

    fn zero_grown(&mut self, offset: Size, old_size: Size, new_size: Size) {
        if new_size > old_size {
            self.arena[offset + old_size..offset + new_size].fill(0);
        }
    }

    fn point_master(&mut self, header: &BlockHeader, target: Option<Address>) {
        if let Some(slot) = header.master() {
            if let Some(master) = self.masters.get_mut(slot as usize) {
                master.target = target;
            }
        }
    }

    /// Move a block's payload and header to `new_offset`, freeing the old region
    fn relocate(&mut self, address: Address, new_offset: Size, new_size: Size, new_reserved: Size) -> Option<Address> {
        let mut header = self.blocks.remove(&address)?;
        let offset = address - self.base;
        let keep = header.size().min(new_size);
        self.arena.copy_within(offset..offset + keep, new_offset);
        self.zero_grown(new_offset, keep, new_size);
        self.free_list.insert_merged(FreeBlock {
            offset,
            size: header.reserved(),
        });

        self.reserved_live = self.reserved_live - header.reserved() + new_reserved;
        header.set_extent(new_size, new_reserved);
        let new_address = self.base + new_offset;
        self.point_master(&header, Some(new_address));
        self.blocks.insert(new_address, header);
        Some(new_address)
    }

    /// Slide unlocked handle blocks into lower holes. Returns blocks moved.
    fn compact_handles(&mut self) -> usize {
        let mut movable: Vec<Address> = self
            .blocks
            .iter()
            .filter(|(_, h)| h.is_relocatable())
            .map(|(a, _)| *a)
            .collect();
        movable.sort_unstable();

        let mut moved = 0;
        for address in movable {
            let Some((size, reserved)) = self.blocks.get(&address).map(|h| (h.size(), h.reserved())) else {
                continue;
            };
            let offset = address - self.base;
            let Some(hole) = self.free_list.take_lowest_fit_below(reserved, offset) else {
                continue;
            };
            if hole.size > reserved {
                self.free_list.insert(FreeBlock {
                    offset: hole.offset + reserved,
                    size: hole.size - reserved,
                });
            }
            if self.relocate(address, hole.offset, size, reserved).is_some() {
                moved += 1;
            }
        }

        self.trim();
        moved
    }

    /// Claim a master pointer slot for `target`
    pub fn attach_master(&mut self, target: Option<Address>) -> (u32, u32) {
        let slot = match self.free_masters.pop() {
            Some(slot) => slot,
            None => {
                self.masters.push(MasterPointer {
                    target: None,
                    generation: 0,
                    live: false,
                });
                (self.masters.len() - 1) as u32
            }
        };

        let master = &mut self.masters[slot as usize];
        master.live = true;
        master.target = target;
        let generation = master.generation;

        if let Some(address) = target {
            if let Some(header) = self.blocks.get_mut(&address) {
                header.set_master(slot);
            }
        }
        (slot, generation)
    }

    /// Live master pointer matching `generation`
    pub fn master(&self, slot: u32, generation: u32) -> Option<MasterPointer> {
        self.masters
            .get(slot as usize)
            .filter(|m| m.live && m.generation == generation)
            .copied()
    }

    pub fn set_master_target(&mut self, slot: u32, target: Option<Address>) {
        if let Some(master) = self.masters.get_mut(slot as usize) {
            master.target = target;
        }
        if let Some(address) = target {
            if let Some(header) = self.blocks.get_mut(&address) {
                header.set_master(slot);
            }
        }
    }

    /// Test hook: make the accounting disagree with the block table
    #[cfg(test)]
    pub(crate) fn smash_accounting(&mut self) {
        self.reserved_live += 8;
    }
}

impl BlockStore for HeapState {
    fn heap_id(&self) -> HeapId {
        self.id
    }

    fn allocate(&mut self, kind: BlockKind, size: Size) -> Option<Address> {
        let reserved = reservation_for(size).filter(|r| *r <= self.capacity)?;
        let offset = self.reserve_region(reserved)?;
        let address = self.base + offset;
        self.blocks
            .insert(address, BlockHeader::new(kind, size, reserved, self.id));
        self.reserved_live += reserved;
        Some(address)
    }

    fn release(&mut self, address: Address) -> Option<BlockHeader> {
        let header = self.blocks.remove(&address)?;
        self.free_list.insert_merged(FreeBlock {
            offset: address - self.base,
            size: header.reserved(),
        });
        self.reserved_live -= header.reserved();

        if let Some(slot) = header.master() {
            if let Some(master) = self.masters.get_mut(slot as usize) {
                if master.target == Some(address) {
                    master.target = None;
                }
            }
        }
        Some(header)
    }

    fn resize(&mut self, address: Address, size: Size, may_move: bool) -> Option<Address> {
        let (old_size, old_reserved) = self
            .blocks
            .get(&address)
            .map(|h| (h.size(), h.reserved()))?;
        let new_reserved = reservation_for(size).filter(|r| *r <= self.capacity)?;
        let offset = address - self.base;

        if new_reserved <= old_reserved {
            if new_reserved < old_reserved {
                self.free_list.insert_merged(FreeBlock {
                    offset: offset + new_reserved,
                    size: old_reserved - new_reserved,
                });
                self.reserved_live -= old_reserved - new_reserved;
            }
            self.zero_grown(offset, old_size, size);
            self.blocks.get_mut(&address)?.set_extent(size, new_reserved);
            return Some(address);
        }

        let extra = new_reserved - old_reserved;
        let end = offset + old_reserved;

        // Absorb the free neighbour, or the frontier, when they are big enough
        let mut grown = false;
        if let Some(next) = self.free_list.take_at(end) {
            if next.size >= extra {
                if next.size > extra {
                    self.free_list.insert(FreeBlock {
                        offset: end + extra,
                        size: next.size - extra,
                    });
                }
                grown = true;
            } else if next.end() == self.frontier() && offset + new_reserved <= self.capacity {
                self.arena.resize(offset + new_reserved, 0);
                grown = true;
            } else {
                self.free_list.insert(next);
            }
        } else if end == self.frontier() && offset + new_reserved <= self.capacity {
            self.arena.resize(offset + new_reserved, 0);
            grown = true;
        }

        if grown {
            self.reserved_live += extra;
            self.zero_grown(offset, old_size, size);
            self.blocks.get_mut(&address)?.set_extent(size, new_reserved);
            return Some(address);
        }

        if !may_move {
            return None;
        }
        let new_offset = self.reserve_region(new_reserved)?;
        self.relocate(address, new_offset, size, new_reserved)
    }

    fn header(&self, address: Address) -> Option<&BlockHeader> {
        self.blocks.get(&address)
    }

    fn header_mut(&mut self, address: Address) -> Option<&mut BlockHeader> {
        self.blocks.get_mut(&address)
    }

    fn bytes(&self, address: Address) -> Option<&[u8]> {
        let size = self.blocks.get(&address)?.size();
        let offset = address - self.base;
        self.arena.get(offset..offset + size)
    }

    fn bytes_mut(&mut self, address: Address) -> Option<&mut [u8]> {
        let size = self.blocks.get(&address)?.size();
        let offset = address - self.base;
        self.arena.get_mut(offset..offset + size)
    }

    fn capacity(&self) -> Size {
        self.capacity
    }

    fn available(&self) -> Size {
        self.capacity - self.reserved_live
    }

    fn trim(&mut self) -> Size {
        let frontier = self.frontier();
        match self.free_list.take_ending_at(frontier) {
            Some(tail) => {
                self.arena.truncate(tail.offset);
                self.arena.shrink_to_fit();
                tail.size
            }
            None => 0,
        }
    }

    fn compact(&mut self) -> usize {
        self.compact_handles()
    }

    fn release_master(&mut self, slot: u32) {
        if let Some(master) = self.masters.get_mut(slot as usize) {
            if master.live {
                master.live = false;
                master.target = None;
                master.generation = master.generation.wrapping_add(1);
                self.free_masters.push(slot);
            }
        }
    }

    fn stats(&self) -> MemoryStats {
        let pointer_blocks = self
            .blocks
            .values()
            .filter(|h| h.kind() == BlockKind::Pointer)
            .count();
        let largest_free = self
            .free_list
            .largest()
            .max(self.capacity - self.frontier());

        MemoryStats {
            heap: self.id,
            safe: false,
            capacity: self.capacity,
            used: self.reserved_live,
            available: self.available(),
            largest_free_block: largest_free,
            usage_percentage: (self.reserved_live as f64 / self.capacity.max(1) as f64) * 100.0,
            pointer_blocks,
            handle_blocks: self.blocks.len() - pointer_blocks,
            free_fragments: self.free_list.len(),
        }
    }

    fn block_infos(&self) -> Vec<BlockInfo> {
        let mut infos: Vec<BlockInfo> = self
            .blocks
            .iter()
            .map(|(address, header)| header.info(*address, self.id))
            .collect();
        infos.sort_by_key(|info| info.address);
        infos
    }
}

enum HeapPool {
    General(Mutex<HeapState>),
    Safe(Mutex<SafeHeap>),
}

/// A heap registered with the memory manager
pub struct Heap {
    id: HeapId,
    base: Address,
    capacity: Size,
    relocation_heap: HeapId,
    semaphore: Option<Arc<Semaphore>>,
    pool: HeapPool,
}

impl Heap {
    pub(crate) fn new(id: HeapId, config: &HeapConfig) -> MemoryResult<Self> {
        if config.capacity == 0 || config.capacity > MAX_HEAP_CAPACITY {
            return Err(MemoryError::invalid(format!(
                "heap capacity {} outside 1..={}",
                config.capacity, MAX_HEAP_CAPACITY
            )));
        }
        let base = heap_base(id)
            .filter(|b| b.checked_add(HEAP_ADDRESS_STRIDE).is_some())
            .ok_or_else(|| MemoryError::invalid(format!("no address window left for heap {}", id)))?;

        let pool = if config.safe {
            HeapPool::Safe(Mutex::new(SafeHeap::new(id, base, config.capacity)))
        } else {
            HeapPool::General(Mutex::new(HeapState::new(id, base, config.capacity)))
        };

        Ok(Self {
            id,
            base,
            capacity: config.capacity,
            relocation_heap: config.relocation_heap.unwrap_or(id),
            semaphore: config.semaphore.then(|| Arc::new(Semaphore::new())),
            pool,
        })
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn capacity(&self) -> Size {
        self.capacity
    }

    /// Interrupt-safe heaps use the simple non-relocating pool
    pub fn is_safe(&self) -> bool {
        matches!(self.pool, HeapPool::Safe(_))
    }

    /// Heap holding the master pointers of handles allocated while this heap is current
    pub fn relocation_heap(&self) -> HeapId {
        self.relocation_heap
    }

    pub fn semaphore(&self) -> Option<&Semaphore> {
        self.semaphore.as_deref()
    }

    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut dyn BlockStore) -> R) -> R {
        match &self.pool {
            HeapPool::General(state) => f(&mut *state.lock()),
            HeapPool::Safe(pool) => f(&mut *pool.lock()),
        }
    }

    /// General heap state; `None` for safe heaps
    pub(crate) fn general(&self) -> Option<MutexGuard<'_, HeapState>> {
        match &self.pool {
            HeapPool::General(state) => Some(state.lock()),
            HeapPool::Safe(_) => None,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.with_store(|store| store.stats())
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("base", &format_args!("0x{:x}", self.base))
            .field("capacity", &self.capacity)
            .field("safe", &self.is_safe())
            .field("relocation_heap", &self.relocation_heap)
            .field("semaphore", &self.semaphore.is_some())
            .finish()
    }
}
