/*!
 * Heap Registry
 * Heap lifecycle, statistics, compaction and owner cleanup
 */

use super::MemoryManager;
use crate::core::limits::{BOOT_HEAP_ID, DEFAULT_HEAP_ID};
use crate::core::types::{HeapId, OwnerId, Size, NO_OWNER};
use crate::memory::config::HeapConfig;
use crate::memory::heap::{BlockStore, Heap};
use crate::memory::types::{BlockInfo, BlockKind, MemoryError, MemoryResult, MemoryStats};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl MemoryManager {
    /// Register a new heap
    pub fn create_heap(&self, config: HeapConfig) -> MemoryResult<HeapId> {
        if let Some(relocation) = config.relocation_heap {
            if self.heap(relocation)?.is_safe() {
                return Err(MemoryError::invalid(format!(
                    "relocation heap {} is safe and cannot hold handles",
                    relocation
                )));
            }
        }

        let id = self.next_heap_id.fetch_add(1, Ordering::SeqCst);
        let heap = Heap::new(id, &config)?;
        info!(
            heap = id,
            capacity = config.capacity,
            safe = config.safe,
            semaphore = config.semaphore,
            relocation_heap = heap.relocation_heap(),
            "Heap created"
        );
        self.heaps.insert(id, Arc::new(heap));
        Ok(id)
    }

    /// Tear down a heap; its blocks die with it
    ///
    /// The boot pool, the default heap and heaps other heaps relocate into
    /// cannot be destroyed. Threads with the heap current fall back to the
    /// default heap.
    pub fn destroy_heap(&self, id: HeapId) -> MemoryResult<()> {
        if id == BOOT_HEAP_ID || id == DEFAULT_HEAP_ID {
            return Err(MemoryError::invalid(format!("heap {} is permanent", id)));
        }
        let heap = self.heap(id)?;
        let dependent = self
            .heaps
            .iter()
            .find(|entry| *entry.key() != id && entry.value().relocation_heap() == id)
            .map(|entry| *entry.key());
        if let Some(dependent) = dependent {
            return Err(MemoryError::invalid(format!(
                "heap {} relocates into heap {}",
                dependent, id
            )));
        }

        let _permit = heap.semaphore().map(|semaphore| semaphore.acquire());
        self.heaps.remove(&id);
        let (pointer_bytes, handle_bytes) = heap.with_store(|store| {
            store.block_infos().iter().fold((0, 0), |(p, h), info| match info.kind {
                BlockKind::Pointer => (p + info.size, h),
                BlockKind::Handle => (p, h + info.size),
            })
        });
        self.usage.sub(BlockKind::Pointer, pointer_bytes);
        self.usage.sub(BlockKind::Handle, handle_bytes);
        self.context.forget(id);

        if pointer_bytes + handle_bytes > 0 {
            warn!(
                heap = id,
                pointer_bytes, handle_bytes, "Heap destroyed with live blocks"
            );
        } else {
            info!(heap = id, "Heap destroyed");
        }
        Ok(())
    }

    pub fn heap_stats(&self, id: HeapId) -> MemoryResult<MemoryStats> {
        Ok(self.heap(id)?.stats())
    }

    /// Ids of every live heap, ascending
    pub fn heap_ids(&self) -> Vec<HeapId> {
        let mut ids: Vec<HeapId> = self.heaps.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Every live block of a heap, in address order
    pub fn heap_blocks(&self, id: HeapId) -> MemoryResult<Vec<BlockInfo>> {
        Ok(self.heap(id)?.with_store(|store| store.block_infos()))
    }

    /// Slide unlocked handles toward the bottom of a heap; returns blocks moved
    pub fn compact_heap(&self, id: HeapId) -> MemoryResult<usize> {
        let heap = self.heap(id)?;
        let moved = self.with_any(&heap, |store| Ok(store.compact()))?;
        debug!(heap = id, moved, "Heap compacted");
        Ok(moved)
    }

    /// Release every block owned by `owner`, in every heap; returns bytes freed
    ///
    /// Locked handles are released too: the owner is gone, and so is any
    /// reason to keep them. `NO_OWNER` names no one and is refused.
    pub fn free_owned_blocks(&self, owner: OwnerId) -> MemoryResult<Size> {
        if owner == NO_OWNER {
            return Err(MemoryError::invalid("owner 0 marks unowned blocks"));
        }
        let mut freed = 0;
        for id in self.heap_ids() {
            let Ok(heap) = self.heap(id) else {
                continue;
            };
            freed += self.with_any(&heap, |store| Ok(self.release_owned(store, owner)))?;
        }
        if freed > 0 {
            info!(owner, freed, "Released blocks of owner");
        }
        Ok(freed)
    }

    fn release_owned(&self, store: &mut dyn BlockStore, owner: OwnerId) -> Size {
        let owned: Vec<BlockInfo> = store
            .block_infos()
            .into_iter()
            .filter(|info| info.owner == owner)
            .collect();

        let mut freed = 0;
        for info in owned {
            let Some(header) = store.release(info.address) else {
                continue;
            };
            if let Some(slot) = header.master() {
                store.release_master(slot);
            }
            self.usage.sub(info.kind, header.size());
            freed += header.size();
        }
        store.trim();
        freed
    }
}
