/*!
 * Heap Context
 *
 * One "current heap" slot per thread. Operations that must run against
 * another heap take a `HeapSwitch`, which restores the previous heap when it
 * drops, so every exit path (errors included) leaves the slot as it found it.
 */

use crate::core::sync::ThreadSlots;
use crate::core::types::HeapId;

#[derive(Debug)]
pub struct HeapContext {
    slots: ThreadSlots<HeapId>,
    default_heap: HeapId,
}

impl HeapContext {
    pub fn new(default_heap: HeapId) -> Self {
        Self {
            slots: ThreadSlots::new(),
            default_heap,
        }
    }

    /// Current heap of the calling thread
    pub fn current(&self) -> HeapId {
        self.slots.get().unwrap_or(self.default_heap)
    }

    /// Make `heap` current for the calling thread, returning the previous heap
    pub fn set(&self, heap: HeapId) -> HeapId {
        self.slots.set(heap).unwrap_or(self.default_heap)
    }

    /// Switch to `heap` until the returned guard drops
    pub fn switch_to(&self, heap: HeapId) -> HeapSwitch<'_> {
        let previous = self.set(heap);
        HeapSwitch {
            context: self,
            previous,
        }
    }

    /// Point every thread that has `heap` current back at the default heap
    pub fn forget(&self, heap: HeapId) {
        let default_heap = self.default_heap;
        self.slots.alter_all(|_, current| {
            if current == heap {
                default_heap
            } else {
                current
            }
        });
    }

    pub fn default_heap(&self) -> HeapId {
        self.default_heap
    }

    /// Threads with a heap selected
    pub fn thread_count(&self) -> usize {
        self.slots.len()
    }
}

/// Scoped heap switch; restores the previous current heap on drop
#[must_use = "the previous heap is restored as soon as the guard drops"]
pub struct HeapSwitch<'a> {
    context: &'a HeapContext,
    previous: HeapId,
}

impl HeapSwitch<'_> {
    /// Heap that will be restored
    pub fn previous(&self) -> HeapId {
        self.previous
    }
}

impl Drop for HeapSwitch<'_> {
    fn drop(&mut self) {
        self.context.set(self.previous);
    }
}
