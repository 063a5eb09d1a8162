/*!
 * Memory Manager
 *
 * Public facade over the heaps: fixed-address pointers, relocatable handles
 * and fake handles.
 *
 * ## Call path
 *
 * Every public pointer/handle entry point:
 * - counts the call and evaluates armed traps
 * - resolves the target heap (current heap, the block's own heap, or the
 *   relocation heap of the current heap for new handles)
 * - switches the current heap for the duration of the call
 * - takes the heap semaphore, if the heap has one
 * - runs the integrity scan "entering", the primitive, the usage counter
 *   update and the scan "leaving" under the heap lock
 * - releases the semaphore and restores the caller's current heap
 *
 * Safe heaps (the boot pool and heaps flagged safe) skip the switch and the
 * semaphore.
 *
 * ## Address space
 *
 * Heap `n` owns a private address window, so any payload address resolves to
 * its heap without consulting the block tables; 0 is always nil.
 */

mod call;
mod handle;
mod heaps;
mod pointer;

pub use handle::HandleLock;

use super::config::{HeapConfig, MemoryConfig};
use super::context::{HeapContext, HeapSwitch};
use super::heap::Heap;
use super::integrity::IntegrityChecker;
use super::trap::TrapInstrumentation;
use super::types::{MemErr, MemoryError, MemoryResult};
use super::usage::{UsageCounters, UsageSnapshot};
use crate::core::limits::{BOOT_HEAP_ID, DEFAULT_HEAP_ID};
use crate::core::sync::ThreadSlots;
use crate::core::types::HeapId;
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// Memory manager
///
/// Cheap to clone; clones share every heap and counter.
#[derive(Clone)]
pub struct MemoryManager {
    pub(super) config: Arc<MemoryConfig>,
    pub(super) heaps: Arc<DashMap<HeapId, Arc<Heap>, RandomState>>,
    pub(super) next_heap_id: Arc<AtomicU32>,
    // Before start() pointers come from the boot pool
    pub(super) running: Arc<AtomicBool>,
    pub(super) context: Arc<HeapContext>,
    pub(super) usage: Arc<UsageCounters>,
    pub(super) traps: Arc<TrapInstrumentation>,
    pub(super) integrity: Arc<IntegrityChecker>,
    // Legacy per-thread "last memory error" slot
    pub(super) last_error: Arc<ThreadSlots<MemErr>>,
}

impl MemoryManager {
    /// Manager configured from `NEWTON_MEMORY_*` environment variables
    pub fn from_env() -> MemoryResult<Self> {
        Self::with_config(MemoryConfig::from_env())
    }

    /// Create a manager with the boot pool (heap 0) and the default heap (heap 1)
    pub fn with_config(config: MemoryConfig) -> MemoryResult<Self> {
        let boot = Heap::new(BOOT_HEAP_ID, &HeapConfig::new(config.boot_pool_size).safe())?;
        let mut default_heap = HeapConfig::new(config.default_heap_size);
        default_heap.semaphore = config.default_heap_semaphore;
        let default_heap = Heap::new(DEFAULT_HEAP_ID, &default_heap)?;

        let heaps = DashMap::with_hasher(RandomState::new());
        heaps.insert(BOOT_HEAP_ID, Arc::new(boot));
        heaps.insert(DEFAULT_HEAP_ID, Arc::new(default_heap));

        info!(
            default_heap_size = config.default_heap_size,
            boot_pool_size = config.boot_pool_size,
            integrity_checks = config.integrity_checks,
            running = config.start_running,
            "Memory manager initialized"
        );

        Ok(Self {
            integrity: Arc::new(IntegrityChecker::new(
                config.integrity_checks,
                config.integrity_policy,
            )),
            running: Arc::new(AtomicBool::new(config.start_running)),
            config: Arc::new(config),
            heaps: Arc::new(heaps),
            next_heap_id: Arc::new(AtomicU32::new(DEFAULT_HEAP_ID + 1)),
            context: Arc::new(HeapContext::new(DEFAULT_HEAP_ID)),
            usage: Arc::new(UsageCounters::new()),
            traps: Arc::new(TrapInstrumentation::new()),
            last_error: Arc::new(ThreadSlots::new()),
        })
    }

    /// Mark the OS as running; pointers stop coming from the boot pool
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Memory manager running, boot pool retired for new pointers");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Live bytes in pointer and handle space
    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    pub fn traps(&self) -> &TrapInstrumentation {
        &self.traps
    }

    pub fn integrity(&self) -> &IntegrityChecker {
        &self.integrity
    }

    /// Current heap of the calling thread
    pub fn get_heap(&self) -> HeapId {
        self.context.current()
    }

    /// Make `heap` current for the calling thread; returns the previous heap
    pub fn set_heap(&self, heap: HeapId) -> MemoryResult<HeapId> {
        self.heap(heap)?;
        Ok(self.context.set(heap))
    }

    /// Make `heap` current until the returned guard drops
    pub fn switch_heap(&self, heap: HeapId) -> MemoryResult<HeapSwitch<'_>> {
        self.heap(heap)?;
        Ok(self.context.switch_to(heap))
    }

    pub(super) fn heap(&self, id: HeapId) -> MemoryResult<Arc<Heap>> {
        self.heaps
            .get(&id)
            .map(|heap| heap.value().clone())
            .ok_or(MemoryError::NoSuchHeap(id))
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("heaps", &self.heaps.len())
            .field("running", &self.is_running())
            .field("usage", &self.usage())
            .finish()
    }
}
