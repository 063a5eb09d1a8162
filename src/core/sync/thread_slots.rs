/*!
 * Thread Slots
 *
 * One value per live thread. A thread's entries are evicted from every map
 * it wrote to when the thread exits, so the maps stay bounded by the number
 * of running threads.
 */

use ahash::RandomState;
use dashmap::DashMap;
use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

type SlotMap<V> = DashMap<ThreadId, V, RandomState>;

trait Evict: Send + Sync {
    fn evict(&self, thread: ThreadId);
}

impl<V: Send + Sync> Evict for SlotMap<V> {
    fn evict(&self, thread: ThreadId) {
        self.remove(&thread);
    }
}

/// Maps the current thread wrote to; cleared when the thread-local drops
struct ThreadExit {
    thread: ThreadId,
    maps: RefCell<Vec<Weak<dyn Evict>>>,
}

impl Drop for ThreadExit {
    fn drop(&mut self) {
        for map in self.maps.get_mut().drain(..) {
            if let Some(map) = map.upgrade() {
                map.evict(self.thread);
            }
        }
    }
}

thread_local! {
    static THREAD_EXIT: ThreadExit = ThreadExit {
        thread: thread::current().id(),
        maps: RefCell::new(Vec::new()),
    };
}

/// Per-thread values, evicted on thread exit
pub struct ThreadSlots<V> {
    slots: Arc<SlotMap<V>>,
}

impl<V: Copy + Send + Sync + 'static> ThreadSlots<V> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::with_hasher(RandomState::new())),
        }
    }

    /// Value of the calling thread
    pub fn get(&self) -> Option<V> {
        self.slots
            .get(&thread::current().id())
            .map(|slot| *slot.value())
    }

    /// Store a value for the calling thread, returning the previous one
    pub fn set(&self, value: V) -> Option<V> {
        let previous = self.slots.insert(thread::current().id(), value);
        if previous.is_none() {
            self.watch_exit();
        }
        previous
    }

    /// Rewrite every thread's value in place
    pub fn alter_all(&self, f: impl FnMut(&ThreadId, V) -> V) {
        self.slots.alter_all(f);
    }

    /// Number of threads holding a value
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn watch_exit(&self) {
        let map: Weak<SlotMap<V>> = Arc::downgrade(&self.slots);
        let map: Weak<dyn Evict> = map;
        // Fails only while the thread is already tearing down its locals
        let _ = THREAD_EXIT.try_with(|exit| {
            let mut maps = exit.maps.borrow_mut();
            maps.retain(|m| m.strong_count() > 0);
            maps.push(map);
        });
    }
}

impl<V: Copy + Send + Sync + 'static> Default for ThreadSlots<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for ThreadSlots<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSlots")
            .field("threads", &self.slots.len())
            .finish()
    }
}
