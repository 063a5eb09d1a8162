/*!
 * Usage Counters
 * Live bytes in pointer space and handle space
 */

use super::types::BlockKind;
use crate::core::types::Size;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Live-byte totals. Callers update them while still holding the heap that
/// performed the allocation, free or resize.
#[derive(Debug, Default)]
pub struct UsageCounters {
    pointer_bytes: AtomicUsize,
    handle_bytes: AtomicUsize,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub pointer_bytes: Size,
    pub handle_bytes: Size,
}

impl UsageSnapshot {
    pub fn total(&self) -> Size {
        self.pointer_bytes + self.handle_bytes
    }
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: BlockKind) -> &AtomicUsize {
        match kind {
            BlockKind::Pointer => &self.pointer_bytes,
            BlockKind::Handle => &self.handle_bytes,
        }
    }

    pub fn add(&self, kind: BlockKind, size: Size) {
        self.counter(kind).fetch_add(size, Ordering::SeqCst);
    }

    pub fn sub(&self, kind: BlockKind, size: Size) {
        // Saturate rather than wrap if a heap was torn down underneath us
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(size))
            });
    }

    /// Apply the signed delta of a resize
    pub fn adjust(&self, kind: BlockKind, old_size: Size, new_size: Size) {
        if new_size > old_size {
            self.add(kind, new_size - old_size);
        } else {
            self.sub(kind, old_size - new_size);
        }
    }

    pub fn get(&self, kind: BlockKind) -> Size {
        self.counter(kind).load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            pointer_bytes: self.get(BlockKind::Pointer),
            handle_bytes: self.get(BlockKind::Handle),
        }
    }
}
