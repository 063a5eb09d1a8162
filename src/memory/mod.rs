/*!
 * Memory Module
 * Heaps, pointers, handles and the diagnostics around them
 */

pub mod config;
pub mod context;
pub mod fake;
mod free_list;
pub mod handle;
pub mod heap;
pub mod integrity;
pub mod manager;
pub mod metadata;
pub mod safe_heap;
pub mod traits;
pub mod trap;
pub mod types;
pub mod usage;

// Re-export for convenience
pub use config::{ErrorResetPolicy, HeapConfig, IntegrityPolicy, MemoryConfig};
pub use context::HeapSwitch;
pub use fake::FakeBlock;
pub use handle::{Handle, HandleId};
pub use heap::{heap_base, heap_for_address};
pub use integrity::{
    IntegrityChecker, IntegrityCode, IntegrityFault, IntegrityReport, IntegrityReporter,
    TracingReporter,
};
pub use manager::{HandleLock, MemoryManager};
pub use metadata::BlockHeader;
pub use traits::*;
pub use trap::{
    call_chain_hash, LogTrapHandler, TrapConfig, TrapEvent, TrapHandler, TrapInstrumentation,
    TrapKind,
};
pub use types::*;
pub use usage::UsageSnapshot;
