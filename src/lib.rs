/*!
 * Newton Memory Library
 * Heap manager with fixed-address pointers, relocatable handles and fake handles
 */

pub mod core;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use crate::core::types::{
    Address, BlockName, BlockType, HeapId, OwnerId, Size, NIL, NO_OWNER,
};
pub use memory::{
    FakeBlock, Handle, HandleLock, HeapConfig, MemErr, MemoryConfig, MemoryError, MemoryManager,
    MemoryResult, MemoryStats,
};
pub use monitoring::init_tracing;
