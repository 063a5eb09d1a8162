/*!
 * Core Types
 * Common types used across the memory manager
 */

/// Address type for block payloads (0 is the nil address)
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// Heap identifier
pub type HeapId = u32;

/// Owner of a block (object or task id, top bit reserved)
pub type OwnerId = u32;

/// Raw 32-bit block name (top bit marks an explicit name)
pub type BlockName = u32;

/// Small per-block type tag
pub type BlockType = u8;

/// The nil address
pub const NIL: Address = 0;

/// Owner of blocks nobody has claimed
pub const NO_OWNER: OwnerId = 0;
