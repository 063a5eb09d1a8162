/*!
 * Memory Types
 * Common types for memory management
 */

use crate::core::types::{Address, BlockType, HeapId, OwnerId, Size};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Point of a mutating call at which the integrity checker ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    Entering,
    Leaving,
}

impl std::fmt::Display for CheckPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CheckPhase::Entering => write!(f, "entering"),
            CheckPhase::Leaving => write!(f, "leaving"),
        }
    }
}

/// Memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum MemoryError {
    #[error("Out of memory: requested {requested} bytes in heap {heap}, {available} bytes available")]
    #[diagnostic(
        code(memory::out_of_memory),
        help("Free or compact blocks in this heap, or allocate from a larger heap.")
    )]
    OutOfMemory {
        requested: Size,
        available: Size,
        heap: HeapId,
    },

    #[error("Invalid operation: {0}")]
    #[diagnostic(code(memory::invalid_operation))]
    InvalidOperation(String),

    #[error("Block at 0x{0:x} is locked")]
    #[diagnostic(
        code(memory::locked),
        help("Unlock every outstanding lock on the handle first.")
    )]
    Locked(Address),

    #[error("Heap {heap} smashed ({phase}): code {code} at 0x{address:x}")]
    #[diagnostic(code(memory::heap_corrupted))]
    HeapCorrupted {
        heap: HeapId,
        phase: CheckPhase,
        code: i32,
        address: Address,
    },

    #[error("No such heap: {0}")]
    #[diagnostic(code(memory::no_such_heap))]
    NoSuchHeap(HeapId),

    #[error("Invalid memory address: 0x{0:x}")]
    #[diagnostic(code(memory::invalid_address))]
    InvalidAddress(Address),
}

impl MemoryError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        MemoryError::InvalidOperation(reason.into())
    }
}

/// Legacy memory error codes kept in the per-thread "last error" slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum MemErr {
    NoErr = 0,
    MemFull = -108,
    NilHandle = -109,
    MemWz = -111,
    MemLocked = -117,
    HeapCorrupt = -10010,
}

impl MemErr {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn is_ok(self) -> bool {
        self == MemErr::NoErr
    }
}

impl From<&MemoryError> for MemErr {
    fn from(error: &MemoryError) -> Self {
        match error {
            MemoryError::OutOfMemory { .. } => MemErr::MemFull,
            MemoryError::InvalidOperation(_) => MemErr::NilHandle,
            MemoryError::Locked(_) => MemErr::MemLocked,
            MemoryError::HeapCorrupted { .. } => MemErr::HeapCorrupt,
            MemoryError::NoSuchHeap(_) | MemoryError::InvalidAddress(_) => MemErr::MemWz,
        }
    }
}

/// Which address space a block belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Fixed-address block
    Pointer,
    /// Relocatable block reached through a master pointer
    Handle,
}

/// Snapshot of one live block, as seen by an external collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub address: Address,
    pub size: Size,
    pub kind: BlockKind,
    pub heap: HeapId,
    pub owner: OwnerId,
    /// Explicit name, 0 when the block only carries a call-chain hash
    pub name: u32,
    pub debug_hash: Option<u32>,
    pub block_type: BlockType,
    pub busy_count: u32,
}

/// Heap statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub heap: HeapId,
    pub safe: bool,
    pub capacity: Size,
    /// Bytes reserved by live blocks (payload rounded to alignment)
    pub used: Size,
    pub available: Size,
    pub largest_free_block: Size,
    pub usage_percentage: f64,
    pub pointer_blocks: usize,
    pub handle_blocks: usize,
    pub free_fragments: usize,
}

impl MemoryStats {
    pub fn memory_pressure(&self) -> MemoryPressure {
        MemoryPressure::from_ratio(self.usage_percentage / 100.0)
    }
}

/// Memory pressure levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryPressure {
    Low,
    Medium,
    High,
    Critical,
}

impl MemoryPressure {
    pub fn from_ratio(ratio: f64) -> Self {
        use crate::core::limits::{PRESSURE_CRITICAL, PRESSURE_MEDIUM, PRESSURE_WARNING};

        if ratio >= PRESSURE_CRITICAL {
            MemoryPressure::Critical
        } else if ratio >= PRESSURE_WARNING {
            MemoryPressure::High
        } else if ratio >= PRESSURE_MEDIUM {
            MemoryPressure::Medium
        } else {
            MemoryPressure::Low
        }
    }
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MemoryPressure::Low => write!(f, "LOW"),
            MemoryPressure::Medium => write!(f, "MEDIUM"),
            MemoryPressure::High => write!(f, "HIGH"),
            MemoryPressure::Critical => write!(f, "CRITICAL"),
        }
    }
}
