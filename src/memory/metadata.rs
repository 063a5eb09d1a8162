/*!
 * Block Metadata
 *
 * Per-block header kept in a side table keyed by payload address, so no
 * header ever has to be reached by pointer arithmetic on the payload.
 */

use super::types::{BlockInfo, BlockKind, MemoryError, MemoryResult};
use crate::core::limits::{EXPLICIT_NAME_BIT, OWNER_RESERVED_BIT};
use crate::core::types::{Address, BlockName, BlockType, HeapId, OwnerId, Size, NO_OWNER};

/// Encode an explicit name for storage
#[inline]
pub fn encode_name(name: BlockName) -> u32 {
    name | EXPLICIT_NAME_BIT
}

/// Names use 31 bits; the top bit marks the stored name as explicit
pub fn check_name(name: BlockName) -> MemoryResult<BlockName> {
    if name & EXPLICIT_NAME_BIT != 0 {
        return Err(MemoryError::invalid(format!(
            "block name 0x{:08x} uses the reserved top bit",
            name
        )));
    }
    Ok(name)
}

/// Encode a call-chain hash for storage; it can never look explicit
#[inline]
pub fn encode_debug_hash(hash: u32) -> u32 {
    hash & !EXPLICIT_NAME_BIT
}

/// Decode a stored name: only explicit names are ever surfaced
#[inline]
pub fn decode_name(raw: u32) -> BlockName {
    if raw & EXPLICIT_NAME_BIT != 0 {
        raw & !EXPLICIT_NAME_BIT
    } else {
        0
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    kind: BlockKind,
    /// Requested payload size
    size: Size,
    /// Bytes actually reserved in the heap
    reserved: Size,
    owner: OwnerId,
    name: u32,
    block_type: BlockType,
    busy_count: u32,
    /// Owning heap; `None` once the heap no longer vouches for the block
    heap: Option<HeapId>,
    /// Master pointer slot for handle blocks
    master: Option<u32>,
}

impl BlockHeader {
    pub fn new(kind: BlockKind, size: Size, reserved: Size, heap: HeapId) -> Self {
        Self {
            kind,
            size,
            reserved,
            owner: NO_OWNER,
            name: 0,
            block_type: 0,
            busy_count: 0,
            heap: Some(heap),
            master: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    #[inline]
    pub fn size(&self) -> Size {
        self.size
    }

    #[inline]
    pub fn reserved(&self) -> Size {
        self.reserved
    }

    pub(crate) fn set_extent(&mut self, size: Size, reserved: Size) {
        self.size = size;
        self.reserved = reserved;
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn set_owner(&mut self, owner: OwnerId) {
        self.owner = owner & !OWNER_RESERVED_BIT;
    }

    /// Explicit name, or 0 when only a call-chain hash is stored
    pub fn name(&self) -> BlockName {
        decode_name(self.name)
    }

    pub fn set_name(&mut self, name: BlockName) {
        self.name = encode_name(name);
    }

    /// Stamp a call-chain hash unless an explicit name is already present
    pub fn set_debug_hash(&mut self, hash: u32) {
        if self.name & EXPLICIT_NAME_BIT == 0 {
            self.name = encode_debug_hash(hash);
        }
    }

    pub fn debug_hash(&self) -> Option<u32> {
        if self.name & EXPLICIT_NAME_BIT == 0 && self.name != 0 {
            Some(self.name)
        } else {
            None
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn set_block_type(&mut self, block_type: BlockType) {
        self.block_type = block_type;
    }

    #[inline]
    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy_count > 0
    }

    /// Increment the busy count, returning the new value
    pub fn pin(&mut self) -> u32 {
        self.busy_count = self.busy_count.saturating_add(1);
        self.busy_count
    }

    /// Decrement the busy count; `None` if it was already zero
    pub fn unpin(&mut self) -> Option<u32> {
        if self.busy_count == 0 {
            return None;
        }
        self.busy_count -= 1;
        Some(self.busy_count)
    }

    pub fn heap(&self) -> Option<HeapId> {
        self.heap
    }

    #[cfg(test)]
    pub(crate) fn detach_heap(&mut self) {
        self.heap = None;
    }

    pub fn master(&self) -> Option<u32> {
        self.master
    }

    pub(crate) fn set_master(&mut self, slot: u32) {
        self.master = Some(slot);
    }

    /// Only unlocked handle blocks may move
    pub fn is_relocatable(&self) -> bool {
        self.kind == BlockKind::Handle && self.busy_count == 0
    }

    pub fn info(&self, address: Address, heap: HeapId) -> BlockInfo {
        BlockInfo {
            address,
            size: self.size,
            kind: self.kind,
            heap: self.heap.unwrap_or(heap),
            owner: self.owner,
            name: self.name(),
            debug_hash: self.debug_hash(),
            block_type: self.block_type,
            busy_count: self.busy_count,
        }
    }
}
