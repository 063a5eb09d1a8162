/*!
 * Handle Values
 *
 * A handle is either a real master pointer cell or a fake alias over external
 * memory. Callers only ever see `Handle`; operations dispatch on the variant.
 */

use super::fake::FakeBlock;
use crate::core::types::HeapId;
use serde::{Deserialize, Serialize};

/// Identity of a master pointer cell
///
/// The generation changes every time the cell is recycled, so a handle kept
/// past `free_handle` no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId {
    pub heap: HeapId,
    pub slot: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    /// Relocatable block reached through a master pointer
    Real(HandleId),
    /// Alias over memory the manager does not own
    Fake(FakeBlock),
}

impl Handle {
    #[inline]
    pub fn is_fake(&self) -> bool {
        matches!(self, Handle::Fake(_))
    }

    /// Heap holding the master pointer; `None` for fake handles
    pub fn heap(&self) -> Option<HeapId> {
        match self {
            Handle::Real(id) => Some(id.heap),
            Handle::Fake(_) => None,
        }
    }
}

impl From<FakeBlock> for Handle {
    fn from(fake: FakeBlock) -> Self {
        Handle::Fake(fake)
    }
}
