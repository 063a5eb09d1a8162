/*!
 * Fake Blocks
 * Handle-shaped aliases over memory the manager does not own
 */

use crate::core::types::{Address, Size};

/// Alias over externally owned bytes (ROM images, static tables)
///
/// Carries no allocation; the manager never writes through it.
#[derive(Debug, Clone, Copy)]
pub struct FakeBlock {
    bytes: &'static [u8],
}

impl FakeBlock {
    pub const fn new(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }

    /// Address of the aliased bytes
    #[inline]
    pub fn address(&self) -> Address {
        self.bytes.as_ptr() as Address
    }

    #[inline]
    pub const fn size(&self) -> Size {
        self.bytes.len()
    }

    #[inline]
    pub const fn bytes(&self) -> &'static [u8] {
        self.bytes
    }
}

// Identity, not contents: two aliases of equal bytes at different places differ
impl PartialEq for FakeBlock {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.bytes.as_ptr(), other.bytes.as_ptr()) && self.bytes.len() == other.bytes.len()
    }
}

impl Eq for FakeBlock {}
