/*!
 * System Limits and Constants
 *
 * Centralized location for heap sizes, alignment rules and header bit layouts.
 */

use super::types::{HeapId, Size};

// =============================================================================
// BLOCK LAYOUT
// =============================================================================

/// Payload alignment; every reservation is rounded up to a multiple of this
pub const BLOCK_ALIGNMENT: Size = 8;

/// Top bit of a stored name: set for explicit names, clear for call-chain hashes
pub const EXPLICIT_NAME_BIT: u32 = 0x8000_0000;

/// Top bit of an owner id, reserved for the allocator
pub const OWNER_RESERVED_BIT: u32 = 0x8000_0000;

// =============================================================================
// HEAP LAYOUT
// =============================================================================

/// Address window reserved for each heap (256MB)
/// Heap `n` owns `[(n + 1) * STRIDE, (n + 2) * STRIDE)`, so an address alone
/// identifies its heap and 0 is never a valid payload address
pub const HEAP_ADDRESS_STRIDE: Size = 1 << 28;

/// Largest capacity a single heap may be created with
pub const MAX_HEAP_CAPACITY: Size = HEAP_ADDRESS_STRIDE - BLOCK_ALIGNMENT;

/// Default capacity of the general heap created at startup (4MB)
pub const DEFAULT_HEAP_SIZE: Size = 4 * 1024 * 1024;

/// Capacity of the boot pool used before the OS is running (256KB)
pub const DEFAULT_BOOT_POOL_SIZE: Size = 256 * 1024;

/// Heap id of the boot pool
pub const BOOT_HEAP_ID: HeapId = 0;

/// Heap id of the general heap created at startup
pub const DEFAULT_HEAP_ID: HeapId = 1;

// =============================================================================
// FREE LIST SIZE CLASSES
// =============================================================================

/// Small block threshold for segregated free list (4KB)
pub const SMALL_BLOCK_MAX: Size = 4 * 1024;

/// Medium block threshold (64KB)
pub const MEDIUM_BLOCK_MAX: Size = 64 * 1024;

// =============================================================================
// MEMORY PRESSURE
// =============================================================================

/// Heap usage ratio reported as medium pressure
pub const PRESSURE_MEDIUM: f64 = 0.60;

/// Heap usage ratio reported as high pressure
pub const PRESSURE_WARNING: f64 = 0.80;

/// Heap usage ratio reported as critical pressure
pub const PRESSURE_CRITICAL: f64 = 0.95;

/// Round a request up to the reservation the heap actually makes
///
/// Returns `None` when the rounded size does not fit in the address type.
#[inline]
pub const fn reservation_for(size: Size) -> Option<Size> {
    let size = if size == 0 { 1 } else { size };
    match size.checked_add(BLOCK_ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(BLOCK_ALIGNMENT - 1)),
        None => None,
    }
}
