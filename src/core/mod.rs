/*!
 * Core Module
 * Fundamental types, limits and synchronization primitives
 */

pub mod limits;
pub mod sync;
pub mod types;

// Re-export for convenience
pub use sync::{Semaphore, SemaphoreGuard};
pub use types::*;
