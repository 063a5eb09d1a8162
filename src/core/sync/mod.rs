/*!
 * Synchronization Primitives
 *
 * Per-heap semaphores and per-thread slots. Semaphore acquisition is the only
 * point where a memory manager call can suspend the calling thread.
 */

mod semaphore;
mod thread_slots;

pub use semaphore::{Semaphore, SemaphoreGuard};
pub use thread_slots::ThreadSlots;
