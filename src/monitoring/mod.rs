/*!
 * Monitoring
 * Structured logging setup and heap call tracing
 */

mod tracer;

pub use tracer::{init_tracing, span_heap_call, HeapCallSpan};
