/*!
 * Structured Tracing
 * Subscriber setup and per-call spans for heap operations
 *
 * Features:
 * - JSON-formatted logs for structured parsing
 * - One span per heap call, with semaphore wait and hold times
 * - Slow-call warnings
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Heap calls held longer than this are reported as slow
const SLOW_CALL: Duration = Duration::from_millis(10);

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - NEWTON_MEMORY_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("NEWTON_MEMORY_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_file(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

/// Span covering one call against a heap
pub struct HeapCallSpan {
    span: tracing::Span,
    start: Instant,
    call_id: u64,
}

impl HeapCallSpan {
    pub fn new(heap: u32) -> Self {
        let call_id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let span = span!(
            Level::TRACE,
            "heap_call",
            call_id,
            heap,
            wait_us = tracing::field::Empty,
            held_us = tracing::field::Empty
        );
        Self {
            span,
            start: Instant::now(),
            call_id,
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Record how long the heap semaphore took to acquire
    pub fn record_wait(&self, wait: Duration) {
        self.span.record("wait_us", wait.as_micros() as u64);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for HeapCallSpan {
    fn drop(&mut self) {
        let held = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("held_us", held.as_micros() as u64);

        if held > SLOW_CALL {
            warn!(
                call_id = self.call_id,
                duration_ms = held.as_millis() as u64,
                slow = true,
                "slow heap call detected"
            );
        } else {
            debug!(
                call_id = self.call_id,
                duration_us = held.as_micros() as u64,
                "heap call completed"
            );
        }
    }
}

pub fn span_heap_call(heap: u32) -> HeapCallSpan {
    HeapCallSpan::new(heap)
}
