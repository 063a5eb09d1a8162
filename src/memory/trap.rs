/*!
 * Trap Instrumentation
 *
 * Process-wide call counter plus independently armed breakpoint conditions,
 * evaluated around every public pointer/handle entry point. A match calls the
 * installed `TrapHandler` synchronously; the operation itself always runs.
 */

use crate::core::types::{Address, Size};
use ahash::RandomState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which condition fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    CallCount,
    SizeBelow,
    SizeAtOrAbove,
    InputAddress,
    OutputAddress,
    CallChainHash,
}

/// Breakpoint conditions; `None` leaves a condition disarmed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapConfig {
    pub call_count: Option<u64>,
    pub size_below: Option<Size>,
    pub size_at_or_above: Option<Size>,
    pub input_address: Option<Address>,
    pub output_address: Option<Address>,
    pub call_chain_hash: Option<u32>,
}

impl TrapConfig {
    pub fn is_armed(&self) -> bool {
        self.call_count.is_some()
            || self.size_below.is_some()
            || self.size_at_or_above.is_some()
            || self.input_address.is_some()
            || self.output_address.is_some()
            || self.call_chain_hash.is_some()
    }
}

/// Details handed to a trap handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapEvent {
    pub kind: TrapKind,
    pub operation: &'static str,
    /// Value of the call counter for this call
    pub call: u64,
    pub size: Option<Size>,
    pub address: Option<Address>,
    pub call_chain_hash: Option<u32>,
}

/// Receiver for fired traps (a debugger stub, a recorder in tests)
///
/// Runs on the calling thread before the heap semaphore is taken; it must not
/// expect the operation to be skipped.
pub trait TrapHandler: Send + Sync {
    fn on_trap(&self, event: &TrapEvent);
}

/// Default handler: log the trap
#[derive(Debug, Default)]
pub struct LogTrapHandler;

impl TrapHandler for LogTrapHandler {
    fn on_trap(&self, event: &TrapEvent) {
        tracing::warn!(
            kind = ?event.kind,
            operation = event.operation,
            call = event.call,
            size = ?event.size,
            address = ?event.address,
            "Memory trap fired"
        );
    }
}

/// Hash of a call site, with the explicit-name bit always clear
pub fn call_chain_hash(location: &Location<'_>) -> u32 {
    let hasher = RandomState::with_seeds(
        0x4e65_7774_6f6e_4d4d,
        0x6865_6170_5f74_7261,
        0x7073_5f63_616c_6c73,
        0x6861_7368_5f76_3031,
    );
    let hash = hasher.hash_one((location.file(), location.line(), location.column()));
    ((hash ^ (hash >> 32)) as u32) & 0x7FFF_FFFF
}

/// State kept between `enter` and `leave` of one call
#[derive(Debug, Clone, Copy)]
pub struct TrapTicket {
    pub call: u64,
    operation: &'static str,
    hash: Option<u32>,
}

pub struct TrapInstrumentation {
    calls: AtomicU64,
    config: RwLock<TrapConfig>,
    handler: RwLock<Arc<dyn TrapHandler>>,
}

impl TrapInstrumentation {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            config: RwLock::new(TrapConfig::default()),
            handler: RwLock::new(Arc::new(LogTrapHandler)),
        }
    }

    pub fn arm(&self, config: TrapConfig) {
        *self.config.write() = config;
    }

    pub fn disarm(&self) {
        *self.config.write() = TrapConfig::default();
    }

    pub fn config(&self) -> TrapConfig {
        self.config.read().clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn TrapHandler>) {
        *self.handler.write() = handler;
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fire(&self, kind: TrapKind, ticket: &TrapTicket, size: Option<Size>, address: Option<Address>) {
        let event = TrapEvent {
            kind,
            operation: ticket.operation,
            call: ticket.call,
            size,
            address,
            call_chain_hash: ticket.hash,
        };
        let handler = self.handler.read().clone();
        handler.on_trap(&event);
    }

    /// Count the call and evaluate the input-side conditions
    pub fn enter(
        &self,
        operation: &'static str,
        size: Option<Size>,
        input: Option<Address>,
        location: &Location<'_>,
    ) -> TrapTicket {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config.read().clone();
        if !config.is_armed() {
            return TrapTicket {
                call,
                operation,
                hash: None,
            };
        }

        let hash = config.call_chain_hash.map(|_| call_chain_hash(location));
        let ticket = TrapTicket {
            call,
            operation,
            hash,
        };

        if config.call_count == Some(call) {
            self.fire(TrapKind::CallCount, &ticket, size, input);
        }
        if let Some(size) = size {
            if config.size_below.map_or(false, |t| size < t) {
                self.fire(TrapKind::SizeBelow, &ticket, Some(size), input);
            }
            if config.size_at_or_above.map_or(false, |t| size >= t) {
                self.fire(TrapKind::SizeAtOrAbove, &ticket, Some(size), input);
            }
        }
        if let (Some(armed), Some(input)) = (config.input_address, input) {
            if armed == input {
                self.fire(TrapKind::InputAddress, &ticket, size, Some(input));
            }
        }
        if hash.is_some() && config.call_chain_hash == hash {
            self.fire(TrapKind::CallChainHash, &ticket, size, input);
        }
        ticket
    }

    /// Evaluate the output-address condition once the primitive has run
    pub fn leave(&self, ticket: &TrapTicket, output: Option<Address>) {
        let armed = self.config.read().output_address;
        if let (Some(armed), Some(output)) = (armed, output) {
            if armed == output {
                self.fire(TrapKind::OutputAddress, ticket, None, Some(output));
            }
        }
    }

    /// Whether input addresses are worth resolving for this call
    pub fn wants_input_address(&self) -> bool {
        self.config.read().input_address.is_some()
    }
}

impl Default for TrapInstrumentation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrapInstrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrapInstrumentation")
            .field("calls", &self.call_count())
            .field("config", &*self.config.read())
            .finish()
    }
}
