/*!
 * Call Sandwich
 * Heap resolution, switching, semaphore and integrity around each primitive
 */

use super::MemoryManager;
use crate::core::limits::BOOT_HEAP_ID;
use crate::core::types::{Address, HeapId, Size};
use crate::memory::heap::{heap_for_address, BlockStore, Heap, HeapState};
use crate::memory::metadata::BlockHeader;
use crate::memory::trap::{call_chain_hash, TrapTicket};
use crate::memory::types::{
    BlockKind, CheckPhase, MemErr, MemoryError, MemoryPressure, MemoryResult,
};
use crate::monitoring::span_heap_call;
use std::panic::Location;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub(super) fn zero_fill(store: &mut dyn BlockStore, address: Address) {
    if let Some(bytes) = store.bytes_mut(address) {
        bytes.fill(0);
    }
}

impl MemoryManager {
    /// Count the call and evaluate traps; `input` is only resolved when an
    /// input-address trap is armed
    pub(super) fn enter(
        &self,
        operation: &'static str,
        size: Option<Size>,
        input: impl FnOnce() -> Option<Address>,
        location: &Location<'_>,
    ) -> TrapTicket {
        let input = if self.traps.wants_input_address() {
            input()
        } else {
            None
        };
        self.traps.enter(operation, size, input, location)
    }

    /// Output-address trap and last-error bookkeeping
    pub(super) fn leave<T>(
        &self,
        ticket: &TrapTicket,
        result: &MemoryResult<T>,
        output: impl FnOnce(&T) -> Option<Address>,
    ) {
        self.traps.leave(ticket, result.as_ref().ok().and_then(output));
        self.record(result);
    }

    pub(super) fn record<T>(&self, result: &MemoryResult<T>) {
        let code = match result {
            Ok(_) => MemErr::NoErr,
            Err(e) => MemErr::from(e),
        };
        self.set_mem_error(code);
    }

    pub(super) fn set_mem_error(&self, code: MemErr) {
        self.last_error.set(code);
    }

    /// Last memory error recorded on the calling thread
    pub fn mem_error(&self) -> MemErr {
        self.last_error.get().unwrap_or(MemErr::NoErr)
    }

    /// Heap that new pointers come from
    pub(super) fn pointer_heap(&self) -> MemoryResult<Arc<Heap>> {
        if self.is_running() {
            self.heap(self.context.current())
        } else {
            self.heap(BOOT_HEAP_ID)
        }
    }

    /// Heap that new handles (payload and master pointer) go to
    pub(super) fn handle_heap(&self) -> MemoryResult<Arc<Heap>> {
        let current = self.heap(self.context.current())?;
        let target = self.heap(current.relocation_heap())?;
        if target.is_safe() {
            return Err(MemoryError::invalid(format!(
                "heap {} is safe and cannot hold handles",
                target.id()
            )));
        }
        Ok(target)
    }

    /// Live heap whose window contains `address`
    pub(super) fn heap_of(&self, address: Address) -> Option<Arc<Heap>> {
        heap_for_address(address).and_then(|id| self.heap(id).ok())
    }

    /// Run `primitive` on a general heap inside the full sandwich
    pub(super) fn with_general<R>(
        &self,
        heap: &Heap,
        primitive: impl FnOnce(&mut HeapState) -> MemoryResult<R>,
    ) -> MemoryResult<R> {
        let call = span_heap_call(heap.id());
        let _entered = call.enter();
        let _switch = self.context.switch_to(heap.id());
        let waited = Instant::now();
        let _permit = heap.semaphore().map(|semaphore| semaphore.acquire());
        call.record_wait(waited.elapsed());
        let mut state = heap.general().ok_or_else(|| {
            MemoryError::invalid(format!("heap {} is a safe heap", heap.id()))
        })?;

        self.integrity.check(&state, CheckPhase::Entering)?;
        let result = primitive(&mut state);
        // A leaving failure is reported; the primitive already ran
        let _ = self.integrity.check(&state, CheckPhase::Leaving);
        result
    }

    /// Run `primitive` on any heap: safe heaps directly, general heaps
    /// inside the sandwich
    pub(super) fn with_any<R>(
        &self,
        heap: &Heap,
        primitive: impl FnOnce(&mut dyn BlockStore) -> MemoryResult<R>,
    ) -> MemoryResult<R> {
        if heap.is_safe() {
            heap.with_store(primitive)
        } else {
            self.with_general(heap, |state| primitive(state))
        }
    }

    /// Read a header field without switching heaps
    pub(super) fn peek<R>(
        &self,
        address: Address,
        read: impl FnOnce(&BlockHeader) -> R,
    ) -> Option<R> {
        if address == 0 {
            return None;
        }
        let heap = self.heap_of(address)?;
        heap.with_store(|store| store.header(address).map(read))
    }

    /// Rewrite a header field without switching heaps
    pub(super) fn poke(
        &self,
        address: Address,
        write: impl FnOnce(&mut BlockHeader),
    ) -> MemoryResult<()> {
        let heap = self
            .heap_of(address)
            .ok_or(MemoryError::InvalidAddress(address))?;
        heap.with_store(|store| match store.header_mut(address) {
            Some(header) => {
                write(header);
                Ok(())
            }
            None => Err(MemoryError::InvalidAddress(address)),
        })
    }

    /// Allocate in a locked store, compacting once when the block does not fit.
    /// Pointers come back pinned.
    pub(super) fn reserve(
        &self,
        store: &mut dyn BlockStore,
        kind: BlockKind,
        size: Size,
        location: &Location<'_>,
    ) -> MemoryResult<Address> {
        let address = match store.allocate(kind, size) {
            Some(address) => address,
            None => {
                let moved = store.compact();
                let retried = if moved > 0 {
                    debug!(heap = store.heap_id(), moved, "Compacted heap to satisfy allocation");
                    store.allocate(kind, size)
                } else {
                    None
                };
                retried.ok_or_else(|| self.out_of_memory(&*store, size))?
            }
        };
        self.stamp(store, address, kind, location);
        Ok(address)
    }

    /// Post-allocation bookkeeping: pin pointers, stamp the call-site hash,
    /// count the bytes and log pressure
    fn stamp(
        &self,
        store: &mut dyn BlockStore,
        address: Address,
        kind: BlockKind,
        location: &Location<'_>,
    ) {
        let heap = store.heap_id();
        let debug_names = self.config.debug_names;
        if let Some(header) = store.header_mut(address) {
            if kind == BlockKind::Pointer {
                header.pin();
            }
            if debug_names {
                header.set_debug_hash(call_chain_hash(location));
            }
            self.usage.add(kind, header.size());
            debug!(
                heap,
                address = format_args!("0x{:x}", address),
                size = header.size(),
                kind = ?kind,
                "Allocated block"
            );
        }
        self.note_pressure(&*store);
    }

    pub(super) fn out_of_memory(&self, store: &dyn BlockStore, size: Size) -> MemoryError {
        let available = store.available();
        error!(
            heap = store.heap_id(),
            requested = size,
            available,
            "Out of memory"
        );
        MemoryError::OutOfMemory {
            requested: size,
            available,
            heap: store.heap_id(),
        }
    }

    fn note_pressure(&self, store: &dyn BlockStore) {
        let capacity = store.capacity().max(1);
        let ratio = (capacity - store.available().min(capacity)) as f64 / capacity as f64;
        if ratio >= self.config.critical_threshold {
            error!(
                heap = store.heap_id(),
                usage = format_args!("{:.1}%", ratio * 100.0),
                pressure = %MemoryPressure::Critical,
                "Critical memory pressure"
            );
        } else if ratio >= self.config.warning_threshold {
            warn!(
                heap = store.heap_id(),
                usage = format_args!("{:.1}%", ratio * 100.0),
                pressure = %MemoryPressure::High,
                "High memory pressure"
            );
        } else if ratio >= self.config.medium_threshold {
            info!(
                heap = store.heap_id(),
                usage = format_args!("{:.1}%", ratio * 100.0),
                pressure = %MemoryPressure::Medium,
                "Medium memory pressure"
            );
        }
    }

    /// Log a no-op on an address no live block answers for
    pub(super) fn unresolved(&self, operation: &'static str, address: Address) {
        let heap: Option<HeapId> = heap_for_address(address);
        warn!(
            operation,
            address = format_args!("0x{:x}", address),
            heap = ?heap,
            "Ignoring unresolved address"
        );
    }
}
