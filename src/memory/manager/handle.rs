/*!
 * Handle Operations
 *
 * Relocatable blocks reached through master pointers, plus fake handles over
 * external memory. Every mutation runs against the heap holding the master
 * pointer; a handle whose master pointer was recycled no longer resolves.
 */

use super::call::zero_fill;
use super::pointer::span;
use super::MemoryManager;
use crate::core::types::{Address, BlockName, BlockType, OwnerId, Size};
use crate::memory::fake::FakeBlock;
use crate::memory::handle::{Handle, HandleId};
use crate::memory::heap::{BlockStore, HeapState};
use crate::memory::metadata::{check_name, BlockHeader};
use crate::memory::types::{BlockKind, MemoryError, MemoryResult};
use std::panic::Location;
use tracing::debug;

fn stale(id: HandleId) -> MemoryError {
    MemoryError::invalid(format!(
        "handle {}:{}/{} does not resolve to a live master pointer",
        id.heap, id.slot, id.generation
    ))
}

fn fake_refused(operation: &str) -> MemoryError {
    MemoryError::invalid(format!("{} is not allowed on a fake handle", operation))
}

impl MemoryManager {
    /// Run `primitive` in the handle's heap with its current master target
    fn with_handle<R>(
        &self,
        id: HandleId,
        primitive: impl FnOnce(&mut HeapState, Option<Address>) -> MemoryResult<R>,
    ) -> MemoryResult<R> {
        let heap = self.heap(id.heap).map_err(|_| stale(id))?;
        self.with_general(&heap, |state| {
            let master = state.master(id.slot, id.generation).ok_or_else(|| stale(id))?;
            if let Some(target) = master.target {
                // Ambiguous ownership: refuse rather than touch another heap
                if state.header(target).and_then(|h| h.heap()) != Some(id.heap) {
                    return Err(MemoryError::invalid(format!(
                        "block 0x{:x} has no owning heap",
                        target
                    )));
                }
            }
            primitive(state, master.target)
        })
    }

    /// Read the target header without switching heaps
    fn peek_handle<R>(&self, id: HandleId, read: impl FnOnce(&BlockHeader) -> R) -> Option<R> {
        let heap = self.heap(id.heap).ok()?;
        let state = heap.general()?;
        let target = state.master(id.slot, id.generation)?.target?;
        state.header(target).map(read)
    }

    /// Rewrite the target header without switching heaps
    fn poke_handle(
        &self,
        handle: Handle,
        operation: &str,
        write: impl FnOnce(&mut BlockHeader),
    ) -> MemoryResult<()> {
        let id = match handle {
            Handle::Real(id) => id,
            Handle::Fake(_) => return Err(fake_refused(operation)),
        };
        let heap = self.heap(id.heap).map_err(|_| stale(id))?;
        let mut state = heap.general().ok_or_else(|| stale(id))?;
        let target = state
            .master(id.slot, id.generation)
            .ok_or_else(|| stale(id))?
            .target
            .ok_or_else(|| MemoryError::invalid("handle is empty"))?;
        let header = state.header_mut(target).ok_or_else(|| stale(id))?;
        write(header);
        Ok(())
    }

    /// Current payload address; the fake alias address for fake handles
    pub(super) fn handle_address(&self, handle: Handle) -> Option<Address> {
        match handle {
            Handle::Fake(fake) => Some(fake.address()),
            Handle::Real(id) => {
                let heap = self.heap(id.heap).ok()?;
                let state = heap.general()?;
                state.master(id.slot, id.generation)?.target
            }
        }
    }

    /// Copy of the payload; `None` for an empty handle
    fn handle_bytes(&self, handle: Handle) -> MemoryResult<Option<Vec<u8>>> {
        let id = match handle {
            Handle::Fake(fake) => return Ok(Some(fake.bytes().to_vec())),
            Handle::Real(id) => id,
        };
        let heap = self.heap(id.heap).map_err(|_| stale(id))?;
        let state = heap.general().ok_or_else(|| stale(id))?;
        let master = state.master(id.slot, id.generation).ok_or_else(|| stale(id))?;
        match master.target {
            Some(target) => Ok(Some(state.bytes(target).ok_or_else(|| stale(id))?.to_vec())),
            None => Ok(None),
        }
    }

    /// Allocate a relocatable block in the relocation heap of the current heap
    #[track_caller]
    pub fn new_handle(&self, size: Size) -> MemoryResult<Handle> {
        self.new_handle_with("NewHandle", size, false, Location::caller())
    }

    /// Allocate a zero-filled relocatable block
    #[track_caller]
    pub fn new_handle_clear(&self, size: Size) -> MemoryResult<Handle> {
        self.new_handle_with("NewHandleClear", size, true, Location::caller())
    }

    fn new_handle_with(
        &self,
        operation: &'static str,
        size: Size,
        clear: bool,
        location: &Location<'_>,
    ) -> MemoryResult<Handle> {
        let ticket = self.enter(operation, Some(size), || None, location);
        let result = self.handle_heap().and_then(|heap| {
            self.with_general(&heap, |state| {
                let address = self.reserve(state, BlockKind::Handle, size, location)?;
                if clear {
                    zero_fill(state, address);
                }
                let (slot, generation) = state.attach_master(Some(address));
                let id = HandleId {
                    heap: state.heap_id(),
                    slot,
                    generation,
                };
                Ok((Handle::Real(id), address))
            })
        });
        self.leave(&ticket, &result, |(_, address)| Some(*address));
        result.map(|(handle, _)| handle)
    }

    /// Master pointer with no target; `set_handle_size` gives it one
    #[track_caller]
    pub fn new_empty_handle(&self) -> MemoryResult<Handle> {
        let ticket = self.enter("NewEmptyHandle", Some(0), || None, Location::caller());
        let result = self.handle_heap().and_then(|heap| {
            self.with_general(&heap, |state| {
                let (slot, generation) = state.attach_master(None);
                Ok(Handle::Real(HandleId {
                    heap: state.heap_id(),
                    slot,
                    generation,
                }))
            })
        });
        self.leave(&ticket, &result, |_| None);
        result
    }

    /// Alias `bytes` as a handle; nothing is allocated
    #[track_caller]
    pub fn new_fake_handle(&self, bytes: &'static [u8]) -> Handle {
        let fake = FakeBlock::new(bytes);
        let ticket = self.enter("NewFakeHandle", Some(fake.size()), || None, Location::caller());
        self.traps.leave(&ticket, Some(fake.address()));
        Handle::Fake(fake)
    }

    /// Release a handle and its master pointer
    ///
    /// Fake handles, handles whose heap is gone and recycled handles are
    /// ignored. A locked handle is refused.
    #[track_caller]
    pub fn free_handle(&self, handle: Handle) -> MemoryResult<()> {
        let ticket = self.enter("FreeHandle", None, || self.handle_address(handle), Location::caller());
        let result = match handle {
            Handle::Fake(_) => Ok(()),
            Handle::Real(id) => self.release_handle(id),
        };
        self.leave(&ticket, &result, |_| None);
        result
    }

    fn release_handle(&self, id: HandleId) -> MemoryResult<()> {
        let Ok(heap) = self.heap(id.heap) else {
            debug!(heap = id.heap, slot = id.slot, "Ignoring handle of a destroyed heap");
            return Ok(());
        };
        self.with_general(&heap, |state| {
            let Some(master) = state.master(id.slot, id.generation) else {
                debug!(heap = id.heap, slot = id.slot, "Ignoring recycled handle");
                return Ok(());
            };
            if let Some(target) = master.target {
                if state.header(target).map_or(false, |h| h.is_busy()) {
                    return Err(MemoryError::Locked(target));
                }
                if let Some(header) = state.release(target) {
                    self.usage.sub(BlockKind::Handle, header.size());
                    debug!(
                        heap = id.heap,
                        address = format_args!("0x{:x}", target),
                        size = header.size(),
                        "Freed handle"
                    );
                }
            }
            state.release_master(id.slot);
            state.trim();
            Ok(())
        })
    }

    /// Release a handle's block but keep its master pointer
    #[track_caller]
    pub fn empty_handle(&self, handle: Handle) -> MemoryResult<()> {
        let ticket = self.enter("EmptyHandle", None, || self.handle_address(handle), Location::caller());
        let result = match handle {
            Handle::Fake(_) => Err(fake_refused("EmptyHandle")),
            Handle::Real(id) => self.with_handle(id, |state, target| {
                let Some(target) = target else {
                    return Ok(());
                };
                if state.header(target).map_or(false, |h| h.is_busy()) {
                    return Err(MemoryError::Locked(target));
                }
                if let Some(header) = state.release(target) {
                    self.usage.sub(BlockKind::Handle, header.size());
                }
                state.set_master_target(id.slot, None);
                state.trim();
                Ok(())
            }),
        };
        self.leave(&ticket, &result, |_| None);
        result
    }

    /// Payload size; the alias length for fake handles, 0 for empty or
    /// unresolved handles
    #[track_caller]
    pub fn get_handle_size(&self, handle: Handle) -> Size {
        self.enter("GetHandleSize", None, || self.handle_address(handle), Location::caller());
        match handle {
            Handle::Fake(fake) => fake.size(),
            Handle::Real(id) => self.peek_handle(id, |h| h.size()).unwrap_or(0),
        }
    }

    /// Resize a handle's block
    ///
    /// An unlocked handle may move, after compacting the heap if needed; a
    /// locked handle only grows in place. An empty handle gets a new block.
    #[track_caller]
    pub fn set_handle_size(&self, handle: Handle, size: Size) -> MemoryResult<()> {
        let location = Location::caller();
        let ticket = self.enter("SetHandleSize", Some(size), || self.handle_address(handle), location);
        let result = match handle {
            Handle::Fake(_) => Err(fake_refused("SetHandleSize")),
            Handle::Real(id) => self.with_handle(id, |state, target| {
                self.resize_target(state, id, target, size, location)
            }),
        };
        self.leave(&ticket, &result, |address| Some(*address));
        result.map(|_| ())
    }

    fn resize_target(
        &self,
        state: &mut HeapState,
        id: HandleId,
        target: Option<Address>,
        size: Size,
        location: &Location<'_>,
    ) -> MemoryResult<Address> {
        let Some(address) = target else {
            let address = self.reserve(state, BlockKind::Handle, size, location)?;
            state.set_master_target(id.slot, Some(address));
            return Ok(address);
        };

        let (old_size, busy) = state
            .header(address)
            .map(|h| (h.size(), h.is_busy()))
            .ok_or_else(|| stale(id))?;

        let resized = state.resize(address, size, !busy).or_else(|| {
            if busy || state.compact() == 0 {
                return None;
            }
            // Compaction may have moved this very block
            let current = state.master(id.slot, id.generation)?.target?;
            state.resize(current, size, true)
        });

        match resized {
            Some(moved) => {
                self.usage.adjust(BlockKind::Handle, old_size, size);
                Ok(moved)
            }
            None if busy => Err(MemoryError::Locked(address)),
            None => Err(self.out_of_memory(&*state, size)),
        }
    }

    /// Lock a handle; the block cannot move until the guard drops
    ///
    /// Fake handles lock to their alias address without any bookkeeping.
    #[track_caller]
    pub fn lock_handle(&self, handle: Handle) -> MemoryResult<HandleLock> {
        let address = self.pin_handle("HLock", handle, Location::caller())?;
        Ok(HandleLock {
            manager: self.clone(),
            handle,
            address,
        })
    }

    /// Raw lock: increments the busy count and returns the current address
    ///
    /// Every `h_lock` must be paired with an `h_unlock`; prefer `lock_handle`.
    #[track_caller]
    pub fn h_lock(&self, handle: Handle) -> MemoryResult<Address> {
        self.pin_handle("HLock", handle, Location::caller())
    }

    /// Raw unlock; never takes the busy count below zero
    #[track_caller]
    pub fn h_unlock(&self, handle: Handle) -> MemoryResult<()> {
        self.unpin_handle(handle, Location::caller())
    }

    fn pin_handle(
        &self,
        operation: &'static str,
        handle: Handle,
        location: &Location<'_>,
    ) -> MemoryResult<Address> {
        let ticket = self.enter(operation, None, || self.handle_address(handle), location);
        let result = match handle {
            Handle::Fake(fake) => Ok(fake.address()),
            Handle::Real(id) => self.with_handle(id, |state, target| {
                let address = target.ok_or_else(|| MemoryError::invalid("cannot lock an empty handle"))?;
                state.header_mut(address).ok_or_else(|| stale(id))?.pin();
                Ok(address)
            }),
        };
        self.leave(&ticket, &result, |address| Some(*address));
        result
    }

    fn unpin_handle(&self, handle: Handle, location: &Location<'_>) -> MemoryResult<()> {
        let ticket = self.enter("HUnlock", None, || self.handle_address(handle), location);
        let result = match handle {
            Handle::Fake(_) => Ok(()),
            Handle::Real(id) => self.with_handle(id, |state, target| {
                if let Some(header) = target.and_then(|t| state.header_mut(t)) {
                    header.unpin();
                }
                Ok(())
            }),
        };
        self.leave(&ticket, &result, |_| None);
        result
    }

    /// Busy count of the handle's block; 0 for fake or empty handles
    pub fn handle_busy_count(&self, handle: Handle) -> u32 {
        match handle {
            Handle::Fake(_) => 0,
            Handle::Real(id) => self.peek_handle(id, |h| h.busy_count()).unwrap_or(0),
        }
    }

    /// Duplicate a handle's contents into a new, independent handle
    ///
    /// `Ok(None)` when the source is empty. Copies of fake handles are real.
    #[track_caller]
    pub fn copy_handle(&self, handle: Handle) -> MemoryResult<Option<Handle>> {
        let location = Location::caller();
        let ticket = self.enter("CopyHandle", None, || self.handle_address(handle), location);
        let result = self.duplicate(handle, location);
        self.leave(&ticket, &result, |copy| copy.and_then(|c| self.handle_address(c)));
        result
    }

    /// Replace `handle` with a fresh copy of its contents
    ///
    /// The original stays allocated; the caller still owns it through any
    /// other copy of the old value.
    #[track_caller]
    pub fn hand_to_hand(&self, handle: &mut Handle) -> MemoryResult<()> {
        let location = Location::caller();
        let source = *handle;
        let ticket = self.enter("HandToHand", None, || self.handle_address(source), location);
        let result = self.duplicate(source, location).and_then(|copy| {
            copy.ok_or_else(|| MemoryError::invalid("cannot duplicate an empty handle"))
        });
        self.leave(&ticket, &result, |copy| self.handle_address(*copy));
        *handle = result?;
        Ok(())
    }

    fn duplicate(&self, handle: Handle, location: &Location<'_>) -> MemoryResult<Option<Handle>> {
        let Some(bytes) = self.handle_bytes(handle)? else {
            return Ok(None);
        };
        let heap = self.handle_heap()?;
        let copy = self.with_general(&heap, |state| {
            let address = self.reserve(state, BlockKind::Handle, bytes.len(), location)?;
            if let Some(payload) = state.bytes_mut(address) {
                payload.copy_from_slice(&bytes);
            }
            let (slot, generation) = state.attach_master(Some(address));
            Ok(Handle::Real(HandleId {
                heap: state.heap_id(),
                slot,
                generation,
            }))
        })?;
        Ok(Some(copy))
    }

    #[track_caller]
    pub fn get_handle_owner(&self, handle: Handle) -> OwnerId {
        self.enter("GetHandleOwner", None, || self.handle_address(handle), Location::caller());
        match handle {
            Handle::Fake(_) => 0,
            Handle::Real(id) => self.peek_handle(id, |h| h.owner()).unwrap_or(0),
        }
    }

    #[track_caller]
    pub fn set_handle_owner(&self, handle: Handle, owner: OwnerId) -> MemoryResult<()> {
        self.enter("SetHandleOwner", None, || self.handle_address(handle), Location::caller());
        let result = self.poke_handle(handle, "SetHandleOwner", |h| h.set_owner(owner));
        self.record(&result);
        result
    }

    /// Explicit name; 0 when the block only carries a call-chain hash
    #[track_caller]
    pub fn get_handle_name(&self, handle: Handle) -> BlockName {
        self.enter("GetHandleName", None, || self.handle_address(handle), Location::caller());
        match handle {
            Handle::Fake(_) => 0,
            Handle::Real(id) => self.peek_handle(id, |h| h.name()).unwrap_or(0),
        }
    }

    #[track_caller]
    pub fn set_handle_name(&self, handle: Handle, name: BlockName) -> MemoryResult<()> {
        self.enter("SetHandleName", None, || self.handle_address(handle), Location::caller());
        let result = check_name(name)
            .and_then(|name| self.poke_handle(handle, "SetHandleName", |h| h.set_name(name)));
        self.record(&result);
        result
    }

    #[track_caller]
    pub fn get_handle_type(&self, handle: Handle) -> BlockType {
        self.enter("GetHandleType", None, || self.handle_address(handle), Location::caller());
        match handle {
            Handle::Fake(_) => 0,
            Handle::Real(id) => self.peek_handle(id, |h| h.block_type()).unwrap_or(0),
        }
    }

    #[track_caller]
    pub fn set_handle_type(&self, handle: Handle, block_type: BlockType) -> MemoryResult<()> {
        self.enter("SetHandleType", None, || self.handle_address(handle), Location::caller());
        let result = self.poke_handle(handle, "SetHandleType", |h| h.set_block_type(block_type));
        self.record(&result);
        result
    }
}

/// Lock on a handle; the block stays put until the guard drops
///
/// The address is valid for the life of the guard. Bytes are reached through
/// `read`/`write`, which take the heap lock for each access.
#[must_use = "the handle unlocks as soon as the guard drops"]
pub struct HandleLock {
    manager: MemoryManager,
    handle: Handle,
    address: Address,
}

impl HandleLock {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Current payload size (a locked block may still be resized in place)
    pub fn size(&self) -> Size {
        match self.handle {
            Handle::Fake(fake) => fake.size(),
            Handle::Real(_) => self.manager.peek(self.address, |h| h.size()).unwrap_or(0),
        }
    }

    pub fn read(&self, offset: Size, len: Size) -> MemoryResult<Vec<u8>> {
        match self.handle {
            Handle::Fake(fake) => Ok(fake.bytes()[span(fake.size(), offset, len)?].to_vec()),
            Handle::Real(_) => self.manager.read_ptr(self.address, offset, len),
        }
    }

    pub fn write(&self, offset: Size, data: &[u8]) -> MemoryResult<()> {
        match self.handle {
            Handle::Fake(_) => Err(fake_refused("write")),
            Handle::Real(_) => self.manager.write_ptr(self.address, offset, data),
        }
    }

    /// Copy of the whole payload
    pub fn to_vec(&self) -> MemoryResult<Vec<u8>> {
        self.read(0, self.size())
    }

    /// Unlock now rather than at end of scope
    pub fn unlock(self) {
        drop(self)
    }
}

impl Drop for HandleLock {
    fn drop(&mut self) {
        if let Handle::Real(_) = self.handle {
            if let Err(e) = self.manager.unpin_handle(self.handle, Location::caller()) {
                debug!(error = %e, "Handle vanished while locked");
            }
        }
    }
}

impl std::fmt::Debug for HandleLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleLock")
            .field("handle", &self.handle)
            .field("address", &format_args!("0x{:x}", self.address))
            .finish()
    }
}
