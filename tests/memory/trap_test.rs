/*!
 * Trap Tests
 * Recording handler installed on the manager's trap instrumentation
 */

use newton_memory::memory::{
    MemoryConfig, MemoryManager, TrapConfig, TrapEvent, TrapHandler, TrapKind,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<TrapEvent>>,
}

impl Recorder {
    fn kinds(&self) -> Vec<TrapKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl TrapHandler for Recorder {
    fn on_trap(&self, event: &TrapEvent) {
        self.events.lock().push(event.clone());
    }
}

fn instrumented() -> (MemoryManager, Arc<Recorder>) {
    let mm = MemoryManager::with_config(MemoryConfig::debug().with_heap_size(64 * 1024)).unwrap();
    let recorder = Arc::new(Recorder::default());
    mm.traps().set_handler(recorder.clone());
    (mm, recorder)
}

#[test]
fn test_every_entry_point_counts() {
    let (mm, _) = instrumented();
    let start = mm.traps().call_count();

    let ptr = mm.new_ptr(8).unwrap();
    mm.get_ptr_size(ptr);
    mm.set_ptr_name(ptr, 1).unwrap();
    mm.free_ptr(ptr).unwrap();
    let handle = mm.new_handle(8).unwrap();
    mm.h_lock(handle).unwrap();
    mm.h_unlock(handle).unwrap();
    mm.get_handle_size(handle);
    mm.free_handle(handle).unwrap();

    assert_eq!(mm.traps().call_count() - start, 9);
}

#[test]
fn test_call_count_trap_fires_once() {
    let (mm, recorder) = instrumented();
    let target = mm.traps().call_count() + 2;
    mm.traps().arm(TrapConfig {
        call_count: Some(target),
        ..Default::default()
    });

    mm.new_ptr(1).unwrap();
    mm.new_ptr(2).unwrap();
    mm.new_ptr(3).unwrap();

    let events = recorder.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TrapKind::CallCount);
    assert_eq!(events[0].call, target);
    assert_eq!(events[0].size, Some(2));
    assert_eq!(events[0].operation, "NewPtr");
}

#[test]
fn test_size_thresholds() {
    let (mm, recorder) = instrumented();
    mm.traps().arm(TrapConfig {
        size_below: Some(16),
        size_at_or_above: Some(1024),
        ..Default::default()
    });

    mm.new_ptr(8).unwrap();
    mm.new_ptr(100).unwrap();
    mm.new_handle(1024).unwrap();

    assert_eq!(
        recorder.kinds(),
        vec![TrapKind::SizeBelow, TrapKind::SizeAtOrAbove]
    );
}

#[test]
fn test_address_traps() {
    let (mm, recorder) = instrumented();
    let ptr = mm.new_ptr(32).unwrap();
    mm.free_ptr(ptr).unwrap();

    // The freed block is reused by the next allocation of the same size
    mm.traps().arm(TrapConfig {
        input_address: Some(ptr),
        output_address: Some(ptr),
        ..Default::default()
    });
    let again = mm.new_ptr(32).unwrap();
    assert_eq!(again, ptr);
    mm.get_ptr_size(again);
    mm.free_ptr(again).unwrap();

    let events = recorder.events.lock();
    let seen: Vec<(TrapKind, &str)> = events.iter().map(|e| (e.kind, e.operation)).collect();
    assert_eq!(
        seen,
        vec![
            (TrapKind::OutputAddress, "NewPtr"),
            (TrapKind::InputAddress, "GetPtrSize"),
            (TrapKind::InputAddress, "FreePtr"),
        ]
    );
}

#[test]
fn test_handle_input_address_resolves_master_target() {
    let (mm, recorder) = instrumented();
    let handle = mm.new_handle(16).unwrap();
    let address = mm.h_lock(handle).unwrap();
    mm.h_unlock(handle).unwrap();

    mm.traps().arm(TrapConfig {
        input_address: Some(address),
        ..Default::default()
    });
    mm.get_handle_size(handle);

    assert_eq!(recorder.kinds(), vec![TrapKind::InputAddress]);
}

#[test]
fn test_call_chain_hash_trap() {
    let (mm, recorder) = instrumented();
    let mut armed = None;

    for round in 0..2 {
        let ptr = mm.new_ptr(8).unwrap();
        if round == 0 {
            let blocks = mm.heap_blocks(mm.get_heap()).unwrap();
            let hash = blocks
                .iter()
                .find(|b| b.address == ptr)
                .and_then(|b| b.debug_hash)
                .unwrap();
            armed = Some(hash);
            mm.traps().arm(TrapConfig {
                call_chain_hash: Some(hash),
                ..Default::default()
            });
        }
    }
    // Different call site, same operation
    mm.new_ptr(8).unwrap();

    let events = recorder.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TrapKind::CallChainHash);
    assert_eq!(events[0].call_chain_hash, armed);
}

#[test]
fn test_trap_never_skips_operation() {
    let (mm, recorder) = instrumented();
    mm.traps().arm(TrapConfig {
        size_below: Some(usize::MAX),
        ..Default::default()
    });

    let ptr = mm.new_ptr(48).unwrap();
    assert_eq!(mm.get_ptr_size(ptr), 48);
    assert_eq!(mm.usage().pointer_bytes, 48);
    assert_eq!(recorder.kinds(), vec![TrapKind::SizeBelow]);

    mm.traps().disarm();
    assert!(!mm.traps().config().is_armed());
    mm.new_ptr(48).unwrap();
    assert_eq!(recorder.events.lock().len(), 1);
}
