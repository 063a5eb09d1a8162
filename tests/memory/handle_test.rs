/*!
 * Handle Tests
 * Relocatable blocks, locking, copies and metadata
 */

use newton_memory::memory::{
    Handle, HandleAllocator, MemErr, MemoryConfig, MemoryError, MemoryManager,
};
use pretty_assertions::assert_eq;

fn manager() -> MemoryManager {
    MemoryManager::with_config(MemoryConfig::debug().with_heap_size(64 * 1024)).unwrap()
}

#[test]
fn test_lock_write_unlock_scenario() {
    let mm = manager();
    let baseline = mm.usage();

    let handle = mm.new_handle(100).unwrap();
    let payload: Vec<u8> = (0..100).collect();
    {
        let lock = mm.lock_handle(handle).unwrap();
        lock.write(0, &payload).unwrap();
        assert_eq!(mm.handle_busy_count(handle), 1);
    }
    assert_eq!(mm.handle_busy_count(handle), 0);
    assert_eq!(mm.get_handle_size(handle), 100);

    mm.free_handle(handle).unwrap();
    assert_eq!(mm.usage(), baseline);
}

#[test]
fn test_nested_locks_balance() {
    let mm = manager();
    let handle = mm.new_handle(40).unwrap();

    let first = mm.h_lock(handle).unwrap();
    for _ in 0..4 {
        assert_eq!(mm.h_lock(handle).unwrap(), first);
    }
    assert_eq!(mm.handle_busy_count(handle), 5);
    assert_eq!(mm.get_handle_size(handle), 40);

    for _ in 0..5 {
        mm.h_unlock(handle).unwrap();
    }
    assert_eq!(mm.handle_busy_count(handle), 0);
    assert_eq!(mm.get_handle_size(handle), 40);

    // Extra unlocks never go below zero
    mm.h_unlock(handle).unwrap();
    assert_eq!(mm.handle_busy_count(handle), 0);
}

#[test]
fn test_guard_and_raw_locks_mix() {
    let mm = manager();
    let handle = mm.new_handle(8).unwrap();
    let outer = mm.lock_handle(handle).unwrap();
    let raw = mm.h_lock(handle).unwrap();
    assert_eq!(raw, outer.address());
    mm.h_unlock(handle).unwrap();
    assert_eq!(mm.handle_busy_count(handle), 1);
    outer.unlock();
    assert_eq!(mm.handle_busy_count(handle), 0);
}

#[test]
fn test_new_handle_clear_is_zeroed() {
    let mm = manager();
    let dirty = mm.new_handle(32).unwrap();
    mm.lock_handle(dirty).unwrap().write(0, &[0xFF; 32]).unwrap();
    mm.free_handle(dirty).unwrap();

    let clean = mm.new_handle_clear(32).unwrap();
    assert_eq!(mm.lock_handle(clean).unwrap().to_vec().unwrap(), vec![0; 32]);
}

#[test]
fn test_copy_handle_is_independent() {
    let mm = manager();
    let original = mm.new_handle(12).unwrap();
    mm.lock_handle(original)
        .unwrap()
        .write(0, b"hello, world")
        .unwrap();

    let copy = mm.copy_handle(original).unwrap().unwrap();
    assert_ne!(copy, original);
    assert_eq!(mm.get_handle_size(copy), 12);
    assert_eq!(
        mm.lock_handle(copy).unwrap().to_vec().unwrap(),
        b"hello, world"
    );

    mm.free_handle(copy).unwrap();
    assert_eq!(
        mm.lock_handle(original).unwrap().to_vec().unwrap(),
        b"hello, world"
    );

    let second = mm.copy_handle(original).unwrap().unwrap();
    mm.free_handle(original).unwrap();
    assert_eq!(
        mm.lock_handle(second).unwrap().to_vec().unwrap(),
        b"hello, world"
    );
}

#[test]
fn test_hand_to_hand_replaces_variable() {
    let mm = manager();
    let original = mm.new_handle(4).unwrap();
    mm.lock_handle(original).unwrap().write(0, b"abcd").unwrap();

    let mut current = original;
    mm.hand_to_hand(&mut current).unwrap();
    assert_ne!(current, original);
    mm.lock_handle(current).unwrap().write(0, b"wxyz").unwrap();

    assert_eq!(mm.lock_handle(original).unwrap().to_vec().unwrap(), b"abcd");
    assert_eq!(mm.lock_handle(current).unwrap().to_vec().unwrap(), b"wxyz");
}

#[test]
fn test_hand_to_hand_empty_fails() {
    let mm = manager();
    let empty = mm.new_empty_handle().unwrap();
    let mut current = empty;
    assert!(mm.hand_to_hand(&mut current).is_err());
    assert_eq!(current, empty);
    assert_eq!(mm.mem_error(), MemErr::NilHandle);
}

#[test]
fn test_set_handle_size_grow_and_shrink() {
    let mm = manager();
    let handle = mm.new_handle(16).unwrap();
    mm.lock_handle(handle)
        .unwrap()
        .write(0, b"0123456789abcdef")
        .unwrap();
    let _neighbour = mm.new_handle(16).unwrap();

    mm.set_handle_size(handle, 200).unwrap();
    assert_eq!(mm.get_handle_size(handle), 200);
    let lock = mm.lock_handle(handle).unwrap();
    assert_eq!(lock.read(0, 16).unwrap(), b"0123456789abcdef");
    assert_eq!(lock.read(16, 184).unwrap(), vec![0; 184]);
    drop(lock);

    mm.set_handle_size(handle, 5).unwrap();
    let lock = mm.lock_handle(handle).unwrap();
    assert_eq!(lock.to_vec().unwrap(), b"01234");
    assert!(lock.read(0, 6).is_err());
    drop(lock);

    assert_eq!(mm.usage().handle_bytes, 5 + 16);
}

#[test]
fn test_locked_handle_grows_only_in_place() {
    let mm = manager();
    let handle = mm.new_handle(16).unwrap();
    let _fence = mm.new_handle(16).unwrap();
    let lock = mm.lock_handle(handle).unwrap();

    let result = mm.set_handle_size(handle, 1024);
    assert!(matches!(result, Err(MemoryError::Locked(_))));
    assert_eq!(mm.mem_error(), MemErr::MemLocked);
    assert_eq!(mm.get_handle_size(handle), 16);

    // Shrinking never moves
    mm.set_handle_size(handle, 8).unwrap();
    assert_eq!(lock.size(), 8);
}

#[test]
fn test_handle_oom_reports_mem_full() {
    let mm = MemoryManager::with_config(MemoryConfig::debug().with_heap_size(4096)).unwrap();
    let result = mm.new_handle(8192);
    assert!(matches!(result, Err(MemoryError::OutOfMemory { .. })));
    assert_eq!(mm.mem_error(), MemErr::MemFull);
    assert_eq!(mm.usage().handle_bytes, 0);
}

#[test]
fn test_huge_handle_sizes_are_out_of_memory() {
    let mm = manager();
    let handle = mm.new_handle(24).unwrap();
    {
        let lock = mm.lock_handle(handle).unwrap();
        lock.write(0, b"relocatable block!").unwrap();
    }
    let before = mm.usage();

    for size in [usize::MAX, usize::MAX - 2] {
        assert!(matches!(
            mm.new_handle(size),
            Err(MemoryError::OutOfMemory { .. })
        ));
        assert!(matches!(
            mm.set_handle_size(handle, size),
            Err(MemoryError::OutOfMemory { .. })
        ));
    }
    assert_eq!(mm.mem_error(), MemErr::MemFull);
    assert_eq!(mm.usage(), before);
    assert_eq!(mm.get_handle_size(handle), 24);
    let lock = mm.lock_handle(handle).unwrap();
    assert_eq!(lock.read(0, 18).unwrap(), b"relocatable block!".to_vec());
}

#[test]
fn test_huge_size_for_empty_handle() {
    let mm = manager();
    let handle = mm.new_empty_handle().unwrap();
    assert!(matches!(
        mm.set_handle_size(handle, usize::MAX),
        Err(MemoryError::OutOfMemory { .. })
    ));
    assert_eq!(mm.get_handle_size(handle), 0);
    assert_eq!(mm.usage().handle_bytes, 0);
}

#[test]
fn test_free_handle_of_locked_handle_refused() {
    let mm = manager();
    let handle = mm.new_handle(8).unwrap();
    mm.h_lock(handle).unwrap();
    assert!(matches!(mm.free_handle(handle), Err(MemoryError::Locked(_))));
    assert!(matches!(mm.empty_handle(handle), Err(MemoryError::Locked(_))));
    mm.h_unlock(handle).unwrap();
    mm.free_handle(handle).unwrap();
    assert_eq!(mm.usage().handle_bytes, 0);
}

#[test]
fn test_handle_metadata_round_trip() {
    let mm = manager();
    let handle = mm.new_handle(8).unwrap();
    assert_eq!(mm.get_handle_name(handle), 0);

    mm.set_handle_owner(handle, 7).unwrap();
    mm.set_handle_name(handle, 0x4672_616D).unwrap();
    mm.set_handle_type(handle, 2).unwrap();

    assert_eq!(mm.get_handle_owner(handle), 7);
    assert_eq!(mm.get_handle_name(handle), 0x4672_616D);
    assert_eq!(mm.get_handle_type(handle), 2);

    assert!(matches!(
        mm.set_handle_name(handle, 0xC000_0000),
        Err(MemoryError::InvalidOperation(_))
    ));
    assert_eq!(mm.get_handle_name(handle), 0x4672_616D);

    // Metadata follows the block through a move
    mm.new_handle(8).unwrap();
    mm.set_handle_size(handle, 4000).unwrap();
    assert_eq!(mm.get_handle_owner(handle), 7);
    assert_eq!(mm.get_handle_name(handle), 0x4672_616D);
}

#[test]
fn test_empty_handle_metadata_setters_fail() {
    let mm = manager();
    let handle = mm.new_empty_handle().unwrap();
    assert_eq!(mm.get_handle_size(handle), 0);
    assert!(mm.set_handle_owner(handle, 1).is_err());
    assert!(mm.h_lock(handle).is_err());
    mm.free_handle(handle).unwrap();
}

#[test]
fn test_freed_handle_is_stale() {
    let mm = manager();
    let handle = mm.new_handle(8).unwrap();
    mm.free_handle(handle).unwrap();

    let recycled = mm.new_handle(8).unwrap();
    assert_ne!(handle, recycled);
    assert!(mm.h_lock(handle).is_err());
    assert_eq!(mm.get_handle_size(recycled), 8);
    // Freeing again is a no-op that leaves the new handle alone
    mm.free_handle(handle).unwrap();
    assert_eq!(mm.get_handle_size(recycled), 8);
}

#[test]
fn test_handle_allocator_trait() {
    fn round_trip(alloc: &dyn HandleAllocator) -> usize {
        let handle = alloc.allocate_handle(10).unwrap();
        alloc.resize_handle(handle, 20).unwrap();
        let address = alloc.lock(handle).unwrap();
        assert_ne!(address, 0);
        alloc.unlock(handle).unwrap();
        let size = alloc.handle_size(handle);
        alloc.deallocate_handle(handle).unwrap();
        size
    }

    let mm = manager();
    assert_eq!(round_trip(&mm), 20);
    assert_eq!(mm.usage().handle_bytes, 0);
}

#[test]
fn test_handles_are_real() {
    let mm = manager();
    let handle = mm.new_handle(1).unwrap();
    assert!(!handle.is_fake());
    assert_eq!(handle.heap(), Some(mm.get_heap()));
    assert!(matches!(handle, Handle::Real(_)));
}
