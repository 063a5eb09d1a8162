/*!
 * Heap Context Tests
 * The current heap survives every call, including failing ones
 */

use newton_memory::memory::{heap_for_address, HeapConfig, MemoryConfig, MemoryManager};
use pretty_assertions::assert_eq;
use std::thread;

fn manager() -> MemoryManager {
    MemoryManager::with_config(MemoryConfig::debug().with_heap_size(16 * 1024)).unwrap()
}

#[test]
fn test_get_and_set_heap() {
    let mm = manager();
    let default_heap = mm.get_heap();
    let other = mm.create_heap(HeapConfig::new(8 * 1024)).unwrap();

    assert_eq!(mm.set_heap(other).unwrap(), default_heap);
    assert_eq!(mm.get_heap(), other);
    let ptr = mm.new_ptr(32).unwrap();
    assert_eq!(heap_for_address(ptr), Some(other));

    assert_eq!(mm.set_heap(default_heap).unwrap(), other);
    assert!(mm.set_heap(9999).is_err());
    assert_eq!(mm.get_heap(), default_heap);
}

#[test]
fn test_cross_heap_calls_restore_context() {
    let mm = manager();
    let other = mm.create_heap(HeapConfig::new(8 * 1024).with_semaphore()).unwrap();

    let (ptr, handle) = {
        let _switch = mm.switch_heap(other).unwrap();
        (mm.new_ptr(64).unwrap(), mm.new_handle(64).unwrap())
    };
    let home = mm.get_heap();
    assert_ne!(home, other);

    // Operations resolve the block's own heap and switch back afterwards
    mm.write_ptr(ptr, 0, &[1; 64]).unwrap();
    mm.realloc_ptr(ptr, 128).unwrap();
    assert_eq!(mm.get_heap(), home);
    mm.set_handle_size(handle, 256).unwrap();
    assert_eq!(mm.get_heap(), home);
    mm.h_lock(handle).unwrap();
    mm.h_unlock(handle).unwrap();
    mm.free_handle(handle).unwrap();
    assert_eq!(mm.get_heap(), home);
}

#[test]
fn test_failing_calls_restore_context() {
    let mm = manager();
    let small = mm.create_heap(HeapConfig::new(1024)).unwrap();
    let home = mm.get_heap();

    let (ptr, handle) = {
        let _switch = mm.switch_heap(small).unwrap();
        (mm.new_ptr(512).unwrap(), mm.new_handle(256).unwrap())
    };

    assert!(mm.realloc_ptr(ptr, 4096).is_err());
    assert_eq!(mm.get_heap(), home);
    assert!(mm.set_handle_size(handle, 4096).is_err());
    assert_eq!(mm.get_heap(), home);
    mm.h_lock(handle).unwrap();
    assert!(mm.free_handle(handle).is_err());
    assert_eq!(mm.get_heap(), home);

    {
        let _switch = mm.switch_heap(small).unwrap();
        assert!(mm.new_ptr(4096).is_err());
        assert!(mm.new_handle(4096).is_err());
        assert_eq!(mm.get_heap(), small);
    }
    assert_eq!(mm.get_heap(), home);
}

#[test]
fn test_nested_switches_unwind() {
    let mm = manager();
    let a = mm.create_heap(HeapConfig::new(1024)).unwrap();
    let b = mm.create_heap(HeapConfig::new(1024)).unwrap();
    let home = mm.get_heap();

    {
        let outer = mm.switch_heap(a).unwrap();
        assert_eq!(outer.previous(), home);
        {
            let _inner = mm.switch_heap(b).unwrap();
            assert_eq!(mm.get_heap(), b);
        }
        assert_eq!(mm.get_heap(), a);
    }
    assert_eq!(mm.get_heap(), home);
}

#[test]
fn test_context_is_per_thread() {
    let mm = manager();
    let other = mm.create_heap(HeapConfig::new(4096)).unwrap();
    let home = mm.get_heap();
    mm.set_heap(other).unwrap();

    let worker = mm.clone();
    let seen = thread::spawn(move || worker.get_heap()).join().unwrap();
    assert_eq!(seen, home);
    assert_eq!(mm.get_heap(), other);
}

#[test]
fn test_relocation_heap_receives_handles() {
    let mm = manager();
    let masters = mm.create_heap(HeapConfig::new(8 * 1024)).unwrap();
    let pointers = mm
        .create_heap(HeapConfig::new(8 * 1024).relocating_into(masters))
        .unwrap();

    let _switch = mm.switch_heap(pointers).unwrap();
    let ptr = mm.new_ptr(16).unwrap();
    let handle = mm.new_handle(16).unwrap();

    assert_eq!(heap_for_address(ptr), Some(pointers));
    assert_eq!(handle.heap(), Some(masters));
    let address = mm.h_lock(handle).unwrap();
    assert_eq!(heap_for_address(address), Some(masters));
    mm.h_unlock(handle).unwrap();
    assert_eq!(mm.get_heap(), pointers);
}
