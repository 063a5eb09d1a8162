/*!
 * Pointer Tests
 * Fixed-address allocation, resize, metadata and exhaustion
 */

use newton_memory::memory::{
    MemErr, MemoryConfig, MemoryError, MemoryManager, PointerAllocator,
};
use newton_memory::NIL;
use pretty_assertions::assert_eq;

fn manager(heap_size: usize) -> MemoryManager {
    MemoryManager::with_config(MemoryConfig::debug().with_heap_size(heap_size)).unwrap()
}

#[test]
fn test_new_ptr_and_free_restore_usage() {
    let mm = manager(64 * 1024);
    let baseline = mm.usage();

    let ptr = mm.new_ptr(100).unwrap();
    assert_ne!(ptr, NIL);
    assert_eq!(mm.get_ptr_size(ptr), 100);
    assert_eq!(mm.usage().pointer_bytes, baseline.pointer_bytes + 100);

    mm.free_ptr(ptr).unwrap();
    assert_eq!(mm.usage(), baseline);
    assert_eq!(mm.get_ptr_size(ptr), 0);
}

#[test]
fn test_new_ptr_clear_is_zeroed() {
    let mm = manager(64 * 1024);
    let dirty = mm.new_ptr(64).unwrap();
    mm.write_ptr(dirty, 0, &[0xAB; 64]).unwrap();
    mm.free_ptr(dirty).unwrap();

    let clean = mm.new_ptr_clear(64).unwrap();
    assert_eq!(mm.read_ptr(clean, 0, 64).unwrap(), vec![0u8; 64]);
}

#[test]
fn test_zero_sized_pointer() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(0).unwrap();
    assert_ne!(ptr, NIL);
    assert_eq!(mm.get_ptr_size(ptr), 0);
    mm.free_ptr(ptr).unwrap();
    assert_eq!(mm.usage().pointer_bytes, 0);
}

#[test]
fn test_free_nil_and_unknown_are_noops() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(16).unwrap();

    mm.free_ptr(NIL).unwrap();
    mm.free_ptr(0x10).unwrap();
    mm.free_ptr(ptr + 8).unwrap();

    assert_eq!(mm.get_ptr_size(ptr), 16);
    assert_eq!(mm.get_ptr_size(NIL), 0);
}

#[test]
fn test_double_free_is_ignored() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(16).unwrap();
    mm.free_ptr(ptr).unwrap();
    mm.free_ptr(ptr).unwrap();
    assert_eq!(mm.usage().pointer_bytes, 0);
}

#[test]
fn test_realloc_grow_preserves_prefix() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(8).unwrap();
    mm.write_ptr(ptr, 0, b"newton!!").unwrap();
    // Block right behind it so growth cannot happen in place
    let fence = mm.new_ptr(8).unwrap();

    let grown = mm.realloc_ptr(ptr, 256).unwrap();
    assert_eq!(mm.get_ptr_size(grown), 256);
    assert_eq!(mm.read_ptr(grown, 0, 8).unwrap(), b"newton!!");
    assert_eq!(mm.usage().pointer_bytes, 256 + 8);

    mm.free_ptr(fence).unwrap();
    mm.free_ptr(grown).unwrap();
    assert_eq!(mm.usage().pointer_bytes, 0);
}

#[test]
fn test_realloc_shrink_truncates() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(32).unwrap();
    let data: Vec<u8> = (0..32).collect();
    mm.write_ptr(ptr, 0, &data).unwrap();

    let shrunk = mm.realloc_ptr(ptr, 10).unwrap();
    assert_eq!(mm.get_ptr_size(shrunk), 10);
    assert_eq!(mm.read_ptr(shrunk, 0, 10).unwrap(), &data[..10]);
    assert!(mm.read_ptr(shrunk, 0, 11).is_err());
    assert_eq!(mm.usage().pointer_bytes, 10);
}

#[test]
fn test_realloc_nil_allocates() {
    let mm = manager(64 * 1024);
    let ptr = mm.realloc_ptr(NIL, 40).unwrap();
    assert_ne!(ptr, NIL);
    assert_eq!(mm.get_ptr_size(ptr), 40);
}

#[test]
fn test_failed_realloc_leaves_original() {
    let mm = manager(4096);
    let ptr = mm.new_ptr(64).unwrap();
    mm.write_ptr(ptr, 0, &[7; 64]).unwrap();
    let before = mm.usage();

    let result = mm.realloc_ptr(ptr, 1 << 20);
    assert!(matches!(result, Err(MemoryError::OutOfMemory { .. })));
    assert_eq!(mm.get_ptr_size(ptr), 64);
    assert_eq!(mm.read_ptr(ptr, 0, 64).unwrap(), vec![7; 64]);
    assert_eq!(mm.usage(), before);
}

#[test]
fn test_huge_requests_are_out_of_memory() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(32).unwrap();
    mm.write_ptr(ptr, 0, &[5; 32]).unwrap();
    let before = mm.usage();

    for size in [usize::MAX, usize::MAX - 2, usize::MAX / 2] {
        assert!(matches!(
            mm.new_ptr(size),
            Err(MemoryError::OutOfMemory { requested, .. }) if requested == size
        ));
        assert!(matches!(
            mm.new_ptr_clear(size),
            Err(MemoryError::OutOfMemory { .. })
        ));
        assert!(matches!(
            mm.realloc_ptr(ptr, size),
            Err(MemoryError::OutOfMemory { .. })
        ));
    }
    assert_eq!(mm.mem_error(), MemErr::MemFull);
    assert_eq!(mm.usage(), before);
    assert_eq!(mm.get_ptr_size(ptr), 32);
    assert_eq!(mm.read_ptr(ptr, 0, 32).unwrap(), vec![5; 32]);
}

#[test]
fn test_huge_request_on_boot_pool() {
    let mm = MemoryManager::with_config(MemoryConfig::debug().booting()).unwrap();
    let ptr = mm.new_ptr(16).unwrap();

    assert!(matches!(
        mm.new_ptr(usize::MAX),
        Err(MemoryError::OutOfMemory { .. })
    ));
    assert!(matches!(
        mm.realloc_ptr(ptr, usize::MAX - 2),
        Err(MemoryError::OutOfMemory { .. })
    ));
    assert_eq!(mm.get_ptr_size(ptr), 16);
    assert_eq!(mm.usage().pointer_bytes, 16);
}

#[test]
fn test_exhaustion_leaves_counters_unchanged() {
    let mm = manager(4096);
    let first = mm.new_ptr(3000).unwrap();
    let before = mm.usage();

    let result = mm.new_ptr(2000);
    match result {
        Err(MemoryError::OutOfMemory {
            requested,
            available,
            ..
        }) => {
            assert_eq!(requested, 2000);
            assert!(available < 2000);
        }
        other => panic!("expected OutOfMemory, got {:?}", other),
    }
    assert_eq!(mm.usage(), before);
    assert_eq!(mm.get_ptr_size(first), 3000);
}

#[test]
fn test_explicit_name_round_trip() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(16).unwrap();
    // Debug builds stamp a call-site hash; it never reads back as a name
    assert_eq!(mm.get_ptr_name(ptr), 0);

    mm.set_ptr_name(ptr, 0x6672_6D65).unwrap();
    assert_eq!(mm.get_ptr_name(ptr), 0x6672_6D65);
}

#[test]
fn test_name_with_top_bit_is_refused() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(16).unwrap();
    mm.set_ptr_name(ptr, 0x7FFF_FFFF).unwrap();

    assert!(matches!(
        mm.set_ptr_name(ptr, 0x8000_0001),
        Err(MemoryError::InvalidOperation(_))
    ));
    assert_eq!(mm.mem_error(), MemErr::NilHandle);
    assert_eq!(mm.get_ptr_name(ptr), 0x7FFF_FFFF);
}

#[test]
fn test_owner_and_type_round_trip() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(16).unwrap();
    mm.set_ptr_owner(ptr, 42).unwrap();
    mm.set_ptr_type(ptr, 3).unwrap();
    assert_eq!(mm.get_ptr_owner(ptr), 42);
    assert_eq!(mm.get_ptr_type(ptr), 3);

    assert!(matches!(
        mm.set_ptr_owner(NIL, 1),
        Err(MemoryError::InvalidAddress(0))
    ));
    assert_eq!(mm.get_ptr_owner(NIL), 0);
}

#[test]
fn test_debug_hash_recorded_on_block() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(16).unwrap();
    let blocks = mm.heap_blocks(mm.get_heap()).unwrap();
    let block = blocks.iter().find(|b| b.address == ptr).unwrap();
    assert!(block.debug_hash.is_some());
    assert_eq!(block.name, 0);
    assert_eq!(block.busy_count, 1);
}

#[test]
fn test_release_config_skips_debug_hash() {
    let mm = MemoryManager::with_config(MemoryConfig::release()).unwrap();
    let ptr = mm.new_ptr(16).unwrap();
    let blocks = mm.heap_blocks(mm.get_heap()).unwrap();
    let block = blocks.iter().find(|b| b.address == ptr).unwrap();
    assert_eq!(block.debug_hash, None);
}

#[test]
fn test_pointer_allocator_trait() {
    fn churn(alloc: &dyn PointerAllocator) -> usize {
        let a = alloc.allocate(24).unwrap();
        let b = alloc.reallocate(a, 48).unwrap();
        let size = alloc.block_size(b);
        alloc.deallocate(b).unwrap();
        size
    }

    let mm = manager(64 * 1024);
    assert_eq!(churn(&mm), 48);
    assert_eq!(mm.usage().total(), 0);
}

#[test]
fn test_byte_access_bounds() {
    let mm = manager(64 * 1024);
    let ptr = mm.new_ptr(8).unwrap();
    assert!(mm.write_ptr(ptr, 4, &[1; 5]).is_err());
    assert!(mm.read_ptr(ptr, 9, 0).is_err());
    mm.write_ptr(ptr, 4, &[1; 4]).unwrap();
    assert_eq!(mm.read_ptr(ptr, 4, 4).unwrap(), vec![1; 4]);
}
