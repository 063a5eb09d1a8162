/*!
 * Fake Handle Tests
 * Aliases over static memory never allocate and never write
 */

use newton_memory::memory::{FakeBlock, Handle, MemoryConfig, MemoryError, MemoryManager};
use pretty_assertions::assert_eq;

static ROM_IMAGE: [u8; 16] = *b"NewtonROM v2.1\0\0";

fn manager() -> MemoryManager {
    MemoryManager::with_config(MemoryConfig::debug().with_heap_size(64 * 1024)).unwrap()
}

#[test]
fn test_lock_returns_alias_address() {
    let mm = manager();
    let fake = mm.new_fake_handle(&ROM_IMAGE);
    assert!(fake.is_fake());
    assert_eq!(fake.heap(), None);

    let address = mm.h_lock(fake).unwrap();
    assert_eq!(address, ROM_IMAGE.as_ptr() as usize);
    assert_eq!(mm.handle_busy_count(fake), 0);
    mm.h_unlock(fake).unwrap();
}

#[test]
fn test_size_comes_from_alias() {
    let mm = manager();
    let fake = mm.new_fake_handle(&ROM_IMAGE);
    assert_eq!(mm.get_handle_size(fake), ROM_IMAGE.len());
}

#[test]
fn test_fake_handle_allocates_nothing() {
    let mm = manager();
    let before = mm.usage();
    let fake = mm.new_fake_handle(&ROM_IMAGE);
    mm.free_handle(fake).unwrap();
    mm.free_handle(fake).unwrap();
    assert_eq!(mm.usage(), before);
    assert!(mm.heap_blocks(mm.get_heap()).unwrap().is_empty());
}

#[test]
fn test_mutations_are_refused_and_memory_untouched() {
    let mm = manager();
    let fake = mm.new_fake_handle(&ROM_IMAGE);
    let snapshot = ROM_IMAGE;

    assert!(matches!(
        mm.set_handle_size(fake, 4),
        Err(MemoryError::InvalidOperation(_))
    ));
    assert!(mm.empty_handle(fake).is_err());
    assert!(mm.set_handle_owner(fake, 9).is_err());
    assert!(mm.set_handle_name(fake, 0x524F_4D21).is_err());
    assert!(mm.set_handle_type(fake, 1).is_err());
    {
        let lock = mm.lock_handle(fake).unwrap();
        assert!(lock.write(0, b"x").is_err());
        assert_eq!(lock.to_vec().unwrap(), snapshot);
    }
    mm.h_lock(fake).unwrap();
    mm.h_unlock(fake).unwrap();
    mm.free_handle(fake).unwrap();

    assert_eq!(ROM_IMAGE, snapshot);
    assert_eq!(mm.get_handle_size(fake), 16);
    assert_eq!(mm.get_handle_owner(fake), 0);
    assert_eq!(mm.get_handle_name(fake), 0);
}

#[test]
fn test_copy_of_fake_is_real() {
    let mm = manager();
    let fake = mm.new_fake_handle(&ROM_IMAGE);
    let copy = mm.copy_handle(fake).unwrap().unwrap();

    assert!(!copy.is_fake());
    assert_eq!(mm.usage().handle_bytes, ROM_IMAGE.len());
    {
        let lock = mm.lock_handle(copy).unwrap();
        assert_eq!(lock.to_vec().unwrap(), ROM_IMAGE);
        lock.write(0, b"Patched").unwrap();
    }
    assert_eq!(&ROM_IMAGE[..7], b"NewtonR");
}

#[test]
fn test_fake_handles_compare_by_identity() {
    static SAME_BYTES: [u8; 16] = *b"NewtonROM v2.1\0\0";

    let a = Handle::from(FakeBlock::new(&ROM_IMAGE));
    let b = Handle::from(FakeBlock::new(&ROM_IMAGE));
    let c = Handle::from(FakeBlock::new(&SAME_BYTES));
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn test_empty_alias() {
    static NOTHING: [u8; 0] = [];
    let mm = manager();
    let fake = mm.new_fake_handle(&NOTHING);
    assert_eq!(mm.get_handle_size(fake), 0);
    assert_eq!(mm.copy_handle(fake).unwrap().map(|h| h.is_fake()), Some(false));
}
