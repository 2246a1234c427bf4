use super::*;

const NO_WAIT: Duration = Duration::from_millis(0);

fn ids(range: std::ops::Range<u64>) -> Vec<ResourceId> {
    range.map(ResourceId).collect()
}

fn pool_with(max: usize) -> Arc<ResourcePool> {
    let pool = ResourcePool::new(MemoryArena::unbounded());
    pool.resize(ResourceClass::BlockStorage, 32).unwrap();
    pool.set_min_max(ResourceClass::BlockStorage, 0, max).unwrap();
    pool
}

fn fixed(outcome: FixOutcome) -> Vec<ResourceHandle> {
    match outcome {
        FixOutcome::Fixed(h) => h,
        FixOutcome::Exhausted => panic!("expected resources to be fixed"),
    }
}

#[test]
fn block_ids_are_linear_times_depth_plus_offset() {
    let base = ResourceId::for_block(0, 3, 0).0;
    assert_eq!(ResourceId::for_block(5, 3, 2).0 - base, 17);
    assert!(ResourceId::for_block(1, 3, 0) > ResourceId::for_block(0, 3, 2));
    // 3 * 2 + 0 == 2 * 3 + 0, but the depths differ.
    assert_ne!(ResourceId::for_block(3, 2, 0), ResourceId::for_block(2, 3, 0));
    assert_ne!(ResourceId::reader(OwnerId(1)), ResourceId::for_block(0, 2, 1));
}

#[test]
fn fix_is_idempotent_for_the_same_owner() {
    let pool = pool_with(4);
    let a = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..2), NO_WAIT).unwrap());
    let b = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..3), NO_WAIT).unwrap());
    assert!(a[0].same_buffer(&b[0]));
    assert!(a[1].same_buffer(&b[1]));
    assert_eq!(pool.fixed_by(ResourceClass::BlockStorage, OwnerId(1)), 3);
    assert_eq!(pool.live_count(ResourceClass::BlockStorage), 3);
}

#[test]
fn fix_never_exceeds_max() {
    let pool = pool_with(3);
    let outcome = pool
        .fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..4), NO_WAIT)
        .unwrap();
    assert!(matches!(outcome, FixOutcome::Exhausted));
    assert_eq!(pool.fixed_count(ResourceClass::BlockStorage), 0);
}

#[test]
fn contention_times_out_without_partial_pins() {
    let pool = pool_with(3);
    let _held = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..2), NO_WAIT).unwrap());

    let outcome = pool
        .fix(
            ResourceClass::BlockStorage,
            OwnerId(2),
            &ids(10..12),
            Duration::from_millis(10),
        )
        .unwrap();
    assert!(matches!(outcome, FixOutcome::Exhausted));
    assert_eq!(pool.fixed_by(ResourceClass::BlockStorage, OwnerId(2)), 0);
}

#[test]
fn waiting_fix_succeeds_after_release() {
    let pool = pool_with(2);
    let held = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..2), NO_WAIT).unwrap());

    let p2 = Arc::clone(&pool);
    let waiter = std::thread::spawn(move || {
        p2.fix(
            ResourceClass::BlockStorage,
            OwnerId(2),
            &ids(5..7),
            Duration::from_secs(5),
        )
        .unwrap()
    });

    std::thread::sleep(Duration::from_millis(20));
    for h in &held {
        pool.release(h);
    }
    let outcome = waiter.join().unwrap();
    assert_eq!(fixed(outcome).len(), 2);
    assert_eq!(pool.live_count(ResourceClass::BlockStorage), 2);
}

#[test]
fn detached_entries_are_refixed_by_identity() {
    let pool = pool_with(4);
    let h = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(7..8), NO_WAIT).unwrap());
    h[0].with_bytes_mut(|b| b[0] = 42);
    assert!(pool.detach(&h[0], 0));
    assert_eq!(pool.retained_count(ResourceClass::BlockStorage), 1);
    assert_eq!(pool.fixed_count(ResourceClass::BlockStorage), 0);

    let again = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(2), &ids(7..8), NO_WAIT).unwrap());
    assert!(again[0].same_buffer(&h[0]));
    assert_eq!(again[0].with_bytes(|b| b[0]), 42);
}

#[test]
fn detach_keeps_room_for_the_minimum() {
    let pool = pool_with(3);
    let h = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..3), NO_WAIT).unwrap());
    assert!(pool.detach(&h[0], 2));
    assert!(!pool.detach(&h[1], 2));
    assert_eq!(pool.retained_count(ResourceClass::BlockStorage), 1);
}

#[test]
fn resize_requires_idle_pool_and_changes_identity() {
    let pool = pool_with(2);
    let h = fixed(pool.fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..1), NO_WAIT).unwrap());
    assert!(pool.resize(ResourceClass::BlockStorage, 64).is_err());
    pool.release(&h[0]);
    pool.resize(ResourceClass::BlockStorage, 64).unwrap();
    assert_eq!(pool.resize_count(ResourceClass::BlockStorage), 2);
    assert_eq!(pool.live_count(ResourceClass::BlockStorage), 0);

    // Releasing a handle from the previous identity is ignored.
    pool.release(&h[0]);
    pool.set_min_max(ResourceClass::BlockStorage, 1, 2).unwrap();
    assert_eq!(pool.live_count(ResourceClass::BlockStorage), 1);
    assert_eq!(pool.entry_size(ResourceClass::BlockStorage), 64);
}

#[test]
fn set_min_max_trims_free_entries() {
    let pool = pool_with(4);
    pool.set_min_max(ResourceClass::BlockStorage, 4, 4).unwrap();
    assert_eq!(pool.live_count(ResourceClass::BlockStorage), 4);
    pool.set_min_max(ResourceClass::BlockStorage, 1, 2).unwrap();
    assert_eq!(pool.live_count(ResourceClass::BlockStorage), 2);
    assert_eq!(pool.bounds(ResourceClass::BlockStorage), (1, 2));
    assert!(pool.set_min_max(ResourceClass::BlockStorage, 3, 2).is_err());
}

#[test]
fn buffers_are_charged_to_the_arena() {
    let arena = MemoryArena::new(Some(100));
    let pool = ResourcePool::new(Arc::clone(&arena));
    pool.resize(ResourceClass::BlockStorage, 40).unwrap();
    pool.set_min_max(ResourceClass::BlockStorage, 2, 4).unwrap();
    assert_eq!(arena.used(), 80);
    let err = pool
        .fix(ResourceClass::BlockStorage, OwnerId(1), &ids(0..3), NO_WAIT)
        .unwrap_err();
    assert!(err.is_allocation_class());
    assert_eq!(pool.fixed_count(ResourceClass::BlockStorage), 0);
}
