use super::*;
use std::sync::atomic::AtomicUsize;

struct FakeCache {
    held: Mutex<Vec<Allocation>>,
    tier: CostTier,
    cost: f32,
    releases: AtomicUsize,
}

impl FakeCache {
    fn filled(arena: &Arc<MemoryArena>, chunks: usize, chunk: usize, tier: CostTier) -> Arc<Self> {
        let held = (0..chunks)
            .map(|_| arena.try_alloc_quiet(chunk).unwrap())
            .collect();
        Arc::new(Self {
            held: Mutex::new(held),
            tier,
            cost: 1.0,
            releases: AtomicUsize::new(0),
        })
    }
}

impl LowMemoryHandler for FakeCache {
    fn name(&self) -> &str {
        "fake"
    }

    fn tier(&self) -> CostTier {
        self.tier
    }

    fn solicit(&self, _tier: CostTier) -> Option<LowMemOffer> {
        let bytes = self.held.lock().iter().map(Allocation::bytes).sum();
        Some(LowMemOffer {
            bytes,
            cost: self.cost,
        })
    }

    fn release(&self, _offer: LowMemOffer) -> usize {
        self.releases.fetch_add(1, Ordering::AcqRel);
        self.held.lock().pop().map_or(0, |a| a.bytes())
    }
}

#[test]
fn allocation_returns_bytes_on_drop() {
    let arena = MemoryArena::new(Some(1000));
    let a = arena.try_alloc(600, CostTier::Cheap).unwrap();
    assert_eq!(arena.used(), 600);
    assert!(arena.try_alloc(600, CostTier::Cheap).is_err());
    drop(a);
    assert_eq!(arena.used(), 0);
    assert_eq!(arena.peak(), 600);
}

#[test]
fn handlers_free_memory_for_tolerant_allocations() {
    let arena = MemoryArena::new(Some(1000));
    let cache = FakeCache::filled(&arena, 4, 250, CostTier::Moderate);
    let handler: Arc<dyn LowMemoryHandler> = cache.clone();
    arena.register(&handler);

    assert!(arena.try_alloc(300, CostTier::Cheap).is_err());
    assert_eq!(cache.releases.load(Ordering::Acquire), 0);

    let a = arena.try_alloc(300, CostTier::Moderate).unwrap();
    assert_eq!(a.bytes(), 300);
    assert_eq!(cache.releases.load(Ordering::Acquire), 2);
    assert!(arena.used() <= 1000);
}

#[test]
fn deregistered_handlers_are_not_called() {
    let arena = MemoryArena::new(Some(500));
    let cache = FakeCache::filled(&arena, 2, 250, CostTier::Cheap);
    let handler: Arc<dyn LowMemoryHandler> = cache.clone();
    arena.register(&handler);
    arena.deregister("fake");

    assert!(arena.try_alloc(100, CostTier::Expensive).is_err());
    assert_eq!(cache.releases.load(Ordering::Acquire), 0);
}

#[test]
fn quiet_allocation_never_solicits() {
    let arena = MemoryArena::new(Some(500));
    let cache = FakeCache::filled(&arena, 2, 250, CostTier::Cheap);
    let handler: Arc<dyn LowMemoryHandler> = cache.clone();
    arena.register(&handler);

    assert!(arena.try_alloc_quiet(1).is_err());
    assert_eq!(cache.releases.load(Ordering::Acquire), 0);
}

#[test]
fn pool_tracks_its_own_usage() {
    let arena = MemoryArena::unbounded();
    let pool = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let base = arena.used();
    let a = pool.alloc(128).unwrap();
    let b = pool.alloc(64).unwrap();
    assert_eq!(pool.used(), 192);
    assert_eq!(arena.used(), base + 192);
    drop(a);
    assert_eq!(pool.used(), 64);
    assert_eq!(pool.peak(), 192);
    drop(b);
    assert_eq!(arena.used(), base);
}

#[test]
fn pool_creation_fails_when_arena_is_full() {
    let arena = MemoryArena::new(Some(10));
    assert!(MemoryPool::new(&arena, "state", CostTier::Cheap).is_err());
}
