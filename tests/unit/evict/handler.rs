use super::*;
use crate::backdrop::block::{Block, BlockState, BlockStatus};
use crate::backdrop::layer::LayerId;
use crate::foundation::memory::{MemoryArena, MemoryPool};

fn temp_dir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "backdrop_{name}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ))
}

fn stored_table(cache: &PageCache, data: &MemoryPool, n: usize) -> Arc<BlockTable> {
    let table = Arc::new(BlockTable::new(LayerId::new(0, 1), n));
    for i in 0..n {
        let bytes: Arc<[u8]> = vec![i as u8; 100].into();
        *table.slot(i).unwrap().lock() = Some(Block {
            bx: i as u32,
            by: 0,
            state: BlockState::Complete,
            body: BlockBody::Stored {
                bytes,
                _alloc: data.alloc(100).unwrap(),
            },
            read_pins: 0,
        });
        cache.push_purgeable(&table, i, 100);
    }
    table
}

fn status(table: &BlockTable, i: usize) -> BlockStatus {
    table
        .slot(i)
        .unwrap()
        .lock()
        .as_ref()
        .map_or(BlockStatus::Absent, Block::status)
}

#[test]
fn no_offer_without_retention() {
    let arena = MemoryArena::unbounded();
    let data = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let cache = PageCache::new(None);
    let _t = stored_table(&cache, &data, 2);
    assert_eq!(cache.solicit(), None);

    cache.set_retention(Retention::Band);
    let offer = cache.solicit().unwrap();
    assert_eq!(offer.bytes, 200);
}

#[test]
fn eviction_without_spill_drops_oldest_first() {
    let arena = MemoryArena::unbounded();
    let data = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let cache = PageCache::new(None);
    cache.set_retention(Retention::Page);
    let table = stored_table(&cache, &data, 3);
    assert_eq!(data.used(), 300);

    assert_eq!(cache.evict(150), 200);
    assert_eq!(status(&table, 0), BlockStatus::Absent);
    assert_eq!(status(&table, 1), BlockStatus::Absent);
    assert_eq!(status(&table, 2), BlockStatus::CompleteInMemory);
    assert_eq!(cache.purgeable_bytes(), 100);
    assert_eq!(data.used(), 100);
    assert_eq!(cache.counters.snapshot().blocks_dropped, 2);
}

#[test]
fn eviction_with_spill_pages_out() {
    let dir = temp_dir("evict_spill");
    let arena = MemoryArena::unbounded();
    let data = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let cache = PageCache::new(Some(SpillFile::open(&dir).unwrap()));
    cache.set_retention(Retention::Band);
    let table = stored_table(&cache, &data, 2);

    assert_eq!(cache.evict(usize::MAX), 200);
    assert_eq!(status(&table, 1), BlockStatus::CompleteOnDisk);
    let s = cache.counters.snapshot();
    assert_eq!((s.blocks_spilled, s.bytes_spilled), (2, 200));

    let slot = match &table.slot(1).unwrap().lock().as_ref().unwrap().body {
        BlockBody::Spilled(slot) => *slot,
        _ => panic!("expected a spilled body"),
    };
    let mut buf = vec![0u8; 100];
    cache.spill_read(slot, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 1));

    cache.close_spill().unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn busy_or_pinned_blocks_are_skipped() {
    let arena = MemoryArena::unbounded();
    let data = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let cache = PageCache::new(None);
    cache.set_retention(Retention::Band);
    let table = stored_table(&cache, &data, 2);

    table.slot(1).unwrap().lock().as_mut().unwrap().read_pins = 1;
    let held = table.slot(0).unwrap().lock();
    assert_eq!(cache.evict(usize::MAX), 0);
    drop(held);
    assert_eq!(cache.evict(usize::MAX), 100);
    assert_eq!(status(&table, 1), BlockStatus::CompleteInMemory);
}

#[test]
fn dead_tables_fall_out_of_the_list() {
    let arena = MemoryArena::unbounded();
    let data = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let cache = PageCache::new(None);
    cache.set_retention(Retention::Band);
    let table = stored_table(&cache, &data, 2);
    cache.remove_purgeable(&table, 0);
    assert_eq!(cache.purgeable_entries().len(), 1);
    drop(table);
    assert_eq!(cache.evict(usize::MAX), 0);
    assert_eq!(cache.purgeable_bytes(), 0);
}

#[test]
fn handler_reaches_the_attached_page_through_the_arena() {
    let arena = MemoryArena::new(Some(1000));
    let data = MemoryPool::new(&arena, "data", CostTier::Moderate).unwrap();
    let cache = Arc::new(PageCache::new(None));
    cache.set_retention(Retention::Band);
    let _table = stored_table(&cache, &data, 3);

    let handler = Arc::new(BackdropLowMemory::new());
    handler.attach(&cache);
    let dyn_handler: Arc<dyn LowMemoryHandler> = handler.clone();
    arena.register(&dyn_handler);

    // 256 pool overhead + 300 stored; 600 more only fits after eviction.
    let big = arena.try_alloc(600, CostTier::Moderate).unwrap();
    assert_eq!(big.bytes(), 600);
    assert!(cache.purgeable_bytes() < 300);

    handler.detach(&cache);
    assert_eq!(handler.solicit(CostTier::Expensive), None);
}
