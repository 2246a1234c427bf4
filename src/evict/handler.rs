//! Page block cache shared by compositing workers and the low-memory handler.
//!
//! Lock order for workers is block slot, then purge list or spill file (never both). The
//! eviction path only ever `try_lock`s, so it can run on a thread that already holds a slot or
//! a pool lock without deadlocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backdrop::block::{BlockBody, BlockTable};
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::foundation::memory::{CostTier, LowMemOffer, LowMemoryHandler};
use crate::page::stats::CacheCounters;
use crate::region::lifecycle::Retention;
use crate::spill::file::{SpillFile, SpillSlot};

/// Cost quoted for purging backdrop blocks: cheaper than dropping decoded images, dearer than
/// glyph caches.
const PURGE_COST: f32 = 2.0;

struct PurgeEntry {
    table: Weak<BlockTable>,
    slot: usize,
    bytes: usize,
}

impl PurgeEntry {
    fn is(&self, table: &BlockTable, slot: usize) -> bool {
        self.slot == slot && std::ptr::eq(self.table.as_ptr(), table)
    }
}

#[derive(Default)]
struct PurgeList {
    entries: VecDeque<PurgeEntry>,
    total_bytes: usize,
}

impl PurgeList {
    fn remove_at(&mut self, i: usize) {
        if let Some(e) = self.entries.remove(i) {
            self.total_bytes -= e.bytes;
        }
    }
}

pub(crate) struct PageCache {
    purge: Mutex<PurgeList>,
    spill: Mutex<Option<SpillFile>>,
    has_spill: AtomicBool,
    retention: AtomicU8,
    pub(crate) counters: CacheCounters,
}

impl PageCache {
    pub(crate) fn new(spill: Option<SpillFile>) -> Self {
        Self {
            purge: Mutex::new(PurgeList::default()),
            has_spill: AtomicBool::new(spill.is_some()),
            spill: Mutex::new(spill),
            retention: AtomicU8::new(Retention::None as u8),
            counters: CacheCounters::default(),
        }
    }

    pub(crate) fn retention(&self) -> Retention {
        Retention::from_u8(self.retention.load(Ordering::Acquire))
    }

    pub(crate) fn set_retention(&self, retention: Retention) {
        self.retention.store(retention as u8, Ordering::Release);
    }

    pub(crate) fn has_spill(&self) -> bool {
        self.has_spill.load(Ordering::Acquire)
    }

    pub(crate) fn push_purgeable(&self, table: &Arc<BlockTable>, slot: usize, bytes: usize) {
        let mut list = self.purge.lock();
        list.entries.push_back(PurgeEntry {
            table: Arc::downgrade(table),
            slot,
            bytes,
        });
        list.total_bytes += bytes;
    }

    pub(crate) fn remove_purgeable(&self, table: &BlockTable, slot: usize) {
        let mut list = self.purge.lock();
        if let Some(i) = list.entries.iter().position(|e| e.is(table, slot)) {
            list.remove_at(i);
        }
    }

    pub(crate) fn purgeable_bytes(&self) -> usize {
        self.purge.lock().total_bytes
    }

    /// `(table, slot)` of every listed block, oldest first.
    pub(crate) fn purgeable_entries(&self) -> Vec<(Weak<BlockTable>, usize)> {
        self.purge
            .lock()
            .entries
            .iter()
            .map(|e| (Weak::clone(&e.table), e.slot))
            .collect()
    }

    /// Page a body out. `None` when the page has no spill file.
    pub(crate) fn spill_write(&self, bytes: &[u8]) -> BackdropResult<Option<SpillSlot>> {
        let mut spill = self.spill.lock();
        let Some(file) = spill.as_mut() else {
            return Ok(None);
        };
        let slot = file.write(bytes)?;
        CacheCounters::bump(&self.counters.blocks_spilled, 1);
        CacheCounters::bump(&self.counters.bytes_spilled, bytes.len() as u64);
        Ok(Some(slot))
    }

    pub(crate) fn spill_read(&self, slot: SpillSlot, buf: &mut [u8]) -> BackdropResult<()> {
        let mut spill = self.spill.lock();
        match spill.as_mut() {
            Some(file) => file.read(slot, buf),
            None => Err(BackdropError::validation(
                "spilled block on a page without a spill file",
            )),
        }
    }

    pub(crate) fn spill_free(&self, slot: SpillSlot) {
        if let Some(file) = self.spill.lock().as_mut() {
            file.free(slot);
        }
    }

    pub(crate) fn close_spill(&self) -> BackdropResult<()> {
        self.has_spill.store(false, Ordering::Release);
        let file = self.spill.lock().take();
        match file {
            Some(f) => {
                tracing::debug!(path = %f.path().display(), bytes = f.len_on_disk(), "closing spill file");
                f.close()
            }
            None => Ok(()),
        }
    }

    /// Bytes the spill file occupies on disk, freed slots included.
    pub(crate) fn spill_len(&self) -> u64 {
        self.spill.lock().as_ref().map_or(0, SpillFile::len_on_disk)
    }

    pub(crate) fn solicit(&self) -> Option<LowMemOffer> {
        if self.retention() == Retention::None {
            return None;
        }
        let list = self.purge.try_lock()?;
        (list.total_bytes > 0).then_some(LowMemOffer {
            bytes: list.total_bytes,
            cost: PURGE_COST,
        })
    }

    /// Evict purgeable blocks, oldest first, until `want` bytes are gone. Never blocks.
    pub(crate) fn evict(&self, want: usize) -> usize {
        let Some(mut list) = self.purge.try_lock() else {
            return 0;
        };

        let mut freed = 0;
        let mut i = 0;
        while i < list.entries.len() && freed < want {
            let (table, slot, bytes) = {
                let e = &list.entries[i];
                (e.table.upgrade(), e.slot, e.bytes)
            };
            let Some(table) = table else {
                list.remove_at(i);
                continue;
            };
            let Ok(slot_lock) = table.slot(slot) else {
                list.remove_at(i);
                continue;
            };
            let Some(mut guard) = slot_lock.try_lock() else {
                i += 1;
                continue;
            };

            let block = match guard.as_mut() {
                Some(b) if matches!(b.body, BlockBody::Stored { .. }) => b,
                _ => {
                    list.remove_at(i);
                    continue;
                }
            };
            if block.read_pins > 0 {
                i += 1;
                continue;
            }

            if self.has_spill() {
                let Some(mut spill) = self.spill.try_lock() else {
                    i += 1;
                    continue;
                };
                let written = match (&block.body, spill.as_mut()) {
                    (BlockBody::Stored { bytes, .. }, Some(file)) => Some(file.write(bytes)),
                    _ => None,
                };
                match written {
                    Some(Ok(slot)) => {
                        block.body = BlockBody::Spilled(slot);
                        CacheCounters::bump(&self.counters.blocks_spilled, 1);
                        CacheCounters::bump(&self.counters.bytes_spilled, bytes as u64);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "spill write failed, dropping block");
                        *guard = None;
                        CacheCounters::bump(&self.counters.blocks_dropped, 1);
                    }
                    None => {
                        *guard = None;
                        CacheCounters::bump(&self.counters.blocks_dropped, 1);
                    }
                }
            } else {
                *guard = None;
                CacheCounters::bump(&self.counters.blocks_dropped, 1);
            }

            list.remove_at(i);
            freed += bytes;
        }

        if freed > 0 {
            tracing::debug!(freed, remaining = list.total_bytes, "evicted backdrop blocks");
        }
        freed
    }
}

/// Low-memory handler registered once per [`BackdropSystem`](crate::BackdropSystem); it acts on
/// whichever page is current.
pub(crate) struct BackdropLowMemory {
    current: Mutex<Option<Weak<PageCache>>>,
}

impl BackdropLowMemory {
    pub(crate) const NAME: &'static str = "backdrop-blocks";

    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    pub(crate) fn attach(&self, cache: &Arc<PageCache>) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|w| w.strong_count() > 0) {
            tracing::warn!("replacing the page the backdrop low-memory handler acts on");
        }
        *current = Some(Arc::downgrade(cache));
    }

    pub(crate) fn detach(&self, cache: &Arc<PageCache>) {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(cache)))
        {
            *current = None;
        }
    }

    fn page(&self) -> Option<Arc<PageCache>> {
        self.current.try_lock()?.as_ref()?.upgrade()
    }
}

impl LowMemoryHandler for BackdropLowMemory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tier(&self) -> CostTier {
        CostTier::Moderate
    }

    fn solicit(&self, _tier: CostTier) -> Option<LowMemOffer> {
        self.page()?.solicit()
    }

    fn release(&self, offer: LowMemOffer) -> usize {
        self.page().map_or(0, |page| page.evict(offer.bytes))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/evict/handler.rs"]
mod tests;
