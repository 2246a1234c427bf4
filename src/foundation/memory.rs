//! Byte-budget memory accounting plus the low-memory handler registry.
//!
//! Every buffer the cache keeps is charged to a [`MemoryArena`] through an RAII [`Allocation`].
//! When a charge would exceed the arena limit, registered [`LowMemoryHandler`]s are solicited
//! for offers and the cheapest one is asked to release memory before the charge is retried.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::foundation::error::{BackdropError, BackdropResult};

const MAX_LOW_MEMORY_ROUNDS: usize = 64;
const POOL_OVERHEAD_BYTES: usize = 256;

/// Cost tier of a low-memory action. Handlers only run for allocations that tolerate their tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum CostTier {
    /// Dropping caches that are trivially rebuilt.
    Cheap,
    /// Paging data to disk or forcing recompositing.
    Moderate,
    /// Anything goes; used by forced reserves.
    Expensive,
}

/// What a handler is prepared to give up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LowMemOffer {
    /// Bytes that could be released.
    pub bytes: usize,
    /// Relative cost of releasing them; the cheapest offer wins.
    pub cost: f32,
}

/// A `(costTier, solicit, release)` triple registered with a [`MemoryArena`].
///
/// Implementations must never block: they are called from whatever thread hit the limit, which
/// may be holding locks of its own.
pub trait LowMemoryHandler: Send + Sync {
    /// Registry key.
    fn name(&self) -> &str;
    /// Tier this handler works at.
    fn tier(&self) -> CostTier;
    /// Offer memory, or `None` to sit this round out.
    fn solicit(&self, tier: CostTier) -> Option<LowMemOffer>;
    /// Release up to `offer.bytes`; returns the bytes actually freed.
    fn release(&self, offer: LowMemOffer) -> usize;
}

/// Process-wide memory budget.
pub struct MemoryArena {
    limit: Option<usize>,
    used: AtomicUsize,
    peak: AtomicUsize,
    handlers: Mutex<Vec<Weak<dyn LowMemoryHandler>>>,
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("limit", &self.limit)
            .field("used", &self.used())
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

impl MemoryArena {
    /// Arena with an optional byte limit.
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Arena without a limit; handlers never run.
    pub fn unbounded() -> Arc<Self> {
        Self::new(None)
    }

    /// Configured limit.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// High-water mark of [`used`](Self::used).
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Register a low-memory handler. The arena holds it weakly.
    pub fn register(&self, handler: &Arc<dyn LowMemoryHandler>) {
        let mut handlers = self.handlers.lock();
        handlers.retain(|h| h.strong_count() > 0);
        handlers.push(Arc::downgrade(handler));
    }

    /// Remove every handler registered under `name`.
    pub fn deregister(&self, name: &str) {
        self.handlers
            .lock()
            .retain(|h| h.upgrade().is_some_and(|h| h.name() != name));
    }

    /// Charge `bytes`, running handlers up to `tier` when over the limit.
    pub fn try_alloc(self: &Arc<Self>, bytes: usize, tier: CostTier) -> BackdropResult<Allocation> {
        for _ in 0..MAX_LOW_MEMORY_ROUNDS {
            if self.try_charge(bytes) {
                return Ok(self.allocation(bytes));
            }
            if self.run_low_memory(tier) == 0 {
                break;
            }
        }
        if self.try_charge(bytes) {
            return Ok(self.allocation(bytes));
        }
        Err(BackdropError::allocation(format!(
            "cannot allocate {bytes} bytes ({} of {:?} in use)",
            self.used(),
            self.limit
        )))
    }

    /// Charge `bytes` without soliciting any handler.
    pub fn try_alloc_quiet(self: &Arc<Self>, bytes: usize) -> BackdropResult<Allocation> {
        if self.try_charge(bytes) {
            return Ok(self.allocation(bytes));
        }
        Err(BackdropError::allocation(format!(
            "cannot allocate {bytes} bytes without low-memory actions"
        )))
    }

    fn allocation(self: &Arc<Self>, bytes: usize) -> Allocation {
        Allocation {
            arena: Arc::clone(self),
            bytes,
        }
    }

    fn try_charge(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Acquire);
        loop {
            let next = cur.saturating_add(bytes);
            if self.limit.is_some_and(|limit| next > limit) {
                return false;
            }
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return true;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn run_low_memory(&self, tier: CostTier) -> usize {
        let handlers: Vec<Arc<dyn LowMemoryHandler>> =
            self.handlers.lock().iter().filter_map(Weak::upgrade).collect();

        let best = handlers
            .iter()
            .filter(|h| h.tier() <= tier)
            .filter_map(|h| {
                h.solicit(tier)
                    .filter(|offer| offer.bytes > 0)
                    .map(|offer| (h, offer))
            })
            .min_by(|a, b| a.1.cost.total_cmp(&b.1.cost));

        match best {
            Some((handler, offer)) => {
                let freed = handler.release(offer);
                tracing::debug!(handler = handler.name(), offered = offer.bytes, freed, "low-memory release");
                freed
            }
            None => 0,
        }
    }
}

/// RAII charge against a [`MemoryArena`].
pub struct Allocation {
    arena: Arc<MemoryArena>,
    bytes: usize,
}

impl Allocation {
    /// Charged bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.arena.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Named sub-account of an arena (the page's `statePool` and `dataPool`).
pub(crate) struct MemoryPool {
    name: &'static str,
    arena: Arc<MemoryArena>,
    tier: CostTier,
    used: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    _overhead: Allocation,
}

impl MemoryPool {
    pub(crate) fn new(
        arena: &Arc<MemoryArena>,
        name: &'static str,
        tier: CostTier,
    ) -> BackdropResult<Self> {
        let overhead = arena
            .try_alloc(POOL_OVERHEAD_BYTES, tier)
            .map_err(|e| BackdropError::allocation(format!("creating {name} pool: {e}")))?;
        Ok(Self {
            name,
            arena: Arc::clone(arena),
            tier,
            used: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            _overhead: overhead,
        })
    }

    pub(crate) fn alloc(&self, bytes: usize) -> BackdropResult<PoolAllocation> {
        let inner = self
            .arena
            .try_alloc(bytes, self.tier)
            .map_err(|e| BackdropError::allocation(format!("{} pool: {e}", self.name)))?;
        let now = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(PoolAllocation {
            inner,
            pool_used: Arc::clone(&self.used),
        })
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Allocation charged to both the arena and a [`MemoryPool`].
pub(crate) struct PoolAllocation {
    inner: Allocation,
    pool_used: Arc<AtomicUsize>,
}

impl PoolAllocation {
    pub(crate) fn bytes(&self) -> usize {
        self.inner.bytes()
    }
}

impl Drop for PoolAllocation {
    fn drop(&mut self) {
        self.pool_used
            .fetch_sub(self.inner.bytes(), Ordering::AcqRel);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/memory.rs"]
mod tests;
