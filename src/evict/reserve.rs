use std::sync::Arc;

use crate::foundation::memory::{Allocation, CostTier, MemoryArena};

/// Forced headroom: chunks charged to the arena and held until freed.
///
/// Forcing a reserve and dropping it straight away pushes other purgeable caches out before a
/// risky allocation.
#[derive(Debug, Default)]
pub struct BackdropReserve {
    chunks: Vec<Allocation>,
    requested: usize,
}

impl BackdropReserve {
    /// Charge up to `size` bytes in `chunk`-sized pieces, stopping at the first failure.
    ///
    /// With `force_alloc` the arena may run every low-memory handler to satisfy a chunk;
    /// otherwise only free headroom is taken.
    pub fn force(arena: &Arc<MemoryArena>, size: usize, chunk: usize, force_alloc: bool) -> Self {
        let mut reserve = Self {
            chunks: Vec::new(),
            requested: size,
        };
        let chunk = chunk.max(1);
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(chunk);
            let charged = if force_alloc {
                arena.try_alloc(n, CostTier::Expensive)
            } else {
                arena.try_alloc_quiet(n)
            };
            match charged {
                Ok(a) => reserve.chunks.push(a),
                Err(_) => break,
            }
            remaining -= n;
        }
        tracing::debug!(
            requested = size,
            reserved = reserve.reserved(),
            chunks = reserve.chunks.len(),
            "forced backdrop reserve"
        );
        reserve
    }

    /// Bytes currently held.
    pub fn reserved(&self) -> usize {
        self.chunks.iter().map(Allocation::bytes).sum()
    }

    /// `true` when the whole requested size was charged.
    pub fn is_satisfied(&self) -> bool {
        self.reserved() >= self.requested
    }

    /// Return every chunk to the arena.
    pub fn free(self) {}
}

#[cfg(test)]
#[path = "../../tests/unit/evict/reserve.rs"]
mod tests;
