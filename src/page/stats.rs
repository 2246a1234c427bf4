use std::sync::atomic::{AtomicU64, Ordering};

/// Diagnostics snapshot of one page, taken at teardown.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct BackdropStats {
    /// Layers alive when the snapshot was taken.
    pub layers: usize,
    /// Layers compositing directly to the page.
    pub page_backdrops: usize,
    /// Blocks materialized by `region_init`.
    pub blocks_created: u64,
    /// Blocks kept as a single repeated pixel.
    pub uniform_blocks: u64,
    /// Blocks kept as a copy in the data pool.
    pub stored_blocks: u64,
    /// Blocks kept in a detached block-storage resource.
    pub retained_resources: u64,
    /// Blocks paged out to disk.
    pub blocks_spilled: u64,
    /// Bytes paged out to disk.
    pub bytes_spilled: u64,
    /// Blocks paged back in by a reader.
    pub blocks_reloaded: u64,
    /// Purgeable blocks dropped under memory pressure.
    pub blocks_dropped: u64,
    /// Uncompressed bytes of every kept block.
    pub raw_bytes: u64,
    /// Bytes those blocks occupy once kept.
    pub stored_bytes: u64,
    /// `stored_bytes / raw_bytes`; `1.0` when nothing was kept.
    pub compression_ratio: f64,
    /// Size of the spill file, freed slots included.
    pub spill_file_bytes: u64,
    /// High-water mark of the block-state pool.
    pub peak_state_bytes: usize,
    /// High-water mark of the block-data pool.
    pub peak_data_bytes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) blocks_created: AtomicU64,
    pub(crate) uniform_blocks: AtomicU64,
    pub(crate) stored_blocks: AtomicU64,
    pub(crate) retained_resources: AtomicU64,
    pub(crate) blocks_spilled: AtomicU64,
    pub(crate) bytes_spilled: AtomicU64,
    pub(crate) blocks_reloaded: AtomicU64,
    pub(crate) blocks_dropped: AtomicU64,
    pub(crate) raw_bytes: AtomicU64,
    pub(crate) stored_bytes: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn kept(&self, raw: usize, stored: usize) {
        Self::bump(&self.raw_bytes, raw as u64);
        Self::bump(&self.stored_bytes, stored as u64);
    }

    pub(crate) fn snapshot(&self) -> BackdropStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let raw = load(&self.raw_bytes);
        let stored = load(&self.stored_bytes);
        BackdropStats {
            blocks_created: load(&self.blocks_created),
            uniform_blocks: load(&self.uniform_blocks),
            stored_blocks: load(&self.stored_blocks),
            retained_resources: load(&self.retained_resources),
            blocks_spilled: load(&self.blocks_spilled),
            bytes_spilled: load(&self.bytes_spilled),
            blocks_reloaded: load(&self.blocks_reloaded),
            blocks_dropped: load(&self.blocks_dropped),
            raw_bytes: raw,
            stored_bytes: stored,
            compression_ratio: if raw == 0 {
                1.0
            } else {
                stored as f64 / raw as f64
            },
            ..BackdropStats::default()
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/page/stats.rs"]
mod tests;
