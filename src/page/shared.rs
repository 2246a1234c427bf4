use std::sync::Arc;

use crate::backdrop::block::{BlockBody, BlockStatus};
use crate::backdrop::layer::{BackdropLayer, LayerId};
use crate::evict::handler::{BackdropLowMemory, PageCache};
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::foundation::memory::{MemoryArena, MemoryPool};
use crate::foundation::opts::BackdropOpts;
use crate::page::geometry::Geometry;
use crate::page::provision::Provisioning;
use crate::page::stats::BackdropStats;
use crate::region::lifecycle::Retention;
use crate::resource::pool::ResourcePool;

pub(crate) struct LayerSlot {
    pub(crate) generation: u32,
    pub(crate) layer: Option<BackdropLayer>,
}

/// Per-page cache state: geometry, pools, provisioning and the page's layers.
///
/// Setup (`provision_resources`, layer construction, `prepare`) takes `&mut self`; compositing
/// operations take `&self` plus the calling worker's [`CompositeContext`](crate::CompositeContext),
/// so one page can be shared by many workers at once.
pub struct SharedPageState {
    pub(crate) geometry: Geometry,
    pub(crate) opts: BackdropOpts,
    pub(crate) multi_threaded: bool,
    pub(crate) arena: Arc<MemoryArena>,
    pub(crate) resources: Arc<ResourcePool>,
    pub(crate) state_pool: MemoryPool,
    pub(crate) data_pool: MemoryPool,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) handler: Arc<BackdropLowMemory>,
    pub(crate) provision: Provisioning,
    pub(crate) layers: Vec<LayerSlot>,
    pub(crate) backdrops: Vec<LayerId>,
    pub(crate) page_backdrops: Vec<LayerId>,
    pub(crate) in_comps_max: usize,
    pub(crate) layer_table_size: usize,
    pub(crate) merge_spots: bool,
    torn_down: bool,
}

impl std::fmt::Debug for SharedPageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPageState")
            .field("geometry", &self.geometry)
            .field("provision", &self.provision)
            .field("layers", &self.backdrops.len())
            .field("retention", &self.cache.retention())
            .finish_non_exhaustive()
    }
}

impl SharedPageState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        geometry: Geometry,
        opts: BackdropOpts,
        multi_threaded: bool,
        arena: Arc<MemoryArena>,
        resources: Arc<ResourcePool>,
        state_pool: MemoryPool,
        data_pool: MemoryPool,
        cache: Arc<PageCache>,
        handler: Arc<BackdropLowMemory>,
    ) -> Self {
        let provision = Provisioning::new(opts.resource_limit);
        Self {
            geometry,
            opts,
            multi_threaded,
            arena,
            resources,
            state_pool,
            data_pool,
            cache,
            handler,
            provision,
            layers: Vec::new(),
            backdrops: Vec::new(),
            page_backdrops: Vec::new(),
            in_comps_max: 0,
            layer_table_size: 0,
            merge_spots: false,
            torn_down: false,
        }
    }

    /// Block geometry.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Options the page was created with.
    pub fn opts(&self) -> &BackdropOpts {
        &self.opts
    }

    /// Several workers composite this page at once.
    pub fn is_multi_threaded(&self) -> bool {
        self.multi_threaded
    }

    /// Current provisioning values.
    pub fn provisioning(&self) -> &Provisioning {
        &self.provision
    }

    /// Largest input colorant count of any layer created so far.
    pub fn in_comps_max(&self) -> usize {
        self.in_comps_max
    }

    /// Largest block table any layer created so far needs.
    pub fn layer_table_size(&self) -> usize {
        self.layer_table_size
    }

    /// Retention policy set by [`prepare`](Self::prepare).
    pub fn retention(&self) -> Retention {
        self.cache.retention()
    }

    /// Spot merging requested by [`prepare`](Self::prepare).
    pub fn merge_spots(&self) -> bool {
        self.merge_spots
    }

    /// `true` when evicted blocks can be paged to disk.
    pub fn has_spill(&self) -> bool {
        self.cache.has_spill()
    }

    /// Cross-page resource pool.
    pub fn resources(&self) -> &Arc<ResourcePool> {
        &self.resources
    }

    /// Memory arena the page charges.
    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    /// Every layer, most recently created first.
    pub fn backdrops(&self) -> &[LayerId] {
        &self.backdrops
    }

    /// Layers compositing directly to the page, most recently created first.
    pub fn page_backdrops(&self) -> &[LayerId] {
        &self.page_backdrops
    }

    /// Look up a live layer.
    pub fn layer(&self, id: LayerId) -> BackdropResult<&BackdropLayer> {
        self.layers
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.layer.as_ref())
            .ok_or_else(|| BackdropError::validation(format!("unknown or freed layer {id:?}")))
    }

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> BackdropResult<&mut BackdropLayer> {
        self.layers
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.layer.as_mut())
            .ok_or_else(|| BackdropError::validation(format!("unknown or freed layer {id:?}")))
    }

    pub(crate) fn next_layer_id(&mut self) -> LayerId {
        if let Some(i) = self.layers.iter().position(|s| s.layer.is_none()) {
            return LayerId::new(i as u32, self.layers[i].generation);
        }
        self.layers.push(LayerSlot {
            generation: 1,
            layer: None,
        });
        LayerId::new((self.layers.len() - 1) as u32, 1)
    }

    pub(crate) fn live_layers(&self) -> impl Iterator<Item = &BackdropLayer> {
        self.backdrops.iter().filter_map(|id| self.layer(*id).ok())
    }

    /// State of the block at `(bx, by)` in `layer`.
    pub fn block_status(&self, layer: LayerId, bx: u32, by: u32) -> BackdropResult<BlockStatus> {
        let layer = self.layer(layer)?;
        if bx >= self.geometry.xblock || by >= self.geometry.yblock {
            return Err(BackdropError::validation(format!(
                "block ({bx}, {by}) outside the page"
            )));
        }
        let slot = layer.blocks.slot(layer.slot_index(bx, by))?.lock();
        Ok(match slot.as_ref() {
            Some(block) if block.by == by => block.status(),
            _ => BlockStatus::Absent,
        })
    }

    /// Bytes currently offered to the low-memory handler.
    pub fn purgeable_bytes(&self) -> usize {
        self.cache.purgeable_bytes()
    }

    /// Blocks on the purgeable list.
    pub fn purgeable_blocks(&self) -> usize {
        self.cache.purgeable_entries().len()
    }

    /// Purgeable-list entries whose block is gone or no longer holds a purgeable body.
    pub fn dangling_purgeable(&self) -> usize {
        self.cache
            .purgeable_entries()
            .into_iter()
            .filter(|(table, slot)| {
                let Some(table) = table.upgrade() else {
                    return true;
                };
                let Ok(lock) = table.slot(*slot) else {
                    return true;
                };
                let guard = lock.lock();
                !guard
                    .as_ref()
                    .is_some_and(|b| matches!(b.body, BlockBody::Stored { .. }))
            })
            .count()
    }

    /// Diagnostics snapshot.
    pub fn stats(&self) -> BackdropStats {
        BackdropStats {
            layers: self.backdrops.len(),
            page_backdrops: self.page_backdrops.len(),
            spill_file_bytes: self.cache.spill_len(),
            peak_state_bytes: self.state_pool.peak(),
            peak_data_bytes: self.data_pool.peak(),
            ..self.cache.counters.snapshot()
        }
    }

    /// Tear the page down, returning its final stats.
    ///
    /// Retained resources go back to the shared pool and the spill file is removed; the shared
    /// pool itself outlives the page.
    #[tracing::instrument(skip(self))]
    pub fn destroy(mut self) -> BackdropResult<BackdropStats> {
        let stats = self.stats();
        tracing::info!(
            layers = stats.layers,
            blocks_created = stats.blocks_created,
            uniform = stats.uniform_blocks,
            stored = stats.stored_blocks,
            retained = stats.retained_resources,
            spilled = stats.blocks_spilled,
            bytes_spilled = stats.bytes_spilled,
            reloaded = stats.blocks_reloaded,
            dropped = stats.blocks_dropped,
            compression_ratio = stats.compression_ratio,
            peak_data_bytes = stats.peak_data_bytes,
            "backdrop page stats"
        );
        self.teardown()?;
        Ok(stats)
    }

    fn teardown(&mut self) -> BackdropResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let tables: Vec<_> = self
            .layers
            .iter()
            .filter_map(|s| s.layer.as_ref())
            .map(|l| Arc::clone(&l.blocks))
            .collect();
        for table in &tables {
            self.free_all_blocks(table);
        }
        self.backdrops.clear();
        self.page_backdrops.clear();
        self.layers.clear();
        self.handler.detach(&self.cache);
        self.cache.close_spill()
    }
}

impl Drop for SharedPageState {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "backdrop page teardown failed");
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/page/shared.rs"]
mod tests;
