//! Giving blocks back: free them outright or compact them into something cheaper to keep.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::backdrop::block::{Block, BlockBody, BlockTable, uniform_pixel};
use crate::backdrop::layer::BackdropLayer;
use crate::foundation::core::DeviceBox;
use crate::foundation::error::BackdropResult;
use crate::page::shared::SharedPageState;
use crate::page::stats::CacheCounters;
use crate::region::context::CompositeContext;
use crate::region::lifecycle::Retention;
use crate::resource::pool::ResourceHandle;

impl SharedPageState {
    /// Free every block in `table`, whatever its body.
    pub(crate) fn free_all_blocks(&self, table: &Arc<BlockTable>) {
        for (idx, lock) in table.slots().enumerate() {
            let block = lock.lock().take();
            if let Some(block) = block {
                self.free_block(table, idx, block, None);
            }
        }
    }

    /// Release what a block body holds outside its slot. Resources pinned by `ctx` are left for
    /// the context to release.
    pub(crate) fn free_block(
        &self,
        table: &BlockTable,
        idx: usize,
        block: Block,
        ctx: Option<&CompositeContext>,
    ) {
        match block.body {
            BlockBody::Working(_) | BlockBody::Uniform { .. } => {}
            BlockBody::Retained(h) => {
                if !ctx.is_some_and(|c| c.holds(&h)) {
                    self.resources.release(&h);
                }
            }
            BlockBody::Stored { .. } => self.cache.remove_purgeable(table, idx),
            BlockBody::Spilled(slot) => self.cache.spill_free(slot),
            BlockBody::Loaded { handle, slot, .. } => {
                self.resources.release(&handle);
                self.cache.spill_free(slot);
            }
        }
    }

    /// Reclaim `layer`'s blocks in `area`. Complete page-layer blocks fully covered by `area`
    /// are kept when `keep` is set and the page retains anything; the rest are freed.
    ///
    /// Returns `Ok(false)` when a block that should have been kept had to be freed instead.
    pub(crate) fn reclaim(
        &self,
        ctx: &mut CompositeContext,
        layer: &BackdropLayer,
        area: DeviceBox,
        keep: bool,
    ) -> BackdropResult<bool> {
        let Some(clip) = area.intersect(layer.bounds()) else {
            return Ok(true);
        };
        let keep_layer =
            keep && layer.composite_to_page() && self.cache.retention() != Retention::None;

        let mut all_kept = true;
        let mut first_err = None;
        for (bx, by) in self.geometry.block_rect(clip).iter() {
            let idx = layer.slot_index(bx, by);
            let mut guard = layer.blocks.slot(idx)?.lock();
            let Some(block) = guard.take() else {
                continue;
            };
            if block.by != by {
                *guard = Some(block);
                continue;
            }

            if keep_layer && block.is_complete() && self.block_covered(layer, bx, by, area) {
                match self.compact(ctx, layer, idx, block) {
                    Ok(Some(kept)) => *guard = Some(kept),
                    Ok(None) => all_kept = false,
                    Err(e) => {
                        all_kept = false;
                        first_err.get_or_insert(e);
                    }
                }
            } else {
                self.free_block(&layer.blocks, idx, block, Some(&*ctx));
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(all_kept),
        }
    }

    /// Turn a complete block into its cheapest kept form: one pixel when uniform, a copy in the
    /// data pool, a page in the spill file, or finally the resource itself, detached from the
    /// context. `None` when none of those were possible; the block is gone.
    fn compact(
        &self,
        ctx: &mut CompositeContext,
        layer: &BackdropLayer,
        idx: usize,
        block: Block,
    ) -> BackdropResult<Option<Block>> {
        let Block {
            bx,
            by,
            state,
            body,
            read_pins,
        } = block;
        let handle = match body {
            BlockBody::Working(h) | BlockBody::Retained(h) if ctx.holds(&h) => h,
            body => {
                // already compact, or pinned by another context
                return Ok(Some(Block {
                    bx,
                    by,
                    state,
                    body,
                    read_pins,
                }));
            }
        };
        let rebuild = |body| Block {
            bx,
            by,
            state,
            body,
            read_pins,
        };

        let layout = layer.layout();
        let table = layer.table_size();
        let pb = layout.pixel_bytes();
        let counters = &self.cache.counters;

        let uniform: Option<SmallVec<[u8; 16]>> =
            handle.with_bytes(|buf| uniform_pixel(&buf[..table], pb).map(SmallVec::from_slice));
        if let Some(pixel) = uniform
            && let Ok(alloc) = self.data_pool.alloc(pb)
        {
            CacheCounters::bump(&counters.uniform_blocks, 1);
            counters.kept(table, pb);
            return Ok(Some(rebuild(BlockBody::Uniform {
                pixel,
                _alloc: alloc,
            })));
        }

        match self.data_pool.alloc(table) {
            Ok(alloc) => {
                let bytes: Arc<[u8]> = handle.with_bytes(|buf| Arc::from(&buf[..table]));
                self.cache.push_purgeable(&layer.blocks, idx, table);
                CacheCounters::bump(&counters.stored_blocks, 1);
                counters.kept(table, table);
                return Ok(Some(rebuild(BlockBody::Stored {
                    bytes,
                    _alloc: alloc,
                })));
            }
            Err(e) if !e.is_allocation_class() => return Err(e),
            Err(_) => {}
        }

        if self.cache.has_spill() {
            let slot = handle.with_bytes(|buf| self.cache.spill_write(&buf[..table]))?;
            if let Some(slot) = slot {
                counters.kept(table, 0);
                return Ok(Some(rebuild(BlockBody::Spilled(slot))));
            }
        }

        Ok(self.retain(ctx, &handle).then(|| {
            CacheCounters::bump(&counters.retained_resources, 1);
            counters.kept(table, table);
            rebuild(BlockBody::Retained(handle.clone()))
        }))
    }

    /// Detach `handle` from `ctx` so it can keep backing its block.
    fn retain(&self, ctx: &mut CompositeContext, handle: &ResourceHandle) -> bool {
        if !self.resources.detach(handle, self.provision.n_min) {
            tracing::debug!(id = ?handle.id(), "resource retention refused, dropping block");
            return false;
        }
        ctx.fixed.remove(&handle.id());
        true
    }
}

#[cfg(test)]
#[path = "../../tests/unit/region/reclaim.rs"]
mod tests;
