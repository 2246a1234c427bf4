//! Block-by-block read access to composited output.

use std::sync::Arc;

use crate::backdrop::block::{Block, BlockBody, Pixel, PixelLayout};
use crate::backdrop::layer::LayerId;
use crate::foundation::core::DeviceBox;
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::page::shared::SharedPageState;
use crate::page::stats::CacheCounters;
use crate::region::context::{CompositeContext, ReadPin};
use crate::resource::pool::{FixOutcome, ResourceClass, ResourceHandle, ResourceId};

/// Where a read block's pixels live.
#[derive(Clone, Debug)]
pub enum BlockData {
    /// Every pixel has this value.
    Uniform(Pixel),
    /// Encoded pixels, row-major with a row stride of the block width.
    Bytes(Arc<[u8]>),
    /// Encoded pixels in a block-storage buffer.
    Resource(ResourceHandle),
}

/// One complete block handed out by [`SharedPageState::reader_next`].
///
/// The block stays pinned against eviction until the next `reader_next`, `reader_init` or
/// release call on the same context.
#[derive(Clone, Debug)]
pub struct BlockRead {
    /// Block column.
    pub bx: u32,
    /// Block row.
    pub by: u32,
    /// Device pixels the block covers.
    pub bounds: DeviceBox,
    /// Encoding of the pixels.
    pub layout: PixelLayout,
    /// Row stride, in pixels.
    pub block_width: u32,
    /// The pixels.
    pub data: BlockData,
}

impl BlockRead {
    /// Decoded pixel at device `(x, y)`, or `None` outside the block.
    pub fn pixel(&self, x: i32, y: i32) -> Option<Pixel> {
        if !self.bounds.contains(x, y) {
            return None;
        }
        let pb = self.layout.pixel_bytes();
        let offset = ((y - self.bounds.y1) as usize * self.block_width as usize
            + (x - self.bounds.x1) as usize)
            * pb;
        match &self.data {
            BlockData::Uniform(px) => Some(px.clone()),
            BlockData::Bytes(bytes) => bytes
                .get(offset..offset + pb)
                .map(|b| self.layout.decode(b)),
            BlockData::Resource(h) => {
                h.with_bytes(|b| b.get(offset..offset + pb).map(|b| self.layout.decode(b)))
            }
        }
    }
}

impl SharedPageState {
    /// Start reading the blocks overlapping `bounds`, row-major.
    pub fn reader_init(&self, ctx: &mut CompositeContext, bounds: DeviceBox) -> BackdropResult<()> {
        self.check_context(ctx)?;
        ctx.finish_read();
        ctx.reader.bounds = bounds.intersect(self.geometry.page_box());
        ctx.reader.next = 0;
        Ok(())
    }

    /// Next complete block of `layer` in the read area, `None` when the area is exhausted.
    ///
    /// A spilled block is paged back in for the duration of the read.
    pub fn reader_next(
        &self,
        ctx: &mut CompositeContext,
        layer: LayerId,
    ) -> BackdropResult<Option<BlockRead>> {
        self.check_context(ctx)?;
        ctx.finish_read();
        let layer_id = layer;
        let layer = self.layer(layer_id)?;
        let Some(clip) = ctx
            .reader
            .bounds
            .and_then(|b| b.intersect(layer.bounds()))
        else {
            return Ok(None);
        };
        let Some((bx, by)) = self.geometry.block_rect(clip).nth(ctx.reader.next) else {
            return Ok(None);
        };
        ctx.reader.next += 1;

        let layout = layer.layout();
        let table_size = layer.table_size();
        let idx = layer.slot_index(bx, by);
        let slot_lock = layer.blocks.slot(idx)?;
        let not_composited = || {
            BackdropError::validation(format!(
                "block ({bx}, {by}) of {layer_id:?} has not been composited"
            ))
        };

        let readable =
            |b: &Option<Block>| b.as_ref().is_some_and(|b| b.by == by && b.is_complete());
        let mut page_in: Option<ResourceHandle> = None;
        let mut guard = loop {
            let guard = slot_lock.lock();
            if !readable(&*guard) {
                drop(guard);
                if let Some(h) = page_in {
                    self.resources.release(&h);
                }
                return Err(not_composited());
            }
            let spilled = matches!(guard.as_ref().map(|b| &b.body), Some(BlockBody::Spilled(_)));
            if !spilled || page_in.is_some() {
                break guard;
            }
            // fix may wait on other workers; never with the slot locked
            drop(guard);
            page_in = Some(self.fix_reader_resource(ctx, bx, by)?);
        };
        let Some(block) = guard.as_mut() else {
            return Err(not_composited());
        };

        if let BlockBody::Spilled(slot) = block.body
            && let Some(handle) = page_in.take()
        {
            let read = handle.with_bytes_mut(|buf| match buf.get_mut(..slot.len()) {
                Some(dst) => self.cache.spill_read(slot, dst),
                None => Err(BackdropError::validation(
                    "spilled block larger than a block resource",
                )),
            });
            if let Err(e) = read {
                self.resources.release(&handle);
                return Err(e);
            }
            CacheCounters::bump(&self.cache.counters.blocks_reloaded, 1);
            block.body = BlockBody::Loaded {
                handle,
                slot,
                owner: ctx.owner,
            };
        }
        if let Some(h) = page_in {
            // another reader paged the block in first
            self.resources.release(&h);
        }

        let data = match &block.body {
            BlockBody::Working(h) | BlockBody::Retained(h) => BlockData::Resource(h.clone()),
            BlockBody::Loaded { handle, owner, .. } if *owner == ctx.owner => {
                BlockData::Resource(handle.clone())
            }
            BlockBody::Loaded { handle, .. } => {
                BlockData::Bytes(handle.with_bytes(|b| Arc::from(&b[..table_size])))
            }
            BlockBody::Uniform { pixel, .. } => BlockData::Uniform(layout.decode(pixel)),
            BlockBody::Stored { bytes, .. } => BlockData::Bytes(Arc::clone(bytes)),
            BlockBody::Spilled(_) => {
                return Err(BackdropError::validation("spilled block was not paged in"));
            }
        };
        block.read_pins += 1;
        drop(guard);

        ctx.reader.current = Some(ReadPin {
            table: Arc::clone(&layer.blocks),
            slot: idx,
        });
        Ok(Some(BlockRead {
            bx,
            by,
            bounds: self.geometry.block_bounds(bx, by),
            layout,
            block_width: self.geometry.block_width,
            data,
        }))
    }
}

impl SharedPageState {
    fn fix_reader_resource(
        &self,
        ctx: &CompositeContext,
        bx: u32,
        by: u32,
    ) -> BackdropResult<ResourceHandle> {
        let id = ResourceId::reader(ctx.owner);
        match self.resources.fix(
            ResourceClass::BlockStorage,
            ctx.owner,
            &[id],
            self.opts.fix_timeout(),
        )? {
            FixOutcome::Fixed(mut handles) => handles.pop(),
            FixOutcome::Exhausted => None,
        }
        .ok_or_else(|| {
            BackdropError::allocation(format!("no block resource to page in ({bx}, {by})"))
        })
    }
}

#[cfg(test)]
#[path = "../../tests/unit/region/reader.rs"]
mod tests;
