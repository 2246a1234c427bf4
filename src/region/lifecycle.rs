//! Region protocol: pin, initialize, write, complete and release blocks for a spatial region,
//! plus the band-level wrappers and page-level retention setup.

use smallvec::SmallVec;

use crate::backdrop::block::{
    BLOCK_HEADER_BYTES, Block, BlockBody, BlockState, Pixel, PixelLayout, fill_pixels,
};
use crate::backdrop::layer::{BackdropLayer, InitialState, LayerId};
use crate::evict::reserve::BackdropReserve;
use crate::foundation::core::DeviceBox;
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::page::shared::SharedPageState;
use crate::page::stats::CacheCounters;
use crate::region::context::{CompositeContext, PendingSpan};
use crate::resource::pool::{FixOutcome, ResourceClass, ResourceHandle, ResourceId};

/// How long composited blocks are kept.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum Retention {
    /// Blocks are discarded after each region.
    #[default]
    None = 0,
    /// Blocks survive until the end of their band.
    Band = 1,
    /// Blocks survive across bands and separations.
    Page = 2,
}

impl Retention {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Band,
            2 => Self::Page,
            _ => Self::None,
        }
    }
}

/// Result of [`SharedPageState::request_regions`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RequestOutcome {
    /// Every block resource the region needs is pinned.
    Fixed,
    /// The region needs more resources than can be pinned right now; try a smaller one.
    OverCapacity,
    /// Part of the region is composited and part is not; shrink to a consistent sub-area.
    Inconsistent,
}

impl RequestOutcome {
    /// `true` for [`RequestOutcome::Fixed`].
    pub fn is_fixed(self) -> bool {
        self == Self::Fixed
    }
}

/// Whether a region needs compositing, and whether all its blocks agree on that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RegionState {
    /// Some covered block is absent or still in progress.
    pub requires_compositing: bool,
    /// Every covered block gives the same answer.
    pub consistent: bool,
}

enum PixelSource {
    Uniform(Pixel),
    Full(Vec<u8>),
}

impl SharedPageState {
    /// Pin block resources for `bounds` at `backdrop_depth` levels per block.
    ///
    /// The first request of a fresh context over an already composited area only pins one
    /// level. Later requests grow the pinned area; only the newly needed resources are fixed.
    #[tracing::instrument(skip(self, ctx), fields(owner = ctx.owner.0))]
    pub fn request_regions(
        &self,
        ctx: &mut CompositeContext,
        backdrop_depth: u32,
        bounds: DeviceBox,
    ) -> BackdropResult<RequestOutcome> {
        self.check_context(ctx)?;
        ctx.free_reserves();
        if backdrop_depth == 0 {
            return Err(BackdropError::validation("backdrop depth must be >= 1"));
        }
        let page = self.layer(ctx.page_backdrop)?;
        let Some(clip) = bounds.intersect(page.bounds()) else {
            return Ok(RequestOutcome::Fixed);
        };

        let depth = if ctx.fixed_depth == 0 {
            if self.region_requires_compositing(ctx.page_backdrop, clip)? {
                backdrop_depth
            } else {
                1
            }
        } else if backdrop_depth > ctx.fixed_depth {
            return Err(BackdropError::validation(format!(
                "depth {backdrop_depth} exceeds the depth {} already pinned by this context",
                ctx.fixed_depth
            )));
        } else {
            ctx.fixed_depth
        };

        let total = ctx.fixed_bounds.map_or(clip, |fixed| fixed.union(clip));
        let rect = self.geometry.block_rect(total);
        let needed = rect.count() * depth as usize;
        if needed > self.provision.n_max {
            tracing::debug!(needed, n_max = self.provision.n_max, "region over capacity");
            return Ok(RequestOutcome::OverCapacity);
        }

        if ctx.fixed_bounds != Some(total) && !self.cache.has_spill() {
            let state = self.region_state(ctx.page_backdrop, total)?;
            if !state.consistent {
                return Ok(RequestOutcome::Inconsistent);
            }
        }

        let ids: Vec<ResourceId> = rect
            .iter()
            .flat_map(|(bx, by)| {
                let linear = self.geometry.block_index(bx, by);
                (0..depth).map(move |d| ResourceId::for_block(linear, depth, d))
            })
            .filter(|id| !ctx.fixed.contains_key(id))
            .collect();
        if !ids.is_empty() {
            match self.resources.fix(
                ResourceClass::BlockStorage,
                ctx.owner,
                &ids,
                self.opts.fix_timeout(),
            )? {
                FixOutcome::Fixed(handles) => {
                    for h in handles {
                        ctx.fixed.insert(h.id(), h);
                    }
                }
                FixOutcome::Exhausted => return Ok(RequestOutcome::OverCapacity),
            }
        }

        ctx.fixed_bounds = Some(total);
        ctx.fixed_depth = depth;
        Ok(RequestOutcome::Fixed)
    }

    /// `true` when any block of `layer` overlapping `bounds` is absent or unfinished.
    pub fn region_requires_compositing(
        &self,
        layer: LayerId,
        bounds: DeviceBox,
    ) -> BackdropResult<bool> {
        Ok(self.region_state(layer, bounds)?.requires_compositing)
    }

    /// Compositing need of a region plus whether every block agrees.
    pub fn region_state(&self, layer: LayerId, bounds: DeviceBox) -> BackdropResult<RegionState> {
        let layer = self.layer(layer)?;
        let Some(clip) = bounds.intersect(layer.bounds()) else {
            return Ok(RegionState {
                requires_compositing: false,
                consistent: true,
            });
        };
        let (mut pending, mut done) = (false, false);
        for (bx, by) in self.geometry.block_rect(clip).iter() {
            let guard = layer.blocks.slot(layer.slot_index(bx, by))?.lock();
            if guard.as_ref().is_some_and(|b| b.by == by && b.is_complete()) {
                done = true;
            } else {
                pending = true;
            }
        }
        Ok(RegionState {
            requires_compositing: pending,
            consistent: !(pending && done),
        })
    }

    /// Materialize every block of `layer` the region covers that does not exist yet.
    ///
    /// New blocks start from the layer's initial color, or from the initial backdrop's
    /// content for non-isolated groups.
    pub fn region_init(
        &self,
        ctx: &mut CompositeContext,
        layer: LayerId,
        bounds: DeviceBox,
    ) -> BackdropResult<()> {
        self.check_context(ctx)?;
        self.flush_spans(ctx)?;
        let layer_id = layer;
        let layer = self.layer(layer_id)?;
        let Some(clip) = bounds.intersect(layer.bounds()) else {
            return Ok(());
        };
        let depth = ctx.fixed_depth;
        if layer.depth() >= depth {
            return Err(BackdropError::validation(format!(
                "{layer_id:?} at depth {} is outside the {depth} level(s) this context pinned",
                layer.depth()
            )));
        }
        if !ctx.fixed_bounds.is_some_and(|f| f.contains_box(clip)) {
            return Err(BackdropError::validation(format!(
                "region {clip:?} was not requested by this context"
            )));
        }
        if layer.composite_to_page() {
            ctx.band_bounds = Some(ctx.band_bounds.map_or(clip, |b| b.union(clip)));
        }

        let table_size = layer.table_size();
        for (bx, by) in self.geometry.block_rect(clip).iter() {
            let idx = layer.slot_index(bx, by);
            let mut guard = layer.blocks.slot(idx)?.lock();
            match guard.as_ref() {
                Some(b) if b.by == by => continue,
                Some(_) => {
                    if let Some(stale) = guard.take() {
                        self.free_block(&layer.blocks, idx, stale, Some(&*ctx));
                    }
                }
                None => {}
            }

            let id = ResourceId::for_block(self.geometry.block_index(bx, by), depth, layer.depth());
            let handle = ctx.fixed.get(&id).cloned().ok_or_else(|| {
                BackdropError::validation(format!("no resource pinned for block ({bx}, {by})"))
            })?;
            if handle.len() < table_size {
                return Err(BackdropError::validation(format!(
                    "block resources hold {} bytes, {layer_id:?} needs {table_size}; finalize provisioning first",
                    handle.len()
                )));
            }

            match layer.initial_pixel() {
                Some(pixel) => {
                    let mut encoded = SmallVec::<[u8; 32]>::from_elem(0, layer.layout().pixel_bytes());
                    layer.layout().encode(&pixel, &mut encoded);
                    handle.with_bytes_mut(|buf| fill_pixels(&mut buf[..table_size], &encoded));
                }
                None => {
                    let (source_layout, source) = self.initial_source(layer, bx, by)?;
                    self.inherit_into(layer, source_layout, &source, &handle)?;
                }
            }

            *guard = Some(Block::working(bx, by, handle));
            CacheCounters::bump(&self.cache.counters.blocks_created, 1);
        }
        Ok(())
    }

    /// Store `pixel` over `x1..=x2` on line `y` of `layer`'s working blocks.
    ///
    /// Spans on page layers are coalesced with the previous span when they continue it with
    /// the same value; call [`flush_spans`](Self::flush_spans) to force them out.
    pub fn write_span(
        &self,
        ctx: &mut CompositeContext,
        layer: LayerId,
        y: i32,
        x1: i32,
        x2: i32,
        pixel: &[u16],
    ) -> BackdropResult<()> {
        self.check_context(ctx)?;
        let layer_id = layer;
        let layer = self.layer(layer_id)?;
        let channels = layer.layout().channels();
        if pixel.len() != channels {
            return Err(BackdropError::validation(format!(
                "pixel has {} channels, {layer_id:?} stores {channels}",
                pixel.len()
            )));
        }
        let b = layer.bounds();
        let (x1, x2) = (x1.max(b.x1), x2.min(b.x2));
        if y < b.y1 || y > b.y2 || x1 > x2 {
            return Ok(());
        }

        let span = PendingSpan {
            layer: layer_id,
            y,
            x1,
            x2,
            pixel: pixel.iter().copied().collect(),
        };
        if layer.composite_to_page() {
            match ctx.coalesce.push(span) {
                Some(prev) => self.write_direct(&prev),
                None => Ok(()),
            }
        } else {
            self.write_direct(&span)
        }
    }

    /// Write out any coalesced span.
    pub fn flush_spans(&self, ctx: &mut CompositeContext) -> BackdropResult<()> {
        match ctx.coalesce.take() {
            Some(span) => self.write_direct(&span),
            None => Ok(()),
        }
    }

    fn write_direct(&self, span: &PendingSpan) -> BackdropResult<()> {
        let layer = self.layer(span.layer)?;
        let layout = layer.layout();
        let pb = layout.pixel_bytes();
        let mut encoded = SmallVec::<[u8; 32]>::from_elem(0, pb);
        layout.encode(&span.pixel, &mut encoded);

        let g = &self.geometry;
        let by = g.block_index_y(span.y);
        let row = g.pixel_index_y(span.y) as usize * g.block_width as usize;
        let mut x = span.x1;
        while x <= span.x2 {
            let bx = g.block_index_x(x);
            let end = (g.device_x(bx, g.block_width - 1)).min(span.x2);
            let guard = layer.blocks.slot(layer.slot_index(bx, by))?.lock();
            let handle = match guard.as_ref() {
                Some(Block {
                    body: BlockBody::Working(h),
                    by: block_by,
                    ..
                }) if *block_by == by => h,
                _ => {
                    return Err(BackdropError::validation(format!(
                        "no working block at ({bx}, {by}) in {:?}; call region_init first",
                        span.layer
                    )));
                }
            };
            let (px1, px2) = (g.pixel_index_x(x) as usize, g.pixel_index_x(end) as usize);
            handle.with_bytes_mut(|buf| {
                let start = (row + px1) * pb;
                let stop = (row + px2 + 1) * pb;
                fill_pixels(&mut buf[start..stop], &encoded);
            });
            x = end + 1;
        }
        Ok(())
    }

    /// Mark every in-progress block of `layer` that `bounds` fully covers as complete.
    pub fn region_complete(
        &self,
        ctx: &mut CompositeContext,
        layer: LayerId,
        bounds: DeviceBox,
    ) -> BackdropResult<()> {
        self.check_context(ctx)?;
        self.flush_spans(ctx)?;
        let layer = self.layer(layer)?;
        let Some(clip) = bounds.intersect(layer.bounds()) else {
            return Ok(());
        };
        for (bx, by) in self.geometry.block_rect(clip).iter() {
            if !self.block_covered(layer, bx, by, bounds) {
                continue;
            }
            let mut guard = layer.blocks.slot(layer.slot_index(bx, by))?.lock();
            if let Some(block) = guard.as_mut()
                && block.by == by
            {
                block.state = BlockState::Complete;
            }
        }
        Ok(())
    }

    /// Release `layer`'s blocks in `bounds` without keeping any.
    pub fn region_release(
        &self,
        ctx: &mut CompositeContext,
        layer: LayerId,
        bounds: DeviceBox,
    ) -> BackdropResult<()> {
        self.check_context(ctx)?;
        self.flush_spans(ctx)?;
        ctx.finish_read();
        let layer = self.layer(layer)?;
        self.reclaim(ctx, layer, bounds, false).map(|_| ())
    }

    /// Reclaim every layer's blocks in `bounds` (and the context's pinned area), then release
    /// every resource the context pinned.
    ///
    /// Returns `Ok(false)` when some block could not be kept. Without a spill file, a region
    /// that still has a retained resource is never kept: the resource cannot back two blocks,
    /// so every block in it is freed and the call reports `false`.
    #[tracing::instrument(skip(self, ctx), fields(owner = ctx.owner.0))]
    pub fn region_release_all(
        &self,
        ctx: &mut CompositeContext,
        bounds: DeviceBox,
        can_keep: bool,
    ) -> BackdropResult<bool> {
        self.check_context(ctx)?;
        let flushed = self.flush_spans(ctx);
        ctx.finish_read();

        let area = ctx
            .fixed_bounds
            .map_or(bounds, |f| f.union(bounds))
            .intersect(self.geometry.page_box());
        let mut result = flushed.map(|()| true);

        if let Some(area) = area {
            let mut keep = can_keep;
            if keep && !self.cache.has_spill() && self.holds_retained(area)? {
                tracing::warn!(?area, "retained resource in region without spill, not keeping");
                keep = false;
                result = result.map(|_| false);
            }
            for id in &self.backdrops {
                let Ok(layer) = self.layer(*id) else {
                    continue;
                };
                match self.reclaim(ctx, layer, area, keep) {
                    Ok(kept) => {
                        if let Ok(all) = result.as_mut() {
                            *all &= kept;
                        }
                    }
                    Err(e) => {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
        }

        ctx.release_fixed();
        result
    }

    /// Start a band: the context must hold no pinned resources.
    pub fn band_init(&self, ctx: &mut CompositeContext) -> BackdropResult<()> {
        self.check_context(ctx)?;
        if !ctx.fixed.is_empty() {
            return Err(BackdropError::validation(
                "band_init with resources still pinned from the previous band",
            ));
        }
        self.flush_spans(ctx)?;
        ctx.band_bounds = None;
        Ok(())
    }

    /// Release everything the band touched, retrying without keeping when keeping fails.
    ///
    /// Only [`Retention::Page`] carries blocks into later bands; under [`Retention::Band`] the
    /// band's kept blocks are freed here. Returns `false` when blocks the page retains could
    /// not be kept.
    #[tracing::instrument(skip(self, ctx), fields(owner = ctx.owner.0))]
    pub fn band_release(&self, ctx: &mut CompositeContext, can_keep: bool) -> BackdropResult<bool> {
        let area = match (ctx.band_bounds, ctx.fixed_bounds) {
            (Some(a), Some(b)) => a.union(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => {
                self.flush_spans(ctx)?;
                ctx.release_fixed();
                return Ok(true);
            }
        };

        let keep = can_keep && self.cache.retention() == Retention::Page;
        match self.region_release_all(ctx, area, keep) {
            Ok(true) => Ok(true),
            Ok(false) | Err(_) if keep => {
                tracing::warn!(?area, "keeping band blocks failed, releasing them instead");
                self.region_release_all(ctx, area, false)?;
                Ok(false)
            }
            other => other,
        }
    }

    /// Record the retention policy and, when retaining, force a reserve sized for the page
    /// layers' non-purgeable block state.
    #[tracing::instrument(skip(self))]
    pub fn prepare(&mut self, retention: Retention, merge_spots: bool) -> BackdropResult<()> {
        self.cache.set_retention(retention);
        self.merge_spots = merge_spots;
        if retention == Retention::None {
            return Ok(());
        }

        let mut size = 0;
        for id in &self.page_backdrops {
            let layer = self.layer(*id)?;
            let n = self.geometry.block_rect(layer.bounds()).count();
            // roughly a third of retained blocks end up uniform
            size += n * BLOCK_HEADER_BYTES + (n / 3) * layer.layout().pixel_bytes();
        }
        let reserve =
            BackdropReserve::force(&self.arena, size, self.opts.reserve_chunk_bytes, true);
        if !reserve.is_satisfied() {
            tracing::warn!(size, reserved = reserve.reserved(), "retention reserve not satisfied");
        }
        reserve.free();
        Ok(())
    }

    /// Force a reserve for `ctx`; it is freed by the context's next `request_regions`.
    pub fn force_reserve(&self, ctx: &mut CompositeContext, size: usize, force_alloc: bool) -> usize {
        let reserve =
            BackdropReserve::force(&self.arena, size, self.opts.reserve_chunk_bytes, force_alloc);
        let got = reserve.reserved();
        ctx.reserves.push(reserve);
        got
    }

    /// `true` when `bounds` covers the part of block `(bx, by)` inside the layer.
    pub(crate) fn block_covered(
        &self,
        layer: &BackdropLayer,
        bx: u32,
        by: u32,
        bounds: DeviceBox,
    ) -> bool {
        self.geometry
            .block_bounds(bx, by)
            .intersect(layer.bounds())
            .is_some_and(|b| bounds.contains_box(b))
    }

    fn holds_retained(&self, area: DeviceBox) -> BackdropResult<bool> {
        for layer in self.live_layers() {
            let Some(clip) = area.intersect(layer.bounds()) else {
                continue;
            };
            for (bx, by) in self.geometry.block_rect(clip).iter() {
                let guard = layer.blocks.slot(layer.slot_index(bx, by))?.lock();
                if guard
                    .as_ref()
                    .is_some_and(|b| b.by == by && matches!(b.body, BlockBody::Retained(_)))
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Content a non-isolated block starts from: the nearest initial backdrop block, or the
    /// initial color of the first isolated ancestor.
    fn initial_source(
        &self,
        layer: &BackdropLayer,
        bx: u32,
        by: u32,
    ) -> BackdropResult<(PixelLayout, PixelSource)> {
        let mut next = layer.initial_backdrop();
        while let Some(id) = next {
            let init = self.layer(id)?;
            let layout = init.layout();
            {
                let guard = init.blocks.slot(init.slot_index(bx, by))?.lock();
                if let Some(block) = guard.as_ref().filter(|b| b.by == by) {
                    return Ok((layout, self.block_source(block, layout, init.table_size())?));
                }
            }
            match &init.initial {
                InitialState::Inherit(up) => next = Some(*up),
                InitialState::Isolated { .. } => {
                    let pixel = init.initial_pixel().ok_or_else(|| {
                        BackdropError::validation(format!("{id:?} has no initial color"))
                    })?;
                    return Ok((layout, PixelSource::Uniform(pixel)));
                }
            }
        }
        Err(BackdropError::validation(format!(
            "{:?} has no initial backdrop",
            layer.id()
        )))
    }

    fn block_source(
        &self,
        block: &Block,
        layout: PixelLayout,
        table_size: usize,
    ) -> BackdropResult<PixelSource> {
        Ok(match &block.body {
            BlockBody::Working(h) | BlockBody::Retained(h) | BlockBody::Loaded { handle: h, .. } => {
                PixelSource::Full(h.with_bytes(|b| b[..table_size].to_vec()))
            }
            BlockBody::Uniform { pixel, .. } => PixelSource::Uniform(layout.decode(pixel)),
            BlockBody::Stored { bytes, .. } => PixelSource::Full(bytes.to_vec()),
            BlockBody::Spilled(slot) => {
                let mut buf = vec![0u8; slot.len()];
                self.cache.spill_read(*slot, &mut buf)?;
                PixelSource::Full(buf)
            }
        })
    }

    fn inherit_into(
        &self,
        layer: &BackdropLayer,
        source_layout: PixelLayout,
        source: &PixelSource,
        handle: &ResourceHandle,
    ) -> BackdropResult<()> {
        let layout = layer.layout();
        let pb = layout.pixel_bytes();
        let table_size = layer.table_size();
        let to_child = |src: &[u16]| {
            let (colors, alpha) = source_layout.color_and_alpha(src);
            let px = layer.inherited_pixel(&colors, alpha);
            let mut out = SmallVec::<[u8; 32]>::from_elem(0, pb);
            layout.encode(&px, &mut out);
            out
        };
        match source {
            PixelSource::Uniform(px) => {
                let encoded = to_child(px.as_slice());
                handle.with_bytes_mut(|buf| fill_pixels(&mut buf[..table_size], &encoded));
            }
            PixelSource::Full(bytes) => {
                let spb = source_layout.pixel_bytes();
                if bytes.len() / spb < table_size / pb {
                    return Err(BackdropError::validation(
                        "initial backdrop block is smaller than the group's block",
                    ));
                }
                handle.with_bytes_mut(|buf| {
                    for (dst, src) in buf[..table_size]
                        .chunks_exact_mut(pb)
                        .zip(bytes.chunks_exact(spb))
                    {
                        dst.copy_from_slice(&to_child(source_layout.decode(src).as_slice()));
                    }
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../../tests/unit/region/lifecycle.rs"]
mod tests;
