//! Backdrop layers: one per transparency group, soft mask or page-composite target.

use std::sync::Arc;

use crate::backdrop::block::{BLOCK_HEADER_BYTES, BlockTable, Pixel, PixelLayout};
use crate::foundation::core::{
    COLOR_ONE, COLORANT_NONE, ColorantIndex, DeviceBox, PixelLabel, RenderingIntent,
    channel_from_f32,
};
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::foundation::memory::PoolAllocation;
use crate::page::geometry::Geometry;
use crate::page::shared::{LayerSlot, SharedPageState};

/// Generation-checked handle of a layer within its page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct LayerId {
    index: u32,
    generation: u32,
}

impl LayerId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

/// Soft-mask flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SoftMaskKind {
    /// Mask values come from the group's alpha.
    Alpha,
    /// Mask values come from the group's luminosity.
    Luminosity,
}

/// Transparency-group attributes a layer is built from.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupAttrs {
    /// Device bounding box of the group.
    pub bounds: DeviceBox,
    /// The group's own isolated attribute. Informational: group elimination can change it, so a
    /// layer's isolation is decided by whether it has an initial backdrop.
    pub isolated: bool,
    /// Knockout group.
    pub knockout: bool,
    /// The group composites straight onto the page.
    pub composite_to_page: bool,
    /// Track shape alongside alpha.
    pub track_shape: bool,
    /// Set when the group is a soft mask.
    pub soft_mask: Option<SoftMaskKind>,
    /// Leading process colorants among the inputs; the rest are spots.
    pub process_comps: Option<usize>,
    /// Default rendering intent for the initial pixel label.
    pub rendering_intent: RenderingIntent,
    /// Default content is spot-colored.
    pub spot_default: bool,
}

impl GroupAttrs {
    /// Plain isolated group over `bounds`.
    pub fn new(bounds: DeviceBox) -> Self {
        Self {
            bounds,
            isolated: true,
            knockout: false,
            composite_to_page: false,
            track_shape: false,
            soft_mask: None,
            process_comps: None,
            rendering_intent: RenderingIntent::default(),
            spot_default: false,
        }
    }
}

/// Color-conversion capability used by soft-mask setup.
pub trait ColorConverter: Send + Sync {
    /// Convert one color from the layer's input space into `output`.
    fn convert(&self, input: &[f32], output: &mut [f32]) -> BackdropResult<()>;
}

/// Everything [`SharedPageState::new_backdrop_layer`] needs to build a layer.
#[derive(Clone)]
pub struct LayerSpec<'a> {
    /// Nesting depth; the page layer is 0.
    pub depth: u32,
    /// Layer whose content a non-isolated group starts from. `None` makes the layer isolated.
    pub initial_backdrop: Option<LayerId>,
    /// Layer this one composites into.
    pub parent_backdrop: Option<LayerId>,
    /// Group attributes.
    pub group: GroupAttrs,
    /// Input colorants.
    pub in_colorants: &'a [ColorantIndex],
    /// Output colorants.
    pub out_colorants: &'a [ColorantIndex],
    /// Color converter for soft-mask setup.
    pub converter: Option<Arc<dyn ColorConverter>>,
}

impl<'a> LayerSpec<'a> {
    /// Isolated layer with no parent.
    pub fn new(
        depth: u32,
        group: GroupAttrs,
        in_colorants: &'a [ColorantIndex],
        out_colorants: &'a [ColorantIndex],
    ) -> Self {
        Self {
            depth,
            initial_backdrop: None,
            parent_backdrop: None,
            group,
            in_colorants,
            out_colorants,
            converter: None,
        }
    }

    /// Start from `layer`'s content (non-isolated).
    pub fn with_initial_backdrop(mut self, layer: LayerId) -> Self {
        self.initial_backdrop = Some(layer);
        self
    }

    /// Composite into `layer`.
    pub fn with_parent(mut self, layer: LayerId) -> Self {
        self.parent_backdrop = Some(layer);
        self
    }

    /// Attach a color converter.
    pub fn with_converter(mut self, converter: Arc<dyn ColorConverter>) -> Self {
        self.converter = Some(converter);
        self
    }
}

pub(crate) enum InitialState {
    Inherit(LayerId),
    Isolated {
        color: Box<[u16]>,
        alpha: u16,
        label: PixelLabel,
    },
}

pub(crate) struct ParentLink {
    layer: LayerId,
    remap: Option<Box<[ColorantIndex]>>,
}

/// A layer's colorants, flags, initial state and block table.
pub struct BackdropLayer {
    id: LayerId,
    depth: u32,
    bounds: DeviceBox,
    in_colorants: Box<[ColorantIndex]>,
    out_colorants: Box<[ColorantIndex]>,
    process_comps: usize,
    converter: Option<Arc<dyn ColorConverter>>,
    group: GroupAttrs,
    pub(crate) initial: InitialState,
    parent: Option<ParentLink>,
    page_color: Option<Box<[u16]>>,
    colorant_mapping: Option<Box<[ColorantIndex]>>,
    default_mask_alpha: u16,
    layout: PixelLayout,
    table_size: usize,
    reuse_rows: Option<u32>,
    xblock: u32,
    pub(crate) blocks: Arc<BlockTable>,
    _state: PoolAllocation,
}

impl std::fmt::Debug for BackdropLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackdropLayer")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("bounds", &self.bounds)
            .field("in_comps", &self.in_comps())
            .field("out_comps", &self.out_comps())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl BackdropLayer {
    /// Handle of this layer.
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Nesting depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Device bounds, clipped to the page.
    pub fn bounds(&self) -> DeviceBox {
        self.bounds
    }

    /// Input colorant count.
    pub fn in_comps(&self) -> usize {
        self.in_colorants.len()
    }

    /// Output colorant count.
    pub fn out_comps(&self) -> usize {
        self.out_colorants.len()
    }

    /// Input colorants.
    pub fn in_colorants(&self) -> &[ColorantIndex] {
        &self.in_colorants
    }

    /// Output colorants.
    pub fn out_colorants(&self) -> &[ColorantIndex] {
        &self.out_colorants
    }

    /// Leading process colorants among the inputs.
    pub fn process_comps(&self) -> usize {
        self.process_comps
    }

    /// `true` unless the layer starts from another layer's content.
    pub fn is_isolated(&self) -> bool {
        matches!(self.initial, InitialState::Isolated { .. })
    }

    /// Knockout group.
    pub fn is_knockout(&self) -> bool {
        self.group.knockout
    }

    /// Composites straight onto the page.
    pub fn composite_to_page(&self) -> bool {
        self.group.composite_to_page
    }

    /// Tracks shape.
    pub fn track_shape(&self) -> bool {
        self.group.track_shape
    }

    /// Soft-mask flavor, if any.
    pub fn soft_mask(&self) -> Option<SoftMaskKind> {
        self.group.soft_mask
    }

    /// Layer a non-isolated group starts from.
    pub fn initial_backdrop(&self) -> Option<LayerId> {
        match self.initial {
            InitialState::Inherit(id) => Some(id),
            InitialState::Isolated { .. } => None,
        }
    }

    /// Initial color of an isolated layer.
    pub fn initial_color(&self) -> Option<&[u16]> {
        match &self.initial {
            InitialState::Isolated { color, .. } => Some(color),
            InitialState::Inherit(_) => None,
        }
    }

    /// Initial alpha of an isolated layer.
    pub fn initial_alpha(&self) -> Option<u16> {
        match self.initial {
            InitialState::Isolated { alpha, .. } => Some(alpha),
            InitialState::Inherit(_) => None,
        }
    }

    /// Initial pixel label of an isolated layer.
    pub fn initial_label(&self) -> Option<PixelLabel> {
        match self.initial {
            InitialState::Isolated { label, .. } => Some(label),
            InitialState::Inherit(_) => None,
        }
    }

    /// Layer this one composites into.
    pub fn parent_backdrop(&self) -> Option<LayerId> {
        self.parent.as_ref().map(|p| p.layer)
    }

    /// For each parent colorant, its position among this layer's outputs or
    /// [`COLORANT_NONE`]. `None` when the orders already agree.
    pub fn parent_remap(&self) -> Option<&[ColorantIndex]> {
        self.parent.as_ref().and_then(|p| p.remap.as_deref())
    }

    /// Erase color of a page-compositing layer.
    pub fn page_color(&self) -> Option<&[u16]> {
        self.page_color.as_deref()
    }

    /// Per-input-colorant equivalent output colorant.
    pub fn device_colorant_mapping(&self) -> Option<&[ColorantIndex]> {
        self.colorant_mapping.as_deref()
    }

    /// Mask value outside the soft-mask group's content.
    pub fn default_mask_alpha(&self) -> u16 {
        self.default_mask_alpha
    }

    /// Stored pixel layout.
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Uncompressed block bytes.
    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// Block slots held; smaller than the page when one band's worth of slots is reused.
    pub fn block_slots(&self) -> usize {
        self.blocks.len()
    }

    /// `true` when block slots are recycled band to band.
    pub fn reuses_block_rows(&self) -> bool {
        self.reuse_rows.is_some()
    }

    pub(crate) fn slot_index(&self, bx: u32, by: u32) -> usize {
        let row = self.reuse_rows.map_or(by, |rows| by % rows);
        row as usize * self.xblock as usize + bx as usize
    }

    /// First pixel of every new block of an isolated layer.
    pub(crate) fn initial_pixel(&self) -> Option<Pixel> {
        let InitialState::Isolated { color, alpha, .. } = &self.initial else {
            return None;
        };
        let mut px = Pixel::new();
        if self.layout.colors == color.len() && self.page_color.is_none() {
            px.extend_from_slice(color);
        } else if let Some(page) = &self.page_color {
            px.extend_from_slice(page);
        } else {
            for c in self.out_colorants.iter() {
                let v = self
                    .in_colorants
                    .iter()
                    .position(|i| i == c)
                    .map_or(0, |pos| color[pos]);
                px.push(v);
            }
        }
        px.resize(self.layout.colors, 0);
        self.push_extras(&mut px, *alpha);
        Some(px)
    }

    /// First pixel of a non-isolated block given its initial backdrop's color and alpha.
    pub(crate) fn inherited_pixel(&self, colors: &[u16], alpha: u16) -> Pixel {
        let mut px: Pixel = colors.iter().copied().take(self.layout.colors).collect();
        px.resize(self.layout.colors, 0);
        self.push_extras(&mut px, alpha);
        px
    }

    fn push_extras(&self, px: &mut Pixel, alpha: u16) {
        if self.layout.alpha {
            px.push(alpha);
        }
        if self.layout.group_alpha {
            px.push(0);
        }
        if self.layout.shape {
            px.push(0);
        }
    }
}

impl SharedPageState {
    /// Build a layer and link it into the page.
    ///
    /// Nothing is linked unless every step succeeds; a failed build releases what it charged.
    #[tracing::instrument(skip(self, spec), fields(depth = spec.depth))]
    pub fn new_backdrop_layer(&mut self, spec: LayerSpec<'_>) -> BackdropResult<LayerId> {
        let bounds = spec
            .group
            .bounds
            .intersect(self.geometry.page_box())
            .ok_or_else(|| BackdropError::validation("layer bounds lie outside the page"))?;
        let in_comps = spec.in_colorants.len();
        let out_comps = spec.out_colorants.len();
        let process_comps = spec.group.process_comps.unwrap_or(in_comps);
        if process_comps > in_comps {
            return Err(BackdropError::validation(format!(
                "{process_comps} process colorants but only {in_comps} inputs"
            )));
        }

        let in_colorants: Box<[ColorantIndex]> = spec.in_colorants.into();
        let out_colorants: Box<[ColorantIndex]> = spec.out_colorants.into();

        let initial = match spec.initial_backdrop {
            Some(init_id) => {
                let init = self.layer(init_id)?;
                if init.depth >= spec.depth {
                    return Err(BackdropError::validation(format!(
                        "initial backdrop depth {} is not above layer depth {}",
                        init.depth, spec.depth
                    )));
                }
                if init.in_comps() < in_comps || init.in_colorants[..in_comps] != in_colorants[..]
                {
                    return Err(BackdropError::validation(
                        "non-isolated group colorants must be a prefix of its initial backdrop's",
                    ));
                }
                InitialState::Inherit(init_id)
            }
            None => {
                let fill = if self.opts.opaque_only { COLOR_ONE } else { 0 };
                InitialState::Isolated {
                    color: vec![fill; in_comps].into_boxed_slice(),
                    alpha: 0,
                    label: PixelLabel::new(spec.group.rendering_intent, spec.group.spot_default),
                }
            }
        };

        let parent = match spec.parent_backdrop {
            Some(parent_id) => {
                let parent = self.layer(parent_id)?;
                if parent.depth >= spec.depth {
                    return Err(BackdropError::validation(format!(
                        "parent depth {} is not above layer depth {}",
                        parent.depth, spec.depth
                    )));
                }
                Some(ParentLink {
                    layer: parent_id,
                    remap: parent_remap(parent, &out_colorants)?,
                })
            }
            None => None,
        };

        let nonisolated = matches!(initial, InitialState::Inherit(_));
        let layout = PixelLayout::for_group(
            &spec.group,
            in_comps,
            out_comps,
            nonisolated,
            self.opts.output_16bit,
        );
        let table_size = layout.table_bytes(self.geometry.block_pixels());
        let reuse_rows = (!self.multi_threaded && !spec.group.composite_to_page)
            .then(|| self.geometry.band_block_rows());
        let slots = slot_count(&self.geometry, reuse_rows);

        let charge = std::mem::size_of::<BackdropLayer>()
            + (in_comps + out_comps) * std::mem::size_of::<ColorantIndex>()
            + in_comps * std::mem::size_of::<u16>()
            + slots * BLOCK_HEADER_BYTES;
        let state = self.state_pool.alloc(charge)?;

        let id = self.next_layer_id();
        let layer = BackdropLayer {
            id,
            depth: spec.depth,
            bounds,
            in_colorants,
            out_colorants,
            process_comps,
            converter: spec.converter,
            group: spec.group,
            initial,
            parent,
            page_color: None,
            colorant_mapping: None,
            default_mask_alpha: 0,
            layout,
            table_size,
            reuse_rows,
            xblock: self.geometry.xblock,
            blocks: Arc::new(BlockTable::new(id, slots)),
            _state: state,
        };

        let to_page = layer.composite_to_page();
        self.layers[id.index()] = LayerSlot {
            generation: id.generation(),
            layer: Some(layer),
        };
        self.backdrops.insert(0, id);
        if to_page {
            self.page_backdrops.insert(0, id);
        }
        self.in_comps_max = self.in_comps_max.max(in_comps);
        self.layer_table_size = self.layer_table_size.max(table_size);
        tracing::debug!(?id, in_comps, out_comps, table_size, slots, "backdrop layer created");
        Ok(id)
    }

    /// Configure an isolated soft-mask layer's starting state.
    ///
    /// Luminosity masks start opaque from `backdrop_color` and derive their default mask value
    /// by converting that color to gray. `transfer` then maps the default value.
    pub fn set_soft_mask(
        &mut self,
        id: LayerId,
        backdrop_color: Option<&[f32]>,
        transfer: Option<&dyn Fn(f32) -> f32>,
    ) -> BackdropResult<()> {
        let layer = self.layer_mut(id)?;
        let Some(kind) = layer.group.soft_mask else {
            return Err(BackdropError::validation(format!("{id:?} is not a soft mask")));
        };
        let in_comps = layer.in_comps();
        let InitialState::Isolated { color, alpha, .. } = &mut layer.initial else {
            return Err(BackdropError::validation(format!(
                "soft mask {id:?} must be isolated"
            )));
        };

        let mut mask = 0.0_f32;
        if kind == SoftMaskKind::Luminosity {
            let bc = backdrop_color.ok_or_else(|| {
                BackdropError::validation("luminosity soft mask needs a backdrop color")
            })?;
            if bc.len() != in_comps {
                return Err(BackdropError::validation(format!(
                    "backdrop color has {} components, layer has {in_comps}",
                    bc.len()
                )));
            }
            let converter = layer.converter.as_ref().ok_or_else(|| {
                BackdropError::validation("luminosity soft mask needs a color converter")
            })?;
            let mut gray = [0.0_f32; 1];
            converter.convert(bc, &mut gray)?;
            *color = bc.iter().map(|v| channel_from_f32(*v)).collect();
            *alpha = COLOR_ONE;
            mask = gray[0];
        }
        if let Some(f) = transfer {
            mask = f(mask);
        }
        layer.default_mask_alpha = channel_from_f32(mask);
        Ok(())
    }

    /// Set the erase color of a page-compositing layer.
    pub fn set_page_color(&mut self, id: LayerId, color: &[u16]) -> BackdropResult<()> {
        let layer = self.layer_mut(id)?;
        if !layer.composite_to_page() {
            return Err(BackdropError::validation(format!(
                "{id:?} does not composite to the page"
            )));
        }
        if color.len() != layer.out_comps() {
            return Err(BackdropError::validation(format!(
                "page color has {} components, layer outputs {}",
                color.len(),
                layer.out_comps()
            )));
        }
        layer.page_color = Some(color.into());
        Ok(())
    }

    /// Map each input colorant to its nearest equivalent output colorant.
    pub fn set_device_colorant_mapping(
        &mut self,
        id: LayerId,
        mapping: &[ColorantIndex],
    ) -> BackdropResult<()> {
        let layer = self.layer_mut(id)?;
        if mapping.len() != layer.in_comps() {
            return Err(BackdropError::validation(format!(
                "mapping has {} entries, layer has {} inputs",
                mapping.len(),
                layer.in_comps()
            )));
        }
        if let Some(bad) = mapping.iter().find(|c| **c < COLORANT_NONE) {
            return Err(BackdropError::validation(format!("invalid colorant {bad} in mapping")));
        }
        layer.colorant_mapping = Some(mapping.into());
        Ok(())
    }

    /// Unlink a layer and free everything it owns, including retained and spilled blocks.
    #[tracing::instrument(skip(self))]
    pub fn free_backdrop_layer(&mut self, id: LayerId) -> BackdropResult<()> {
        self.layer(id)?;
        self.backdrops.retain(|l| *l != id);
        self.page_backdrops.retain(|l| *l != id);
        let slot = &mut self.layers[id.index()];
        let layer = slot.layer.take();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(layer) = layer {
            self.free_all_blocks(&layer.blocks);
        }
        Ok(())
    }
}

fn parent_remap(
    parent: &BackdropLayer,
    out_colorants: &[ColorantIndex],
) -> BackdropResult<Option<Box<[ColorantIndex]>>> {
    if parent.in_comps() < out_colorants.len() {
        return Err(BackdropError::validation(format!(
            "parent has {} colorants, layer outputs {}",
            parent.in_comps(),
            out_colorants.len()
        )));
    }
    if parent.in_colorants[..] == *out_colorants {
        return Ok(None);
    }
    let remap = parent
        .in_colorants
        .iter()
        .map(|c| {
            out_colorants
                .iter()
                .position(|o| o == c)
                .map_or(COLORANT_NONE, |pos| pos as ColorantIndex)
        })
        .collect();
    Ok(Some(remap))
}

fn slot_count(geometry: &Geometry, reuse_rows: Option<u32>) -> usize {
    let rows = reuse_rows.unwrap_or(geometry.yblock);
    rows as usize * geometry.xblock as usize
}

#[cfg(test)]
#[path = "../../tests/unit/backdrop/layer.rs"]
mod tests;
