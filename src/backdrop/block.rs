//! Block storage: pixel layouts, block bodies and the per-layer slot table.
//!
//! A block moves through these bodies:
//!
//! ```text
//! absent -> Working (in a fixed resource) -> Uniform | Stored | Retained | Spilled
//!                                             Stored -> Spilled (eviction) -> Loaded (reader)
//! ```
//!
//! `Stored` bodies live in the page data pool and are the only purgeable ones.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backdrop::layer::{GroupAttrs, LayerId, SoftMaskKind};
use crate::foundation::core::COLOR_ONE;
use crate::foundation::error::{BackdropError, BackdropResult};
use crate::foundation::memory::PoolAllocation;
use crate::resource::pool::{OwnerId, ResourceHandle};
use crate::spill::file::SpillSlot;

/// Channel values of one pixel, in layout order.
pub type Pixel = SmallVec<[u16; 8]>;

/// Output table kind a layer stores its blocks in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TableType {
    /// Final page colorants, 8 bits per channel.
    Output8,
    /// Final page colorants, 16 bits per channel.
    Output16,
    /// Group colorants plus alpha, 16 bits per channel.
    Isolated,
    /// Single alpha channel (alpha soft masks).
    Alpha,
}

/// Channel arrangement of one stored pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PixelLayout {
    /// Table kind.
    pub table_type: TableType,
    /// Color channels, first in the pixel.
    pub colors: usize,
    /// An alpha channel follows the colors.
    pub alpha: bool,
    /// A group-alpha channel follows alpha (non-isolated groups).
    pub group_alpha: bool,
    /// A shape channel comes last.
    pub shape: bool,
}

impl PixelLayout {
    /// Layout a layer with these attributes stores.
    pub fn for_group(
        group: &GroupAttrs,
        in_comps: usize,
        out_comps: usize,
        nonisolated: bool,
        output_16bit: bool,
    ) -> Self {
        let table_type = match group.soft_mask {
            Some(SoftMaskKind::Alpha) => TableType::Alpha,
            Some(SoftMaskKind::Luminosity) => TableType::Isolated,
            None if group.composite_to_page && output_16bit => TableType::Output16,
            None if group.composite_to_page => TableType::Output8,
            None => TableType::Isolated,
        };
        match table_type {
            TableType::Output8 | TableType::Output16 => Self {
                table_type,
                colors: out_comps,
                alpha: false,
                group_alpha: false,
                shape: false,
            },
            TableType::Alpha => Self {
                table_type,
                colors: 0,
                alpha: true,
                group_alpha: false,
                shape: false,
            },
            TableType::Isolated => Self {
                table_type,
                colors: in_comps,
                alpha: true,
                group_alpha: nonisolated,
                shape: group.track_shape,
            },
        }
    }

    /// Channels per pixel.
    pub fn channels(&self) -> usize {
        self.colors + usize::from(self.alpha) + usize::from(self.group_alpha) + usize::from(self.shape)
    }

    /// Bytes per channel.
    pub fn bytes_per_channel(&self) -> usize {
        match self.table_type {
            TableType::Output8 => 1,
            _ => 2,
        }
    }

    /// Bytes per pixel.
    pub fn pixel_bytes(&self) -> usize {
        self.channels() * self.bytes_per_channel()
    }

    /// Bytes of one uncompressed block.
    pub fn table_bytes(&self, block_pixels: usize) -> usize {
        self.pixel_bytes() * block_pixels
    }

    /// Index of the alpha channel.
    pub fn alpha_index(&self) -> Option<usize> {
        self.alpha.then_some(self.colors)
    }

    /// Index of the group-alpha channel.
    pub fn group_alpha_index(&self) -> Option<usize> {
        self.group_alpha
            .then_some(self.colors + usize::from(self.alpha))
    }

    /// Index of the shape channel.
    pub fn shape_index(&self) -> Option<usize> {
        self.shape
            .then_some(self.colors + usize::from(self.alpha) + usize::from(self.group_alpha))
    }

    pub(crate) fn encode(&self, pixel: &[u16], out: &mut [u8]) {
        debug_assert_eq!(pixel.len(), self.channels());
        debug_assert_eq!(out.len(), self.pixel_bytes());
        match self.bytes_per_channel() {
            1 => {
                for (o, v) in out.iter_mut().zip(pixel) {
                    *o = (v >> 8) as u8;
                }
            }
            _ => {
                for (o, v) in out.chunks_exact_mut(2).zip(pixel) {
                    o.copy_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Pixel {
        debug_assert_eq!(bytes.len(), self.pixel_bytes());
        match self.bytes_per_channel() {
            1 => bytes.iter().map(|b| u16::from(*b) * 257).collect(),
            _ => bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        }
    }

    /// Color prefix and alpha of a pixel in this layout; layouts without alpha are opaque.
    pub(crate) fn color_and_alpha(&self, pixel: &[u16]) -> (Pixel, u16) {
        let colors = pixel[..self.colors].iter().copied().collect();
        let alpha = self.alpha_index().map_or(COLOR_ONE, |i| pixel[i]);
        (colors, alpha)
    }
}

/// Worst-case table bytes for `in_comps` colorants, used before the exact layouts are known.
pub(crate) fn estimate_table_size(block_pixels: usize, in_comps: usize, nonisolated: bool) -> usize {
    // colors + alpha + shape (+ group alpha), 16 bits each
    block_pixels * 2 * (in_comps + 2 + usize::from(nonisolated))
}

/// Compositing progress of a present block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    InProgress,
    Complete,
}

pub(crate) enum BlockBody {
    /// Uncompressed, in a resource the compositing context holds.
    Working(ResourceHandle),
    /// Uncompressed, in a resource detached from its context.
    Retained(ResourceHandle),
    /// Every pixel carries the same value.
    Uniform {
        pixel: SmallVec<[u8; 16]>,
        _alloc: PoolAllocation,
    },
    /// Copy in the page data pool; listed as purgeable.
    Stored {
        bytes: Arc<[u8]>,
        _alloc: PoolAllocation,
    },
    /// Paged out to the spill file.
    Spilled(SpillSlot),
    /// Paged back in for a reader.
    Loaded {
        handle: ResourceHandle,
        slot: SpillSlot,
        owner: OwnerId,
    },
}

pub(crate) struct Block {
    pub(crate) bx: u32,
    pub(crate) by: u32,
    pub(crate) state: BlockState,
    pub(crate) body: BlockBody,
    pub(crate) read_pins: u32,
}

impl Block {
    pub(crate) fn working(bx: u32, by: u32, handle: ResourceHandle) -> Self {
        Self {
            bx,
            by,
            state: BlockState::InProgress,
            body: BlockBody::Working(handle),
            read_pins: 0,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == BlockState::Complete
    }

    pub(crate) fn status(&self) -> BlockStatus {
        if self.state == BlockState::InProgress {
            return BlockStatus::InProgress;
        }
        match self.body {
            BlockBody::Working(_) | BlockBody::Stored { .. } => BlockStatus::CompleteInMemory,
            BlockBody::Uniform { .. } => BlockStatus::CompleteUniform,
            BlockBody::Retained(_) => BlockStatus::CompleteRetained,
            BlockBody::Spilled(_) => BlockStatus::CompleteOnDisk,
            BlockBody::Loaded { .. } => BlockStatus::BeingLoaded,
        }
    }
}

/// Observable state of one block slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum BlockStatus {
    /// No block (or a stale one from another band).
    Absent,
    /// Created and being composited.
    InProgress,
    /// Complete, body in memory.
    CompleteInMemory,
    /// Complete, a single repeated pixel.
    CompleteUniform,
    /// Complete, body held in a detached block-storage resource.
    CompleteRetained,
    /// Complete, body in the spill file.
    CompleteOnDisk,
    /// Complete, paged in for a reader.
    BeingLoaded,
}

/// Block slots of one layer. Each slot has its own lock.
pub(crate) struct BlockTable {
    pub(crate) layer: LayerId,
    slots: Box<[Mutex<Option<Block>>]>,
}

impl BlockTable {
    pub(crate) fn new(layer: LayerId, len: usize) -> Self {
        Self {
            layer,
            slots: (0..len).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: usize) -> BackdropResult<&Mutex<Option<Block>>> {
        self.slots.get(index).ok_or_else(|| {
            BackdropError::validation(format!(
                "block slot {index} outside table of {} for layer {:?}",
                self.slots.len(),
                self.layer
            ))
        })
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &Mutex<Option<Block>>> {
        self.slots.iter()
    }
}

/// Per-slot memory the page charges for a layer's block table.
pub(crate) const BLOCK_HEADER_BYTES: usize = std::mem::size_of::<Mutex<Option<Block>>>();

pub(crate) fn fill_pixels(buf: &mut [u8], pixel: &[u8]) {
    for chunk in buf.chunks_exact_mut(pixel.len()) {
        chunk.copy_from_slice(pixel);
    }
}

/// The repeated pixel when every pixel of `buf` is identical.
pub(crate) fn uniform_pixel(buf: &[u8], pixel_bytes: usize) -> Option<&[u8]> {
    let mut chunks = buf.chunks_exact(pixel_bytes);
    let first = chunks.next()?;
    chunks.all(|c| c == first).then_some(first)
}

#[cfg(test)]
#[path = "../../tests/unit/backdrop/block.rs"]
mod tests;
