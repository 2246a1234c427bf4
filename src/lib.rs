//! Backdrop is a block cache for transparency compositing during page rasterization.
//!
//! Every transparency group on a page gets a [`BackdropLayer`] whose pixels live in fixed-size
//! blocks. Blocks are materialized on demand per region, composited by a worker holding a
//! [`CompositeContext`], then either freed or kept in a compact form (uniform pixel, data-pool
//! copy, spill file, or a retained resource) according to the page's [`Retention`].
//!
//! - Boot a [`BackdropSystem`] and create a [`SharedPageState`] per page
//! - Provision resources, build layers, and `prepare` the retention policy
//! - Per worker: `band_init`, `request_regions`, `region_init`, `write_span`,
//!   `region_complete`, `region_release_all`, `band_release`
//! - Read composited output back with `reader_init` / `reader_next`
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod backdrop;
mod evict;
mod foundation;
mod page;
mod region;
mod resource;
mod spill;

pub use crate::foundation::core::{
    COLOR_ONE, COLORANT_NONE, ColorantIndex, DeviceBox, PixelLabel, RenderingIntent,
};
pub use crate::foundation::error::{BackdropError, BackdropResult};
pub use crate::foundation::memory::{
    Allocation, CostTier, LowMemOffer, LowMemoryHandler, MemoryArena,
};
pub use crate::foundation::opts::{BackdropOpts, SpillOpts};

pub use crate::resource::pool::{
    FixOutcome, OwnerId, ResourceClass, ResourceHandle, ResourceId, ResourcePool,
};

pub use crate::backdrop::block::{BlockStatus, Pixel, PixelLayout, TableType};
pub use crate::backdrop::layer::{
    BackdropLayer, ColorConverter, GroupAttrs, LayerId, LayerSpec, SoftMaskKind,
};

pub use crate::evict::reserve::BackdropReserve;

pub use crate::page::geometry::{BlockRect, Geometry};
pub use crate::page::provision::Provisioning;
pub use crate::page::shared::SharedPageState;
pub use crate::page::stats::BackdropStats;
pub use crate::page::system::BackdropSystem;

pub use crate::region::context::CompositeContext;
pub use crate::region::lifecycle::{RegionState, RequestOutcome, Retention};
pub use crate::region::reader::{BlockData, BlockRead};
