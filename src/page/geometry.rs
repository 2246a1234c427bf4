//! Mapping between device pixels, blocks and regions.
//!
//! A page is split into regions `region_height` lines tall, and each region into
//! `block_rows_per_region` rows of equal-height blocks. When the region height is not a multiple
//! of the block height the last block row of each region wastes a few lines, which keeps every
//! block the same size so block storage can be recycled between rows.

use crate::foundation::core::DeviceBox;
use crate::foundation::error::{BackdropError, BackdropResult};

/// Block addressing for one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Geometry {
    /// Page width in pixels.
    pub width: u32,
    /// Page height in pixels.
    pub height: u32,
    /// Region height in pixels.
    pub region_height: u32,
    /// Regions per band.
    pub region_rows_per_band: u32,
    /// Block width, a power of two.
    pub block_width: u32,
    block_width_shift: u32,
    /// Block height in pixels.
    pub block_height: u32,
    /// Block rows covering one region.
    pub block_rows_per_region: u32,
    /// Blocks across the page.
    pub xblock: u32,
    /// Block rows down the page.
    pub yblock: u32,
}

impl Geometry {
    /// Derive block geometry.
    pub fn new(
        width: u32,
        height: u32,
        region_height: u32,
        region_rows_per_band: u32,
        block_width: u32,
        max_block_height: u32,
    ) -> BackdropResult<Self> {
        if width == 0 || height == 0 {
            return Err(BackdropError::validation(format!(
                "page size must be non-zero, got {width}x{height}"
            )));
        }
        if width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(BackdropError::validation("page size exceeds device range"));
        }
        if region_height == 0 {
            return Err(BackdropError::validation("region height must be > 0"));
        }
        if region_rows_per_band == 0 {
            return Err(BackdropError::validation("regions per band must be >= 1"));
        }
        if !block_width.is_power_of_two() {
            return Err(BackdropError::validation(format!(
                "block width must be a power of two, got {block_width}"
            )));
        }
        if max_block_height == 0 {
            return Err(BackdropError::validation("max block height must be > 0"));
        }

        let block_rows_per_region = region_height.div_ceil(max_block_height);
        let block_height = region_height.div_ceil(block_rows_per_region);
        let regions = height.div_ceil(region_height);

        Ok(Self {
            width,
            height,
            region_height,
            region_rows_per_band,
            block_width,
            block_width_shift: block_width.trailing_zeros(),
            block_height,
            block_rows_per_region,
            xblock: width.div_ceil(block_width),
            yblock: regions * block_rows_per_region,
        })
    }

    /// Whole page as a device box.
    pub fn page_box(&self) -> DeviceBox {
        DeviceBox::from_size(self.width, self.height)
    }

    /// Pixels in one block.
    pub fn block_pixels(&self) -> usize {
        self.block_width as usize * self.block_height as usize
    }

    /// Height of a band in pixels.
    pub fn band_height(&self) -> u32 {
        self.region_height * self.region_rows_per_band
    }

    /// Block rows in one band; the slot count a row-reusing layer keeps.
    pub fn band_block_rows(&self) -> u32 {
        (self.block_rows_per_region * self.region_rows_per_band).min(self.yblock)
    }

    /// Block column holding `x`.
    pub fn block_index_x(&self, x: i32) -> u32 {
        debug_assert!(x >= 0 && (x as u32) < self.width, "x {x} outside page");
        let bx = (x as u32) >> self.block_width_shift;
        debug_assert_eq!(bx, self.block_index_x_slow(x));
        bx
    }

    fn block_index_x_slow(&self, x: i32) -> u32 {
        x as u32 / self.block_width
    }

    /// Block row holding `y`.
    pub fn block_index_y(&self, y: i32) -> u32 {
        debug_assert!(y >= 0 && (y as u32) < self.height, "y {y} outside page");
        let y = y as u32;
        let region = y / self.region_height;
        region * self.block_rows_per_region + (y % self.region_height) / self.block_height
    }

    /// Column of `x` inside its block.
    pub fn pixel_index_x(&self, x: i32) -> u32 {
        debug_assert!(x >= 0 && (x as u32) < self.width, "x {x} outside page");
        (x as u32) & (self.block_width - 1)
    }

    /// Line of `y` inside its block.
    pub fn pixel_index_y(&self, y: i32) -> u32 {
        debug_assert!(y >= 0 && (y as u32) < self.height, "y {y} outside page");
        ((y as u32) % self.region_height) % self.block_height
    }

    /// Device x of column `px` in block column `bx`.
    pub fn device_x(&self, bx: u32, px: u32) -> i32 {
        ((bx << self.block_width_shift) + px) as i32
    }

    /// Device y of line `py` in block row `by`.
    pub fn device_y(&self, by: u32, py: u32) -> i32 {
        let region = by / self.block_rows_per_region;
        let row = by % self.block_rows_per_region;
        (region * self.region_height + row * self.block_height + py) as i32
    }

    /// Flat page-wide block index.
    pub fn block_index(&self, bx: u32, by: u32) -> usize {
        debug_assert!(bx < self.xblock && by < self.yblock);
        by as usize * self.xblock as usize + bx as usize
    }

    /// Device pixels a block covers, clipped to its region and the page.
    pub fn block_bounds(&self, bx: u32, by: u32) -> DeviceBox {
        let region = by / self.block_rows_per_region;
        let y1 = self.device_y(by, 0);
        let region_end = ((region + 1) * self.region_height).min(self.height) as i32;
        let y2 = (y1 + self.block_height as i32).min(region_end) - 1;
        let x1 = self.device_x(bx, 0);
        let x2 = (x1 + self.block_width as i32).min(self.width as i32) - 1;
        DeviceBox { x1, y1, x2, y2 }
    }

    /// Blocks overlapping `bounds`, which must lie on the page.
    pub fn block_rect(&self, bounds: DeviceBox) -> BlockRect {
        BlockRect {
            bx1: self.block_index_x(bounds.x1),
            by1: self.block_index_y(bounds.y1),
            bx2: self.block_index_x(bounds.x2),
            by2: self.block_index_y(bounds.y2),
        }
    }
}

/// Inclusive rectangle of block coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRect {
    /// First block column.
    pub bx1: u32,
    /// First block row.
    pub by1: u32,
    /// Last block column.
    pub bx2: u32,
    /// Last block row.
    pub by2: u32,
}

impl BlockRect {
    /// Columns spanned.
    pub fn cols(self) -> u32 {
        self.bx2 - self.bx1 + 1
    }

    /// Rows spanned.
    pub fn rows(self) -> u32 {
        self.by2 - self.by1 + 1
    }

    /// Blocks spanned.
    pub fn count(self) -> usize {
        self.cols() as usize * self.rows() as usize
    }

    /// Row-major iteration over `(bx, by)`.
    pub fn iter(self) -> impl Iterator<Item = (u32, u32)> {
        (self.by1..=self.by2).flat_map(move |by| (self.bx1..=self.bx2).map(move |bx| (bx, by)))
    }

    /// The `n`th block in row-major order.
    pub(crate) fn nth(self, n: usize) -> Option<(u32, u32)> {
        if n >= self.count() {
            return None;
        }
        let cols = self.cols() as usize;
        Some((self.bx1 + (n % cols) as u32, self.by1 + (n / cols) as u32))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/page/geometry.rs"]
mod tests;
