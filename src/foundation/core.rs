use crate::foundation::error::{BackdropError, BackdropResult};

/// Device-space colorant index. Negative values never name a real colorant.
pub type ColorantIndex = i32;

/// Sentinel for "colorant absent from this layer" in remapping tables.
pub const COLORANT_NONE: ColorantIndex = -1;

/// Full-intensity channel value. Channel values are 16-bit fixed point in `0..=COLOR_ONE`.
pub const COLOR_ONE: u16 = 0xFFFF;

/// Device bounding box with inclusive edges, the renderer's span convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DeviceBox {
    /// Left edge (inclusive).
    pub x1: i32,
    /// Top edge (inclusive).
    pub y1: i32,
    /// Right edge (inclusive).
    pub x2: i32,
    /// Bottom edge (inclusive).
    pub y2: i32,
}

impl DeviceBox {
    /// Build a box from inclusive edges. Fails when the box would be empty.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> BackdropResult<Self> {
        if x1 > x2 || y1 > y2 {
            return Err(BackdropError::validation(format!(
                "empty device box [{x1},{y1}]-[{x2},{y2}]"
            )));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Box covering a `width` x `height` area anchored at the origin.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x1: 0,
            y1: 0,
            x2: width as i32 - 1,
            y2: height as i32 - 1,
        }
    }

    /// Width in pixels.
    pub fn width(self) -> u32 {
        (self.x2 - self.x1 + 1) as u32
    }

    /// Height in pixels.
    pub fn height(self) -> u32 {
        (self.y2 - self.y1 + 1) as u32
    }

    /// Overlap of two boxes, `None` when disjoint.
    pub fn intersect(self, other: Self) -> Option<Self> {
        let b = Self {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        (b.x1 <= b.x2 && b.y1 <= b.y2).then_some(b)
    }

    /// Smallest box covering both.
    pub fn union(self, other: Self) -> Self {
        Self {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// `true` when `other` lies entirely inside `self`.
    pub fn contains_box(self, other: Self) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    /// `true` when the pixel `(x, y)` lies inside.
    pub fn contains(self, x: i32, y: i32) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }
}

/// Rendering intent recorded in pixel labels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RenderingIntent {
    /// Perceptual.
    Perceptual,
    /// Relative colorimetric (the PDF default).
    #[default]
    RelativeColorimetric,
    /// Saturation.
    Saturation,
    /// Absolute colorimetric.
    AbsoluteColorimetric,
}

/// Per-pixel label: rendering intent in the low bits, spot flag in the top bit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelLabel(pub u8);

impl PixelLabel {
    const SPOT: u8 = 0x80;

    /// Build a label.
    pub fn new(intent: RenderingIntent, spot: bool) -> Self {
        let bits = intent as u8;
        Self(if spot { bits | Self::SPOT } else { bits })
    }

    /// Rendering intent carried by the label.
    pub fn intent(self) -> RenderingIntent {
        match self.0 & !Self::SPOT {
            0 => RenderingIntent::Perceptual,
            2 => RenderingIntent::Saturation,
            3 => RenderingIntent::AbsoluteColorimetric,
            _ => RenderingIntent::RelativeColorimetric,
        }
    }

    /// `true` when the label marks spot-colored content.
    pub fn is_spot(self) -> bool {
        self.0 & Self::SPOT != 0
    }
}

/// Convert a `[0, 1]` float to a 16-bit channel value.
pub(crate) fn channel_from_f32(v: f32) -> u16 {
    (v.clamp(0.0, 1.0) * f32::from(COLOR_ONE)).round() as u16
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;
