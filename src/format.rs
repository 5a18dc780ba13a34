//! Pixel formats, usage bits, transforms, and rectangle geometry.
//!
//! # Design Principles
//!
//! - **Type safety**: enums and newtypes instead of raw integers
//! - **Zero-cost**: small, Copy types throughout
//! - **Explicit boundaries**: raw values are validated once, at
//!   `from_raw`, and are unrepresentable past that point

use std::fmt;

// ============================================================================
// PixelFormat
// ============================================================================

/// Pixel format of a graphics buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 32-bit RGBA, 8 bits per channel.
    #[default]
    Rgba8888,
    /// 32-bit RGBX, alpha ignored.
    Rgbx8888,
    /// 24-bit packed RGB.
    Rgb888,
    /// 16-bit RGB 5:6:5.
    Rgb565,
    /// 32-bit BGRA, 8 bits per channel.
    Bgra8888,
}

impl PixelFormat {
    /// Bytes per pixel for this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8888 | Self::Rgbx8888 | Self::Bgra8888 => 4,
            Self::Rgb888 => 3,
            Self::Rgb565 => 2,
        }
    }

    /// Parse a raw format value. `0` is "unspecified" and is mapped by the
    /// queue to its default format, so it is not accepted here.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Rgba8888),
            2 => Some(Self::Rgbx8888),
            3 => Some(Self::Rgb888),
            4 => Some(Self::Rgb565),
            5 => Some(Self::Bgra8888),
            _ => None,
        }
    }

    /// The raw wire value of this format.
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Rgba8888 => 1,
            Self::Rgbx8888 => 2,
            Self::Rgb888 => 3,
            Self::Rgb565 => 4,
            Self::Bgra8888 => 5,
        }
    }
}

// ============================================================================
// Usage
// ============================================================================

/// Buffer usage bits.
///
/// Usage is additive: the allocator must satisfy every bit set. A buffer
/// may be reused for a request whose usage is a subset of what the buffer
/// was allocated with (see [`Usage::contains`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Usage(u32);

impl Usage {
    /// No usage bits.
    pub const NONE: Self = Self(0);
    /// CPU reads the buffer contents.
    pub const CPU_READ: Self = Self(1 << 0);
    /// CPU writes the buffer contents.
    pub const CPU_WRITE: Self = Self(1 << 1);
    /// GPU samples the buffer as a texture.
    pub const GPU_TEXTURE: Self = Self(1 << 2);
    /// GPU renders into the buffer.
    pub const GPU_RENDER_TARGET: Self = Self(1 << 3);
    /// The display controller scans the buffer out directly.
    pub const COMPOSER_OVERLAY: Self = Self(1 << 4);

    /// Construct from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two usage sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check for the empty set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Usage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for Usage {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// ============================================================================
// Transform
// ============================================================================

/// Display transform bits carried with a queued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Transform(u32);

impl Transform {
    /// Identity transform.
    pub const IDENTITY: Self = Self(0);
    /// Horizontal flip.
    pub const FLIP_H: Self = Self(1 << 0);
    /// Vertical flip.
    pub const FLIP_V: Self = Self(1 << 1);
    /// 90-degree clockwise rotation.
    pub const ROT_90: Self = Self(1 << 2);
    /// The frame should additionally be inverted for the display. This bit
    /// travels separately from the sampling transform (it is split off at
    /// queue time).
    pub const INVERSE_DISPLAY: Self = Self(1 << 3);

    /// Construct from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// This transform with the inverse-display bit cleared.
    pub const fn without_inverse_display(self) -> Self {
        Self(self.0 & !Self::INVERSE_DISPLAY.0)
    }
}

impl std::ops::BitOr for Transform {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// ScalingMode
// ============================================================================

/// How a queued frame maps onto the consumer's output geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScalingMode {
    /// The frame is displayed at its own size; no scaling.
    #[default]
    Freeze,
    /// The frame is scaled to fill the window.
    ScaleToWindow,
    /// The frame is scaled and cropped to preserve aspect ratio.
    ScaleCrop,
    /// Like [`ScalingMode::ScaleCrop`] but without scaling.
    NoScaleCrop,
}

impl ScalingMode {
    /// Parse a raw scaling mode value; any value outside the enumerated
    /// set is rejected.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Freeze),
            1 => Some(Self::ScaleToWindow),
            2 => Some(Self::ScaleCrop),
            3 => Some(Self::NoScaleCrop),
            _ => None,
        }
    }

    /// The raw wire value of this mode.
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Freeze => 0,
            Self::ScaleToWindow => 1,
            Self::ScaleCrop => 2,
            Self::NoScaleCrop => 3,
        }
    }
}

// ============================================================================
// Rect
// ============================================================================

/// An axis-aligned rectangle with exclusive right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Left edge (inclusive).
    pub left: i32,
    /// Top edge (inclusive).
    pub top: i32,
    /// Right edge (exclusive).
    pub right: i32,
    /// Bottom edge (exclusive).
    pub bottom: i32,
}

impl Rect {
    /// The empty rectangle at the origin.
    pub const EMPTY: Self = Self {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    /// Create a rectangle from its four edges.
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// The bounds of a `width` x `height` buffer, anchored at the origin.
    pub const fn bounds_of(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }

    /// Width of the rectangle (0 when degenerate).
    pub const fn width(&self) -> i32 {
        if self.right > self.left {
            self.right - self.left
        } else {
            0
        }
    }

    /// Height of the rectangle (0 when degenerate).
    pub const fn height(&self) -> i32 {
        if self.bottom > self.top {
            self.bottom - self.top
        } else {
            0
        }
    }

    /// True if the rectangle encloses no area.
    pub const fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersection of two rectangles. Degenerate results collapse to
    /// [`Rect::EMPTY`].
    pub fn intersect(&self, other: &Rect) -> Rect {
        let result = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        if result.left >= result.right || result.top >= result.bottom {
            Rect::EMPTY
        } else {
            result
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_raw_round_trip() {
        for fmt in [
            PixelFormat::Rgba8888,
            PixelFormat::Rgbx8888,
            PixelFormat::Rgb888,
            PixelFormat::Rgb565,
            PixelFormat::Bgra8888,
        ] {
            assert_eq!(PixelFormat::from_raw(fmt.as_raw()), Some(fmt));
        }
        assert_eq!(PixelFormat::from_raw(0), None);
        assert_eq!(PixelFormat::from_raw(99), None);
    }

    #[test]
    fn test_usage_superset() {
        let allocated = Usage::CPU_WRITE | Usage::GPU_TEXTURE | Usage::GPU_RENDER_TARGET;
        assert!(allocated.contains(Usage::GPU_TEXTURE));
        assert!(allocated.contains(Usage::CPU_WRITE | Usage::GPU_TEXTURE));
        assert!(!allocated.contains(Usage::COMPOSER_OVERLAY));
        assert!(allocated.contains(Usage::NONE));
    }

    #[test]
    fn test_scaling_mode_rejects_unknown() {
        assert_eq!(ScalingMode::from_raw(3), Some(ScalingMode::NoScaleCrop));
        assert_eq!(ScalingMode::from_raw(4), None);
        assert_eq!(ScalingMode::from_raw(u32::MAX), None);
    }

    #[test]
    fn test_transform_inverse_display_split() {
        let t = Transform::ROT_90 | Transform::INVERSE_DISPLAY;
        assert!(t.contains(Transform::INVERSE_DISPLAY));
        let sampling = t.without_inverse_display();
        assert!(!sampling.contains(Transform::INVERSE_DISPLAY));
        assert!(sampling.contains(Transform::ROT_90));
    }

    #[test]
    fn test_rect_intersect() {
        let buffer = Rect::bounds_of(100, 100);
        let crop = Rect::new(10, 10, 50, 50);
        assert_eq!(crop.intersect(&buffer), crop);

        let oversize = Rect::new(-10, -10, 150, 150);
        assert_eq!(oversize.intersect(&buffer), buffer);

        let disjoint = Rect::new(200, 200, 300, 300);
        assert!(disjoint.intersect(&buffer).is_empty());
    }

    #[test]
    fn test_rect_intersect_idempotent() {
        let buffer = Rect::bounds_of(640, 480);
        let crop = Rect::new(5, 7, 641, 200);
        let once = crop.intersect(&buffer);
        let twice = once.intersect(&buffer);
        assert_eq!(once, twice);
    }
}
