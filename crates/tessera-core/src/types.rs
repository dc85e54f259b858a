//! Integer geometry shared by the atlas packer and the transfer commands

use glam::UVec2;

/// Axis-aligned rectangle in texel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region anchored at the origin
    pub const fn with_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn pos(&self) -> UVec2 {
        UVec2::new(self.x, self.y)
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `width × height` fits inside this region
    pub fn fits(&self, width: u32, height: u32) -> bool {
        width <= self.width && height <= self.height
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Whether the two regions share at least one texel
    pub fn intersects(&self, other: &Region) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Normalized `(u_min, v_min, u_max, v_max)` inside a `width × height` surface
    pub fn uv_rect(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        (
            self.x as f32 / w,
            self.y as f32 / h,
            self.right() as f32 / w,
            self.bottom() as f32 / h,
        )
    }
}
