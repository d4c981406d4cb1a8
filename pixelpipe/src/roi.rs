use std::hash::{Hash, Hasher};

/// Region of interest: a rectangle over the image scaled by `scale`.
///
/// `x`, `y`, `width` and `height` are in output pixels, i.e. already multiplied
/// by `scale` relative to the full-resolution image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: usize,
    pub height: usize,
    pub scale: f32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: usize, height: usize, scale: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale,
        }
    }

    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height, 1.0)
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Same rectangle and scale, compared exactly.
    pub fn same_area(&self, other: &Roi) -> bool {
        self == other
    }

    /// Grows the rectangle by `margin` pixels on every side.
    pub fn padded(&self, margin: usize) -> Self {
        Self {
            x: self.x - margin as i32,
            y: self.y - margin as i32,
            width: self.width + 2 * margin,
            height: self.height + 2 * margin,
            scale: self.scale,
        }
    }

    /// Clamps the rectangle to `[0, width) x [0, height)`.
    pub fn clamped_to(&self, width: usize, height: usize) -> Self {
        let x0 = self.x.clamp(0, width as i32);
        let y0 = self.y.clamp(0, height as i32);
        let x1 = (self.x + self.width as i32).clamp(x0, width as i32);
        let y1 = (self.y + self.height as i32).clamp(y0, height as i32);
        Self {
            x: x0,
            y: y0,
            width: (x1 - x0) as usize,
            height: (y1 - y0) as usize,
            scale: self.scale,
        }
    }
}

impl Hash for Roi {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.x);
        state.write_i32(self.y);
        state.write_u64(self.width as u64);
        state.write_u64(self.height as u64);
        state.write_u32(self.scale.to_bits());
    }
}
