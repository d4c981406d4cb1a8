//! In-place colorspace conversion of float pixel buffers.
//!
//! Only the conversions modules of this pipeline need are provided: linear
//! RGB to and from Lab and HSL. `Colorspace::None` as a target means "take
//! whatever comes", as a source it is a plain retag.

use crate::buffer::{Colorspace, DataType, PixelViewMut};
use crate::error::{PipeError, PipeResult};

// Linear sRGB primaries, D65 white.
const RGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412_456_4, 0.357_576_1, 0.180_437_5],
    [0.212_672_9, 0.715_152_2, 0.072_175],
    [0.019_333_9, 0.119_192, 0.950_304_1],
];
const XYZ_TO_RGB: [[f32; 3]; 3] = [
    [3.240_454_2, -1.537_138_5, -0.498_531_4],
    [-0.969_266, 1.876_010_8, 0.041_556],
    [0.055_643_4, -0.204_025_9, 1.057_225_2],
];
const D65: [f32; 3] = [0.950_47, 1.0, 1.088_83];

const LAB_EPSILON: f32 = 216.0 / 24389.0;
const LAB_KAPPA: f32 = 24389.0 / 27.0;

pub trait ColorspaceConverter: Send + Sync {
    /// Converts interleaved pixels with `channels` components from `from` to
    /// `to`. Channels past the third are left untouched.
    fn convert(&self, data: &mut [f32], channels: usize, from: Colorspace, to: Colorspace) -> PipeResult<()>;

    /// Converts a whole buffer and retags its descriptor.
    fn convert_view(&self, view: &mut PixelViewMut<'_>, to: Colorspace) -> PipeResult<()> {
        let from = view.dsc.cst;
        if !needs_conversion(from, to) {
            if from == Colorspace::None {
                view.dsc.cst = to;
            }
            return Ok(());
        }
        if view.dsc.datatype != DataType::Float32 {
            return Err(PipeError::Conversion { from, to });
        }
        let channels = view.dsc.channels;
        let len = view.roi.pixels() * channels;
        self.convert(&mut view.as_f32_mut()[..len], channels, from, to)?;
        view.dsc.cst = to;
        Ok(())
    }
}

/// Whether pixel data tagged `from` must be touched to be usable as `to`.
pub fn needs_conversion(from: Colorspace, to: Colorspace) -> bool {
    from != to && from != Colorspace::None && to != Colorspace::None
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StandardConverter;

impl ColorspaceConverter for StandardConverter {
    fn convert(&self, data: &mut [f32], channels: usize, from: Colorspace, to: Colorspace) -> PipeResult<()> {
        if !needs_conversion(from, to) {
            return Ok(());
        }
        if channels < 3 {
            return Err(PipeError::Conversion { from, to });
        }

        let to_rgb: fn(&mut [f32]) = match from {
            Colorspace::Rgb => unchanged,
            Colorspace::Lab => lab_to_rgb,
            Colorspace::Hsl => hsl_to_rgb,
            _ => return Err(PipeError::Conversion { from, to }),
        };
        let from_rgb: fn(&mut [f32]) = match to {
            Colorspace::Rgb => unchanged,
            Colorspace::Lab => rgb_to_lab,
            Colorspace::Hsl => rgb_to_hsl,
            _ => return Err(PipeError::Conversion { from, to }),
        };

        common::parallel::for_each_pixel(data, channels, |px| {
            to_rgb(px);
            from_rgb(px);
        });
        Ok(())
    }
}

fn unchanged(_: &mut [f32]) {}

fn mul3(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        (LAB_KAPPA * t + 16.0) / 116.0
    }
}

fn lab_f_inv(f: f32) -> f32 {
    let cube = f * f * f;
    if cube > LAB_EPSILON {
        cube
    } else {
        (116.0 * f - 16.0) / LAB_KAPPA
    }
}

fn rgb_to_lab(px: &mut [f32]) {
    let xyz = mul3(&RGB_TO_XYZ, [px[0], px[1], px[2]]);
    let fx = lab_f(xyz[0] / D65[0]);
    let fy = lab_f(xyz[1] / D65[1]);
    let fz = lab_f(xyz[2] / D65[2]);
    px[0] = 116.0 * fy - 16.0;
    px[1] = 500.0 * (fx - fy);
    px[2] = 200.0 * (fy - fz);
}

fn lab_to_rgb(px: &mut [f32]) {
    let fy = (px[0] + 16.0) / 116.0;
    let fx = fy + px[1] / 500.0;
    let fz = fy - px[2] / 200.0;
    let xyz = [
        lab_f_inv(fx) * D65[0],
        lab_f_inv(fy) * D65[1],
        lab_f_inv(fz) * D65[2],
    ];
    let rgb = mul3(&XYZ_TO_RGB, xyz);
    px[..3].copy_from_slice(&rgb);
}

fn rgb_to_hsl(px: &mut [f32]) {
    let (r, g, b) = (px[0], px[1], px[2]);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    let delta = max - min;

    if delta <= f32::EPSILON {
        px[0] = 0.0;
        px[1] = 0.0;
        px[2] = l;
        return;
    }

    let s = if l < 0.5 {
        delta / (max + min)
    } else {
        delta / (2.0 - max - min)
    };
    let h = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    } / 6.0;

    px[0] = h;
    px[1] = s;
    px[2] = l;
}

fn hsl_to_rgb(px: &mut [f32]) {
    let (h, s, l) = (px[0], px[1], px[2]);
    if s <= f32::EPSILON {
        px[..3].fill(l);
        return;
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let hue = |t: f32| {
        let t = t.rem_euclid(1.0);
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    px[0] = hue(h + 1.0 / 3.0);
    px[1] = hue(h);
    px[2] = hue(h - 1.0 / 3.0);
}
