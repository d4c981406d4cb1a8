//! Blending of a module's output with its input.

use std::hash::Hasher;
use std::sync::Arc;

use common::Djb2Hasher;
use strum_macros::{AsRefStr, Display};

use crate::buffer::{DataType, PixelView, PixelViewMut};
use crate::error::{ModuleError, ModuleResult};
use crate::roi::Roi;

/// Mask id under which a node publishes its blend mask.
pub const BLEND_RASTER_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, AsRefStr)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Lighten,
    Darken,
    Difference,
}

impl BlendMode {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BlendMode::Normal => b,
            BlendMode::Multiply => a * b,
            BlendMode::Lighten => a.max(b),
            BlendMode::Darken => a.min(b),
            BlendMode::Difference => (a - b).abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, AsRefStr)]
pub enum MaskMode {
    #[default]
    Disabled,
    Uniform,
    /// Weights come from a raster mask published by an earlier module.
    Raster,
}

/// Where a raster-mask consumer takes its mask from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RasterSource {
    pub module: String,
    pub mask_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlendParams {
    pub mode: BlendMode,
    pub mask_mode: MaskMode,
    pub opacity: f32,
    pub raster_source: Option<RasterSource>,
}

impl Default for BlendParams {
    fn default() -> Self {
        Self {
            mode: BlendMode::Normal,
            mask_mode: MaskMode::Disabled,
            opacity: 1.0,
            raster_source: None,
        }
    }
}

impl BlendParams {
    pub fn uniform(mode: BlendMode, opacity: f32) -> Self {
        Self {
            mode,
            mask_mode: MaskMode::Uniform,
            opacity,
            raster_source: None,
        }
    }

    pub fn raster(module: &str, mask_id: u32, opacity: f32) -> Self {
        Self {
            mode: BlendMode::Normal,
            mask_mode: MaskMode::Raster,
            opacity,
            raster_source: Some(RasterSource {
                module: module.to_string(),
                mask_id,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mask_mode != MaskMode::Disabled
    }

    pub fn hash_into(&self, hasher: &mut Djb2Hasher) {
        hasher.write(self.mode.as_ref().as_bytes());
        hasher.write(self.mask_mode.as_ref().as_bytes());
        hasher.write(&self.opacity.to_le_bytes());
        if let Some(source) = &self.raster_source {
            hasher.write(source.module.as_bytes());
            hasher.write(&source.mask_id.to_le_bytes());
        }
    }
}

/// Single-channel float weights covering `roi`.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMask {
    pub roi: Roi,
    pub data: Arc<Vec<f32>>,
}

impl RasterMask {
    pub fn new(roi: Roi, data: Vec<f32>) -> Self {
        Self {
            roi,
            data: Arc::new(data),
        }
    }

    pub fn uniform(roi: Roi, value: f32) -> Self {
        Self::new(roi, vec![value; roi.pixels()])
    }
}

pub trait Blender: Send + Sync {
    /// Blends `output` over `input`, writing into `output`. Both must share
    /// the same colorspace. Returns the per-pixel weights that were applied.
    fn blend(
        &self,
        params: &BlendParams,
        input: PixelView<'_>,
        output: PixelViewMut<'_>,
        raster: Option<&RasterMask>,
    ) -> ModuleResult<RasterMask>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBlender;

impl DefaultBlender {
    fn weights(params: &BlendParams, roi: &Roi, raster: Option<&RasterMask>) -> ModuleResult<Vec<f32>> {
        let opacity = params.opacity.clamp(0.0, 1.0);
        match params.mask_mode {
            MaskMode::Disabled => Ok(vec![0.0; roi.pixels()]),
            MaskMode::Uniform => Ok(vec![opacity; roi.pixels()]),
            MaskMode::Raster => {
                let mask = raster.ok_or(ModuleError::Failed("raster mask not provided".into()))?;
                if mask.roi.width != roi.width || mask.roi.height != roi.height {
                    return Err(ModuleError::Failed(format!(
                        "raster mask is {}x{}, output is {}x{}",
                        mask.roi.width, mask.roi.height, roi.width, roi.height
                    )));
                }
                Ok(mask.data.iter().map(|w| w.clamp(0.0, 1.0) * opacity).collect())
            }
        }
    }
}

impl Blender for DefaultBlender {
    fn blend(
        &self,
        params: &BlendParams,
        input: PixelView<'_>,
        mut output: PixelViewMut<'_>,
        raster: Option<&RasterMask>,
    ) -> ModuleResult<RasterMask> {
        let out_roi = output.roi;
        let weights = Self::weights(params, &out_roi, raster)?;
        if !params.is_enabled() {
            return Ok(RasterMask::new(out_roi, weights));
        }

        let in_dsc = input.dsc;
        let out_dsc = output.dsc;
        if in_dsc.datatype != DataType::Float32
            || out_dsc.datatype != DataType::Float32
            || in_dsc.channels != out_dsc.channels
        {
            return Err(ModuleError::Failed(format!(
                "cannot blend {}x{} over {}x{}",
                out_dsc.channels, out_dsc.datatype, in_dsc.channels, in_dsc.datatype
            )));
        }
        if in_dsc.cst != out_dsc.cst {
            return Err(ModuleError::Failed(format!(
                "blend colorspaces differ: {} vs {}",
                in_dsc.cst, out_dsc.cst
            )));
        }

        let ch = out_dsc.channels;
        let color = ch.min(3);
        let in_roi = input.roi;
        let same_scale = (in_roi.scale - out_roi.scale).abs() < f32::EPSILON;
        let src = &input.as_f32()[..in_roi.pixels() * ch];
        let dst = &mut output.as_f32_mut()[..out_roi.pixels() * ch];
        let mode = params.mode;
        let weights_ref = &weights;

        common::parallel::for_each_row_chunk(dst, out_roi.width * ch, |first_row, rows| {
            for (local, row) in rows.chunks_exact_mut(out_roi.width * ch).enumerate() {
                let y = first_row + local;
                let iy = out_roi.y + y as i32 - in_roi.y;
                for x in 0..out_roi.width {
                    let w = weights_ref[y * out_roi.width + x];
                    let ix = out_roi.x + x as i32 - in_roi.x;
                    let inside = same_scale
                        && (0..in_roi.width as i32).contains(&ix)
                        && (0..in_roi.height as i32).contains(&iy);
                    let px = &mut row[x * ch..(x + 1) * ch];
                    if !inside {
                        continue;
                    }
                    let base = (iy as usize * in_roi.width + ix as usize) * ch;
                    for c in 0..color {
                        let a = src[base + c];
                        let b = px[c];
                        px[c] = a * (1.0 - w) + mode.apply(a, b) * w;
                    }
                }
            }
        });

        Ok(RasterMask::new(out_roi, weights))
    }
}
