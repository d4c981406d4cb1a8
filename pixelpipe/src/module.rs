//! The interface every processing module implements.
//!
//! The executor only branches on the capability bits a module declares,
//! never on which module it is looking at.

use std::sync::Arc;

use bitflags::bitflags;
use strum_macros::Display;

use crate::buffer::{BufferDesc, Colorspace, PixelView, PixelViewMut};
use crate::device::{DeviceId, DeviceLayer, ImageHandle};
use crate::error::{ModuleError, ModuleResult};
use crate::roi::Roi;
use crate::tiling::{self, TilingRequirements};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OperationTags: u32 {
        /// Moves pixels around: ROIs, masks and picker positions must follow.
        const DISTORT = 1 << 0;
        const CLIPPING = 1 << 1;
        const DECORATIVE = 1 << 2;
        const CROPPING = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModuleFlags: u32 {
        const SUPPORTS_BLENDING = 1 << 0;
        const SUPPORTS_TILING = 1 << 1;
        const SUPPORTS_GPU = 1 << 2;
        /// Never run on the GPU in the preview pipe.
        const PREVIEW_NON_GPU = 1 << 3;
        /// Terminal display step; never bypassed for mask display.
        const DISPLAY_SINK = 1 << 4;
        const HIDDEN = 1 << 5;
    }
}

/// Which global histogram is fed from around a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum HistogramRole {
    #[default]
    None,
    /// Output of the demosaic step.
    Raw,
    /// Output of the color-output step.
    Output,
    /// Input of the terminal display step.
    Display,
}

/// Device context handed to [`Module::process_gpu`].
pub struct GpuTask<'a> {
    pub layer: &'a Arc<dyn DeviceLayer>,
    pub device: DeviceId,
}

impl GpuTask<'_> {
    pub fn enqueue(&self, kernel: &str, sizes: [usize; 2]) -> ModuleResult<()> {
        self.layer.enqueue_kernel(self.device, kernel, sizes, None)?;
        Ok(())
    }
}

/// A device image together with the ROI it covers.
pub struct GpuImage<'a> {
    pub image: &'a ImageHandle,
    pub dsc: BufferDesc,
    pub roi: Roi,
}

pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Colorspace the input must be in when `process` is called.
    fn input_colorspace(&self) -> Colorspace;

    fn output_colorspace(&self) -> Colorspace {
        self.input_colorspace()
    }

    /// Colorspace blending happens in.
    fn default_colorspace(&self) -> Colorspace {
        self.input_colorspace()
    }

    /// Layout of the output buffer given the layout of the input.
    fn output_format(&self, input: &BufferDesc) -> BufferDesc {
        input.with_cst(self.output_colorspace())
    }

    fn modify_roi_out(&self, _params: &[u8], roi_in: &Roi) -> Roi {
        *roi_in
    }

    fn modify_roi_in(&self, _params: &[u8], roi_out: &Roi) -> Roi {
        *roi_out
    }

    fn process(&self, params: &[u8], input: PixelView<'_>, output: PixelViewMut<'_>) -> ModuleResult<()>;

    /// Stripe-wise CPU processing. The default slices both buffers and calls
    /// [`process`](Self::process) once per stripe.
    fn process_tiling(
        &self,
        params: &[u8],
        input: PixelView<'_>,
        output: PixelViewMut<'_>,
        requirements: &TilingRequirements,
        tile_rows: usize,
    ) -> ModuleResult<()> {
        tiling::process_tiled(input, output, requirements.overlap, tile_rows, |tile_in, tile_out| {
            self.process(params, tile_in, tile_out)
        })
    }

    fn process_gpu(
        &self,
        _task: &GpuTask<'_>,
        _params: &[u8],
        _input: GpuImage<'_>,
        _output: GpuImage<'_>,
    ) -> ModuleResult<()> {
        Err(ModuleError::Unsupported("process_gpu"))
    }

    fn tiling_callback(&self, _params: &[u8], _roi_in: &Roi, _roi_out: &Roi) -> TilingRequirements {
        TilingRequirements::default()
    }

    /// Carries a raster mask from input to output geometry.
    fn distort_mask(&self, _params: &[u8], mask: &[f32], roi_in: &Roi, roi_out: &Roi) -> Vec<f32> {
        resample_mask(mask, roi_in, roi_out)
    }

    /// Maps points from output to input coordinates of the full image.
    fn distort_backtransform(&self, _params: &[u8], _points: &mut [[f32; 2]]) {}

    fn operation_tags(&self) -> OperationTags {
        OperationTags::empty()
    }

    /// Tags of operations this module must not see while it is being edited.
    fn operation_tags_filter(&self) -> OperationTags {
        OperationTags::empty()
    }

    fn flags(&self) -> ModuleFlags {
        ModuleFlags::empty()
    }

    fn request_color_pick(&self) -> bool {
        false
    }

    fn request_histogram(&self) -> bool {
        false
    }

    fn histogram_role(&self) -> HistogramRole {
        HistogramRole::None
    }

    fn is_distorting(&self) -> bool {
        self.operation_tags().contains(OperationTags::DISTORT)
    }
}

/// Nearest-neighbour copy of a mask from `roi_in` to `roi_out` placement.
pub fn resample_mask(mask: &[f32], roi_in: &Roi, roi_out: &Roi) -> Vec<f32> {
    if roi_in == roi_out && mask.len() == roi_out.pixels() {
        return mask.to_vec();
    }

    let ratio = roi_in.scale / roi_out.scale;
    let mut out = vec![0.0; roi_out.pixels()];
    for y in 0..roi_out.height {
        let sy = ((roi_out.y + y as i32) as f32 * ratio) as i32 - roi_in.y;
        if !(0..roi_in.height as i32).contains(&sy) {
            continue;
        }
        for x in 0..roi_out.width {
            let sx = ((roi_out.x + x as i32) as f32 * ratio) as i32 - roi_in.x;
            if (0..roi_in.width as i32).contains(&sx) {
                out[y * roi_out.width + x] = mask[sy as usize * roi_in.width + sx as usize];
            }
        }
    }
    out
}
