//! Small modules exercising every capability the executor branches on.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::buffer::{AlignedBuf, BufferDesc, Colorspace, PixelView, PixelViewMut};
use crate::error::{ModuleError, ModuleResult};
use crate::module::{GpuImage, GpuTask, HistogramRole, Module, ModuleFlags, OperationTags};
use crate::pipeline::KillSwitch;
use crate::roi::Roi;
use crate::tiling::TilingRequirements;

pub fn f32_param(value: f32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

fn read_f32_param(params: &[u8], default: f32) -> f32 {
    params
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .map_or(default, f32::from_le_bytes)
}

/// Single-channel raw to four-channel float, still in raw colorspace.
pub struct RawPrepare;

impl Module for RawPrepare {
    fn name(&self) -> &str {
        "in_raw"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Raw
    }

    fn output_format(&self, _input: &BufferDesc) -> BufferDesc {
        BufferDesc::rgba_f32(Colorspace::Raw)
    }

    fn process(&self, _params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        let pixels = output.roi.pixels();
        let src = input.as_f32();
        for (px, &v) in output.as_f32_mut().chunks_exact_mut(4).take(pixels).zip(src) {
            px.copy_from_slice(&[v, v, v, 1.0]);
        }
        Ok(())
    }
}

pub struct Demosaic;

impl Module for Demosaic {
    fn name(&self) -> &str {
        "demosaic"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Raw
    }

    fn output_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn output_format(&self, _input: &BufferDesc) -> BufferDesc {
        BufferDesc::rgba_f32(Colorspace::Rgb)
    }

    fn process(&self, _params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        let src = input.as_f32();
        for (dst, src) in output.as_f32_mut().chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            dst.copy_from_slice(&[src[0], src[1] * 0.5, src[2] * 0.25, 1.0]);
        }
        Ok(())
    }

    fn histogram_role(&self) -> HistogramRole {
        HistogramRole::Raw
    }
}

/// Terminal display step: halves the resolution and encodes to 8 bits.
pub struct Gamma;

impl Module for Gamma {
    fn name(&self) -> &str {
        "gamma"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn output_format(&self, _input: &BufferDesc) -> BufferDesc {
        BufferDesc::rgba_u8()
    }

    fn modify_roi_out(&self, _params: &[u8], roi_in: &Roi) -> Roi {
        Roi::new(roi_in.x / 2, roi_in.y / 2, roi_in.width / 2, roi_in.height / 2, roi_in.scale * 0.5)
    }

    fn modify_roi_in(&self, _params: &[u8], roi_out: &Roi) -> Roi {
        Roi::new(roi_out.x * 2, roi_out.y * 2, roi_out.width * 2, roi_out.height * 2, roi_out.scale * 2.0)
    }

    fn process(&self, params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        let exponent = 1.0 / read_f32_param(params, 2.2);
        let (in_roi, out_roi) = (input.roi, output.roi);
        let src = input.as_f32();
        for y in 0..out_roi.height {
            let iy = (out_roi.y + y as i32) * 2 - in_roi.y;
            for x in 0..out_roi.width {
                let ix = (out_roi.x + x as i32) * 2 - in_roi.x;
                let dst = &mut output.data[(y * out_roi.width + x) * 4..][..4];
                if !(0..in_roi.width as i32).contains(&ix) || !(0..in_roi.height as i32).contains(&iy) {
                    continue;
                }
                let base = (iy as usize * in_roi.width + ix as usize) * 4;
                for c in 0..3 {
                    dst[c] = (src[base + c].clamp(0.0, 1.0).powf(exponent) * 255.0).round() as u8;
                }
                dst[3] = 255;
            }
        }
        Ok(())
    }

    fn flags(&self) -> ModuleFlags {
        ModuleFlags::DISPLAY_SINK
    }

    fn histogram_role(&self) -> HistogramRole {
        HistogramRole::Display
    }
}

/// Multiplies color channels by a factor. Runs anywhere: CPU, tiles, GPU.
pub struct Gain {
    name: String,
    pub fail_gpu: AtomicBool,
    pub gpu_runs: AtomicUsize,
    pub cpu_runs: AtomicUsize,
}

impl Gain {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_gpu: AtomicBool::new(false),
            gpu_runs: AtomicUsize::new(0),
            cpu_runs: AtomicUsize::new(0),
        }
    }

    fn apply(gain: f32, src: &[f32], dst: &mut [f32]) {
        for (dst, src) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            dst.copy_from_slice(&[src[0] * gain, src[1] * gain, src[2] * gain, src[3]]);
        }
    }
}

impl Module for Gain {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn process(&self, params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        self.cpu_runs.fetch_add(1, Ordering::Relaxed);
        Self::apply(read_f32_param(params, 1.0), input.as_f32(), output.as_f32_mut());
        Ok(())
    }

    fn process_gpu(
        &self,
        task: &GpuTask<'_>,
        params: &[u8],
        input: GpuImage<'_>,
        output: GpuImage<'_>,
    ) -> ModuleResult<()> {
        if self.fail_gpu.load(Ordering::Acquire) {
            return Err(ModuleError::Failed("injected kernel failure".into()));
        }
        let image = input.image;
        let mut src = AlignedBuf::new_zeroed(image.byte_size());
        let mut dst = AlignedBuf::new_zeroed(output.image.byte_size());
        task.layer
            .read_device_to_host(image, src.as_mut_slice(), image.width, image.height, image.bpp)?;
        Self::apply(
            read_f32_param(params, 1.0),
            bytemuck::cast_slice(src.as_slice()),
            bytemuck::cast_slice_mut(dst.as_mut_slice()),
        );
        task.layer.write_host_to_device(
            output.image,
            dst.as_slice(),
            output.image.width,
            output.image.height,
            output.image.bpp,
        )?;
        task.enqueue("gain", [output.roi.width, output.roi.height])?;
        self.gpu_runs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flags(&self) -> ModuleFlags {
        ModuleFlags::SUPPORTS_BLENDING | ModuleFlags::SUPPORTS_TILING | ModuleFlags::SUPPORTS_GPU
    }
}

/// Moves the image `dx` pixels to the right.
pub struct Shift {
    pub dx: i32,
}

impl Module for Shift {
    fn name(&self) -> &str {
        "shift"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn modify_roi_in(&self, _params: &[u8], roi_out: &Roi) -> Roi {
        let dx = (self.dx as f32 * roi_out.scale).round() as i32;
        Roi { x: roi_out.x - dx, ..*roi_out }
    }

    fn process(&self, _params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        // The input window is already offset by `dx`: a plain copy moves it.
        let len = output.data.len().min(input.data.len());
        output.data[..len].copy_from_slice(&input.data[..len]);
        Ok(())
    }

    fn distort_mask(&self, _params: &[u8], mask: &[f32], _roi_in: &Roi, _roi_out: &Roi) -> Vec<f32> {
        mask.to_vec()
    }

    fn distort_backtransform(&self, _params: &[u8], points: &mut [[f32; 2]]) {
        for point in points {
            point[0] -= self.dx as f32;
        }
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::DISTORT
    }
}

/// Vertical box blur needing `radius` rows and columns of context.
pub struct Blur {
    pub radius: usize,
}

impl Module for Blur {
    fn name(&self) -> &str {
        "blur"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn modify_roi_in(&self, _params: &[u8], roi_out: &Roi) -> Roi {
        roi_out.padded(self.radius)
    }

    fn process(&self, _params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        let (in_roi, out_roi) = (input.roi, output.roi);
        let src = input.as_f32();
        let r = self.radius as i32;
        let ox = out_roi.x - in_roi.x;
        let dst = output.as_f32_mut();

        for y in 0..out_roi.height as i32 {
            let iy = out_roi.y + y - in_roi.y;
            for x in 0..out_roi.width as i32 {
                let ix = x + ox;
                let mut sum = [0.0f32; 4];
                let mut count = 0.0;
                for k in -r..=r {
                    let sy = iy + k;
                    if !(0..in_roi.height as i32).contains(&sy) || !(0..in_roi.width as i32).contains(&ix) {
                        continue;
                    }
                    let base = (sy as usize * in_roi.width + ix as usize) * 4;
                    for c in 0..4 {
                        sum[c] += src[base + c];
                    }
                    count += 1.0;
                }
                let out = &mut dst[(y as usize * out_roi.width + x as usize) * 4..][..4];
                for c in 0..4 {
                    out[c] = if count > 0.0 { sum[c] / count } else { 0.0 };
                }
            }
        }
        Ok(())
    }

    fn tiling_callback(&self, _params: &[u8], _roi_in: &Roi, _roi_out: &Roi) -> TilingRequirements {
        TilingRequirements {
            overlap: self.radius,
            ..TilingRequirements::default()
        }
    }

    fn flags(&self) -> ModuleFlags {
        ModuleFlags::SUPPORTS_TILING
    }
}

/// Identity module pulling the kill switch while it runs.
pub struct Tripwire {
    pub switch: KillSwitch,
}

impl Module for Tripwire {
    fn name(&self) -> &str {
        "tripwire"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn process(&self, _params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        let len = output.data.len();
        output.data.copy_from_slice(&input.data[..len]);
        self.switch.trigger();
        Ok(())
    }
}

/// Identity module that hides later distorting modules while it is edited.
pub struct Editor;

impl Module for Editor {
    fn name(&self) -> &str {
        "editor"
    }

    fn input_colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn process(&self, _params: &[u8], input: PixelView<'_>, mut output: PixelViewMut<'_>) -> ModuleResult<()> {
        let len = output.data.len();
        output.data.copy_from_slice(&input.data[..len]);
        Ok(())
    }

    fn operation_tags_filter(&self) -> OperationTags {
        OperationTags::DISTORT
    }
}
