//! The image store feeding the pipeline's input stage.

use parking_lot::RwLock;

use crate::buffer::{AlignedBuf, BufferDesc, DataType, PixelView};
use crate::error::{PipeError, PipeResult};
use crate::roi::Roi;

pub trait ImageSource: Send + Sync {
    /// Stable identity of the image content, part of every node hash.
    fn image_id(&self) -> u64;

    fn dimensions(&self) -> (usize, usize);

    fn desc(&self) -> BufferDesc;

    /// Runs `f` with reader access to the full-resolution pixels.
    fn with_pixels(&self, f: &mut dyn FnMut(PixelView<'_>) -> PipeResult<()>) -> PipeResult<()>;
}

/// Copies the `roi` window of `src` into `dst`, which is laid out as `roi`.
/// Parts of the window outside the source stay zeroed. Windows at another
/// scale are sampled nearest-neighbour.
pub(crate) fn copy_window(src: PixelView<'_>, roi: &Roi, dst: &mut [u8]) -> PipeResult<()> {
    if roi.scale.is_nan() || roi.scale <= 0.0 {
        return Err(PipeError::Input(format!("invalid input scale {}", roi.scale)));
    }

    let bpp = src.dsc.bpp();
    let dst_stride = roi.width * bpp;
    let dst = &mut dst[..dst_stride * roi.height];
    dst.fill(0);

    if (roi.scale - 1.0).abs() > f32::EPSILON {
        resample_window(src, roi, dst);
        return Ok(());
    }

    let (width, height) = (src.roi.width, src.roi.height);
    let clamped = roi.clamped_to(width, height);
    if clamped.is_empty() {
        return Ok(());
    }

    let src_stride = width * bpp;
    let row_bytes = clamped.width * bpp;
    let src_col = clamped.x as usize * bpp;
    let dst_col = (clamped.x - roi.x) as usize * bpp;
    let first_dst_row = (clamped.y - roi.y) as usize;
    let first_src_row = clamped.y as usize;
    let rows = &mut dst[first_dst_row * dst_stride..(first_dst_row + clamped.height) * dst_stride];

    common::parallel::for_each_row_chunk(rows, dst_stride, |first, chunk| {
        for (local, dst_row) in chunk.chunks_exact_mut(dst_stride).enumerate() {
            let start = (first_src_row + first + local) * src_stride + src_col;
            dst_row[dst_col..dst_col + row_bytes].copy_from_slice(&src.data[start..start + row_bytes]);
        }
    });
    Ok(())
}

fn resample_window(src: PixelView<'_>, roi: &Roi, dst: &mut [u8]) {
    let bpp = src.dsc.bpp();
    let (width, height) = (src.roi.width as i64, src.roi.height as i64);
    let src_stride = src.roi.width * bpp;
    let dst_stride = roi.width * bpp;
    let inv = 1.0 / roi.scale as f64;

    common::parallel::for_each_row_chunk(dst, dst_stride, |first, chunk| {
        for (local, dst_row) in chunk.chunks_exact_mut(dst_stride).enumerate() {
            let sy = ((roi.y as f64 + (first + local) as f64) * inv).floor() as i64;
            if !(0..height).contains(&sy) {
                continue;
            }
            for x in 0..roi.width {
                let sx = ((roi.x as f64 + x as f64) * inv).floor() as i64;
                if !(0..width).contains(&sx) {
                    continue;
                }
                let start = sy as usize * src_stride + sx as usize * bpp;
                dst_row[x * bpp..(x + 1) * bpp].copy_from_slice(&src.data[start..start + bpp]);
            }
        }
    });
}

/// Source backed by a host buffer.
#[derive(Debug)]
pub struct InMemorySource {
    image_id: u64,
    width: usize,
    height: usize,
    dsc: BufferDesc,
    pixels: RwLock<AlignedBuf>,
}

impl InMemorySource {
    pub fn new(image_id: u64, width: usize, height: usize, dsc: BufferDesc) -> Self {
        Self {
            image_id,
            width,
            height,
            dsc,
            pixels: RwLock::new(AlignedBuf::new_zeroed(width * height * dsc.bpp())),
        }
    }

    /// Float source filled by `f(x, y, channel)`.
    pub fn from_fn<F>(image_id: u64, width: usize, height: usize, dsc: BufferDesc, f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f32,
    {
        assert_eq!(dsc.datatype, DataType::Float32, "from_fn builds float images");
        let source = Self::new(image_id, width, height, dsc);
        {
            let mut pixels = source.pixels.write();
            let data: &mut [f32] = bytemuck::cast_slice_mut(pixels.as_mut_slice());
            for (idx, value) in data.iter_mut().enumerate() {
                let px = idx / dsc.channels;
                *value = f(px % width, px / width, idx % dsc.channels);
            }
        }
        source
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, AlignedBuf> {
        self.pixels.write()
    }
}

impl ImageSource for InMemorySource {
    fn image_id(&self) -> u64 {
        self.image_id
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn desc(&self) -> BufferDesc {
        self.dsc
    }

    fn with_pixels(&self, f: &mut dyn FnMut(PixelView<'_>) -> PipeResult<()>) -> PipeResult<()> {
        let pixels = self.pixels.read();
        f(PixelView::new(
            pixels.as_slice(),
            self.dsc,
            Roi::full(self.width, self.height),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Colorspace;

    #[test]
    fn window_copy_clamps_to_source() {
        let dsc = BufferDesc::new(1, DataType::Float32, Colorspace::Raw);
        let source = InMemorySource::from_fn(1, 4, 3, dsc, |x, y, _| (y * 4 + x) as f32);
        let roi = Roi::new(2, 1, 3, 3, 1.0);
        let mut dst = AlignedBuf::new_zeroed(dsc.buffer_size(&roi));

        source
            .with_pixels(&mut |view| copy_window(view, &roi, dst.as_mut_slice()))
            .unwrap();

        let out: &[f32] = bytemuck::cast_slice(dst.as_slice());
        assert_eq!(out, &[6.0, 7.0, 0.0, 10.0, 11.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn window_copy_samples_other_scales() {
        let dsc = BufferDesc::new(1, DataType::Float32, Colorspace::Raw);
        let source = InMemorySource::from_fn(1, 4, 4, dsc, |x, y, _| (y * 4 + x) as f32);
        let roi = Roi::new(0, 0, 2, 2, 0.5);
        let mut dst = AlignedBuf::new_zeroed(dsc.buffer_size(&roi));

        source
            .with_pixels(&mut |view| copy_window(view, &roi, dst.as_mut_slice()))
            .unwrap();

        let out: &[f32] = bytemuck::cast_slice(dst.as_slice());
        assert_eq!(out, &[0.0, 2.0, 8.0, 10.0]);
    }

    #[test]
    fn window_copy_rejects_zero_scale() {
        let dsc = BufferDesc::raw_f32();
        let source = InMemorySource::new(1, 2, 2, dsc);
        let roi = Roi::new(0, 0, 1, 1, 0.0);
        let mut dst = AlignedBuf::new_zeroed(64);
        let err = source
            .with_pixels(&mut |view| copy_window(view, &roi, dst.as_mut_slice()))
            .unwrap_err();
        assert!(matches!(err, PipeError::Input(_)));
    }
}
