//! Observers hooked into the preview pipe: histograms and the color picker.
//!
//! Nothing here writes into pipeline buffers. Sampled regions are copied out
//! before any colorspace conversion.

use std::sync::Arc;

use common::Slot;
use parking_lot::Mutex;

use crate::buffer::{BufferDesc, Colorspace, DataType, PixelView};
use crate::cache::{CacheEntry, PixelCache};
use crate::colorspace::ColorspaceConverter;
use crate::error::PipeResult;
use crate::module::HistogramRole;
use crate::roi::Roi;

pub const HISTOGRAM_BINS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub bins: usize,
    /// One bin vector per color channel.
    pub channels: Vec<Vec<u32>>,
    pub pixels: usize,
}

impl Histogram {
    /// Bins the first three channels of `view` over [0, 1].
    pub fn compute(view: &PixelView<'_>, bins: usize) -> Self {
        let ch = view.dsc.channels;
        let color = ch.min(3);
        let pixels = view.roi.pixels();
        let mut channels = vec![vec![0u32; bins]; color];
        let bin = |v: f32| ((v.clamp(0.0, 1.0) * (bins - 1) as f32).round() as usize).min(bins - 1);

        match view.dsc.datatype {
            DataType::Float32 => {
                for px in view.as_f32()[..pixels * ch].chunks_exact(ch) {
                    for c in 0..color {
                        channels[c][bin(px[c])] += 1;
                    }
                }
            }
            DataType::Uint8 => {
                for px in view.data[..pixels * ch].chunks_exact(ch) {
                    for c in 0..color {
                        channels[c][bin(px[c] as f32 / 255.0)] += 1;
                    }
                }
            }
            DataType::Uint16 => {
                let data: &[u16] = bytemuck::cast_slice(&view.data[..pixels * ch * 2]);
                for px in data.chunks_exact(ch) {
                    for c in 0..color {
                        channels[c][bin(px[c] as f32 / 65535.0)] += 1;
                    }
                }
            }
        }

        Self {
            bins,
            channels,
            pixels,
        }
    }
}

/// A cache entry kept alive for a global histogram.
#[derive(Debug)]
struct HistogramBackbuf {
    entry: Arc<CacheEntry>,
    hash: u64,
    roi: Roi,
}

/// The raw, output and display histogram sources of a preview pipe.
#[derive(Debug, Default)]
pub struct GlobalHistograms {
    raw: Mutex<Option<HistogramBackbuf>>,
    output: Mutex<Option<HistogramBackbuf>>,
    display: Mutex<Option<HistogramBackbuf>>,
}

impl GlobalHistograms {
    fn slot(&self, role: HistogramRole) -> Option<&Mutex<Option<HistogramBackbuf>>> {
        match role {
            HistogramRole::None => None,
            HistogramRole::Raw => Some(&self.raw),
            HistogramRole::Output => Some(&self.output),
            HistogramRole::Display => Some(&self.display),
        }
    }

    /// Points `role` at `entry`. References only move when the hash changes.
    pub(crate) fn update(
        &self,
        role: HistogramRole,
        cache: &PixelCache,
        entry: &Arc<CacheEntry>,
        hash: u64,
        roi: Roi,
    ) {
        let Some(slot) = self.slot(role) else {
            return;
        };
        let mut current = slot.lock();
        if current.as_ref().is_some_and(|backbuf| backbuf.hash == hash) {
            return;
        }

        entry.add_ref();
        let previous = current.replace(HistogramBackbuf {
            entry: Arc::clone(entry),
            hash,
            roi,
        });
        drop(current);
        if let Some(previous) = previous {
            cache.release(&previous.entry);
        }
        tracing::trace!("[pixelpipe] {} histogram now follows {}", role, hash);
    }

    pub fn hash(&self, role: HistogramRole) -> Option<u64> {
        self.slot(role)?.lock().as_ref().map(|backbuf| backbuf.hash)
    }

    /// Computes the histogram of the buffer `role` points at. Skipped when
    /// that buffer is being written.
    pub fn histogram(&self, role: HistogramRole) -> Option<Histogram> {
        let (entry, roi) = {
            let slot = self.slot(role)?.lock();
            let backbuf = slot.as_ref()?;
            (Arc::clone(&backbuf.entry), backbuf.roi)
        };
        let data = entry.try_read()?;
        let size = data.dsc.buffer_size(&roi);
        // Empty once the entry was flushed from the cache.
        let bytes = data.bytes().get(..size)?;
        let view = PixelView::new(bytes, data.dsc, roi);
        Some(Histogram::compute(&view, HISTOGRAM_BINS))
    }

    pub fn release_all(&self, cache: &PixelCache) {
        for slot in [&self.raw, &self.output, &self.display] {
            let previous = slot.lock().take();
            if let Some(previous) = previous {
                cache.release(&previous.entry);
            }
        }
    }
}

/// Picker position in normalized coordinates of the pipeline output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PickerSample {
    Point([f32; 2]),
    /// `[x0, y0, x1, y1]`
    Box([f32; 4]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PickerRequest {
    pub module: String,
    pub sample: PickerSample,
    pub cst: Colorspace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PickerResult {
    pub module: String,
    pub cst: Colorspace,
    /// Sampled area in module input coordinates.
    pub region: Roi,
    pub mean: [f32; 4],
    pub min: [f32; 4],
    pub max: [f32; 4],
}

#[derive(Debug, Default)]
pub struct ColorPicker {
    request: Mutex<Option<PickerRequest>>,
    results: Slot<PickerResult>,
}

impl ColorPicker {
    pub fn activate(&self, request: PickerRequest) {
        *self.request.lock() = Some(request);
    }

    pub fn deactivate(&self) {
        self.request.lock().take();
        self.results.clear();
    }

    pub fn request(&self) -> Option<PickerRequest> {
        self.request.lock().clone()
    }

    pub fn is_active_on(&self, module: &str) -> bool {
        self.request
            .lock()
            .as_ref()
            .is_some_and(|request| request.module == module)
    }

    /// Latest result, emptied by the call. This is the "picker data ready" event.
    pub fn take_result(&self) -> Option<Arc<PickerResult>> {
        self.results.take()
    }

    pub(crate) fn publish(&self, result: PickerResult) {
        self.results.publish(result);
    }
}

/// Corners of the sampled area in full-image pixel coordinates.
pub(crate) fn picker_points(sample: &PickerSample, processed: (usize, usize)) -> Vec<[f32; 2]> {
    let (w, h) = (processed.0 as f32, processed.1 as f32);
    match *sample {
        PickerSample::Point([x, y]) => vec![[x * w, y * h]],
        PickerSample::Box([x0, y0, x1, y1]) => vec![[x0 * w, y0 * h], [x1 * w, y1 * h]],
    }
}

/// Region of `roi` covered by full-image `points`, clamped to the buffer.
pub(crate) fn picker_region(points: &[[f32; 2]], roi: &Roi) -> Roi {
    let to_local = |p: [f32; 2]| {
        let x = (p[0] * roi.scale).floor() as i32 - roi.x;
        let y = (p[1] * roi.scale).floor() as i32 - roi.y;
        (
            x.clamp(0, roi.width as i32 - 1),
            y.clamp(0, roi.height as i32 - 1),
        )
    };
    let (mut x0, mut y0) = (i32::MAX, i32::MAX);
    let (mut x1, mut y1) = (i32::MIN, i32::MIN);
    for &point in points {
        let (x, y) = to_local(point);
        x0 = x0.min(x);
        y0 = y0.min(y);
        x1 = x1.max(x);
        y1 = y1.max(y);
    }
    Roi::new(x0, y0, (x1 - x0 + 1) as usize, (y1 - y0 + 1) as usize, roi.scale)
}

/// Mean, min and max per channel of `region` (local to `view`), after
/// converting a copy of it to `cst`.
pub(crate) fn pick(
    converter: &dyn ColorspaceConverter,
    view: &PixelView<'_>,
    region: &Roi,
    cst: Colorspace,
) -> PipeResult<([f32; 4], [f32; 4], [f32; 4])> {
    let ch = view.dsc.channels.min(4);
    let stride = view.roi.width * view.dsc.channels;
    let mut samples: Vec<f32> = Vec::with_capacity(region.pixels() * view.dsc.channels);

    match view.dsc.datatype {
        DataType::Float32 => {
            let data = view.as_f32();
            for y in region.y as usize..region.y as usize + region.height {
                let start = y * stride + region.x as usize * view.dsc.channels;
                samples.extend_from_slice(&data[start..start + region.width * view.dsc.channels]);
            }
        }
        DataType::Uint8 => {
            for y in region.y as usize..region.y as usize + region.height {
                let start = y * stride + region.x as usize * view.dsc.channels;
                samples.extend(
                    view.data[start..start + region.width * view.dsc.channels]
                        .iter()
                        .map(|&v| v as f32 / 255.0),
                );
            }
        }
        DataType::Uint16 => {
            let data: &[u16] = bytemuck::cast_slice(view.data);
            for y in region.y as usize..region.y as usize + region.height {
                let start = y * stride + region.x as usize * view.dsc.channels;
                samples.extend(
                    data[start..start + region.width * view.dsc.channels]
                        .iter()
                        .map(|&v| v as f32 / 65535.0),
                );
            }
        }
    }

    converter.convert(&mut samples, view.dsc.channels, view.dsc.cst, cst)?;

    let mut mean = [0.0f32; 4];
    let mut min = [f32::MAX; 4];
    let mut max = [f32::MIN; 4];
    let count = (samples.len() / view.dsc.channels).max(1) as f32;
    for px in samples.chunks_exact(view.dsc.channels) {
        for c in 0..ch {
            mean[c] += px[c] / count;
            min[c] = min[c].min(px[c]);
            max[c] = max[c].max(px[c]);
        }
    }
    for c in ch..4 {
        min[c] = 0.0;
        max[c] = 0.0;
    }
    Ok((mean, min, max))
}

/// Descriptor of a buffer as the picker reports it.
pub(crate) fn picked_cst(dsc: &BufferDesc, requested: Colorspace) -> Colorspace {
    if requested == Colorspace::None {
        dsc.cst
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuf;
    use crate::colorspace::StandardConverter;

    fn gradient(roi: &Roi) -> AlignedBuf {
        let dsc = BufferDesc::rgba_f32(Colorspace::Rgb);
        let mut buf = AlignedBuf::new_zeroed(dsc.buffer_size(roi));
        let data: &mut [f32] = bytemuck::cast_slice_mut(buf.as_mut_slice());
        for (idx, px) in data.chunks_exact_mut(4).enumerate() {
            let v = idx as f32 / roi.pixels() as f32;
            px.copy_from_slice(&[v, v, v, 1.0]);
        }
        buf
    }

    #[test]
    fn histogram_counts_every_pixel() {
        let roi = Roi::full(4, 4);
        let buf = gradient(&roi);
        let view = PixelView::new(buf.as_slice(), BufferDesc::rgba_f32(Colorspace::Rgb), roi);
        let histogram = Histogram::compute(&view, 16);
        assert_eq!(histogram.channels.len(), 3);
        assert_eq!(histogram.channels[0].iter().sum::<u32>(), 16);
        assert_eq!(histogram.pixels, 16);
    }

    #[test]
    fn picker_region_clamps_to_roi() {
        let roi = Roi::new(10, 10, 20, 20, 0.5);
        // Full-image (40, 40) is local (10, 10) at half scale.
        let region = picker_region(&[[40.0, 40.0]], &roi);
        assert_eq!(region, Roi::new(10, 10, 1, 1, 0.5));

        let region = picker_region(&[[0.0, 0.0], [1000.0, 1000.0]], &roi);
        assert_eq!(region, Roi::new(0, 0, 20, 20, 0.5));
    }

    #[test]
    fn pick_aggregates_region() {
        let roi = Roi::full(2, 2);
        let buf = gradient(&roi);
        let view = PixelView::new(buf.as_slice(), BufferDesc::rgba_f32(Colorspace::Rgb), roi);
        let (mean, min, max) = pick(&StandardConverter, &view, &Roi::full(2, 2), Colorspace::Rgb).unwrap();
        assert!((mean[0] - 0.375).abs() < 1e-6);
        assert_eq!(min[0], 0.0);
        assert_eq!(max[0], 0.75);
        assert_eq!(mean[3], 1.0);
    }

    #[test]
    fn picker_points_scale_normalized_coordinates() {
        let points = picker_points(&PickerSample::Box([0.25, 0.5, 0.75, 1.0]), (200, 100));
        assert_eq!(points, vec![[50.0, 50.0], [150.0, 100.0]]);
    }
}
