//! Recursive evaluation of a pipeline, tail first.
//!
//! Every active node asks for its predecessor's output, then either finds its
//! own output in the cache or produces it. Entries travel between nodes as
//! referenced [`CacheEntry`] handles; locks are only held while a node runs.

mod cpu;
mod gpu;
mod raster;

use std::ops::Deref;
use std::sync::Arc;

use crate::blend::{RasterMask, BLEND_RASTER_ID};
use crate::buffer::{BufferDesc, Colorspace, PixelView, PixelViewMut};
use crate::cache::{CacheEntry, EntryData, EntryReadGuard, EntryWriteGuard, Lookup, ModuleScope};
use crate::colorspace::{needs_conversion, ColorspaceConverter};
use crate::context::PipelineServices;
use crate::device::DeviceId;
use crate::error::{PipeError, PipeResult};
use crate::module::{HistogramRole, ModuleFlags};
use crate::node::{Node, ProcessingFlow};
use crate::pipeline::{PipeType, Pipeline};
use crate::roi::Roi;
use crate::sampling::{self, Histogram, PickerResult, HISTOGRAM_BINS};

/// A node's output: a cache entry with one reference owned by the holder.
#[derive(Debug)]
pub(crate) struct NodeOutput {
    pub entry: Arc<CacheEntry>,
    pub hash: u64,
    pub roi: Roi,
}

/// Lock on a node's input entry, exclusive when it is converted in place.
enum InputGuard {
    Read(EntryReadGuard),
    Write(EntryWriteGuard),
}

impl InputGuard {
    fn data_mut(&mut self) -> Option<&mut EntryData> {
        match self {
            InputGuard::Read(_) => None,
            InputGuard::Write(guard) => Some(&mut **guard),
        }
    }
}

impl Deref for InputGuard {
    type Target = EntryData;

    fn deref(&self) -> &EntryData {
        match self {
            InputGuard::Read(guard) => &**guard,
            InputGuard::Write(guard) => &**guard,
        }
    }
}

/// Converts the `roi` part of `data` in place and retags its descriptor.
fn convert_entry(
    converter: &dyn ColorspaceConverter,
    data: &mut EntryData,
    roi: &Roi,
    to: Colorspace,
) -> PipeResult<()> {
    let (bytes, dsc) = data.parts_mut();
    let size = dsc.buffer_size(roi);
    let mut view = PixelViewMut::new(&mut bytes[..size], *dsc, *roi);
    converter.convert_view(&mut view, to)?;
    *dsc = view.dsc;
    Ok(())
}

fn view<'a>(data: &'a EntryData, roi: &Roi) -> PixelView<'a> {
    let size = data.dsc.buffer_size(roi);
    PixelView::new(&data.bytes()[..size], data.dsc, *roi)
}

fn view_mut<'a>(data: &'a mut EntryData, roi: &Roi) -> PixelViewMut<'a> {
    let dsc = data.dsc;
    let size = dsc.buffer_size(roi);
    PixelViewMut::new(&mut data.bytes_mut()[..size], dsc, *roi)
}

pub(crate) struct Executor<'a> {
    pipe: &'a Pipeline,
    services: &'a PipelineServices,
    device: Option<DeviceId>,
    /// Declared output layout of every node, inactive ones included.
    formats: Vec<BufferDesc>,
}

impl<'a> Executor<'a> {
    pub fn new(pipe: &'a Pipeline, services: &'a PipelineServices, device: Option<DeviceId>) -> Self {
        let mut dsc = pipe.source().desc();
        let formats = pipe
            .nodes
            .iter()
            .map(|node| {
                if node.is_active() {
                    dsc = node.module().output_format(&dsc);
                }
                dsc
            })
            .collect();

        Self {
            pipe,
            services,
            device,
            formats,
        }
    }

    /// Output of the last active node, referenced for the caller.
    pub fn run(&self) -> PipeResult<NodeOutput> {
        self.process_rec(self.pipe.nodes.len())
    }

    fn check_shutdown(&self) -> PipeResult<()> {
        if self.pipe.is_shutdown() {
            return Err(PipeError::Aborted);
        }
        Ok(())
    }

    fn pipe_id(&self) -> i32 {
        self.pipe.pipe_type().id()
    }

    fn sampling_enabled(&self) -> bool {
        self.pipe.pipe_type() == PipeType::Preview && self.pipe.gui_attached()
    }

    /// Output of `nodes[..upto]`.
    fn process_rec(&self, upto: usize) -> PipeResult<NodeOutput> {
        self.check_shutdown()?;

        let nodes = &self.pipe.nodes;
        let Some(idx) = nodes[..upto].iter().rposition(Node::is_active) else {
            return self.process_input();
        };
        let node = &nodes[idx];
        let cache = &self.services.cache;
        let hash = node.global_hash;

        if self.pipe.pipe_type() != PipeType::Preview && !node.bypass && !self.pipe.reentry().is_active() {
            if let Some(entry) = cache.get_existing(hash) {
                tracing::trace!("[dev_pixelpipe] {} found in cache, skipping upstream", node.name());
                node.set_flow(ProcessingFlow {
                    cached: true,
                    ..ProcessingFlow::default()
                });
                return Ok(NodeOutput {
                    entry,
                    hash,
                    roi: node.roi_out,
                });
            }
        }

        let input = self.process_rec(idx)?;

        let module = node.module();
        if self.pipe.mask_display
            && !module.is_distorting()
            && !module.flags().contains(ModuleFlags::DISPLAY_SINK)
        {
            tracing::trace!("[dev_pixelpipe] {} passed through for mask display", node.name());
            return Ok(input);
        }

        let result = {
            let _scope = ModuleScope::enter(node.name());
            self.process_node(idx, &input)
        };
        cache.release(&input.entry);
        let output = result?;

        if self.pipe.is_shutdown() {
            cache.release(&output.entry);
            cache.remove(output.hash, true);
            return Err(PipeError::Aborted);
        }
        Ok(output)
    }

    /// Copies the source window the first node needs into a cache entry.
    fn process_input(&self) -> PipeResult<NodeOutput> {
        self.pipe.check_source()?;

        let plan = self.pipe.plan();
        let roi = plan.base_roi;
        let dsc = self.pipe.source().desc();
        let size = dsc.buffer_size(&roi);
        let name = format!("{} input", self.pipe.pipe_type());
        let cache = &self.services.cache;

        let lookup = cache.get_or_create_untracked(plan.base_hash, size, &name, self.pipe_id(), dsc)?;
        let entry = match lookup {
            Lookup::Hit(entry) => entry,
            Lookup::Created(entry, mut guard) => {
                let result = self
                    .pipe
                    .source()
                    .with_pixels(&mut |pixels| copy_input(pixels, &roi, &mut guard, dsc));
                drop(guard);
                if let Err(err) = result {
                    cache.release(&entry);
                    cache.remove(plan.base_hash, true);
                    return Err(err);
                }
                entry.set_auto_destroy();
                tracing::trace!(
                    "[dev_pixelpipe] {} input {}x{} loaded",
                    self.pipe.pipe_type(),
                    roi.width,
                    roi.height
                );
                entry
            }
        };

        if self.pipe.is_shutdown() {
            cache.release(&entry);
            cache.remove(plan.base_hash, true);
            return Err(PipeError::Aborted);
        }

        Ok(NodeOutput {
            entry,
            hash: plan.base_hash,
            roi,
        })
    }

    fn process_node(&self, idx: usize, input: &NodeOutput) -> PipeResult<NodeOutput> {
        let node = &self.pipe.nodes[idx];
        let cache = &self.services.cache;
        let hash = node.global_hash;
        let dsc = self.formats[idx];
        let size = dsc.buffer_size(&node.roi_out);
        let name = format!("{} {}", self.pipe.pipe_type(), node.name());

        let (entry, mut output) = match cache.get_or_create(hash, size, &name, self.pipe_id(), dsc)? {
            Lookup::Hit(entry) => {
                node.set_flow(ProcessingFlow {
                    cached: true,
                    ..ProcessingFlow::default()
                });
                if self.sampling_enabled() {
                    let in_guard = input.entry.read();
                    let out_guard = entry.read();
                    self.sample(idx, input, &in_guard);
                    drop((in_guard, out_guard));
                    self.update_histograms(idx, input, &entry);
                }
                return Ok(NodeOutput {
                    entry,
                    hash,
                    roi: node.roi_out,
                });
            }
            Lookup::Created(entry, guard) => (entry, guard),
        };

        if node.bypass || self.pipe.reentry().is_active() {
            entry.set_auto_destroy();
        }

        let blending = node.module().flags().contains(ModuleFlags::SUPPORTS_BLENDING) && node.blend().is_enabled();
        let raster = if blending && node.blend().raster_source.is_some() {
            match raster::lookup(self.pipe, idx) {
                Ok(mask) => Some(mask),
                Err(err) => {
                    drop(output);
                    self.discard(&entry);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut in_guard = self.lock_input(node, &input.entry, blending);
        let result = self.produce(idx, input, &mut in_guard, &entry, &mut output, blending, raster.as_ref());
        drop(output);

        match result {
            Ok(flow) => node.set_flow(flow),
            Err(err) => {
                drop(in_guard);
                self.discard(&entry);
                return Err(err);
            }
        }

        if self.sampling_enabled() {
            let out_guard = entry.read();
            self.sample(idx, input, &in_guard);
            drop((in_guard, out_guard));
            self.update_histograms(idx, input, &entry);
        }

        Ok(NodeOutput {
            entry,
            hash,
            roi: node.roi_out,
        })
    }

    /// Drops a partially written output entry.
    fn discard(&self, entry: &Arc<CacheEntry>) {
        let cache = &self.services.cache;
        cache.release(entry);
        if !cache.remove(entry.hash(), true) {
            cache.flag_auto_destroy(entry.hash());
        }
    }

    /// Read lock, or a write lock when the input will be converted in place.
    fn lock_input(&self, node: &Node, entry: &CacheEntry, blending: bool) -> InputGuard {
        let module = node.module();
        let guard = entry.read();
        let current = guard.dsc.cst;
        let convert = needs_conversion(current, module.input_colorspace())
            || (blending && needs_conversion(module.input_colorspace(), module.default_colorspace()));
        if !convert {
            return InputGuard::Read(guard);
        }
        drop(guard);
        InputGuard::Write(entry.write())
    }

    #[allow(clippy::too_many_arguments)]
    fn produce(
        &self,
        idx: usize,
        input: &NodeOutput,
        in_guard: &mut InputGuard,
        out_entry: &Arc<CacheEntry>,
        output: &mut EntryData,
        blending: bool,
        raster: Option<&RasterMask>,
    ) -> PipeResult<ProcessingFlow> {
        let node = &self.pipe.nodes[idx];
        let module = node.module();
        let converter = self.services.converter.as_ref();

        let input_cst = module.input_colorspace();
        if needs_conversion(in_guard.dsc.cst, input_cst) {
            let from = in_guard.dsc.cst;
            let data = in_guard
                .data_mut()
                .ok_or(PipeError::Conversion { from, to: input_cst })?;
            convert_entry(converter, data, &input.roi, input_cst)?;
        }

        let mut flow = ProcessingFlow::default();
        if let Some(device) = self.gpu_target(node, &input.roi, in_guard.dsc.bpp(), output.dsc.bpp()) {
            match gpu::process(self, device, node, input, in_guard, out_entry, output) {
                Ok(()) => flow.on_gpu = true,
                Err(err) => {
                    tracing::warn!(
                        "[opencl_pixelpipe] {} failed on GPU, falling back to CPU: {}",
                        node.name(),
                        err
                    );
                    if let Some(layer) = &self.services.device {
                        if let Err(finish) = layer.finish(device) {
                            tracing::debug!("[opencl_pixelpipe] finish after failure: {}", finish);
                        }
                    }
                    self.services.gpu_session.record_error();
                }
            }
        }

        if !flow.on_gpu {
            self.check_shutdown()?;
            flow.tiled = cpu::process(self, node, &input.roi, in_guard, output)?;
        }

        if blending {
            self.blend(node, &input.roi, in_guard, output, raster)?;
            flow.blended = true;
        }

        Ok(flow)
    }

    /// Device to run `node` on, if the GPU path applies at all.
    fn gpu_target(&self, node: &Node, roi_in: &Roi, in_bpp: usize, out_bpp: usize) -> Option<DeviceId> {
        let device = self.device?;
        let layer = self.services.device.as_ref()?;
        let flags = node.module().flags();
        if !flags.contains(ModuleFlags::SUPPORTS_GPU) || self.services.gpu_session.is_stopped() {
            return None;
        }
        if self.pipe.pipe_type() == PipeType::Preview && flags.contains(ModuleFlags::PREVIEW_NON_GPU) {
            return None;
        }

        let roi_out = node.roi_out;
        let req = node.module().tiling_callback(node.params(), roi_in, &roi_out);
        let (width, height, bpp) = if roi_in.pixels() * in_bpp >= roi_out.pixels() * out_bpp {
            (roi_in.width, roi_in.height, in_bpp)
        } else {
            (roi_out.width, roi_out.height, out_bpp)
        };
        if !layer.image_fits_device(device, width, height, bpp, req.factor, req.overhead) {
            tracing::debug!(
                "[opencl_pixelpipe] {} does not fit device {}, processing on CPU",
                node.name(),
                device
            );
            return None;
        }
        Some(device)
    }

    fn blend(
        &self,
        node: &Node,
        roi_in: &Roi,
        in_guard: &mut InputGuard,
        output: &mut EntryData,
        raster: Option<&RasterMask>,
    ) -> PipeResult<()> {
        let converter = self.services.converter.as_ref();
        let cst = node.module().default_colorspace();

        if needs_conversion(in_guard.dsc.cst, cst) {
            let from = in_guard.dsc.cst;
            let data = in_guard.data_mut().ok_or(PipeError::Conversion { from, to: cst })?;
            convert_entry(converter, data, roi_in, cst)?;
        }
        convert_entry(converter, output, &node.roi_out, cst)?;

        let mask = self
            .services
            .blender
            .blend(
                node.blend(),
                view(in_guard, roi_in),
                view_mut(output, &node.roi_out),
                raster,
            )
            .map_err(|err| PipeError::module(node.name(), err))?;
        node.store_raster_mask(BLEND_RASTER_ID, mask);
        Ok(())
    }

    /// Module histogram and color picker of the preview pipe, run with the
    /// node's input read-locked. Failures are logged, never propagated.
    fn sample(&self, idx: usize, input: &NodeOutput, in_data: &EntryData) {
        let node = &self.pipe.nodes[idx];
        let in_view = view(in_data, &input.roi);

        if node.module().request_histogram() {
            node.set_histogram(Histogram::compute(&in_view, HISTOGRAM_BINS));
        }

        let picker = self.pipe.picker();
        let Some(request) = picker.request().filter(|request| request.module == node.name()) else {
            return;
        };

        let mut points = sampling::picker_points(&request.sample, self.pipe.processed_size());
        for later in self.pipe.nodes[idx..].iter().rev() {
            if later.is_active() && later.module().is_distorting() {
                later.module().distort_backtransform(later.params(), &mut points);
            }
        }
        let region = sampling::picker_region(&points, &input.roi);

        match sampling::pick(self.services.converter.as_ref(), &in_view, &region, request.cst) {
            Ok((mean, min, max)) => picker.publish(PickerResult {
                cst: sampling::picked_cst(&in_data.dsc, request.cst),
                module: request.module,
                region,
                mean,
                min,
                max,
            }),
            Err(err) => tracing::warn!("[pixelpipe] color picker on {} failed: {}", node.name(), err),
        }
    }

    /// Points the global histograms at the buffers around their modules.
    fn update_histograms(&self, idx: usize, input: &NodeOutput, out_entry: &Arc<CacheEntry>) {
        let node = &self.pipe.nodes[idx];
        let cache = &self.services.cache;
        let histograms = self.pipe.histograms();
        match node.module().histogram_role() {
            HistogramRole::None => {}
            HistogramRole::Display => {
                histograms.update(HistogramRole::Display, cache, &input.entry, input.hash, input.roi)
            }
            role => histograms.update(role, cache, out_entry, node.global_hash, node.roi_out),
        }
    }
}

fn copy_input(pixels: PixelView<'_>, roi: &Roi, data: &mut EntryData, dsc: BufferDesc) -> PipeResult<()> {
    if pixels.dsc.bpp() != dsc.bpp() {
        return Err(PipeError::Input(format!(
            "source delivers {} bytes per pixel, expected {}",
            pixels.dsc.bpp(),
            dsc.bpp()
        )));
    }
    let size = dsc.buffer_size(roi);
    crate::source::copy_window(pixels, roi, &mut data.bytes_mut()[..size])?;
    data.dsc = dsc;
    Ok(())
}
