//! A linear chain of nodes fed by an image source, and its run loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strum_macros::Display;

use crate::buffer::BufferDesc;
use crate::cache::{CacheEntry, EntryReadGuard};
use crate::context::PipelineServices;
use crate::error::{PipeError, PipeResult};
use crate::executor::{Executor, NodeOutput};
use crate::node::Node;
use crate::planner::{self, Plan, PlanInputs};
use crate::roi::Roi;
use crate::sampling::{ColorPicker, GlobalHistograms};
use crate::source::ImageSource;

/// Runs after GPU queue errors before giving up.
const MAX_RUN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum PipeType {
    Preview,
    Full,
    Thumbnail,
    Export,
}

impl PipeType {
    /// Owner id of the cache entries this pipe creates.
    pub fn id(self) -> i32 {
        self as i32
    }
}

/// Cooperative cancellation flag, shareable with other threads.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-owner re-entry request. The owner is a non-zero hash.
#[derive(Debug, Default)]
pub struct Reentry {
    owner: AtomicU64,
}

impl Reentry {
    /// Captures the flag for `owner`. True if `owner` holds it afterwards.
    pub fn set(&self, owner: u64) -> bool {
        match self
            .owner
            .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::debug!("[dev_pixelpipe] re-entry requested by {:x}", owner);
                true
            }
            Err(current) => current == owner,
        }
    }

    /// Releases the flag, only if `owner` captured it.
    pub fn clear(&self, owner: u64) -> bool {
        let cleared = self
            .owner
            .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cleared {
            tracing::debug!("[dev_pixelpipe] re-entry cleared by {:x}", owner);
        }
        cleared
    }

    pub fn reset(&self) {
        self.owner.store(0, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            owner => Some(owner),
        }
    }
}

/// Last successful output, referenced until the next one replaces it.
#[derive(Debug)]
struct Backbuf {
    entry: Arc<CacheEntry>,
    hash: u64,
    roi: Roi,
}

pub struct Pipeline {
    pipe_type: PipeType,
    source: Arc<dyn ImageSource>,
    source_dims: (usize, usize),
    pub(crate) nodes: Vec<Node>,
    pub(crate) mask_display: bool,
    gpu_enabled: bool,
    gui_attached: bool,
    active_module: Option<String>,
    pub(crate) plan: Plan,
    shutdown: KillSwitch,
    reentry: Reentry,
    flush_cache: AtomicBool,
    backbuf: Mutex<Option<Backbuf>>,
    histograms: GlobalHistograms,
    picker: ColorPicker,
}

impl Pipeline {
    pub fn new(pipe_type: PipeType, source: Arc<dyn ImageSource>) -> Self {
        let source_dims = source.dimensions();
        let full = Roi::full(source_dims.0, source_dims.1);
        Self {
            pipe_type,
            source,
            source_dims,
            nodes: Vec::new(),
            mask_display: false,
            gpu_enabled: true,
            gui_attached: false,
            active_module: None,
            plan: Plan {
                output_roi: full,
                base_roi: full,
                base_hash: 0,
                processed_size: source_dims,
                tail_hash: 0,
            },
            shutdown: KillSwitch::default(),
            reentry: Reentry::default(),
            flush_cache: AtomicBool::new(false),
            backbuf: Mutex::new(None),
            histograms: GlobalHistograms::default(),
            picker: ColorPicker::default(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn pipe_type(&self) -> PipeType {
        self.pipe_type
    }

    pub fn source(&self) -> &Arc<dyn ImageSource> {
        &self.source
    }

    pub(crate) fn source_dims(&self) -> (usize, usize) {
        self.source_dims
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.name() == name)
    }

    /// Replaces the node list, e.g. after the module history changed.
    pub fn rebuild(&mut self, nodes: Vec<Node>) {
        tracing::debug!(
            "[dev_pixelpipe] rebuilding {} pipe with {} nodes",
            self.pipe_type,
            nodes.len()
        );
        self.nodes = nodes;
    }

    pub fn set_mask_display(&mut self, mask_display: bool) {
        self.mask_display = mask_display;
    }

    pub fn set_gpu_enabled(&mut self, enabled: bool) {
        self.gpu_enabled = enabled;
    }

    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled
    }

    /// Enables the sampling hooks of the preview pipe.
    pub fn attach_gui(&mut self, attached: bool) {
        self.gui_attached = attached;
    }

    pub fn gui_attached(&self) -> bool {
        self.gui_attached
    }

    pub fn set_active_module(&mut self, module: Option<&str>) {
        self.active_module = module.map(str::to_string);
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn reset_shutdown(&self) {
        self.shutdown.reset();
    }

    pub fn reentry(&self) -> &Reentry {
        &self.reentry
    }

    pub fn request_flush_cache(&self) {
        self.flush_cache.store(true, Ordering::Release);
    }

    pub fn flush_cache_requested(&self) -> bool {
        self.flush_cache.load(Ordering::Acquire)
    }

    pub fn histograms(&self) -> &GlobalHistograms {
        &self.histograms
    }

    pub fn picker(&self) -> &ColorPicker {
        &self.picker
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn processed_size(&self) -> (usize, usize) {
        self.plan.processed_size
    }

    /// Plans ROIs and hashes for `output_roi` without processing anything.
    pub fn plan_for(&mut self, output_roi: Roi) -> Plan {
        let inputs = PlanInputs {
            image_id: self.source.image_id(),
            source_dims: self.source_dims,
            output_roi,
            mask_display: self.mask_display,
            active_module: self.active_module.as_deref(),
        };
        self.plan = planner::plan(&mut self.nodes, &inputs);
        self.plan
    }

    pub fn backbuf_hash(&self) -> Option<u64> {
        self.backbuf.lock().as_ref().map(|backbuf| backbuf.hash)
    }

    pub fn backbuf_entry(&self) -> Option<Arc<CacheEntry>> {
        self.backbuf.lock().as_ref().map(|backbuf| Arc::clone(&backbuf.entry))
    }

    /// Reader access to the last output together with its descriptor and ROI.
    pub fn read_backbuf(&self) -> Option<(EntryReadGuard, BufferDesc, Roi)> {
        let (entry, roi) = {
            let backbuf = self.backbuf.lock();
            let backbuf = backbuf.as_ref()?;
            (Arc::clone(&backbuf.entry), backbuf.roi)
        };
        let guard = entry.read();
        let dsc = guard.dsc;
        Some((guard, dsc, roi))
    }

    fn swap_backbuf(&self, services: &PipelineServices, output: NodeOutput) {
        let previous = self.backbuf.lock().replace(Backbuf {
            entry: output.entry,
            hash: output.hash,
            roi: output.roi,
        });
        if let Some(previous) = previous {
            services.cache.release(&previous.entry);
        }
    }

    /// Drops every cache reference the pipe holds between runs.
    pub fn release(&self, services: &PipelineServices) {
        let previous = self.backbuf.lock().take();
        if let Some(previous) = previous {
            services.cache.release(&previous.entry);
        }
        self.histograms.release_all(&services.cache);
    }

    /// Processes the pipe for `output_roi`, keeping the result as backbuf.
    ///
    /// A pending cache flush request is honoured first. GPU queue errors make
    /// the run start over on the CPU, at most [`MAX_RUN_ATTEMPTS`] times.
    pub fn process(&mut self, services: &PipelineServices, output_roi: Roi) -> PipeResult<u64> {
        let plan = self.plan_for(output_roi);

        if self.flush_cache.swap(false, Ordering::AcqRel) {
            let flushed = services.cache.flush_pipe(self.pipe_type.id());
            tracing::debug!(
                "[dev_pixelpipe] flushed {} cache entries of the {} pipe",
                flushed,
                self.pipe_type
            );
        } else if self.pipe_type != PipeType::Preview
            && !self.reentry.is_active()
            && self.backbuf_hash() == Some(plan.tail_hash)
        {
            tracing::debug!("[dev_pixelpipe] {} pipe output is up to date", self.pipe_type);
            return Ok(plan.tail_hash);
        }

        let layer = services
            .device
            .as_ref()
            .filter(|_| services.has_gpu() && self.gpu_enabled);
        let device = layer.and_then(|layer| layer.lock_device(self.pipe_type));
        let mut use_gpu = device.is_some();

        let started = std::time::Instant::now();
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let executor = Executor::new(self, services, device.filter(|_| use_gpu));
            let result = executor.run();

            let queue_errors = match (layer, device) {
                (Some(layer), Some(dev)) if use_gpu => layer.events_flush(dev, true).errors,
                _ => 0,
            };
            if queue_errors == 0 || attempt >= MAX_RUN_ATTEMPTS {
                break result;
            }

            tracing::warn!(
                "[opencl_pixelpipe] {} queue errors in the {} pipe, processing again on CPU",
                queue_errors,
                self.pipe_type
            );
            services.gpu_session.record_error();
            if let Ok(output) = result {
                services.cache.release(&output.entry);
            }
            services.cache.flush_pipe(self.pipe_type.id());
            use_gpu = false;
        };

        if let (Some(layer), Some(dev)) = (layer, device) {
            layer.unlock_device(dev);
        }

        match result {
            Ok(output) => {
                let hash = output.hash;
                self.swap_backbuf(services, output);
                tracing::debug!(
                    "[dev_pixelpipe] {} pipe processed in {:.3}s",
                    self.pipe_type,
                    started.elapsed().as_secs_f64()
                );
                Ok(hash)
            }
            Err(err) => {
                if !err.is_aborted() {
                    tracing::warn!("[dev_pixelpipe] {} pipe failed: {}", self.pipe_type, err);
                }
                Err(err)
            }
        }
    }

    pub(crate) fn check_source(&self) -> PipeResult<()> {
        if self.source.dimensions() != self.source_dims {
            return Err(PipeError::Input(format!(
                "source changed size from {:?} to {:?}",
                self.source_dims,
                self.source.dimensions()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pipe_type", &self.pipe_type)
            .field("nodes", &self.nodes)
            .field("plan", &self.plan)
            .field("reentry", &self.reentry.owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentry_has_a_single_owner() {
        let reentry = Reentry::default();
        assert!(reentry.set(7));
        assert!(reentry.set(7), "same owner may set again");
        assert!(!reentry.set(8));
        assert_eq!(reentry.owner(), Some(7));

        assert!(!reentry.clear(8));
        assert!(reentry.is_active());
        assert!(reentry.clear(7));
        assert!(!reentry.is_active());

        reentry.set(9);
        reentry.reset();
        assert_eq!(reentry.owner(), None);
    }

    #[test]
    fn pipe_types_have_names_and_ids() {
        assert_eq!(PipeType::Preview.to_string(), "preview");
        assert_eq!(PipeType::Export.to_string(), "export");
        assert_eq!(PipeType::Full.id(), 1);
    }

    #[test]
    fn kill_switch_is_shared() {
        let switch = KillSwitch::default();
        let clone = switch.clone();
        clone.trigger();
        assert!(switch.is_triggered());
        switch.reset();
        assert!(!clone.is_triggered());
    }
}
