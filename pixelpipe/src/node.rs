//! Pipeline nodes: one per module instance, with committed parameter hashes
//! and the per-run plan.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use common::Djb2Hasher;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::blend::{BlendParams, RasterMask};
use crate::module::Module;
use crate::roi::Roi;
use crate::sampling::Histogram;

/// Which backend ran a node, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessingFlow {
    pub on_gpu: bool,
    pub tiled: bool,
    pub blended: bool,
    /// Output came from the cache without running the module.
    pub cached: bool,
}

/// Appends `value` to a running djb2 hash.
pub(crate) fn mix<T: Hash + ?Sized>(seed: u64, value: &T) -> u64 {
    let mut hasher = Djb2Hasher::with_seed(seed);
    value.hash(&mut hasher);
    hasher.finish()
}

pub struct Node {
    module: Arc<dyn Module>,
    params: Vec<u8>,
    blend: BlendParams,
    enabled: bool,
    bypass_cache: bool,
    params_hash: u64,
    blend_hash: u64,

    // Planned for the current run.
    pub(crate) active: bool,
    pub(crate) roi_in: Roi,
    pub(crate) roi_out: Roi,
    pub(crate) global_hash: u64,
    pub(crate) global_mask_hash: u64,
    pub(crate) bypass: bool,

    raster_masks: Mutex<HashMap<u32, RasterMask>>,
    flow: Mutex<ProcessingFlow>,
    histogram: Mutex<Option<Histogram>>,
}

impl Node {
    pub fn new(module: Arc<dyn Module>, params: Vec<u8>, blend: BlendParams, enabled: bool) -> Self {
        let mut node = Self {
            module,
            params,
            blend,
            enabled,
            bypass_cache: false,
            params_hash: 0,
            blend_hash: 0,
            active: enabled,
            roi_in: Roi::full(0, 0),
            roi_out: Roi::full(0, 0),
            global_hash: 0,
            global_mask_hash: 0,
            bypass: false,
            raster_masks: Mutex::new(HashMap::new()),
            flow: Mutex::new(ProcessingFlow::default()),
            histogram: Mutex::new(None),
        };
        node.commit();
        node
    }

    pub fn with_bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self.commit();
        self
    }

    /// Recomputes the parameter hashes. Called on every parameter change.
    fn commit(&mut self) {
        let mut blend = Djb2Hasher::new();
        self.blend.hash_into(&mut blend);
        self.blend_hash = blend.finish();

        let mut hasher = Djb2Hasher::new();
        hasher.write(self.module.name().as_bytes());
        hasher.write(&self.params);
        hasher.write_u64(self.blend_hash);
        hasher.write_u8(self.enabled as u8);
        hasher.write_u8(self.bypass_cache as u8);
        self.params_hash = hasher.finish();
    }

    pub fn set_params(&mut self, params: Vec<u8>) {
        self.params = params;
        self.commit();
    }

    pub fn set_blend(&mut self, blend: BlendParams) {
        self.blend = blend;
        self.commit();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.commit();
    }

    pub fn set_bypass_cache(&mut self, bypass: bool) {
        self.bypass_cache = bypass;
        self.commit();
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn blend(&self) -> &BlendParams {
        &self.blend
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled and not filtered out for this run.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn bypass_cache(&self) -> bool {
        self.bypass_cache
    }

    pub fn params_hash(&self) -> u64 {
        self.params_hash
    }

    pub fn blend_hash(&self) -> u64 {
        self.blend_hash
    }

    pub fn global_hash(&self) -> u64 {
        self.global_hash
    }

    pub fn global_mask_hash(&self) -> u64 {
        self.global_mask_hash
    }

    pub fn roi_in(&self) -> Roi {
        self.roi_in
    }

    pub fn roi_out(&self) -> Roi {
        self.roi_out
    }

    pub fn raster_mask(&self, mask_id: u32) -> Option<RasterMask> {
        self.raster_masks.lock().get(&mask_id).cloned()
    }

    pub(crate) fn store_raster_mask(&self, mask_id: u32, mask: RasterMask) {
        self.raster_masks.lock().insert(mask_id, mask);
    }

    pub fn clear_raster_masks(&self) {
        self.raster_masks.lock().clear();
    }

    pub fn flow(&self) -> ProcessingFlow {
        *self.flow.lock()
    }

    pub(crate) fn set_flow(&self, flow: ProcessingFlow) {
        *self.flow.lock() = flow;
    }

    pub fn histogram(&self) -> Option<Histogram> {
        self.histogram.lock().clone()
    }

    pub(crate) fn set_histogram(&self, histogram: Histogram) {
        *self.histogram.lock() = Some(histogram);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("module", &self.name())
            .field("enabled", &self.enabled)
            .field("active", &self.active)
            .field("params_hash", &self.params_hash)
            .field("global_hash", &self.global_hash)
            .field("roi_in", &self.roi_in)
            .field("roi_out", &self.roi_out)
            .finish()
    }
}
