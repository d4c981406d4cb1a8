use std::sync::Arc;

use crate::blend::{Blender, DefaultBlender};
use crate::cache::PixelCache;
use crate::colorspace::{ColorspaceConverter, StandardConverter};
use crate::config::PipelineConfig;
use crate::device::{DeviceLayer, GpuSession};

/// Process-wide services a pipeline run works with.
///
/// Several pipelines share one set: the cache and the device layer are
/// common to all of them.
#[derive(Clone)]
pub struct PipelineServices {
    pub cache: Arc<PixelCache>,
    pub device: Option<Arc<dyn DeviceLayer>>,
    pub converter: Arc<dyn ColorspaceConverter>,
    pub blender: Arc<dyn Blender>,
    pub config: Arc<PipelineConfig>,
    pub gpu_session: Arc<GpuSession>,
}

impl PipelineServices {
    /// Services with a device layer. GPU use also requires `gpu.enabled`.
    pub fn new(config: PipelineConfig, device: Arc<dyn DeviceLayer>) -> Self {
        let mut services = Self::cpu_only(config);
        if services.config.gpu.enabled && device.is_available() {
            services.device = Some(device);
        } else {
            tracing::info!("[opencl_pixelpipe] GPU disabled, processing on CPU only");
        }
        services
    }

    pub fn cpu_only(config: PipelineConfig) -> Self {
        Self {
            cache: Arc::new(PixelCache::new(&config.cache)),
            device: None,
            converter: Arc::new(StandardConverter),
            blender: Arc::new(DefaultBlender),
            gpu_session: Arc::new(GpuSession::new(config.gpu.max_errors_per_session)),
            config: Arc::new(config),
        }
    }

    pub fn has_gpu(&self) -> bool {
        self.device.is_some() && !self.gpu_session.is_stopped()
    }
}

impl std::fmt::Debug for PipelineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineServices")
            .field("cache", &self.cache)
            .field("has_gpu", &self.has_gpu())
            .field("config", &self.config)
            .finish()
    }
}
