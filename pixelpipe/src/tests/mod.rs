mod test_modules;

use std::sync::Arc;

use crate::blend::BlendParams;
use crate::buffer::{BufferDesc, Colorspace};
use crate::config::{CacheConfig, PipelineConfig};
use crate::context::PipelineServices;
use crate::device::{EmulatedDevice, EmulatedDeviceConfig};
use crate::module::Module;
use crate::node::Node;
use crate::pipeline::Pipeline;
use crate::source::InMemorySource;

use test_modules::{f32_param, Gain};

pub(crate) const MIB: usize = 1024 * 1024;

pub(crate) fn config(max_memory: usize) -> PipelineConfig {
    PipelineConfig {
        cache: CacheConfig::with_max_memory(max_memory),
        ..PipelineConfig::default()
    }
}

pub(crate) fn cpu_services(max_memory: usize) -> PipelineServices {
    PipelineServices::cpu_only(config(max_memory))
}

pub(crate) fn gpu_services(config: PipelineConfig) -> (Arc<EmulatedDevice>, PipelineServices) {
    let device = Arc::new(EmulatedDevice::new(EmulatedDeviceConfig::from_config(&config, 1 << 30)));
    let services = PipelineServices::new(config, device.clone());
    assert!(services.has_gpu());
    (device, services)
}

pub(crate) fn source_value(x: usize, y: usize, c: usize) -> f32 {
    if c == 3 {
        1.0
    } else {
        ((x * 7 + y * 13 + c * 5) % 97) as f32 / 97.0
    }
}

/// Deterministic RGBA float image.
pub(crate) fn rgb_source(image_id: u64, width: usize, height: usize) -> Arc<InMemorySource> {
    Arc::new(InMemorySource::from_fn(
        image_id,
        width,
        height,
        BufferDesc::rgba_f32(Colorspace::Rgb),
        source_value,
    ))
}

pub(crate) fn node<M: Module + 'static>(module: M) -> Node {
    Node::new(Arc::new(module), Vec::new(), BlendParams::default(), true)
}

/// A gain node sharing `module` with the test, so run counters stay visible.
pub(crate) fn gain_node(module: &Arc<Gain>, gain: f32) -> Node {
    let module: Arc<dyn Module> = module.clone();
    Node::new(module, f32_param(gain), BlendParams::default(), true)
}

pub(crate) fn gains(names: &[&str]) -> Vec<Arc<Gain>> {
    names.iter().map(|name| Arc::new(Gain::new(name))).collect()
}

pub(crate) fn output_f32(pipe: &Pipeline) -> Vec<f32> {
    let (guard, dsc, roi) = pipe.read_backbuf().expect("pipe has an output");
    let size = dsc.buffer_size(&roi);
    bytemuck::cast_slice::<u8, f32>(&guard.bytes()[..size]).to_vec()
}

pub(crate) fn output_bytes(pipe: &Pipeline) -> Vec<u8> {
    let (guard, dsc, roi) = pipe.read_backbuf().expect("pipe has an output");
    let size = dsc.buffer_size(&roi);
    guard.bytes()[..size].to_vec()
}

pub(crate) fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-5, "value {} is {}, expected {}", idx, a, e);
    }
}

/// The source scaled channel-wise by `gain`, as every chain of gains produces.
pub(crate) fn scaled_source(width: usize, height: usize, gain: f32) -> Vec<f32> {
    (0..width * height * 4)
        .map(|idx| {
            let px = idx / 4;
            let c = idx % 4;
            let value = source_value(px % width, px / width, c);
            if c == 3 {
                value
            } else {
                value * gain
            }
        })
        .collect()
}
