//! Host-memory device used when no GPU driver is present and by the tests.
//!
//! Images live in plain `Vec<u8>` storage, so pinned images are never true
//! zero-copy: every map returns the device-side copy and transfers are
//! explicit. Failures can be injected to exercise the CPU fallback paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{DeviceId, DeviceLayer, EventSummary, ImageFlags, ImageHandle, MapMode};
use crate::buffer::HostPtr;
use crate::config::PipelineConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::pipeline::PipeType;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct EmulatedDeviceConfig {
    pub devices: u32,
    pub memory_bytes: u64,
    pub headroom_bytes: u64,
    pub mandatory_timeout: Duration,
    /// Longest wait for a blocking map or a queue finish.
    pub synchronization_timeout: Duration,
    /// Mapping a pinned image returns the host pointer it was bound to.
    /// Only meant for probing zero-copy detection.
    pub zero_copy_mapping: bool,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            memory_bytes: 1 << 30,
            headroom_bytes: 0,
            mandatory_timeout: Duration::from_millis(400),
            synchronization_timeout: Duration::from_millis(200),
            zero_copy_mapping: false,
        }
    }
}

impl EmulatedDeviceConfig {
    pub fn from_config(config: &PipelineConfig, memory_bytes: u64) -> Self {
        Self {
            memory_bytes,
            headroom_bytes: config.gpu.headroom_bytes(0),
            mandatory_timeout: config.pipeline.mandatory_timeout(),
            synchronization_timeout: config.pipeline.synchronization_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct EmulatedImage {
    device: DeviceId,
    host: Option<HostPtr>,
    data: Vec<u8>,
    mapped: Option<HostPtr>,
}

#[derive(Debug, Default)]
struct DeviceQueue {
    used_bytes: u64,
    completed: usize,
    errors: usize,
    kernels: usize,
    uploads: usize,
    /// Time every synchronization on this queue takes.
    stall: Duration,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    images: HashMap<u64, EmulatedImage>,
    queues: Vec<DeviceQueue>,
    failing_allocations: usize,
}

#[derive(Debug)]
pub struct EmulatedDevice {
    config: EmulatedDeviceConfig,
    state: Mutex<State>,
    busy: Vec<AtomicBool>,
}

impl EmulatedDevice {
    pub fn new(config: EmulatedDeviceConfig) -> Self {
        let devices = config.devices.max(1) as usize;
        Self {
            state: Mutex::new(State {
                next_id: 1,
                queues: (0..devices).map(|_| DeviceQueue::default()).collect(),
                ..State::default()
            }),
            busy: (0..devices).map(|_| AtomicBool::new(false)).collect(),
            config,
        }
    }

    /// The next `count` image allocations fail.
    pub fn fail_next_allocations(&self, count: usize) {
        self.state.lock().failing_allocations = count;
    }

    /// The next `events_flush` on `device` reports `count` errors.
    pub fn inject_queue_errors(&self, device: DeviceId, count: usize) {
        if let Some(queue) = self.state.lock().queues.get_mut(device as usize) {
            queue.errors += count;
        }
    }

    /// Every later finish or blocking map on `device` takes `stall`.
    pub fn stall_queue(&self, device: DeviceId, stall: Duration) {
        if let Some(queue) = self.state.lock().queues.get_mut(device as usize) {
            queue.stall = stall;
        }
    }

    /// Waits for the queue of `device`, up to the synchronization timeout.
    fn synchronize(&self, device: DeviceId) -> DeviceResult<()> {
        let stall = self
            .state
            .lock()
            .queues
            .get(device as usize)
            .ok_or(DeviceError::Unavailable(device))?
            .stall;
        let timeout = self.config.synchronization_timeout;
        if stall > timeout {
            std::thread::sleep(timeout);
            return Err(DeviceError::Timeout {
                device,
                waited_ms: timeout.as_millis() as u64,
            });
        }
        if !stall.is_zero() {
            std::thread::sleep(stall);
        }
        Ok(())
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn kernels_launched(&self, device: DeviceId) -> usize {
        self.state
            .lock()
            .queues
            .get(device as usize)
            .map_or(0, |queue| queue.kernels)
    }

    /// Explicit host-to-device transfers issued on `device`.
    pub fn uploads(&self, device: DeviceId) -> usize {
        self.state
            .lock()
            .queues
            .get(device as usize)
            .map_or(0, |queue| queue.uploads)
    }

    pub fn used_memory(&self, device: DeviceId) -> u64 {
        self.state
            .lock()
            .queues
            .get(device as usize)
            .map_or(0, |queue| queue.used_bytes)
    }

    fn budget(&self) -> u64 {
        self.config
            .memory_bytes
            .saturating_sub(self.config.headroom_bytes)
    }

    fn allocate(
        &self,
        device: DeviceId,
        host: Option<HostPtr>,
        width: usize,
        height: usize,
        bpp: usize,
        flags: ImageFlags,
    ) -> DeviceResult<ImageHandle> {
        let mut state = self.state.lock();
        let budget = self.budget();
        let size = (width * height * bpp) as u64;

        if state.failing_allocations > 0 {
            state.failing_allocations -= 1;
            return Err(DeviceError::Allocation { width, height, bpp });
        }

        let queue = state
            .queues
            .get_mut(device as usize)
            .ok_or(DeviceError::Unavailable(device))?;
        if size == 0 || queue.used_bytes + size > budget {
            return Err(DeviceError::Allocation { width, height, bpp });
        }
        queue.used_bytes += size;

        let id = state.next_id;
        state.next_id += 1;
        state.images.insert(
            id,
            EmulatedImage {
                device,
                host,
                data: vec![0; size as usize],
                mapped: None,
            },
        );

        Ok(ImageHandle {
            id,
            device,
            width,
            height,
            bpp,
            flags,
        })
    }
}

fn check_len(len: usize, width: usize, height: usize, bpp: usize) -> DeviceResult<usize> {
    let needed = width * height * bpp;
    if len < needed {
        return Err(DeviceError::Transfer(format!(
            "buffer of {} bytes is smaller than {}x{}x{}",
            len, width, height, bpp
        )));
    }
    Ok(needed)
}

impl DeviceLayer for EmulatedDevice {
    fn is_available(&self) -> bool {
        true
    }

    fn lock_device(&self, pipe: PipeType) -> Option<DeviceId> {
        let start = Instant::now();
        loop {
            for (idx, busy) in self.busy.iter().enumerate() {
                if busy
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(idx as DeviceId);
                }
            }
            if start.elapsed() >= self.config.mandatory_timeout {
                tracing::debug!(
                    "[opencl_pixelpipe] no device free for the {} pipe, running on CPU",
                    pipe
                );
                return None;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn unlock_device(&self, device: DeviceId) {
        if let Some(busy) = self.busy.get(device as usize) {
            busy.store(false, Ordering::Release);
        }
    }

    fn alloc_image(
        &self,
        device: DeviceId,
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<ImageHandle> {
        self.allocate(device, None, width, height, bpp, ImageFlags::empty())
    }

    fn alloc_image_pinned(
        &self,
        device: DeviceId,
        host: HostPtr,
        width: usize,
        height: usize,
        bpp: usize,
        flags: ImageFlags,
    ) -> DeviceResult<ImageHandle> {
        self.allocate(
            device,
            Some(host),
            width,
            height,
            bpp,
            flags | ImageFlags::HOST_PINNED,
        )
    }

    fn release_image(&self, image: &ImageHandle) {
        let mut state = self.state.lock();
        if let Some(released) = state.images.remove(&image.id) {
            if let Some(queue) = state.queues.get_mut(released.device as usize) {
                queue.used_bytes -= released.data.len() as u64;
            }
        }
    }

    fn write_host_to_device(
        &self,
        image: &ImageHandle,
        host: &[u8],
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<()> {
        let needed = check_len(host.len(), width, height, bpp)?;
        let mut state = self.state.lock();
        let target = state
            .images
            .get_mut(&image.id)
            .ok_or(DeviceError::UnknownImage(image.id))?;
        check_len(target.data.len(), width, height, bpp)?;
        target.data[..needed].copy_from_slice(&host[..needed]);
        if let Some(queue) = state.queues.get_mut(image.device as usize) {
            queue.uploads += 1;
        }
        Ok(())
    }

    fn read_device_to_host(
        &self,
        image: &ImageHandle,
        host: &mut [u8],
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<()> {
        let needed = check_len(host.len(), width, height, bpp)?;
        let state = self.state.lock();
        let source = state
            .images
            .get(&image.id)
            .ok_or(DeviceError::UnknownImage(image.id))?;
        check_len(source.data.len(), width, height, bpp)?;
        host[..needed].copy_from_slice(&source.data[..needed]);
        Ok(())
    }

    fn copy_image(
        &self,
        src: &ImageHandle,
        dst: &ImageHandle,
        origin_src: [usize; 2],
        origin_dst: [usize; 2],
        region: [usize; 2],
    ) -> DeviceResult<()> {
        if src.bpp != dst.bpp
            || origin_src[0] + region[0] > src.width
            || origin_src[1] + region[1] > src.height
            || origin_dst[0] + region[0] > dst.width
            || origin_dst[1] + region[1] > dst.height
        {
            return Err(DeviceError::Transfer("copy region out of bounds".into()));
        }

        let mut state = self.state.lock();
        let source = state
            .images
            .get(&src.id)
            .ok_or(DeviceError::UnknownImage(src.id))?
            .data
            .clone();
        let target = state
            .images
            .get_mut(&dst.id)
            .ok_or(DeviceError::UnknownImage(dst.id))?;

        let row_bytes = region[0] * src.bpp;
        for row in 0..region[1] {
            let s = ((origin_src[1] + row) * src.width + origin_src[0]) * src.bpp;
            let d = ((origin_dst[1] + row) * dst.width + origin_dst[0]) * dst.bpp;
            target.data[d..d + row_bytes].copy_from_slice(&source[s..s + row_bytes]);
        }
        Ok(())
    }

    fn map_image(
        &self,
        image: &ImageHandle,
        blocking: bool,
        _mode: MapMode,
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<HostPtr> {
        if blocking {
            self.synchronize(image.device)?;
        }
        let mut state = self.state.lock();
        let mapped = state
            .images
            .get_mut(&image.id)
            .ok_or(DeviceError::UnknownImage(image.id))?;
        check_len(mapped.data.len(), width, height, bpp)?;

        let ptr = match mapped.host {
            Some(host) if self.config.zero_copy_mapping => host,
            _ => HostPtr::of(&mapped.data),
        };
        mapped.mapped = Some(ptr);
        Ok(ptr)
    }

    fn unmap_image(&self, image: &ImageHandle, mapped: HostPtr) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let target = state
            .images
            .get_mut(&image.id)
            .ok_or(DeviceError::UnknownImage(image.id))?;
        if target.mapped.take() != Some(mapped) {
            return Err(DeviceError::Transfer("unmap of an image that is not mapped".into()));
        }
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        device: DeviceId,
        _kernel: &str,
        _sizes: [usize; 2],
        _local: Option<[usize; 2]>,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(device as usize)
            .ok_or(DeviceError::Unavailable(device))?;
        queue.kernels += 1;
        queue.completed += 1;
        Ok(())
    }

    fn finish(&self, device: DeviceId) -> DeviceResult<()> {
        self.synchronize(device)
    }

    fn events_wait(&self, _device: DeviceId) {}

    fn events_flush(&self, device: DeviceId, reset: bool) -> EventSummary {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(device as usize) else {
            return EventSummary::default();
        };
        let summary = EventSummary {
            completed: queue.completed,
            errors: queue.errors,
        };
        if reset {
            queue.completed = 0;
            queue.errors = 0;
        }
        summary
    }

    fn image_fits_device(
        &self,
        device: DeviceId,
        width: usize,
        height: usize,
        bpp: usize,
        factor: f32,
        overhead: usize,
    ) -> bool {
        let required = (width * height * bpp) as f64 * factor as f64 + overhead as f64;
        required <= self.device_available_memory(device) as f64
    }

    fn device_available_memory(&self, device: DeviceId) -> u64 {
        let state = self.state.lock();
        let used = state
            .queues
            .get(device as usize)
            .map_or(u64::MAX, |queue| queue.used_bytes);
        self.budget().saturating_sub(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> EmulatedDevice {
        EmulatedDevice::new(EmulatedDeviceConfig {
            memory_bytes: 4096,
            mandatory_timeout: Duration::from_millis(5),
            ..EmulatedDeviceConfig::default()
        })
    }

    #[test]
    fn write_then_read_round_trips_host_data() {
        let device = device();
        let image = device.alloc_image(0, 4, 2, 4).unwrap();
        let src: Vec<u8> = (0..32).collect();
        device.write_host_to_device(&image, &src, 4, 2, 4).unwrap();

        let mut dst = vec![0u8; 32];
        device.read_device_to_host(&image, &mut dst, 4, 2, 4).unwrap();
        assert_eq!(dst, src);
        device.release_image(&image);
        assert_eq!(device.used_memory(0), 0);
    }

    #[test]
    fn allocations_respect_budget_and_injection() {
        let device = device();
        assert!(device.alloc_image(0, 64, 64, 4).is_err(), "16 KiB exceeds 4 KiB");

        device.fail_next_allocations(1);
        assert!(device.alloc_image(0, 2, 2, 4).is_err());
        assert!(device.alloc_image(0, 2, 2, 4).is_ok());
        assert!(device.image_fits_device(0, 8, 8, 4, 2.0, 0));
        assert!(!device.image_fits_device(0, 32, 32, 4, 2.0, 0));
    }

    #[test]
    fn pinned_images_are_not_zero_copy_by_default() {
        let device = device();
        let host = vec![0u8; 64];
        let image = device
            .alloc_image_pinned(0, HostPtr::of(&host), 4, 4, 4, ImageFlags::READ_ONLY)
            .unwrap();
        assert!(image.is_pinned());

        let mapped = device.map_image(&image, true, MapMode::Read, 4, 4, 4).unwrap();
        assert_ne!(mapped, HostPtr::of(&host));
        device.unmap_image(&image, mapped).unwrap();
        assert!(device.unmap_image(&image, mapped).is_err(), "double unmap");
    }

    #[test]
    fn device_lock_is_exclusive() {
        let device = device();
        let dev = device.lock_device(PipeType::Full).unwrap();
        assert_eq!(device.lock_device(PipeType::Preview), None);
        device.unlock_device(dev);
        assert_eq!(device.lock_device(PipeType::Preview), Some(dev));
    }

    #[test]
    fn queue_errors_are_reported_once_per_reset() {
        let device = device();
        device.inject_queue_errors(0, 2);
        device.enqueue_kernel(0, "noop", [1, 1], None).unwrap();

        let summary = device.events_flush(0, true);
        assert_eq!(summary, EventSummary { completed: 1, errors: 2 });
        assert_eq!(device.events_flush(0, true), EventSummary::default());
    }

    #[test]
    fn stalled_queue_times_out() {
        let device = EmulatedDevice::new(EmulatedDeviceConfig {
            synchronization_timeout: Duration::from_millis(5),
            ..EmulatedDeviceConfig::default()
        });
        let image = device.alloc_image(0, 2, 2, 4).unwrap();

        device.stall_queue(0, Duration::from_millis(2));
        assert!(device.finish(0).is_ok());

        device.stall_queue(0, Duration::from_secs(60));
        let started = Instant::now();
        assert!(matches!(device.finish(0), Err(DeviceError::Timeout { device: 0, .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(device.map_image(&image, true, MapMode::Read, 2, 2, 4).is_err());
        let mapped = device.map_image(&image, false, MapMode::Read, 2, 2, 4).unwrap();
        device.unmap_image(&image, mapped).unwrap();
        assert!(device.finish(1).is_err());
    }

    #[test]
    fn copy_image_moves_a_region() {
        let device = device();
        let src = device.alloc_image(0, 4, 4, 1).unwrap();
        let dst = device.alloc_image(0, 2, 2, 1).unwrap();
        let data: Vec<u8> = (0..16).collect();
        device.write_host_to_device(&src, &data, 4, 4, 1).unwrap();

        device.copy_image(&src, &dst, [1, 1], [0, 0], [2, 2]).unwrap();
        let mut out = vec![0u8; 4];
        device.read_device_to_host(&dst, &mut out, 2, 2, 1).unwrap();
        assert_eq!(out, vec![5, 6, 9, 10]);
    }
}
