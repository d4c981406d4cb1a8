//! What the pipeline needs from a GPU subsystem.
//!
//! The device layer owns drivers, queues and vRAM. The core only sees opaque
//! image handles; [`OwnedImage`] ties a handle's lifetime to Rust ownership so
//! a dropped image is always released through the layer that allocated it.

mod emulated;

pub use emulated::{EmulatedDevice, EmulatedDeviceConfig};

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::buffer::HostPtr;
use crate::error::DeviceResult;
use crate::pipeline::PipeType;

pub type DeviceId = u32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageFlags: u32 {
        /// Bound to a host buffer the device may access directly.
        const HOST_PINNED = 1 << 0;
        const READ_ONLY = 1 << 1;
        const WRITE_ONLY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

/// Opaque device image as handed out by the device layer.
#[derive(Debug, PartialEq, Eq)]
pub struct ImageHandle {
    pub id: u64,
    pub device: DeviceId,
    pub width: usize,
    pub height: usize,
    pub bpp: usize,
    pub flags: ImageFlags,
}

impl ImageHandle {
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(ImageFlags::HOST_PINNED)
    }

    pub fn byte_size(&self) -> usize {
        self.width * self.height * self.bpp
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    pub completed: usize,
    pub errors: usize,
}

pub trait DeviceLayer: Send + Sync {
    fn is_available(&self) -> bool;

    /// Tries to reserve a device for `pipe`, waiting up to the mandatory timeout.
    fn lock_device(&self, pipe: PipeType) -> Option<DeviceId>;
    fn unlock_device(&self, device: DeviceId);

    fn alloc_image(
        &self,
        device: DeviceId,
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<ImageHandle>;

    fn alloc_image_pinned(
        &self,
        device: DeviceId,
        host: HostPtr,
        width: usize,
        height: usize,
        bpp: usize,
        flags: ImageFlags,
    ) -> DeviceResult<ImageHandle>;

    fn release_image(&self, image: &ImageHandle);

    fn write_host_to_device(
        &self,
        image: &ImageHandle,
        host: &[u8],
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<()>;

    fn read_device_to_host(
        &self,
        image: &ImageHandle,
        host: &mut [u8],
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<()>;

    fn copy_image(
        &self,
        src: &ImageHandle,
        dst: &ImageHandle,
        origin_src: [usize; 2],
        origin_dst: [usize; 2],
        region: [usize; 2],
    ) -> DeviceResult<()>;

    fn map_image(
        &self,
        image: &ImageHandle,
        blocking: bool,
        mode: MapMode,
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<HostPtr>;

    fn unmap_image(&self, image: &ImageHandle, mapped: HostPtr) -> DeviceResult<()>;

    fn enqueue_kernel(
        &self,
        device: DeviceId,
        kernel: &str,
        sizes: [usize; 2],
        local: Option<[usize; 2]>,
    ) -> DeviceResult<()>;

    fn finish(&self, device: DeviceId) -> DeviceResult<()>;
    fn events_wait(&self, device: DeviceId);
    fn events_flush(&self, device: DeviceId, reset: bool) -> EventSummary;

    fn image_fits_device(
        &self,
        device: DeviceId,
        width: usize,
        height: usize,
        bpp: usize,
        factor: f32,
        overhead: usize,
    ) -> bool;

    fn device_available_memory(&self, device: DeviceId) -> u64;
}

/// A device image released through its device layer on drop.
pub struct OwnedImage {
    handle: ImageHandle,
    layer: Arc<dyn DeviceLayer>,
}

impl OwnedImage {
    pub fn new(layer: Arc<dyn DeviceLayer>, handle: ImageHandle) -> Self {
        Self { handle, layer }
    }

    pub fn handle(&self) -> &ImageHandle {
        &self.handle
    }

    pub fn layer(&self) -> &Arc<dyn DeviceLayer> {
        &self.layer
    }
}

impl Deref for OwnedImage {
    type Target = ImageHandle;

    fn deref(&self) -> &ImageHandle {
        &self.handle
    }
}

impl Drop for OwnedImage {
    fn drop(&mut self) {
        self.layer.release_image(&self.handle);
    }
}

impl fmt::Debug for OwnedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedImage").field(&self.handle).finish()
    }
}

/// Process-wide GPU error accounting.
///
/// After `max_errors` failures the GPU stays disabled for the rest of the session.
#[derive(Debug)]
pub struct GpuSession {
    errors: AtomicU32,
    max_errors: u32,
    stopped: AtomicBool,
}

impl GpuSession {
    pub fn new(max_errors: u32) -> Self {
        Self {
            errors: AtomicU32::new(0),
            max_errors,
            stopped: AtomicBool::new(false),
        }
    }

    /// Counts one failure. Returns true when this failure disabled the GPU.
    pub fn record_error(&self) -> bool {
        let errors = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        if errors >= self.max_errors && !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "[opencl_pixelpipe] GPU disabled for this session after {} errors",
                errors
            );
            return true;
        }
        false
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
