//! Device images bound to cached host buffers.
//!
//! A pinned image is backed by the host buffer of a cache entry. Keeping it in
//! the entry's sidecar list after use lets the next run on the same buffer skip
//! the allocation, and the upload too when the colorspace did not change.

use std::sync::Arc;

use crate::buffer::{Colorspace, HostPtr};
use crate::cache::{CacheEntry, PixelCache, SidecarKey};
use crate::device::{DeviceId, DeviceLayer, ImageFlags, MapMode, OwnedImage};
use crate::error::DeviceResult;

/// Direction of a host/device synchronization, with the host side of it.
pub enum Transfer<'a> {
    HostToDevice(&'a [u8]),
    DeviceToHost(&'a mut [u8]),
}

impl Transfer<'_> {
    fn host_ptr(&self) -> HostPtr {
        match self {
            Transfer::HostToDevice(host) => HostPtr::of(host),
            Transfer::DeviceToHost(host) => HostPtr::of(host),
        }
    }
}

#[derive(Debug)]
pub struct Acquired {
    pub image: OwnedImage,
    /// Colorspace of the content when the image came from the sidecar.
    pub reused: Option<Colorspace>,
}

impl Acquired {
    pub fn is_reused(&self) -> bool {
        self.reused.is_some()
    }
}

/// Sidecar operations for one locked device.
pub struct Sidecar<'a> {
    layer: &'a Arc<dyn DeviceLayer>,
    cache: &'a PixelCache,
    device: DeviceId,
}

impl<'a> Sidecar<'a> {
    pub fn new(layer: &'a Arc<dyn DeviceLayer>, cache: &'a PixelCache, device: DeviceId) -> Self {
        Self {
            layer,
            cache,
            device,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn key(&self, host: HostPtr, width: usize, height: usize, bpp: usize, flags: ImageFlags) -> SidecarKey {
        SidecarKey {
            host,
            device: self.device,
            width,
            height,
            bpp,
            flags: flags | ImageFlags::HOST_PINNED,
        }
    }

    /// Returns the image cached in `entry` for this buffer and geometry, or a
    /// freshly allocated pinned image. A failed allocation flushes the sidecar
    /// images of this device cache-wide and is retried once.
    pub fn acquire(
        &self,
        entry: Option<&CacheEntry>,
        host: HostPtr,
        width: usize,
        height: usize,
        bpp: usize,
        flags: ImageFlags,
    ) -> DeviceResult<Acquired> {
        let key = self.key(host, width, height, bpp, flags);
        if let Some((image, cst)) = entry.and_then(|entry| entry.sidecar_get(&key)) {
            tracing::trace!(
                "[opencl_pixelpipe] reusing sidecar image {} for {:?}",
                image.id,
                host
            );
            return Ok(Acquired {
                image,
                reused: Some(cst),
            });
        }

        let handle = match self
            .layer
            .alloc_image_pinned(self.device, host, width, height, bpp, flags)
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::debug!(
                    "[opencl_pixelpipe] pinned allocation of {}x{} failed ({}), flushing sidecars",
                    width,
                    height,
                    err
                );
                self.cache.flush_sidecars(Some(self.device));
                self.layer
                    .alloc_image_pinned(self.device, host, width, height, bpp, flags)?
            }
        };

        Ok(Acquired {
            image: OwnedImage::new(Arc::clone(self.layer), handle),
            reused: None,
        })
    }

    /// Plain device image, with the same flush-and-retry-once policy.
    pub fn alloc(&self, width: usize, height: usize, bpp: usize) -> DeviceResult<OwnedImage> {
        let handle = match self.layer.alloc_image(self.device, width, height, bpp) {
            Ok(handle) => handle,
            Err(_) => {
                self.cache.flush_sidecars(Some(self.device));
                self.layer.alloc_image(self.device, width, height, bpp)?
            }
        };
        Ok(OwnedImage::new(Arc::clone(self.layer), handle))
    }

    /// Parks a pinned image in `entry`'s sidecar with the colorspace of its
    /// content. Anything else goes straight back to the device layer.
    pub fn release(
        &self,
        image: OwnedImage,
        entry: Option<&CacheEntry>,
        host: HostPtr,
        cst: Colorspace,
    ) {
        match entry {
            Some(entry) if image.is_pinned() && !host.is_null() => {
                let key = SidecarKey {
                    host,
                    device: image.device,
                    width: image.width,
                    height: image.height,
                    bpp: image.bpp,
                    flags: image.flags,
                };
                entry.sidecar_put(key, image, cst);
            }
            _ => drop(image),
        }
    }

    /// Whether the device reads `host` directly. Mapping a true zero-copy
    /// image yields the very host pointer it was created from.
    pub fn is_true_zero_copy(
        &self,
        image: &OwnedImage,
        host: HostPtr,
        width: usize,
        height: usize,
        bpp: usize,
    ) -> bool {
        if !image.is_pinned() {
            return false;
        }
        let mapped = match self
            .layer
            .map_image(image, true, MapMode::Read, width, height, bpp)
        {
            Ok(mapped) => mapped,
            Err(err) => {
                tracing::debug!("[opencl_pixelpipe] map for zero-copy detection failed: {}", err);
                return false;
            }
        };
        let unmapped = self.layer.unmap_image(image, mapped);
        let finished = self.layer.finish(self.device);
        unmapped.is_ok() && finished.is_ok() && mapped == host
    }

    /// Makes host and device content agree in the given direction.
    ///
    /// Pinned images get a map/unmap barrier first; an explicit copy is only
    /// issued when that mapping turned out not to be the host buffer itself.
    pub fn sync(
        &self,
        image: &OwnedImage,
        transfer: Transfer<'_>,
        width: usize,
        height: usize,
        bpp: usize,
    ) -> DeviceResult<()> {
        if image.is_pinned() {
            let mode = match transfer {
                Transfer::HostToDevice(_) => MapMode::Write,
                Transfer::DeviceToHost(_) => MapMode::Read,
            };
            let mapped = self.layer.map_image(image, true, mode, width, height, bpp)?;
            self.layer.unmap_image(image, mapped)?;
            self.layer.finish(self.device)?;
            if mapped == transfer.host_ptr() {
                return Ok(());
            }
        }

        match transfer {
            Transfer::HostToDevice(host) => {
                self.layer
                    .write_host_to_device(image, host, width, height, bpp)?
            }
            Transfer::DeviceToHost(host) => {
                self.layer
                    .read_device_to_host(image, host, width, height, bpp)?
            }
        }
        self.layer.finish(self.device)
    }
}
