use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::arena::PooledBlock;
use crate::buffer::{BufferDesc, Colorspace, HostPtr};
use crate::device::{DeviceId, ImageFlags, OwnedImage};

pub type EntryReadGuard = ArcRwLockReadGuard<RawRwLock, EntryData>;
pub type EntryWriteGuard = ArcRwLockWriteGuard<RawRwLock, EntryData>;

/// The part of an entry protected by its reader/writer lock.
#[derive(Debug)]
pub struct EntryData {
    block: PooledBlock,
    pub dsc: BufferDesc,
}

impl EntryData {
    pub(crate) fn new(block: PooledBlock, dsc: BufferDesc) -> Self {
        Self { block, dsc }
    }

    /// The whole page-rounded buffer.
    pub fn bytes(&self) -> &[u8] {
        self.block.data()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.block.data_mut()
    }

    /// Split borrow of the buffer and its descriptor.
    pub fn parts_mut(&mut self) -> (&mut [u8], &mut BufferDesc) {
        (self.block.data_mut(), &mut self.dsc)
    }

    pub fn host_ptr(&self) -> HostPtr {
        self.block.host_ptr()
    }

    /// Gives the pages back to the arena. Later readers see an empty buffer.
    pub(crate) fn release_storage(&mut self) {
        self.block.release();
    }

    pub fn is_released(&self) -> bool {
        self.block.is_released()
    }
}

/// Identity of a device image bound to a host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidecarKey {
    pub host: HostPtr,
    pub device: DeviceId,
    pub width: usize,
    pub height: usize,
    pub bpp: usize,
    pub flags: ImageFlags,
}

struct SidecarImage {
    key: SidecarKey,
    image: OwnedImage,
    cst: Colorspace,
}

/// One cached buffer plus the metadata the cache needs to manage it.
pub struct CacheEntry {
    hash: u64,
    size: usize,
    name: String,
    pipe_id: i32,
    external: bool,
    host_ptr: HostPtr,
    refcount: AtomicI32,
    hits: AtomicU32,
    age: AtomicU64,
    auto_destroy: AtomicBool,
    data: Arc<RwLock<EntryData>>,
    sidecar: Mutex<Vec<SidecarImage>>,
}

impl CacheEntry {
    pub(crate) fn new(
        hash: u64,
        name: &str,
        pipe_id: i32,
        external: bool,
        data: EntryData,
        age: u64,
    ) -> Self {
        Self {
            hash,
            size: data.block.size(),
            name: name.to_string(),
            pipe_id,
            external,
            host_ptr: data.host_ptr(),
            refcount: AtomicI32::new(0),
            hits: AtomicU32::new(0),
            age: AtomicU64::new(age),
            auto_destroy: AtomicBool::new(false),
            data: Arc::new(RwLock::new(data)),
            sidecar: Mutex::new(Vec::new()),
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Page-rounded size accounted against the cache budget.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipe_id(&self) -> i32 {
        self.pipe_id
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Address of the host buffer; stable for the entry's lifetime.
    pub fn host_ptr(&self) -> HostPtr {
        self.host_ptr
    }

    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. Never goes below zero.
    pub fn release_ref(&self) {
        let released = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count - 1)
            });
        if released.is_err() {
            tracing::warn!(
                "[pixelpipe_cache] entry {} ({}) released more often than referenced",
                self.hash,
                self.name
            );
        }
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Acquire)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::AcqRel);
    }

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now: u64) {
        self.age.store(now, Ordering::Release);
    }

    pub fn is_auto_destroy(&self) -> bool {
        self.auto_destroy.load(Ordering::Acquire)
    }

    pub fn set_auto_destroy(&self) {
        self.auto_destroy.store(true, Ordering::Release);
    }

    pub fn read(&self) -> EntryReadGuard {
        self.data.read_arc()
    }

    pub fn write(&self) -> EntryWriteGuard {
        self.data.write_arc()
    }

    pub fn try_read(&self) -> Option<EntryReadGuard> {
        self.data.try_read_arc()
    }

    pub fn try_write(&self) -> Option<EntryWriteGuard> {
        self.data.try_write_arc()
    }

    /// Held by a writer or by at least one reader.
    pub fn is_locked(&self) -> bool {
        self.data.is_locked()
    }

    /// Whether the exclusive lock could be taken right now, without keeping it.
    pub(crate) fn lock_is_free(&self) -> bool {
        self.try_write().is_some()
    }

    /// Unused and not locked by anybody: eligible for eviction.
    pub(crate) fn is_evictable(&self) -> bool {
        self.refcount() == 0 && self.lock_is_free()
    }

    /// Detaches the device image cached under `key`, with the colorspace its
    /// content was uploaded in.
    pub fn sidecar_get(&self, key: &SidecarKey) -> Option<(OwnedImage, Colorspace)> {
        let mut sidecar = self.sidecar.lock();
        let idx = sidecar.iter().position(|img| img.key == *key)?;
        let found = sidecar.swap_remove(idx);
        Some((found.image, found.cst))
    }

    /// Stores `image` under `key`, releasing any image already cached there.
    pub fn sidecar_put(&self, key: SidecarKey, image: OwnedImage, cst: Colorspace) {
        let stale = {
            let mut sidecar = self.sidecar.lock();
            match sidecar.iter_mut().find(|img| img.key == key) {
                Some(slot) => {
                    slot.cst = cst;
                    Some(std::mem::replace(&mut slot.image, image))
                }
                None => {
                    sidecar.push(SidecarImage { key, image, cst });
                    None
                }
            }
        };
        drop(stale);
    }

    /// Releases the cached images of `device`, or all of them. Returns how many.
    pub fn sidecar_flush(&self, device: Option<DeviceId>) -> usize {
        let released: Vec<SidecarImage> = {
            let mut sidecar = self.sidecar.lock();
            let (flushed, kept): (Vec<_>, Vec<_>) = sidecar
                .drain(..)
                .partition(|img| device.is_none_or(|dev| img.key.device == dev));
            *sidecar = kept;
            flushed
        };
        released.len()
    }

    pub fn sidecar_len(&self) -> usize {
        self.sidecar.lock().len()
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("hash", &self.hash)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("pipe_id", &self.pipe_id)
            .field("refcount", &self.refcount())
            .field("hits", &self.hits())
            .field("age", &self.age())
            .field("auto_destroy", &self.is_auto_destroy())
            .field("external", &self.external)
            .finish()
    }
}
