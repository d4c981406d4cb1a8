//! Buffer descriptors and cache-line aligned pixel storage.

use bytemuck::{Pod, Zeroable};
use strum_macros::{AsRefStr, Display};

use crate::roi::Roi;

pub const CACHELINE_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, AsRefStr)]
pub enum Colorspace {
    #[default]
    None,
    Raw,
    Lab,
    Rgb,
    Hsl,
    JzCzhz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
pub enum DataType {
    #[default]
    Float32,
    Uint16,
    Uint8,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Uint16 => 2,
            DataType::Uint8 => 1,
        }
    }
}

/// Layout and color metadata of a pixel buffer.
///
/// The colorspace tag changes on in-place conversions and is only written by
/// the holder of the owning cache entry's write lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferDesc {
    pub channels: usize,
    pub datatype: DataType,
    pub cst: Colorspace,
    pub processed_maximum: [f32; 4],
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self::rgba_f32(Colorspace::Rgb)
    }
}

impl BufferDesc {
    pub fn new(channels: usize, datatype: DataType, cst: Colorspace) -> Self {
        Self {
            channels,
            datatype,
            cst,
            processed_maximum: [1.0; 4],
        }
    }

    pub fn rgba_f32(cst: Colorspace) -> Self {
        Self::new(4, DataType::Float32, cst)
    }

    pub fn raw_f32() -> Self {
        Self::new(1, DataType::Float32, Colorspace::Raw)
    }

    pub fn rgba_u8() -> Self {
        Self::new(4, DataType::Uint8, Colorspace::Rgb)
    }

    /// Bytes per pixel.
    pub fn bpp(&self) -> usize {
        self.channels * self.datatype.size()
    }

    pub fn buffer_size(&self, roi: &Roi) -> usize {
        roi.pixels() * self.bpp()
    }

    pub fn with_cst(mut self, cst: Colorspace) -> Self {
        self.cst = cst;
        self
    }
}

/// Identity of a host buffer, as seen by the device layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HostPtr(pub usize);

impl HostPtr {
    pub fn of(bytes: &[u8]) -> Self {
        Self(bytes.as_ptr() as usize)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct CacheLine([u8; CACHELINE_BYTES]);

// Safety: a plain byte array with no padding, valid for every bit pattern.
unsafe impl Zeroable for CacheLine {}
unsafe impl Pod for CacheLine {}

/// Zero-initialised byte storage aligned to a cache line.
///
/// Backed by `Vec<CacheLine>` so vectorised kernels can assume 64-byte
/// alignment of the first pixel.
pub struct AlignedBuf {
    storage: Vec<CacheLine>,
    len: usize,
}

impl AlignedBuf {
    pub fn new_zeroed(len: usize) -> Self {
        Self {
            storage: vec![CacheLine([0; CACHELINE_BYTES]); len.div_ceil(CACHELINE_BYTES)],
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.storage)[..self.len]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.storage)[..self.len]
    }

    pub fn host_ptr(&self) -> HostPtr {
        HostPtr(self.storage.as_ptr() as usize)
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.host_ptr())
            .field("len", &self.len)
            .finish()
    }
}

/// Read access to a pixel buffer with its descriptor and ROI.
#[derive(Debug, Clone, Copy)]
pub struct PixelView<'a> {
    pub data: &'a [u8],
    pub dsc: BufferDesc,
    pub roi: Roi,
}

impl<'a> PixelView<'a> {
    pub fn new(data: &'a [u8], dsc: BufferDesc, roi: Roi) -> Self {
        Self { data, dsc, roi }
    }

    /// Float view of the pixel data; panics if the buffer is not float32.
    pub fn as_f32(&self) -> &'a [f32] {
        assert_eq!(self.dsc.datatype, DataType::Float32);
        bytemuck::cast_slice(self.data)
    }
}

/// Write access to a pixel buffer with its descriptor and ROI.
#[derive(Debug)]
pub struct PixelViewMut<'a> {
    pub data: &'a mut [u8],
    pub dsc: BufferDesc,
    pub roi: Roi,
}

impl<'a> PixelViewMut<'a> {
    pub fn new(data: &'a mut [u8], dsc: BufferDesc, roi: Roi) -> Self {
        Self { data, dsc, roi }
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        assert_eq!(self.dsc.datatype, DataType::Float32);
        bytemuck::cast_slice_mut(self.data)
    }

    pub fn as_view(&self) -> PixelView<'_> {
        PixelView::new(&*self.data, self.dsc, self.roi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buf_is_cacheline_aligned() {
        let buf = AlignedBuf::new_zeroed(1000);
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.as_slice().as_ptr() as usize % CACHELINE_BYTES, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn bpp_follows_datatype() {
        assert_eq!(BufferDesc::rgba_f32(Colorspace::Rgb).bpp(), 16);
        assert_eq!(BufferDesc::raw_f32().bpp(), 4);
        assert_eq!(BufferDesc::rgba_u8().bpp(), 4);
        assert_eq!(BufferDesc::new(3, DataType::Uint16, Colorspace::Rgb).bpp(), 6);
    }

    #[test]
    fn float_view_covers_whole_buffer() {
        let mut buf = AlignedBuf::new_zeroed(64);
        let roi = Roi::full(2, 2);
        let mut view = PixelViewMut::new(buf.as_mut_slice(), BufferDesc::default(), roi);
        view.as_f32_mut()[15] = 2.5;
        assert_eq!(view.as_view().as_f32().len(), 16);
        assert_eq!(view.as_view().as_f32()[15], 2.5);
    }
}
