// Memory
pub use crate::arena::{Arena, ArenaBlock, ArenaStats, PooledBlock, SharedArena, PAGE_SIZE};
pub use crate::buffer::{
    AlignedBuf, BufferDesc, Colorspace, DataType, HostPtr, PixelView, PixelViewMut,
};
pub use crate::roi::Roi;

// Cache
pub use crate::cache::{
    current_module, AgingTimer, CacheEntry, CacheStats, EntryData, EntryReadGuard,
    EntrySnapshot, EntryWriteGuard, ExternalBuffer, Lookup, ModuleScope, PixelCache,
    ReadOnlyEntry, SidecarKey, ANY_PIPE,
};

// Errors and configuration
pub use crate::config::{CacheConfig, ConfigError, ExecutorConfig, GpuConfig, PipelineConfig};
pub use crate::error::{
    ArenaError, DeviceError, ModuleError, ModuleResult, PipeError, PipeResult,
};

// Devices
pub use crate::device::{
    DeviceId, DeviceLayer, EmulatedDevice, EmulatedDeviceConfig, EventSummary, GpuSession,
    ImageFlags, ImageHandle, MapMode, OwnedImage,
};
pub use crate::sidecar::{Acquired, Sidecar, Transfer};

// Modules and processing
pub use crate::blend::{
    BlendMode, BlendParams, Blender, DefaultBlender, MaskMode, RasterMask, RasterSource,
    BLEND_RASTER_ID,
};
pub use crate::colorspace::{needs_conversion, ColorspaceConverter, StandardConverter};
pub use crate::module::{
    resample_mask, GpuImage, GpuTask, HistogramRole, Module, ModuleFlags, OperationTags,
};
pub use crate::tiling::{process_tiled, rows_per_tile, TilingRequirements};

// Pipelines
pub use crate::context::PipelineServices;
pub use crate::controller::Controller;
pub use crate::node::{Node, ProcessingFlow};
pub use crate::pipeline::{KillSwitch, PipeType, Pipeline, Reentry};
pub use crate::planner::Plan;
pub use crate::source::{ImageSource, InMemorySource};

// Sampling
pub use crate::sampling::{
    ColorPicker, GlobalHistograms, Histogram, PickerRequest, PickerResult, PickerSample,
    HISTOGRAM_BINS,
};
