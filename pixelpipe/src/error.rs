use thiserror::Error;

use crate::buffer::Colorspace;
use crate::device::DeviceId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("invalid arena request of {0} bytes")]
    InvalidSize(usize),
    #[error("out of arena: no free run of {pages} pages")]
    OutOfArena { pages: usize },
}

pub type ArenaResult<T> = std::result::Result<T, ArenaError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device {0} is not available")]
    Unavailable(DeviceId),
    #[error("device allocation of {width}x{height}x{bpp} failed")]
    Allocation {
        width: usize,
        height: usize,
        bpp: usize,
    },
    #[error("unknown device image {0}")]
    UnknownImage(u64),
    #[error("device transfer failed: {0}")]
    Transfer(String),
    #[error("kernel `{0}` failed")]
    Kernel(String),
    #[error("device queue reported {0} errors")]
    Queue(usize),
    #[error("device {device} did not synchronize within {waited_ms} ms")]
    Timeout { device: DeviceId, waited_ms: u64 },
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{0} is not implemented by this module")]
    Unsupported(&'static str),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("pipeline aborted")]
    Aborted,
    #[error("{}", cache_full_message(.name, .module.as_deref()))]
    CacheFull {
        name: String,
        module: Option<String>,
    },
    #[error("GPU processing failed: {0}")]
    GpuFailure(#[from] DeviceError),
    #[error("module `{module}` needs more host memory than available and cannot tile")]
    CpuOversize { module: String },
    #[error("module `{module}` could not find its mask")]
    MaskMissing { module: String },
    #[error("module `{module}` failed: {source}")]
    Module {
        module: String,
        #[source]
        source: ModuleError,
    },
    #[error("input stage failed: {0}")]
    Input(String),
    #[error("cannot convert {from} buffer to {to}")]
    Conversion { from: Colorspace, to: Colorspace },
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

pub type PipeResult<T> = std::result::Result<T, PipeError>;

impl PipeError {
    pub fn module(module: &str, source: ModuleError) -> Self {
        Self::Module {
            module: module.to_string(),
            source,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

fn cache_full_message(name: &str, module: Option<&str>) -> String {
    match module {
        Some(module) => format!(
            "The pipeline cache is full while allocating `{}` (module `{}`)",
            name, module
        ),
        None => format!("The pipeline cache is full while allocating `{}`", name),
    }
}
