use std::path::Path;
use std::time::Duration;

use common::file_format::{FileExtensionError, SerdeFormat, SerdeFormatError};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceId;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Format(#[from] FileExtensionError),
    #[error(transparent)]
    Serde(#[from] SerdeFormatError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard upper bound on host memory managed by the pixel cache.
    pub max_memory_bytes: usize,
    pub aging_sweep_interval_secs: u64,
    pub aging_threshold_secs: u64,
    pub min_hits_to_keep: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 2 * 1024 * MIB as usize,
            aging_sweep_interval_secs: 5 * 60,
            aging_threshold_secs: 3 * 60,
            min_hits_to_keep: 4,
        }
    }
}

impl CacheConfig {
    pub fn with_max_memory(max_memory_bytes: usize) -> Self {
        Self {
            max_memory_bytes,
            ..Self::default()
        }
    }

    pub fn aging_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.aging_sweep_interval_secs)
    }

    pub fn aging_threshold(&self) -> Duration {
        Duration::from_secs(self.aging_threshold_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Longest wait for a mandatory device before running on CPU.
    pub mandatory_timeout_ms: u64,
    pub synchronization_timeout_ms: u64,
    /// Host memory offered to a single module; 0 means unlimited.
    pub host_memory_limit_bytes: usize,
    pub max_reentries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mandatory_timeout_ms: 400,
            synchronization_timeout_ms: 200,
            host_memory_limit_bytes: 0,
            max_reentries: 2,
        }
    }
}

impl ExecutorConfig {
    pub fn mandatory_timeout(&self) -> Duration {
        Duration::from_millis(self.mandatory_timeout_ms)
    }

    pub fn synchronization_timeout(&self) -> Duration {
        Duration::from_millis(self.synchronization_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub enabled: bool,
    /// vRAM kept away from pipelines.
    pub headroom_mb: u64,
    pub device_headroom_mb: HashMap<DeviceId, u64>,
    pub max_errors_per_session: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            headroom_mb: 400,
            device_headroom_mb: HashMap::new(),
            max_errors_per_session: 5,
        }
    }
}

impl GpuConfig {
    pub fn headroom_bytes(&self, device: DeviceId) -> u64 {
        self.device_headroom_mb
            .get(&device)
            .copied()
            .unwrap_or(self.headroom_mb)
            * MIB
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub pipeline: ExecutorConfig,
    pub gpu: GpuConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let format = SerdeFormat::from_path(path)?;
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, format)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    "[pixelpipe] failed to load {}: {}, using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn parse(text: &str, format: SerdeFormat) -> ConfigResult<Self> {
        let config: Self = format.deserialize(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let format = SerdeFormat::from_path(path)?;
        std::fs::write(path, format.serialize(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache.max_memory_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_memory_bytes must be positive".into(),
            ));
        }
        if self.cache.aging_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.aging_sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
