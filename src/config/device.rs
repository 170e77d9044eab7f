use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;

use crate::block_device::{BlockDevice, SyncBlockDevice, UringBlockDevice};
use crate::format::{DEFAULT_MAX_PARTITIONS, DEFAULT_SLICE_SIZE};
use crate::metadata::FormatOptions;
use crate::{fvm_error, Result};

fn default_queue_size() -> usize {
    64
}

fn default_direct_io() -> bool {
    false
}

fn default_write_through() -> bool {
    false
}

fn default_readonly() -> bool {
    false
}

fn default_slice_size() -> u64 {
    DEFAULT_SLICE_SIZE
}

fn default_max_partitions() -> u64 {
    DEFAULT_MAX_PARTITIONS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoEngine {
    IoUring,
    #[default]
    Sync,
}

/// Layout used when the device is formatted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FormatConfig {
    #[serde(default = "default_slice_size")]
    pub slice_size: u64,
    /// Allocation table capacity; derived from the device size when unset.
    #[serde(default)]
    pub max_slices: Option<u64>,
    #[serde(default = "default_max_partitions")]
    pub max_partitions: u64,
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            slice_size: default_slice_size(),
            max_slices: None,
            max_partitions: default_max_partitions(),
        }
    }
}

impl FormatConfig {
    pub fn options(&self) -> FormatOptions {
        FormatOptions {
            slice_size: self.slice_size,
            max_pslices: self.max_slices,
            max_partitions: self.max_partitions,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Image file or block device holding the volume.
    pub path: String,

    #[serde(default)]
    pub io_engine: IoEngine,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_direct_io")]
    pub direct_io: bool,

    #[serde(default = "default_write_through")]
    pub write_through: bool,

    #[serde(default = "default_readonly")]
    pub readonly: bool,

    pub rpc_socket_path: Option<String>,

    #[serde(default)]
    pub format: FormatConfig,
}

impl ManagerConfig {
    fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(fvm_error!(InvalidParameter {
                description: "path must not be empty".to_string(),
            }));
        }
        if self.queue_size == 0 || !self.queue_size.is_power_of_two() {
            return Err(fvm_error!(InvalidParameter {
                description: format!("queue_size {} must be a power of two", self.queue_size),
            }));
        }
        if self.write_through && self.io_engine == IoEngine::IoUring {
            return Err(fvm_error!(InvalidParameter {
                description: "write_through is only supported by the sync io engine".to_string(),
            }));
        }
        Ok(())
    }

    pub fn load_from_str(yaml_str: &str) -> Result<Self> {
        let config: ManagerConfig = serde_yaml::from_str(yaml_str).map_err(|e| {
            fvm_error!(InvalidParameter {
                description: format!("Failed to parse manager config YAML: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            fvm_error!(InvalidParameter {
                description: format!(
                    "Failed to read manager config file {}: {e}",
                    path.display()
                ),
            })
        })?;
        Self::load_from_str(&contents)
    }

    /// Opens the configured device with the configured engine.
    pub fn build_device(&self) -> Result<Box<dyn BlockDevice>> {
        let path = PathBuf::from(&self.path);
        info!(
            "Opening {} with the {:?} engine{}",
            self.path,
            self.io_engine,
            if self.readonly { " (read-only)" } else { "" }
        );
        let device: Box<dyn BlockDevice> = match self.io_engine {
            IoEngine::Sync => {
                SyncBlockDevice::new(path, self.readonly, self.direct_io, self.write_through)?
            }
            IoEngine::IoUring => {
                UringBlockDevice::new(path, self.queue_size, self.readonly, self.direct_io)?
            }
        };
        Ok(device)
    }
}
