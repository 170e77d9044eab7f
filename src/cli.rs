use std::path::PathBuf;

use clap::{Args, Subcommand};
use log::info;
use serde::Serialize;

use crate::config::ManagerConfig;
use crate::format::{Guid, FLAG_INACTIVE};
use crate::manager::{PartitionRequest, VolumeManager};
use crate::metadata::check_image;
use crate::{fvm_error, Result};

#[derive(Args, Debug, Clone)]
/// Arguments shared by every binary.
pub struct CommonArgs {
    /// Path to the configuration YAML file.
    #[arg(short = 'f', long = "config")]
    pub config: PathBuf,
}

pub fn load_config(common: &CommonArgs) -> Result<ManagerConfig> {
    ManagerConfig::load_from_file(&common.config)
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Write an empty volume to the configured device.
    Format {
        /// Slice size in bytes; overrides the configuration.
        #[arg(long)]
        slice_size: Option<u64>,
        /// Allocation table capacity in slices.
        #[arg(long)]
        max_slices: Option<u64>,
        /// Partition table entries.
        #[arg(long)]
        max_partitions: Option<u64>,
    },
    /// Print volume information.
    Info,
    /// Validate both metadata copies without binding the volume.
    Check,
    /// Allocate a partition.
    Create {
        name: String,
        #[arg(short, long, default_value_t = 1)]
        slices: u64,
        /// Partition type; random when omitted.
        #[arg(long)]
        type_guid: Option<Guid>,
        /// Instance guid; random when omitted.
        #[arg(long)]
        instance_guid: Option<Guid>,
        /// Create the partition inactive.
        #[arg(long, default_value_t = false)]
        inactive: bool,
    },
    /// Add slices to a partition.
    Extend {
        instance_guid: Guid,
        vslice_start: u64,
        count: u64,
    },
    /// Release slices of a partition.
    Shrink {
        instance_guid: Guid,
        vslice_start: u64,
        count: u64,
    },
    Destroy {
        instance_guid: Guid,
    },
    /// Replace an active partition by an inactive one.
    Activate {
        old_guid: Guid,
        new_guid: Guid,
    },
    /// Use all of a device that grew since it was formatted.
    Grow,
    /// Serve the control socket until the process is killed.
    Serve,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run_command(config: &ManagerConfig, command: Command) -> Result<()> {
    match command {
        Command::Format {
            slice_size,
            max_slices,
            max_partitions,
        } => {
            let mut format = config.format.clone();
            format.slice_size = slice_size.unwrap_or(format.slice_size);
            format.max_slices = max_slices.or(format.max_slices);
            format.max_partitions = max_partitions.unwrap_or(format.max_partitions);
            let device = config.build_device()?;
            let geometry = VolumeManager::format(device.as_ref(), &format.options())?;
            info!(
                "Formatted {} with {} metadata bytes per copy",
                config.path,
                geometry.metadata_size()
            );
            Ok(())
        }
        Command::Check => {
            let report = check_image(config.build_device()?.as_ref())?;
            print_json(&report)?;
            if report.active.is_none() {
                return Err(fvm_error!(MetadataCorrupt {
                    description: "no valid metadata copy".to_string(),
                }));
            }
            Ok(())
        }
        command => {
            let manager = VolumeManager::open(config)?;
            let result = run_bound(config, &manager, command);
            manager.unbind()?;
            result
        }
    }
}

fn run_bound(
    config: &ManagerConfig,
    manager: &std::sync::Arc<VolumeManager>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Info => {
            print_json(&manager.query_info()?)?;
            print_json(&manager.list_partitions()?)
        }
        Command::Create {
            name,
            slices,
            type_guid,
            instance_guid,
            inactive,
        } => {
            let partition = manager.allocate_partition(&PartitionRequest {
                type_guid: type_guid.unwrap_or_else(Guid::new_random),
                instance_guid: instance_guid.unwrap_or_else(Guid::new_random),
                name,
                slice_count: slices,
                flags: if inactive { FLAG_INACTIVE } else { 0 },
            })?;
            print_json(&partition.info()?)
        }
        Command::Extend {
            instance_guid,
            vslice_start,
            count,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            partition.extend(vslice_start, count)?;
            print_json(&partition.info()?)
        }
        Command::Shrink {
            instance_guid,
            vslice_start,
            count,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            partition.shrink(vslice_start, count)?;
            print_json(&partition.info()?)
        }
        Command::Destroy { instance_guid } => manager.find_partition(&instance_guid)?.destroy(),
        Command::Activate { old_guid, new_guid } => manager.activate(&old_guid, &new_guid),
        Command::Grow => {
            let slices = manager.grow(manager.device_size())?;
            info!("Volume now has {slices} slices");
            Ok(())
        }
        Command::Serve => {
            let path = config.rpc_socket_path.as_ref().ok_or_else(|| {
                fvm_error!(InvalidParameter {
                    description: "rpc_socket_path is not configured".to_string(),
                })
            })?;
            let handle = crate::rpc::start_rpc_server(path, manager.clone())?;
            handle.join().map_err(|_| {
                fvm_error!(RpcError {
                    description: "RPC listener thread panicked".to_string(),
                })
            })
        }
        Command::Format { .. } | Command::Check => Ok(()),
    }
}
