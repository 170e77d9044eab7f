use log::{info, warn};
use serde::Serialize;

use super::Metadata;
use crate::block_device::{read_at, BlockDevice, IoChannel};
use crate::format::{Geometry, Header, MAX_METADATA_SIZE, METADATA_BLOCK_SIZE};
use crate::{fvm_error, Result, UbifvmError};

/// Which of the two on-disk metadata copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Primary,
    Secondary,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::Primary => Slot::Secondary,
            Slot::Secondary => Slot::Primary,
        }
    }

    pub fn offset(self, geometry: &Geometry) -> u64 {
        match self {
            Slot::Primary => 0,
            Slot::Secondary => geometry.metadata_size(),
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Primary => f.write_str("primary"),
            Slot::Secondary => f.write_str("secondary"),
        }
    }
}

/// Result of reading both copies and picking the active one.
#[derive(Debug)]
pub struct LoadedMetadata {
    pub active_slot: Slot,
    pub active: Metadata,
    /// Whether the copy in the other slot also passed validation.
    pub inactive_valid: bool,
}

pub(crate) struct CopyRead {
    /// Layout described by the copy's header, when the header was sane.
    pub geometry: Option<Geometry>,
    pub metadata: Result<Metadata>,
}

fn read_header(
    channel: &mut dyn IoChannel,
    block_size: u32,
    device_size: u64,
    offset: u64,
) -> Result<Geometry> {
    if offset + METADATA_BLOCK_SIZE > device_size {
        return Err(fvm_error!(TooSmall {
            required: offset + METADATA_BLOCK_SIZE,
            available: device_size,
        }));
    }
    let block = read_at(channel, block_size, offset, METADATA_BLOCK_SIZE as usize)?;
    Header::decode(&block)?.validate(device_size)
}

/// Reads and verifies the copy whose header sits at `offset`.
pub(crate) fn read_copy(
    channel: &mut dyn IoChannel,
    block_size: u32,
    device_size: u64,
    offset: u64,
) -> CopyRead {
    let geometry = match read_header(channel, block_size, device_size, offset) {
        Ok(geometry) => geometry,
        Err(e) => {
            return CopyRead {
                geometry: None,
                metadata: Err(e),
            }
        }
    };
    let metadata = read_at(
        channel,
        block_size,
        offset,
        geometry.metadata_size() as usize,
    )
    .and_then(|image| Metadata::decode(&image));
    CopyRead {
        geometry: Some(geometry),
        metadata,
    }
}

/// Finds the secondary copy when the primary header cannot tell us where it
/// is. A secondary copy at offset `M` describes a layout whose metadata
/// size is exactly `M`.
fn probe_secondary(channel: &mut dyn IoChannel, block_size: u32, device_size: u64) -> Option<u64> {
    let limit = probe_limit(device_size);
    let mut offset = METADATA_BLOCK_SIZE;
    while offset <= limit {
        if let Ok(geometry) = read_header(channel, block_size, device_size, offset) {
            if geometry.metadata_size() == offset {
                info!("Found secondary metadata copy at offset {offset} by probing");
                return Some(offset);
            }
        }
        offset += METADATA_BLOCK_SIZE;
    }
    None
}

/// Highest offset a secondary copy can start at on a device of this size.
fn probe_limit(device_size: u64) -> u64 {
    (device_size / 2).min(MAX_METADATA_SIZE)
}

pub(crate) fn read_both(device: &dyn BlockDevice, channel: &mut dyn IoChannel) -> (CopyRead, CopyRead) {
    let block_size = device.block_size();
    let device_size = device.size_bytes();

    let primary = read_copy(channel, block_size, device_size, 0);
    let secondary_offset = match primary.geometry {
        Some(geometry) => Some(geometry.metadata_size()),
        None => probe_secondary(channel, block_size, device_size),
    };
    let secondary = match secondary_offset {
        Some(offset) => {
            let copy = read_copy(channel, block_size, device_size, offset);
            match copy.geometry {
                Some(geometry) if geometry.metadata_size() != offset => CopyRead {
                    geometry: None,
                    metadata: Err(fvm_error!(MetadataCorrupt {
                        description: format!(
                            "secondary copy at {offset} describes a {}-byte layout",
                            geometry.metadata_size()
                        ),
                    })),
                },
                _ => copy,
            }
        }
        None => CopyRead {
            geometry: None,
            metadata: Err(fvm_error!(Incompatible {
                description: "no secondary metadata copy found".to_string(),
            })),
        },
    };
    (primary, secondary)
}

/// Reads both copies and returns the valid one with the higher generation.
/// The primary wins a tie.
pub fn load_metadata(device: &dyn BlockDevice) -> Result<LoadedMetadata> {
    info!("Loading metadata from device");
    let mut channel = device.create_channel()?;
    let (primary, secondary) = read_both(device, channel.as_mut());

    let loaded = match (primary.metadata, secondary.metadata) {
        (Ok(primary), Ok(secondary)) => {
            if secondary.generation() > primary.generation() {
                LoadedMetadata {
                    active_slot: Slot::Secondary,
                    active: secondary,
                    inactive_valid: true,
                }
            } else {
                LoadedMetadata {
                    active_slot: Slot::Primary,
                    active: primary,
                    inactive_valid: true,
                }
            }
        }
        (Ok(primary), Err(e)) => {
            warn!("Secondary metadata copy is unusable, using primary: {e}");
            LoadedMetadata {
                active_slot: Slot::Primary,
                active: primary,
                inactive_valid: false,
            }
        }
        (Err(e), Ok(secondary)) => {
            warn!("Primary metadata copy is unusable, using secondary: {e}");
            LoadedMetadata {
                active_slot: Slot::Secondary,
                active: secondary,
                inactive_valid: false,
            }
        }
        (Err(primary_err), Err(secondary_err)) => {
            warn!("Secondary metadata copy is unusable: {secondary_err}");
            return Err(pick_error(primary_err, secondary_err));
        }
    };

    info!(
        "Loaded metadata generation {} from the {} copy",
        loaded.active.generation(),
        loaded.active_slot
    );
    Ok(loaded)
}

/// Corruption of either copy is reported ahead of other failures.
fn pick_error(primary: UbifvmError, secondary: UbifvmError) -> UbifvmError {
    match (&primary, &secondary) {
        (UbifvmError::MetadataCorrupt { .. }, _) => primary,
        (_, UbifvmError::MetadataCorrupt { .. }) => secondary,
        _ => primary,
    }
}
