use log::info;
use serde::Serialize;

use super::load::{read_both, CopyRead};
use super::{Metadata, Slot};
use crate::block_device::BlockDevice;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct CopyReport {
    pub slot: Slot,
    pub offset: Option<u64>,
    pub generation: Option<u64>,
    /// Hex SHA-256 recorded in the header.
    pub hash: Option<String>,
    pub valid: bool,
    pub error: Option<String>,
}

/// Outcome of validating both metadata copies of a device.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub primary: CopyReport,
    pub secondary: CopyReport,
    pub active: Option<Slot>,
    pub slice_size: Option<u64>,
    pub pslice_count: Option<u64>,
    pub allocated_slices: Option<u64>,
    pub partitions: Option<usize>,
}

impl CheckReport {
    /// Both copies are present and pass every check.
    pub fn is_clean(&self) -> bool {
        self.primary.valid && self.secondary.valid
    }
}

fn copy_report(slot: Slot, offset: Option<u64>, copy: &CopyRead) -> CopyReport {
    match &copy.metadata {
        Ok(metadata) => CopyReport {
            slot,
            offset,
            generation: Some(metadata.generation()),
            hash: Some(hex::encode(metadata.header.hash)),
            valid: true,
            error: None,
        },
        Err(e) => CopyReport {
            slot,
            offset: copy.geometry.and(offset),
            generation: None,
            hash: None,
            valid: false,
            error: Some(e.to_string()),
        },
    }
}

/// Validates both copies without modifying the device.
pub fn check_image(device: &dyn BlockDevice) -> Result<CheckReport> {
    let mut channel = device.create_channel()?;
    let (primary, secondary) = read_both(device, channel.as_mut());

    let secondary_offset = primary
        .geometry
        .or(secondary.geometry)
        .map(|geometry| geometry.metadata_size());
    let primary_report = copy_report(Slot::Primary, Some(0), &primary);
    let secondary_report = copy_report(Slot::Secondary, secondary_offset, &secondary);

    let active: Option<(Slot, &Metadata)> = match (&primary.metadata, &secondary.metadata) {
        (Ok(p), Ok(s)) if s.generation() > p.generation() => Some((Slot::Secondary, s)),
        (Ok(p), _) => Some((Slot::Primary, p)),
        (Err(_), Ok(s)) => Some((Slot::Secondary, s)),
        (Err(_), Err(_)) => None,
    };

    let report = CheckReport {
        primary: primary_report,
        secondary: secondary_report,
        active: active.map(|(slot, _)| slot),
        slice_size: active.map(|(_, m)| m.header.pslice_size),
        pslice_count: active.map(|(_, m)| m.pslice_count()),
        allocated_slices: active.map(|(_, m)| m.allocated_slices().count() as u64),
        partitions: active.map(|(_, m)| m.live_partitions().count()),
    };
    info!(
        "Checked metadata: primary valid {}, secondary valid {}",
        report.primary.valid, report.secondary.valid
    );
    Ok(report)
}
