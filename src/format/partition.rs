use std::borrow::Cow;

use super::Guid;
use crate::{fvm_error, Result};

pub const PARTITION_ENTRY_SIZE: usize = 64;
/// Size of the NUL-padded name field.
pub const NAME_LEN: usize = 24;
/// Longest name that still leaves room for a terminating NUL.
pub const MAX_NAME_LEN: usize = NAME_LEN - 1;

/// Set while a partition is being prepared as an upgrade target.
pub const FLAG_INACTIVE: u32 = 0x1;

/// One 64-byte row of the partition table. An all-zero entry is a free slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub instance_guid: Guid,
    pub name: [u8; NAME_LEN],
    pub flags: u32,
    pub slice_count: u32,
}

impl PartitionEntry {
    pub fn new(type_guid: Guid, instance_guid: Guid, name: &str, flags: u32) -> Result<Self> {
        let mut entry = PartitionEntry {
            type_guid,
            instance_guid,
            flags,
            ..Default::default()
        };
        entry.set_name(name)?;
        Ok(entry)
    }

    pub fn is_free(&self) -> bool {
        *self == PartitionEntry::default()
    }

    pub fn is_inactive(&self) -> bool {
        self.flags & FLAG_INACTIVE != 0
    }

    pub fn is_active(&self) -> bool {
        !self.is_free() && !self.is_inactive()
    }

    pub fn name(&self) -> Cow<'_, str> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end])
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.name = [0; NAME_LEN];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..16].copy_from_slice(self.type_guid.as_bytes());
        buf[16..32].copy_from_slice(self.instance_guid.as_bytes());
        buf[32..56].copy_from_slice(&self.name);
        buf[56..60].copy_from_slice(&self.flags.to_le_bytes());
        buf[60..64].copy_from_slice(&self.slice_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut type_guid = [0u8; 16];
        let mut instance_guid = [0u8; 16];
        let mut name = [0u8; NAME_LEN];
        let mut flags = [0u8; 4];
        let mut slice_count = [0u8; 4];
        type_guid.copy_from_slice(&buf[0..16]);
        instance_guid.copy_from_slice(&buf[16..32]);
        name.copy_from_slice(&buf[32..56]);
        flags.copy_from_slice(&buf[56..60]);
        slice_count.copy_from_slice(&buf[60..64]);
        PartitionEntry {
            type_guid: Guid(type_guid),
            instance_guid: Guid(instance_guid),
            name,
            flags: u32::from_le_bytes(flags),
            slice_count: u32::from_le_bytes(slice_count),
        }
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(fvm_error!(InvalidParameter {
            description: format!(
                "partition name {name:?} must be 1 to {MAX_NAME_LEN} bytes without NUL"
            ),
        }));
    }
    Ok(())
}
