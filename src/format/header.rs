use static_assertions::const_assert_eq;

use super::{
    MAJOR_VERSION, MAX_VSLICES, METADATA_BLOCK_SIZE, MINOR_VERSION, PARTITION_ENTRY_SIZE,
    SLICE_ENTRY_SIZE,
};
use crate::{fvm_error, utils::round_up, Result};

/// "FVM PART" read as a little-endian u64.
pub const MAGIC0: u64 = 0x5452_4150_204d_5646;
/// "SLICEMAP" read as a little-endian u64.
pub const MAGIC1: u64 = 0x5041_4d45_4349_4c53;

pub const HEADER_SIZE: usize = 104;
pub const HASH_OFFSET: usize = 72;
pub const HASH_SIZE: usize = 32;

const_assert_eq!(HASH_OFFSET + HASH_SIZE, HEADER_SIZE);

/// Largest partition table the 16-bit partition index can address.
const MAX_PARTITION_TABLE_ENTRIES: u64 = 1 << 16;

/// Size of one metadata copy with both tables at their largest valid size.
pub const MAX_METADATA_SIZE: u64 = round_up(
    HEADER_SIZE as u64
        + MAX_PARTITION_TABLE_ENTRIES * PARTITION_ENTRY_SIZE as u64
        + MAX_VSLICES * SLICE_ENTRY_SIZE as u64,
    METADATA_BLOCK_SIZE,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic0: u64,
    pub magic1: u64,
    pub major_version: u64,
    pub oldest_minor_version: u64,
    pub pslice_size: u64,
    pub pslice_count: u64,
    pub partition_table_entry_count: u64,
    pub allocation_table_entry_count: u64,
    pub generation: u64,
    pub hash: [u8; HASH_SIZE],
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

impl Header {
    pub fn new(geometry: &Geometry, pslice_count: u64) -> Self {
        Header {
            magic0: MAGIC0,
            magic1: MAGIC1,
            major_version: MAJOR_VERSION,
            oldest_minor_version: MINOR_VERSION,
            pslice_size: geometry.slice_size,
            pslice_count,
            partition_table_entry_count: geometry.partition_table_entry_count,
            allocation_table_entry_count: geometry.allocation_table_entry_count,
            generation: 0,
            hash: [0; HASH_SIZE],
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let fields = [
            self.magic0,
            self.magic1,
            self.major_version,
            self.oldest_minor_version,
            self.pslice_size,
            self.pslice_count,
            self.partition_table_entry_count,
            self.allocation_table_entry_count,
            self.generation,
        ];
        for (i, value) in fields.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        buf[HASH_OFFSET..HEADER_SIZE].copy_from_slice(&self.hash);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!("header needs {HEADER_SIZE} bytes, got {}", buf.len()),
            }));
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&buf[HASH_OFFSET..HEADER_SIZE]);
        Ok(Header {
            magic0: read_u64(buf, 0),
            magic1: read_u64(buf, 8),
            major_version: read_u64(buf, 16),
            oldest_minor_version: read_u64(buf, 24),
            pslice_size: read_u64(buf, 32),
            pslice_count: read_u64(buf, 40),
            partition_table_entry_count: read_u64(buf, 48),
            allocation_table_entry_count: read_u64(buf, 56),
            generation: read_u64(buf, 64),
            hash,
        })
    }

    pub fn has_magic(&self) -> bool {
        self.magic0 == MAGIC0 && self.magic1 == MAGIC1
    }

    /// Checks the header fields that do not depend on the table contents and
    /// returns the layout they describe.
    pub fn validate(&self, device_size: u64) -> Result<Geometry> {
        if !self.has_magic() {
            return Err(fvm_error!(Incompatible {
                description: "magic mismatch".to_string(),
            }));
        }
        if self.major_version != MAJOR_VERSION {
            return Err(fvm_error!(Incompatible {
                description: format!("unsupported major version {}", self.major_version),
            }));
        }
        if self.oldest_minor_version > MINOR_VERSION {
            return Err(fvm_error!(Incompatible {
                description: format!(
                    "metadata requires minor version {}, this build understands {MINOR_VERSION}",
                    self.oldest_minor_version
                ),
            }));
        }
        if self.pslice_size == 0 || self.pslice_size % METADATA_BLOCK_SIZE != 0 {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!("invalid slice size {}", self.pslice_size),
            }));
        }
        if !(2..=MAX_PARTITION_TABLE_ENTRIES).contains(&self.partition_table_entry_count) {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!(
                    "invalid partition table size {}",
                    self.partition_table_entry_count
                ),
            }));
        }
        if !(1..=MAX_VSLICES).contains(&self.allocation_table_entry_count) {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!(
                    "invalid allocation table size {}",
                    self.allocation_table_entry_count
                ),
            }));
        }
        let geometry = Geometry {
            slice_size: self.pslice_size,
            partition_table_entry_count: self.partition_table_entry_count,
            allocation_table_entry_count: self.allocation_table_entry_count,
        };
        if self.pslice_count > geometry.max_pslices() {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!(
                    "{} slices exceed the allocation table capacity {}",
                    self.pslice_count,
                    geometry.max_pslices()
                ),
            }));
        }
        if geometry.data_start() > device_size {
            return Err(fvm_error!(TooSmall {
                required: geometry.data_start(),
                available: device_size,
            }));
        }
        let needed = self
            .pslice_count
            .checked_mul(self.pslice_size)
            .and_then(|bytes| bytes.checked_add(geometry.data_start()));
        match needed {
            Some(needed) if needed <= device_size => Ok(geometry),
            _ => Err(fvm_error!(Incompatible {
                description: format!(
                    "{} slices of {} bytes do not fit a {device_size}-byte device",
                    self.pslice_count, self.pslice_size
                ),
            })),
        }
    }
}

/// Sizes that determine where everything lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub slice_size: u64,
    pub partition_table_entry_count: u64,
    pub allocation_table_entry_count: u64,
}

impl Geometry {
    /// Smallest layout holding `max_partitions` partition entries (slot 0
    /// included) and `max_pslices` allocation entries. The allocation table
    /// absorbs the padding of the last metadata block.
    pub fn for_format(slice_size: u64, max_pslices: u64, max_partitions: u64) -> Self {
        let partition_bytes = max_partitions * PARTITION_ENTRY_SIZE as u64;
        let minimum = HEADER_SIZE as u64 + partition_bytes + (max_pslices + 1) * SLICE_ENTRY_SIZE as u64;
        let metadata_size = round_up(minimum, METADATA_BLOCK_SIZE);
        let allocation_bytes = metadata_size - HEADER_SIZE as u64 - partition_bytes;
        Geometry {
            slice_size,
            partition_table_entry_count: max_partitions,
            allocation_table_entry_count: (allocation_bytes / SLICE_ENTRY_SIZE as u64)
                .min(MAX_VSLICES),
        }
    }

    pub fn metadata_size(&self) -> u64 {
        round_up(
            HEADER_SIZE as u64
                + self.partition_table_entry_count * PARTITION_ENTRY_SIZE as u64
                + self.allocation_table_entry_count * SLICE_ENTRY_SIZE as u64,
            METADATA_BLOCK_SIZE,
        )
    }

    pub fn partition_table_offset(&self) -> usize {
        HEADER_SIZE
    }

    pub fn allocation_table_offset(&self) -> usize {
        HEADER_SIZE + self.partition_table_entry_count as usize * PARTITION_ENTRY_SIZE
    }

    /// First byte of physical slice 1.
    pub fn data_start(&self) -> u64 {
        2 * self.metadata_size()
    }

    /// Number of physical slices the allocation table can describe.
    pub fn max_pslices(&self) -> u64 {
        self.allocation_table_entry_count - 1
    }

    pub fn max_partitions(&self) -> u64 {
        self.partition_table_entry_count - 1
    }

    /// Byte offset of a 1-based physical slice.
    pub fn pslice_offset(&self, pslice: u64) -> u64 {
        self.data_start() + (pslice - 1) * self.slice_size
    }

    /// How many physical slices fit on a device of `device_size` bytes,
    /// ignoring the allocation table capacity.
    pub fn pslices_fitting(&self, device_size: u64) -> u64 {
        device_size.saturating_sub(self.data_start()) / self.slice_size
    }
}
