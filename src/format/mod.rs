//! On-disk layout of the volume manager.
//!
//! A formatted device holds two copies of the metadata followed by the
//! physical slice area:
//!
//! ```text
//! +----------------+----------------+-------------+-------------+-----
//! | primary copy   | secondary copy | pslice 1    | pslice 2    | ...
//! +----------------+----------------+-------------+-------------+-----
//! 0                M                2M            2M + S
//! ```
//!
//! Each copy is `M` bytes: a header, the partition table, the allocation
//! table, and zero padding up to a multiple of [`METADATA_BLOCK_SIZE`]. All
//! integers are little-endian. Entry 0 of both tables is never used.

mod guid;
mod header;
mod partition;
mod slice_entry;

pub use guid::Guid;
pub use header::{
    Geometry, Header, HASH_OFFSET, HASH_SIZE, HEADER_SIZE, MAGIC0, MAGIC1, MAX_METADATA_SIZE,
};
pub use partition::{
    validate_name, PartitionEntry, FLAG_INACTIVE, MAX_NAME_LEN, NAME_LEN, PARTITION_ENTRY_SIZE,
};
pub use slice_entry::{SliceEntry, SLICE_ENTRY_SIZE};

pub const MAJOR_VERSION: u64 = 1;
/// Layout revision written by this implementation. Images stamped with a
/// newer revision are refused.
pub const MINOR_VERSION: u64 = 1;

pub const METADATA_BLOCK_SIZE: u64 = 8192;
pub const DEFAULT_MAX_PARTITIONS: u64 = 1024;
pub const DEFAULT_SLICE_SIZE: u64 = 1 << 20;

/// Exclusive upper bound on virtual slice numbers.
pub const MAX_VSLICES: u64 = 1 << 32;
