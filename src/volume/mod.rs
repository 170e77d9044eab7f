mod registry;
mod slice_map;

pub use registry::{
    load_snapshot, BlockLayout, PartitionRecord, PartitionSnapshot, Registry, SnapshotCell,
};
pub use slice_map::{Extent, SliceMap, VsliceRange};
