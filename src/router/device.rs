use super::VPartitionIoChannel;
use crate::block_device::{BlockDevice, IoChannel};
use crate::volume::{load_snapshot, SnapshotCell};
use crate::Result;

/// Block device view of one virtual partition.
pub struct VPartitionDevice {
    base: Box<dyn BlockDevice>,
    cell: SnapshotCell,
    generation: u64,
    readonly: bool,
}

impl VPartitionDevice {
    pub fn new(base: Box<dyn BlockDevice>, cell: SnapshotCell, generation: u64) -> Self {
        VPartitionDevice {
            base,
            cell,
            generation,
            readonly: false,
        }
    }

    /// Rejects writes and trims on every channel created from here on.
    pub fn read_only(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn create_partition_channel(&self) -> Result<VPartitionIoChannel> {
        Ok(VPartitionIoChannel::new(
            self.base.create_channel()?,
            self.cell.clone(),
            self.generation,
        )
        .read_only(self.readonly))
    }
}

impl BlockDevice for VPartitionDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        Ok(Box::new(self.create_partition_channel()?))
    }

    fn block_count(&self) -> u64 {
        let snapshot = load_snapshot(&self.cell);
        if snapshot.serves(self.generation) {
            snapshot.block_count()
        } else {
            0
        }
    }

    fn block_size(&self) -> u32 {
        self.base.block_size()
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(VPartitionDevice {
            base: self.base.clone(),
            cell: self.cell.clone(),
            generation: self.generation,
            readonly: self.readonly,
        })
    }
}
