use std::sync::Arc;

use super::{BlockInfo, PartitionInfo, VolumeInfo, VolumeManager};
use crate::block_device::{shared_buffer, BlockDevice, IoChannel};
use crate::router::{VPartitionDevice, VPartitionIoChannel};
use crate::volume::{SnapshotCell, VsliceRange};
use crate::{fvm_error, Result};

const REQUEST_ID: usize = 0;

/// Handle onto one virtual partition. The handle names its partition slot
/// and the slot generation it was created for; once the partition is
/// destroyed or the volume unbound, every call fails with `BadState`.
pub struct VPartition {
    manager: Arc<VolumeManager>,
    index: u16,
    generation: u64,
    device: VPartitionDevice,
}

impl VPartition {
    pub(super) fn new(
        manager: Arc<VolumeManager>,
        index: u16,
        generation: u64,
        cell: SnapshotCell,
    ) -> Self {
        let device = VPartitionDevice::new(manager.base_device(), cell, generation)
            .read_only(manager.is_readonly());
        VPartition {
            manager,
            index,
            generation,
            device,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn extend(&self, vslice_start: u64, count: u64) -> Result<()> {
        self.manager
            .extend(self.index, self.generation, vslice_start, count)
    }

    pub fn shrink(&self, vslice_start: u64, count: u64) -> Result<()> {
        self.manager
            .shrink(self.index, self.generation, vslice_start, count)
    }

    pub fn destroy(&self) -> Result<()> {
        self.manager.destroy(self.index, self.generation)
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.info()?.name)
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.manager.set_name(self.index, self.generation, name)
    }

    /// Caps the partition at `bytes`, rounded up to whole slices; 0 removes
    /// the cap. The partition entry has no field for it, so the limit lives
    /// in memory only and does not survive a rebind.
    pub fn set_byte_limit(&self, bytes: u64) -> Result<()> {
        self.manager
            .set_byte_limit(self.index, self.generation, bytes)
    }

    pub fn query_slices(&self, vslice_starts: &[u64]) -> Result<Vec<VsliceRange>> {
        self.manager
            .query_slices(self.index, self.generation, vslice_starts)
    }

    pub fn info(&self) -> Result<PartitionInfo> {
        self.manager.partition_info(self.index, self.generation)
    }

    pub fn volume_info(&self) -> Result<VolumeInfo> {
        self.manager.volume_info(self.index, self.generation)
    }

    pub fn block_info(&self) -> Result<BlockInfo> {
        self.manager.partition_info(self.index, self.generation)?;
        Ok(BlockInfo {
            block_size: self.device.block_size(),
            block_count: self.device.block_count(),
        })
    }

    /// Block device view for callers that drive their own channels.
    pub fn device(&self) -> &VPartitionDevice {
        &self.device
    }

    pub fn channel(&self) -> Result<VPartitionIoChannel> {
        self.device.create_partition_channel()
    }

    fn blocks_in(&self, len: usize) -> Result<u32> {
        let block_size = self.device.block_size() as usize;
        if len == 0 || len % block_size != 0 {
            return Err(fvm_error!(InvalidParameter {
                description: format!("{len} bytes is not a whole number of {block_size}-byte blocks"),
            }));
        }
        u32::try_from(len / block_size).map_err(|_| {
            fvm_error!(InvalidParameter {
                description: format!("request of {len} bytes is too large"),
            })
        })
    }

    pub fn read_blocks(&self, block_offset: u64, buf: &mut [u8]) -> Result<()> {
        let count = self.blocks_in(buf.len())?;
        let mut channel = self.channel()?;
        let shared = shared_buffer(buf.len());
        channel.add_read(block_offset, count, shared.clone(), REQUEST_ID);
        channel.submit()?;
        channel.wait(REQUEST_ID)?;
        buf.copy_from_slice(shared.borrow().as_slice());
        Ok(())
    }

    pub fn write_blocks(&self, block_offset: u64, data: &[u8]) -> Result<()> {
        let count = self.blocks_in(data.len())?;
        let mut channel = self.channel()?;
        let shared = shared_buffer(data.len());
        shared.borrow_mut().as_mut_slice().copy_from_slice(data);
        channel.add_write(block_offset, count, shared, REQUEST_ID);
        channel.submit()?;
        channel.wait(REQUEST_ID)
    }

    pub fn trim_blocks(&self, block_offset: u64, block_count: u32) -> Result<()> {
        let mut channel = self.channel()?;
        channel.add_trim(block_offset, block_count, REQUEST_ID);
        channel.submit()?;
        channel.wait(REQUEST_ID)
    }

    pub fn flush(&self) -> Result<()> {
        let mut channel = self.channel()?;
        channel.add_flush(REQUEST_ID);
        channel.submit()?;
        channel.wait(REQUEST_ID)
    }
}
