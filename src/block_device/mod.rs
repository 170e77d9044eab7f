use crate::utils::aligned_buffer::AlignedBuf;
use crate::Result;
use std::{cell::RefCell, rc::Rc};

/// Block size used when a backing file does not say otherwise.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

pub type SharedBuffer = Rc<RefCell<AlignedBuf>>;

pub fn shared_buffer(len: usize) -> SharedBuffer {
    Rc::new(RefCell::new(AlignedBuf::new(len)))
}

/// Queue of block requests against a device. Requests are identified by a
/// caller-chosen id and complete through `poll`.
pub trait IoChannel {
    fn add_read(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize);
    fn add_write(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize);
    fn add_flush(&mut self, id: usize);
    fn add_trim(&mut self, block_offset: u64, block_count: u32, id: usize);
    fn submit(&mut self) -> Result<()>;

    fn poll(&mut self) -> Vec<(usize, bool)>;
    fn busy(&self) -> bool;
}

pub trait BlockDevice: Send + Sync {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>>;
    fn block_count(&self) -> u64;
    fn block_size(&self) -> u32 {
        DEFAULT_BLOCK_SIZE
    }
    fn clone(&self) -> Box<dyn BlockDevice>;

    fn size_bytes(&self) -> u64 {
        self.block_count() * self.block_size() as u64
    }
}

impl Clone for Box<dyn BlockDevice> {
    fn clone(&self) -> Box<dyn BlockDevice> {
        self.as_ref().clone()
    }
}

mod bdev_sync;
mod bdev_uring;
mod blocking;

#[cfg(test)]
pub(crate) mod bdev_failing;
#[cfg(test)]
pub(crate) mod bdev_mem;

pub use bdev_sync::SyncBlockDevice;
pub use bdev_uring::UringBlockDevice;
pub use blocking::{flush, read_at, wait_for_completion, write_at, IO_TIMEOUT};
