use crate::block_device::bdev_mem::MemBlockDevice;
use crate::block_device::{BlockDevice, IoChannel, SharedBuffer};
use crate::Result;
use log::error;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FailState {
    fail_next_write: bool,
    fail_next_flush: bool,
    writes_before_failure: Option<usize>,
}

impl FailState {
    fn take_write_failure(&mut self) -> bool {
        if let Some(remaining) = self.writes_before_failure.as_mut() {
            if *remaining == 0 {
                self.writes_before_failure = None;
                return true;
            }
            *remaining -= 1;
        }
        std::mem::take(&mut self.fail_next_write)
    }
}

struct FailingIoChannel {
    inner: Box<dyn IoChannel>,
    state: Arc<Mutex<FailState>>,
    pending: Vec<(usize, bool)>,
}

impl IoChannel for FailingIoChannel {
    fn add_read(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        self.inner.add_read(block_offset, block_count, buf, id);
    }

    fn add_write(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        let fail = match self.state.lock() {
            Ok(mut state) => state.take_write_failure(),
            Err(e) => {
                error!("Failed to lock state mutex: {e}");
                true
            }
        };
        if fail {
            self.pending.push((id, false));
        } else {
            self.inner.add_write(block_offset, block_count, buf, id);
        }
    }

    fn add_flush(&mut self, id: usize) {
        let fail = match self.state.lock() {
            Ok(mut state) => std::mem::take(&mut state.fail_next_flush),
            Err(e) => {
                error!("Failed to lock state mutex: {e}");
                true
            }
        };
        if fail {
            self.pending.push((id, false));
        } else {
            self.inner.add_flush(id);
        }
    }

    fn add_trim(&mut self, block_offset: u64, block_count: u32, id: usize) {
        self.inner.add_trim(block_offset, block_count, id);
    }

    fn submit(&mut self) -> Result<()> {
        self.inner.submit()
    }

    fn poll(&mut self) -> Vec<(usize, bool)> {
        let mut results = std::mem::take(&mut self.pending);
        results.extend(self.inner.poll());
        results
    }

    fn busy(&self) -> bool {
        self.inner.busy()
    }
}

/// Wraps a `MemBlockDevice` and fails selected writes or flushes.
pub struct FailingBlockDevice {
    inner: MemBlockDevice,
    state: Arc<Mutex<FailState>>,
}

impl FailingBlockDevice {
    pub fn new(inner: MemBlockDevice) -> Self {
        FailingBlockDevice {
            inner,
            state: Arc::new(Mutex::new(FailState::default())),
        }
    }

    pub fn fail_next_write(&self) {
        self.state.lock().unwrap().fail_next_write = true;
    }

    pub fn fail_next_flush(&self) {
        self.state.lock().unwrap().fail_next_flush = true;
    }

    /// Lets `count` writes through, then fails the one after.
    pub fn fail_write_after(&self, count: usize) {
        self.state.lock().unwrap().writes_before_failure = Some(count);
    }

    pub fn mem(&self) -> &MemBlockDevice {
        &self.inner
    }
}

impl BlockDevice for FailingBlockDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        Ok(Box::new(FailingIoChannel {
            inner: self.inner.create_channel()?,
            state: self.state.clone(),
            pending: Vec::new(),
        }))
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(FailingBlockDevice {
            inner: MemBlockDevice::clone_shared(&self.inner),
            state: self.state.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::shared_buffer;

    #[test]
    fn test_fail_next_write_then_recover() {
        let device = FailingBlockDevice::new(MemBlockDevice::new(4096));
        let mut channel = device.create_channel().unwrap();
        device.fail_next_write();
        channel.add_write(0, 1, shared_buffer(512), 1);
        channel.add_write(0, 1, shared_buffer(512), 2);
        assert_eq!(channel.poll(), vec![(1, false), (2, true)]);
    }

    #[test]
    fn test_fail_write_after_count() {
        let device = FailingBlockDevice::new(MemBlockDevice::new(4096));
        let mut channel = device.create_channel().unwrap();
        device.fail_write_after(1);
        channel.add_write(0, 1, shared_buffer(512), 1);
        channel.add_write(1, 1, shared_buffer(512), 2);
        channel.add_write(2, 1, shared_buffer(512), 3);
        assert_eq!(channel.poll(), vec![(2, false), (1, true), (3, true)]);
        assert_eq!(device.mem().metrics().writes, 2);
    }

    #[test]
    fn test_fail_next_flush() {
        let device = FailingBlockDevice::new(MemBlockDevice::new(4096));
        let mut channel = device.create_channel().unwrap();
        device.fail_next_flush();
        channel.add_flush(1);
        channel.add_flush(2);
        assert_eq!(channel.poll(), vec![(1, false), (2, true)]);
    }
}
