use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};

use super::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMetrics {
    pub reads: usize,
    pub writes: usize,
    pub flushes: usize,
    pub trims: usize,
}

/// In-memory device. Clones share the same backing bytes, so a clone taken
/// before the volume manager is dropped can be used to bind it again.
pub struct MemBlockDevice {
    block_size: u32,
    mem: Arc<RwLock<Vec<u8>>>,
    metrics: Arc<Mutex<DeviceMetrics>>,
    fail_next: Arc<AtomicBool>,
}

struct MemIoChannel {
    block_size: u32,
    mem: Arc<RwLock<Vec<u8>>>,
    metrics: Arc<Mutex<DeviceMetrics>>,
    fail_next: Arc<AtomicBool>,
    finished_requests: Vec<(usize, bool)>,
}

impl MemIoChannel {
    fn range(&self, block_offset: u64, block_count: u32) -> Option<std::ops::Range<usize>> {
        let start = block_offset as usize * self.block_size as usize;
        let end = start + block_count as usize * self.block_size as usize;
        let len = self.mem.read().unwrap().len();
        (end <= len).then_some(start..end)
    }

    fn injected_failure(&mut self, id: usize) -> bool {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            self.finished_requests.push((id, false));
            return true;
        }
        false
    }
}

impl IoChannel for MemIoChannel {
    fn add_read(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        if self.injected_failure(id) {
            return;
        }
        let Some(range) = self.range(block_offset, block_count) else {
            self.finished_requests.push((id, false));
            return;
        };
        let len = range.len();
        buf.borrow_mut().as_mut_slice()[..len].copy_from_slice(&self.mem.read().unwrap()[range]);
        self.metrics.lock().unwrap().reads += 1;
        self.finished_requests.push((id, true));
    }

    fn add_write(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        if self.injected_failure(id) {
            return;
        }
        let Some(range) = self.range(block_offset, block_count) else {
            self.finished_requests.push((id, false));
            return;
        };
        let len = range.len();
        self.mem.write().unwrap()[range].copy_from_slice(&buf.borrow().as_slice()[..len]);
        self.metrics.lock().unwrap().writes += 1;
        self.finished_requests.push((id, true));
    }

    fn add_flush(&mut self, id: usize) {
        if self.injected_failure(id) {
            return;
        }
        self.metrics.lock().unwrap().flushes += 1;
        self.finished_requests.push((id, true));
    }

    fn add_trim(&mut self, block_offset: u64, block_count: u32, id: usize) {
        if self.injected_failure(id) {
            return;
        }
        let Some(range) = self.range(block_offset, block_count) else {
            self.finished_requests.push((id, false));
            return;
        };
        self.mem.write().unwrap()[range].fill(0);
        self.metrics.lock().unwrap().trims += 1;
        self.finished_requests.push((id, true));
    }

    fn submit(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll(&mut self) -> Vec<(usize, bool)> {
        std::mem::take(&mut self.finished_requests)
    }

    fn busy(&self) -> bool {
        false
    }
}

impl MemBlockDevice {
    pub fn new(size: u64) -> Self {
        Self::new_with_block_size(size, DEFAULT_BLOCK_SIZE)
    }

    pub fn new_with_block_size(size: u64, block_size: u32) -> Self {
        assert!(
            size.is_multiple_of(block_size as u64),
            "Size must be a multiple of the block size"
        );
        MemBlockDevice {
            block_size,
            mem: Arc::new(RwLock::new(vec![0u8; size as usize])),
            metrics: Arc::new(Mutex::new(DeviceMetrics::default())),
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes the next request on any channel of this device fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> DeviceMetrics {
        *self.metrics.lock().unwrap()
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        self.mem.read().unwrap()[start..start + len].to_vec()
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.mem.write().unwrap()[start..start + data.len()].copy_from_slice(data);
    }

    /// Flips every bit of the byte at `offset`.
    pub fn corrupt_byte(&self, offset: u64) {
        self.mem.write().unwrap()[offset as usize] ^= 0xff;
    }

    /// Extends the device with zeroed bytes.
    pub fn grow(&self, new_size: u64) {
        let mut mem = self.mem.write().unwrap();
        assert!(new_size as usize >= mem.len());
        mem.resize(new_size as usize, 0);
    }

    /// Another handle onto the same backing bytes.
    pub fn clone_shared(&self) -> MemBlockDevice {
        MemBlockDevice {
            block_size: self.block_size,
            mem: self.mem.clone(),
            metrics: self.metrics.clone(),
            fail_next: self.fail_next.clone(),
        }
    }

    pub fn boxed(&self) -> Box<dyn BlockDevice> {
        Box::new(self.clone_shared())
    }
}

impl BlockDevice for MemBlockDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        Ok(Box::new(MemIoChannel {
            block_size: self.block_size,
            mem: self.mem.clone(),
            metrics: self.metrics.clone(),
            fail_next: self.fail_next.clone(),
            finished_requests: Vec::new(),
        }))
    }

    fn block_count(&self) -> u64 {
        self.mem.read().unwrap().len() as u64 / self.block_size as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        self.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_flush_metrics() {
        let device = MemBlockDevice::new(2 * 512);
        let mut channel = device.create_channel().unwrap();

        let write_buf = shared_buffer(512);
        write_buf.borrow_mut().as_mut_slice().fill(0x55);
        channel.add_write(1, 1, write_buf, 1);
        channel.add_flush(2);
        channel.submit().unwrap();
        assert_eq!(channel.poll(), vec![(1, true), (2, true)]);

        let read_buf = shared_buffer(512);
        channel.add_read(1, 1, read_buf.clone(), 3);
        assert_eq!(channel.poll(), vec![(3, true)]);
        assert!(read_buf.borrow().as_slice().iter().all(|&b| b == 0x55));
        assert_eq!(
            device.metrics(),
            DeviceMetrics {
                reads: 1,
                writes: 1,
                flushes: 1,
                trims: 0
            }
        );
    }

    #[test]
    fn test_out_of_bounds_and_trim() {
        let device = MemBlockDevice::new(1024);
        let mut channel = device.create_channel().unwrap();
        let buf = shared_buffer(512);
        channel.add_read(2, 1, buf.clone(), 1);
        channel.add_write(2, 1, buf, 2);
        assert_eq!(channel.poll(), vec![(1, false), (2, false)]);

        device.write_bytes(0, &[7u8; 512]);
        channel.add_trim(0, 1, 3);
        assert_eq!(channel.poll(), vec![(3, true)]);
        assert_eq!(device.read_bytes(0, 4), vec![0u8; 4]);
    }

    #[test]
    fn test_clones_share_storage_and_growth() {
        let device = MemBlockDevice::new_with_block_size(4096, 4096);
        let clone = device.boxed();
        device.grow(8192);
        assert_eq!(clone.block_count(), 2);
        assert_eq!(clone.block_size(), 4096);
        assert_eq!(clone.size_bytes(), 8192);

        device.corrupt_byte(10);
        assert_eq!(device.read_bytes(10, 1), vec![0xff]);
    }
}
