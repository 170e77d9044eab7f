use super::bdev_sync::device_block_count;
use super::{BlockDevice, IoChannel, SharedBuffer, DEFAULT_BLOCK_SIZE};
use crate::{fvm_error, Result};
use io_uring::{opcode, squeue, types, IoUring};
use log::error;
use nix::errno::Errno;
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
};

struct UringIoChannel {
    file: File,
    ring: IoUring,
    block_size: u64,
    inflight: HashMap<usize, Option<SharedBuffer>>,
    finished_requests: Vec<(usize, bool)>,
}

impl UringIoChannel {
    fn new(
        path: &std::path::Path,
        block_size: u32,
        queue_size: usize,
        readonly: bool,
        direct_io: bool,
    ) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(!readonly);
        if direct_io {
            opts.custom_flags(libc::O_DIRECT);
        }
        let file = opts.open(path).map_err(|e| {
            error!("Failed to open file {}: {}", path.display(), e);
            fvm_error!(IoError { source: e })
        })?;
        let entries: u32 = queue_size.try_into().map_err(|_| {
            error!("Invalid queue size: {}", queue_size);
            fvm_error!(InvalidParameter {
                description: format!("invalid io_uring queue size {queue_size}"),
            })
        })?;
        let ring = IoUring::new(entries).map_err(|e| {
            error!("Failed to create io_uring: {}", e);
            fvm_error!(IoError { source: e })
        })?;
        Ok(UringIoChannel {
            file,
            ring,
            block_size: block_size as u64,
            inflight: HashMap::new(),
            finished_requests: Vec::new(),
        })
    }

    fn push(&mut self, entry: squeue::Entry, id: usize, buf: Option<SharedBuffer>) {
        // SAFETY: the buffer referenced by `entry` is kept alive in
        // `inflight` until its completion is reaped in `poll`.
        let pushed = unsafe { self.ring.submission().push(&entry) };
        if pushed.is_err() {
            error!("io_uring submission queue is full");
            self.finished_requests.push((id, false));
            return;
        }
        self.inflight.insert(id, buf);
    }

    fn fd(&self) -> types::Fd {
        types::Fd(self.file.as_raw_fd())
    }
}

impl IoChannel for UringIoChannel {
    fn add_read(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        let len = block_count * self.block_size as u32;
        let ptr = buf.borrow_mut().as_mut_ptr();
        let entry = opcode::Read::new(self.fd(), ptr, len)
            .offset(block_offset * self.block_size)
            .build()
            .user_data(id as u64);
        self.push(entry, id, Some(buf));
    }

    fn add_write(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        let len = block_count * self.block_size as u32;
        let ptr = buf.borrow().as_ptr();
        let entry = opcode::Write::new(self.fd(), ptr, len)
            .offset(block_offset * self.block_size)
            .build()
            .user_data(id as u64);
        self.push(entry, id, Some(buf));
    }

    fn add_flush(&mut self, id: usize) {
        let entry = opcode::Fsync::new(self.fd()).build().user_data(id as u64);
        self.push(entry, id, None);
    }

    fn add_trim(&mut self, block_offset: u64, block_count: u32, id: usize) {
        let entry = opcode::Fallocate::new(self.fd(), block_count as u64 * self.block_size)
            .offset(block_offset * self.block_size)
            .mode(libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE)
            .build()
            .user_data(id as u64);
        self.push(entry, id, None);
    }

    fn submit(&mut self) -> Result<()> {
        if let Err(e) = self.ring.submit() {
            error!("Failed to submit IO request");
            return Err(fvm_error!(IoError { source: e }));
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<(usize, bool)> {
        let mut finished_requests = std::mem::take(&mut self.finished_requests);
        let completed: Vec<(usize, i32)> = self
            .ring
            .completion()
            .map(|entry| (entry.user_data() as usize, entry.result()))
            .collect();
        for (id, result) in completed {
            self.inflight.remove(&id);
            if result < 0 {
                error!("IO request {id} failed: {}", Errno::from_i32(-result));
                finished_requests.push((id, false));
            } else {
                finished_requests.push((id, true));
            }
        }
        finished_requests
    }

    fn busy(&self) -> bool {
        !self.inflight.is_empty()
    }
}

/// File-backed device driven through an io_uring per channel.
pub struct UringBlockDevice {
    path: PathBuf,
    block_count: u64,
    queue_size: usize,
    readonly: bool,
    direct_io: bool,
}

impl BlockDevice for UringBlockDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        let channel = UringIoChannel::new(
            &self.path,
            DEFAULT_BLOCK_SIZE,
            self.queue_size,
            self.readonly,
            self.direct_io,
        )?;
        Ok(Box::new(channel))
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(UringBlockDevice {
            path: self.path.clone(),
            block_count: self.block_count,
            queue_size: self.queue_size,
            readonly: self.readonly,
            direct_io: self.direct_io,
        })
    }
}

impl UringBlockDevice {
    pub fn new(
        path: PathBuf,
        queue_size: usize,
        readonly: bool,
        direct_io: bool,
    ) -> Result<Box<Self>> {
        let block_count = device_block_count(&path, DEFAULT_BLOCK_SIZE)?;
        Ok(Box::new(UringBlockDevice {
            path,
            block_count,
            queue_size,
            readonly,
            direct_io,
        }))
    }
}
