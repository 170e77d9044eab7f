use super::{BlockDevice, IoChannel, SharedBuffer, DEFAULT_BLOCK_SIZE};
use crate::{fvm_error, Result};
use log::error;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

struct SyncIoChannel {
    file: File,
    block_size: u64,
    finished_requests: Vec<(usize, bool)>,
}

impl SyncIoChannel {
    fn new(path: &Path, block_size: u32, readonly: bool, direct_io: bool, sync: bool) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(!readonly);

        let mut flags = 0;
        if direct_io {
            flags |= libc::O_DIRECT;
        }
        if sync {
            flags |= libc::O_SYNC;
        }
        if flags != 0 {
            opts.custom_flags(flags);
        }

        let file = opts.open(path).map_err(|e| {
            error!("Failed to open file {}: {}", path.display(), e);
            fvm_error!(IoError { source: e })
        })?;
        Ok(SyncIoChannel {
            file,
            block_size: block_size as u64,
            finished_requests: Vec::new(),
        })
    }

    fn punch_hole(&self, offset: u64, len: u64) -> std::io::Result<()> {
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

impl IoChannel for SyncIoChannel {
    fn add_read(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        let mut buf = buf.borrow_mut();
        let len = block_count as usize * self.block_size as usize;
        let offset = block_offset * self.block_size;

        if let Err(e) = self
            .file
            .read_exact_at(&mut buf.as_mut_slice()[..len], offset)
        {
            error!("Error reading from block {block_offset}: {e}");
            self.finished_requests.push((id, false));
            return;
        }
        self.finished_requests.push((id, true));
    }

    fn add_write(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        let buf = buf.borrow();
        let len = block_count as usize * self.block_size as usize;
        let offset = block_offset * self.block_size;

        if let Err(e) = self.file.write_all_at(&buf.as_slice()[..len], offset) {
            error!("Error writing to block {block_offset}: {e}");
            self.finished_requests.push((id, false));
            return;
        }
        self.finished_requests.push((id, true));
    }

    fn add_flush(&mut self, id: usize) {
        if let Err(e) = self.file.sync_all() {
            error!("Error syncing file: {e}");
            self.finished_requests.push((id, false));
            return;
        }
        self.finished_requests.push((id, true));
    }

    fn add_trim(&mut self, block_offset: u64, block_count: u32, id: usize) {
        let offset = block_offset * self.block_size;
        let len = block_count as u64 * self.block_size;
        if let Err(e) = self.punch_hole(offset, len) {
            error!("Error trimming {block_count} blocks at {block_offset}: {e}");
            self.finished_requests.push((id, false));
            return;
        }
        self.finished_requests.push((id, true));
    }

    fn submit(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll(&mut self) -> Vec<(usize, bool)> {
        std::mem::take(&mut self.finished_requests)
    }

    fn busy(&self) -> bool {
        !self.finished_requests.is_empty()
    }
}

/// File or block special device accessed with positional reads and writes.
pub struct SyncBlockDevice {
    path: PathBuf,
    block_count: u64,
    block_size: u32,
    readonly: bool,
    direct_io: bool,
    sync: bool,
}

impl BlockDevice for SyncBlockDevice {
    fn create_channel(&self) -> Result<Box<dyn IoChannel>> {
        let channel = SyncIoChannel::new(
            &self.path,
            self.block_size,
            self.readonly,
            self.direct_io,
            self.sync,
        )?;
        Ok(Box::new(channel))
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn clone(&self) -> Box<dyn BlockDevice> {
        Box::new(SyncBlockDevice {
            path: self.path.clone(),
            block_count: self.block_count,
            block_size: self.block_size,
            readonly: self.readonly,
            direct_io: self.direct_io,
            sync: self.sync,
        })
    }
}

impl SyncBlockDevice {
    pub fn new(path: PathBuf, readonly: bool, direct_io: bool, sync: bool) -> Result<Box<Self>> {
        let block_count = device_block_count(&path, DEFAULT_BLOCK_SIZE)?;
        Ok(Box::new(SyncBlockDevice {
            path,
            block_count,
            block_size: DEFAULT_BLOCK_SIZE,
            readonly,
            direct_io,
            sync,
        }))
    }
}

/// Size of the file at `path` in `block_size` units. Regular files report
/// their length; block special files are sized by seeking to the end.
pub(super) fn device_block_count(path: &Path, block_size: u32) -> Result<u64> {
    let size = match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        Ok(_) => {
            use std::io::{Seek, SeekFrom};
            let mut file = File::open(path).map_err(|e| fvm_error!(IoError { source: e }))?;
            file.seek(SeekFrom::End(0))
                .map_err(|e| fvm_error!(IoError { source: e }))?
        }
        Err(e) => {
            error!("Failed to get metadata for {}: {}", path.display(), e);
            return Err(fvm_error!(IoError { source: e }));
        }
    };
    if size % block_size as u64 != 0 {
        error!(
            "File {} size is not a multiple of the {block_size}-byte block size",
            path.display()
        );
        return Err(fvm_error!(InvalidParameter {
            description: format!("file size {size} is not a multiple of {block_size}"),
        }));
    }
    Ok(size / block_size as u64)
}
