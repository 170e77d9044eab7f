use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{error, warn};

use super::{plan, IoKind};
use crate::block_device::{shared_buffer, IoChannel, SharedBuffer, IO_TIMEOUT};
use crate::volume::{load_snapshot, SnapshotCell};
use crate::{fvm_error, Result, UbifvmError};

/// A caller request that may have been split across several slices.
struct Request {
    user_id: usize,
    remaining: usize,
    ok: bool,
    /// Caller buffer for reads that went through bounce buffers.
    buf: Option<SharedBuffer>,
}

struct SubRequest {
    parent: usize,
    /// Bounce buffer to copy into the caller buffer at the given offset.
    copy_back: Option<(SharedBuffer, usize)>,
}

/// Channel over one virtual partition. Each request is translated against
/// the partition snapshot current at submission time and fanned out to the
/// underlying device; the caller sees a single completion once every piece
/// has finished.
pub struct VPartitionIoChannel {
    base: Box<dyn IoChannel>,
    cell: SnapshotCell,
    generation: u64,
    readonly: bool,
    next_id: usize,
    requests: HashMap<usize, Request>,
    subs: HashMap<usize, SubRequest>,
    finished: Vec<(usize, bool)>,
    /// Completions collected by `wait` on behalf of other request ids.
    unclaimed: HashMap<usize, bool>,
    failures: HashMap<usize, UbifvmError>,
}

impl VPartitionIoChannel {
    pub(super) fn new(base: Box<dyn IoChannel>, cell: SnapshotCell, generation: u64) -> Self {
        VPartitionIoChannel {
            base,
            cell,
            generation,
            readonly: false,
            next_id: 0,
            requests: HashMap::new(),
            subs: HashMap::new(),
            finished: Vec::new(),
            unclaimed: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    pub(super) fn read_only(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    fn alloc_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn fail(&mut self, user_id: usize, error: UbifvmError) {
        self.failures.insert(user_id, error);
        self.finished.push((user_id, false));
    }

    /// The error behind a failed completion, if one was recorded.
    pub fn take_failure(&mut self, user_id: usize) -> Option<UbifvmError> {
        self.failures.remove(&user_id)
    }

    /// Waits for `user_id` and converts a failed completion into its error.
    /// Completions of other requests seen meanwhile are kept for later
    /// `wait` or `poll` calls.
    pub fn wait(&mut self, user_id: usize) -> Result<()> {
        let start = Instant::now();
        loop {
            if let Some(ok) = self.unclaimed.remove(&user_id) {
                if ok {
                    return Ok(());
                }
                return Err(self.take_failure(user_id).unwrap_or_else(|| {
                    fvm_error!(IoError {
                        source: std::io::Error::other(format!("Failed request ID: {user_id}")),
                    })
                }));
            }
            if start.elapsed() >= IO_TIMEOUT {
                return Err(fvm_error!(IoError {
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Timeout while waiting for request ID {user_id}"),
                    ),
                }));
            }
            self.drain_base();
            for (id, ok) in std::mem::take(&mut self.finished) {
                self.unclaimed.insert(id, ok);
            }
            if !self.unclaimed.contains_key(&user_id) && !self.base.busy() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn drain_base(&mut self) {
        for (sub, ok) in self.base.poll() {
            self.complete(sub, ok);
        }
    }

    fn start(
        &mut self,
        kind: IoKind,
        block_offset: u64,
        block_count: u32,
        buf: Option<SharedBuffer>,
        user_id: usize,
    ) {
        let snapshot = load_snapshot(&self.cell);
        if !snapshot.serves(self.generation) {
            self.fail(
                user_id,
                fvm_error!(BadState {
                    description: "partition is not available for I/O".to_string(),
                }),
            );
            return;
        }
        if self.readonly && kind != IoKind::Read {
            self.fail(
                user_id,
                fvm_error!(AccessDenied {
                    description: "volume is read-only".to_string(),
                }),
            );
            return;
        }
        let block_size = snapshot.layout.block_size as usize;
        if let Some(buf) = &buf {
            let needed = block_count as usize * block_size;
            if buf.borrow().len() < needed {
                self.fail(
                    user_id,
                    fvm_error!(InvalidParameter {
                        description: format!(
                            "buffer of {} bytes is smaller than the {needed}-byte request",
                            buf.borrow().len()
                        ),
                    }),
                );
                return;
            }
        }
        let segments = match plan(&snapshot, kind, block_offset, block_count) {
            Ok(segments) => segments,
            Err(e) => {
                self.fail(user_id, e);
                return;
            }
        };

        let parent = self.alloc_id();
        let split = segments.len() > 1;
        self.requests.insert(
            parent,
            Request {
                user_id,
                remaining: segments.len(),
                ok: true,
                buf: if kind == IoKind::Read && split {
                    buf.clone()
                } else {
                    None
                },
            },
        );

        for segment in segments {
            let sub = self.alloc_id();
            let len = segment.block_count as usize * block_size;
            let mut copy_back = None;
            match (kind, &buf) {
                (IoKind::Read, Some(buf)) => {
                    let target = if split {
                        let bounce = shared_buffer(len);
                        copy_back = Some((bounce.clone(), segment.buf_offset));
                        bounce
                    } else {
                        buf.clone()
                    };
                    self.base
                        .add_read(segment.device_block, segment.block_count, target, sub);
                }
                (IoKind::Write, Some(buf)) => {
                    let source = if split {
                        let bounce = shared_buffer(len);
                        bounce.borrow_mut().as_mut_slice().copy_from_slice(
                            &buf.borrow().as_slice()[segment.buf_offset..segment.buf_offset + len],
                        );
                        bounce
                    } else {
                        buf.clone()
                    };
                    self.base
                        .add_write(segment.device_block, segment.block_count, source, sub);
                }
                _ => self
                    .base
                    .add_trim(segment.device_block, segment.block_count, sub),
            }
            self.subs.insert(sub, SubRequest { parent, copy_back });
        }
    }

    fn complete(&mut self, sub: usize, ok: bool) {
        let Some(sub_request) = self.subs.remove(&sub) else {
            warn!("Completion for unknown request {sub}");
            return;
        };
        let Some(request) = self.requests.get_mut(&sub_request.parent) else {
            return;
        };
        if !ok {
            request.ok = false;
        } else if let (Some((bounce, offset)), Some(buf)) = (&sub_request.copy_back, &request.buf) {
            let bounce = bounce.borrow();
            let len = bounce.len();
            buf.borrow_mut().as_mut_slice()[*offset..*offset + len]
                .copy_from_slice(bounce.as_slice());
        }
        request.remaining -= 1;
        if request.remaining > 0 {
            return;
        }
        if let Some(request) = self.requests.remove(&sub_request.parent) {
            if !request.ok {
                error!("Partition request {} failed on the device", request.user_id);
                self.failures.insert(
                    request.user_id,
                    fvm_error!(IoError {
                        source: std::io::Error::other(format!(
                            "device request failed for partition request {}",
                            request.user_id
                        )),
                    }),
                );
            }
            self.finished.push((request.user_id, request.ok));
        }
    }
}

impl IoChannel for VPartitionIoChannel {
    fn add_read(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        self.start(IoKind::Read, block_offset, block_count, Some(buf), id);
    }

    fn add_write(&mut self, block_offset: u64, block_count: u32, buf: SharedBuffer, id: usize) {
        self.start(IoKind::Write, block_offset, block_count, Some(buf), id);
    }

    fn add_flush(&mut self, id: usize) {
        if !load_snapshot(&self.cell).serves(self.generation) {
            self.fail(
                id,
                fvm_error!(BadState {
                    description: "partition is not available for I/O".to_string(),
                }),
            );
            return;
        }
        let parent = self.alloc_id();
        let sub = self.alloc_id();
        self.requests.insert(
            parent,
            Request {
                user_id: id,
                remaining: 1,
                ok: true,
                buf: None,
            },
        );
        self.subs.insert(
            sub,
            SubRequest {
                parent,
                copy_back: None,
            },
        );
        self.base.add_flush(sub);
    }

    fn add_trim(&mut self, block_offset: u64, block_count: u32, id: usize) {
        self.start(IoKind::Trim, block_offset, block_count, None, id);
    }

    fn submit(&mut self) -> Result<()> {
        self.base.submit()
    }

    fn poll(&mut self) -> Vec<(usize, bool)> {
        self.drain_base();
        let mut completed: Vec<(usize, bool)> = self.unclaimed.drain().collect();
        completed.append(&mut self.finished);
        completed
    }

    fn busy(&self) -> bool {
        !self.finished.is_empty()
            || !self.unclaimed.is_empty()
            || !self.requests.is_empty()
            || self.base.busy()
    }
}
