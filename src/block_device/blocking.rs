use std::time::Duration;

use super::*;
use crate::fvm_error;

/// Upper bound for a synchronous request issued by the metadata path.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

const READ_ID: usize = 0;
const WRITE_ID: usize = 1;
const FLUSH_ID: usize = 2;

pub fn wait_for_completion(
    channel: &mut dyn IoChannel,
    request_id: usize,
    timeout: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        for (id, success) in channel.poll() {
            if id != request_id {
                continue;
            }
            if !success {
                return Err(fvm_error!(IoError {
                    source: std::io::Error::other(format!("Failed request ID: {request_id}")),
                }));
            }
            return Ok(());
        }
        if !channel.busy() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    Err(fvm_error!(IoError {
        source: std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("Timeout while waiting for request ID {request_id}"),
        ),
    }))
}

fn block_span(block_size: u32, byte_offset: u64, len: usize) -> Result<(u64, u32)> {
    let block_size = block_size as u64;
    if byte_offset % block_size != 0 || len as u64 % block_size != 0 {
        return Err(fvm_error!(InvalidParameter {
            description: format!(
                "request at byte {byte_offset} of {len} bytes is not aligned to {block_size}-byte blocks"
            ),
        }));
    }
    let count = u32::try_from(len as u64 / block_size).map_err(|_| {
        fvm_error!(InvalidParameter {
            description: format!("request of {len} bytes is too large"),
        })
    })?;
    Ok((byte_offset / block_size, count))
}

/// Reads `len` bytes starting at `byte_offset` and waits for the result.
pub fn read_at(
    channel: &mut dyn IoChannel,
    block_size: u32,
    byte_offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let (block, count) = block_span(block_size, byte_offset, len)?;
    let buf = shared_buffer(len);
    channel.add_read(block, count, buf.clone(), READ_ID);
    channel.submit()?;
    wait_for_completion(channel, READ_ID, IO_TIMEOUT)?;
    let data = buf.borrow().as_slice().to_vec();
    Ok(data)
}

/// Writes `data` at `byte_offset` and waits for the result. Does not flush.
pub fn write_at(
    channel: &mut dyn IoChannel,
    block_size: u32,
    byte_offset: u64,
    data: &[u8],
) -> Result<()> {
    let (block, count) = block_span(block_size, byte_offset, data.len())?;
    let buf = shared_buffer(data.len());
    buf.borrow_mut().as_mut_slice().copy_from_slice(data);
    channel.add_write(block, count, buf, WRITE_ID);
    channel.submit()?;
    wait_for_completion(channel, WRITE_ID, IO_TIMEOUT)
}

pub fn flush(channel: &mut dyn IoChannel) -> Result<()> {
    channel.add_flush(FLUSH_ID);
    channel.submit()?;
    wait_for_completion(channel, FLUSH_ID, IO_TIMEOUT)
}
