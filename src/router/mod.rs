//! Virtual partition I/O: maps partition-relative block requests onto the
//! physical slices that back them.

mod channel;
mod device;

pub use channel::VPartitionIoChannel;
pub use device::VPartitionDevice;

use crate::format::MAX_VSLICES;
use crate::volume::PartitionSnapshot;
use crate::{fvm_error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Trim,
}

/// One device request produced from a partition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub device_block: u64,
    pub block_count: u32,
    /// Byte offset of this piece within the caller's buffer.
    pub buf_offset: usize,
}

/// Splits `[block_offset, block_offset + block_count)` at slice boundaries
/// and translates each piece. Reads of unmapped slices fail with
/// `NotAllocated`; writes and trims with `OutOfRange`.
pub fn plan(
    snapshot: &PartitionSnapshot,
    kind: IoKind,
    block_offset: u64,
    block_count: u32,
) -> Result<Vec<Segment>> {
    if block_count == 0 {
        return Err(fvm_error!(InvalidParameter {
            description: "request covers no blocks".to_string(),
        }));
    }
    let layout = snapshot.layout;
    let blocks_per_slice = layout.blocks_per_slice;
    let end = block_offset
        .checked_add(block_count as u64)
        .filter(|end| (end - 1) / blocks_per_slice < MAX_VSLICES)
        .ok_or_else(|| {
            fvm_error!(OutOfRange {
                description: format!(
                    "blocks {block_offset}..+{block_count} exceed the virtual address space"
                ),
            })
        })?;

    let mut segments = Vec::new();
    let mut block = block_offset;
    while block < end {
        let vslice = block / blocks_per_slice;
        let in_slice = block % blocks_per_slice;
        let count = (end - block).min(blocks_per_slice - in_slice);
        let pslice = snapshot.map.lookup(vslice).ok_or_else(|| match kind {
            IoKind::Read => fvm_error!(NotAllocated { vslice }),
            IoKind::Write | IoKind::Trim => fvm_error!(OutOfRange {
                description: format!("vslice {vslice} is not allocated"),
            }),
        })?;
        segments.push(Segment {
            device_block: layout.physical_block(pslice, in_slice),
            block_count: count as u32,
            buf_offset: ((block - block_offset) * layout.block_size as u64) as usize,
        });
        block += count;
    }
    Ok(segments)
}
