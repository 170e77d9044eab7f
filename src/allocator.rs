//! Physical slice accounting.
//!
//! The allocator keeps committed counters only. Reservations and releases
//! are applied to the staging metadata inside a commit; the counters are
//! adjusted by the caller once the commit has been flushed.

use crate::format::{SliceEntry, MAX_VSLICES};
use crate::metadata::Metadata;
use crate::volume::{SliceMap, VsliceRange};
use crate::{fvm_error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAllocator {
    pslice_count: u64,
    assigned: u64,
}

pub(crate) fn check_range(vslice_start: u64, count: u64) -> Result<u64> {
    match vslice_start.checked_add(count) {
        Some(end) if end <= MAX_VSLICES => Ok(end),
        _ => Err(fvm_error!(OutOfRange {
            description: format!(
                "vslices {vslice_start}..+{count} exceed the virtual address space"
            ),
        })),
    }
}

impl SliceAllocator {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        SliceAllocator {
            pslice_count: metadata.pslice_count(),
            assigned: metadata.allocated_slices().count() as u64,
        }
    }

    pub fn pslice_count(&self) -> u64 {
        self.pslice_count
    }

    pub fn assigned_count(&self) -> u64 {
        self.assigned
    }

    pub fn free_count(&self) -> u64 {
        self.pslice_count - self.assigned
    }

    /// Assigns `count` free physical slices, lowest first, to vslices
    /// `[vslice_start, vslice_start + count)` of partition `index`. Either
    /// every slice is assigned or the metadata is left as it was.
    pub fn reserve(
        &self,
        metadata: &mut Metadata,
        map: &SliceMap,
        index: u16,
        vslice_start: u64,
        count: u64,
    ) -> Result<Vec<(u64, u64)>> {
        check_range(vslice_start, count)?;
        if let Some(vslice) = map.first_mapped_in(vslice_start, count) {
            return Err(fvm_error!(SliceOverlap { vslice }));
        }
        if count > self.free_count() {
            return Err(fvm_error!(NoSpace {
                description: format!(
                    "{count} slices requested, {} free",
                    self.free_count()
                ),
            }));
        }
        let slice_count = metadata.partition(index).slice_count as u64 + count;
        let slice_count = u32::try_from(slice_count).map_err(|_| {
            fvm_error!(NoSpace {
                description: format!("partition {index} cannot hold {slice_count} slices"),
            })
        })?;

        let free: Vec<u64> = (1..=metadata.pslice_count())
            .filter(|&pslice| metadata.slice_entry(pslice).is_free())
            .take(count as usize)
            .collect();
        if (free.len() as u64) < count {
            return Err(fvm_error!(NoSpace {
                description: format!("{count} slices requested, {} free", free.len()),
            }));
        }

        let pairs: Vec<(u64, u64)> = (vslice_start..).zip(free).collect();
        for &(vslice, pslice) in &pairs {
            metadata.set_slice_entry(pslice, SliceEntry::new(index, vslice));
        }
        metadata.partition_mut(index).slice_count = slice_count;
        Ok(pairs)
    }

    /// Frees whatever is mapped in `[vslice_start, vslice_start + count)`;
    /// unmapped vslices are skipped.
    pub fn release(
        &self,
        metadata: &mut Metadata,
        map: &SliceMap,
        index: u16,
        vslice_start: u64,
        count: u64,
    ) -> Result<Vec<(u64, u64)>> {
        check_range(vslice_start, count)?;
        let pairs = map.mapped_in(vslice_start, count);
        for &(_, pslice) in &pairs {
            metadata.set_slice_entry(pslice, SliceEntry::FREE);
        }
        metadata.partition_mut(index).slice_count -= pairs.len() as u32;
        Ok(pairs)
    }

    /// Frees every slice owned by partition `index`, returning how many.
    pub fn release_all(metadata: &mut Metadata, index: u16) -> u64 {
        let owned: Vec<u64> = metadata
            .allocated_slices()
            .filter(|(_, entry)| entry.partition_index() == index)
            .map(|(pslice, _)| pslice)
            .collect();
        for &pslice in &owned {
            metadata.set_slice_entry(pslice, SliceEntry::FREE);
        }
        metadata.partition_mut(index).slice_count = 0;
        owned.len() as u64
    }

    /// One range per queried start, in the order given.
    pub fn query(map: &SliceMap, vslice_starts: &[u64]) -> Result<Vec<VsliceRange>> {
        vslice_starts
            .iter()
            .map(|&vslice| {
                if vslice >= MAX_VSLICES {
                    return Err(fvm_error!(OutOfRange {
                        description: format!("vslice {vslice} is beyond the virtual address space"),
                    }));
                }
                Ok(map.query(vslice))
            })
            .collect()
    }

    pub fn note_reserved(&mut self, count: u64) {
        self.assigned += count;
    }

    pub fn note_released(&mut self, count: u64) {
        self.assigned -= count;
    }

    pub fn set_pslice_count(&mut self, pslice_count: u64) {
        debug_assert!(pslice_count >= self.assigned);
        self.pslice_count = pslice_count;
    }
}
