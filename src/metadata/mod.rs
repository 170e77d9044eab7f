//! In-memory form of one metadata copy and the store that keeps the two
//! on-disk copies in step.

mod check;
mod load;
mod store;

pub use check::{check_image, CheckReport, CopyReport};
pub use load::{load_metadata, LoadedMetadata, Slot};
pub use store::{FormatOptions, MetadataStore};

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::format::{
    Geometry, Header, PartitionEntry, SliceEntry, HASH_OFFSET, HASH_SIZE, HEADER_SIZE,
    PARTITION_ENTRY_SIZE, SLICE_ENTRY_SIZE,
};
use crate::{fvm_error, Result};

/// SHA-256 of a metadata image with the header hash field taken as zero.
pub fn compute_hash(image: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(&image[..HASH_OFFSET]);
    hasher.update([0u8; HASH_SIZE]);
    hasher.update(&image[HEADER_SIZE..]);
    hasher.finalize().into()
}

/// One decoded copy of the metadata: header, partition table and
/// allocation table. Index 0 of both tables is kept but never used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub header: Header,
    pub partitions: Vec<PartitionEntry>,
    pub slices: Vec<SliceEntry>,
}

impl Metadata {
    pub fn new(geometry: &Geometry, pslice_count: u64) -> Self {
        Metadata {
            header: Header::new(geometry, pslice_count),
            partitions: vec![PartitionEntry::default(); geometry.partition_table_entry_count as usize],
            slices: vec![SliceEntry::FREE; geometry.allocation_table_entry_count as usize],
        }
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            slice_size: self.header.pslice_size,
            partition_table_entry_count: self.header.partition_table_entry_count,
            allocation_table_entry_count: self.header.allocation_table_entry_count,
        }
    }

    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    pub fn pslice_count(&self) -> u64 {
        self.header.pslice_count
    }

    pub fn partition(&self, index: u16) -> &PartitionEntry {
        &self.partitions[index as usize]
    }

    pub fn partition_mut(&mut self, index: u16) -> &mut PartitionEntry {
        &mut self.partitions[index as usize]
    }

    /// Indices of every occupied partition slot.
    pub fn live_partitions(&self) -> impl Iterator<Item = u16> + '_ {
        self.partitions
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, entry)| !entry.is_free())
            .map(|(index, _)| index as u16)
    }

    pub fn slice_entry(&self, pslice: u64) -> SliceEntry {
        self.slices[pslice as usize]
    }

    pub fn set_slice_entry(&mut self, pslice: u64, entry: SliceEntry) {
        self.slices[pslice as usize] = entry;
    }

    /// Allocated `(pslice, entry)` pairs in physical order.
    pub fn allocated_slices(&self) -> impl Iterator<Item = (u64, SliceEntry)> + '_ {
        self.slices
            .iter()
            .enumerate()
            .take(self.pslice_count() as usize + 1)
            .skip(1)
            .filter(|(_, entry)| !entry.is_free())
            .map(|(pslice, entry)| (pslice as u64, *entry))
    }

    /// Serializes the full metadata image, including padding, and stores
    /// the resulting hash in both the image and `self.header`.
    pub fn encode(&mut self) -> Vec<u8> {
        let geometry = self.geometry();
        let mut image = vec![0u8; geometry.metadata_size() as usize];

        let table = geometry.partition_table_offset();
        for (i, entry) in self.partitions.iter().enumerate() {
            let offset = table + i * PARTITION_ENTRY_SIZE;
            entry.encode(&mut image[offset..offset + PARTITION_ENTRY_SIZE]);
        }
        let table = geometry.allocation_table_offset();
        for (i, entry) in self.slices.iter().enumerate() {
            let offset = table + i * SLICE_ENTRY_SIZE;
            entry.encode(&mut image[offset..offset + SLICE_ENTRY_SIZE]);
        }

        self.header.hash = [0; HASH_SIZE];
        self.header.encode(&mut image[..HEADER_SIZE]);
        self.header.hash = compute_hash(&image);
        image[HASH_OFFSET..HEADER_SIZE].copy_from_slice(&self.header.hash);
        image
    }

    /// Decodes an image whose header already passed `Header::validate`.
    /// Fails when the hash does not match or the tables contradict each
    /// other.
    pub fn decode(image: &[u8]) -> Result<Self> {
        let header = Header::decode(image)?;
        let geometry = Geometry {
            slice_size: header.pslice_size,
            partition_table_entry_count: header.partition_table_entry_count,
            allocation_table_entry_count: header.allocation_table_entry_count,
        };
        if (image.len() as u64) < geometry.metadata_size() {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!(
                    "image holds {} bytes, layout needs {}",
                    image.len(),
                    geometry.metadata_size()
                ),
            }));
        }
        let image = &image[..geometry.metadata_size() as usize];
        if compute_hash(image) != header.hash {
            return Err(fvm_error!(MetadataCorrupt {
                description: format!("hash mismatch in generation {}", header.generation),
            }));
        }

        let table = geometry.partition_table_offset();
        let partitions = (0..geometry.partition_table_entry_count as usize)
            .map(|i| {
                let offset = table + i * PARTITION_ENTRY_SIZE;
                PartitionEntry::decode(&image[offset..offset + PARTITION_ENTRY_SIZE])
            })
            .collect();
        let table = geometry.allocation_table_offset();
        let slices = (0..geometry.allocation_table_entry_count as usize)
            .map(|i| {
                let offset = table + i * SLICE_ENTRY_SIZE;
                SliceEntry::decode(&image[offset..offset + SLICE_ENTRY_SIZE])
            })
            .collect();

        let metadata = Metadata {
            header,
            partitions,
            slices,
        };
        metadata.check_tables()?;
        Ok(metadata)
    }

    /// Cross-checks the partition table against the allocation table.
    pub fn check_tables(&self) -> Result<()> {
        let corrupt = |description: String| Err(fvm_error!(MetadataCorrupt { description }));

        if !self.partitions[0].is_free() {
            return corrupt("partition slot 0 is in use".to_string());
        }
        if !self.slices[0].is_free() {
            return corrupt("allocation entry 0 is in use".to_string());
        }
        if let Some((pslice, _)) = self
            .slices
            .iter()
            .enumerate()
            .skip(self.pslice_count() as usize + 1)
            .find(|(_, entry)| !entry.is_free())
        {
            return corrupt(format!(
                "pslice {pslice} is allocated beyond the slice count {}",
                self.pslice_count()
            ));
        }

        let mut counts = vec![0u64; self.partitions.len()];
        let mut seen = HashSet::new();
        for (pslice, entry) in self.allocated_slices() {
            let index = entry.partition_index() as usize;
            if index >= self.partitions.len() || self.partitions[index].is_free() {
                return corrupt(format!(
                    "pslice {pslice} belongs to missing partition {index}"
                ));
            }
            if !seen.insert((index, entry.vslice())) {
                return corrupt(format!(
                    "vslice {} of partition {index} is mapped twice",
                    entry.vslice()
                ));
            }
            counts[index] += 1;
        }
        let mut instances = HashSet::new();
        for index in self.live_partitions() {
            let entry = self.partition(index);
            if !entry.instance_guid.is_nil() && !instances.insert(entry.instance_guid) {
                return corrupt(format!(
                    "instance {} is used by more than one partition",
                    entry.instance_guid
                ));
            }
            if entry.slice_count as u64 != counts[index as usize] {
                return corrupt(format!(
                    "partition {index} records {} slices but owns {}",
                    entry.slice_count, counts[index as usize]
                ));
            }
        }
        Ok(())
    }
}
