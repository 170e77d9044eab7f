use std::sync::{Arc, RwLock};

use log::debug;

use super::SliceMap;
use crate::format::{Geometry, Guid, PartitionEntry};
use crate::metadata::Metadata;

/// Translation constants shared by every partition of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u32,
    pub blocks_per_slice: u64,
    /// First device block of physical slice 1.
    pub data_start_block: u64,
}

impl BlockLayout {
    pub fn new(geometry: &Geometry, block_size: u32) -> Self {
        BlockLayout {
            block_size,
            blocks_per_slice: geometry.slice_size / block_size as u64,
            data_start_block: geometry.data_start() / block_size as u64,
        }
    }

    pub fn physical_block(&self, pslice: u64, block_in_slice: u64) -> u64 {
        self.data_start_block + (pslice - 1) * self.blocks_per_slice + block_in_slice
    }
}

/// What the I/O path sees of a partition. Replaced wholesale after every
/// commit that touches the partition, so a reader never observes a
/// half-applied change.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub generation: u64,
    /// False while the partition is inactive, and once it is destroyed or
    /// the manager unbound.
    pub live: bool,
    pub layout: BlockLayout,
    pub map: SliceMap,
}

impl PartitionSnapshot {
    /// Addressable size: enough blocks to cover the highest mapped vslice.
    pub fn block_count(&self) -> u64 {
        self.map
            .last_vslice()
            .map_or(0, |vslice| (vslice + 1) * self.layout.blocks_per_slice)
    }

    pub fn serves(&self, generation: u64) -> bool {
        self.live && self.generation == generation
    }
}

pub type SnapshotCell = Arc<RwLock<Arc<PartitionSnapshot>>>;

pub fn load_snapshot(cell: &SnapshotCell) -> Arc<PartitionSnapshot> {
    match cell.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn store_snapshot(cell: &SnapshotCell, snapshot: PartitionSnapshot) {
    let snapshot = Arc::new(snapshot);
    match cell.write() {
        Ok(mut guard) => *guard = snapshot,
        Err(poisoned) => *poisoned.into_inner() = snapshot,
    }
}

/// Committed state of one occupied partition slot.
#[derive(Debug, Clone)]
pub struct PartitionRecord {
    pub entry: PartitionEntry,
    /// Maximum slices the partition may hold; 0 means unlimited.
    pub slice_limit: u64,
    pub map: SliceMap,
}

struct RegistrySlot {
    generation: u64,
    record: Option<PartitionRecord>,
    cell: SnapshotCell,
}

/// Partition slots indexed like the partition table. Every slot keeps one
/// snapshot cell for its whole lifetime; a slot's generation moves on
/// whenever its partition is created or destroyed, which invalidates
/// handles that captured the old generation.
pub struct Registry {
    layout: BlockLayout,
    slots: Vec<RegistrySlot>,
}

impl Registry {
    pub fn build(metadata: &Metadata, block_size: u32) -> Self {
        let layout = BlockLayout::new(&metadata.geometry(), block_size);
        let mut maps: Vec<Option<SliceMap>> = metadata
            .partitions
            .iter()
            .map(|entry| (!entry.is_free()).then(SliceMap::new))
            .collect();
        for (pslice, entry) in metadata.allocated_slices() {
            if let Some(map) = maps[entry.partition_index() as usize].as_mut() {
                map.insert(entry.vslice(), pslice);
            }
        }

        let slots = metadata
            .partitions
            .iter()
            .zip(maps)
            .map(|(entry, map)| {
                let record = map.map(|map| PartitionRecord {
                    entry: *entry,
                    slice_limit: 0,
                    map,
                });
                let snapshot = PartitionSnapshot {
                    generation: 1,
                    live: record.as_ref().is_some_and(|r| r.entry.is_active()),
                    layout,
                    map: record.as_ref().map(|r| r.map.clone()).unwrap_or_default(),
                };
                RegistrySlot {
                    generation: 1,
                    record,
                    cell: Arc::new(RwLock::new(Arc::new(snapshot))),
                }
            })
            .collect();
        Registry { layout, slots }
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn record(&self, index: u16) -> Option<&PartitionRecord> {
        self.slots.get(index as usize)?.record.as_ref()
    }

    pub fn record_mut(&mut self, index: u16) -> Option<&mut PartitionRecord> {
        self.slots.get_mut(index as usize)?.record.as_mut()
    }

    pub fn generation(&self, index: u16) -> u64 {
        self.slots.get(index as usize).map_or(0, |slot| slot.generation)
    }

    pub fn cell(&self, index: u16) -> SnapshotCell {
        self.slots[index as usize].cell.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &PartitionRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.record.as_ref().map(|r| (index as u16, r)))
    }

    /// Lowest unused slot, never slot 0.
    pub fn free_slot(&self) -> Option<u16> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.record.is_none())
            .map(|(index, _)| index as u16)
    }

    pub fn find_by_instance(&self, instance_guid: &Guid) -> Option<u16> {
        self.iter()
            .find(|(_, r)| r.entry.instance_guid == *instance_guid)
            .map(|(index, _)| index)
    }

    pub fn find_active_by_name(&self, name: &str) -> Option<u16> {
        self.iter()
            .find(|(_, r)| r.entry.is_active() && r.entry.name() == name)
            .map(|(index, _)| index)
    }

    /// Occupies a free slot with a freshly committed partition and returns
    /// the slot's new generation.
    pub fn install(&mut self, index: u16, entry: PartitionEntry, map: SliceMap) -> u64 {
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.record.is_none());
        slot.generation += 1;
        slot.record = Some(PartitionRecord {
            entry,
            slice_limit: 0,
            map,
        });
        self.publish(index);
        self.slots[index as usize].generation
    }

    /// Frees a slot after its partition was destroyed.
    pub fn remove(&mut self, index: u16) {
        let slot = &mut self.slots[index as usize];
        slot.record = None;
        slot.generation += 1;
        debug!("Partition slot {index} retired, generation {}", slot.generation);
        self.publish(index);
    }

    /// Pushes the committed state of `index` to its I/O snapshot.
    pub fn publish(&self, index: u16) {
        let slot = &self.slots[index as usize];
        let snapshot = PartitionSnapshot {
            generation: slot.generation,
            live: slot
                .record
                .as_ref()
                .is_some_and(|r| r.entry.is_active()),
            layout: self.layout,
            map: slot
                .record
                .as_ref()
                .map(|r| r.map.clone())
                .unwrap_or_default(),
        };
        store_snapshot(&slot.cell, snapshot);
    }

    /// Marks every snapshot dead, as on unbind.
    pub fn retire_all(&mut self) {
        for slot in &mut self.slots {
            slot.generation += 1;
            let snapshot = PartitionSnapshot {
                generation: slot.generation,
                live: false,
                layout: self.layout,
                map: SliceMap::new(),
            };
            store_snapshot(&slot.cell, snapshot);
        }
    }
}
