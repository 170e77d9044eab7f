//! Control surface of a bound volume.
//!
//! All control operations run under one mutex that guards the metadata
//! store, the slice counters and the partition registry. Every change goes
//! through a single metadata commit; in-memory state is updated only after
//! the commit is on disk, and the I/O path is handed the new slice maps
//! through the registry's snapshots.

mod partition;

#[cfg(test)]
mod manager_tests;

pub use partition::VPartition;

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use ubifvm_macros::error_context;

use crate::allocator::{check_range, SliceAllocator};
use crate::block_device::BlockDevice;
use crate::config::ManagerConfig;
use crate::format::{
    validate_name, Geometry, Guid, PartitionEntry, FLAG_INACTIVE, MAX_VSLICES,
};
use crate::metadata::{FormatOptions, MetadataStore, Slot};
use crate::volume::{PartitionRecord, Registry, SliceMap, VsliceRange};
use crate::{fvm_error, Result};

/// Volume-wide figures reported by `QueryInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerInfo {
    pub slice_size: u64,
    pub slice_count: u64,
    pub assigned_slice_count: u64,
    /// Slices the allocation table could describe after a grow.
    pub maximum_slice_count: u64,
    pub max_virtual_slice: u64,
    pub metadata_size: u64,
    pub generation: u64,
    pub active_copy: Slot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub index: u16,
    pub name: String,
    pub type_guid: Guid,
    pub instance_guid: Guid,
    pub active: bool,
    pub slice_count: u64,
    /// 0 when the partition may grow up to the size of the volume.
    pub slice_limit: u64,
}

/// What `GetVolumeInfo` returns for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub manager: ManagerInfo,
    pub partition: PartitionInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub block_size: u32,
    pub block_count: u64,
}

/// Arguments of `AllocatePartition`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionRequest {
    pub type_guid: Guid,
    pub instance_guid: Guid,
    pub name: String,
    pub slice_count: u64,
    #[serde(default)]
    pub flags: u32,
}

struct ManagerState {
    store: MetadataStore,
    allocator: SliceAllocator,
    registry: Registry,
    bound: bool,
}

impl ManagerState {
    fn manager_info(&self) -> ManagerInfo {
        let geometry = self.store.geometry();
        ManagerInfo {
            slice_size: geometry.slice_size,
            slice_count: self.allocator.pslice_count(),
            assigned_slice_count: self.allocator.assigned_count(),
            maximum_slice_count: geometry.max_pslices(),
            max_virtual_slice: MAX_VSLICES,
            metadata_size: geometry.metadata_size(),
            generation: self.store.metadata().generation(),
            active_copy: self.store.active_slot(),
        }
    }

    /// The record behind a handle, provided the handle is still current.
    fn record(&self, index: u16, generation: u64) -> Result<&PartitionRecord> {
        registry_record(&self.registry, index, generation)
    }
}

fn stale_handle(index: u16) -> crate::UbifvmError {
    fvm_error!(BadState {
        description: format!("partition {index} was destroyed"),
    })
}

fn partition_info(index: u16, record: &PartitionRecord) -> PartitionInfo {
    PartitionInfo {
        index,
        name: record.entry.name().into_owned(),
        type_guid: record.entry.type_guid,
        instance_guid: record.entry.instance_guid,
        active: record.entry.is_active(),
        slice_count: record.entry.slice_count as u64,
        slice_limit: record.slice_limit,
    }
}

pub struct VolumeManager {
    state: Mutex<ManagerState>,
    device: Box<dyn BlockDevice>,
    readonly: bool,
}

impl VolumeManager {
    /// Writes an empty volume to `device`.
    pub fn format(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Geometry> {
        MetadataStore::format(device, options)
    }

    /// Loads the volume on `device` and reclaims every partition still
    /// marked inactive before anything else may touch it.
    pub fn bind(device: Box<dyn BlockDevice>) -> Result<Arc<Self>> {
        Self::attach(device, false)
    }

    /// Loads the volume without ever writing to `device`. Inactive
    /// partitions are left in place, and every mutation fails with
    /// `AccessDenied`.
    pub fn bind_readonly(device: Box<dyn BlockDevice>) -> Result<Arc<Self>> {
        Self::attach(device, true)
    }

    #[error_context("binding volume")]
    fn attach(device: Box<dyn BlockDevice>, readonly: bool) -> Result<Arc<Self>> {
        let base = device.clone();
        let mut store = MetadataStore::open(device)?;
        let geometry = store.geometry();
        let block_size = base.block_size() as u64;
        if geometry.slice_size % block_size != 0 || geometry.data_start() % block_size != 0 {
            return Err(fvm_error!(Incompatible {
                description: format!(
                    "slice size {} is not a multiple of the {block_size}-byte device block",
                    geometry.slice_size
                ),
            }));
        }

        let inactive: Vec<(u16, String)> = store
            .metadata()
            .live_partitions()
            .filter(|&index| store.metadata().partition(index).is_inactive())
            .map(|index| (index, store.metadata().partition(index).name().into_owned()))
            .collect();
        if readonly {
            for (index, name) in &inactive {
                info!("Leaving inactive partition {index} ({name}) on a read-only volume");
            }
        } else if !inactive.is_empty() {
            let freed = store.commit(|metadata| {
                Ok(inactive
                    .iter()
                    .map(|&(index, _)| {
                        let freed = SliceAllocator::release_all(metadata, index);
                        *metadata.partition_mut(index) = PartitionEntry::default();
                        freed
                    })
                    .collect::<Vec<_>>())
            })?;
            for ((index, name), freed) in inactive.iter().zip(freed) {
                warn!("Reclaimed inactive partition {index} ({name}), {freed} slices freed");
            }
        }

        let allocator = SliceAllocator::from_metadata(store.metadata());
        let registry = Registry::build(store.metadata(), base.block_size());
        info!(
            "Bound volume: {} of {} slices assigned, {} bytes per slice, generation {} from the {} copy",
            allocator.assigned_count(),
            allocator.pslice_count(),
            geometry.slice_size,
            store.metadata().generation(),
            store.active_slot()
        );
        Ok(Arc::new(VolumeManager {
            state: Mutex::new(ManagerState {
                store,
                allocator,
                registry,
                bound: true,
            }),
            device: base,
            readonly,
        }))
    }

    /// Builds the configured device and binds the volume on it.
    pub fn open(config: &ManagerConfig) -> Result<Arc<Self>> {
        Self::attach(config.build_device()?, config.readonly)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Like `lock`, for operations that write metadata.
    fn lock_writable(&self) -> Result<MutexGuard<'_, ManagerState>> {
        if self.readonly {
            return Err(fvm_error!(AccessDenied {
                description: "volume is read-only".to_string(),
            }));
        }
        self.lock()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManagerState>> {
        let state = self.state.lock().map_err(|_| {
            fvm_error!(BadState {
                description: "volume manager lock poisoned".to_string(),
            })
        })?;
        if !state.bound {
            return Err(fvm_error!(BadState {
                description: "volume manager is unbound".to_string(),
            }));
        }
        Ok(state)
    }

    /// Stops serving the volume. Every partition handle and channel fails
    /// from here on.
    pub fn unbind(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.registry.retire_all();
        state.bound = false;
        info!("Volume unbound");
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().map(|state| state.bound).unwrap_or(false)
    }

    pub fn device_size(&self) -> u64 {
        self.device.size_bytes()
    }

    pub fn query_info(&self) -> Result<ManagerInfo> {
        Ok(self.lock()?.manager_info())
    }

    pub fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let state = self.lock()?;
        Ok(state
            .registry
            .iter()
            .map(|(index, record)| partition_info(index, record))
            .collect())
    }

    #[error_context("allocating partition {}", request.name)]
    pub fn allocate_partition(self: &Arc<Self>, request: &PartitionRequest) -> Result<VPartition> {
        validate_name(&request.name)?;
        if request.instance_guid.is_nil() {
            return Err(fvm_error!(InvalidParameter {
                description: "instance guid must not be nil".to_string(),
            }));
        }
        if request.slice_count == 0 {
            return Err(fvm_error!(InvalidParameter {
                description: "a partition needs at least one slice".to_string(),
            }));
        }
        if request.flags & !FLAG_INACTIVE != 0 {
            return Err(fvm_error!(InvalidParameter {
                description: format!("unknown partition flags {:#x}", request.flags),
            }));
        }

        let mut guard = self.lock_writable()?;
        let ManagerState {
            store,
            allocator,
            registry,
            ..
        } = &mut *guard;
        if registry.find_by_instance(&request.instance_guid).is_some() {
            return Err(fvm_error!(AlreadyExists {
                description: format!("instance guid {} is in use", request.instance_guid),
            }));
        }
        let entry = PartitionEntry::new(
            request.type_guid,
            request.instance_guid,
            &request.name,
            request.flags,
        )?;
        if entry.is_active() && registry.find_active_by_name(&request.name).is_some() {
            return Err(fvm_error!(AlreadyExists {
                description: format!("an active partition is already named {}", request.name),
            }));
        }
        let index = registry.free_slot().ok_or_else(|| {
            fvm_error!(NoSpace {
                description: "partition table is full".to_string(),
            })
        })?;

        let empty = SliceMap::new();
        let pairs = store.commit(|metadata| {
            *metadata.partition_mut(index) = entry;
            allocator.reserve(metadata, &empty, index, 0, request.slice_count)
        })?;
        allocator.note_reserved(pairs.len() as u64);
        let mut map = SliceMap::new();
        for (vslice, pslice) in pairs {
            map.insert(vslice, pslice);
        }
        let generation = registry.install(index, *store.metadata().partition(index), map);
        info!(
            "Allocated partition {index} ({}, {}) with {} slices{}",
            request.name,
            request.instance_guid,
            request.slice_count,
            if entry.is_inactive() { ", inactive" } else { "" }
        );
        let cell = registry.cell(index);
        drop(guard);
        Ok(VPartition::new(self.clone(), index, generation, cell))
    }

    /// Handle onto the active partition with `instance_guid`.
    pub fn open_partition(self: &Arc<Self>, instance_guid: &Guid) -> Result<VPartition> {
        self.handle(instance_guid, true)
    }

    /// Like `open_partition`, but inactive partitions are found too.
    pub fn find_partition(self: &Arc<Self>, instance_guid: &Guid) -> Result<VPartition> {
        self.handle(instance_guid, false)
    }

    fn handle(self: &Arc<Self>, instance_guid: &Guid, active_only: bool) -> Result<VPartition> {
        let state = self.lock()?;
        let index = state
            .registry
            .find_by_instance(instance_guid)
            .filter(|&index| {
                !active_only
                    || state
                        .registry
                        .record(index)
                        .is_some_and(|record| record.entry.is_active())
            })
            .ok_or_else(|| {
                fvm_error!(NotFound {
                    description: format!(
                        "no {}partition {instance_guid}",
                        if active_only { "active " } else { "" }
                    ),
                })
            })?;
        let generation = state.registry.generation(index);
        let cell = state.registry.cell(index);
        drop(state);
        Ok(VPartition::new(self.clone(), index, generation, cell))
    }

    /// Replaces the active partition `old` by the inactive partition `new`
    /// in one commit. With `old == new` the inactive partition is
    /// activated in place.
    #[error_context("activating {new} in place of {old}")]
    pub fn activate(&self, old: &Guid, new: &Guid) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let ManagerState {
            store,
            allocator,
            registry,
            ..
        } = &mut *guard;

        let new_index = registry.find_by_instance(new).ok_or_else(|| {
            fvm_error!(NotFound {
                description: format!("no partition {new}"),
            })
        })?;
        let new_active = registry
            .record(new_index)
            .is_some_and(|record| record.entry.is_active());

        let old_index = if old == new {
            if new_active {
                debug!("Partition {new} is already active");
                return Ok(());
            }
            None
        } else {
            let old_index = registry
                .find_by_instance(old)
                .filter(|&index| {
                    registry
                        .record(index)
                        .is_some_and(|record| record.entry.is_active())
                })
                .ok_or_else(|| {
                    fvm_error!(NotFound {
                        description: format!("no active partition {old}"),
                    })
                })?;
            if new_active {
                return Err(fvm_error!(AlreadyExists {
                    description: format!("partition {new} is already active"),
                }));
            }
            Some(old_index)
        };

        let freed = store.commit(|metadata| {
            let freed = match old_index {
                Some(index) => {
                    let freed = SliceAllocator::release_all(metadata, index);
                    *metadata.partition_mut(index) = PartitionEntry::default();
                    freed
                }
                None => 0,
            };
            metadata.partition_mut(new_index).flags &= !FLAG_INACTIVE;
            Ok(freed)
        })?;

        allocator.note_released(freed);
        if let Some(index) = old_index {
            registry.remove(index);
        }
        if let Some(record) = registry.record_mut(new_index) {
            record.entry = *store.metadata().partition(new_index);
        }
        registry.publish(new_index);
        info!("Activated partition {new}, replacing {old}");
        Ok(())
    }

    /// Extends the volume onto a device that grew to `device_size` bytes
    /// and returns the resulting slice count.
    pub fn grow(&self, device_size: u64) -> Result<u64> {
        let mut guard = self.lock_writable()?;
        let ManagerState {
            store, allocator, ..
        } = &mut *guard;
        if let Some(pslice_count) = store.grow(device_size)? {
            allocator.set_pslice_count(pslice_count);
        }
        Ok(allocator.pslice_count())
    }

    // Partition operations, reached through `VPartition`.

    pub(crate) fn partition_info(&self, index: u16, generation: u64) -> Result<PartitionInfo> {
        let state = self.lock()?;
        Ok(partition_info(index, state.record(index, generation)?))
    }

    pub(crate) fn volume_info(&self, index: u16, generation: u64) -> Result<VolumeInfo> {
        let state = self.lock()?;
        Ok(VolumeInfo {
            partition: partition_info(index, state.record(index, generation)?),
            manager: state.manager_info(),
        })
    }

    #[error_context("extending partition {index} at vslice {vslice_start} by {count}")]
    pub(crate) fn extend(
        &self,
        index: u16,
        generation: u64,
        vslice_start: u64,
        count: u64,
    ) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let ManagerState {
            store,
            allocator,
            registry,
            ..
        } = &mut *guard;
        let record = registry_record(registry, index, generation)?;
        if count == 0 {
            return Ok(());
        }
        let requested = record.map.slice_count().saturating_add(count);
        if record.slice_limit > 0 && requested > record.slice_limit {
            return Err(fvm_error!(SizeLimit {
                limit: record.slice_limit,
                requested,
            }));
        }

        let map = &record.map;
        let pairs = store
            .commit(|metadata| allocator.reserve(metadata, map, index, vslice_start, count))?;
        allocator.note_reserved(pairs.len() as u64);
        if let Some(record) = registry.record_mut(index) {
            for &(vslice, pslice) in &pairs {
                record.map.insert(vslice, pslice);
            }
            record.entry = *store.metadata().partition(index);
        }
        registry.publish(index);
        debug!("Partition {index} extended by {count} slices at vslice {vslice_start}");
        Ok(())
    }

    #[error_context("shrinking partition {index} at vslice {vslice_start} by {count}")]
    pub(crate) fn shrink(
        &self,
        index: u16,
        generation: u64,
        vslice_start: u64,
        count: u64,
    ) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let ManagerState {
            store,
            allocator,
            registry,
            ..
        } = &mut *guard;
        let record = registry_record(registry, index, generation)?;
        if count == 0 {
            return Ok(());
        }
        if vslice_start == 0 {
            return Err(fvm_error!(InvalidParameter {
                description: "vslice 0 cannot be released".to_string(),
            }));
        }
        check_range(vslice_start, count)?;
        if record.map.first_mapped_in(vslice_start, count).is_none() {
            return Ok(());
        }

        let map = &record.map;
        let pairs = store
            .commit(|metadata| allocator.release(metadata, map, index, vslice_start, count))?;
        allocator.note_released(pairs.len() as u64);
        if let Some(record) = registry.record_mut(index) {
            for &(vslice, _) in &pairs {
                record.map.remove(vslice);
            }
            record.entry = *store.metadata().partition(index);
        }
        registry.publish(index);
        debug!("Partition {index} shrunk by {} slices at vslice {vslice_start}", pairs.len());
        Ok(())
    }

    #[error_context("destroying partition {index}")]
    pub(crate) fn destroy(&self, index: u16, generation: u64) -> Result<()> {
        let mut guard = self.lock_writable()?;
        let ManagerState {
            store,
            allocator,
            registry,
            ..
        } = &mut *guard;
        let name = registry_record(registry, index, generation)?.entry.name().into_owned();
        let freed = store.commit(|metadata| {
            let freed = SliceAllocator::release_all(metadata, index);
            *metadata.partition_mut(index) = PartitionEntry::default();
            Ok(freed)
        })?;
        allocator.note_released(freed);
        registry.remove(index);
        info!("Destroyed partition {index} ({name}), {freed} slices freed");
        Ok(())
    }

    pub(crate) fn set_name(&self, index: u16, generation: u64, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut guard = self.lock_writable()?;
        let ManagerState {
            store, registry, ..
        } = &mut *guard;
        registry_record(registry, index, generation)?;
        store.commit(|metadata| metadata.partition_mut(index).set_name(name))?;
        if let Some(record) = registry.record_mut(index) {
            record.entry = *store.metadata().partition(index);
        }
        Ok(())
    }

    /// Caps future extends at `ceil(bytes / slice_size)` slices; 0 lifts
    /// the cap. Slices above the cap stay allocated.
    pub(crate) fn set_byte_limit(&self, index: u16, generation: u64, bytes: u64) -> Result<()> {
        let mut state = self.lock_writable()?;
        let slice_size = state.store.geometry().slice_size;
        state.record(index, generation)?;
        let limit = bytes.div_ceil(slice_size);
        if let Some(record) = state.registry.record_mut(index) {
            record.slice_limit = limit;
        }
        debug!("Partition {index} limited to {limit} slices");
        Ok(())
    }

    pub(crate) fn query_slices(
        &self,
        index: u16,
        generation: u64,
        vslice_starts: &[u64],
    ) -> Result<Vec<VsliceRange>> {
        let state = self.lock()?;
        SliceAllocator::query(&state.record(index, generation)?.map, vslice_starts)
    }

    pub(crate) fn base_device(&self) -> Box<dyn BlockDevice> {
        self.device.clone()
    }
}

fn registry_record(registry: &Registry, index: u16, generation: u64) -> Result<&PartitionRecord> {
    if registry.generation(index) != generation {
        return Err(stale_handle(index));
    }
    registry.record(index).ok_or_else(|| stale_handle(index))
}
