use std::sync::Arc;

use super::*;
use crate::block_device::bdev_failing::FailingBlockDevice;
use crate::block_device::bdev_mem::MemBlockDevice;
use crate::block_device::IoChannel;
use crate::metadata::check_image;
use crate::{Status, UbifvmError};

const MIB: u64 = 1 << 20;
const BLOCK: usize = 512;
const BLOCKS_PER_SLICE: u64 = MIB / BLOCK as u64;
const TYPE_DATA: Guid = Guid([0xaa; 16]);
const GUID_A: Guid = Guid([0x01; 16]);
const GUID_B: Guid = Guid([0x02; 16]);

fn options() -> FormatOptions {
    FormatOptions {
        slice_size: MIB,
        max_pslices: Some(50),
        max_partitions: 1024,
    }
}

/// A formatted device with exactly 50 slices.
fn formatted() -> MemBlockDevice {
    let mem = MemBlockDevice::new(51 * MIB);
    VolumeManager::format(&mem, &options()).unwrap();
    mem
}

fn bind(mem: &MemBlockDevice) -> Arc<VolumeManager> {
    VolumeManager::bind(mem.boxed()).unwrap()
}

fn rebind(manager: &VolumeManager, mem: &MemBlockDevice) -> Arc<VolumeManager> {
    manager.unbind().unwrap();
    bind(mem)
}

fn request(instance: Guid, name: &str, slices: u64, flags: u32) -> PartitionRequest {
    PartitionRequest {
        type_guid: TYPE_DATA,
        instance_guid: instance,
        name: name.to_string(),
        slice_count: slices,
        flags,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn assert_clean(mem: &MemBlockDevice) {
    let report = check_image(mem).unwrap();
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn test_create_write_reopen_read() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let data = pattern(BLOCK, 7);
    partition.write_blocks(0, &data).unwrap();

    let manager = rebind(&manager, &mem);
    let partition = manager.open_partition(&GUID_A).unwrap();
    let mut read = vec![0u8; BLOCK];
    partition.read_blocks(0, &mut read).unwrap();
    assert_eq!(read, data);
    assert_eq!(manager.query_info().unwrap().assigned_slice_count, 1);
    assert_clean(&mem);
}

#[test]
fn test_extend_across_slice_boundary() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    assert_eq!(partition.block_info().unwrap().block_count, BLOCKS_PER_SLICE);

    let last = BLOCKS_PER_SLICE - 1;
    let data = pattern(BLOCK, 3);
    partition.write_blocks(last, &data).unwrap();

    let mut read = vec![0u8; 2 * BLOCK];
    let err = partition.read_blocks(last, &mut read).unwrap_err();
    assert_eq!(err.status(), Status::OutOfRange);

    partition.extend(1, 1).unwrap();
    partition.read_blocks(last, &mut read).unwrap();
    assert_eq!(&read[..BLOCK], &data[..]);
    assert_eq!(&read[BLOCK..], &[0u8; BLOCK][..]);
    assert_eq!(
        partition.block_info().unwrap().block_count,
        2 * BLOCKS_PER_SLICE
    );
}

#[test]
fn test_survives_one_corrupt_copy() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    // Move the newest state to the primary copy.
    partition.set_name("data").unwrap();
    let before = manager.list_partitions().unwrap();
    let metadata_size = manager.query_info().unwrap().metadata_size;
    manager.unbind().unwrap();

    mem.corrupt_byte(metadata_size + 128);
    assert!(!check_image(&mem).unwrap().secondary.valid);

    let manager = bind(&mem);
    assert_eq!(manager.query_info().unwrap().active_copy, Slot::Primary);
    assert_eq!(manager.list_partitions().unwrap(), before);

    manager.open_partition(&GUID_A).unwrap().extend(1, 1).unwrap();
    assert_clean(&mem);
}

#[test]
fn test_corrupt_active_copy_falls_back_to_older_generation() {
    let mem = formatted();
    let manager = bind(&mem);
    manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let info = manager.query_info().unwrap();
    assert_eq!(info.active_copy, Slot::Secondary);
    manager.unbind().unwrap();

    mem.corrupt_byte(info.metadata_size + 128);
    let manager = bind(&mem);
    let info = manager.query_info().unwrap();
    assert_eq!(info.active_copy, Slot::Primary);
    assert_eq!(info.generation, 1);
    assert!(manager.list_partitions().unwrap().is_empty());
}

#[test]
fn test_refuses_two_corrupt_copies() {
    let mem = formatted();
    let manager = bind(&mem);
    manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let metadata_size = manager.query_info().unwrap().metadata_size;
    manager.unbind().unwrap();

    mem.corrupt_byte(128);
    mem.corrupt_byte(metadata_size + 128);
    let writes = mem.metrics().writes;
    let err = VolumeManager::bind(mem.boxed()).err().unwrap();
    assert!(matches!(err, UbifvmError::MetadataCorrupt { .. }));
    assert_eq!(err.status(), Status::IoDataIntegrity);
    assert_eq!(mem.metrics().writes, writes);
}

#[test]
fn test_upgrade_activates_inactive() {
    let mem = formatted();
    let manager = bind(&mem);
    manager
        .allocate_partition(&request(GUID_A, "system", 2, FLAG_INACTIVE))
        .unwrap();
    manager
        .allocate_partition(&request(GUID_B, "system", 1, 0))
        .unwrap();

    let manager = rebind(&manager, &mem);
    let partitions = manager.list_partitions().unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].instance_guid, GUID_B);
    assert_eq!(manager.query_info().unwrap().assigned_slice_count, 1);
    assert!(manager.open_partition(&GUID_A).is_err());

    manager
        .allocate_partition(&request(GUID_A, "system", 1, FLAG_INACTIVE))
        .unwrap();
    assert!(matches!(
        manager.open_partition(&GUID_A),
        Err(UbifvmError::NotFound { .. })
    ));
    assert!(!manager.find_partition(&GUID_A).unwrap().info().unwrap().active);
    manager.activate(&GUID_B, &GUID_A).unwrap();

    let manager = rebind(&manager, &mem);
    let partitions = manager.list_partitions().unwrap();
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].instance_guid, GUID_A);
    assert!(partitions[0].active);
    assert!(manager.open_partition(&GUID_A).is_ok());
    assert!(matches!(
        manager.open_partition(&GUID_B),
        Err(UbifvmError::NotFound { .. })
    ));
    assert_clean(&mem);
}

#[test]
fn test_inactive_partition_serves_no_io() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "system", 1, FLAG_INACTIVE))
        .unwrap();
    let data = pattern(BLOCK, 3);
    assert!(matches!(
        partition.write_blocks(0, &data),
        Err(UbifvmError::BadState { .. })
    ));
    let mut out = vec![0u8; BLOCK];
    assert!(matches!(
        partition.read_blocks(0, &mut out),
        Err(UbifvmError::BadState { .. })
    ));
    assert!(matches!(
        partition.flush(),
        Err(UbifvmError::BadState { .. })
    ));
    let found = manager.find_partition(&GUID_A).unwrap();
    assert!(matches!(
        found.trim_blocks(0, 1),
        Err(UbifvmError::BadState { .. })
    ));
    assert_eq!(found.block_info().unwrap().block_count, 0);

    partition.extend(1, 1).unwrap();
    partition.set_name("system-b").unwrap();
    assert_eq!(partition.info().unwrap().slice_count, 2);

    manager.activate(&GUID_A, &GUID_A).unwrap();
    partition.write_blocks(BLOCKS_PER_SLICE, &data).unwrap();
    found.read_blocks(BLOCKS_PER_SLICE, &mut out).unwrap();
    assert_eq!(out, data);
    assert_eq!(
        found.block_info().unwrap().block_count,
        2 * BLOCKS_PER_SLICE
    );
    assert_clean(&mem);
}

#[test]
fn test_read_only_volume_refuses_mutation() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let data = pattern(BLOCK, 9);
    partition.write_blocks(0, &data).unwrap();
    manager
        .allocate_partition(&request(GUID_B, "next", 1, FLAG_INACTIVE))
        .unwrap();
    manager.unbind().unwrap();

    let writes = mem.metrics().writes;
    let manager = VolumeManager::bind_readonly(mem.boxed()).unwrap();
    assert!(manager.is_readonly());
    assert_eq!(manager.list_partitions().unwrap().len(), 2);

    let partition = manager.open_partition(&GUID_A).unwrap();
    let mut out = vec![0u8; BLOCK];
    partition.read_blocks(0, &mut out).unwrap();
    assert_eq!(out, data);

    let denied = |result: Result<()>| {
        let err = result.unwrap_err();
        assert_eq!(err.status(), Status::AccessDenied, "{err}");
    };
    denied(partition.write_blocks(0, &data));
    denied(partition.trim_blocks(0, 1));
    denied(partition.extend(1, 1));
    denied(partition.shrink(0, 1));
    denied(partition.set_name("renamed"));
    denied(partition.destroy());
    denied(manager.activate(&GUID_A, &GUID_B));
    denied(manager.grow(60 * MIB).map(|_| ()));
    denied(
        manager
            .allocate_partition(&request(Guid([0x33; 16]), "more", 1, 0))
            .map(|_| ()),
    );
    assert_eq!(mem.metrics().writes, writes);
    manager.unbind().unwrap();

    let manager = bind(&mem);
    assert_eq!(manager.list_partitions().unwrap().len(), 1);
}

#[test]
fn test_byte_limit_enforced() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    partition.set_byte_limit(2 * MIB).unwrap();
    partition.extend(1, 1).unwrap();
    let err = partition.extend(2, 1).unwrap_err();
    assert!(matches!(
        err,
        UbifvmError::SizeLimit {
            limit: 2,
            requested: 3,
            ..
        }
    ));
    assert_eq!(partition.info().unwrap().slice_limit, 2);

    // A partial slice rounds up; lowering below the allocation keeps slices.
    partition.set_byte_limit(MIB + 1).unwrap();
    assert_eq!(partition.info().unwrap().slice_limit, 2);
    partition.set_byte_limit(MIB).unwrap();
    assert_eq!(partition.info().unwrap().slice_count, 2);
    partition.set_byte_limit(0).unwrap();
    partition.extend(2, 1).unwrap();

    partition.set_byte_limit(3 * MIB).unwrap();
    let manager = rebind(&manager, &mem);
    let partition = manager.open_partition(&GUID_A).unwrap();
    assert_eq!(partition.info().unwrap().slice_limit, 0);
    partition.extend(3, 1).unwrap();
}

#[test]
fn test_activate_errors() {
    let mem = formatted();
    let manager = bind(&mem);
    manager
        .allocate_partition(&request(GUID_A, "a", 1, 0))
        .unwrap();
    manager
        .allocate_partition(&request(GUID_B, "b", 1, FLAG_INACTIVE))
        .unwrap();
    let generation = manager.query_info().unwrap().generation;

    let missing = Guid([9; 16]);
    assert!(matches!(
        manager.activate(&missing, &GUID_B),
        Err(UbifvmError::NotFound { .. })
    ));
    assert!(matches!(
        manager.activate(&GUID_A, &missing),
        Err(UbifvmError::NotFound { .. })
    ));
    // Old must be active.
    assert!(matches!(
        manager.activate(&GUID_B, &GUID_A),
        Err(UbifvmError::NotFound { .. })
    ));
    assert_eq!(manager.query_info().unwrap().generation, generation);

    manager.activate(&GUID_B, &GUID_B).unwrap();
    assert!(manager.open_partition(&GUID_B).is_ok());
    assert!(matches!(
        manager.activate(&GUID_A, &GUID_B),
        Err(UbifvmError::AlreadyExists { .. })
    ));
    manager.activate(&GUID_B, &GUID_B).unwrap();
}

#[test]
fn test_allocate_rejections() {
    let mem = formatted();
    let manager = bind(&mem);
    manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();

    let err = manager
        .allocate_partition(&request(GUID_A, "other", 1, 0))
        .err()
        .unwrap();
    assert_eq!(err.status(), Status::AlreadyExists);
    let err = manager
        .allocate_partition(&request(GUID_B, "data", 1, 0))
        .err()
        .unwrap();
    assert_eq!(err.status(), Status::AlreadyExists);
    // An inactive replacement may reuse the name.
    manager
        .allocate_partition(&request(GUID_B, "data", 1, FLAG_INACTIVE))
        .unwrap();

    for bad in [
        request(Guid([3; 16]), "", 1, 0),
        request(Guid([3; 16]), "a-name-that-is-far-too-long", 1, 0),
        request(Guid::NIL, "nil", 1, 0),
        request(Guid([3; 16]), "empty", 0, 0),
        request(Guid([3; 16]), "flags", 1, 0x8),
    ] {
        let err = manager.allocate_partition(&bad).err().unwrap();
        assert_eq!(err.status(), Status::InvalidArgs, "{bad:?}");
    }

    let err = manager
        .allocate_partition(&request(Guid([4; 16]), "huge", 49, 0))
        .err()
        .unwrap();
    assert!(matches!(err, UbifvmError::NoSpace { .. }));
    assert_eq!(manager.list_partitions().unwrap().len(), 2);
    assert_clean(&mem);
}

#[test]
fn test_partition_table_full() {
    let mem = MemBlockDevice::new(8 * MIB);
    VolumeManager::format(
        &mem,
        &FormatOptions {
            slice_size: MIB,
            max_pslices: None,
            max_partitions: 3,
        },
    )
    .unwrap();
    let manager = bind(&mem);
    manager
        .allocate_partition(&request(GUID_A, "a", 1, 0))
        .unwrap();
    manager
        .allocate_partition(&request(GUID_B, "b", 1, 0))
        .unwrap();
    let err = manager
        .allocate_partition(&request(Guid([5; 16]), "c", 1, 0))
        .err()
        .unwrap();
    assert!(matches!(err, UbifvmError::NoSpace { .. }));
}

#[test]
fn test_invariants_hold_across_operations() {
    let mem = formatted();
    let manager = bind(&mem);
    let a = manager
        .allocate_partition(&request(GUID_A, "a", 3, 0))
        .unwrap();
    let b = manager
        .allocate_partition(&request(GUID_B, "b", 2, 0))
        .unwrap();
    a.extend(10, 4).unwrap();
    b.extend(100, 1).unwrap();
    a.shrink(11, 2).unwrap();
    assert_clean(&mem);

    let info = a.info().unwrap();
    assert_eq!(info.slice_count, 5);
    let ranges = a.query_slices(&[0, 3, 10, 11, 13]).unwrap();
    assert_eq!(
        ranges,
        vec![
            VsliceRange { allocated: true, count: 3 },
            VsliceRange { allocated: false, count: 7 },
            VsliceRange { allocated: true, count: 1 },
            VsliceRange { allocated: false, count: 2 },
            VsliceRange { allocated: true, count: 1 },
        ]
    );
    assert_eq!(manager.query_info().unwrap().assigned_slice_count, 8);

    b.destroy().unwrap();
    let manager = rebind(&manager, &mem);
    assert_eq!(manager.query_info().unwrap().assigned_slice_count, 5);
    assert!(matches!(
        manager.open_partition(&GUID_B),
        Err(UbifvmError::NotFound { .. })
    ));
    assert_clean(&mem);
}

#[test]
fn test_mapping_is_stable_across_rebind() {
    let mem = formatted();
    let manager = bind(&mem);
    let a = manager
        .allocate_partition(&request(GUID_A, "a", 1, 0))
        .unwrap();
    let b = manager
        .allocate_partition(&request(GUID_B, "b", 1, 0))
        .unwrap();
    a.extend(1, 1).unwrap();
    b.extend(1, 1).unwrap();

    let data = pattern(4 * BLOCK, 11);
    a.write_blocks(BLOCKS_PER_SLICE - 2, &data).unwrap();
    let manager = rebind(&manager, &mem);
    let a = manager.open_partition(&GUID_A).unwrap();
    let mut read = vec![0u8; 4 * BLOCK];
    a.read_blocks(BLOCKS_PER_SLICE - 2, &mut read).unwrap();
    assert_eq!(read, data);
}

#[test]
fn test_allocate_destroy_restores_free_count() {
    let mem = formatted();
    let manager = bind(&mem);
    let before = manager.query_info().unwrap();
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 5, 0))
        .unwrap();
    partition.extend(20, 3).unwrap();
    partition.destroy().unwrap();
    let after = manager.query_info().unwrap();
    assert_eq!(after.assigned_slice_count, before.assigned_slice_count);
    assert_eq!(after.slice_count, before.slice_count);
}

#[test]
fn test_format_then_bind_is_empty() {
    let mem = formatted();
    let manager = bind(&mem);
    let info = manager.query_info().unwrap();
    assert_eq!(info.assigned_slice_count, 0);
    assert_eq!(info.slice_size, MIB);
    assert_eq!(info.slice_count, 50);
    assert_eq!(info.metadata_size, 73_728);
}

#[test]
fn test_noop_shrink_and_extend() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let generation = manager.query_info().unwrap().generation;
    let writes = mem.metrics().writes;

    partition.shrink(5, 10).unwrap();
    partition.extend(3, 0).unwrap();
    partition.shrink(0, 0).unwrap();
    assert_eq!(manager.query_info().unwrap().generation, generation);
    assert_eq!(mem.metrics().writes, writes);

    assert!(matches!(
        partition.shrink(0, 1),
        Err(UbifvmError::InvalidParameter { .. })
    ));
}

#[test]
fn test_extend_rejections_leave_table_unchanged() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 2, 0))
        .unwrap();
    let generation = manager.query_info().unwrap().generation;

    let err = partition.extend(1, MAX_VSLICES).unwrap_err();
    assert!(matches!(err, UbifvmError::OutOfRange { .. }));
    let err = partition.extend(MAX_VSLICES - 1, 2).unwrap_err();
    assert!(matches!(err, UbifvmError::OutOfRange { .. }));
    let err = partition.extend(1, 3).unwrap_err();
    assert!(matches!(err, UbifvmError::SliceOverlap { vslice: 1, .. }));
    let err = partition.extend(10, 49).unwrap_err();
    assert_eq!(err.status(), Status::NoSpace);

    assert_eq!(manager.query_info().unwrap().generation, generation);
    assert_eq!(partition.info().unwrap().slice_count, 2);
    partition.extend(MAX_VSLICES - 1, 1).unwrap();
    assert_clean(&mem);
}

#[test]
fn test_format_too_small_is_untouched() {
    let mem = MemBlockDevice::new(MIB);
    let err = VolumeManager::format(&mem, &options()).unwrap_err();
    assert_eq!(err.status(), Status::NoSpace);
    assert_eq!(mem.metrics().writes, 0);
    assert_eq!(mem.read_bytes(0, BLOCK), vec![0u8; BLOCK]);
}

#[test]
fn test_grow() {
    let mem = MemBlockDevice::new(30 * MIB);
    VolumeManager::format(&mem, &options()).unwrap();
    let manager = bind(&mem);
    let before = manager.query_info().unwrap().slice_count;
    assert_eq!(manager.grow(30 * MIB).unwrap(), before);

    mem.grow(41 * MIB);
    let grown = manager.grow(41 * MIB).unwrap();
    assert!(grown > before);
    let partition = manager
        .allocate_partition(&request(GUID_A, "big", grown, 0))
        .unwrap();
    partition
        .write_blocks((grown - 1) * BLOCKS_PER_SLICE, &pattern(BLOCK, 1))
        .unwrap();

    let manager = rebind(&manager, &mem);
    assert_eq!(manager.query_info().unwrap().slice_count, grown);
    let err = manager.grow(2048 * MIB).unwrap_err();
    assert!(matches!(err, UbifvmError::Bounds { .. }));
    assert_eq!(manager.query_info().unwrap().slice_count, grown);
}

#[test]
fn test_stale_handles_fail() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let second = manager.open_partition(&GUID_A).unwrap();
    let mut channel = second.channel().unwrap();
    partition.destroy().unwrap();

    assert!(matches!(
        second.extend(1, 1),
        Err(UbifvmError::BadState { .. })
    ));
    assert!(matches!(second.destroy(), Err(UbifvmError::BadState { .. })));
    let mut buf = vec![0u8; BLOCK];
    assert!(matches!(
        second.read_blocks(0, &mut buf),
        Err(UbifvmError::BadState { .. })
    ));
    channel.add_flush(1);
    assert!(matches!(channel.wait(1), Err(UbifvmError::BadState { .. })));
    assert_eq!(second.device().block_count(), 0);

    // The slot is reused with a new generation; the old handle stays dead.
    let fresh = manager
        .allocate_partition(&request(GUID_B, "data", 1, 0))
        .unwrap();
    assert_eq!(fresh.index(), second.index());
    assert!(matches!(second.info(), Err(UbifvmError::BadState { .. })));
    fresh.write_blocks(0, &pattern(BLOCK, 2)).unwrap();
}

#[test]
fn test_unbind_stops_everything() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    manager.unbind().unwrap();
    assert!(!manager.is_bound());
    assert_eq!(
        manager.query_info().unwrap_err().status(),
        Status::BadState
    );
    assert!(matches!(
        partition.write_blocks(0, &pattern(BLOCK, 0)),
        Err(UbifvmError::BadState { .. })
    ));
    assert!(manager.unbind().is_err());
}

#[test]
fn test_failed_commit_keeps_previous_state() {
    let mem = formatted();
    let failing = FailingBlockDevice::new(mem.clone_shared());
    let manager = VolumeManager::bind(BlockDevice::clone(&failing)).unwrap();
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    let info = manager.query_info().unwrap();

    failing.fail_next_write();
    let err = partition.extend(1, 4).unwrap_err();
    assert_eq!(err.status(), Status::Io);
    assert_eq!(manager.query_info().unwrap(), info);
    assert_eq!(partition.info().unwrap().slice_count, 1);

    failing.fail_next_flush();
    assert!(partition.destroy().is_err());
    assert!(partition.info().is_ok());
    assert_eq!(manager.query_info().unwrap(), info);
    partition.extend(1, 1).unwrap();
    assert_eq!(manager.query_info().unwrap().assigned_slice_count, 2);

    let manager = rebind(&manager, &mem);
    assert!(manager.open_partition(&GUID_A).is_ok());
    assert_eq!(manager.query_info().unwrap().assigned_slice_count, 2);
    assert_clean(&mem);
}

#[test]
fn test_set_name() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 1, 0))
        .unwrap();
    partition.set_name("renamed").unwrap();
    assert_eq!(partition.name().unwrap(), "renamed");
    assert!(matches!(
        partition.set_name(""),
        Err(UbifvmError::InvalidParameter { .. })
    ));
    let manager = rebind(&manager, &mem);
    assert_eq!(
        manager.open_partition(&GUID_A).unwrap().name().unwrap(),
        "renamed"
    );
}

#[test]
fn test_volume_info() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = manager
        .allocate_partition(&request(GUID_A, "data", 3, 0))
        .unwrap();
    let info = partition.volume_info().unwrap();
    assert_eq!(info.manager.slice_size, MIB);
    assert_eq!(info.manager.assigned_slice_count, 3);
    assert_eq!(info.manager.max_virtual_slice, MAX_VSLICES);
    assert_eq!(info.partition.slice_count, 3);
    assert_eq!(info.partition.name, "data");
}

#[test]
fn test_io_during_extend() {
    let mem = formatted();
    let manager = bind(&mem);
    let partition = Arc::new(
        manager
            .allocate_partition(&request(GUID_A, "data", 1, 0))
            .unwrap(),
    );

    let writer = {
        let partition = partition.clone();
        std::thread::spawn(move || {
            for i in 0..64u64 {
                let data = pattern(BLOCK, i as u8);
                partition.write_blocks(i, &data).unwrap();
                let mut read = vec![0u8; BLOCK];
                partition.read_blocks(i, &mut read).unwrap();
                assert_eq!(read, data);
            }
        })
    };
    for vslice in 1..8 {
        partition.extend(vslice, 1).unwrap();
    }
    writer.join().unwrap();
    assert_eq!(partition.info().unwrap().slice_count, 8);
    assert_clean(&mem);
}
