use log::{debug, error, info};
use ubifvm_macros::error_context;

use super::{load_metadata, Metadata, Slot};
use crate::block_device::{flush, write_at, BlockDevice};
use crate::error::ResultExt;
use crate::format::{
    Geometry, DEFAULT_MAX_PARTITIONS, DEFAULT_SLICE_SIZE, MAX_VSLICES, METADATA_BLOCK_SIZE,
};
use crate::{fvm_error, Result};

/// Parameters of a fresh volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    pub slice_size: u64,
    /// Allocation table capacity. Defaults to the number of slices the
    /// device could hold if it carried no metadata.
    pub max_pslices: Option<u64>,
    /// Partition table entries, slot 0 included.
    pub max_partitions: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            slice_size: DEFAULT_SLICE_SIZE,
            max_pslices: None,
            max_partitions: DEFAULT_MAX_PARTITIONS,
        }
    }
}

impl FormatOptions {
    fn validate(&self, device: &dyn BlockDevice) -> Result<u64> {
        let block_size = device.block_size() as u64;
        if METADATA_BLOCK_SIZE % block_size != 0 {
            return Err(fvm_error!(InvalidParameter {
                description: format!("device block size {block_size} does not divide {METADATA_BLOCK_SIZE}"),
            }));
        }
        if self.slice_size == 0 || self.slice_size % METADATA_BLOCK_SIZE != 0 {
            return Err(fvm_error!(InvalidParameter {
                description: format!(
                    "slice size {} is not a non-zero multiple of {METADATA_BLOCK_SIZE}",
                    self.slice_size
                ),
            }));
        }
        if !(2..=1 << 16).contains(&self.max_partitions) {
            return Err(fvm_error!(InvalidParameter {
                description: format!(
                    "partition table size {} must be between 2 and 65536",
                    self.max_partitions
                ),
            }));
        }
        let max_pslices = self
            .max_pslices
            .unwrap_or(device.size_bytes() / self.slice_size);
        if max_pslices == 0 || max_pslices >= MAX_VSLICES {
            return Err(fvm_error!(InvalidParameter {
                description: format!("slice capacity {max_pslices} is out of range"),
            }));
        }
        Ok(max_pslices)
    }
}

/// Owns the two on-disk metadata copies. The active copy is the committed
/// state; the staging copy mirrors it and is only ever written to the
/// inactive slot.
pub struct MetadataStore {
    device: Box<dyn BlockDevice>,
    active_slot: Slot,
    active: Metadata,
    staging: Metadata,
}

impl MetadataStore {
    /// Writes a fresh, empty volume to `device`. Nothing is written when the
    /// device cannot hold both metadata copies and one slice.
    #[error_context("formatting device")]
    pub fn format(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Geometry> {
        let max_pslices = options.validate(device)?;
        let geometry = Geometry::for_format(options.slice_size, max_pslices, options.max_partitions);
        let device_size = device.size_bytes();
        let required = geometry.data_start() + geometry.slice_size;
        if device_size < required {
            error!("Device of {device_size} bytes cannot hold a volume needing {required} bytes");
            return Err(fvm_error!(TooSmall {
                required,
                available: device_size,
            }));
        }
        let pslice_count = max_pslices.min(geometry.pslices_fitting(device_size));

        let mut primary = Metadata::new(&geometry, pslice_count);
        primary.header.generation = 1;
        let mut secondary = Metadata::new(&geometry, pslice_count);

        let mut channel = device.create_channel()?;
        let block_size = device.block_size();
        write_at(
            channel.as_mut(),
            block_size,
            Slot::Secondary.offset(&geometry),
            &secondary.encode(),
        )?;
        write_at(
            channel.as_mut(),
            block_size,
            Slot::Primary.offset(&geometry),
            &primary.encode(),
        )?;
        flush(channel.as_mut())?;

        info!(
            "Formatted volume: {pslice_count} slices of {} bytes, {} metadata bytes per copy, capacity {} slices",
            geometry.slice_size,
            geometry.metadata_size(),
            geometry.max_pslices()
        );
        Ok(geometry)
    }

    #[error_context("opening metadata store")]
    pub fn open(device: Box<dyn BlockDevice>) -> Result<Self> {
        let loaded = load_metadata(device.as_ref())?;
        let staging = loaded.active.clone();
        Ok(MetadataStore {
            device,
            active_slot: loaded.active_slot,
            active: loaded.active,
            staging,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.active
    }

    pub fn geometry(&self) -> Geometry {
        self.active.geometry()
    }

    pub fn active_slot(&self) -> Slot {
        self.active_slot
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    /// Applies `mutate` to the staging copy with the generation already
    /// bumped, writes it to the inactive slot and flushes. The staging copy
    /// becomes active only once the flush succeeds; on any failure it is
    /// reset to the active copy and nothing in memory changes.
    pub fn commit<R>(&mut self, mutate: impl FnOnce(&mut Metadata) -> Result<R>) -> Result<R> {
        let generation = self.active.generation() + 1;
        self.staging.header.generation = generation;
        let value = match mutate(&mut self.staging) {
            Ok(value) => value,
            Err(e) => {
                self.staging = self.active.clone();
                return Err(e);
            }
        };
        debug_assert_eq!(self.staging.geometry(), self.active.geometry());

        let target = self.active_slot.other();
        if let Err(e) = self.write_staging(target) {
            error!("Failed to commit metadata generation {generation}: {e}");
            self.staging = self.active.clone();
            return Err(e.context(format!("committing metadata generation {generation}")));
        }

        std::mem::swap(&mut self.active, &mut self.staging);
        self.active_slot = target;
        self.staging = self.active.clone();
        debug!("Committed metadata generation {generation} to the {target} copy");
        Ok(value)
    }

    /// Extends `pslice_count` to what a device of `device_size` bytes can
    /// hold. Returns the new count, or `None` when nothing changed. A full
    /// allocation table is left alone; a device that needs more entries
    /// than a partly used table holds is a `Bounds` error.
    #[error_context("growing volume to {device_size} bytes")]
    pub fn grow(&mut self, device_size: u64) -> Result<Option<u64>> {
        let geometry = self.geometry();
        let current = self.active.pslice_count();
        let capacity = geometry.max_pslices();
        let fitting = geometry.pslices_fitting(device_size);
        if fitting <= current || current == capacity {
            debug!("Grow to {device_size} bytes leaves {current} slices unchanged");
            return Ok(None);
        }
        if fitting > capacity {
            return Err(fvm_error!(Bounds {
                required: fitting,
                capacity,
            }));
        }
        self.commit(|metadata| {
            metadata.header.pslice_count = fitting;
            Ok(())
        })?;
        info!("Volume grew from {current} to {fitting} slices");
        Ok(Some(fitting))
    }

    fn write_staging(&mut self, slot: Slot) -> Result<()> {
        let image = self.staging.encode();
        let offset = slot.offset(&self.staging.geometry());
        let mut channel = self.device.create_channel()?;
        write_at(channel.as_mut(), self.device.block_size(), offset, &image)
            .context("writing metadata copy")?;
        flush(channel.as_mut()).context("flushing metadata copy")
    }
}
