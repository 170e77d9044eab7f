pub const SLICE_ENTRY_SIZE: usize = 8;

const PARTITION_BITS: u32 = 16;
const VSLICE_BITS: u32 = 32;
const PARTITION_MASK: u64 = (1 << PARTITION_BITS) - 1;
const VSLICE_MASK: u64 = (1 << VSLICE_BITS) - 1;

/// Allocation table entry: bits 0..16 hold the owning partition index
/// (0 means free), bits 16..48 the virtual slice. The top 16 bits are
/// reserved; they are ignored on read and written as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceEntry(u64);

impl SliceEntry {
    pub const FREE: SliceEntry = SliceEntry(0);

    pub fn new(partition_index: u16, vslice: u64) -> Self {
        debug_assert!(vslice <= VSLICE_MASK);
        SliceEntry((partition_index as u64) | ((vslice & VSLICE_MASK) << PARTITION_BITS))
    }

    pub fn partition_index(&self) -> u16 {
        (self.0 & PARTITION_MASK) as u16
    }

    pub fn vslice(&self) -> u64 {
        (self.0 >> PARTITION_BITS) & VSLICE_MASK
    }

    pub fn is_free(&self) -> bool {
        self.partition_index() == 0
    }

    pub fn raw(&self) -> u64 {
        self.0 & ((1 << (PARTITION_BITS + VSLICE_BITS)) - 1)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..SLICE_ENTRY_SIZE].copy_from_slice(&self.raw().to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut bytes = [0u8; SLICE_ENTRY_SIZE];
        bytes.copy_from_slice(&buf[..SLICE_ENTRY_SIZE]);
        SliceEntry(u64::from_le_bytes(bytes))
    }
}
