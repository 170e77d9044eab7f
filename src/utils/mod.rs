pub mod aligned_buffer;

pub use aligned_buffer::AlignedBuf;

/// Rounds `value` up to the next multiple of `multiple`.
pub const fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}
