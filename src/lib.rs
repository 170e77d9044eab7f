pub mod allocator;
pub mod block_device;
pub mod cli;
pub mod config;
pub mod error;
pub mod format;
pub mod manager;
pub mod metadata;
pub mod router;
pub mod rpc;
pub mod utils;
pub mod volume;

pub use error::{Error, ErrorLocation, ErrorMeta, Result, ResultExt, Status, UbifvmError};
pub use manager::{PartitionRequest, VPartition, VolumeManager};
pub use ubifvm_macros::error_context;
