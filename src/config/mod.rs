mod device;

pub use device::{FormatConfig, IoEngine, ManagerConfig};
