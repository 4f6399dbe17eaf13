//! Client-facing runtime: device enumeration, compilation with an
//! on-disk model cache, and execution.

pub mod cache;
pub mod compilation;
pub mod device_manager;
pub mod executor;
pub mod extension;
pub mod identity;
pub mod partition;
pub mod status;

pub use cache::{checksum, CacheInfo, ModelCache};
pub use compilation::{Compilation, CompilationOptions};
pub use device_manager::{DeviceCreator, DeviceManager};
pub use executor::Executor;
pub use extension::Extensions;
pub use partition::{device_partitions, limit_partitions, supported_partitions, Partition};
pub use status::ReturnCode;
