//! Driver-facing half of the runtime: graph serialization and one
//! [`nnrt_core::Device`] implementation per driver generation.

pub mod mapping;
pub mod op_builder;
pub mod profile;
pub mod serialize;
mod transfer;
pub mod v1;
pub mod v2;

pub use mapping::TensorMapping;
pub use op_builder::OperationBuilder;
pub use profile::{ConversionFlags, GenerationProfile};
pub use serialize::{serialize_graph, SerializedGraph};
pub use v1::DeviceV1;
pub use v2::DeviceV2;
