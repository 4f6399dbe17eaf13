pub mod buffer;
pub mod device;
pub mod error;
pub mod graph;
pub mod ops;
pub mod tensor;

pub use buffer::*;
pub use device::*;
pub use error::*;
pub use graph::*;
pub use ops::*;
pub use tensor::*;
