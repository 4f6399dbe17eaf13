pub mod hdi;
pub mod wire;

pub use wire::*;
