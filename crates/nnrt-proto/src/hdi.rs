//! Driver interface, one module per protocol generation.
//!
//! Both generations exchange models in the wire format from
//! [`crate::wire`] and tensor memory as [`SharedBuffer`]s. They differ
//! in how failures are reported and in the capabilities they can
//! express.

use nnrt_core::SharedBuffer;

use crate::WireDType;

/// A bound input as the driver sees it.
#[derive(Debug)]
pub struct HdiTensor<'a> {
    pub dtype: WireDType,
    pub dims: Vec<i32>,
    pub buffer: &'a SharedBuffer,
    pub length: usize,
}

/// A bound output the driver writes into.
#[derive(Debug)]
pub struct HdiTensorMut<'a> {
    pub dtype: WireDType,
    pub dims: Vec<i32>,
    pub buffer: &'a mut SharedBuffer,
    pub length: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HdiRunOutput {
    pub dims: Vec<i32>,
    /// `false` when the bound buffer could not hold the produced tensor.
    pub sufficient: bool,
}

pub mod v1 {
    use nnrt_core::SharedBuffer;

    use super::{HdiRunOutput, HdiTensor, HdiTensorMut};
    use crate::WireDeviceType;

    pub const HDF_SUCCESS: i32 = 0;
    pub const HDF_FAILURE: i32 = -1;
    pub const HDF_ERR_NOT_SUPPORT: i32 = -2;
    pub const HDF_ERR_INVALID_PARAM: i32 = -3;
    pub const HDF_ERR_MALLOC_FAIL: i32 = -6;

    /// `Err` carries a negative `HDF_*` code.
    pub type HdiResult<T> = Result<T, i32>;

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct ModelConfig {
        pub enable_float16: bool,
        /// 0 none, 1 low, 2 medium, 3 high, 4 extreme.
        pub mode: u8,
        /// 0 none, 1 low, 2 medium, 3 high.
        pub priority: u8,
    }

    pub trait Driver: Send + Sync {
        fn device_name(&self) -> HdiResult<String>;
        fn vendor_name(&self) -> HdiResult<String>;
        fn driver_version(&self) -> HdiResult<String>;
        fn device_type(&self) -> HdiResult<WireDeviceType>;

        fn is_float16_precision_supported(&self) -> HdiResult<bool>;
        fn is_performance_mode_supported(&self) -> HdiResult<bool>;
        fn is_prioritization_supported(&self) -> HdiResult<bool>;
        fn is_model_cache_supported(&self) -> HdiResult<bool>;

        fn supported_operations(
            &self,
            model: &[u8],
            constants: Option<&SharedBuffer>,
        ) -> HdiResult<Vec<bool>>;

        fn allocate_buffer(&self, length: usize) -> HdiResult<SharedBuffer>;
        fn release_buffer(&self, buffer: SharedBuffer) -> HdiResult<()>;

        fn prepare_model(
            &self,
            model: &[u8],
            constants: Option<&SharedBuffer>,
            config: &ModelConfig,
        ) -> HdiResult<Box<dyn PreparedModel>>;

        fn prepare_model_from_cache(
            &self,
            cache: &[SharedBuffer],
            config: &ModelConfig,
        ) -> HdiResult<Box<dyn PreparedModel>>;
    }

    pub trait PreparedModel: Send + Sync {
        fn export_model_cache(&self) -> HdiResult<Vec<SharedBuffer>>;

        fn run(
            &self,
            inputs: &[HdiTensor<'_>],
            outputs: &mut [HdiTensorMut<'_>],
        ) -> HdiResult<Vec<HdiRunOutput>>;
    }
}

pub mod v2 {
    use nnrt_core::SharedBuffer;
    use thiserror::Error;

    use super::{HdiRunOutput, HdiTensor, HdiTensorMut};
    use crate::{WireDeviceType, WireError};

    pub const EXT_PROFILING: &str = "isProfiling";
    pub const EXT_SHARE_FEATURE_MAP: &str = "isShareFeatureMap";
    pub const EXT_INPUT_DIMS: &str = "InputDims";

    /// Encodes per-input dimensions as `<input>:<d0>,<d1>,...` entries
    /// joined by `;`, with `-1` marking a dynamic axis.
    pub fn encode_input_dims(dims: &[(usize, Vec<i64>)]) -> Vec<u8> {
        dims.iter()
            .map(|(input, dims)| {
                let dims = dims
                    .iter()
                    .map(i64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{input}:{dims}")
            })
            .collect::<Vec<_>>()
            .join(";")
            .into_bytes()
    }

    pub fn parse_input_dims(text: &str) -> Result<Vec<(usize, Vec<i64>)>, WireError> {
        let bad = |reason: String| WireError::BadExtension {
            name: EXT_INPUT_DIMS,
            reason,
        };
        let mut parsed: Vec<(usize, Vec<i64>)> = Vec::new();
        for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (input, dims) = entry
                .split_once(':')
                .ok_or_else(|| bad(format!("entry {entry:?} has no ':'")))?;
            let input: usize = input
                .trim()
                .parse()
                .map_err(|_| bad(format!("bad input index {input:?}")))?;
            if parsed.iter().any(|(seen, _)| *seen == input) {
                return Err(bad(format!("input {input} listed twice")));
            }
            let mut values = Vec::new();
            for dim in dims.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                let value: i64 = dim
                    .parse()
                    .map_err(|_| bad(format!("bad dimension {dim:?}")))?;
                if value == 0 || value < -1 {
                    return Err(bad(format!(
                        "dimension must be positive or -1, got {value}"
                    )));
                }
                values.push(value);
            }
            parsed.push((input, values));
        }
        Ok(parsed)
    }

    #[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
    pub enum NnrtStatus {
        #[error("driver failure")]
        Failed,
        #[error("invalid parameter")]
        InvalidParameter,
        #[error("driver memory error")]
        MemoryError,
        #[error("driver out of memory")]
        OutOfMemory,
        #[error("operation forbidden")]
        OperationForbidden,
        #[error("invalid file")]
        InvalidFile,
        #[error("not supported")]
        NotSupport,
        #[error("device error")]
        DeviceError,
        #[error("invalid model")]
        InvalidModel,
        #[error("invalid model cache")]
        InvalidModelCache,
        #[error("invalid performance mode")]
        InvalidPerformanceMode,
        #[error("invalid priority")]
        InvalidPriority,
        #[error("invalid shape")]
        InvalidShape,
        #[error("input dimensions out of range")]
        OutOfDimensionRanges,
    }

    pub type HdiResult<T> = Result<T, NnrtStatus>;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum DeviceStatus {
        Available,
        Busy,
        Offline,
        Unknown,
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct ModelConfig {
        pub enable_float16: bool,
        /// 0 none, 1 low, 2 medium, 3 high, 4 extreme.
        pub mode: u8,
        /// 0 none, 1 low, 2 medium, 3 high.
        pub priority: u8,
        /// Named driver-specific settings, e.g. `isProfiling`.
        pub extensions: Vec<(String, Vec<u8>)>,
    }

    impl ModelConfig {
        pub fn extension(&self, name: &str) -> Option<&[u8]> {
            self.extensions
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_slice())
        }
    }

    pub trait Driver: Send + Sync {
        fn device_name(&self) -> HdiResult<String>;
        fn vendor_name(&self) -> HdiResult<String>;
        fn driver_version(&self) -> HdiResult<String>;
        fn device_type(&self) -> HdiResult<WireDeviceType>;
        fn device_status(&self) -> HdiResult<DeviceStatus>;

        fn is_float16_precision_supported(&self) -> HdiResult<bool>;
        fn is_performance_mode_supported(&self) -> HdiResult<bool>;
        fn is_prioritization_supported(&self) -> HdiResult<bool>;
        fn is_dynamic_input_supported(&self) -> HdiResult<bool>;
        fn is_model_cache_supported(&self) -> HdiResult<bool>;

        fn supported_operations(
            &self,
            model: &[u8],
            constants: Option<&SharedBuffer>,
        ) -> HdiResult<Vec<bool>>;

        fn allocate_buffer(&self, length: usize) -> HdiResult<SharedBuffer>;
        fn release_buffer(&self, buffer: SharedBuffer) -> HdiResult<()>;

        fn prepare_model(
            &self,
            model: &[u8],
            constants: Option<&SharedBuffer>,
            config: &ModelConfig,
        ) -> HdiResult<Box<dyn PreparedModel>>;

        fn prepare_model_from_cache(
            &self,
            cache: &[SharedBuffer],
            config: &ModelConfig,
        ) -> HdiResult<Box<dyn PreparedModel>>;
    }

    pub trait PreparedModel: Send + Sync {
        fn export_model_cache(&self) -> HdiResult<Vec<SharedBuffer>>;

        /// Per input, per dimension `(min, max)` bounds.
        fn input_dim_ranges(&self) -> HdiResult<(Vec<Vec<u32>>, Vec<Vec<u32>>)>;

        fn run(
            &self,
            inputs: &[HdiTensor<'_>],
            outputs: &mut [HdiTensorMut<'_>],
        ) -> HdiResult<Vec<HdiRunOutput>>;
    }
}
