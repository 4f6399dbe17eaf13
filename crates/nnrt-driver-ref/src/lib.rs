//! In-process reference CPU driver speaking both protocol generations.
//!
//! It interprets wire models directly and backs every buffer it hands
//! out with an [`AllocationTracker`], which makes it the driver the
//! runtime tests and the `nnrtctl` demo run against.

mod kernels;
mod prepared;

use std::sync::Arc;

use bytes::Bytes;
use nnrt_core::{AllocationTracker, SharedBuffer};
use nnrt_proto::hdi::{v1, v2};
use nnrt_proto::{WireDeviceType, WireModel};
use tracing::{debug, warn};

pub use prepared::RefPreparedModel;

/// Failure injected into every prepare call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareFailure {
    /// The driver refuses the configuration (not supported).
    RejectConfig,
    /// The driver fails for an internal reason.
    Internal,
}

#[derive(Clone, Debug)]
pub struct RefDriverConfig {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device_type: WireDeviceType,
    pub float16: bool,
    pub performance_mode: bool,
    pub priority: bool,
    pub dynamic_input: bool,
    pub model_cache: bool,
    pub status: v2::DeviceStatus,
    pub prepare_failure: Option<PrepareFailure>,
    /// Upper bound reported for dynamic input dimensions.
    pub max_dynamic_dim: u32,
}

impl Default for RefDriverConfig {
    fn default() -> Self {
        Self {
            name: "ref-cpu".to_string(),
            vendor: "nnrt".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            device_type: WireDeviceType::Cpu,
            float16: true,
            performance_mode: true,
            priority: true,
            dynamic_input: true,
            model_cache: true,
            status: v2::DeviceStatus::Available,
            prepare_failure: None,
            max_dynamic_dim: 1024,
        }
    }
}

/// Settings a prepared model keeps from its configuration.
#[derive(Clone, Debug, Default)]
pub(crate) struct Settings {
    pub profiling: bool,
    pub input_dims: Vec<(usize, Vec<i64>)>,
}

enum PrepareError {
    Config(&'static str),
    Invalid(String),
    Internal,
}

pub struct RefDriver {
    config: RefDriverConfig,
    tracker: Arc<AllocationTracker>,
}

impl Default for RefDriver {
    fn default() -> Self {
        Self::new(RefDriverConfig::default())
    }
}

impl RefDriver {
    pub fn new(config: RefDriverConfig) -> Self {
        Self {
            config,
            tracker: Arc::new(AllocationTracker::new()),
        }
    }

    pub fn config(&self) -> &RefDriverConfig {
        &self.config
    }

    /// Counts every buffer this driver allocated and saw released.
    pub fn tracker(&self) -> Arc<AllocationTracker> {
        Arc::clone(&self.tracker)
    }

    fn check_settings(&self, float16: bool, mode: u8, priority: u8) -> Result<(), PrepareError> {
        if float16 && !self.config.float16 {
            return Err(PrepareError::Config("float16"));
        }
        if mode != 0 && !self.config.performance_mode {
            return Err(PrepareError::Config("performance mode"));
        }
        if priority != 0 && !self.config.priority {
            return Err(PrepareError::Config("priority"));
        }
        match self.config.prepare_failure {
            Some(PrepareFailure::RejectConfig) => Err(PrepareError::Config("injected")),
            Some(PrepareFailure::Internal) => Err(PrepareError::Internal),
            None => Ok(()),
        }
    }

    fn prepare(
        &self,
        model: &[u8],
        constants: Option<&[u8]>,
        settings: Settings,
    ) -> Result<RefPreparedModel, PrepareError> {
        let model = WireModel::decode(model).map_err(|err| PrepareError::Invalid(err.to_string()))?;
        let constants = Bytes::copy_from_slice(constants.unwrap_or_default());
        validate(&model, constants.len())?;
        if let Some(op) = model.ops.iter().find(|op| !kernels::is_supported(&model, op)) {
            return Err(PrepareError::Invalid(format!(
                "{:?} cannot run on this driver",
                op.code
            )));
        }
        debug!(
            version = model.version,
            ops = model.ops.len(),
            constant_bytes = constants.len(),
            profiling = settings.profiling,
            "reference model prepared"
        );
        Ok(RefPreparedModel::new(
            model,
            constants,
            settings,
            self.config.max_dynamic_dim,
            Arc::clone(&self.tracker),
        ))
    }

    /// Rebuilds a prepared model from the buffers `export_model_cache` produced.
    fn prepare_cached(
        &self,
        cache: &[SharedBuffer],
        settings: Settings,
    ) -> Result<RefPreparedModel, PrepareError> {
        let (model, constants) = match cache {
            [model] => (model.as_slice(), None),
            [model, constants] => (model.as_slice(), Some(constants.as_slice())),
            _ => {
                return Err(PrepareError::Invalid(format!(
                    "expected 1 or 2 cache buffers, got {}",
                    cache.len()
                )))
            }
        };
        self.prepare(model, constants, settings)
    }

    fn supported(&self, model: &[u8]) -> Option<Vec<bool>> {
        let model = WireModel::decode(model)
            .map_err(|err| warn!(%err, "support query on undecodable model"))
            .ok()?;
        Some(
            model
                .ops
                .iter()
                .map(|op| kernels::is_supported(&model, op))
                .collect(),
        )
    }

    fn allocate(&self, length: usize) -> Option<SharedBuffer> {
        SharedBuffer::allocate_tracked(length, Arc::clone(&self.tracker))
            .map_err(|err| warn!(%err, length, "reference allocation failed"))
            .ok()
    }
}

fn validate(model: &WireModel, constants_len: usize) -> Result<(), PrepareError> {
    for (index, tensor) in model.tensors.iter().enumerate() {
        if let Some(data) = tensor.data {
            if data.offset.saturating_add(data.len) > constants_len as u64 {
                return Err(PrepareError::Invalid(format!(
                    "tensor {index} data lies outside the constant blob"
                )));
            }
        }
    }
    if let Some(op) = model.ops.iter().find(|op| op.outputs.len() != 1) {
        return Err(PrepareError::Invalid(format!(
            "{:?} must have exactly one output",
            op.code
        )));
    }
    Ok(())
}

fn is_true(value: Option<&[u8]>) -> bool {
    matches!(value, Some(b"true") | Some(b"1"))
}

impl v1::Driver for RefDriver {
    fn device_name(&self) -> v1::HdiResult<String> {
        Ok(self.config.name.clone())
    }

    fn vendor_name(&self) -> v1::HdiResult<String> {
        Ok(self.config.vendor.clone())
    }

    fn driver_version(&self) -> v1::HdiResult<String> {
        Ok(self.config.version.clone())
    }

    fn device_type(&self) -> v1::HdiResult<WireDeviceType> {
        Ok(self.config.device_type)
    }

    fn is_float16_precision_supported(&self) -> v1::HdiResult<bool> {
        Ok(self.config.float16)
    }

    fn is_performance_mode_supported(&self) -> v1::HdiResult<bool> {
        Ok(self.config.performance_mode)
    }

    fn is_prioritization_supported(&self) -> v1::HdiResult<bool> {
        Ok(self.config.priority)
    }

    fn is_model_cache_supported(&self) -> v1::HdiResult<bool> {
        Ok(self.config.model_cache)
    }

    fn supported_operations(
        &self,
        model: &[u8],
        _constants: Option<&SharedBuffer>,
    ) -> v1::HdiResult<Vec<bool>> {
        self.supported(model).ok_or(v1::HDF_ERR_INVALID_PARAM)
    }

    fn allocate_buffer(&self, length: usize) -> v1::HdiResult<SharedBuffer> {
        self.allocate(length).ok_or(v1::HDF_ERR_MALLOC_FAIL)
    }

    fn release_buffer(&self, buffer: SharedBuffer) -> v1::HdiResult<()> {
        drop(buffer);
        Ok(())
    }

    fn prepare_model(
        &self,
        model: &[u8],
        constants: Option<&SharedBuffer>,
        config: &v1::ModelConfig,
    ) -> v1::HdiResult<Box<dyn v1::PreparedModel>> {
        self.check_settings(config.enable_float16, config.mode, config.priority)
            .and_then(|()| self.prepare(model, constants.map(SharedBuffer::as_slice), Settings::default()))
            .map(|prepared| Box::new(prepared) as Box<dyn v1::PreparedModel>)
            .map_err(v1_code)
    }

    fn prepare_model_from_cache(
        &self,
        cache: &[SharedBuffer],
        config: &v1::ModelConfig,
    ) -> v1::HdiResult<Box<dyn v1::PreparedModel>> {
        self.check_settings(config.enable_float16, config.mode, config.priority)
            .and_then(|()| self.prepare_cached(cache, Settings::default()))
            .map(|prepared| Box::new(prepared) as Box<dyn v1::PreparedModel>)
            .map_err(v1_code)
    }
}

fn v1_code(err: PrepareError) -> i32 {
    match err {
        PrepareError::Config(what) => {
            warn!(what, "configuration rejected");
            v1::HDF_ERR_NOT_SUPPORT
        }
        PrepareError::Invalid(reason) => {
            warn!(%reason, "model rejected");
            v1::HDF_ERR_INVALID_PARAM
        }
        PrepareError::Internal => v1::HDF_FAILURE,
    }
}

fn v2_status(err: PrepareError) -> v2::NnrtStatus {
    match err {
        PrepareError::Config("performance mode") => v2::NnrtStatus::InvalidPerformanceMode,
        PrepareError::Config("priority") => v2::NnrtStatus::InvalidPriority,
        PrepareError::Config(what) => {
            warn!(what, "configuration rejected");
            v2::NnrtStatus::NotSupport
        }
        PrepareError::Invalid(reason) => {
            warn!(%reason, "model rejected");
            v2::NnrtStatus::InvalidModel
        }
        PrepareError::Internal => v2::NnrtStatus::Failed,
    }
}

fn v2_settings(config: &v2::ModelConfig) -> Result<Settings, PrepareError> {
    let input_dims = match config.extension(v2::EXT_INPUT_DIMS) {
        Some(raw) => {
            let text = std::str::from_utf8(raw)
                .map_err(|_| PrepareError::Invalid("InputDims is not UTF-8".to_string()))?;
            v2::parse_input_dims(text).map_err(|err| PrepareError::Invalid(err.to_string()))?
        }
        None => Vec::new(),
    };
    Ok(Settings {
        profiling: is_true(config.extension(v2::EXT_PROFILING)),
        input_dims,
    })
}

impl v2::Driver for RefDriver {
    fn device_name(&self) -> v2::HdiResult<String> {
        Ok(self.config.name.clone())
    }

    fn vendor_name(&self) -> v2::HdiResult<String> {
        Ok(self.config.vendor.clone())
    }

    fn driver_version(&self) -> v2::HdiResult<String> {
        Ok(self.config.version.clone())
    }

    fn device_type(&self) -> v2::HdiResult<WireDeviceType> {
        Ok(self.config.device_type)
    }

    fn device_status(&self) -> v2::HdiResult<v2::DeviceStatus> {
        Ok(self.config.status)
    }

    fn is_float16_precision_supported(&self) -> v2::HdiResult<bool> {
        Ok(self.config.float16)
    }

    fn is_performance_mode_supported(&self) -> v2::HdiResult<bool> {
        Ok(self.config.performance_mode)
    }

    fn is_prioritization_supported(&self) -> v2::HdiResult<bool> {
        Ok(self.config.priority)
    }

    fn is_dynamic_input_supported(&self) -> v2::HdiResult<bool> {
        Ok(self.config.dynamic_input)
    }

    fn is_model_cache_supported(&self) -> v2::HdiResult<bool> {
        Ok(self.config.model_cache)
    }

    fn supported_operations(
        &self,
        model: &[u8],
        _constants: Option<&SharedBuffer>,
    ) -> v2::HdiResult<Vec<bool>> {
        self.supported(model).ok_or(v2::NnrtStatus::InvalidModel)
    }

    fn allocate_buffer(&self, length: usize) -> v2::HdiResult<SharedBuffer> {
        self.allocate(length).ok_or(v2::NnrtStatus::OutOfMemory)
    }

    fn release_buffer(&self, buffer: SharedBuffer) -> v2::HdiResult<()> {
        drop(buffer);
        Ok(())
    }

    fn prepare_model(
        &self,
        model: &[u8],
        constants: Option<&SharedBuffer>,
        config: &v2::ModelConfig,
    ) -> v2::HdiResult<Box<dyn v2::PreparedModel>> {
        self.check_settings(config.enable_float16, config.mode, config.priority)
            .and_then(|()| v2_settings(config))
            .and_then(|settings| self.prepare(model, constants.map(SharedBuffer::as_slice), settings))
            .map(|prepared| Box::new(prepared) as Box<dyn v2::PreparedModel>)
            .map_err(v2_status)
    }

    fn prepare_model_from_cache(
        &self,
        cache: &[SharedBuffer],
        config: &v2::ModelConfig,
    ) -> v2::HdiResult<Box<dyn v2::PreparedModel>> {
        self.check_settings(config.enable_float16, config.mode, config.priority)
            .and_then(|()| v2_settings(config))
            .and_then(|settings| self.prepare_cached(cache, settings))
            .map(|prepared| Box::new(prepared) as Box<dyn v2::PreparedModel>)
            .map_err(v2_status)
    }
}
