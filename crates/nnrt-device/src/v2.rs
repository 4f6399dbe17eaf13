//! Devices behind a generation 2 driver.

use std::sync::Arc;

use bytes::Bytes;
use nnrt_core::{
    Device, DeviceCapabilities, DeviceInfo, DimRange, DriverGeneration, IntermediateGraph,
    IoTensor, IoTensorMut, ModelConfig, NnrtError, NnrtResult, PreparedModel, RunOutput,
    SerializedModel, SharedBuffer, TensorDesc, TypeConversion,
};
use nnrt_proto::hdi::v2::{
    self, encode_input_dims, DeviceStatus, NnrtStatus, EXT_INPUT_DIMS, EXT_PROFILING,
    EXT_SHARE_FEATURE_MAP,
};
use tracing::{info, warn};

use crate::mapping::conversion_for;
use crate::profile::GenerationProfile;
use crate::transfer::{
    allocate, check_generation, device_class, export_cache, hdi_inputs, hdi_outputs,
    performance_code, priority_code, query, release, run_outputs, serialize_for,
    supported_operations, with_staged_cache,
};

const PROFILE: &GenerationProfile = &GenerationProfile::V2;

fn prepare_error(status: NnrtStatus) -> NnrtError {
    match status {
        NnrtStatus::NotSupport
        | NnrtStatus::InvalidPerformanceMode
        | NnrtStatus::InvalidPriority => NnrtError::unavailable(format!(
            "driver rejected the model configuration: {status}"
        )),
        other => NnrtError::failed(format!("driver failed to prepare the model: {other}")),
    }
}

fn run_error(status: NnrtStatus) -> NnrtError {
    match status {
        NnrtStatus::InvalidParameter
        | NnrtStatus::InvalidShape
        | NnrtStatus::OutOfDimensionRanges => {
            NnrtError::invalid_argument(format!("driver rejected the bound tensors: {status}"))
        }
        NnrtStatus::MemoryError | NnrtStatus::OutOfMemory => {
            NnrtError::memory(format!("driver run failed: {status}"))
        }
        other => NnrtError::failed(format!("driver run failed: {other}")),
    }
}

fn flag(value: bool) -> Vec<u8> {
    if value { b"true".to_vec() } else { b"false".to_vec() }
}

fn driver_config(config: &ModelConfig) -> v2::ModelConfig {
    let mut extensions = vec![
        (EXT_PROFILING.to_string(), flag(config.profiling)),
        (EXT_SHARE_FEATURE_MAP.to_string(), flag(config.shared_feature_map)),
    ];
    if !config.input_dims.is_empty() {
        let dims: Vec<(usize, Vec<i64>)> = config
            .input_dims
            .iter()
            .map(|o| {
                let dims = o
                    .dims
                    .iter()
                    .map(|d| d.map_or(-1, |d| d as i64))
                    .collect();
                (o.input, dims)
            })
            .collect();
        extensions.push((EXT_INPUT_DIMS.to_string(), encode_input_dims(&dims)));
    }
    v2::ModelConfig {
        enable_float16: config.float16,
        mode: performance_code(config.performance),
        priority: priority_code(config.priority),
        extensions,
    }
}

pub struct DeviceV2 {
    driver: Arc<dyn v2::Driver>,
    info: DeviceInfo,
    caps: DeviceCapabilities,
}

impl DeviceV2 {
    /// Connects to the driver; an offline device is `Unavailable`.
    pub fn new(driver: Arc<dyn v2::Driver>) -> NnrtResult<Self> {
        let info = DeviceInfo {
            name: query(driver.device_name(), "device name")?,
            vendor: query(driver.vendor_name(), "vendor name")?,
            version: query(driver.driver_version(), "driver version")?,
            class: device_class(query(driver.device_type(), "device type")?),
            generation: DriverGeneration::V2,
        };
        match query(driver.device_status(), "device status")? {
            DeviceStatus::Offline => {
                return Err(NnrtError::unavailable(format!(
                    "device {} is offline",
                    info.name
                )))
            }
            DeviceStatus::Busy | DeviceStatus::Unknown => {
                warn!(name = %info.name, "device reports it is not idle")
            }
            DeviceStatus::Available => {}
        }
        let caps = DeviceCapabilities {
            float16: query(driver.is_float16_precision_supported(), "float16")?,
            performance_mode: query(driver.is_performance_mode_supported(), "performance mode")?,
            priority: query(driver.is_prioritization_supported(), "priority")?,
            dynamic_input: query(driver.is_dynamic_input_supported(), "dynamic input")?,
            model_cache: query(driver.is_model_cache_supported(), "model cache")?,
        };
        info!(name = %info.name, vendor = %info.vendor, "generation 2 device connected");
        Ok(Self { driver, info, caps })
    }

    fn wrap(&self, inner: Box<dyn v2::PreparedModel>) -> Box<dyn PreparedModel> {
        Box::new(PreparedModelV2 {
            inner,
            driver: Arc::clone(&self.driver),
        })
    }
}

impl Device for DeviceV2 {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn io_conversion(&self, desc: &TensorDesc) -> NnrtResult<TypeConversion> {
        conversion_for(desc, PROFILE.conversions).map(|(_, conversion)| conversion)
    }

    fn supported_operations(&self, graph: &IntermediateGraph) -> NnrtResult<Vec<bool>> {
        supported_operations(self, graph, |model, constants| {
            self.driver.supported_operations(model, constants)
        })
    }

    fn serialize(&self, graph: &IntermediateGraph) -> NnrtResult<SerializedModel> {
        serialize_for(self, graph, PROFILE)
    }

    fn prepare_model(
        &self,
        model: &SerializedModel,
        config: &ModelConfig,
    ) -> NnrtResult<Box<dyn PreparedModel>> {
        check_generation(model, PROFILE)?;
        let inner = self
            .driver
            .prepare_model(&model.encoded, model.constants.as_ref(), &driver_config(config))
            .map_err(prepare_error)?;
        Ok(self.wrap(inner))
    }

    fn prepare_from_cache(
        &self,
        buffers: &[Bytes],
        config: &ModelConfig,
    ) -> NnrtResult<Box<dyn PreparedModel>> {
        let config = driver_config(config);
        let prepared = with_staged_cache(self, buffers, |staged| {
            self.driver.prepare_model_from_cache(staged, &config)
        })?;
        Ok(self.wrap(prepared.map_err(prepare_error)?))
    }

    fn allocate_buffer(&self, len: usize) -> NnrtResult<SharedBuffer> {
        allocate(len, |len| self.driver.allocate_buffer(len))
    }

    fn release_buffer(&self, buffer: SharedBuffer) -> NnrtResult<()> {
        release(self.driver.release_buffer(buffer))
    }
}

struct PreparedModelV2 {
    inner: Box<dyn v2::PreparedModel>,
    driver: Arc<dyn v2::Driver>,
}

impl PreparedModel for PreparedModelV2 {
    fn export_cache(&self) -> NnrtResult<Vec<Bytes>> {
        export_cache(self.inner.export_model_cache(), |buffer| {
            self.driver.release_buffer(buffer)
        })
    }

    fn input_dim_ranges(&self) -> NnrtResult<Option<Vec<Vec<DimRange>>>> {
        let (mins, maxs) = match self.inner.input_dim_ranges() {
            Ok(ranges) => ranges,
            Err(NnrtStatus::NotSupport) => return Ok(None),
            Err(status) => {
                return Err(NnrtError::failed(format!(
                    "driver failed to report input ranges: {status}"
                )))
            }
        };
        if mins.len() != maxs.len() {
            return Err(NnrtError::failed("driver reported mismatched input ranges"));
        }
        mins.iter()
            .zip(&maxs)
            .map(|(min, max)| {
                if min.len() != max.len() {
                    return Err(NnrtError::failed("driver reported mismatched input ranges"));
                }
                Ok(min
                    .iter()
                    .zip(max)
                    .map(|(min, max)| DimRange {
                        min: *min as usize,
                        max: *max as usize,
                    })
                    .collect())
            })
            .collect::<NnrtResult<Vec<_>>>()
            .map(Some)
    }

    fn run(
        &self,
        inputs: &[IoTensor<'_>],
        outputs: &mut [IoTensorMut<'_>],
    ) -> NnrtResult<Vec<RunOutput>> {
        let expected = outputs.len();
        let inputs = hdi_inputs(inputs)?;
        let mut outputs = hdi_outputs(outputs)?;
        let results = self.inner.run(&inputs, &mut outputs).map_err(run_error)?;
        run_outputs(results, expected)
    }
}
