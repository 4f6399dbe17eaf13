//! Devices behind a generation 1 driver.

use std::sync::Arc;

use bytes::Bytes;
use nnrt_core::{
    Device, DeviceCapabilities, DeviceInfo, DimRange, DriverGeneration, IntermediateGraph,
    IoTensor, IoTensorMut, ModelConfig, NnrtError, NnrtResult, PreparedModel, RunOutput,
    SerializedModel, SharedBuffer, TensorDesc, TypeConversion,
};
use nnrt_proto::hdi::v1::{self, HDF_ERR_INVALID_PARAM, HDF_ERR_NOT_SUPPORT};
use tracing::{debug, info};

use crate::mapping::conversion_for;
use crate::profile::GenerationProfile;
use crate::transfer::{
    allocate, check_generation, device_class, export_cache, hdi_inputs, hdi_outputs,
    performance_code, priority_code, query, release, run_outputs, serialize_for,
    supported_operations, with_staged_cache,
};

const PROFILE: &GenerationProfile = &GenerationProfile::V1;

fn prepare_error(code: i32) -> NnrtError {
    match code {
        HDF_ERR_NOT_SUPPORT => {
            NnrtError::unavailable("driver rejected the model configuration")
        }
        other => NnrtError::failed(format!("driver failed to prepare the model (code {other})")),
    }
}

fn driver_config(config: &ModelConfig) -> v1::ModelConfig {
    if config.profiling || config.shared_feature_map || !config.input_dims.is_empty() {
        debug!("generation 1 drivers ignore profiling, feature-map sharing and input dims");
    }
    v1::ModelConfig {
        enable_float16: config.float16,
        mode: performance_code(config.performance),
        priority: priority_code(config.priority),
    }
}

pub struct DeviceV1 {
    driver: Arc<dyn v1::Driver>,
    info: DeviceInfo,
    caps: DeviceCapabilities,
}

impl DeviceV1 {
    pub fn new(driver: Arc<dyn v1::Driver>) -> NnrtResult<Self> {
        let info = DeviceInfo {
            name: query(driver.device_name(), "device name")?,
            vendor: query(driver.vendor_name(), "vendor name")?,
            version: query(driver.driver_version(), "driver version")?,
            class: device_class(query(driver.device_type(), "device type")?),
            generation: DriverGeneration::V1,
        };
        let caps = DeviceCapabilities {
            float16: query(driver.is_float16_precision_supported(), "float16")?,
            performance_mode: query(driver.is_performance_mode_supported(), "performance mode")?,
            priority: query(driver.is_prioritization_supported(), "priority")?,
            dynamic_input: false,
            model_cache: query(driver.is_model_cache_supported(), "model cache")?,
        };
        info!(name = %info.name, vendor = %info.vendor, "generation 1 device connected");
        Ok(Self { driver, info, caps })
    }

    fn wrap(&self, inner: Box<dyn v1::PreparedModel>) -> Box<dyn PreparedModel> {
        Box::new(PreparedModelV1 {
            inner,
            driver: Arc::clone(&self.driver),
        })
    }
}

impl Device for DeviceV1 {
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

struct PreparedModelV1 {
    inner: Box<dyn v1::PreparedModel>,
    driver: Arc<dyn v1::Driver>,
}

impl PreparedModel for PreparedModelV1 {
    fn export_cache(&self) -> NnrtResult<Vec<Bytes>> {
        export_cache(self.inner.export_model_cache(), |buffer| {
            self.driver.release_buffer(buffer)
        })
    }

    fn input_dim_ranges(&self) -> NnrtResult<Option<Vec<Vec<DimRange>>>> {
        Ok(None)
    }

    fn run(
        &self,
        inputs: &[IoTensor<'_>],
        outputs: &mut [IoTensorMut<'_>],
    ) -> NnrtResult<Vec<RunOutput>> {
        let expected = outputs.len();
        let inputs = hdi_inputs(inputs)?;
        let mut outputs = hdi_outputs(outputs)?;
        let results = self
            .inner
            .run(&inputs, &mut outputs)
            .map_err(|code| match code {
                HDF_ERR_INVALID_PARAM => {
                    NnrtError::invalid_argument("driver rejected the bound tensors")
                }
                other => NnrtError::failed(format!("driver run failed with code {other}")),
            })?;
        run_outputs(results, expected)
    }
}
