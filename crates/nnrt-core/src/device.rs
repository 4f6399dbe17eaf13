use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use half::f16;

use crate::{
    DType, Dim, IntermediateGraph, NnrtError, NnrtResult, QuantParams, SharedBuffer, TensorDesc,
};

/// Opaque, process-stable device handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Other,
    Cpu,
    Gpu,
    Accelerator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriverGeneration {
    V1,
    V2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub class: DeviceClass,
    pub generation: DriverGeneration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub float16: bool,
    pub performance_mode: bool,
    pub priority: bool,
    pub dynamic_input: bool,
    pub model_cache: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PerformanceMode {
    #[default]
    None,
    Low,
    Medium,
    High,
    Extreme,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// Pins or restates the dimensions of one graph input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputDimOverride {
    pub input: usize,
    pub dims: Vec<Dim>,
}

/// Configuration submitted to the driver alongside a model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelConfig {
    pub float16: bool,
    pub performance: PerformanceMode,
    pub priority: Priority,
    pub profiling: bool,
    pub shared_feature_map: bool,
    pub input_dims: Vec<InputDimOverride>,
}

/// How a tensor's client representation differs from its wire representation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TypeConversion {
    #[default]
    None,
    /// Half precision widened to single precision.
    Fp16ToFp32,
    /// Unsigned 8-bit quantized shifted to signed (zero point - 128).
    Uint8ToInt8,
    /// Booleans carried as unsigned bytes.
    BoolToUint8,
}

impl TypeConversion {
    pub fn wire_dtype(self, client: DType) -> DType {
        match self {
            TypeConversion::None => client,
            TypeConversion::Fp16ToFp32 => DType::F32,
            TypeConversion::Uint8ToInt8 => DType::I8,
            TypeConversion::BoolToUint8 => DType::U8,
        }
    }

    pub fn wire_quant(self, quant: &QuantParams) -> QuantParams {
        match self {
            TypeConversion::Uint8ToInt8 => QuantParams {
                zero_point: quant.zero_point.iter().map(|zp| zp - 128).collect(),
                ..quant.clone()
            },
            _ => quant.clone(),
        }
    }

    pub fn wire_len(self, client_len: usize) -> usize {
        match self {
            TypeConversion::Fp16ToFp32 => client_len * 2,
            _ => client_len,
        }
    }

    pub fn to_wire<'a>(self, client: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            TypeConversion::None => Cow::Borrowed(client),
            TypeConversion::Fp16ToFp32 => Cow::Owned(
                client
                    .chunks_exact(2)
                    .flat_map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32().to_le_bytes())
                    .collect(),
            ),
            TypeConversion::Uint8ToInt8 => Cow::Owned(client.iter().map(|b| b ^ 0x80).collect()),
            TypeConversion::BoolToUint8 => {
                Cow::Owned(client.iter().map(|b| u8::from(*b != 0)).collect())
            }
        }
    }

    pub fn from_wire<'a>(self, wire: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            TypeConversion::None => Cow::Borrowed(wire),
            TypeConversion::Fp16ToFp32 => Cow::Owned(
                wire.chunks_exact(4)
                    .flat_map(|b| {
                        f16::from_f32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])).to_le_bytes()
                    })
                    .collect(),
            ),
            TypeConversion::Uint8ToInt8 => Cow::Owned(wire.iter().map(|b| b ^ 0x80).collect()),
            TypeConversion::BoolToUint8 => {
                Cow::Owned(wire.iter().map(|b| u8::from(*b != 0)).collect())
            }
        }
    }
}

/// A graph in driver wire format plus its staged constant payloads.
#[derive(Debug)]
pub struct SerializedModel {
    pub generation: DriverGeneration,
    pub encoded: Bytes,
    /// `None` when the graph has no constant data.
    pub constants: Option<SharedBuffer>,
    pub operation_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DimRange {
    pub min: usize,
    pub max: usize,
}

impl DimRange {
    pub fn contains(&self, dim: usize) -> bool {
        (self.min..=self.max).contains(&dim)
    }
}

/// One bound input: wire-side descriptor with concrete dims plus its memory.
#[derive(Debug)]
pub struct IoTensor<'a> {
    pub desc: TensorDesc,
    pub buffer: &'a SharedBuffer,
    pub length: usize,
}

#[derive(Debug)]
pub struct IoTensorMut<'a> {
    pub desc: TensorDesc,
    pub buffer: &'a mut SharedBuffer,
    pub length: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutput {
    pub dims: Vec<usize>,
    /// `false` when the bound buffer was too small for the produced tensor.
    pub sufficient: bool,
}

/// One driver generation behind a single interface.
pub trait Device: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn capabilities(&self) -> DeviceCapabilities;

    /// Conversion applied to graph I/O of this descriptor on this device.
    fn io_conversion(&self, desc: &TensorDesc) -> NnrtResult<TypeConversion>;

    /// One flag per graph operation.
    fn supported_operations(&self, graph: &IntermediateGraph) -> NnrtResult<Vec<bool>>;

    fn serialize(&self, graph: &IntermediateGraph) -> NnrtResult<SerializedModel>;

    fn prepare_model(
        &self,
        model: &SerializedModel,
        config: &ModelConfig,
    ) -> NnrtResult<Box<dyn PreparedModel>>;

    fn prepare_from_cache(
        &self,
        buffers: &[Bytes],
        config: &ModelConfig,
    ) -> NnrtResult<Box<dyn PreparedModel>>;

    fn allocate_buffer(&self, len: usize) -> NnrtResult<SharedBuffer>;

    fn release_buffer(&self, buffer: SharedBuffer) -> NnrtResult<()>;
}

pub trait PreparedModel: Send + Sync {
    /// Opaque byte buffers suitable for on-disk persistence.
    fn export_cache(&self) -> NnrtResult<Vec<Bytes>>;

    /// Per input, per dimension ranges when the driver reports them.
    fn input_dim_ranges(&self) -> NnrtResult<Option<Vec<Vec<DimRange>>>>;

    fn run(
        &self,
        inputs: &[IoTensor<'_>],
        outputs: &mut [IoTensorMut<'_>],
    ) -> NnrtResult<Vec<RunOutput>>;
}

/// Rejects configurations that exceed what the device advertises.
pub fn check_config(caps: &DeviceCapabilities, config: &ModelConfig) -> NnrtResult<()> {
    if config.float16 && !caps.float16 {
        return Err(NnrtError::forbidden("device does not support float16 inference"));
    }
    if config.performance != PerformanceMode::None && !caps.performance_mode {
        return Err(NnrtError::forbidden(
            "device does not support performance mode settings",
        ));
    }
    if config.priority != Priority::None && !caps.priority {
        return Err(NnrtError::forbidden("device does not support priority settings"));
    }
    Ok(())
}
