//! Conversions and driver call sequences shared by both driver
//! generations. Each generation keeps only its own status mapping.

use bytes::Bytes;
use nnrt_core::{
    Device, DeviceClass, IntermediateGraph, IoTensor, IoTensorMut, NnrtError, NnrtResult,
    PerformanceMode, Priority, RunOutput, SerializedModel, SharedBuffer, TensorDesc,
};
use nnrt_proto::hdi::v2::NnrtStatus;
use nnrt_proto::hdi::{HdiRunOutput, HdiTensor, HdiTensorMut};
use nnrt_proto::WireDeviceType;
use tracing::warn;

use crate::mapping::wire_dtype;
use crate::op_builder::wire_dims;
use crate::profile::GenerationProfile;
use crate::serialize::serialize_graph;

/// Failure reported by a driver call.
pub(crate) trait DriverStatus: Copy {
    fn describe(self) -> String;
}

/// Generation 1 drivers return raw HDF codes.
impl DriverStatus for i32 {
    fn describe(self) -> String {
        format!("code {self}")
    }
}

impl DriverStatus for NnrtStatus {
    fn describe(self) -> String {
        self.to_string()
    }
}

pub(crate) fn driver_failed<S: DriverStatus>(what: &str, status: S) -> NnrtError {
    NnrtError::failed(format!("{what} failed: {}", status.describe()))
}

pub(crate) fn query<T, S: DriverStatus>(result: Result<T, S>, what: &str) -> NnrtResult<T> {
    result.map_err(|status| driver_failed(&format!("driver query {what}"), status))
}

pub(crate) fn serialize_for(
    device: &dyn Device,
    graph: &IntermediateGraph,
    profile: &'static GenerationProfile,
) -> NnrtResult<SerializedModel> {
    let serialized = serialize_graph(graph, profile, |len| device.allocate_buffer(len))?;
    Ok(SerializedModel {
        generation: profile.generation,
        encoded: serialized.model.encode(),
        constants: serialized.constants,
        operation_count: serialized.model.ops.len(),
    })
}

pub(crate) fn check_generation(
    model: &SerializedModel,
    profile: &GenerationProfile,
) -> NnrtResult<()> {
    if model.generation != profile.generation {
        return Err(NnrtError::invalid_argument(
            "model was serialized for a different driver generation",
        ));
    }
    Ok(())
}

/// Serializes `graph`, asks the driver which operations it supports and
/// hands the serialized constants back whatever the answer.
pub(crate) fn supported_operations<S: DriverStatus>(
    device: &dyn Device,
    graph: &IntermediateGraph,
    ask: impl FnOnce(&[u8], Option<&SharedBuffer>) -> Result<Vec<bool>, S>,
) -> NnrtResult<Vec<bool>> {
    let model = device.serialize(graph)?;
    let supported = ask(&model.encoded, model.constants.as_ref())
        .map_err(|status| driver_failed("driver support query", status));
    if let Some(constants) = model.constants {
        device.release_buffer(constants)?;
    }
    let supported = supported?;
    if supported.len() != model.operation_count {
        return Err(NnrtError::failed(format!(
            "driver answered for {} operations, graph has {}",
            supported.len(),
            model.operation_count
        )));
    }
    Ok(supported)
}

fn release_staged(device: &dyn Device, staged: Vec<SharedBuffer>) {
    for buffer in staged {
        if let Err(err) = device.release_buffer(buffer) {
            warn!(%err, "failed to release staged cache buffer");
        }
    }
}

/// Copies cache files into device buffers for the length of `prepare`.
pub(crate) fn with_staged_cache<T>(
    device: &dyn Device,
    files: &[Bytes],
    prepare: impl FnOnce(&[SharedBuffer]) -> T,
) -> NnrtResult<T> {
    let mut staged = Vec::with_capacity(files.len());
    for bytes in files {
        match device.allocate_buffer(bytes.len()) {
            Ok(mut buffer) => {
                buffer.as_mut_slice().copy_from_slice(bytes);
                staged.push(buffer);
            }
            Err(err) => {
                release_staged(device, staged);
                return Err(err);
            }
        }
    }
    let prepared = prepare(&staged);
    release_staged(device, staged);
    Ok(prepared)
}

pub(crate) fn allocate<S: DriverStatus>(
    len: usize,
    allocate: impl FnOnce(usize) -> Result<SharedBuffer, S>,
) -> NnrtResult<SharedBuffer> {
    if len == 0 {
        return Err(NnrtError::invalid_argument("buffer length must be non-zero"));
    }
    allocate(len).map_err(|status| {
        NnrtError::memory(format!(
            "driver failed to allocate {len} bytes: {}",
            status.describe()
        ))
    })
}

pub(crate) fn release<S: DriverStatus>(result: Result<(), S>) -> NnrtResult<()> {
    result.map_err(|status| driver_failed("driver buffer release", status))
}

/// Copies exported cache buffers out and returns them to the driver.
pub(crate) fn export_cache<S: DriverStatus>(
    exported: Result<Vec<SharedBuffer>, S>,
    release: impl Fn(SharedBuffer) -> Result<(), S>,
) -> NnrtResult<Vec<Bytes>> {
    let buffers = exported.map_err(|status| driver_failed("driver cache export", status))?;
    let copies = buffers
        .iter()
        .map(|buffer| Bytes::copy_from_slice(buffer.as_slice()))
        .collect();
    for buffer in buffers {
        if let Err(status) = release(buffer) {
            warn!(status = %status.describe(), "failed to release exported cache buffer");
        }
    }
    Ok(copies)
}

pub(crate) fn device_class(kind: WireDeviceType) -> DeviceClass {
    match kind {
        WireDeviceType::Other => DeviceClass::Other,
        WireDeviceType::Cpu => DeviceClass::Cpu,
        WireDeviceType::Gpu => DeviceClass::Gpu,
        WireDeviceType::Accelerator => DeviceClass::Accelerator,
    }
}

pub(crate) fn performance_code(mode: PerformanceMode) -> u8 {
    match mode {
        PerformanceMode::None => 0,
        PerformanceMode::Low => 1,
        PerformanceMode::Medium => 2,
        PerformanceMode::High => 3,
        PerformanceMode::Extreme => 4,
    }
}

pub(crate) fn priority_code(priority: Priority) -> u8 {
    match priority {
        Priority::None => 0,
        Priority::Low => 1,
        Priority::Medium => 2,
        Priority::High => 3,
    }
}

fn concrete_dims(desc: &TensorDesc) -> NnrtResult<Vec<i32>> {
    desc.shape
        .dims()
        .iter()
        .map(|dim| {
            dim.and_then(|d| i32::try_from(d).ok()).ok_or_else(|| {
                NnrtError::invalid_argument(format!(
                    "bound tensor needs concrete dimensions, got {:?}",
                    desc.shape.dims()
                ))
            })
        })
        .collect()
}

pub(crate) fn hdi_inputs<'a>(inputs: &'a [IoTensor<'_>]) -> NnrtResult<Vec<HdiTensor<'a>>> {
    inputs
        .iter()
        .map(|io| {
            Ok(HdiTensor {
                dtype: wire_dtype(io.desc.dtype)?,
                dims: concrete_dims(&io.desc)?,
                buffer: io.buffer,
                length: io.length,
            })
        })
        .collect()
}

pub(crate) fn hdi_outputs<'a>(
    outputs: &'a mut [IoTensorMut<'_>],
) -> NnrtResult<Vec<HdiTensorMut<'a>>> {
    outputs
        .iter_mut()
        .map(|io| {
            // Output extents may stay dynamic until the driver reports them.
            Ok(HdiTensorMut {
                dtype: wire_dtype(io.desc.dtype)?,
                dims: wire_dims(&io.desc.shape)?,
                buffer: &mut *io.buffer,
                length: io.length,
            })
        })
        .collect()
}

pub(crate) fn run_outputs(outputs: Vec<HdiRunOutput>, expected: usize) -> NnrtResult<Vec<RunOutput>> {
    if outputs.len() != expected {
        return Err(NnrtError::failed(format!(
            "driver reported {} outputs, expected {expected}",
            outputs.len()
        )));
    }
    outputs
        .into_iter()
        .map(|out| {
            let dims = out
                .dims
                .iter()
                .map(|d| {
                    usize::try_from(*d).map_err(|_| {
                        NnrtError::failed(format!("driver reported negative output dim {d}"))
                    })
                })
                .collect::<NnrtResult<Vec<_>>>()?;
            Ok(RunOutput {
                dims,
                sufficient: out.sufficient,
            })
        })
        .collect()
}
