#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use nnrt_core::{
    DType, DeviceId, DriverGeneration, IntermediateGraph, OpKind, QuantParams, Shape, TensorDesc,
    TensorRole,
};
use nnrt_driver_ref::{RefDriver, RefDriverConfig};
use nnrt_runtime::{Compilation, DeviceManager};

/// One reference driver registered under both protocol generations.
pub struct Harness {
    pub manager: Arc<DeviceManager>,
    pub driver: Arc<RefDriver>,
    pub v1: DeviceId,
    pub v2: DeviceId,
}

impl Harness {
    pub fn new(config: RefDriverConfig) -> Result<Self> {
        let driver = Arc::new(RefDriver::new(config));
        let manager = Arc::new(DeviceManager::new());
        manager.register_v1("ref-v1", driver.clone())?;
        manager.register_v2("ref-v2", driver.clone())?;
        let find = |generation: DriverGeneration| -> Result<DeviceId> {
            manager
                .device_ids()
                .into_iter()
                .find(|id| {
                    manager
                        .info(*id)
                        .map(|info| info.generation == generation)
                        .unwrap_or(false)
                })
                .with_context(|| format!("no {generation:?} device enumerated"))
        };
        let v1 = find(DriverGeneration::V1)?;
        let v2 = find(DriverGeneration::V2)?;
        Ok(Self {
            manager,
            driver,
            v1,
            v2,
        })
    }

    pub fn compile(&self, graph: IntermediateGraph, device: DeviceId) -> Result<Compilation> {
        let mut compilation = Compilation::with_device_manager(graph, Arc::clone(&self.manager))?;
        compilation.set_device(device)?;
        Ok(compilation)
    }

    pub fn live_buffers(&self) -> usize {
        self.driver.tracker().live()
    }
}

pub fn tensor(dtype: DType, dims: &[Option<usize>], role: TensorRole, quant: Option<&QuantParams>) -> TensorDesc {
    let mut desc = TensorDesc::new(dtype, Shape::from_dims(dims), role);
    desc.quant = quant.cloned();
    desc
}

/// `out = (a + b) + b`.
pub fn chained_add(
    dtype: DType,
    dims: &[Option<usize>],
    input_quant: Option<&QuantParams>,
    result_quant: Option<&QuantParams>,
) -> Result<IntermediateGraph> {
    let mut graph = IntermediateGraph::new();
    let a = graph.add_tensor(tensor(dtype, dims, TensorRole::Input, input_quant))?;
    let b = graph.add_tensor(tensor(dtype, dims, TensorRole::Input, input_quant))?;
    let mid = graph.add_tensor(tensor(dtype, dims, TensorRole::Intermediate, result_quant))?;
    let out = graph.add_tensor(tensor(dtype, dims, TensorRole::Output, result_quant))?;
    graph.add_operation(OpKind::Add, &[], &[a, b], &[mid])?;
    graph.add_operation(OpKind::Add, &[], &[mid, b], &[out])?;
    graph.freeze(&[a, b], &[out])?;
    Ok(graph)
}

pub fn static_dims(dims: &[usize]) -> Vec<Option<usize>> {
    dims.iter().copied().map(Some).collect()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
