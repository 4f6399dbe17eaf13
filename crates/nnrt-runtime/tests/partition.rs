mod common;

use anyhow::Result;
use common::{static_dims, tensor, Harness};
use nnrt_core::{
    DType, ErrorKind, IntermediateGraph, OpKind, ParamType, Shape, TensorDesc, TensorRole,
};
use nnrt_driver_ref::RefDriverConfig;
use nnrt_runtime::{device_partitions, supported_partitions, Partition};

fn constant(
    graph: &mut IntermediateGraph,
    param: ParamType,
    dtype: DType,
    shape: Shape,
    data: Vec<u8>,
) -> Result<u32> {
    let index = graph.add_tensor(TensorDesc::new(dtype, shape, TensorRole::Parameter(param)))?;
    graph.set_constant_data(index, data)?;
    Ok(index)
}

fn pair(values: [i64; 2]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// `add, add, max pool, add`, where the reference kernels skip pooling.
fn pooled_graph() -> Result<IntermediateGraph> {
    let dims = static_dims(&[1, 2, 2, 1]);
    let mut graph = IntermediateGraph::new();
    let a = graph.add_tensor(tensor(DType::F32, &dims, TensorRole::Input, None))?;
    let b = graph.add_tensor(tensor(DType::F32, &dims, TensorRole::Input, None))?;
    let first = graph.add_tensor(tensor(DType::F32, &dims, TensorRole::Intermediate, None))?;
    let second = graph.add_tensor(tensor(DType::F32, &dims, TensorRole::Intermediate, None))?;
    let pooled = graph.add_tensor(tensor(DType::F32, &dims, TensorRole::Intermediate, None))?;
    let out = graph.add_tensor(tensor(DType::F32, &dims, TensorRole::Output, None))?;

    let window = Shape::from_static(&[2]);
    let kernel = constant(&mut graph, ParamType::KernelSize, DType::I64, window.clone(), pair([1, 1]))?;
    let strides = constant(&mut graph, ParamType::Strides, DType::I64, window, pair([1, 1]))?;
    // Pad mode 2 is "valid".
    let pad = constant(
        &mut graph,
        ParamType::PadMode,
        DType::I32,
        Shape::scalar(),
        2i32.to_le_bytes().to_vec(),
    )?;

    graph.add_operation(OpKind::Add, &[], &[a, b], &[first])?;
    graph.add_operation(OpKind::Add, &[], &[first, b], &[second])?;
    graph.add_operation(OpKind::MaxPool, &[kernel, strides, pad], &[second], &[pooled])?;
    graph.add_operation(OpKind::Add, &[], &[pooled, b], &[out])?;
    graph.freeze(&[a, b], &[out])?;
    Ok(graph)
}

fn part(nodes: &[usize]) -> Partition {
    Partition {
        nodes: nodes.to_vec(),
    }
}

#[test]
fn unsupported_operation_splits_the_graph() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let graph = pooled_graph()?;
    let device = harness.manager.device(harness.v2)?;

    assert_eq!(device.supported_operations(&graph)?, vec![true, true, false, true]);
    assert_eq!(
        device_partitions(&*device, &graph, None)?,
        vec![part(&[0, 1]), part(&[3])]
    );
    assert_eq!(device_partitions(&*device, &graph, Some(1))?, vec![part(&[0, 1])]);
    // Support queries hand their serialized constants back.
    assert_eq!(harness.live_buffers(), 0);
    Ok(())
}

#[test]
fn support_flags_must_cover_the_graph() -> Result<()> {
    let graph = pooled_graph()?;
    let err = supported_partitions(&graph, &[true, true]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let all = supported_partitions(&graph, &[true; 4])?;
    assert_eq!(all, vec![part(&[0, 1, 2, 3])]);
    assert!(supported_partitions(&graph, &[false; 4])?.is_empty());
    Ok(())
}
