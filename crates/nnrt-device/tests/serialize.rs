use std::sync::Arc;

use anyhow::{Context, Result};
use nnrt_core::{
    DType, Device, ErrorKind, IntermediateGraph, ModelConfig, OpKind, ParamType, QuantParams,
    Shape, TensorDesc, TensorRole,
};
use nnrt_device::{serialize_graph, DeviceV1, DeviceV2, GenerationProfile};
use nnrt_driver_ref::{PrepareFailure, RefDriver, RefDriverConfig};
use nnrt_proto::{ParamKey, WireDType, WireModel, WireOpCode};

fn param(graph: &mut IntermediateGraph, param: ParamType, dtype: DType, data: Vec<u8>) -> u32 {
    let len = data.len() / dtype.size_in_bytes().unwrap_or(1);
    let shape = if len == 1 {
        Shape::scalar()
    } else {
        Shape::from_static(&[len])
    };
    let index = graph
        .add_tensor(TensorDesc::new(dtype, shape, TensorRole::Parameter(param)))
        .unwrap();
    graph.set_constant_data(index, data).unwrap();
    index
}

fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Fully-connected `[2, 3] x [4, 3]^T` without a bias operand.
fn dense_graph(quantized: bool) -> IntermediateGraph {
    let mut graph = IntermediateGraph::new();
    let (dtype, input_quant, filter_quant) = if quantized {
        (
            DType::I8,
            Some(QuantParams::per_tensor(0.5, 0, 8)),
            Some(QuantParams::per_tensor(0.25, 0, 8)),
        )
    } else {
        (DType::F32, None, None)
    };
    let mut input = TensorDesc::new(dtype, Shape::from_static(&[2, 3]), TensorRole::Input);
    input.quant = input_quant;
    let mut filter = TensorDesc::new(dtype, Shape::from_static(&[4, 3]), TensorRole::Constant);
    filter.quant = filter_quant.clone();
    let mut output = TensorDesc::new(dtype, Shape::from_static(&[2, 4]), TensorRole::Output);
    output.quant = filter_quant;

    let x = graph.add_tensor(input).unwrap();
    let w = graph.add_tensor(filter).unwrap();
    let weights = if quantized {
        vec![1u8; 12]
    } else {
        f32_bytes(&[1.0; 12])
    };
    graph.set_constant_data(w, weights).unwrap();
    let y = graph.add_tensor(output).unwrap();
    let act = param(&mut graph, ParamType::Activation, DType::I8, vec![1]);
    graph
        .add_operation(OpKind::FullyConnected, &[act], &[x, w], &[y])
        .unwrap();
    graph.freeze(&[x], &[y]).unwrap();
    graph
}

#[test]
fn constants_are_laid_out_back_to_back() -> Result<()> {
    let graph = dense_graph(false);
    let serialized = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })?;
    let model = &serialized.model;
    let constants = serialized.constants.context("graph has constants")?;

    let mut expected_offset = 0u64;
    for tensor in &model.tensors {
        if let Some(data) = tensor.data {
            assert_eq!(data.offset, expected_offset);
            expected_offset += data.len;
        }
    }
    assert_eq!(expected_offset as usize, constants.len());

    // filter (48) + synthesized bias (16) + activation (1)
    assert_eq!(constants.len(), 48 + 16 + 1);
    Ok(())
}

#[test]
fn dense_without_bias_gets_a_zero_bias() -> Result<()> {
    let graph = dense_graph(true);
    let serialized = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })?;
    let model = &serialized.model;
    let op = &model.ops[0];
    assert_eq!(op.code, WireOpCode::FullConnection);
    assert_eq!(op.inputs.len(), 3);

    let bias = &model.tensors[op.inputs[2] as usize];
    assert_eq!(bias.dtype, WireDType::Int32);
    assert_eq!(bias.dims, vec![4]);
    assert_eq!(bias.quant.len(), 1);
    assert!((bias.quant[0].scale - 0.125).abs() < 1e-12);
    assert_eq!(bias.quant[0].zero_point, 0);

    let data = bias.data.context("bias is constant")?;
    let constants = serialized.constants.context("constants staged")?;
    let start = data.offset as usize;
    assert!(constants.as_slice()[start..start + data.len as usize]
        .iter()
        .all(|b| *b == 0));

    let (_, act) = model
        .param(op, ParamKey::ActivationType)
        .context("activation param")?;
    assert!(act.dims.is_empty());
    Ok(())
}

#[test]
fn first_generation_sends_scalars_as_vectors() -> Result<()> {
    let graph = dense_graph(false);
    let serialized = serialize_graph(&graph, &GenerationProfile::V1, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })?;
    let model = &serialized.model;
    assert_eq!(model.version, 1);
    let (_, act) = model
        .param(&model.ops[0], ParamKey::ActivationType)
        .context("activation param")?;
    assert_eq!(act.dims, vec![1]);
    Ok(())
}

fn depthwise_graph(weight_dims: &[usize], pad: u8) -> IntermediateGraph {
    let (mut graph, [x, _, y]) = unfrozen_depthwise(weight_dims, pad);
    graph.freeze(&[x], &[y]).unwrap();
    graph
}

/// Depthwise convolution over a `[1, 2, 2, 2]` input; returns the input,
/// weight and output indices.
fn unfrozen_depthwise(weight_dims: &[usize], pad: u8) -> (IntermediateGraph, [u32; 3]) {
    let mut graph = IntermediateGraph::new();
    let x = graph
        .add_tensor(TensorDesc::new(
            DType::F32,
            Shape::from_static(&[1, 2, 2, 2]),
            TensorRole::Input,
        ))
        .unwrap();
    let w = graph
        .add_tensor(TensorDesc::new(
            DType::F32,
            Shape::from_static(weight_dims),
            TensorRole::Constant,
        ))
        .unwrap();
    let numel: usize = weight_dims.iter().product();
    let weights: Vec<f32> = (0..numel).map(|i| i as f32).collect();
    graph.set_constant_data(w, f32_bytes(&weights)).unwrap();
    let b = graph
        .add_tensor(TensorDesc::new(
            DType::F32,
            Shape::from_static(&[2]),
            TensorRole::Constant,
        ))
        .unwrap();
    graph.set_constant_data(b, f32_bytes(&[0.0, 0.0])).unwrap();
    let y = graph
        .add_tensor(TensorDesc::new(
            DType::F32,
            Shape::from_static(&[1, 2, 2, 2]),
            TensorRole::Output,
        ))
        .unwrap();
    let strides = param(&mut graph, ParamType::Strides, DType::I64, i64_bytes(&[1, 1]));
    let pad = param(&mut graph, ParamType::PadMode, DType::I8, vec![pad]);
    graph
        .add_operation(OpKind::DepthwiseConv2d, &[strides, pad], &[x, w, b], &[y])
        .unwrap();
    (graph, [x, w, y])
}

#[test]
fn depthwise_weights_are_transposed() -> Result<()> {
    let graph = depthwise_graph(&[1, 1, 2, 2], 1);
    let serialized = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })?;
    let model = &serialized.model;
    let op = &model.ops[0];
    assert_eq!(op.code, WireOpCode::Conv2dFusion);

    let weights = &model.tensors[op.inputs[1] as usize];
    assert_eq!(weights.dims, vec![2, 1, 2, 1]);
    let data = weights.data.context("weights are constant")?;
    let constants = serialized.constants.context("constants staged")?;
    let start = data.offset as usize;
    let values: Vec<f32> = constants.as_slice()[start..start + data.len as usize]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    // [1, 1, 2, 2] holds w[0][0][x][c] = 2x + c; transposed to [c][0][x][0].
    assert_eq!(values, vec![0.0, 2.0, 1.0, 3.0]);

    let (group_index, group) = model.param(op, ParamKey::Group).context("group param")?;
    let group_data = group.data.context("group value")?;
    let start = group_data.offset as usize;
    assert_eq!(
        &constants.as_slice()[start..start + 8],
        &2i64.to_le_bytes(),
        "group tensor {group_index} carries the channel count"
    );
    Ok(())
}

#[test]
fn shared_depthwise_weights_keep_both_layouts() -> Result<()> {
    let (mut graph, [x, w, y]) = unfrozen_depthwise(&[1, 1, 2, 2], 1);
    let desc = TensorDesc::new(DType::F32, Shape::from_static(&[1, 1, 2, 2]), TensorRole::Input);
    let other = graph.add_tensor(desc.clone())?;
    let sum = graph.add_tensor(TensorDesc {
        role: TensorRole::Output,
        ..desc
    })?;
    graph.add_operation(OpKind::Add, &[], &[w, other], &[sum])?;
    graph.freeze(&[x, other], &[y, sum])?;

    let serialized = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })?;
    let model = &serialized.model;
    let constants = serialized.constants.context("constants staged")?;
    let values = |index: u32| -> Result<Vec<f32>> {
        let data = model.tensors[index as usize].data.context("constant tensor")?;
        let start = data.offset as usize;
        Ok(constants.as_slice()[start..start + data.len as usize]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    };

    let transposed = model.ops[0].inputs[1];
    let plain = model.ops[1].inputs[0];
    assert_ne!(transposed, plain);
    assert_eq!(model.tensors[transposed as usize].dims, vec![2, 1, 2, 1]);
    assert_eq!(values(transposed)?, vec![0.0, 2.0, 1.0, 3.0]);
    assert_eq!(model.tensors[plain as usize].dims, vec![1, 1, 2, 2]);
    assert_eq!(values(plain)?, vec![0.0, 1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn depthwise_weights_must_be_rank_four() {
    let graph = depthwise_graph(&[1, 2, 2], 1);
    let err = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn unknown_padding_is_rejected() {
    let graph = depthwise_graph(&[1, 1, 2, 2], 0);
    let err = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn unsupported_fused_activation_is_rejected() {
    let mut graph = IntermediateGraph::new();
    let desc = TensorDesc::new(DType::F32, Shape::from_static(&[2]), TensorRole::Input);
    let a = graph.add_tensor(desc.clone()).unwrap();
    let b = graph.add_tensor(desc.clone()).unwrap();
    let out = graph
        .add_tensor(TensorDesc {
            role: TensorRole::Output,
            ..desc
        })
        .unwrap();
    // relu_n1_to_1 has no wire counterpart.
    let act = param(&mut graph, ParamType::Activation, DType::I8, vec![2]);
    graph
        .add_operation(OpKind::Add, &[act], &[a, b], &[out])
        .unwrap();
    graph.freeze(&[a, b], &[out]).unwrap();

    let err = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn serialization_requires_a_frozen_graph() {
    let graph = IntermediateGraph::new();
    let err = serialize_graph(&graph, &GenerationProfile::V2, |len| {
        nnrt_core::SharedBuffer::allocate(len)
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);
}

#[test]
fn devices_report_driver_identity_and_support() -> Result<()> {
    let driver = Arc::new(RefDriver::new(RefDriverConfig {
        name: "ref-a".to_string(),
        ..RefDriverConfig::default()
    }));
    let v1 = DeviceV1::new(driver.clone())?;
    let v2 = DeviceV2::new(driver.clone())?;
    assert_eq!(v1.info().name, "ref-a");
    assert!(!v1.capabilities().dynamic_input);
    assert!(v2.capabilities().dynamic_input);

    let graph = dense_graph(false);
    assert_eq!(v2.supported_operations(&graph)?, vec![true]);
    assert_eq!(v1.supported_operations(&graph)?, vec![true]);
    assert_eq!(driver.tracker().live(), 0);

    let model = v2.serialize(&graph)?;
    let decoded = WireModel::decode(&model.encoded)?;
    assert_eq!(decoded.ops.len(), model.operation_count);
    let err = v1.prepare_model(&model, &ModelConfig::default()).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[test]
fn prepare_rejections_map_to_error_kinds() -> Result<()> {
    let graph = dense_graph(false);
    for (failure, kind) in [
        (PrepareFailure::RejectConfig, ErrorKind::Unavailable),
        (PrepareFailure::Internal, ErrorKind::Failed),
    ] {
        let driver = Arc::new(RefDriver::new(RefDriverConfig {
            prepare_failure: Some(failure),
            ..RefDriverConfig::default()
        }));
        for device in [
            Box::new(DeviceV1::new(driver.clone())?) as Box<dyn Device>,
            Box::new(DeviceV2::new(driver.clone())?) as Box<dyn Device>,
        ] {
            let model = device.serialize(&graph)?;
            let err = device
                .prepare_model(&model, &ModelConfig::default())
                .err()
                .context("prepare should fail")?;
            assert_eq!(err.kind(), kind, "{:?}", device.info().generation);
        }
    }
    Ok(())
}

#[test]
fn offline_devices_are_unavailable() {
    let driver = Arc::new(RefDriver::new(RefDriverConfig {
        status: nnrt_proto::hdi::v2::DeviceStatus::Offline,
        ..RefDriverConfig::default()
    }));
    let err = DeviceV2::new(driver).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}
