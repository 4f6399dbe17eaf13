//! Per-operator translation from graph operations to wire operations.
//!
//! Every graph operation becomes exactly one wire operation, so the
//! per-operation support flags a driver returns line up with the graph.

use std::collections::HashMap;

use bytes::Bytes;
use nnrt_core::{
    DType, IntermediateGraph, NnrtError, NnrtResult, OpKind, Operation, ParamType, Shape,
    TensorRole,
};
use nnrt_proto::{
    ParamKey, WireActivation, WireDType, WireModel, WireOp, WireOpCode, WirePadMode, WireQuant,
    WireTensor,
};

use crate::mapping::TensorMapping;
use crate::profile::GenerationProfile;

/// Client activation ids in table order; `None` marks ids drivers cannot fuse.
const FUSED_ACTIVATIONS: [Option<WireActivation>; 7] = [
    Some(WireActivation::None),
    Some(WireActivation::Relu),
    None, // relu_n1_to_1
    Some(WireActivation::Relu6),
    Some(WireActivation::Tanh),
    None, // sign_bit
    Some(WireActivation::Sigmoid),
];

pub fn fused_activation(id: i64) -> NnrtResult<WireActivation> {
    usize::try_from(id)
        .ok()
        .and_then(|i| FUSED_ACTIVATIONS.get(i).copied())
        .flatten()
        .ok_or_else(|| NnrtError::invalid_argument(format!("unsupported fused activation {id}")))
}

pub fn pad_mode(id: i64) -> NnrtResult<WirePadMode> {
    match id {
        1 => Ok(WirePadMode::Same),
        2 => Ok(WirePadMode::Valid),
        other => Err(NnrtError::invalid_argument(format!(
            "unknown padding mode {other}"
        ))),
    }
}

/// Depthwise weights go from `[1, H, W, C]` to `[C, H, W, 1]`.
const DEPTHWISE_PERMUTATION: [usize; 4] = [3, 1, 2, 0];

/// A constant payload waiting for an offset in the shared constant buffer.
#[derive(Debug)]
pub struct PendingConstant {
    pub index: u32,
    pub data: Bytes,
}

pub struct OperationBuilder<'g> {
    graph: &'g IntermediateGraph,
    profile: &'static GenerationProfile,
    mapping: TensorMapping,
    /// Client weights to their transposed copy; other consumers of the
    /// same constant keep the plain layout.
    depthwise: HashMap<u32, u32>,
    model: WireModel,
    constants: Vec<PendingConstant>,
}

impl<'g> OperationBuilder<'g> {
    pub fn new(graph: &'g IntermediateGraph, profile: &'static GenerationProfile) -> Self {
        Self {
            graph,
            profile,
            mapping: TensorMapping::new(graph.tensors().len()),
            depthwise: HashMap::new(),
            model: WireModel::new(profile.wire_version),
            constants: Vec::new(),
        }
    }

    /// Maps a graph-level input or output.
    pub fn io_tensor(&mut self, client: u32) -> NnrtResult<u32> {
        self.operand(client, self.profile.scalar_params_as_tensors)
    }

    pub fn set_io(&mut self, inputs: Vec<u32>, outputs: Vec<u32>) {
        self.model.inputs = inputs;
        self.model.outputs = outputs;
    }

    pub fn finish(self) -> (WireModel, Vec<PendingConstant>, TensorMapping) {
        (self.model, self.constants, self.mapping)
    }

    pub fn add_operation(&mut self, op: &Operation) -> NnrtResult<()> {
        let kind = op.kind;
        let scalar = self.profile.scalar_as_tensor(kind);
        let mut params = Vec::new();

        let (code, inputs) = match kind {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let inputs = self.operands(&op.inputs, scalar)?;
                params.push(self.activation_param(op, scalar)?);
                let code = match kind {
                    OpKind::Add => WireOpCode::AddFusion,
                    OpKind::Sub => WireOpCode::SubFusion,
                    OpKind::Mul => WireOpCode::MulFusion,
                    _ => WireOpCode::DivFusion,
                };
                (code, inputs)
            }
            OpKind::FullyConnected => {
                let input = self.operand(op.inputs[0], scalar)?;
                let filter = self.operand(op.inputs[1], scalar)?;
                let bias = match op.inputs.get(2) {
                    Some(bias) => self.operand(*bias, scalar)?,
                    None => self.synthesize_bias(op.inputs[0], op.inputs[1], filter)?,
                };
                params.push(self.activation_param(op, scalar)?);
                (WireOpCode::FullConnection, vec![input, filter, bias])
            }
            OpKind::Conv2d => {
                let inputs = self.operands(&op.inputs, scalar)?;
                params.push(self.int_param(op, ParamType::Strides, ParamKey::Stride, None, scalar)?);
                params.push(self.pad_param(op, scalar)?);
                params.push(self.int_param(
                    op,
                    ParamType::Dilation,
                    ParamKey::Dilation,
                    Some(&[1, 1]),
                    scalar,
                )?);
                params.push(self.int_param(op, ParamType::Group, ParamKey::Group, Some(&[1]), scalar)?);
                params.push(self.activation_param(op, scalar)?);
                (WireOpCode::Conv2dFusion, inputs)
            }
            OpKind::DepthwiseConv2d => {
                let input = self.operand(op.inputs[0], scalar)?;
                let (weights, channels) = self.depthwise_weights(op.inputs[1])?;
                let bias = self.operand(op.inputs[2], scalar)?;
                params.push(self.int_param(op, ParamType::Strides, ParamKey::Stride, None, scalar)?);
                params.push(self.pad_param(op, scalar)?);
                params.push(self.int_param(
                    op,
                    ParamType::Dilation,
                    ParamKey::Dilation,
                    Some(&[1, 1]),
                    scalar,
                )?);
                params.push(self.emit_param(ParamKey::Group, &[channels as i64], true, scalar)?);
                params.push(self.activation_param(op, scalar)?);
                (WireOpCode::Conv2dFusion, vec![input, weights, bias])
            }
            OpKind::AvgPool | OpKind::MaxPool => {
                let inputs = self.operands(&op.inputs, scalar)?;
                params.push(self.int_param(
                    op,
                    ParamType::KernelSize,
                    ParamKey::KernelSize,
                    None,
                    scalar,
                )?);
                params.push(self.int_param(op, ParamType::Strides, ParamKey::Stride, None, scalar)?);
                params.push(self.pad_param(op, scalar)?);
                params.push(self.activation_param(op, scalar)?);
                let code = if kind == OpKind::AvgPool {
                    WireOpCode::AvgPoolFusion
                } else {
                    WireOpCode::MaxPoolFusion
                };
                (code, inputs)
            }
            OpKind::Relu | OpKind::Sigmoid | OpKind::Tanh => {
                let inputs = self.operands(&op.inputs, scalar)?;
                let activation = match kind {
                    OpKind::Relu => WireActivation::Relu,
                    OpKind::Sigmoid => WireActivation::Sigmoid,
                    _ => WireActivation::Tanh,
                };
                params.push(self.emit_activation(activation, scalar)?);
                (WireOpCode::Activation, inputs)
            }
            OpKind::Softmax => {
                let inputs = self.operands(&op.inputs, scalar)?;
                params.push(self.int_param(op, ParamType::Axis, ParamKey::Axis, Some(&[-1]), scalar)?);
                (WireOpCode::Softmax, inputs)
            }
            OpKind::Concat => {
                let inputs = self.operands(&op.inputs, scalar)?;
                params.push(self.int_param(op, ParamType::Axis, ParamKey::Axis, None, scalar)?);
                (WireOpCode::Concat, inputs)
            }
            OpKind::Reshape => (WireOpCode::Reshape, self.operands(&op.inputs, scalar)?),
            OpKind::Transpose => (WireOpCode::Transpose, self.operands(&op.inputs, scalar)?),
        };

        let outputs = self.operands(&op.outputs, scalar)?;
        self.model.ops.push(WireOp {
            code,
            inputs,
            outputs,
            params,
        });
        Ok(())
    }

    fn operands(&mut self, clients: &[u32], scalar_as_tensor: bool) -> NnrtResult<Vec<u32>> {
        clients
            .iter()
            .map(|client| self.operand(*client, scalar_as_tensor))
            .collect()
    }

    fn operand(&mut self, client: u32, scalar_as_tensor: bool) -> NnrtResult<u32> {
        if let Some(index) = self.mapping.get(client) {
            return Ok(index);
        }
        let graph = self.graph;
        let tensor = graph.tensor(client)?;
        let desc = tensor.desc();
        let dtype = self
            .mapping
            .convert_type(client, desc, self.profile.conversions)?;
        let quant = self
            .mapping
            .convert_quantization(client, desc, self.profile)?;
        let mut dims = wire_dims(&desc.shape)?;
        if dims.is_empty() && scalar_as_tensor {
            dims.push(1);
        }
        let index = self.mapping.resolve_or_create(client)?;
        let mut wire = WireTensor::new(dtype, dims);
        wire.quant = quant;
        self.push(index, wire);

        if desc.role == TensorRole::Constant {
            let data = match tensor.data() {
                Some(data) => {
                    Bytes::from(self.mapping.conversion(client).to_wire(data).into_owned())
                }
                None => Bytes::new(),
            };
            self.constants.push(PendingConstant { index, data });
        }
        Ok(index)
    }

    fn push(&mut self, index: u32, tensor: WireTensor) {
        let pushed = self.model.push_tensor(tensor);
        debug_assert_eq!(index, pushed);
    }

    /// Integer values of the operation's `param` tensor, if it has one.
    fn param_values(&self, op: &Operation, param: ParamType) -> NnrtResult<Option<Vec<i64>>> {
        for index in &op.params {
            let tensor = self.graph.tensor(*index)?;
            if tensor.desc().role != TensorRole::Parameter(param) {
                continue;
            }
            let data = tensor.data().ok_or_else(|| {
                NnrtError::invalid_argument(format!("{param:?} parameter {index} has no value"))
            })?;
            return read_ints(tensor.desc().dtype, data).map(Some);
        }
        Ok(None)
    }

    fn int_param(
        &mut self,
        op: &Operation,
        param: ParamType,
        key: ParamKey,
        default: Option<&[i64]>,
        scalar_as_tensor: bool,
    ) -> NnrtResult<u32> {
        let values = match (self.param_values(op, param)?, default) {
            (Some(values), _) => values,
            (None, Some(default)) => default.to_vec(),
            (None, None) => {
                return Err(NnrtError::invalid_argument(format!(
                    "{:?}: missing {param:?} parameter",
                    op.kind
                )))
            }
        };
        let is_scalar = matches!(param, ParamType::Group | ParamType::Axis);
        self.emit_param(key, &values, is_scalar, scalar_as_tensor)
    }

    fn activation_param(&mut self, op: &Operation, scalar_as_tensor: bool) -> NnrtResult<u32> {
        let activation = match self.param_values(op, ParamType::Activation)? {
            Some(values) => fused_activation(values[0])?,
            None => WireActivation::None,
        };
        self.emit_activation(activation, scalar_as_tensor)
    }

    fn emit_activation(
        &mut self,
        activation: WireActivation,
        scalar_as_tensor: bool,
    ) -> NnrtResult<u32> {
        let data = Bytes::copy_from_slice(&activation.code().to_le_bytes());
        Ok(self.emit_small(ParamKey::ActivationType, WireDType::Int8, data, scalar_as_tensor))
    }

    fn pad_param(&mut self, op: &Operation, scalar_as_tensor: bool) -> NnrtResult<u32> {
        let values = self.param_values(op, ParamType::PadMode)?.ok_or_else(|| {
            NnrtError::invalid_argument(format!("{:?}: missing padding mode", op.kind))
        })?;
        let mode = pad_mode(values[0])?;
        let data = Bytes::copy_from_slice(&mode.code().to_le_bytes());
        Ok(self.emit_small(ParamKey::PadMode, WireDType::Int8, data, scalar_as_tensor))
    }

    fn emit_param(
        &mut self,
        key: ParamKey,
        values: &[i64],
        is_scalar: bool,
        scalar_as_tensor: bool,
    ) -> NnrtResult<u32> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let dims = if is_scalar && !scalar_as_tensor {
            Vec::new()
        } else {
            vec![wire_dim(values.len())?]
        };
        let index = self.mapping.create_synthetic();
        let mut tensor = WireTensor::new(WireDType::Int64, dims);
        tensor.param = Some(key);
        self.push(index, tensor);
        self.constants.push(PendingConstant {
            index,
            data: data.into(),
        });
        Ok(index)
    }

    fn emit_small(
        &mut self,
        key: ParamKey,
        dtype: WireDType,
        data: Bytes,
        scalar_as_tensor: bool,
    ) -> u32 {
        let dims = if scalar_as_tensor { vec![1] } else { Vec::new() };
        let index = self.mapping.create_synthetic();
        let mut tensor = WireTensor::new(dtype, dims);
        tensor.param = Some(key);
        self.push(index, tensor);
        self.constants.push(PendingConstant { index, data });
        index
    }

    /// Zero bias sized to the filter's output channels.
    fn synthesize_bias(&mut self, input: u32, filter: u32, filter_index: u32) -> NnrtResult<u32> {
        let graph = self.graph;
        let input_desc = graph.tensor(input)?.desc();
        let filter_desc = graph.tensor(filter)?.desc();
        let channels = filter_desc
            .shape
            .dims()
            .first()
            .copied()
            .flatten()
            .ok_or_else(|| {
                NnrtError::invalid_argument(
                    "fully-connected filter needs a static output channel dimension",
                )
            })?;

        let tensor = match (&input_desc.quant, &filter_desc.quant) {
            (Some(input_quant), Some(filter_quant)) => {
                let input_scale = input_quant.scale[0];
                let mut tensor = WireTensor::new(WireDType::Int32, vec![wire_dim(channels)?]);
                tensor.quant = filter_quant
                    .scale
                    .iter()
                    .map(|filter_scale| WireQuant {
                        num_bits: 32,
                        scale: input_scale * filter_scale,
                        zero_point: 0,
                    })
                    .collect();
                tensor
            }
            (None, None) => {
                let dtype = self.model.tensors[filter_index as usize].dtype;
                WireTensor::new(dtype, vec![wire_dim(channels)?])
            }
            _ => {
                return Err(NnrtError::invalid_argument(
                    "fully-connected input and filter must both be quantized or both be float",
                ))
            }
        };
        let len = channels * tensor.dtype.size_in_bytes();
        let index = self.mapping.create_synthetic();
        self.push(index, tensor);
        self.constants.push(PendingConstant {
            index,
            data: Bytes::from(vec![0u8; len]),
        });
        Ok(index)
    }

    /// Transposed depthwise weights plus their channel count.
    fn depthwise_weights(&mut self, client: u32) -> NnrtResult<(u32, usize)> {
        let graph = self.graph;
        let tensor = graph.tensor(client)?;
        let desc = tensor.desc();
        let dims = desc.shape.concrete().ok_or_else(|| {
            NnrtError::invalid_argument("depthwise weights need a static shape")
        })?;
        let dims: [usize; 4] = dims.as_slice().try_into().map_err(|_| {
            NnrtError::invalid_argument(format!(
                "depthwise weights must have rank 4, got rank {}",
                dims.len()
            ))
        })?;
        let channels = dims[3];
        if let Some(index) = self.depthwise.get(&client) {
            return Ok((*index, channels));
        }
        let data = tensor.data().ok_or_else(|| {
            NnrtError::invalid_argument("depthwise weights must be constant data")
        })?;

        let dtype = self
            .mapping
            .convert_type(client, desc, self.profile.conversions)?;
        let quant = self
            .mapping
            .convert_quantization(client, desc, self.profile)?;
        let wire_data = self.mapping.conversion(client).to_wire(data);
        let permuted = permute4(&wire_data, dims, DEPTHWISE_PERMUTATION, dtype.size_in_bytes());
        let permuted_dims = DEPTHWISE_PERMUTATION
            .iter()
            .map(|axis| wire_dim(dims[*axis]))
            .collect::<NnrtResult<Vec<_>>>()?;

        let index = self.mapping.create_synthetic();
        self.depthwise.insert(client, index);
        let mut wire = WireTensor::new(dtype, permuted_dims);
        wire.quant = quant;
        self.push(index, wire);
        self.constants.push(PendingConstant {
            index,
            data: permuted.into(),
        });
        Ok((index, channels))
    }
}

/// Reorders a dense rank-4 tensor so output axis `k` is input axis `perm[k]`.
pub fn permute4(data: &[u8], dims: [usize; 4], perm: [usize; 4], elem: usize) -> Vec<u8> {
    let strides = [dims[1] * dims[2] * dims[3], dims[2] * dims[3], dims[3], 1];
    let out_dims = perm.map(|axis| dims[axis]);
    let mut out = Vec::with_capacity(data.len());
    for i0 in 0..out_dims[0] {
        for i1 in 0..out_dims[1] {
            for i2 in 0..out_dims[2] {
                for i3 in 0..out_dims[3] {
                    let index = [i0, i1, i2, i3];
                    let src: usize = (0..4).map(|k| index[k] * strides[perm[k]]).sum();
                    out.extend_from_slice(&data[src * elem..(src + 1) * elem]);
                }
            }
        }
    }
    out
}

fn read_ints(dtype: DType, data: &[u8]) -> NnrtResult<Vec<i64>> {
    let values = match dtype {
        DType::I8 => data.iter().map(|b| *b as i8 as i64).collect(),
        DType::I32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
            .collect(),
        DType::I64 => data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        other => {
            return Err(NnrtError::invalid_argument(format!(
                "parameter tensors of type {other:?} are not integers"
            )))
        }
    };
    Ok(values)
}

fn wire_dim(dim: usize) -> NnrtResult<i32> {
    i32::try_from(dim)
        .map_err(|_| NnrtError::invalid_argument(format!("dimension {dim} exceeds wire range")))
}

pub fn wire_dims(shape: &Shape) -> NnrtResult<Vec<i32>> {
    shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Some(dim) => wire_dim(*dim),
            None => Ok(-1),
        })
        .collect()
}
