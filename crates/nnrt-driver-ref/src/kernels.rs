//! Straight-line interpreter for wire models.
//!
//! Quantized tensors are dequantized to `f32`, computed, and requantized
//! with the output tensor's parameters.

use std::collections::HashMap;
use std::time::Instant;

use nnrt_proto::hdi::{HdiRunOutput, HdiTensor, HdiTensorMut};
use nnrt_proto::{ParamKey, WireActivation, WireDType, WireModel, WireOp, WireOpCode, WireTensor};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub(crate) enum RunError {
    /// The bound tensors do not fit the model.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Internal(String),
}

type RunResult<T> = Result<T, RunError>;

fn internal(msg: impl Into<String>) -> RunError {
    RunError::Internal(msg.into())
}

#[derive(Clone, Debug)]
struct Value {
    dims: Vec<usize>,
    bytes: Vec<u8>,
}

/// Operators this interpreter can execute for the given element type.
pub(crate) fn is_supported(model: &WireModel, op: &WireOp) -> bool {
    let dtype = |index: Option<&u32>| index.and_then(|i| model.tensors.get(*i as usize)).map(|t| t.dtype);
    let first = dtype(op.inputs.first());
    match op.code {
        WireOpCode::AddFusion
        | WireOpCode::SubFusion
        | WireOpCode::MulFusion
        | WireOpCode::DivFusion => {
            matches!(first, Some(WireDType::Float32 | WireDType::Int8 | WireDType::UInt8))
        }
        WireOpCode::Activation | WireOpCode::Softmax | WireOpCode::FullConnection => {
            first == Some(WireDType::Float32)
        }
        WireOpCode::Reshape => true,
        _ => false,
    }
}

pub(crate) fn execute(
    model: &WireModel,
    constants: &[u8],
    inputs: &[HdiTensor<'_>],
    outputs: &mut [HdiTensorMut<'_>],
    profiling: bool,
) -> RunResult<Vec<HdiRunOutput>> {
    if inputs.len() != model.inputs.len() || outputs.len() != model.outputs.len() {
        return Err(RunError::InvalidInput(format!(
            "model takes {} inputs and {} outputs, got {} and {}",
            model.inputs.len(),
            model.outputs.len(),
            inputs.len(),
            outputs.len()
        )));
    }

    let mut values: HashMap<u32, Value> = HashMap::new();
    for (index, tensor) in model.tensors.iter().enumerate() {
        let Some(data) = tensor.data else { continue };
        let start = data.offset as usize;
        let end = start + data.len as usize;
        let bytes = constants
            .get(start..end)
            .ok_or_else(|| internal(format!("constant {index} lies outside the constant blob")))?;
        let dims = static_dims(tensor).ok_or_else(|| internal("constant with dynamic shape"))?;
        values.insert(
            index as u32,
            Value {
                dims,
                bytes: bytes.to_vec(),
            },
        );
    }

    for (bound, index) in inputs.iter().zip(&model.inputs) {
        let value = bind_input(&model.tensors[*index as usize], bound)?;
        values.insert(*index, value);
    }

    for op in &model.ops {
        let started = Instant::now();
        let value = run_op(model, &values, op)?;
        let output = *op
            .outputs
            .first()
            .ok_or_else(|| internal(format!("{:?} has no output", op.code)))?;
        values.insert(output, value);
        if profiling {
            debug!(
                op = ?op.code,
                elapsed_us = started.elapsed().as_micros() as u64,
                "operator executed"
            );
        }
    }

    let mut results = Vec::with_capacity(outputs.len());
    for (bound, index) in outputs.iter_mut().zip(&model.outputs) {
        let value = values
            .get(index)
            .ok_or_else(|| internal(format!("output tensor {index} was never produced")))?;
        let len = value.bytes.len();
        let sufficient = len <= bound.length && len <= bound.buffer.len();
        if sufficient {
            bound.buffer.as_mut_slice()[..len].copy_from_slice(&value.bytes);
        }
        results.push(HdiRunOutput {
            dims: value.dims.iter().map(|d| *d as i32).collect(),
            sufficient,
        });
    }
    Ok(results)
}

fn static_dims(tensor: &WireTensor) -> Option<Vec<usize>> {
    tensor.dims.iter().map(|d| usize::try_from(*d).ok()).collect()
}

fn bind_input(tensor: &WireTensor, bound: &HdiTensor<'_>) -> RunResult<Value> {
    if bound.dtype != tensor.dtype {
        return Err(RunError::InvalidInput(format!(
            "input has type {:?}, model expects {:?}",
            bound.dtype, tensor.dtype
        )));
    }
    if bound.dims.len() != tensor.dims.len() {
        return Err(RunError::InvalidInput(format!(
            "input has rank {}, model expects {}",
            bound.dims.len(),
            tensor.dims.len()
        )));
    }
    let mut dims = Vec::with_capacity(bound.dims.len());
    for (got, declared) in bound.dims.iter().zip(&tensor.dims) {
        if *got <= 0 || (*declared >= 0 && got != declared) {
            return Err(RunError::InvalidInput(format!(
                "input dims {:?} do not match declared {:?}",
                bound.dims, tensor.dims
            )));
        }
        dims.push(*got as usize);
    }
    let len = dims.iter().product::<usize>() * tensor.dtype.size_in_bytes();
    if bound.length < len || bound.buffer.len() < len {
        return Err(RunError::InvalidInput(format!(
            "input needs {len} bytes, {} bound",
            bound.length
        )));
    }
    Ok(Value {
        dims,
        bytes: bound.buffer.as_slice()[..len].to_vec(),
    })
}

fn fetch<'v>(values: &'v HashMap<u32, Value>, index: u32) -> RunResult<&'v Value> {
    values
        .get(&index)
        .ok_or_else(|| internal(format!("tensor {index} has no value")))
}

fn run_op(model: &WireModel, values: &HashMap<u32, Value>, op: &WireOp) -> RunResult<Value> {
    let tensor = |index: u32| &model.tensors[index as usize];
    let out_tensor = tensor(op.outputs[0]);
    let activation = match model.param(op, ParamKey::ActivationType) {
        Some((index, _)) => {
            let raw = fetch(values, index)?.bytes.first().copied().unwrap_or(0) as i8;
            WireActivation::from_code(raw).map_err(|err| internal(err.to_string()))?
        }
        None => WireActivation::None,
    };

    match op.code {
        WireOpCode::AddFusion
        | WireOpCode::SubFusion
        | WireOpCode::MulFusion
        | WireOpCode::DivFusion => {
            let (a_index, b_index) = match op.inputs.as_slice() {
                [a, b] => (*a, *b),
                _ => return Err(internal("binary operator needs two inputs")),
            };
            let a = fetch(values, a_index)?;
            let b = fetch(values, b_index)?;
            let dims = broadcast_shape(&a.dims, &b.dims).ok_or_else(|| {
                RunError::InvalidInput(format!(
                    "shapes {:?} and {:?} do not broadcast",
                    a.dims, b.dims
                ))
            })?;
            let fa = to_f32(a, tensor(a_index))?;
            let fb = to_f32(b, tensor(b_index))?;
            let numel = dims.iter().product::<usize>();
            let mut out = Vec::with_capacity(numel);
            for i in 0..numel {
                let x = fa[broadcast_index(i, &dims, &a.dims)];
                let y = fb[broadcast_index(i, &dims, &b.dims)];
                let v = match op.code {
                    WireOpCode::AddFusion => x + y,
                    WireOpCode::SubFusion => x - y,
                    WireOpCode::MulFusion => x * y,
                    _ => x / y,
                };
                out.push(activate(activation, v));
            }
            Ok(Value {
                bytes: from_f32(&out, out_tensor)?,
                dims,
            })
        }
        WireOpCode::Activation => {
            let input = fetch(values, op.inputs[0])?;
            let out: Vec<f32> = to_f32(input, tensor(op.inputs[0]))?
                .into_iter()
                .map(|v| activate(activation, v))
                .collect();
            Ok(Value {
                bytes: from_f32(&out, out_tensor)?,
                dims: input.dims.clone(),
            })
        }
        WireOpCode::FullConnection => {
            let [input_index, filter_index, bias_index] = match op.inputs.as_slice() {
                [a, b, c] => [*a, *b, *c],
                _ => return Err(internal("fully-connected needs input, filter and bias")),
            };
            let input = fetch(values, input_index)?;
            let filter = fetch(values, filter_index)?;
            let (out_channels, depth) = match filter.dims.as_slice() {
                [o, k] => (*o, *k),
                other => return Err(internal(format!("filter must be 2-D, got {other:?}"))),
            };
            let x = to_f32(input, tensor(input_index))?;
            if depth == 0 || x.len() % depth != 0 {
                return Err(RunError::InvalidInput(format!(
                    "input of {} elements does not divide into rows of {depth}",
                    x.len()
                )));
            }
            let w = to_f32(filter, tensor(filter_index))?;
            let bias = to_f32(fetch(values, bias_index)?, tensor(bias_index))?;
            let rows = x.len() / depth;
            let mut out = Vec::with_capacity(rows * out_channels);
            for row in x.chunks_exact(depth) {
                for (o, weights) in w.chunks_exact(depth).enumerate() {
                    let dot: f32 = row.iter().zip(weights).map(|(a, b)| a * b).sum();
                    out.push(activate(activation, dot + bias.get(o).copied().unwrap_or(0.0)));
                }
            }
            Ok(Value {
                bytes: from_f32(&out, out_tensor)?,
                dims: vec![rows, out_channels],
            })
        }
        WireOpCode::Softmax => {
            let input = fetch(values, op.inputs[0])?;
            let axis = match model.param(op, ParamKey::Axis) {
                Some((index, _)) => read_i64(&fetch(values, index)?.bytes)
                    .first()
                    .copied()
                    .unwrap_or(-1),
                None => -1,
            };
            let rank = input.dims.len() as i64;
            let axis = if axis < 0 { axis + rank } else { axis };
            if !(0..rank).contains(&axis) {
                return Err(RunError::InvalidInput(format!("softmax axis {axis} out of range")));
            }
            let axis = axis as usize;
            let x = to_f32(input, tensor(op.inputs[0]))?;
            let inner: usize = input.dims[axis + 1..].iter().product();
            let len = input.dims[axis];
            let outer = x.len() / (len * inner).max(1);
            let mut out = vec![0f32; x.len()];
            for o in 0..outer {
                for i in 0..inner {
                    let at = |k: usize| o * len * inner + k * inner + i;
                    let max = (0..len).map(|k| x[at(k)]).fold(f32::NEG_INFINITY, f32::max);
                    let sum: f32 = (0..len).map(|k| (x[at(k)] - max).exp()).sum();
                    for k in 0..len {
                        out[at(k)] = (x[at(k)] - max).exp() / sum;
                    }
                }
            }
            Ok(Value {
                bytes: from_f32(&out, out_tensor)?,
                dims: input.dims.clone(),
            })
        }
        WireOpCode::Reshape => {
            let input = fetch(values, op.inputs[0])?;
            let shape_index = *op
                .inputs
                .get(1)
                .ok_or_else(|| internal("reshape needs a shape operand"))?;
            let shape = fetch(values, shape_index)?;
            let requested = match tensor(shape_index).dtype {
                WireDType::Int64 => read_i64(&shape.bytes),
                WireDType::Int32 => shape
                    .bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect(),
                other => return Err(internal(format!("reshape shape of type {other:?}"))),
            };
            let numel: usize = input.dims.iter().product();
            let dims = resolve_reshape(&requested, numel).ok_or_else(|| {
                RunError::InvalidInput(format!(
                    "cannot reshape {:?} to {requested:?}",
                    input.dims
                ))
            })?;
            Ok(Value {
                dims,
                bytes: input.bytes.clone(),
            })
        }
        other => Err(internal(format!(
            "{other:?} is not implemented by the reference driver"
        ))),
    }
}

fn activate(activation: WireActivation, v: f32) -> f32 {
    match activation {
        WireActivation::None => v,
        WireActivation::Relu => v.max(0.0),
        WireActivation::Relu6 => v.clamp(0.0, 6.0),
        WireActivation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        WireActivation::Tanh => v.tanh(),
    }
}

/// `(scale, zero_point)` for element `i` of a tensor with `numel` elements.
fn quant_at(tensor: &WireTensor, i: usize, numel: usize) -> (f32, i32) {
    match tensor.quant.len() {
        0 => (1.0, 0),
        1 => (tensor.quant[0].scale as f32, tensor.quant[0].zero_point),
        channels => {
            let per_channel = (numel / channels).max(1);
            let q = &tensor.quant[(i / per_channel).min(channels - 1)];
            (q.scale as f32, q.zero_point)
        }
    }
}

fn to_f32(value: &Value, tensor: &WireTensor) -> RunResult<Vec<f32>> {
    let bytes = &value.bytes;
    let numel = value.dims.iter().product::<usize>();
    let dequant = |i: usize, q: i64| {
        let (scale, zero_point) = quant_at(tensor, i, numel);
        (q - zero_point as i64) as f32 * scale
    };
    Ok(match tensor.dtype {
        WireDType::Float32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        WireDType::Int8 => bytes
            .iter()
            .enumerate()
            .map(|(i, b)| dequant(i, *b as i8 as i64))
            .collect(),
        WireDType::UInt8 => bytes
            .iter()
            .enumerate()
            .map(|(i, b)| dequant(i, *b as i64))
            .collect(),
        WireDType::Int32 => bytes
            .chunks_exact(4)
            .enumerate()
            .map(|(i, c)| dequant(i, i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64))
            .collect(),
        other => return Err(internal(format!("{other:?} arithmetic is not implemented"))),
    })
}

fn from_f32(values: &[f32], tensor: &WireTensor) -> RunResult<Vec<u8>> {
    let numel = values.len();
    let quantize = |i: usize, v: f32, lo: i64, hi: i64| {
        let (scale, zero_point) = quant_at(tensor, i, numel);
        ((v / scale).round() as i64 + zero_point as i64).clamp(lo, hi)
    };
    Ok(match tensor.dtype {
        WireDType::Float32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        WireDType::Int8 => values
            .iter()
            .enumerate()
            .map(|(i, v)| quantize(i, *v, i8::MIN as i64, i8::MAX as i64) as i8 as u8)
            .collect(),
        WireDType::UInt8 => values
            .iter()
            .enumerate()
            .map(|(i, v)| quantize(i, *v, 0, u8::MAX as i64) as u8)
            .collect(),
        WireDType::Int32 => values
            .iter()
            .enumerate()
            .flat_map(|(i, v)| {
                (quantize(i, *v, i32::MIN as i64, i32::MAX as i64) as i32).to_le_bytes()
            })
            .collect(),
        other => return Err(internal(format!("{other:?} results are not implemented"))),
    })
}

fn read_i64(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
            let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
            match (da, db) {
                (x, y) if x == y => Some(x),
                (1, y) => Some(y),
                (x, 1) => Some(x),
                _ => None,
            }
        })
        .collect()
}

/// Linear index into an operand broadcast up to `out_dims`.
fn broadcast_index(mut linear: usize, out_dims: &[usize], in_dims: &[usize]) -> usize {
    let offset = out_dims.len() - in_dims.len();
    let mut index = 0;
    let mut stride = 1;
    for axis in (0..out_dims.len()).rev() {
        let coord = linear % out_dims[axis];
        linear /= out_dims[axis];
        if axis >= offset {
            let dim = in_dims[axis - offset];
            if dim != 1 {
                index += coord * stride;
            }
            stride *= dim;
        }
    }
    index
}

fn resolve_reshape(requested: &[i64], numel: usize) -> Option<Vec<usize>> {
    let mut inferred = None;
    let mut known = 1usize;
    let mut dims = Vec::with_capacity(requested.len());
    for (axis, dim) in requested.iter().enumerate() {
        match *dim {
            -1 if inferred.is_none() => {
                inferred = Some(axis);
                dims.push(0);
            }
            d if d > 0 => {
                known = known.checked_mul(d as usize)?;
                dims.push(d as usize);
            }
            _ => return None,
        }
    }
    match inferred {
        Some(axis) => {
            if known == 0 || numel % known != 0 {
                return None;
            }
            dims[axis] = numel / known;
        }
        None if known != numel => return None,
        None => {}
    }
    Some(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting_aligns_trailing_axes() {
        assert_eq!(broadcast_shape(&[3, 2, 2], &[2]), Some(vec![3, 2, 2]));
        assert_eq!(broadcast_shape(&[3, 1], &[1, 4]), Some(vec![3, 4]));
        assert_eq!(broadcast_shape(&[3, 2], &[4]), None);
        // Element [2, 1, 0] of a [3, 2, 2] output reads element [0] of a [2] operand.
        assert_eq!(broadcast_index(2 * 4 + 1 * 2, &[3, 2, 2], &[2]), 0);
        assert_eq!(broadcast_index(5, &[3, 2], &[3, 1]), 2);
    }

    #[test]
    fn reshape_infers_one_axis() {
        assert_eq!(resolve_reshape(&[-1, 4], 12), Some(vec![3, 4]));
        assert_eq!(resolve_reshape(&[12], 12), Some(vec![12]));
        assert_eq!(resolve_reshape(&[-1, -1], 12), None);
        assert_eq!(resolve_reshape(&[5], 12), None);
    }
}
