//! The intermediate graph clients build before compilation.
//!
//! A graph accumulates tensors and operations while mutable. `freeze`
//! records the graph-level inputs and outputs and makes the graph
//! immutable; from then on it can only be read (by compilation and the
//! device serializers).

use bytes::Bytes;
use tracing::trace;

use crate::ops::{OpKind, ParamType};
use crate::{NnrtError, NnrtResult, TensorDesc, TensorRole};

#[derive(Clone, Debug)]
pub struct GraphTensor {
    desc: TensorDesc,
    data: Option<Bytes>,
}

impl GraphTensor {
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub params: Vec<u32>,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

#[derive(Clone, Debug)]
struct GraphIo {
    inputs: Vec<u32>,
    outputs: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct IntermediateGraph {
    tensors: Vec<GraphTensor>,
    operations: Vec<Operation>,
    use_counts: Vec<u32>,
    producers: Vec<Option<usize>>,
    io: Option<GraphIo>,
}

impl IntermediateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(&mut self, desc: TensorDesc) -> NnrtResult<u32> {
        if self.is_frozen() {
            return Err(NnrtError::invalid_argument(
                "cannot add a tensor to a frozen graph",
            ));
        }
        desc.validate()?;
        let index = u32::try_from(self.tensors.len())
            .map_err(|_| NnrtError::invalid_argument("tensor count exceeds u32 range"))?;
        self.tensors.push(GraphTensor { desc, data: None });
        self.use_counts.push(0);
        self.producers.push(None);
        Ok(index)
    }

    pub fn set_constant_data(&mut self, index: u32, data: impl Into<Bytes>) -> NnrtResult<()> {
        if self.is_frozen() {
            return Err(NnrtError::invalid_argument(
                "cannot set tensor data on a frozen graph",
            ));
        }
        let data = data.into();
        let tensor = self.tensor_mut(index)?;
        if data.is_empty() {
            return Err(NnrtError::invalid_argument(format!(
                "tensor {index}: constant data must not be empty"
            )));
        }
        match tensor.desc.role {
            TensorRole::Constant | TensorRole::Parameter(_) => {}
            role => {
                return Err(NnrtError::invalid_argument(format!(
                    "tensor {index}: {role:?} tensors cannot carry constant data"
                )))
            }
        }
        if tensor.data.is_some() {
            return Err(NnrtError::invalid_argument(format!(
                "tensor {index}: constant data is immutable once set"
            )));
        }
        if let Some(expected) = tensor.desc.byte_len() {
            if expected != data.len() {
                return Err(NnrtError::invalid_argument(format!(
                    "tensor {index}: expected {expected} bytes of data, got {}",
                    data.len()
                )));
            }
        }
        tensor.data = Some(data);
        Ok(())
    }

    pub fn add_operation(
        &mut self,
        kind: OpKind,
        params: &[u32],
        inputs: &[u32],
        outputs: &[u32],
    ) -> NnrtResult<()> {
        if self.is_frozen() {
            return Err(NnrtError::forbidden(format!(
                "cannot add {kind:?} to a frozen graph"
            )));
        }
        for index in params.iter().chain(inputs).chain(outputs) {
            self.tensor(*index)?;
        }

        let signature = kind.signature();
        if inputs.len() < signature.min_inputs || inputs.len() > signature.max_inputs {
            return Err(NnrtError::invalid_argument(format!(
                "{kind:?} takes {}..={} inputs, got {}",
                signature.min_inputs,
                signature.max_inputs,
                inputs.len()
            )));
        }
        if outputs.len() != signature.outputs {
            return Err(NnrtError::invalid_argument(format!(
                "{kind:?} produces {} outputs, got {}",
                signature.outputs,
                outputs.len()
            )));
        }

        self.check_params(kind, params)?;

        for index in inputs {
            if let TensorRole::Parameter(param) = self.tensors[*index as usize].desc.role {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: tensor {index} is a {param:?} parameter, not an operand"
                )));
            }
        }
        for index in outputs {
            let tensor = &self.tensors[*index as usize];
            if matches!(
                tensor.desc.role,
                TensorRole::Constant | TensorRole::Parameter(_) | TensorRole::Input
            ) || tensor.data.is_some()
            {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: tensor {index} ({:?}) cannot be an operation output",
                    tensor.desc.role
                )));
            }
            if let Some(producer) = self.producers[*index as usize] {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: tensor {index} is already produced by operation {producer}"
                )));
            }
        }

        let op_index = self.operations.len();
        for index in inputs {
            self.use_counts[*index as usize] += 1;
        }
        for index in outputs {
            self.producers[*index as usize] = Some(op_index);
        }
        self.operations.push(Operation {
            kind,
            params: params.to_vec(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        trace!(op = ?kind, index = op_index, "operation added");
        Ok(())
    }

    fn check_params(&self, kind: OpKind, params: &[u32]) -> NnrtResult<()> {
        let signature = kind.signature();
        let mut seen: Vec<ParamType> = Vec::with_capacity(params.len());
        for index in params {
            let tensor = &self.tensors[*index as usize];
            let TensorRole::Parameter(param) = tensor.desc.role else {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: tensor {index} is not a parameter tensor"
                )));
            };
            let slot = signature.slot(param).ok_or_else(|| {
                NnrtError::invalid_argument(format!("{kind:?} does not accept a {param:?} parameter"))
            })?;
            if seen.contains(&param) {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: duplicate {param:?} parameter"
                )));
            }
            seen.push(param);
            if !slot.dtypes.contains(&tensor.desc.dtype) {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: {param:?} parameter has type {:?}, expected one of {:?}",
                    tensor.desc.dtype, slot.dtypes
                )));
            }
            let numel = tensor.desc.shape.numel().unwrap_or(0);
            if !slot.len.accepts(numel) {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: {param:?} parameter has {numel} elements, expected {:?}",
                    slot.len
                )));
            }
            if tensor.data.is_none() {
                return Err(NnrtError::invalid_argument(format!(
                    "{kind:?}: {param:?} parameter tensor {index} has no value"
                )));
            }
        }
        if let Some(missing) = signature
            .params
            .iter()
            .find(|slot| slot.required && !seen.contains(&slot.param))
        {
            return Err(NnrtError::invalid_argument(format!(
                "{kind:?}: missing required {:?} parameter",
                missing.param
            )));
        }
        Ok(())
    }

    /// Records the graph-level inputs and outputs and makes the graph immutable.
    pub fn freeze(&mut self, inputs: &[u32], outputs: &[u32]) -> NnrtResult<()> {
        if self.is_frozen() {
            return Err(NnrtError::forbidden("graph is already frozen"));
        }
        if inputs.is_empty() || outputs.is_empty() {
            return Err(NnrtError::invalid_argument(
                "a graph needs at least one input and one output",
            ));
        }
        self.check_io_list("input", inputs)?;
        self.check_io_list("output", outputs)?;
        for index in inputs {
            let tensor = &self.tensors[*index as usize];
            if matches!(
                tensor.desc.role,
                TensorRole::Constant | TensorRole::Parameter(_)
            ) || tensor.data.is_some()
            {
                return Err(NnrtError::invalid_argument(format!(
                    "graph input {index} is a constant"
                )));
            }
        }
        for index in outputs {
            let tensor = &self.tensors[*index as usize];
            if matches!(
                tensor.desc.role,
                TensorRole::Constant | TensorRole::Parameter(_)
            ) || tensor.data.is_some()
            {
                return Err(NnrtError::invalid_argument(format!(
                    "graph output {index} is a constant"
                )));
            }
        }
        self.io = Some(GraphIo {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        Ok(())
    }

    fn check_io_list(&self, what: &str, list: &[u32]) -> NnrtResult<()> {
        for (pos, index) in list.iter().enumerate() {
            self.tensor(*index)
                .map_err(|err| err.context(format!("graph {what} list")))?;
            if list[..pos].contains(index) {
                return Err(NnrtError::invalid_argument(format!(
                    "tensor {index} appears twice in the {what} list"
                )));
            }
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.io.is_some()
    }

    pub fn input_indices(&self) -> NnrtResult<&[u32]> {
        self.io
            .as_ref()
            .map(|io| io.inputs.as_slice())
            .ok_or_else(|| NnrtError::forbidden("graph inputs are only known after freeze"))
    }

    pub fn output_indices(&self) -> NnrtResult<&[u32]> {
        self.io
            .as_ref()
            .map(|io| io.outputs.as_slice())
            .ok_or_else(|| NnrtError::forbidden("graph outputs are only known after freeze"))
    }

    pub fn input_tensors(&self) -> NnrtResult<Vec<&TensorDesc>> {
        Ok(self
            .input_indices()?
            .iter()
            .map(|i| &self.tensors[*i as usize].desc)
            .collect())
    }

    pub fn output_tensors(&self) -> NnrtResult<Vec<&TensorDesc>> {
        Ok(self
            .output_indices()?
            .iter()
            .map(|i| &self.tensors[*i as usize].desc)
            .collect())
    }

    pub fn tensor(&self, index: u32) -> NnrtResult<&GraphTensor> {
        self.tensors.get(index as usize).ok_or_else(|| {
            NnrtError::invalid_argument(format!(
                "tensor index {index} out of range (graph has {} tensors)",
                self.tensors.len()
            ))
        })
    }

    fn tensor_mut(&mut self, index: u32) -> NnrtResult<&mut GraphTensor> {
        let count = self.tensors.len();
        self.tensors.get_mut(index as usize).ok_or_else(|| {
            NnrtError::invalid_argument(format!(
                "tensor index {index} out of range (graph has {count} tensors)"
            ))
        })
    }

    pub fn tensors(&self) -> &[GraphTensor] {
        &self.tensors
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of operations consuming the tensor.
    pub fn use_count(&self, index: u32) -> usize {
        self.use_counts
            .get(index as usize)
            .copied()
            .unwrap_or(0) as usize
    }

    /// Operation producing the tensor, if any.
    pub fn producer(&self, index: u32) -> Option<usize> {
        self.producers.get(index as usize).copied().flatten()
    }
}
