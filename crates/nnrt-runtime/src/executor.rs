//! Binding tensors to a built compilation and running it.
//!
//! Every slot is bound either by copy (the executor stages the bytes in
//! a device buffer it allocates) or to a caller-allocated shared buffer
//! moved into the executor. Both styles can be mixed across slots.
//! Bound buffers go back to the device when rebound or when the
//! executor is dropped, unless the caller unbinds them first.

use std::borrow::Cow;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use nnrt_core::{
    ensure_arg, Device, DimRange, IoTensor, IoTensorMut, NnrtError, NnrtResult, PreparedModel,
    SharedBuffer, TensorDesc, TypeConversion,
};
use tracing::{debug, warn};

use crate::compilation::Compilation;

struct InputBinding {
    /// Driver-side descriptor with every dimension resolved.
    desc: TensorDesc,
    /// Caller memory rather than an executor-staged copy.
    shared: bool,
    length: usize,
}

struct OutputBinding {
    shared: bool,
    /// Capacity on the driver side, in bytes.
    length: usize,
}

/// Buffers bound to slots, staged copies and caller memory alike.
///
/// Whatever is still here when a slot is rebound or the executor is
/// dropped goes back to the device.
struct Slots {
    device: Arc<dyn Device>,
    inputs: Vec<Option<SharedBuffer>>,
    outputs: Vec<Option<SharedBuffer>>,
}

impl Slots {
    fn release(&self, buffer: Option<SharedBuffer>) {
        if let Some(buffer) = buffer {
            if let Err(err) = self.device.release_buffer(buffer) {
                warn!(%err, "failed to release bound buffer");
            }
        }
    }

    fn set_input(&mut self, index: usize, buffer: Option<SharedBuffer>) {
        let old = mem::replace(&mut self.inputs[index], buffer);
        self.release(old);
    }

    fn set_output(&mut self, index: usize, buffer: Option<SharedBuffer>) {
        let old = mem::replace(&mut self.outputs[index], buffer);
        self.release(old);
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        let buffers: Vec<SharedBuffer> = self
            .inputs
            .drain(..)
            .chain(self.outputs.drain(..))
            .flatten()
            .collect();
        for buffer in buffers {
            self.release(Some(buffer));
        }
    }
}

fn wire_desc(client: &TensorDesc, conversion: TypeConversion) -> TensorDesc {
    TensorDesc {
        dtype: conversion.wire_dtype(client.dtype),
        shape: client.shape.clone(),
        quant: client.quant.as_ref().map(|q| conversion.wire_quant(q)),
        role: client.role,
    }
}

fn byte_len(desc: &TensorDesc) -> NnrtResult<usize> {
    desc.byte_len().ok_or_else(|| {
        NnrtError::invalid_argument(format!(
            "{:?} tensor with shape {:?} has no fixed byte length",
            desc.dtype,
            desc.shape.dims()
        ))
    })
}

/// One set of bindings for a built compilation.
///
/// The borrow on the compilation keeps the prepared model alive for as
/// long as the executor exists.
pub struct Executor<'a> {
    compilation: &'a Compilation,
    prepared: &'a dyn PreparedModel,
    ranges: Option<&'a [Vec<DimRange>]>,
    inputs_declared: Vec<TensorDesc>,
    input_conversions: Vec<TypeConversion>,
    outputs_wire: Vec<TensorDesc>,
    output_conversions: Vec<TypeConversion>,
    inputs: Vec<Option<InputBinding>>,
    outputs: Vec<Option<OutputBinding>>,
    slots: Slots,
    output_shapes: Vec<Option<Vec<usize>>>,
    /// Driver-side bytes written per output by the last run.
    produced: Vec<Option<usize>>,
}

impl<'a> Executor<'a> {
    pub fn new(compilation: &'a Compilation) -> NnrtResult<Self> {
        let built = compilation.built()?;
        let graph = compilation.graph();
        let device = Arc::clone(&built.device);

        let inputs_declared: Vec<TensorDesc> =
            graph.input_tensors()?.into_iter().cloned().collect();
        let outputs_declared: Vec<TensorDesc> =
            graph.output_tensors()?.into_iter().cloned().collect();
        let input_conversions = inputs_declared
            .iter()
            .map(|desc| device.io_conversion(desc))
            .collect::<NnrtResult<Vec<_>>>()?;
        let output_conversions = outputs_declared
            .iter()
            .map(|desc| device.io_conversion(desc))
            .collect::<NnrtResult<Vec<_>>>()?;
        let outputs_wire = outputs_declared
            .iter()
            .zip(&output_conversions)
            .map(|(desc, conversion)| wire_desc(desc, *conversion))
            .collect();
        let output_shapes = outputs_declared
            .iter()
            .map(|desc| desc.shape.concrete())
            .collect();

        let (n_in, n_out) = (inputs_declared.len(), outputs_declared.len());
        Ok(Self {
            compilation,
            prepared: built.prepared.as_ref(),
            ranges: built.ranges.as_deref(),
            inputs_declared,
            input_conversions,
            outputs_wire,
            output_conversions,
            inputs: (0..n_in).map(|_| None).collect(),
            outputs: (0..n_out).map(|_| None).collect(),
            slots: Slots {
                device,
                inputs: (0..n_in).map(|_| None).collect(),
                outputs: (0..n_out).map(|_| None).collect(),
            },
            output_shapes,
            produced: vec![None; n_out],
        })
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn check_input(&self, index: usize) -> NnrtResult<&TensorDesc> {
        self.inputs_declared.get(index).ok_or_else(|| {
            NnrtError::invalid_argument(format!(
                "input index {index} out of range ({} inputs)",
                self.inputs_declared.len()
            ))
        })
    }

    fn check_output(&self, index: usize) -> NnrtResult<()> {
        ensure_arg!(
            index < self.outputs.len(),
            "output index {index} out of range ({} outputs)",
            self.outputs.len()
        );
        Ok(())
    }

    /// Client descriptor of input `index` with every dimension resolved.
    fn resolve_input(&self, index: usize, desc: Option<&TensorDesc>) -> NnrtResult<TensorDesc> {
        let declared = self.check_input(index)?;
        let shape = match desc {
            None => {
                ensure_arg!(
                    declared.shape.is_static(),
                    "input {index} has dynamic dimensions; bind it with a descriptor"
                );
                declared.shape.clone()
            }
            Some(desc) => {
                ensure_arg!(
                    desc.dtype == declared.dtype,
                    "input {index} is {:?}, got {:?}",
                    declared.dtype,
                    desc.dtype
                );
                ensure_arg!(
                    desc.shape.rank() == declared.shape.rank(),
                    "input {index} has rank {}, got {}",
                    declared.shape.rank(),
                    desc.shape.rank()
                );
                for (axis, (declared, given)) in
                    declared.shape.dims().iter().zip(desc.shape.dims()).enumerate()
                {
                    match (declared, given) {
                        (_, None) | (_, Some(0)) => {
                            return Err(NnrtError::invalid_argument(format!(
                                "input {index}: dimension {axis} must be a positive value"
                            )))
                        }
                        (Some(declared), Some(given)) if declared != given => {
                            return Err(NnrtError::invalid_argument(format!(
                                "input {index}: static dimension {axis} is {declared}, got {given}"
                            )))
                        }
                        _ => {}
                    }
                }
                desc.shape.clone()
            }
        };

        if let Some(pinned) = self
            .compilation
            .options()
            .input_dims
            .iter()
            .find(|o| o.input == index)
        {
            for (axis, (pinned, given)) in pinned.dims.iter().zip(shape.dims()).enumerate() {
                if let (Some(pinned), Some(given)) = (pinned, given) {
                    ensure_arg!(
                        pinned == given,
                        "input {index}: dimension {axis} is pinned to {pinned}, got {given}"
                    );
                }
            }
        }

        if let Some(ranges) = self.ranges.and_then(|ranges| ranges.get(index)) {
            for (axis, (range, dim)) in ranges.iter().zip(shape.dims()).enumerate() {
                let dim = dim.unwrap_or(0);
                ensure_arg!(
                    range.contains(dim),
                    "input {index}: dimension {axis} = {dim} outside [{}, {}]",
                    range.min,
                    range.max
                );
            }
        }

        Ok(TensorDesc {
            shape,
            ..declared.clone()
        })
    }

    /// Copies `data` into a staged device buffer bound to input `index`.
    pub fn set_input(&mut self, index: usize, desc: &TensorDesc, data: &[u8]) -> NnrtResult<()> {
        ensure_arg!(!data.is_empty(), "input {index}: data must not be empty");
        let client = self.resolve_input(index, Some(desc))?;
        let expected = byte_len(&client)?;
        ensure_arg!(
            data.len() == expected,
            "input {index}: expected {expected} bytes, got {}",
            data.len()
        );
        let conversion = self.input_conversions[index];
        let wire = conversion.to_wire(data);
        let mut buffer = self.slots.device.allocate_buffer(wire.len())?;
        buffer.as_mut_slice().copy_from_slice(&wire);
        let length = wire.len();
        self.slots.set_input(index, Some(buffer));
        self.inputs[index] = Some(InputBinding {
            desc: wire_desc(&client, conversion),
            shared: false,
            length,
        });
        Ok(())
    }

    /// Binds a caller-allocated buffer to input `index` without copying.
    ///
    /// The executor holds the buffer until [`Executor::unbind_input`]
    /// hands it back; a buffer that fails validation, or is still bound
    /// when the slot is rebound or the executor dropped, is released to
    /// the device. `desc` may be omitted when the declared input is fully
    /// static.
    pub fn set_input_with_memory(
        &mut self,
        index: usize,
        desc: Option<&TensorDesc>,
        buffer: SharedBuffer,
    ) -> NnrtResult<()> {
        let (client, length) = match self.check_shared_input(index, desc, &buffer) {
            Ok(checked) => checked,
            Err(err) => {
                self.slots.release(Some(buffer));
                return Err(err);
            }
        };
        self.slots.set_input(index, Some(buffer));
        self.inputs[index] = Some(InputBinding {
            desc: client,
            shared: true,
            length,
        });
        Ok(())
    }

    fn check_shared_input(
        &self,
        index: usize,
        desc: Option<&TensorDesc>,
        buffer: &SharedBuffer,
    ) -> NnrtResult<(TensorDesc, usize)> {
        let client = self.resolve_input(index, desc)?;
        let conversion = self.input_conversions[index];
        ensure_arg!(
            conversion == TypeConversion::None,
            "input {index} needs {conversion:?} and cannot be bound to shared memory"
        );
        let length = byte_len(&client)?;
        ensure_arg!(
            buffer.len() >= length,
            "input {index}: buffer holds {} bytes, tensor needs {length}",
            buffer.len()
        );
        Ok((client, length))
    }

    /// Binds output `index` to a staged buffer holding up to `length`
    /// client bytes; read it back with [`Executor::output`].
    pub fn set_output(&mut self, index: usize, length: usize) -> NnrtResult<()> {
        self.check_output(index)?;
        ensure_arg!(length > 0, "output {index}: length must be non-zero");
        let wire_len = self.output_conversions[index].wire_len(length);
        let buffer = self.slots.device.allocate_buffer(wire_len)?;
        self.slots.set_output(index, Some(buffer));
        self.outputs[index] = Some(OutputBinding {
            shared: false,
            length: wire_len,
        });
        self.produced[index] = None;
        Ok(())
    }

    /// Binds a caller-allocated buffer to output `index`, held the same
    /// way as [`Executor::set_input_with_memory`].
    pub fn set_output_with_memory(&mut self, index: usize, buffer: SharedBuffer) -> NnrtResult<()> {
        let checked = self.check_output(index).and_then(|()| {
            let conversion = self.output_conversions[index];
            ensure_arg!(
                conversion == TypeConversion::None,
                "output {index} needs {conversion:?} and cannot be bound to shared memory"
            );
            Ok(())
        });
        if let Err(err) = checked {
            self.slots.release(Some(buffer));
            return Err(err);
        }
        let length = buffer.len();
        self.slots.set_output(index, Some(buffer));
        self.outputs[index] = Some(OutputBinding {
            shared: true,
            length,
        });
        self.produced[index] = None;
        Ok(())
    }

    /// Clears input `index`. Caller memory comes back for refilling or
    /// [`Executor::destroy_input_memory`]; a staged copy is released.
    pub fn unbind_input(&mut self, index: usize) -> NnrtResult<Option<SharedBuffer>> {
        self.check_input(index)?;
        let binding = self.inputs[index].take();
        let buffer = self.slots.inputs[index].take();
        Ok(self.hand_back(binding.is_some_and(|b| b.shared), buffer))
    }

    /// Clears output `index`, handing caller memory back like
    /// [`Executor::unbind_input`].
    pub fn unbind_output(&mut self, index: usize) -> NnrtResult<Option<SharedBuffer>> {
        self.check_output(index)?;
        let binding = self.outputs[index].take();
        let buffer = self.slots.outputs[index].take();
        self.produced[index] = None;
        Ok(self.hand_back(binding.is_some_and(|b| b.shared), buffer))
    }

    /// Caller memory bound to input `index`, for refilling between runs.
    pub fn input_memory_mut(&mut self, index: usize) -> NnrtResult<&mut SharedBuffer> {
        self.check_input(index)?;
        match (&self.inputs[index], self.slots.inputs[index].as_mut()) {
            (Some(binding), Some(buffer)) if binding.shared => Ok(buffer),
            _ => Err(NnrtError::forbidden(format!(
                "input {index} is not bound to shared memory"
            ))),
        }
    }

    fn hand_back(&self, shared: bool, buffer: Option<SharedBuffer>) -> Option<SharedBuffer> {
        if shared {
            return buffer;
        }
        self.slots.release(buffer);
        None
    }

    /// Allocates a device buffer for input `index`, owned by the caller
    /// until it is bound.
    pub fn allocate_input_memory(&self, index: usize, length: usize) -> NnrtResult<SharedBuffer> {
        self.check_input(index)?;
        ensure_arg!(length > 0, "input {index}: length must be non-zero");
        self.slots.device.allocate_buffer(length)
    }

    pub fn allocate_output_memory(&self, index: usize, length: usize) -> NnrtResult<SharedBuffer> {
        self.check_output(index)?;
        ensure_arg!(length > 0, "output {index}: length must be non-zero");
        self.slots.device.allocate_buffer(length)
    }

    pub fn destroy_input_memory(&self, index: usize, buffer: SharedBuffer) -> NnrtResult<()> {
        self.check_input(index)?;
        self.slots.device.release_buffer(buffer)
    }

    pub fn destroy_output_memory(&self, index: usize, buffer: SharedBuffer) -> NnrtResult<()> {
        self.check_output(index)?;
        self.slots.device.release_buffer(buffer)
    }

    /// Runs the prepared model over the current bindings.
    ///
    /// Resolved shapes and produced byte counts change only when every
    /// output buffer was large enough.
    pub fn run(&mut self) -> NnrtResult<()> {
        if let Some(index) = self.inputs.iter().position(Option::is_none) {
            return Err(NnrtError::invalid_argument(format!("input {index} is not bound")));
        }
        if let Some(index) = self.outputs.iter().position(Option::is_none) {
            return Err(NnrtError::invalid_argument(format!("output {index} is not bound")));
        }
        self.produced.iter_mut().for_each(|p| *p = None);

        let unbacked = || NnrtError::failed("bound slot has no buffer");
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for (binding, buffer) in self.inputs.iter().zip(&self.slots.inputs) {
            let Some(binding) = binding else { continue };
            inputs.push(IoTensor {
                desc: binding.desc.clone(),
                buffer: buffer.as_ref().ok_or_else(unbacked)?,
                length: binding.length,
            });
        }
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for ((binding, buffer), desc) in self
            .outputs
            .iter()
            .zip(self.slots.outputs.iter_mut())
            .zip(&self.outputs_wire)
        {
            let Some(binding) = binding else { continue };
            outputs.push(IoTensorMut {
                desc: desc.clone(),
                buffer: buffer.as_mut().ok_or_else(unbacked)?,
                length: binding.length,
            });
        }

        let started = Instant::now();
        let results = self.prepared.run(&inputs, &mut outputs)?;
        drop(outputs);
        drop(inputs);

        if let Some((index, result)) = results.iter().enumerate().find(|(_, r)| !r.sufficient) {
            return Err(NnrtError::invalid_argument(format!(
                "output {index}: bound buffer is too small for shape {:?}",
                result.dims
            )));
        }
        for (index, result) in results.into_iter().enumerate() {
            let elem = self.outputs_wire[index].dtype.size_in_bytes().unwrap_or(0);
            self.produced[index] = Some(result.dims.iter().product::<usize>() * elem);
            self.output_shapes[index] = Some(result.dims);
        }
        debug!(
            elapsed_us = started.elapsed().as_micros() as u64,
            "executor run finished"
        );
        Ok(())
    }

    /// Client bytes produced for output `index` by the last run.
    pub fn output(&self, index: usize) -> NnrtResult<Cow<'_, [u8]>> {
        self.check_output(index)?;
        let produced = self.produced[index].ok_or_else(|| {
            NnrtError::forbidden(format!("output {index} has not been produced yet"))
        })?;
        let buffer = self.slots.outputs[index]
            .as_ref()
            .ok_or_else(|| NnrtError::failed(format!("output {index} has no buffer")))?;
        let bytes = buffer.as_slice().get(..produced).ok_or_else(|| {
            NnrtError::failed(format!("output {index}: driver reported more data than fits"))
        })?;
        Ok(self.output_conversions[index].from_wire(bytes))
    }

    /// Shape of output `index`: declared when static, otherwise as
    /// resolved by the last run.
    pub fn output_shape(&self, index: usize) -> NnrtResult<&[usize]> {
        self.check_output(index)?;
        self.output_shapes[index].as_deref().ok_or_else(|| {
            NnrtError::forbidden(format!(
                "output {index} has a dynamic shape that is only known after a run"
            ))
        })
    }
}
