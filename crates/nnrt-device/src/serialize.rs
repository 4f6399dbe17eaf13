use nnrt_core::{IntermediateGraph, NnrtError, NnrtResult, SharedBuffer};
use nnrt_proto::{DataRef, WireModel};
use tracing::debug;

use crate::mapping::TensorMapping;
use crate::op_builder::{OperationBuilder, PendingConstant};
use crate::profile::GenerationProfile;

#[derive(Debug)]
pub struct SerializedGraph {
    pub model: WireModel,
    /// `None` when no constant carries any bytes.
    pub constants: Option<SharedBuffer>,
    pub mapping: TensorMapping,
}

/// Converts a frozen graph into the wire format of `profile`.
///
/// Constant payloads are laid out back to back in one buffer obtained
/// from `allocate`, in the order the builder emitted them.
pub fn serialize_graph(
    graph: &IntermediateGraph,
    profile: &'static GenerationProfile,
    allocate: impl FnOnce(usize) -> NnrtResult<SharedBuffer>,
) -> NnrtResult<SerializedGraph> {
    if !graph.is_frozen() {
        return Err(NnrtError::forbidden("only frozen graphs can be serialized"));
    }

    let mut builder = OperationBuilder::new(graph, profile);
    let inputs = graph
        .input_indices()?
        .iter()
        .map(|client| builder.io_tensor(*client))
        .collect::<NnrtResult<Vec<_>>>()?;
    for op in graph.operations() {
        builder
            .add_operation(op)
            .map_err(|err| err.context(format!("{:?}", op.kind)))?;
    }
    let outputs = graph
        .output_indices()?
        .iter()
        .map(|client| builder.io_tensor(*client))
        .collect::<NnrtResult<Vec<_>>>()?;
    builder.set_io(inputs, outputs);

    let (mut model, pending, mapping) = builder.finish();
    let constants = stage_constants(&mut model, &pending, allocate)?;
    debug!(
        version = model.version,
        tensors = model.tensors.len(),
        ops = model.ops.len(),
        constant_bytes = constants.as_ref().map_or(0, SharedBuffer::len),
        "graph serialized"
    );
    Ok(SerializedGraph {
        model,
        constants,
        mapping,
    })
}

fn stage_constants(
    model: &mut WireModel,
    pending: &[PendingConstant],
    allocate: impl FnOnce(usize) -> NnrtResult<SharedBuffer>,
) -> NnrtResult<Option<SharedBuffer>> {
    let total: usize = pending.iter().map(|c| c.data.len()).sum();
    let mut buffer = if total == 0 {
        None
    } else {
        Some(allocate(total).map_err(|err| err.context("staging constants"))?)
    };

    let mut offset = 0usize;
    for constant in pending {
        let len = constant.data.len();
        if let Some(buffer) = buffer.as_mut() {
            buffer.as_mut_slice()[offset..offset + len].copy_from_slice(&constant.data);
        }
        model.tensors[constant.index as usize].data = Some(DataRef {
            offset: offset as u64,
            len: len as u64,
        });
        offset += len;
    }

    if let Some(buffer) = &buffer {
        buffer.flush()?;
    }
    Ok(buffer)
}
