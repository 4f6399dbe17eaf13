mod common;

use anyhow::{ensure, Result};
use common::{chained_add, f32_bytes, read_f32, static_dims, tensor, Harness};
use half::f16;
use nnrt_core::{DType, ErrorKind, IntermediateGraph, OpKind, QuantParams, TensorRole};
use nnrt_driver_ref::RefDriverConfig;
use nnrt_runtime::{Executor, Extensions};

#[test]
fn chained_float_add_on_both_generations() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = static_dims(&[3, 2, 2]);
    let desc = tensor(DType::F32, &dims, TensorRole::Input, None);

    for device in [harness.v1, harness.v2] {
        let mut compilation = harness.compile(chained_add(DType::F32, &dims, None, None)?, device)?;
        compilation.build()?;

        let mut executor = Executor::new(&compilation)?;
        executor.set_input(0, &desc, &f32_bytes(&[1.23; 12]))?;
        executor.set_input(1, &desc, &f32_bytes(&[2.34; 12]))?;
        executor.set_output(0, 48)?;
        executor.run()?;

        let output = read_f32(&executor.output(0)?);
        assert_eq!(output.len(), 12);
        for value in output {
            ensure!((value - 5.91).abs() < 1e-4, "got {value}, expected 5.91");
        }
        assert_eq!(executor.output_shape(0)?, &[3, 2, 2]);
        drop(executor);
        assert_eq!(harness.live_buffers(), 0);
    }
    Ok(())
}

#[test]
fn chained_quantized_add() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = static_dims(&[3, 2, 2]);
    let input_quant = QuantParams::per_tensor(0.2, 0, 8);
    let result_quant = QuantParams::per_tensor(0.4, 0, 8);
    let graph = chained_add(DType::I8, &dims, Some(&input_quant), Some(&result_quant))?;
    let output_desc = graph.output_tensors()?[0].clone();
    assert_eq!(output_desc.quant, Some(result_quant));

    let mut compilation = harness.compile(graph, harness.v2)?;
    compilation.build()?;
    let desc = tensor(DType::I8, &dims, TensorRole::Input, Some(&input_quant));
    let mut executor = Executor::new(&compilation)?;
    executor.set_input(0, &desc, &[4u8; 12])?;
    executor.set_input(1, &desc, &[8u8; 12])?;
    executor.set_output(0, 12)?;
    executor.run()?;
    assert_eq!(&*executor.output(0)?, &[10u8; 12]);
    Ok(())
}

#[test]
fn dynamic_dimension_is_resolved_at_bind_time() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = [None, Some(2)];
    let mut compilation = harness.compile(chained_add(DType::F32, &dims, None, None)?, harness.v2)?;
    compilation.build()?;

    let ranges = compilation.input_dim_ranges()?.expect("generation 2 reports ranges");
    assert_eq!((ranges[0][0].min, ranges[0][0].max), (1, 1024));
    assert_eq!((ranges[0][1].min, ranges[0][1].max), (2, 2));

    let mut executor = Executor::new(&compilation)?;
    let err = executor.output_shape(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);

    let bound = tensor(DType::F32, &static_dims(&[3, 2]), TensorRole::Input, None);
    let data = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    executor.set_input(0, &bound, &data)?;
    executor.set_input(1, &bound, &data)?;

    for bad in [&[3, 5][..], &[0, 2][..], &[2000, 2][..]] {
        let desc = tensor(DType::F32, &static_dims(bad), TensorRole::Input, None);
        let payload = vec![0u8; desc.byte_len().unwrap_or(4)];
        let err = executor.set_input(0, &desc, &payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{bad:?}");
    }
    let unresolved = tensor(DType::F32, &dims, TensorRole::Input, None);
    let err = executor.set_input(0, &unresolved, &data).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    executor.set_output(0, 24)?;
    executor.run()?;
    assert_eq!(executor.output_shape(0)?, &[3, 2]);
    assert_eq!(
        read_f32(&executor.output(0)?),
        vec![3.0, 6.0, 9.0, 12.0, 15.0, 18.0]
    );
    Ok(())
}

#[test]
fn pinned_input_dims_restrict_binding() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = [None, Some(2)];
    let mut compilation = harness.compile(chained_add(DType::F32, &dims, None, None)?, harness.v2)?;
    let extensions = Extensions::parse([("InputDims", b"0:3,2".as_slice())])?;
    compilation.apply_extensions(&extensions)?;
    compilation.build()?;

    let ranges = compilation.input_dim_ranges()?.expect("generation 2 reports ranges");
    assert_eq!((ranges[0][0].min, ranges[0][0].max), (3, 3));

    let mut executor = Executor::new(&compilation)?;
    let four = tensor(DType::F32, &static_dims(&[4, 2]), TensorRole::Input, None);
    let err = executor.set_input(0, &four, &[0u8; 32]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let restated = Extensions::parse([("InputDims", b"0:-1,3".as_slice())])?;
    let mut other = harness.compile(chained_add(DType::F32, &dims, None, None)?, harness.v2)?;
    let err = other.apply_extensions(&restated).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[test]
fn dynamic_inputs_need_a_capable_device() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let mut compilation =
        harness.compile(chained_add(DType::F32, &[None, Some(2)], None, None)?, harness.v1)?;
    let err = compilation.build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);
    Ok(())
}

#[test]
fn half_precision_io_is_widened_for_generation_1() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = static_dims(&[2, 2]);
    let mut compilation = harness.compile(chained_add(DType::F16, &dims, None, None)?, harness.v1)?;
    compilation.build()?;

    let half_bytes = |v: f32| -> Vec<u8> {
        std::iter::repeat(f16::from_f32(v).to_le_bytes())
            .take(4)
            .flatten()
            .collect()
    };
    let desc = tensor(DType::F16, &dims, TensorRole::Input, None);
    let mut executor = Executor::new(&compilation)?;
    executor.set_input(0, &desc, &half_bytes(1.5))?;
    executor.set_input(1, &desc, &half_bytes(2.25))?;
    executor.set_output(0, 8)?;
    executor.run()?;
    assert_eq!(&*executor.output(0)?, half_bytes(6.0).as_slice());

    let shared = executor.allocate_input_memory(0, 8)?;
    let err = executor.set_input_with_memory(0, None, shared).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    // The rejected buffer went back to the device.
    assert_eq!(harness.live_buffers(), 3);
    Ok(())
}

#[test]
fn shared_memory_and_copies_mix() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = static_dims(&[3, 2, 2]);
    let mut compilation = harness.compile(chained_add(DType::F32, &dims, None, None)?, harness.v2)?;
    compilation.build()?;
    let desc = tensor(DType::F32, &dims, TensorRole::Input, None);

    let mut executor = Executor::new(&compilation)?;
    let mut input = executor.allocate_input_memory(0, 48)?;
    input.as_mut_slice().copy_from_slice(&f32_bytes(&[1.0; 12]));
    let output = executor.allocate_output_memory(0, 48)?;
    assert_eq!(harness.live_buffers(), 2);

    executor.set_input_with_memory(0, None, input)?;
    executor.set_input(1, &desc, &f32_bytes(&[0.5; 12]))?;
    executor.set_output_with_memory(0, output)?;
    executor.run()?;
    assert_eq!(read_f32(&executor.output(0)?), vec![2.0; 12]);
    assert_eq!(harness.live_buffers(), 3);

    // Bound memory is refilled in place and run again.
    executor
        .input_memory_mut(0)?
        .as_mut_slice()
        .copy_from_slice(&f32_bytes(&[2.0; 12]));
    executor.run()?;
    assert_eq!(read_f32(&executor.output(0)?), vec![3.0; 12]);
    let err = executor.input_memory_mut(1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);

    let input = executor.unbind_input(0)?.expect("shared input comes back");
    let output = executor.unbind_output(0)?.expect("shared output comes back");
    assert_eq!(read_f32(output.as_slice()), vec![3.0; 12]);
    assert_eq!(executor.output(0).unwrap_err().kind(), ErrorKind::OperationForbidden);
    assert_eq!(executor.run().unwrap_err().kind(), ErrorKind::InvalidArgument);

    // Staged copies are released rather than handed back.
    assert!(executor.unbind_input(1)?.is_none());
    assert_eq!(harness.live_buffers(), 2);
    executor.destroy_input_memory(0, input)?;
    executor.destroy_output_memory(0, output)?;
    assert_eq!(harness.live_buffers(), 0);

    assert!(executor.allocate_input_memory(0, 0).is_err());
    assert!(executor.allocate_output_memory(1, 4).is_err());
    drop(executor);
    assert_eq!(harness.live_buffers(), 0);
    Ok(())
}

#[test]
fn binding_errors_are_invalid_arguments() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = static_dims(&[3, 2, 2]);
    let mut compilation = harness.compile(chained_add(DType::F32, &dims, None, None)?, harness.v2)?;
    compilation.build()?;
    let desc = tensor(DType::F32, &dims, TensorRole::Input, None);
    let data = f32_bytes(&[1.0; 12]);

    let mut executor = Executor::new(&compilation)?;
    let checks = [
        executor.set_input(2, &desc, &data).unwrap_err(),
        executor.set_input(0, &desc, &[]).unwrap_err(),
        executor.set_input(0, &desc, &data[..40]).unwrap_err(),
        executor
            .set_input(0, &tensor(DType::I32, &dims, TensorRole::Input, None), &data)
            .unwrap_err(),
        executor.set_output(0, 0).unwrap_err(),
        executor.set_output(1, 48).unwrap_err(),
    ];
    for err in checks {
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{err}");
    }

    executor.set_input(0, &desc, &data)?;
    executor.set_output(0, 48)?;
    let err = executor.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    executor.set_input(1, &desc, &data)?;
    executor.set_output(0, 16)?;
    let err = executor.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    executor.set_output(0, 48)?;
    executor.run()?;
    assert_eq!(read_f32(&executor.output(0)?), vec![3.0; 12]);

    // Rebinding released every replaced staging buffer.
    assert_eq!(harness.live_buffers(), 3);
    drop(executor);
    assert_eq!(harness.live_buffers(), 0);
    Ok(())
}

/// `sum = a + b` and `again = a + b`, with a dynamic leading dimension.
fn twin_sums(dims: &[Option<usize>]) -> Result<IntermediateGraph> {
    let mut graph = IntermediateGraph::new();
    let a = graph.add_tensor(tensor(DType::F32, dims, TensorRole::Input, None))?;
    let b = graph.add_tensor(tensor(DType::F32, dims, TensorRole::Input, None))?;
    let sum = graph.add_tensor(tensor(DType::F32, dims, TensorRole::Output, None))?;
    let again = graph.add_tensor(tensor(DType::F32, dims, TensorRole::Output, None))?;
    graph.add_operation(OpKind::Add, &[], &[a, b], &[sum])?;
    graph.add_operation(OpKind::Add, &[], &[a, b], &[again])?;
    graph.freeze(&[a, b], &[sum, again])?;
    Ok(graph)
}

#[test]
fn undersized_output_leaves_every_shape_unresolved() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let dims = [None, Some(2)];
    let mut compilation = harness.compile(twin_sums(&dims)?, harness.v2)?;
    compilation.build()?;

    let bound = tensor(DType::F32, &static_dims(&[3, 2]), TensorRole::Input, None);
    let data = f32_bytes(&[1.0; 6]);
    let mut executor = Executor::new(&compilation)?;
    executor.set_input(0, &bound, &data)?;
    executor.set_input(1, &bound, &data)?;
    executor.set_output(0, 24)?;
    executor.set_output(1, 8)?;

    let err = executor.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    for index in 0..2 {
        assert_eq!(
            executor.output_shape(index).unwrap_err().kind(),
            ErrorKind::OperationForbidden
        );
        assert_eq!(
            executor.output(index).unwrap_err().kind(),
            ErrorKind::OperationForbidden
        );
    }

    executor.set_output(1, 24)?;
    executor.run()?;
    assert_eq!(executor.output_shape(0)?, &[3, 2]);
    assert_eq!(executor.output_shape(1)?, &[3, 2]);
    assert_eq!(read_f32(&executor.output(1)?), vec![2.0; 6]);
    Ok(())
}
