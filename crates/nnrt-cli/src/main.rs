mod cli;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use nnrt_core::{DType, IntermediateGraph, OpKind, Shape, TensorDesc, TensorRole};
use nnrt_driver_ref::RefDriver;
use nnrt_runtime::identity::hardware_hash;
use nnrt_runtime::{Compilation, DeviceManager, Executor, Extensions, ModelCache};
use tracing_subscriber::EnvFilter;

const DEMO_DIMS: [usize; 3] = [3, 2, 2];

fn main() -> Result<()> {
    let cli = Cli::parse();

    std::env::set_var("RUST_LOG", &cli.log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match cli.command {
        Command::Devices => {
            register_drivers()?;
            devices()
        }
        Command::Demo {
            device,
            cache_dir,
            cache_version,
            model_name,
        } => {
            register_drivers()?;
            demo(device, cache_dir, cache_version, model_name)
        }
        Command::CacheInfo { dir, model_name } => cache_info(dir, model_name),
    }
}

/// The reference driver, once per protocol generation.
fn register_drivers() -> Result<()> {
    let manager = DeviceManager::global();
    let driver = Arc::new(RefDriver::default());
    manager.register_v1("ref-v1", driver.clone())?;
    manager.register_v2("ref-v2", driver)?;
    Ok(())
}

fn devices() -> Result<()> {
    let manager = DeviceManager::global();
    for (position, id) in manager.device_ids().into_iter().enumerate() {
        let device = manager.device(id)?;
        let info = device.info();
        let caps = device.capabilities();
        println!(
            "[{position}] {id} {} ({}, {:?}, {:?}) float16={} performance={} priority={} dynamic={} cache={}",
            info.name,
            info.vendor,
            info.class,
            info.generation,
            caps.float16,
            caps.performance_mode,
            caps.priority,
            caps.dynamic_input,
            caps.model_cache,
        );
    }
    Ok(())
}

/// `out = (a + b) + b` over float32 `[3, 2, 2]`.
fn demo_graph() -> Result<IntermediateGraph> {
    let desc = |role| TensorDesc::new(DType::F32, Shape::from_static(&DEMO_DIMS), role);
    let mut graph = IntermediateGraph::new();
    let a = graph.add_tensor(desc(TensorRole::Input))?;
    let b = graph.add_tensor(desc(TensorRole::Input))?;
    let mid = graph.add_tensor(desc(TensorRole::Intermediate))?;
    let out = graph.add_tensor(desc(TensorRole::Output))?;
    graph.add_operation(OpKind::Add, &[], &[a, b], &[mid])?;
    graph.add_operation(OpKind::Add, &[], &[mid, b], &[out])?;
    graph.freeze(&[a, b], &[out])?;
    Ok(graph)
}

fn demo(
    position: usize,
    cache_dir: Option<std::path::PathBuf>,
    cache_version: u64,
    model_name: Option<String>,
) -> Result<()> {
    let ids = DeviceManager::global().device_ids();
    let device = *ids
        .get(position)
        .with_context(|| format!("no device at position {position}, {} enumerated", ids.len()))?;

    let mut compilation = Compilation::new(demo_graph()?)?;
    compilation.set_device(device)?;
    if let Some(dir) = cache_dir {
        compilation.set_cache(dir, cache_version)?;
    }
    if let Some(name) = &model_name {
        compilation.apply_extensions(&Extensions::parse([("ModelName", name.as_bytes())])?)?;
    }

    let started = Instant::now();
    compilation.build()?;
    tracing::info!(
        %device,
        from_cache = compilation.built_from_cache(),
        build_us = started.elapsed().as_micros() as u64,
        "demo compiled"
    );

    let numel: usize = DEMO_DIMS.iter().product();
    let desc = TensorDesc::new(DType::F32, Shape::from_static(&DEMO_DIMS), TensorRole::Input);
    let a: Vec<u8> = std::iter::repeat(1.23f32.to_le_bytes()).take(numel).flatten().collect();
    let b: Vec<u8> = std::iter::repeat(2.34f32.to_le_bytes()).take(numel).flatten().collect();

    let mut executor = Executor::new(&compilation)?;
    executor.set_input(0, &desc, &a)?;
    executor.set_input(1, &desc, &b)?;
    executor.set_output(0, numel * 4)?;
    executor.run()?;

    let output = executor.output(0)?;
    let values: Vec<f32> = output
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    println!("shape {:?}", executor.output_shape(0)?);
    println!("{values:?}");
    Ok(())
}

fn cache_info(dir: std::path::PathBuf, model_name: Option<String>) -> Result<()> {
    let cache = ModelCache::new(dir, model_name.unwrap_or_default(), hardware_hash());
    let info = cache
        .inspect()
        .with_context(|| format!("reading {}", cache.record_path().display()))?;
    println!("record    {}", cache.record_path().display());
    println!("version   {}", info.version);
    println!(
        "hardware  {:#018x}{}",
        info.device_hash,
        if info.device_hash == hardware_hash() { "" } else { " (other hardware)" }
    );
    for (index, sum) in info.file_checksums.iter().enumerate() {
        println!("file {index}    {} checksum {sum:#06x}", cache.data_path(index).display());
    }
    Ok(())
}
