mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{chained_add, static_dims, Harness};
use nnrt_core::{
    DType, DeviceClass, DeviceId, ErrorKind, IntermediateGraph, PerformanceMode, Priority, Shape,
    TensorDesc, TensorRole,
};
use nnrt_driver_ref::{PrepareFailure, RefDriver, RefDriverConfig};
use nnrt_proto::hdi::v2::DeviceStatus;
use nnrt_proto::WireDeviceType;
use nnrt_runtime::{Compilation, DeviceManager, Executor, ReturnCode};

fn float_graph() -> Result<IntermediateGraph> {
    chained_add(DType::F32, &static_dims(&[3, 2, 2]), None, None)
}

#[test]
fn setters_are_forbidden_once_built() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;
    let mut compilation = harness.compile(float_graph()?, harness.v2)?;
    compilation.set_performance_mode(PerformanceMode::High)?;
    compilation.set_priority(Priority::Low)?;
    compilation.set_float16(true)?;
    compilation.build()?;
    assert!(compilation.is_built());

    let errors = [
        compilation.set_device(harness.v1).unwrap_err(),
        compilation.set_cache("/tmp/nnrt", 1).unwrap_err(),
        compilation.set_performance_mode(PerformanceMode::Low).unwrap_err(),
        compilation.set_priority(Priority::High).unwrap_err(),
        compilation.set_float16(false).unwrap_err(),
        compilation
            .apply_extensions(&nnrt_runtime::Extensions::default())
            .unwrap_err(),
    ];
    for err in errors {
        assert_eq!(err.kind(), ErrorKind::OperationForbidden, "{err}");
    }

    // A second build is a successful no-op.
    compilation.build()?;
    assert_eq!(compilation.options().priority, Priority::Low);
    Ok(())
}

#[test]
fn build_needs_a_known_device() -> Result<()> {
    let harness = Harness::new(RefDriverConfig::default())?;

    let mut unset = Compilation::with_device_manager(float_graph()?, Arc::clone(&harness.manager))?;
    let err = unset.build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);
    assert_eq!(ReturnCode::from(&err), ReturnCode::OperationForbidden);

    let err = Executor::new(&unset).err().expect("unbuilt compilation");
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);

    let mut unknown = harness.compile(float_graph()?, DeviceId(7))?;
    let err = unknown.build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut open = IntermediateGraph::new();
    open.add_tensor(TensorDesc::new(
        DType::F32,
        Shape::from_static(&[1]),
        TensorRole::Input,
    ))?;
    let err = Compilation::with_device_manager(open, Arc::clone(&harness.manager))
        .err()
        .expect("graph is not frozen");
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);
    Ok(())
}

#[test]
fn unsupported_configuration_is_rejected_before_prepare() -> Result<()> {
    let harness = Harness::new(RefDriverConfig {
        float16: false,
        priority: false,
        model_cache: false,
        ..RefDriverConfig::default()
    })?;

    let mut priority = harness.compile(float_graph()?, harness.v2)?;
    priority.set_priority(Priority::High)?;
    assert_eq!(priority.build().unwrap_err().kind(), ErrorKind::OperationForbidden);

    let mut half = harness.compile(float_graph()?, harness.v1)?;
    half.set_float16(true)?;
    assert_eq!(half.build().unwrap_err().kind(), ErrorKind::OperationForbidden);

    let cache_dir = tempfile::tempdir()?;
    let mut cached = harness.compile(float_graph()?, harness.v2)?;
    cached.set_cache(cache_dir.path(), 1)?;
    assert_eq!(cached.build().unwrap_err().kind(), ErrorKind::OperationForbidden);
    assert_eq!(std::fs::read_dir(cache_dir.path())?.count(), 0);

    // Rejected configurations can be adjusted and built again.
    priority.set_priority(Priority::None)?;
    priority.build()?;
    assert_eq!(harness.live_buffers(), 0);
    Ok(())
}

#[test]
fn driver_prepare_failures_map_to_error_kinds() -> Result<()> {
    for (failure, kind, code) in [
        (
            PrepareFailure::RejectConfig,
            ErrorKind::Unavailable,
            ReturnCode::UnavailableDevice,
        ),
        (PrepareFailure::Internal, ErrorKind::Failed, ReturnCode::Failed),
    ] {
        let harness = Harness::new(RefDriverConfig {
            prepare_failure: Some(failure),
            ..RefDriverConfig::default()
        })?;
        for device in [harness.v1, harness.v2] {
            let mut compilation = harness.compile(float_graph()?, device)?;
            let result = compilation.build();
            assert_eq!(ReturnCode::from_result(&result), code);
            assert_eq!(result.unwrap_err().kind(), kind);
            assert!(!compilation.is_built());
        }
        // Serialized constants went back to the driver on the failure path.
        assert_eq!(harness.live_buffers(), 0);
    }
    Ok(())
}

#[test]
fn enumeration_happens_once() -> Result<()> {
    let online = Arc::new(RefDriver::default());
    let offline = Arc::new(RefDriver::new(RefDriverConfig {
        name: "ref-offline".to_string(),
        status: DeviceStatus::Offline,
        ..RefDriverConfig::default()
    }));

    let manager = DeviceManager::new();
    manager.register_v2("online", online.clone())?;
    manager.register_v2("same-device-again", online.clone())?;
    manager.register_v2("offline", offline)?;

    let ids = manager.device_ids();
    assert_eq!(ids.len(), 1);
    assert_eq!(manager.info(ids[0])?.name, "ref-cpu");
    assert_eq!(manager.find("ref-cpu"), Some(ids[0]));
    assert_eq!(manager.find("ref-offline"), None);

    let err = manager.register_v1("late", online).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationForbidden);
    assert_eq!(manager.device_ids(), ids);
    Ok(())
}

#[test]
fn distinct_devices_keep_distinct_ids() -> Result<()> {
    let base = RefDriverConfig::default();
    let variants = [
        base.clone(),
        RefDriverConfig {
            device_type: WireDeviceType::Gpu,
            ..base.clone()
        },
        RefDriverConfig {
            name: "ref-other".to_string(),
            ..base.clone()
        },
        RefDriverConfig {
            vendor: "other-vendor".to_string(),
            ..base.clone()
        },
    ];

    let manager = DeviceManager::new();
    for (index, config) in variants.into_iter().enumerate() {
        manager.register_v2(format!("driver-{index}"), Arc::new(RefDriver::new(config)))?;
    }
    let ids = manager.device_ids();
    assert_eq!(ids.len(), 4);

    let mut classes = Vec::new();
    let mut vendors = Vec::new();
    for id in &ids {
        let info = manager.info(*id)?;
        classes.push(info.class);
        vendors.push(info.vendor);
    }
    assert!(classes.contains(&DeviceClass::Gpu));
    assert!(vendors.iter().any(|vendor| vendor == "other-vendor"));
    assert!(manager.find("ref-other").is_some());
    Ok(())
}
