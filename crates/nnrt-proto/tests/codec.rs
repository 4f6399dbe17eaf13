use anyhow::Result;
use nnrt_proto::{
    DataRef, ParamKey, WireDType, WireError, WireModel, WireOp, WireOpCode, WireQuant, WireTensor,
};

fn add_model(version: u8) -> WireModel {
    let mut model = WireModel::new(version);
    let mut a = WireTensor::new(WireDType::Int8, vec![-1, 2, 2]);
    a.quant.push(WireQuant {
        num_bits: 8,
        scale: 0.2,
        zero_point: 0,
    });
    let a = model.push_tensor(a);
    let b = model.push_tensor(WireTensor::new(WireDType::Float32, vec![3, 2, 2]));
    let mut act = WireTensor::new(WireDType::Int8, vec![]);
    act.param = Some(ParamKey::ActivationType);
    act.data = Some(DataRef { offset: 0, len: 1 });
    let act = model.push_tensor(act);
    let out = model.push_tensor(WireTensor::new(WireDType::Float32, vec![3, 2, 2]));
    model.ops.push(WireOp {
        code: WireOpCode::AddFusion,
        inputs: vec![a, b],
        outputs: vec![out],
        params: vec![act],
    });
    model.inputs = vec![a, b];
    model.outputs = vec![out];
    model
}

#[test]
fn decode_restores_encoded_model() -> Result<()> {
    let model = add_model(2);
    let decoded = WireModel::decode(&model.encode())?;
    assert_eq!(decoded, model);

    let op = &decoded.ops[0];
    let (index, act) = decoded
        .param(op, ParamKey::ActivationType)
        .expect("activation param");
    assert_eq!(index, 2);
    assert_eq!(act.data, Some(DataRef { offset: 0, len: 1 }));
    assert!(decoded.param(op, ParamKey::Axis).is_none());
    Ok(())
}

#[test]
fn truncated_input_is_rejected() {
    let encoded = add_model(2).encode();
    for cut in [0, 3, 5, encoded.len() / 2, encoded.len() - 1] {
        let err = WireModel::decode(&encoded[..cut]).unwrap_err();
        assert!(
            matches!(err, WireError::Truncated(_)),
            "cut at {cut}: {err}"
        );
    }
}

#[test]
fn header_is_checked() {
    let mut encoded = add_model(2).encode().to_vec();
    encoded[0] = b'X';
    assert_eq!(WireModel::decode(&encoded).unwrap_err(), WireError::BadMagic);

    let mut encoded = add_model(2).encode().to_vec();
    encoded[4] = 9;
    assert_eq!(
        WireModel::decode(&encoded).unwrap_err(),
        WireError::UnsupportedVersion(9)
    );
}

#[test]
fn dangling_tensor_reference_is_rejected() {
    let mut model = add_model(2);
    model.outputs = vec![17];
    let err = WireModel::decode(&model.encode()).unwrap_err();
    assert!(matches!(
        err,
        WireError::IndexOutOfRange { index: 17, count: 4, .. }
    ));
}

#[test]
fn first_generation_models_carry_per_tensor_quantization_only() {
    let mut model = add_model(1);
    model.tensors[0].quant.push(WireQuant {
        num_bits: 8,
        scale: 0.4,
        zero_point: 0,
    });
    assert_eq!(
        WireModel::decode(&model.encode()).unwrap_err(),
        WireError::PerChannelQuant { version: 1 }
    );

    model.version = 2;
    assert!(WireModel::decode(&model.encode()).is_ok());
}

#[test]
fn numel_treats_dynamic_axes_as_unknown() {
    assert_eq!(WireTensor::new(WireDType::Float32, vec![3, 2, 2]).numel(), Some(12));
    assert_eq!(WireTensor::new(WireDType::Float32, vec![]).numel(), Some(1));
    assert_eq!(WireTensor::new(WireDType::Float32, vec![-1, 2]).numel(), None);
}

#[test]
fn input_dims_extension_text() {
    use nnrt_proto::hdi::v2::{encode_input_dims, parse_input_dims};

    let dims = vec![(0, vec![-1, 2, 2]), (1, vec![3])];
    let text = String::from_utf8(encode_input_dims(&dims)).unwrap();
    assert_eq!(text, "0:-1,2,2;1:3");
    assert_eq!(parse_input_dims(&text).unwrap(), dims);

    assert!(parse_input_dims("").unwrap().is_empty());
    assert!(parse_input_dims("0-1,2").is_err());
    assert!(parse_input_dims("0:0,2").is_err());
    assert!(parse_input_dims("0:1;0:2").is_err());
    assert!(parse_input_dims("x:1").is_err());
}
