//! Client tensor index to driver tensor index bookkeeping.

use nnrt_core::{DType, NnrtError, NnrtResult, TensorDesc, TypeConversion};
use nnrt_proto::{WireDType, WireQuant};

use crate::profile::{ConversionFlags, GenerationProfile};

/// Dense client → driver index table plus the conversion recorded per tensor.
///
/// Driver indices are handed out in increasing order and never reused,
/// whether they back a client tensor or a tensor synthesized during
/// serialization.
#[derive(Debug)]
pub struct TensorMapping {
    driver_index: Vec<Option<u32>>,
    conversions: Vec<TypeConversion>,
    next: u32,
}

impl TensorMapping {
    pub fn new(client_tensors: usize) -> Self {
        Self {
            driver_index: vec![None; client_tensors],
            conversions: vec![TypeConversion::None; client_tensors],
            next: 0,
        }
    }

    pub fn get(&self, client: u32) -> Option<u32> {
        self.driver_index.get(client as usize).copied().flatten()
    }

    /// Returns the existing driver index or allocates the next one.
    pub fn resolve_or_create(&mut self, client: u32) -> NnrtResult<u32> {
        let count = self.driver_index.len();
        let slot = self.driver_index.get_mut(client as usize).ok_or_else(|| {
            NnrtError::invalid_argument(format!(
                "client tensor {client} out of range ({count} tensors)"
            ))
        })?;
        if let Some(index) = slot {
            return Ok(*index);
        }
        let index = self.next;
        self.next += 1;
        *slot = Some(index);
        Ok(index)
    }

    /// Allocates a driver index with no client counterpart.
    pub fn create_synthetic(&mut self) -> u32 {
        let index = self.next;
        self.next += 1;
        index
    }

    pub fn driver_tensor_count(&self) -> usize {
        self.next as usize
    }

    /// Wire type of the tensor, recording any conversion its data needs.
    pub fn convert_type(
        &mut self,
        client: u32,
        desc: &TensorDesc,
        flags: ConversionFlags,
    ) -> NnrtResult<WireDType> {
        let (dtype, conversion) = conversion_for(desc, flags)?;
        let count = self.conversions.len();
        let slot = self.conversions.get_mut(client as usize).ok_or_else(|| {
            NnrtError::invalid_argument(format!(
                "client tensor {client} out of range ({count} tensors)"
            ))
        })?;
        *slot = conversion;
        Ok(dtype)
    }

    pub fn conversion(&self, client: u32) -> TypeConversion {
        self.conversions
            .get(client as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Wire quantization for the tensor; no metadata maps to an empty list.
    pub fn convert_quantization(
        &self,
        client: u32,
        desc: &TensorDesc,
        profile: &GenerationProfile,
    ) -> NnrtResult<Vec<WireQuant>> {
        let Some(quant) = &desc.quant else {
            return Ok(Vec::new());
        };
        if quant.is_per_channel() && !profile.per_channel_quant {
            return Err(NnrtError::unsupported(format!(
                "tensor {client}: per-channel quantization needs a generation 2 driver"
            )));
        }
        let quant = self.conversion(client).wire_quant(quant);
        Ok(quant
            .scale
            .iter()
            .zip(&quant.zero_point)
            .zip(&quant.num_bits)
            .map(|((scale, zero_point), num_bits)| WireQuant {
                num_bits: *num_bits,
                scale: *scale,
                zero_point: *zero_point,
            })
            .collect())
    }
}

/// Wire type and data conversion for a client descriptor.
pub fn conversion_for(
    desc: &TensorDesc,
    flags: ConversionFlags,
) -> NnrtResult<(WireDType, TypeConversion)> {
    let conversion = match desc.dtype {
        DType::Bool if flags.bool_as_uint8 => TypeConversion::BoolToUint8,
        DType::F16 if flags.fp16_as_fp32 => TypeConversion::Fp16ToFp32,
        DType::U8 if flags.uint8_as_int8 && desc.quant.is_some() => TypeConversion::Uint8ToInt8,
        _ => TypeConversion::None,
    };
    Ok((wire_dtype(conversion.wire_dtype(desc.dtype))?, conversion))
}

pub fn wire_dtype(dtype: DType) -> NnrtResult<WireDType> {
    Ok(match dtype {
        DType::Bool => WireDType::Bool,
        DType::I8 => WireDType::Int8,
        DType::I16 => WireDType::Int16,
        DType::I32 => WireDType::Int32,
        DType::I64 => WireDType::Int64,
        DType::U8 => WireDType::UInt8,
        DType::U16 => WireDType::UInt16,
        DType::U32 => WireDType::UInt32,
        DType::U64 => WireDType::UInt64,
        DType::F16 => WireDType::Float16,
        DType::F32 => WireDType::Float32,
        DType::F64 => WireDType::Float64,
        DType::Complex64 | DType::String => {
            return Err(NnrtError::unsupported(format!(
                "{dtype:?} tensors cannot be sent to a driver"
            )))
        }
    })
}

pub fn client_dtype(dtype: WireDType) -> DType {
    match dtype {
        WireDType::Bool => DType::Bool,
        WireDType::Int8 => DType::I8,
        WireDType::Int16 => DType::I16,
        WireDType::Int32 => DType::I32,
        WireDType::Int64 => DType::I64,
        WireDType::UInt8 => DType::U8,
        WireDType::UInt16 => DType::U16,
        WireDType::UInt32 => DType::U32,
        WireDType::UInt64 => DType::U64,
        WireDType::Float16 => DType::F16,
        WireDType::Float32 => DType::F32,
        WireDType::Float64 => DType::F64,
    }
}
