use nnrt_core::{DriverGeneration, OpKind};

/// Type narrowing/widening rules a driver generation requires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversionFlags {
    pub bool_as_uint8: bool,
    pub fp16_as_fp32: bool,
    /// Quantized unsigned 8-bit tensors become signed with zero point - 128.
    pub uint8_as_int8: bool,
}

/// What one driver generation can express on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationProfile {
    pub generation: DriverGeneration,
    pub wire_version: u8,
    pub conversions: ConversionFlags,
    pub per_channel_quant: bool,
    /// Rank-zero parameters go out as rank-one, single-element tensors.
    pub scalar_params_as_tensors: bool,
}

impl GenerationProfile {
    pub const V1: GenerationProfile = GenerationProfile {
        generation: DriverGeneration::V1,
        wire_version: 1,
        conversions: ConversionFlags {
            bool_as_uint8: true,
            fp16_as_fp32: true,
            uint8_as_int8: true,
        },
        per_channel_quant: false,
        scalar_params_as_tensors: true,
    };

    pub const V2: GenerationProfile = GenerationProfile {
        generation: DriverGeneration::V2,
        wire_version: 2,
        conversions: ConversionFlags {
            bool_as_uint8: false,
            fp16_as_fp32: false,
            uint8_as_int8: false,
        },
        per_channel_quant: true,
        scalar_params_as_tensors: false,
    };

    pub fn for_generation(generation: DriverGeneration) -> &'static GenerationProfile {
        match generation {
            DriverGeneration::V1 => &Self::V1,
            DriverGeneration::V2 => &Self::V2,
        }
    }

    /// Whether rank-zero tensors touched by `op` are sent as `[1]`.
    pub fn scalar_as_tensor(&self, op: OpKind) -> bool {
        // Softmax axes are vectors on every generation.
        self.scalar_params_as_tensors || op == OpKind::Softmax
    }
}
