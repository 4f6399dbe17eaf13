//! Driver wire format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "NNWM" | version u8
//! tensors: u32 count, then per tensor
//!   dtype u8 | rank u32 | dims i32* | quant u32 count, (bits u32, scale f64, zp i32)*
//!   data u8 flag [offset u64, len u64] | param u8 flag [key u16]
//! ops: u32 count, then per op
//!   code u32 | inputs u32 count, u32* | outputs ... | params ...
//! inputs: u32 count, u32* | outputs: u32 count, u32*
//! ```
//!
//! Constant payloads are not part of the encoding; `data` entries point
//! into a separately shared constant buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const WIRE_MAGIC: &[u8; 4] = b"NNWM";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("wire model truncated while reading {0}")]
    Truncated(&'static str),
    #[error("bad wire magic")]
    BadMagic,
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown {what} code {code}")]
    UnknownCode { what: &'static str, code: u32 },
    #[error("{what} references tensor {index}, but the model has {count} tensors")]
    IndexOutOfRange {
        what: &'static str,
        index: u32,
        count: usize,
    },
    #[error("version {version} models allow at most one quantization entry per tensor")]
    PerChannelQuant { version: u8 },
    #[error("malformed {name} extension: {reason}")]
    BadExtension { name: &'static str, reason: String },
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident : $repr:ty, $what:literal { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr($repr)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn code(self) -> $repr {
                self as $repr
            }

            pub fn from_code(code: $repr) -> Result<Self, WireError> {
                match code {
                    $($value => Ok($name::$variant),)+
                    other => Err(WireError::UnknownCode { what: $what, code: other as u32 }),
                }
            }
        }
    };
}

wire_enum!(
    /// Element types understood by drivers.
    WireDType: u8, "dtype" {
        Bool = 1,
        Int8 = 2,
        Int16 = 3,
        Int32 = 4,
        Int64 = 5,
        UInt8 = 6,
        UInt16 = 7,
        UInt32 = 8,
        UInt64 = 9,
        Float16 = 10,
        Float32 = 11,
        Float64 = 12,
    }
);

impl WireDType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            WireDType::Bool | WireDType::Int8 | WireDType::UInt8 => 1,
            WireDType::Int16 | WireDType::UInt16 | WireDType::Float16 => 2,
            WireDType::Int32 | WireDType::UInt32 | WireDType::Float32 => 4,
            WireDType::Int64 | WireDType::UInt64 | WireDType::Float64 => 8,
        }
    }
}

wire_enum!(
    /// Driver operator codes.
    WireOpCode: u32, "operator" {
        Activation = 2,
        AddFusion = 5,
        AvgPoolFusion = 10,
        Concat = 24,
        Conv2dFusion = 28,
        DivFusion = 34,
        FullConnection = 41,
        MaxPoolFusion = 53,
        MulFusion = 56,
        Reshape = 67,
        Softmax = 80,
        SubFusion = 89,
        Transpose = 92,
    }
);

wire_enum!(
    /// Keys identifying operator parameter tensors.
    ParamKey: u16, "parameter" {
        ActivationType = 1,
        Stride = 2,
        PadMode = 3,
        Dilation = 4,
        Group = 5,
        KernelSize = 6,
        Axis = 7,
    }
);

wire_enum!(
    /// Activation ids, used both fused and by the standalone activation op.
    WireActivation: i8, "activation" {
        None = 0,
        Relu = 1,
        Sigmoid = 2,
        Relu6 = 3,
        Tanh = 10,
    }
);

wire_enum!(
    WirePadMode: i8, "pad mode" {
        Same = 0,
        Valid = 1,
    }
);

wire_enum!(
    WireDeviceType: u8, "device type" {
        Other = 0,
        Cpu = 1,
        Gpu = 2,
        Accelerator = 3,
    }
);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WireQuant {
    pub num_bits: u32,
    pub scale: f64,
    pub zero_point: i32,
}

/// Location of a constant payload inside the shared constant buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRef {
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WireTensor {
    pub dtype: WireDType,
    /// `-1` marks a dynamic axis.
    pub dims: Vec<i32>,
    pub quant: Vec<WireQuant>,
    pub data: Option<DataRef>,
    pub param: Option<ParamKey>,
}

impl WireTensor {
    pub fn new(dtype: WireDType, dims: Vec<i32>) -> Self {
        Self {
            dtype,
            dims,
            quant: Vec::new(),
            data: None,
            param: None,
        }
    }

    pub fn numel(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, d| {
            usize::try_from(*d).ok().and_then(|d| acc.checked_mul(d))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireOp {
    pub code: WireOpCode,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub params: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WireModel {
    pub version: u8,
    pub tensors: Vec<WireTensor>,
    pub ops: Vec<WireOp>,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

impl WireModel {
    pub fn new(version: u8) -> Self {
        Self {
            version,
            tensors: Vec::new(),
            ops: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Appends a tensor and returns its wire index.
    pub fn push_tensor(&mut self, tensor: WireTensor) -> u32 {
        self.tensors.push(tensor);
        (self.tensors.len() - 1) as u32
    }

    /// Finds the parameter tensor of `op` carrying `key`.
    pub fn param(&self, op: &WireOp, key: ParamKey) -> Option<(u32, &WireTensor)> {
        op.params.iter().find_map(|index| {
            let tensor = self.tensors.get(*index as usize)?;
            (tensor.param == Some(key)).then_some((*index, tensor))
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.tensors.len() * 32);
        buf.put_slice(WIRE_MAGIC);
        buf.put_u8(self.version);

        buf.put_u32_le(self.tensors.len() as u32);
        for tensor in &self.tensors {
            buf.put_u8(tensor.dtype.code());
            buf.put_u32_le(tensor.dims.len() as u32);
            for dim in &tensor.dims {
                buf.put_i32_le(*dim);
            }
            buf.put_u32_le(tensor.quant.len() as u32);
            for quant in &tensor.quant {
                buf.put_u32_le(quant.num_bits);
                buf.put_f64_le(quant.scale);
                buf.put_i32_le(quant.zero_point);
            }
            match tensor.data {
                Some(data) => {
                    buf.put_u8(1);
                    buf.put_u64_le(data.offset);
                    buf.put_u64_le(data.len);
                }
                None => buf.put_u8(0),
            }
            match tensor.param {
                Some(key) => {
                    buf.put_u8(1);
                    buf.put_u16_le(key.code());
                }
                None => buf.put_u8(0),
            }
        }

        buf.put_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            buf.put_u32_le(op.code.code());
            put_indices(&mut buf, &op.inputs);
            put_indices(&mut buf, &op.outputs);
            put_indices(&mut buf, &op.params);
        }

        put_indices(&mut buf, &self.inputs);
        put_indices(&mut buf, &self.outputs);
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self, WireError> {
        let buf = &mut src;
        if buf.remaining() < WIRE_MAGIC.len() + 1 {
            return Err(WireError::Truncated("header"));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != WIRE_MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = buf.get_u8();
        if !(1..=2).contains(&version) {
            return Err(WireError::UnsupportedVersion(version));
        }

        let tensor_count = get_u32(buf, "tensor count")? as usize;
        let mut tensors = Vec::with_capacity(tensor_count.min(4096));
        for _ in 0..tensor_count {
            let dtype = WireDType::from_code(get_u8(buf, "tensor dtype")?)?;
            let rank = get_u32(buf, "tensor rank")? as usize;
            let mut dims = Vec::with_capacity(rank.min(16));
            for _ in 0..rank {
                dims.push(get_i32(buf, "tensor dims")?);
            }
            let quant_count = get_u32(buf, "quant count")? as usize;
            if version == 1 && quant_count > 1 {
                return Err(WireError::PerChannelQuant { version });
            }
            let mut quant = Vec::with_capacity(quant_count.min(4096));
            for _ in 0..quant_count {
                let num_bits = get_u32(buf, "quant bits")?;
                if buf.remaining() < 12 {
                    return Err(WireError::Truncated("quant params"));
                }
                let scale = buf.get_f64_le();
                let zero_point = buf.get_i32_le();
                quant.push(WireQuant {
                    num_bits,
                    scale,
                    zero_point,
                });
            }
            let data = match get_u8(buf, "data flag")? {
                0 => None,
                _ => {
                    if buf.remaining() < 16 {
                        return Err(WireError::Truncated("data ref"));
                    }
                    Some(DataRef {
                        offset: buf.get_u64_le(),
                        len: buf.get_u64_le(),
                    })
                }
            };
            let param = match get_u8(buf, "param flag")? {
                0 => None,
                _ => {
                    if buf.remaining() < 2 {
                        return Err(WireError::Truncated("param key"));
                    }
                    Some(ParamKey::from_code(buf.get_u16_le())?)
                }
            };
            tensors.push(WireTensor {
                dtype,
                dims,
                quant,
                data,
                param,
            });
        }

        let op_count = get_u32(buf, "op count")? as usize;
        let mut ops = Vec::with_capacity(op_count.min(4096));
        for _ in 0..op_count {
            let code = WireOpCode::from_code(get_u32(buf, "op code")?)?;
            let inputs = get_indices(buf, "op inputs", tensor_count)?;
            let outputs = get_indices(buf, "op outputs", tensor_count)?;
            let params = get_indices(buf, "op params", tensor_count)?;
            ops.push(WireOp {
                code,
                inputs,
                outputs,
                params,
            });
        }

        let inputs = get_indices(buf, "model inputs", tensor_count)?;
        let outputs = get_indices(buf, "model outputs", tensor_count)?;

        Ok(Self {
            version,
            tensors,
            ops,
            inputs,
            outputs,
        })
    }
}

fn put_indices(buf: &mut BytesMut, indices: &[u32]) {
    buf.put_u32_le(indices.len() as u32);
    for index in indices {
        buf.put_u32_le(*index);
    }
}

fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated(what));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(what));
    }
    Ok(buf.get_u32_le())
}

fn get_i32(buf: &mut &[u8], what: &'static str) -> Result<i32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(what));
    }
    Ok(buf.get_i32_le())
}

fn get_indices(
    buf: &mut &[u8],
    what: &'static str,
    tensor_count: usize,
) -> Result<Vec<u32>, WireError> {
    let count = get_u32(buf, what)? as usize;
    if buf.remaining() < count.saturating_mul(4) {
        return Err(WireError::Truncated(what));
    }
    let mut indices = Vec::with_capacity(count);
    for _ in 0..count {
        let index = buf.get_u32_le();
        if index as usize >= tensor_count {
            return Err(WireError::IndexOutOfRange {
                what,
                index,
                count: tensor_count,
            });
        }
        indices.push(index);
    }
    Ok(indices)
}
