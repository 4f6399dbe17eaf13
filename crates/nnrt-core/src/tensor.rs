use smallvec::SmallVec;

use crate::ops::ParamType;
use crate::{NnrtError, NnrtResult};

/// Client-facing element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
    /// Representable by clients, never accepted by a driver.
    Complex64,
    /// Representable by clients, never accepted by a driver.
    String,
}

impl DType {
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::Bool | DType::I8 | DType::U8 => Some(1),
            DType::I16 | DType::U16 | DType::F16 => Some(2),
            DType::I32 | DType::U32 | DType::F32 => Some(4),
            DType::I64 | DType::U64 | DType::F64 | DType::Complex64 => Some(8),
            DType::String => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::I8
                | DType::I16
                | DType::I32
                | DType::I64
                | DType::U8
                | DType::U16
                | DType::U32
                | DType::U64
        )
    }
}

/// One dimension; `None` marks a dynamic axis resolved at execution time.
pub type Dim = Option<usize>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub SmallVec<[Dim; 6]>);

impl Shape {
    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self(dims.iter().map(|d| Some(*d)).collect())
    }

    pub fn from_dims(dims: &[Dim]) -> Self {
        Self(dims.iter().copied().collect())
    }

    /// Builds a shape from signed sizes where any negative value is dynamic.
    pub fn from_signed(dims: &[i64]) -> Self {
        Self(
            dims.iter()
                .map(|d| usize::try_from(*d).ok())
                .collect(),
        )
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn is_static(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    pub fn has_dynamic(&self) -> bool {
        !self.is_static()
    }

    /// Concrete sizes when every axis is known.
    pub fn concrete(&self) -> Option<Vec<usize>> {
        self.0.iter().copied().collect()
    }

    /// Element count when static; a scalar counts as one element.
    pub fn numel(&self) -> Option<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, d| d.and_then(|d| acc.checked_mul(d)))
    }

    /// Signed view used on the wire, `-1` for dynamic axes.
    pub fn to_signed(&self) -> Vec<i64> {
        self.0
            .iter()
            .map(|d| d.map(|d| d as i64).unwrap_or(-1))
            .collect()
    }
}

/// Per-tensor (one entry) or per-channel quantization metadata.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct QuantParams {
    pub scale: Vec<f64>,
    pub zero_point: Vec<i32>,
    pub num_bits: Vec<u32>,
}

impl QuantParams {
    pub fn per_tensor(scale: f64, zero_point: i32, num_bits: u32) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![zero_point],
            num_bits: vec![num_bits],
        }
    }

    pub fn count(&self) -> usize {
        self.scale.len()
    }

    pub fn is_per_channel(&self) -> bool {
        self.count() > 1
    }

    pub fn validate(&self) -> NnrtResult<()> {
        let count = self.scale.len();
        if count == 0 {
            return Err(NnrtError::invalid_argument(
                "quantization parameters must carry at least one channel",
            ));
        }
        if self.zero_point.len() != count || self.num_bits.len() != count {
            return Err(NnrtError::invalid_argument(format!(
                "quantization parameter count mismatch: scale={}, zero_point={}, num_bits={}",
                count,
                self.zero_point.len(),
                self.num_bits.len()
            )));
        }
        if let Some(bad) = self.scale.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(NnrtError::invalid_argument(format!(
                "quantization scale must be finite and positive, got {bad}"
            )));
        }
        if let Some(bad) = self.num_bits.iter().find(|b| **b == 0 || **b > 32) {
            return Err(NnrtError::invalid_argument(format!(
                "quantization bit width must be within 1..=32, got {bad}"
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TensorRole {
    Input,
    Output,
    Constant,
    Intermediate,
    Parameter(ParamType),
}

impl TensorRole {
    /// Roles whose data is supplied at execution time.
    pub fn is_io(self) -> bool {
        matches!(self, TensorRole::Input | TensorRole::Output)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
    pub quant: Option<QuantParams>,
    pub role: TensorRole,
}

impl TensorDesc {
    pub fn new(dtype: DType, shape: Shape, role: TensorRole) -> Self {
        Self {
            dtype,
            shape,
            quant: None,
            role,
        }
    }

    pub fn with_quant(mut self, quant: QuantParams) -> Self {
        self.quant = Some(quant);
        self
    }

    /// Byte length of the tensor when both shape and element size are known.
    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .numel()
            .and_then(|n| self.dtype.size_in_bytes().and_then(|s| n.checked_mul(s)))
    }

    pub fn validate(&self) -> NnrtResult<()> {
        if let Some(dim) = self.shape.0.iter().flatten().find(|d| **d == 0) {
            return Err(NnrtError::invalid_argument(format!(
                "tensor dimensions must be positive, got {dim}"
            )));
        }
        if let Some(quant) = &self.quant {
            quant.validate()?;
        }
        if let TensorRole::Parameter(param) = self.role {
            if self.shape.has_dynamic() {
                return Err(NnrtError::invalid_argument(format!(
                    "{param:?} parameter tensor must have a static shape"
                )));
            }
        }
        Ok(())
    }
}
