//! Operator kinds and the parameter tensors each of them accepts.

use crate::DType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    FullyConnected,
    Conv2d,
    DepthwiseConv2d,
    AvgPool,
    MaxPool,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    Concat,
    Reshape,
    Transpose,
}

impl OpKind {
    pub const ALL: [OpKind; 16] = [
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::Div,
        OpKind::FullyConnected,
        OpKind::Conv2d,
        OpKind::DepthwiseConv2d,
        OpKind::AvgPool,
        OpKind::MaxPool,
        OpKind::Relu,
        OpKind::Sigmoid,
        OpKind::Tanh,
        OpKind::Softmax,
        OpKind::Concat,
        OpKind::Reshape,
        OpKind::Transpose,
    ];

    pub fn signature(self) -> &'static OpSignature {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => &ELEMENTWISE,
            OpKind::FullyConnected => &FULLY_CONNECTED,
            OpKind::Conv2d => &CONV2D,
            OpKind::DepthwiseConv2d => &DEPTHWISE_CONV2D,
            OpKind::AvgPool | OpKind::MaxPool => &POOL,
            OpKind::Relu | OpKind::Sigmoid | OpKind::Tanh => &UNARY,
            OpKind::Softmax => &SOFTMAX,
            OpKind::Concat => &CONCAT,
            OpKind::Reshape | OpKind::Transpose => &WITH_SHAPE_OPERAND,
        }
    }
}

/// Role of an operator parameter tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Fused activation id, resolved through the activation table.
    Activation,
    Strides,
    /// Padding mode id: 0 unknown, 1 same, 2 valid.
    PadMode,
    Dilation,
    Group,
    KernelSize,
    Axis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamLen {
    /// Exactly one element, either rank zero or rank one.
    Scalar,
    Exactly(usize),
}

impl ParamLen {
    pub fn accepts(self, numel: usize) -> bool {
        match self {
            ParamLen::Scalar => numel == 1,
            ParamLen::Exactly(n) => numel == n,
        }
    }
}

#[derive(Debug)]
pub struct ParamSlot {
    pub param: ParamType,
    pub dtypes: &'static [DType],
    pub len: ParamLen,
    pub required: bool,
}

#[derive(Debug)]
pub struct OpSignature {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub outputs: usize,
    pub params: &'static [ParamSlot],
}

impl OpSignature {
    pub fn slot(&self, param: ParamType) -> Option<&ParamSlot> {
        self.params.iter().find(|slot| slot.param == param)
    }
}

const ID_TYPES: &[DType] = &[DType::I8, DType::I32];
const I64_ONLY: &[DType] = &[DType::I64];

const ACTIVATION: ParamSlot = ParamSlot {
    param: ParamType::Activation,
    dtypes: ID_TYPES,
    len: ParamLen::Scalar,
    required: false,
};
const PAD_MODE: ParamSlot = ParamSlot {
    param: ParamType::PadMode,
    dtypes: ID_TYPES,
    len: ParamLen::Scalar,
    required: true,
};
const STRIDES: ParamSlot = ParamSlot {
    param: ParamType::Strides,
    dtypes: I64_ONLY,
    len: ParamLen::Exactly(2),
    required: true,
};
const DILATION: ParamSlot = ParamSlot {
    param: ParamType::Dilation,
    dtypes: I64_ONLY,
    len: ParamLen::Exactly(2),
    required: false,
};

static ELEMENTWISE: OpSignature = OpSignature {
    min_inputs: 2,
    max_inputs: 2,
    outputs: 1,
    params: &[ACTIVATION],
};

static FULLY_CONNECTED: OpSignature = OpSignature {
    min_inputs: 2,
    max_inputs: 3,
    outputs: 1,
    params: &[ACTIVATION],
};

static CONV2D: OpSignature = OpSignature {
    min_inputs: 3,
    max_inputs: 3,
    outputs: 1,
    params: &[
        STRIDES,
        PAD_MODE,
        DILATION,
        ParamSlot {
            param: ParamType::Group,
            dtypes: I64_ONLY,
            len: ParamLen::Scalar,
            required: false,
        },
        ACTIVATION,
    ],
};

static DEPTHWISE_CONV2D: OpSignature = OpSignature {
    min_inputs: 3,
    max_inputs: 3,
    outputs: 1,
    params: &[STRIDES, PAD_MODE, DILATION, ACTIVATION],
};

static POOL: OpSignature = OpSignature {
    min_inputs: 1,
    max_inputs: 1,
    outputs: 1,
    params: &[
        ParamSlot {
            param: ParamType::KernelSize,
            dtypes: I64_ONLY,
            len: ParamLen::Exactly(2),
            required: true,
        },
        STRIDES,
        PAD_MODE,
        ACTIVATION,
    ],
};

static UNARY: OpSignature = OpSignature {
    min_inputs: 1,
    max_inputs: 1,
    outputs: 1,
    params: &[],
};

static SOFTMAX: OpSignature = OpSignature {
    min_inputs: 1,
    max_inputs: 1,
    outputs: 1,
    params: &[ParamSlot {
        param: ParamType::Axis,
        dtypes: I64_ONLY,
        len: ParamLen::Scalar,
        required: false,
    }],
};

static CONCAT: OpSignature = OpSignature {
    min_inputs: 2,
    max_inputs: usize::MAX,
    outputs: 1,
    params: &[ParamSlot {
        param: ParamType::Axis,
        dtypes: I64_ONLY,
        len: ParamLen::Scalar,
        required: true,
    }],
};

static WITH_SHAPE_OPERAND: OpSignature = OpSignature {
    min_inputs: 2,
    max_inputs: 2,
    outputs: 1,
    params: &[],
};
