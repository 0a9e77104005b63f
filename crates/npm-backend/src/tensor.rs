//! Contract types between the host tensor library and the NPM backend.
//!
//! The host maps its own graph representation onto these types; the
//! backend never sees the library's internals. Shapes follow the
//! host's convention: `ne[0]` is the innermost (fastest-varying)
//! dimension and `nb` holds byte strides per dimension, so a dense
//! row-major matrix has `nb[0] = element size` and `nb[1] = row bytes`.

use npm_device::{NpmError, Result};

/// Element types a host tensor can carry.
///
/// Quantized types store blocks of elements; the backend only needs
/// each type's block geometry (for the K-alignment predicate and
/// stride math) — decoding stays inside the host via [`Dequantize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)] // variant names mirror the host library's type names
pub enum TensorType {
    F32,
    F16,
    Bf16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Iq1S,
    Iq2Xxs,
    Iq2Xs,
    Iq2S,
    Iq3Xxs,
    Iq3S,
    Iq4Nl,
    Iq4Xs,
}

impl TensorType {
    /// True for block-quantized types (everything except the plain
    /// float formats).
    pub const fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16 | Self::Bf16)
    }

    /// Elements per quantization block (1 for float formats).
    ///
    /// Standard block quants pack 32 elements; K-quants and I-quants
    /// pack 256 per super-block, except IQ4_NL which uses 32.
    pub const fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::Bf16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1
            | Self::Iq4Nl => 32,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K | Self::Iq1S
            | Self::Iq2Xxs | Self::Iq2Xs | Self::Iq2S | Self::Iq3Xxs | Self::Iq3S
            | Self::Iq4Xs => 256,
        }
    }

    /// Bytes per block (per element for float formats).
    pub const fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::Bf16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
            Self::Q8_1 => 36,
            Self::Q2K => 84,
            Self::Q3K => 110,
            Self::Q4K => 144,
            Self::Q5K => 176,
            Self::Q6K => 210,
            Self::Iq1S => 50,
            Self::Iq2Xxs => 66,
            Self::Iq2Xs => 74,
            Self::Iq2S => 82,
            Self::Iq3Xxs => 98,
            Self::Iq3S => 110,
            Self::Iq4Nl => 18,
            Self::Iq4Xs => 136,
        }
    }
}

/// Graph node operations the backend can encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOp {
    /// Leaf tensor, no computation.
    None,
    /// Shape-only view.
    Reshape,
    /// Shape-only view.
    View,
    /// Shape-only view.
    Permute,
    /// Shape-only view.
    Transpose,
    /// Matrix multiplication `dst = src1 · src0ᵀ`.
    MulMat,
    /// Elementwise addition (not executed on NPM).
    Add,
    /// Row-wise softmax (not executed on NPM).
    SoftMax,
}

/// A host tensor-graph node.
///
/// `src` holds graph indices of the operand nodes (for `MulMat`:
/// `src[0]` the weights, `src[1]` the activations). `data` points into
/// memory the host owns; it must stay valid for as long as the backend
/// may hold a registration for it.
#[derive(Debug, Clone)]
pub struct Tensor {
    /// Element type.
    pub ty: TensorType,
    /// Operation producing this node.
    pub op: TensorOp,
    /// Elements per dimension, innermost first.
    pub ne: [i64; 4],
    /// Byte stride per dimension.
    pub nb: [usize; 4],
    /// Host data pointer.
    pub data: *mut u8,
    /// Operand node indices.
    pub src: [Option<usize>; 2],
}

impl Tensor {
    /// A dense FP32 leaf with row-major strides.
    pub fn dense_f32(ne: [i64; 4], data: *mut u8) -> Self {
        Self::leaf(TensorType::F32, ne, data)
    }

    /// A dense leaf of any type with canonical strides.
    #[allow(clippy::cast_sign_loss)]
    pub fn leaf(ty: TensorType, ne: [i64; 4], data: *mut u8) -> Self {
        let row = (ne[0] as usize / ty.block_size()) * ty.type_size();
        let nb = [
            ty.type_size(),
            row,
            row * ne[1] as usize,
            row * ne[1] as usize * ne[2] as usize,
        ];
        Self {
            ty,
            op: TensorOp::None,
            ne,
            nb,
            data,
            src: [None, None],
        }
    }

    /// The FP32 output node of `dst = src1 · src0ᵀ` with the host's
    /// shape rule: `ne = [ne01, ne11, ne12, ne13]`.
    pub fn mul_mat_dst(weights: &Self, activations: &Self, src: [usize; 2], data: *mut u8) -> Self {
        let mut node = Self::dense_f32(
            [
                weights.ne[1],
                activations.ne[1],
                activations.ne[2],
                activations.ne[3],
            ],
            data,
        );
        node.op = TensorOp::MulMat;
        node.src = [Some(src[0]), Some(src[1])];
        node
    }

    /// Total element count.
    pub fn nelements(&self) -> i64 {
        self.ne.iter().product()
    }

    /// Total byte size (valid for canonically strided tensors).
    #[allow(clippy::cast_sign_loss)]
    pub fn nbytes(&self) -> usize {
        self.nb[3] * self.ne[3] as usize
    }

    /// Bytes per row of the innermost dimension.
    #[allow(clippy::cast_sign_loss)]
    pub fn row_bytes(&self) -> usize {
        (self.ne[0] as usize / self.ty.block_size()) * self.ty.type_size()
    }

    /// Whether the strides are the canonical dense row-major layout.
    #[allow(clippy::cast_sign_loss)]
    pub fn is_contiguous(&self) -> bool {
        self.nb[0] == self.ty.type_size()
            && self.nb[1] == self.row_bytes()
            && self.nb[2] == self.nb[1] * self.ne[1] as usize
            && self.nb[3] == self.nb[2] * self.ne[2] as usize
    }
}

/// A flat tensor graph; nodes reference operands by index.
#[derive(Debug, Default)]
pub struct Graph {
    /// Nodes in execution order.
    pub nodes: Vec<Tensor>,
}

impl Graph {
    /// Append a node and return its index.
    pub fn push(&mut self, node: Tensor) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Dequantize-to-FP32 routines lent by the host tensor library.
///
/// The backend asks `supports` inside the op-support predicate and
/// calls `to_float` when staging quantized weights.
pub trait Dequantize {
    /// Whether a routine exists for `ty`.
    fn supports(&self, ty: TensorType) -> bool;

    /// Expand `dst.len()` elements from the packed blocks in `src`.
    ///
    /// # Errors
    ///
    /// Returns [`NpmError::InvalidParams`] if `src` is too short or the
    /// type is unsupported.
    fn to_float(&self, ty: TensorType, src: &[u8], dst: &mut [f32]) -> Result<()>;
}

/// A host with no quantized models: every quantized type is
/// unsupported and falls back to the CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDequant;

impl Dequantize for NoDequant {
    fn supports(&self, _ty: TensorType) -> bool {
        false
    }

    fn to_float(&self, ty: TensorType, _src: &[u8], _dst: &mut [f32]) -> Result<()> {
        Err(NpmError::invalid_params(format!(
            "no dequantization routine for {ty:?}"
        )))
    }
}
