//! Host tensor-graph integration for NPM devices.
//!
//! The tensor library hands this crate a graph of nodes; the backend
//! decides which nodes it can execute ([`GraphBackend::supports_op`]),
//! and for each supported matmul registers the operand buffers with the
//! device, staging quantized weights through a reusable FP32
//! dequantization buffer, and dispatches one kernel per outer batch
//! index pair.
//!
//! [`tensor`] holds the contract types the host library maps its own
//! representation onto: element types with their quantization block
//! sizes, op kinds, tensors with `ne`/`nb` shape arrays, and the
//! [`Dequantize`] hook through which the host lends its
//! dequantize-to-FP32 routines.

pub mod backend;
pub mod tensor;

pub use backend::GraphBackend;
pub use tensor::{Dequantize, Graph, NoDequant, Tensor, TensorOp, TensorType};
