// SPDX-License-Identifier: AGPL-3.0-only

//! The graph backend: op support, buffer caching, per-node dispatch.

use crate::tensor::{Dequantize, Graph, Tensor, TensorOp, TensorType};
use npm_device::{device_from_env, BufferHandle, MatMulParams, NpmDevice, NpmError, Result};
use npm_protocol::DataType;
use std::collections::HashMap;
use tracing::{debug, error, warn};

struct DequantRegistration {
    handle: BufferHandle,
    size: usize,
}

/// Adapter between a host tensor graph and an NPM device.
///
/// Buffer registrations are cached by data pointer across
/// `graph_compute` calls — weights are uploaded once, activations are
/// refreshed on every call because their content changes between
/// inference steps. Quantized weights are expanded into a reusable FP32
/// staging buffer whose device registration is retired and re-created
/// only when the staging buffer must grow.
///
/// # Memory contract
///
/// Tensor `data` pointers handed to [`GraphBackend::graph_compute`]
/// must stay valid until the backend is dropped (registrations are
/// cached) or the pointer is re-used for a tensor of a different size.
pub struct GraphBackend {
    dev: Box<dyn NpmDevice>,
    dequantizer: Box<dyn Dequantize>,
    handles: HashMap<usize, BufferHandle>,
    dequant_buffer: Vec<f32>,
    dequant: Option<DequantRegistration>,
    min_batch: i64,
}

impl std::fmt::Debug for GraphBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBackend")
            .field("device", &self.dev)
            .field("cached_handles", &self.handles.len())
            .field("dequant_capacity", &self.dequant_buffer.len())
            .finish_non_exhaustive()
    }
}

impl GraphBackend {
    /// Wrap a device with the host's dequantization routines.
    pub fn new(dev: Box<dyn NpmDevice>, dequantizer: Box<dyn Dequantize>) -> Self {
        Self {
            dev,
            dequantizer,
            handles: HashMap::new(),
            dequant_buffer: Vec::new(),
            dequant: None,
            min_batch: 1,
        }
    }

    /// Construct over the backend selected by `NPM_DEVICE`.
    ///
    /// # Errors
    ///
    /// Propagates device construction failures (including an unknown
    /// `NPM_DEVICE` value).
    pub fn from_env(dequantizer: Box<dyn Dequantize>) -> Result<Self> {
        Ok(Self::new(device_from_env()?, dequantizer))
    }

    /// Set the minimum dimension below which matmuls stay on the CPU.
    #[must_use]
    pub fn with_min_batch(mut self, min_batch: i64) -> Self {
        self.min_batch = min_batch;
        self
    }

    /// The wrapped device.
    pub fn device(&self) -> &dyn NpmDevice {
        &*self.dev
    }

    /// Decide whether this backend can execute `node`.
    ///
    /// Pass-through shape ops are always accepted (they are no-ops
    /// here). A matmul is accepted iff both operands are contiguous,
    /// the activations and output are FP32, the weights are FP32 or a
    /// quantized type the host can dequantize with K on a block
    /// boundary, and every relevant dimension reaches the minimum
    /// batch size. Everything else falls back to the CPU.
    pub fn supports_op(&self, graph: &Graph, node: &Tensor) -> bool {
        match node.op {
            TensorOp::None
            | TensorOp::Reshape
            | TensorOp::View
            | TensorOp::Permute
            | TensorOp::Transpose => true,

            TensorOp::MulMat => {
                let (Some(i0), Some(i1)) = (node.src[0], node.src[1]) else {
                    return false;
                };
                let src0 = &graph.nodes[i0]; // weights
                let src1 = &graph.nodes[i1]; // activations

                let contiguous_ok = src0.is_contiguous() && src1.is_contiguous();

                let src0_type_ok = src0.ty == TensorType::F32
                    || (src0.ty.is_quantized() && self.dequantizer.supports(src0.ty));
                let type_ok =
                    src0_type_ok && src1.ty == TensorType::F32 && node.ty == TensorType::F32;

                // K must land on a quantization block boundary
                let alignment_ok = src0.ne[0] % src0.ty.block_size() as i64 == 0;

                let size_ok = node.ne[0] >= self.min_batch
                    && node.ne[1] >= self.min_batch
                    && src1.ne[0] >= self.min_batch;

                let supported = contiguous_ok && type_ok && alignment_ok && size_ok;
                if !supported {
                    debug!(
                        "matmul falls back to CPU: contiguous={contiguous_ok} types={:?}/{:?} \
                         alignment={alignment_ok} sizes=({}, {}, {})",
                        src0.ty, src1.ty, node.ne[0], node.ne[1], src1.ne[0]
                    );
                }
                supported
            }

            _ => {
                debug!("unsupported op {:?} falls back to CPU", node.op);
                false
            }
        }
    }

    /// Execute every supported compute node, then synchronize once.
    ///
    /// Node failures are logged and do not stop the remaining nodes;
    /// the first failure is returned after the graph completes.
    ///
    /// # Errors
    ///
    /// The first backend-reported node failure, if any.
    pub fn graph_compute(&mut self, graph: &Graph) -> Result<()> {
        let mut first_err = None;

        for node in &graph.nodes {
            let result = match node.op {
                TensorOp::MulMat => self.mul_mat(graph, node),
                TensorOp::None
                | TensorOp::Reshape
                | TensorOp::View
                | TensorOp::Permute
                | TensorOp::Transpose => Ok(()),
                other => Err(NpmError::invalid_params(format!(
                    "op {other:?} cannot execute on this backend"
                ))),
            };
            if let Err(e) = result {
                error!("graph node {:?} failed: {e}", node.op);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        self.dev.sync()?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dispatch one matmul node: `dst = src1 · src0ᵀ`, batched over the
    /// two outer dimensions with broadcast of the weights.
    #[allow(clippy::cast_sign_loss)]
    fn mul_mat(&mut self, graph: &Graph, dst: &Tensor) -> Result<()> {
        let src0 = &graph.nodes[dst.src[0].ok_or_else(no_operand)?]; // weights
        let src1 = &graph.nodes[dst.src[1].ok_or_else(no_operand)?]; // activations

        if dst.ne[0] != src0.ne[1] || dst.ne[1] != src1.ne[1] || src0.ne[0] != src1.ne[0] {
            return Err(NpmError::invalid_params(format!(
                "matmul shape mismatch: weights {:?}, activations {:?}, dst {:?}",
                src0.ne, src1.ne, dst.ne
            )));
        }
        if src0.ne[2] <= 0 || src0.ne[3] <= 0 {
            return Err(NpmError::invalid_params(
                "weight batch dimensions must be positive",
            ));
        }

        // activations change between inference steps, so refresh the
        // device copy on every dispatch
        let handle_a = self.buffer_handle(src1.data, src1.nbytes(), true)?;

        let dequantized = src0.ty != TensorType::F32;
        let handle_b = if dequantized {
            let n_elements = src0.nelements() as usize;
            if self.dequant_buffer.len() < n_elements {
                self.dequant_buffer.resize(n_elements, 0.0);
            }
            // SAFETY: `src0.data` points to `nbytes()` readable bytes
            // per the graph memory contract.
            let packed =
                unsafe { std::slice::from_raw_parts(src0.data.cast_const(), src0.nbytes()) };
            self.dequantizer
                .to_float(src0.ty, packed, &mut self.dequant_buffer[..n_elements])?;
            self.dequant_handle(n_elements * std::mem::size_of::<f32>())?
        } else {
            self.buffer_handle(src0.data, src0.nbytes(), false)?
        };

        let handle_c = self.buffer_handle(dst.data, dst.nbytes(), false)?;

        // broadcast ratios of activations over weights
        let r2 = src1.ne[2] / src0.ne[2];
        let r3 = src1.ne[3] / src0.ne[3];
        if r2 == 0 || r3 == 0 {
            return Err(NpmError::invalid_params(format!(
                "weights cannot broadcast over activations: {:?} vs {:?}",
                src0.ne, src1.ne
            )));
        }

        for i13 in 0..src1.ne[3] {
            for i12 in 0..src1.ne[2] {
                let i03 = i13 / r3;
                let i02 = i12 / r2;

                let b_offset = if dequantized {
                    // dequantized weights are dense FP32 with shape
                    // (ne00, ne01, ne02, ne03)
                    let plane = (src0.ne[0] * src0.ne[1]) as usize;
                    (i02 as usize * plane + i03 as usize * plane * src0.ne[2] as usize)
                        * std::mem::size_of::<f32>()
                } else {
                    i02 as usize * src0.nb[2] + i03 as usize * src0.nb[3]
                };

                let params = MatMulParams {
                    a_handle: handle_a,
                    a_offset: i12 as usize * src1.nb[2] + i13 as usize * src1.nb[3],
                    b_handle: handle_b,
                    b_offset,
                    c_handle: handle_c,
                    c_offset: i12 as usize * dst.nb[2] + i13 as usize * dst.nb[3],
                    m: src1.ne[1],
                    n: src0.ne[1],
                    k: src1.ne[0],
                    lda: src1.ne[0],
                    ldb: src0.ne[0],
                    ldc: dst.ne[0],
                    type_a: DataType::F32,
                    type_b: DataType::F32,
                    type_c: DataType::F32,
                };
                self.dev.matmul(&params)?;
            }
        }
        Ok(())
    }

    /// Get or create the cached handle for a data pointer. With
    /// `update`, the device copy is refreshed; if the buffer has grown
    /// past its registration, the old handle is retired and a new one
    /// issued — dispatching with a stale smaller handle is forbidden.
    fn buffer_handle(&mut self, ptr: *mut u8, size: usize, update: bool) -> Result<BufferHandle> {
        let key = ptr as usize;

        if let Some(&handle) = self.handles.get(&key) {
            if !update {
                return Ok(handle);
            }
            // SAFETY: `ptr` is valid for `size` bytes per the graph
            // memory contract.
            match unsafe { self.dev.update_buffer(handle, ptr, size) } {
                Ok(()) => return Ok(handle),
                Err(NpmError::InvalidParams { .. }) => {
                    debug!("buffer at {key:#x} grew past its registration, re-registering");
                    self.dev.unregister_buffer(handle)?;
                    self.handles.remove(&key);
                }
                Err(e) => return Err(e),
            }
        }

        // SAFETY: `ptr` is valid for `size` bytes and outlives the
        // cached registration per the graph memory contract.
        let handle = unsafe { self.dev.register_buffer(ptr, size)? };
        self.handles.insert(key, handle);
        Ok(handle)
    }

    /// Get the device registration for the dequantization staging
    /// buffer, reusing the existing one while it is large enough.
    fn dequant_handle(&mut self, size: usize) -> Result<BufferHandle> {
        let ptr = self.dequant_buffer.as_mut_ptr().cast::<u8>();

        if let Some(reg) = &self.dequant {
            if reg.size >= size {
                // SAFETY: the staging buffer is live and at least
                // `size` bytes (len * 4 >= size by construction).
                unsafe { self.dev.update_buffer(reg.handle, ptr, size)? };
                debug!(
                    "reused dequant handle {} ({size} of {} bytes)",
                    reg.handle.raw(),
                    reg.size
                );
                return Ok(reg.handle);
            }
            self.dev.unregister_buffer(reg.handle)?;
            self.dequant = None;
        }

        // SAFETY: the staging buffer is live, `size` bytes long, and
        // stays put until the next growth — which retires this
        // registration first.
        let handle = unsafe { self.dev.register_buffer(ptr, size)? };
        debug!("new dequant handle {} ({size} bytes)", handle.raw());
        self.dequant = Some(DequantRegistration { handle, size });
        Ok(handle)
    }
}

fn no_operand() -> NpmError {
    NpmError::invalid_params("matmul node is missing an operand")
}

impl Drop for GraphBackend {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let Err(e) = self.dev.unregister_buffer(handle) {
                warn!("unregister of cached handle failed during drop: {e}");
            }
        }
        if let Some(reg) = self.dequant.take() {
            let _ = self.dev.unregister_buffer(reg.handle);
        }
        if let Err(e) = self.dev.shutdown() {
            warn!("device shutdown failed during drop: {e}");
        }
    }
}
