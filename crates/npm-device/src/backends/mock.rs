// SPDX-License-Identifier: AGPL-3.0-only

//! Mock NPM backend.
//!
//! In-process reference implementation: buffers are raw (pointer, size)
//! entries in a handle table and matmul runs the canonical triple loop
//! with FP32 accumulation directly on the registered memory. No data is
//! copied. This is the correctness baseline the emulator is validated
//! against, and the backend used for CPU delegation.

use crate::device::{BufferHandle, FenceId, MatMulParams, MatMulStats, NpmDevice};
use crate::error::{NpmError, Result};
use npm_protocol::Sku;
use std::collections::HashMap;
use tracing::debug;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct MockBuffer {
    ptr: *mut u8,
    size: usize,
}

/// In-process mock device.
#[derive(Debug)]
pub struct MockDevice {
    buffers: HashMap<u64, MockBuffer>,
    next_handle: u64,
    next_fence: u64,
    num_engines: u32,
    l1_size: usize,
    l2_size: usize,
}

impl MockDevice {
    /// Resolve a handle and byte offset to a bounds-checked FP32 view
    /// descriptor: (base element pointer, elements available).
    fn resolve_f32(&self, handle: BufferHandle, offset: usize) -> Result<(*mut f32, usize)> {
        let buf = self
            .buffers
            .get(&handle.raw())
            .ok_or(NpmError::InvalidHandle {
                handle: handle.raw(),
            })?;
        if offset >= buf.size {
            return Err(NpmError::invalid_handle(handle.raw()));
        }
        let base = buf.ptr as usize + offset;
        if base % std::mem::align_of::<f32>() != 0 {
            return Err(NpmError::invalid_params(format!(
                "buffer {} at offset {offset} is not 4-byte aligned",
                handle.raw()
            )));
        }
        Ok((base as *mut f32, (buf.size - offset) / 4))
    }
}

/// Elements a row-major operand spans: `(rows-1)·ld + cols`.
fn span(rows: i64, cols: i64, ld: i64) -> usize {
    ((rows - 1) * ld + cols) as usize
}

impl NpmDevice for MockDevice {
    fn init(_device_id: u32) -> Result<Self> {
        debug!("mock device: 1 engine, 1 MiB L1, 8 MiB L2");
        Ok(Self {
            buffers: HashMap::new(),
            next_handle: 1,
            next_fence: 1,
            num_engines: 1,
            l1_size: MIB,
            l2_size: 8 * MIB,
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        self.buffers.clear();
        Ok(())
    }

    fn sku(&self) -> Sku {
        Sku::Mock
    }

    fn num_engines(&self) -> u32 {
        self.num_engines
    }

    fn l1_size(&self) -> usize {
        self.l1_size
    }

    fn l2_size(&self) -> usize {
        self.l2_size
    }

    unsafe fn register_buffer(&mut self, ptr: *mut u8, size: usize) -> Result<BufferHandle> {
        if ptr.is_null() || size == 0 {
            return Err(NpmError::invalid_params(
                "register_buffer requires a non-null pointer and nonzero size",
            ));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.buffers.insert(handle, MockBuffer { ptr, size });
        Ok(BufferHandle::new(handle))
    }

    fn unregister_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        self.buffers.remove(&handle.raw());
        Ok(())
    }

    unsafe fn update_buffer(
        &mut self,
        handle: BufferHandle,
        ptr: *mut u8,
        size: usize,
    ) -> Result<()> {
        let buf = self
            .buffers
            .get_mut(&handle.raw())
            .ok_or(NpmError::InvalidHandle {
                handle: handle.raw(),
            })?;
        if size > buf.size {
            return Err(NpmError::invalid_params(format!(
                "update of {size} bytes exceeds registered size {}",
                buf.size
            )));
        }
        // The mock shares the caller's memory, so an update is just a
        // pointer refresh.
        buf.ptr = ptr;
        Ok(())
    }

    fn matmul(&mut self, params: &MatMulParams) -> Result<MatMulStats> {
        params.validate()?;

        let (m, n, k) = (params.m, params.n, params.k);
        let (lda, ldb, ldc) = (params.lda, params.ldb, params.ldc);

        let (a, a_elems) = self.resolve_f32(params.a_handle, params.a_offset)?;
        let (b, b_elems) = self.resolve_f32(params.b_handle, params.b_offset)?;
        let (c, c_elems) = self.resolve_f32(params.c_handle, params.c_offset)?;

        if span(m, k, lda) > a_elems || span(n, k, ldb) > b_elems || span(m, n, ldc) > c_elems {
            return Err(NpmError::invalid_params(
                "matmul operand range exceeds its registered buffer",
            ));
        }

        // SAFETY: the spans above were checked against the registered
        // sizes, and the registration contract guarantees the memory is
        // alive and exclusive for the duration of this call. A, B and C
        // come from distinct registrations per the dispatch contract.
        unsafe {
            for mi in 0..m {
                for ni in 0..n {
                    let mut sum = 0.0f32;
                    for ki in 0..k {
                        sum += *a.add((mi * lda + ki) as usize)
                            * *b.add((ni * ldb + ki) as usize);
                    }
                    *c.add((mi * ldc + ni) as usize) = sum;
                }
            }
        }

        Ok(MatMulStats::default())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn fence_create(&mut self) -> Result<FenceId> {
        let id = self.next_fence;
        self.next_fence += 1;
        Ok(FenceId::new(id))
    }

    fn fence_destroy(&mut self, _fence: FenceId) -> Result<()> {
        Ok(())
    }

    fn fence_wait(&mut self, _fence: FenceId, _timeout_ns: u64) -> Result<()> {
        Ok(())
    }
}
