//! The NPM device trait and its supporting types.

use crate::backends::emulator::EmulatorDevice;
use crate::backends::mock::MockDevice;
use crate::error::{NpmError, Result};
use npm_protocol::{DataType, Sku};
use std::fmt::Debug;

/// Environment variable selecting the backend (`mock`, `emulator`,
/// `hardware`).
pub const DEVICE_ENV: &str = "NPM_DEVICE";

/// Environment variable overriding the emulator socket path.
pub const SOCKET_ENV: &str = "NPM_EMULATOR_SOCKET";

/// Opaque, nonzero identifier for a registered buffer.
///
/// Value 0 is reserved as invalid. Handles are unique within the
/// issuing backend for its whole lifetime — they are never reused after
/// `unregister_buffer`. A handle is only meaningful to the backend that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    /// The reserved invalid handle.
    pub const INVALID: Self = Self(0);

    /// Wrap a raw wire value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True unless this is the reserved invalid handle.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Opaque fence identifier allocated by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(u64);

impl FenceId {
    /// Wrap a raw wire value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Parameters for a matmul dispatch: `C[m,n] = Σₖ A[m·lda+k]·B[n·ldb+k]`,
/// written at `C[m·ldc+n]`. Offsets are in bytes from the start of each
/// registered buffer; leading dimensions are in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulParams {
    /// Handle of input matrix A.
    pub a_handle: BufferHandle,
    /// Byte offset within A's buffer.
    pub a_offset: usize,
    /// Handle of input matrix B (weights).
    pub b_handle: BufferHandle,
    /// Byte offset within B's buffer.
    pub b_offset: usize,
    /// Handle of output matrix C.
    pub c_handle: BufferHandle,
    /// Byte offset within C's buffer.
    pub c_offset: usize,
    /// Rows of A and C.
    pub m: i64,
    /// Rows of B, columns of C.
    pub n: i64,
    /// Inner dimension.
    pub k: i64,
    /// Leading dimension of A in elements; `lda >= k`.
    pub lda: i64,
    /// Leading dimension of B in elements; `ldb >= k`.
    pub ldb: i64,
    /// Leading dimension of C in elements; `ldc >= n`.
    pub ldc: i64,
    /// Element type of A.
    pub type_a: DataType,
    /// Element type of B.
    pub type_b: DataType,
    /// Element type of C.
    pub type_c: DataType,
}

impl MatMulParams {
    /// Check the dimension and type preconditions shared by every
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`NpmError::InvalidParams`] naming the violated
    /// precondition.
    pub fn validate(&self) -> Result<()> {
        if self.m <= 0 || self.n <= 0 || self.k <= 0 {
            return Err(NpmError::invalid_params(format!(
                "matmul dimensions must be positive: M={} N={} K={}",
                self.m, self.n, self.k
            )));
        }
        if self.lda < self.k || self.ldb < self.k || self.ldc < self.n {
            return Err(NpmError::invalid_params(format!(
                "leading dimensions too small: lda={} ldb={} (K={}), ldc={} (N={})",
                self.lda, self.ldb, self.k, self.ldc, self.n
            )));
        }
        if self.type_a != DataType::F32
            || self.type_b != DataType::F32
            || self.type_c != DataType::F32
        {
            return Err(NpmError::invalid_params(format!(
                "matmul requires FP32 operands, got {:?}/{:?}/{:?}",
                self.type_a, self.type_b, self.type_c
            )));
        }
        if !self.a_handle.is_valid() || !self.b_handle.is_valid() || !self.c_handle.is_valid() {
            return Err(NpmError::invalid_handle(0));
        }
        Ok(())
    }
}

/// Timing and traffic reported by a matmul dispatch.
///
/// The mock backend reports zeros; the emulator fills these from its
/// DMA/cycle model when tiling and timing are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatMulStats {
    /// Simulated cycle count (0 when timing is disabled).
    pub cycles: u64,
    /// Total modeled DMA traffic in bytes (0 when tiling is disabled).
    pub dma_bytes: u64,
}

/// Uniform capability set implemented by every NPM backend.
///
/// # Memory contract
///
/// Buffer registration hands the backend a raw pointer. The caller
/// promises that the pointed-to memory stays valid and unmoved from
/// `register_buffer` until the matching `unregister_buffer` (or
/// `shutdown`), and that it is not mutated concurrently with a dispatch
/// that reads it. That promise is the reason `register_buffer` and
/// `update_buffer` are `unsafe fn`s.
pub trait NpmDevice: Debug {
    /// Initialize a backend instance for `device_id`.
    ///
    /// One-shot: a successfully constructed device is ready for use.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be brought up (emulator
    /// unreachable, handshake failure, ...).
    fn init(device_id: u32) -> Result<Self>
    where
        Self: Sized;

    /// Release all backend resources.
    ///
    /// Idempotent: a second call is a no-op and returns success. After
    /// shutdown every previously issued handle is invalid.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown I/O fails; local state is released
    /// regardless.
    fn shutdown(&mut self) -> Result<()>;

    /// Device SKU.
    fn sku(&self) -> Sku;

    /// Number of compute engines.
    fn num_engines(&self) -> u32;

    /// L1 scratchpad size per engine, bytes.
    fn l1_size(&self) -> usize;

    /// Shared L2 size, bytes.
    fn l2_size(&self) -> usize;

    /// Register a host buffer and receive a nonzero handle.
    ///
    /// # Errors
    ///
    /// [`NpmError::InvalidParams`] for a null pointer or zero size;
    /// backend-specific errors otherwise (arena exhaustion, transport).
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size` readable (and, for output buffers,
    /// writable) bytes that outlive the registration; see the trait-level
    /// memory contract.
    unsafe fn register_buffer(&mut self, ptr: *mut u8, size: usize) -> Result<BufferHandle>;

    /// Unregister a buffer. Silent no-op on an unknown handle.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport failures.
    fn unregister_buffer(&mut self, handle: BufferHandle) -> Result<()>;

    /// Replace the content associated with `handle`.
    ///
    /// Required for backends that shadow client memory (emulator); a
    /// cheap refresh for backends that share it (mock).
    ///
    /// # Errors
    ///
    /// [`NpmError::InvalidHandle`] for an unknown handle,
    /// [`NpmError::InvalidParams`] if `size` exceeds the size at
    /// registration.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size` readable bytes for the duration of the
    /// call (and, for the mock backend, until unregistration — the mock
    /// keeps the pointer).
    unsafe fn update_buffer(&mut self, handle: BufferHandle, ptr: *mut u8, size: usize)
        -> Result<()>;

    /// Execute a matmul synchronously. All referenced handles must be
    /// live and the accessed ranges inside their buffers.
    ///
    /// # Errors
    ///
    /// [`NpmError::InvalidHandle`] / [`NpmError::InvalidParams`] per the
    /// preconditions; transport errors on the emulator backend.
    fn matmul(&mut self, params: &MatMulParams) -> Result<MatMulStats>;

    /// Return once all prior operations are observable. Free for
    /// synchronous backends.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    fn sync(&mut self) -> Result<()>;

    /// Allocate an opaque fence.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    fn fence_create(&mut self) -> Result<FenceId>;

    /// Destroy a fence.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    fn fence_destroy(&mut self, fence: FenceId) -> Result<()>;

    /// Wait on a fence for up to `timeout_ns` nanoseconds.
    ///
    /// The synchronous reference backends return immediately, including
    /// for `timeout_ns == 0`; a hardware backend must treat 0 as
    /// infinite.
    ///
    /// # Errors
    ///
    /// [`NpmError::Timeout`] if the wait expires; transport errors on
    /// the emulator backend.
    fn fence_wait(&mut self, fence: FenceId, timeout_ns: u64) -> Result<()>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelection {
    /// In-process mock backend.
    Mock,
    /// Out-of-process emulator backend.
    Emulator,
    /// Real NPM silicon (not available in this build).
    Hardware,
}

impl std::str::FromStr for DeviceSelection {
    type Err = NpmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "emulator" => Ok(Self::Emulator),
            "hardware" => Ok(Self::Hardware),
            other => Err(NpmError::invalid_params(format!(
                "unknown {DEVICE_ENV} value {other:?} (valid: mock, emulator, hardware)"
            ))),
        }
    }
}

/// Construct the selected backend.
///
/// # Errors
///
/// Propagates backend construction failures. `Hardware` always fails in
/// this build: the silicon backend exists only as a named contract.
pub fn select_device(selection: DeviceSelection) -> Result<Box<dyn NpmDevice>> {
    match selection {
        DeviceSelection::Mock => {
            let dev = MockDevice::init(0)?;
            tracing::info!("NPM mock device initialized");
            Ok(Box::new(dev))
        }
        DeviceSelection::Emulator => {
            let dev = EmulatorDevice::init(0)?;
            tracing::info!("NPM emulator device initialized ({})", dev.socket_path());
            Ok(Box::new(dev))
        }
        DeviceSelection::Hardware => Err(NpmError::invalid_params(
            "NPM hardware backend is not available in this build",
        )),
    }
}

/// Construct the backend selected by the `NPM_DEVICE` environment
/// variable, defaulting to the mock.
///
/// # Errors
///
/// [`NpmError::InvalidParams`] for an unknown value; backend errors
/// otherwise.
pub fn device_from_env() -> Result<Box<dyn NpmDevice>> {
    let selection = match std::env::var(DEVICE_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => DeviceSelection::Mock,
    };
    select_device(selection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> MatMulParams {
        MatMulParams {
            a_handle: BufferHandle::new(1),
            a_offset: 0,
            b_handle: BufferHandle::new(2),
            b_offset: 0,
            c_handle: BufferHandle::new(3),
            c_offset: 0,
            m: 2,
            n: 4,
            k: 3,
            lda: 3,
            ldb: 3,
            ldc: 4,
            type_a: DataType::F32,
            type_b: DataType::F32,
            type_c: DataType::F32,
        }
    }

    #[test]
    fn params_validation() {
        assert!(valid_params().validate().is_ok());

        let mut p = valid_params();
        p.m = 0;
        assert!(matches!(p.validate(), Err(NpmError::InvalidParams { .. })));

        let mut p = valid_params();
        p.lda = p.k - 1;
        assert!(matches!(p.validate(), Err(NpmError::InvalidParams { .. })));

        let mut p = valid_params();
        p.type_b = DataType::F16;
        assert!(matches!(p.validate(), Err(NpmError::InvalidParams { .. })));

        let mut p = valid_params();
        p.c_handle = BufferHandle::INVALID;
        assert!(matches!(p.validate(), Err(NpmError::InvalidHandle { .. })));
    }

    #[test]
    fn selection_parsing() {
        assert_eq!("mock".parse::<DeviceSelection>().unwrap(), DeviceSelection::Mock);
        assert_eq!(
            "Emulator".parse::<DeviceSelection>().unwrap(),
            DeviceSelection::Emulator
        );
        assert!("npu".parse::<DeviceSelection>().is_err());
    }

    #[test]
    fn hardware_selection_is_a_setup_error() {
        assert!(matches!(
            select_device(DeviceSelection::Hardware),
            Err(NpmError::InvalidParams { .. })
        ));
    }
}
