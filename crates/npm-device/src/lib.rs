//! Device abstraction layer for the NPM neural-processing accelerator.
//!
//! A host tensor library talks to NPM through one trait, [`NpmDevice`]:
//! register a buffer to get an opaque handle, dispatch matmul kernels
//! that reference handles with byte offsets, synchronize, tear down.
//! Three implementations exist behind that trait:
//!
//! ```text
//! MockDevice      — in-process CPU execution, no external state.
//!                   Reference semantics for tests and CPU delegation.
//! EmulatorDevice  — IPC to the npm-emulator process over a Unix
//!                   socket; tensor data travels through a POSIX
//!                   shared-memory arena the client owns.
//! hardware        — real silicon; not available in this build, the
//!                   selection reports a setup error.
//! ```
//!
//! Selection is per-process via the `NPM_DEVICE` environment variable
//! (`mock`, `emulator`, `hardware`); see [`device_from_env`]. The
//! emulator socket path comes from `NPM_EMULATOR_SOCKET`.
//!
//! # Quick start
//!
//! ```no_run
//! use npm_device::{NpmDevice, MockDevice};
//!
//! # fn main() -> npm_device::Result<()> {
//! let mut dev = MockDevice::init(0)?;
//! let mut a = [1.0f32, 2.0, 3.0, 4.0];
//! // SAFETY: `a` outlives the registration below.
//! let _ha = unsafe { dev.register_buffer(a.as_mut_ptr().cast(), 16)? };
//! // ... register B and C, then dev.matmul(&params)
//! dev.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod backends;
mod device;
mod error;
mod shm;

pub use backends::emulator::EmulatorDevice;
pub use backends::mock::MockDevice;
pub use device::{
    device_from_env, select_device, BufferHandle, DeviceSelection, FenceId, MatMulParams,
    MatMulStats, NpmDevice, DEVICE_ENV, SOCKET_ENV,
};
pub use error::{NpmError, Result};
pub use shm::{ShmArena, SHM_ALIGN};
