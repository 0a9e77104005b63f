//! Shared protocol definitions for the NPM emulator stack.
//!
//! Everything two cooperating NPM processes must agree on lives here:
//!
//! - [`wire`] — the binary IPC protocol spoken over the Unix socket
//!   (message header, per-command payloads, status codes)
//! - [`sku`] — the closed table of NPM device SKUs (engine counts,
//!   on-chip memory sizes, MAC throughput)
//! - [`types`] — wire-level tensor element type codes
//!
//! The driver side (`npm-device`) and the emulator process
//! (`npm-emulator`) both depend on this crate and nothing else shared,
//! so a protocol change is a change in exactly one place.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod sku;
pub mod types;
pub mod wire;

pub use sku::{Sku, SkuConfig};
pub use types::DataType;
pub use wire::{
    Cmd, FenceCreateResponse, FenceDestroyRequest, FenceWaitRequest, Header, HelloRequest,
    HelloResponse, MatMulRequest, MatMulResponse, PingRequest, PingResponse,
    RegisterBufferRequest, RegisterBufferResponse, Status, StatusResponse,
    UnregisterBufferRequest, WireError, DEFAULT_SOCKET, HEADER_SIZE, MAGIC, MAX_SHM_NAME,
    VERSION_MAJOR, VERSION_MINOR,
};
