//! NPM hardware emulator.
//!
//! A standalone process that models NPM accelerator behavior for the
//! `npm-device` emulator backend. One client at a time connects over a
//! Unix socket, shares a POSIX shared-memory arena, and dispatches
//! commands; the server executes matmul either naively or through a
//! tiled path that accounts DDR↔L2↔L1 traffic against an LRU cache
//! model and a bandwidth/clock DMA model, emitting a structured JSON
//! trace along the way.
//!
//! The crate is a library plus the `npm-emulator` binary so the server
//! can be driven in-process by integration tests.

pub mod config;
pub mod dma;
pub mod memory;
pub mod server;
pub mod trace;

pub use config::EmuConfig;
pub use dma::{DmaConfig, DmaDirection, DmaModel};
pub use memory::{MemoryHierarchy, Staged};
pub use server::EmulatorServer;
pub use trace::{category, OpEvent, TraceCtx};
