//! NPM backend implementations.
//!
//! - [`mock`] — in-process CPU execution against the caller's memory
//! - [`emulator`] — IPC client for the out-of-process emulator

pub mod emulator;
pub mod mock;
