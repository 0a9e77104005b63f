//! Error types for NPM device operations.

use npm_protocol::{Status, WireError};
use thiserror::Error;

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, NpmError>;

/// Errors that can occur during NPM device operations.
///
/// The kinds are deliberately kept apart — the emulator distinguishes
/// `InvalidHandle` from `InvalidParams` on the wire and callers rely on
/// that distinction.
#[derive(Debug, Error)]
pub enum NpmError {
    /// Socket failure, short read/write, or an unexpected disconnect.
    /// The session is dead; a new device must be created.
    #[error("transport failure: {reason}")]
    Transport {
        /// What went wrong on the wire.
        reason: String,
    },

    /// Malformed or incompatible protocol traffic.
    #[error("protocol violation: {source}")]
    Protocol {
        /// The codec-level failure.
        #[from]
        source: WireError,
    },

    /// Unknown or stale buffer handle (0 when the peer did not echo it).
    #[error("invalid buffer handle {handle}")]
    InvalidHandle {
        /// The offending handle value.
        handle: u64,
    },

    /// An operation precondition was violated (null pointer, zero size,
    /// dimension constraints, size exceeding registered capacity, ...).
    #[error("invalid parameters: {reason}")]
    InvalidParams {
        /// Which precondition failed.
        reason: String,
    },

    /// An allocation could not be satisfied.
    #[error("out of memory: {reason}")]
    OutOfMemory {
        /// What was being allocated.
        reason: String,
    },

    /// A wait expired before completion.
    #[error("operation timed out after {timeout_ns} ns")]
    Timeout {
        /// The timeout that expired.
        timeout_ns: u64,
    },

    /// Operating-system error from a mapping or socket call.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying OS error.
        #[from]
        source: std::io::Error,
    },
}

impl NpmError {
    /// Create a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    /// Create an out-of-memory error.
    pub fn out_of_memory(reason: impl Into<String>) -> Self {
        Self::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Create an invalid-handle error.
    pub const fn invalid_handle(handle: u64) -> Self {
        Self::InvalidHandle { handle }
    }

    /// Map a non-OK response status to the matching error kind.
    ///
    /// `cmd` names the failed command for the error message.
    pub(crate) fn from_status(cmd: &'static str, status: Status) -> Self {
        match status {
            Status::Ok => unreachable!("OK status is not an error"),
            Status::InvalidHandle => Self::InvalidHandle { handle: 0 },
            Status::InvalidParams => Self::invalid_params(format!("{cmd} rejected by device")),
            Status::OutOfMemory => Self::out_of_memory(format!("{cmd} rejected by device")),
            Status::Timeout => Self::Timeout { timeout_ns: 0 },
            Status::VersionMismatch | Status::Error => {
                Self::transport(format!("{cmd} failed with status {status:?}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_keeps_kinds_apart() {
        assert!(matches!(
            NpmError::from_status("MATMUL", Status::InvalidHandle),
            NpmError::InvalidHandle { .. }
        ));
        assert!(matches!(
            NpmError::from_status("MATMUL", Status::InvalidParams),
            NpmError::InvalidParams { .. }
        ));
        assert!(matches!(
            NpmError::from_status("REGISTER_BUFFER", Status::OutOfMemory),
            NpmError::OutOfMemory { .. }
        ));
        assert!(matches!(
            NpmError::from_status("HELLO", Status::VersionMismatch),
            NpmError::Transport { .. }
        ));
    }
}
