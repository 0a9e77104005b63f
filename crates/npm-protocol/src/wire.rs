//! Binary IPC protocol between the NPM device driver and the emulator.
//!
//! Communication uses a Unix stream socket for control messages, with
//! tensor payloads carried out-of-band in POSIX shared memory. Every
//! message is a fixed-layout, densely packed, little-endian [`Header`]
//! followed by a command-specific payload whose size is determined by
//! the command — `payload_size` in the header must match it exactly.
//!
//! The protocol is versioned: a major version mismatch is fatal, minor
//! differences are accepted by the server.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Protocol magic — "NPME" read as a little-endian `u32`.
pub const MAGIC: u32 = 0x454D_504E;

/// Protocol major version. Peers with a different major cannot talk.
pub const VERSION_MAJOR: u8 = 1;

/// Protocol minor version. Minor differences are accepted.
pub const VERSION_MINOR: u8 = 0;

/// Default Unix socket path for the emulator.
pub const DEFAULT_SOCKET: &str = "/tmp/npm-emulator.sock";

/// Fixed width of the shared-memory name field in HELLO (NUL padded).
pub const MAX_SHM_NAME: usize = 64;

/// Encoded size of [`Header`] in bytes.
pub const HEADER_SIZE: usize = 16;

/// Result alias for codec operations.
pub type WireResult<T> = std::result::Result<T, WireError>;

/// Errors produced by the protocol codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Header magic did not match [`MAGIC`].
    #[error("bad protocol magic {found:#010x} (expected {MAGIC:#010x})")]
    BadMagic {
        /// The magic value found on the wire.
        found: u32,
    },

    /// Peer speaks a different protocol major version.
    #[error("protocol version mismatch: peer major {peer}, ours {ours}")]
    VersionMismatch {
        /// Major version claimed by the peer.
        peer: u8,
        /// Our major version.
        ours: u8,
    },

    /// The command byte is not in the protocol's command set.
    #[error("unknown command {0:#04x}")]
    UnknownCmd(u8),

    /// Header `payload_size` disagrees with the command's fixed payload.
    #[error("payload size {got} for {cmd:?} (expected {expected})")]
    PayloadSize {
        /// Command the header declared.
        cmd: Cmd,
        /// Size the header declared.
        got: usize,
        /// Size the command requires.
        expected: usize,
    },

    /// Not enough bytes to decode the message.
    #[error("truncated message: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// The status byte is not in the protocol's status set.
    #[error("unknown status code {0:#04x}")]
    UnknownStatus(u8),

    /// Shared-memory name does not fit the fixed HELLO field.
    #[error("shared memory name too long: {0} bytes (max {max})", max = MAX_SHM_NAME - 1)]
    ShmNameTooLong(usize),

    /// Shared-memory name field was not valid UTF-8.
    #[error("shared memory name is not valid UTF-8")]
    ShmNameEncoding,
}

/// Protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    /// Version handshake and shared-memory setup.
    Hello = 0x00,
    /// Clean disconnect.
    Goodbye = 0x01,
    /// Keep-alive with echo payload and timestamps.
    Ping = 0x02,
    /// Register a buffer (shm offset + size) and receive a handle.
    RegisterBuffer = 0x20,
    /// Unregister a buffer by handle.
    UnregisterBuffer = 0x21,
    /// Matrix multiplication C = A · Bᵀ.
    MatMul = 0x30,
    /// Global synchronization barrier.
    Sync = 0x40,
    /// Create a fence, receiving its id.
    FenceCreate = 0x41,
    /// Destroy a fence by id.
    FenceDestroy = 0x42,
    /// Wait on a fence with a timeout.
    FenceWait = 0x43,
}

impl Cmd {
    /// Decode a command byte.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownCmd`] for bytes outside the command set.
    pub fn from_wire(byte: u8) -> WireResult<Self> {
        Ok(match byte {
            0x00 => Self::Hello,
            0x01 => Self::Goodbye,
            0x02 => Self::Ping,
            0x20 => Self::RegisterBuffer,
            0x21 => Self::UnregisterBuffer,
            0x30 => Self::MatMul,
            0x40 => Self::Sync,
            0x41 => Self::FenceCreate,
            0x42 => Self::FenceDestroy,
            0x43 => Self::FenceWait,
            other => return Err(WireError::UnknownCmd(other)),
        })
    }

    /// Fixed request payload size for this command.
    pub const fn request_payload_size(self) -> usize {
        match self {
            Self::Hello => HelloRequest::WIRE_SIZE,
            Self::Goodbye | Self::Sync | Self::FenceCreate => 0,
            Self::Ping => PingRequest::WIRE_SIZE,
            Self::RegisterBuffer => RegisterBufferRequest::WIRE_SIZE,
            Self::UnregisterBuffer => UnregisterBufferRequest::WIRE_SIZE,
            Self::MatMul => MatMulRequest::WIRE_SIZE,
            Self::FenceDestroy => FenceDestroyRequest::WIRE_SIZE,
            Self::FenceWait => FenceWaitRequest::WIRE_SIZE,
        }
    }

    /// Fixed response payload size for this command.
    pub const fn response_payload_size(self) -> usize {
        match self {
            Self::Hello => HelloResponse::WIRE_SIZE,
            Self::Ping => PingResponse::WIRE_SIZE,
            Self::RegisterBuffer => RegisterBufferResponse::WIRE_SIZE,
            Self::MatMul => MatMulResponse::WIRE_SIZE,
            Self::FenceCreate => FenceCreateResponse::WIRE_SIZE,
            Self::Goodbye
            | Self::Sync
            | Self::UnregisterBuffer
            | Self::FenceDestroy
            | Self::FenceWait => StatusResponse::WIRE_SIZE,
        }
    }

    /// Trace-friendly command name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Goodbye => "GOODBYE",
            Self::Ping => "PING",
            Self::RegisterBuffer => "REGISTER_BUFFER",
            Self::UnregisterBuffer => "UNREGISTER_BUFFER",
            Self::MatMul => "MATMUL",
            Self::Sync => "SYNC",
            Self::FenceCreate => "FENCE_CREATE",
            Self::FenceDestroy => "FENCE_DESTROY",
            Self::FenceWait => "FENCE_WAIT",
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Operation succeeded.
    Ok = 0x00,
    /// Generic failure (bad magic, mapping failure, ...).
    Error = 0x01,
    /// Protocol major versions differ.
    VersionMismatch = 0x02,
    /// Unknown or stale buffer handle, or out-of-bounds offset.
    InvalidHandle = 0x03,
    /// Allocation could not be satisfied.
    OutOfMemory = 0x04,
    /// Request parameters violate an operation's preconditions.
    InvalidParams = 0x05,
    /// A wait expired before completion.
    Timeout = 0x06,
}

impl Status {
    /// Decode a status byte.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownStatus`] for bytes outside the status set.
    pub fn from_wire(byte: u8) -> WireResult<Self> {
        Ok(match byte {
            0x00 => Self::Ok,
            0x01 => Self::Error,
            0x02 => Self::VersionMismatch,
            0x03 => Self::InvalidHandle,
            0x04 => Self::OutOfMemory,
            0x05 => Self::InvalidParams,
            0x06 => Self::Timeout,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }

    /// True for [`Status::Ok`].
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Fixed 16-byte message header preceding every payload.
///
/// `cmd` is kept as the raw wire byte so a header can be decoded,
/// validated, and answered (e.g. with `VERSION_MISMATCH`) even when the
/// peer speaks a newer protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol magic, [`MAGIC`] on every valid message.
    pub magic: u32,
    /// Sender's protocol major version.
    pub version_major: u8,
    /// Sender's protocol minor version.
    pub version_minor: u8,
    /// Raw command byte (see [`Cmd`]).
    pub cmd: u8,
    /// Reserved, 0.
    pub flags: u8,
    /// Monotonic sequence id correlating request and response.
    pub seq_id: u32,
    /// Size of the payload following this header.
    pub payload_size: u32,
}

impl Header {
    /// Build a header carrying our protocol version.
    pub fn new(cmd: Cmd, seq_id: u32, payload_size: u32) -> Self {
        Self {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            cmd: cmd as u8,
            flags: 0,
            seq_id,
            payload_size,
        }
    }

    /// Append the encoded header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_u8(self.cmd);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.seq_id);
        buf.put_u32_le(self.payload_size);
    }

    /// Decode a header from exactly [`HEADER_SIZE`] leading bytes.
    ///
    /// Performs no semantic checks; see [`Header::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] if fewer bytes are available.
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let mut b = bytes;
        Ok(Self {
            magic: b.get_u32_le(),
            version_major: b.get_u8(),
            version_minor: b.get_u8(),
            cmd: b.get_u8(),
            flags: b.get_u8(),
            seq_id: b.get_u32_le(),
            payload_size: b.get_u32_le(),
        })
    }

    /// Validate magic and protocol major version.
    ///
    /// # Errors
    ///
    /// [`WireError::BadMagic`] aborts the session; on
    /// [`WireError::VersionMismatch`] a server can still answer with
    /// [`Status::VersionMismatch`] before closing.
    pub fn validate(&self) -> WireResult<()> {
        if self.magic != MAGIC {
            return Err(WireError::BadMagic { found: self.magic });
        }
        if self.version_major != VERSION_MAJOR {
            return Err(WireError::VersionMismatch {
                peer: self.version_major,
                ours: VERSION_MAJOR,
            });
        }
        Ok(())
    }

    /// Decode the command byte and check `payload_size` against the
    /// command's fixed request payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownCmd`] or [`WireError::PayloadSize`].
    pub fn request_cmd(&self) -> WireResult<Cmd> {
        let cmd = Cmd::from_wire(self.cmd)?;
        let expected = cmd.request_payload_size();
        if self.payload_size as usize != expected {
            return Err(WireError::PayloadSize {
                cmd,
                got: self.payload_size as usize,
                expected,
            });
        }
        Ok(cmd)
    }
}

fn check_len(bytes: &[u8], need: usize) -> WireResult<()> {
    if bytes.len() < need {
        return Err(WireError::Truncated {
            need,
            have: bytes.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HELLO
// ---------------------------------------------------------------------------

/// HELLO request: client's version plus the shared-memory region it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    /// Client protocol major version.
    pub version_major: u8,
    /// Client protocol minor version.
    pub version_minor: u8,
    /// Shared-memory region name (e.g. `/npm-shm-12345-0`).
    pub shm_name: String,
    /// Shared-memory region size in bytes.
    pub shm_size: u64,
}

impl HelloRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4 + MAX_SHM_NAME + 8;

    /// Append the encoded request to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::ShmNameTooLong`] if the name does not fit the
    /// fixed field with its terminating NUL.
    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        let name = self.shm_name.as_bytes();
        if name.len() >= MAX_SHM_NAME {
            return Err(WireError::ShmNameTooLong(name.len()));
        }
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_bytes(0, 2);
        buf.put_slice(name);
        buf.put_bytes(0, MAX_SHM_NAME - name.len());
        buf.put_u64_le(self.shm_size);
        Ok(())
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::ShmNameEncoding`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        let version_major = b.get_u8();
        let version_minor = b.get_u8();
        b.advance(2);
        let raw_name = &b[..MAX_SHM_NAME];
        let end = raw_name.iter().position(|&c| c == 0).unwrap_or(MAX_SHM_NAME);
        let shm_name = std::str::from_utf8(&raw_name[..end])
            .map_err(|_| WireError::ShmNameEncoding)?
            .to_owned();
        b.advance(MAX_SHM_NAME);
        let shm_size = b.get_u64_le();
        Ok(Self {
            version_major,
            version_minor,
            shm_name,
            shm_size,
        })
    }
}

/// HELLO response: status plus the emulated device's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloResponse {
    /// Handshake outcome.
    pub status: Status,
    /// Server protocol major version.
    pub version_major: u8,
    /// Server protocol minor version.
    pub version_minor: u8,
    /// Emulated SKU (see [`crate::sku::Sku`] wire values).
    pub sku: u32,
    /// Number of compute engines.
    pub num_engines: u32,
    /// L1 scratchpad size per engine, bytes.
    pub l1_size: u64,
    /// Shared L2 size, bytes.
    pub l2_size: u64,
}

impl HelloResponse {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4 + 4 + 4 + 8 + 8;

    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_u8(0);
        buf.put_u32_le(self.sku);
        buf.put_u32_le(self.num_engines);
        buf.put_u64_le(self.l1_size);
        buf.put_u64_le(self.l2_size);
    }

    /// Decode a response from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::UnknownStatus`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        let status = Status::from_wire(b.get_u8())?;
        let version_major = b.get_u8();
        let version_minor = b.get_u8();
        b.advance(1);
        Ok(Self {
            status,
            version_major,
            version_minor,
            sku: b.get_u32_le(),
            num_engines: b.get_u32_le(),
            l1_size: b.get_u64_le(),
            l2_size: b.get_u64_le(),
        })
    }
}

// ---------------------------------------------------------------------------
// Status-only responses (GOODBYE, UNREGISTER_BUFFER, SYNC, FENCE_*)
// ---------------------------------------------------------------------------

/// Response carrying only a status byte (padded to four bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    /// Operation outcome.
    pub status: Status,
}

impl StatusResponse {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4;

    /// Shorthand for an OK response.
    pub const OK: Self = Self { status: Status::Ok };

    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_bytes(0, 3);
    }

    /// Decode a response from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::UnknownStatus`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        Ok(Self {
            status: Status::from_wire(bytes[0])?,
        })
    }
}

// ---------------------------------------------------------------------------
// PING
// ---------------------------------------------------------------------------

/// PING request: opaque echo payload plus the client's send timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRequest {
    /// Opaque value echoed back by the server.
    pub echo: u64,
    /// Client timestamp, nanoseconds (opaque to the server).
    pub client_ts: u64,
}

impl PingRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 16;

    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.echo);
        buf.put_u64_le(self.client_ts);
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            echo: b.get_u64_le(),
            client_ts: b.get_u64_le(),
        })
    }
}

/// PING response: both timestamps plus the echoed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResponse {
    /// Operation outcome.
    pub status: Status,
    /// Client timestamp from the request.
    pub client_ts: u64,
    /// Server monotonic timestamp at handling time, nanoseconds.
    pub server_ts: u64,
    /// Echoed request value.
    pub echo: u64,
}

impl PingResponse {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4 + 24;

    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.client_ts);
        buf.put_u64_le(self.server_ts);
        buf.put_u64_le(self.echo);
    }

    /// Decode a response from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::UnknownStatus`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        let status = Status::from_wire(b.get_u8())?;
        b.advance(3);
        Ok(Self {
            status,
            client_ts: b.get_u64_le(),
            server_ts: b.get_u64_le(),
            echo: b.get_u64_le(),
        })
    }
}

// ---------------------------------------------------------------------------
// REGISTER_BUFFER / UNREGISTER_BUFFER
// ---------------------------------------------------------------------------

/// REGISTER_BUFFER request: a span of the shared-memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBufferRequest {
    /// Offset of the buffer within the shared-memory region.
    pub shm_offset: u64,
    /// Buffer size in bytes.
    pub size: u64,
    /// Advisory allocation flags (placement hints, not load-bearing).
    pub flags: u32,
}

impl RegisterBufferRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 8 + 8 + 4 + 4;

    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.shm_offset);
        buf.put_u64_le(self.size);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(0);
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            shm_offset: b.get_u64_le(),
            size: b.get_u64_le(),
            flags: b.get_u32_le(),
        })
    }
}

/// REGISTER_BUFFER response: the issued handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBufferResponse {
    /// Operation outcome.
    pub status: Status,
    /// Issued buffer handle; nonzero on success.
    pub handle: u64,
}

impl RegisterBufferResponse {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4 + 8;

    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.handle);
    }

    /// Decode a response from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::UnknownStatus`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        let status = Status::from_wire(b.get_u8())?;
        b.advance(3);
        Ok(Self {
            status,
            handle: b.get_u64_le(),
        })
    }
}

/// UNREGISTER_BUFFER request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnregisterBufferRequest {
    /// Handle to retire.
    pub handle: u64,
}

impl UnregisterBufferRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 8;

    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.handle);
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            handle: b.get_u64_le(),
        })
    }
}

// ---------------------------------------------------------------------------
// MATMUL
// ---------------------------------------------------------------------------

/// MATMUL request: `C[m,n] = Σₖ A[m·lda+k] · B[n·ldb+k]` over registered
/// buffers, written at `C[m·ldc+n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulRequest {
    /// Handle of input matrix A.
    pub a_handle: u64,
    /// Byte offset within A's buffer.
    pub a_offset: u64,
    /// Handle of input matrix B (weights).
    pub b_handle: u64,
    /// Byte offset within B's buffer.
    pub b_offset: u64,
    /// Handle of output matrix C.
    pub c_handle: u64,
    /// Byte offset within C's buffer.
    pub c_offset: u64,
    /// Rows of A and C.
    pub m: i64,
    /// Rows of B, columns of C.
    pub n: i64,
    /// Inner dimension.
    pub k: i64,
    /// Leading dimension (elements) of A; `lda >= k`.
    pub lda: i64,
    /// Leading dimension (elements) of B; `ldb >= k`.
    pub ldb: i64,
    /// Leading dimension (elements) of C; `ldc >= n`.
    pub ldc: i64,
    /// Element type of A (see [`crate::types::DataType`]).
    pub type_a: u32,
    /// Element type of B.
    pub type_b: u32,
    /// Element type of C.
    pub type_c: u32,
    /// Reserved, 0.
    pub flags: u32,
}

impl MatMulRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 6 * 8 + 6 * 8 + 4 * 4;

    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.a_handle);
        buf.put_u64_le(self.a_offset);
        buf.put_u64_le(self.b_handle);
        buf.put_u64_le(self.b_offset);
        buf.put_u64_le(self.c_handle);
        buf.put_u64_le(self.c_offset);
        buf.put_i64_le(self.m);
        buf.put_i64_le(self.n);
        buf.put_i64_le(self.k);
        buf.put_i64_le(self.lda);
        buf.put_i64_le(self.ldb);
        buf.put_i64_le(self.ldc);
        buf.put_u32_le(self.type_a);
        buf.put_u32_le(self.type_b);
        buf.put_u32_le(self.type_c);
        buf.put_u32_le(self.flags);
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            a_handle: b.get_u64_le(),
            a_offset: b.get_u64_le(),
            b_handle: b.get_u64_le(),
            b_offset: b.get_u64_le(),
            c_handle: b.get_u64_le(),
            c_offset: b.get_u64_le(),
            m: b.get_i64_le(),
            n: b.get_i64_le(),
            k: b.get_i64_le(),
            lda: b.get_i64_le(),
            ldb: b.get_i64_le(),
            ldc: b.get_i64_le(),
            type_a: b.get_u32_le(),
            type_b: b.get_u32_le(),
            type_c: b.get_u32_le(),
            flags: b.get_u32_le(),
        })
    }
}

/// MATMUL response: status plus timing/traffic from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatMulResponse {
    /// Operation outcome.
    pub status: Status,
    /// Simulated cycle count (0 when timing is disabled).
    pub cycles: u64,
    /// Total modeled DMA traffic in bytes (0 when tiling is disabled).
    pub dma_bytes: u64,
}

impl MatMulResponse {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4 + 8 + 8;

    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.cycles);
        buf.put_u64_le(self.dma_bytes);
    }

    /// Decode a response from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::UnknownStatus`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        let status = Status::from_wire(b.get_u8())?;
        b.advance(3);
        Ok(Self {
            status,
            cycles: b.get_u64_le(),
            dma_bytes: b.get_u64_le(),
        })
    }
}

// ---------------------------------------------------------------------------
// FENCE_*
// ---------------------------------------------------------------------------

/// FENCE_CREATE response: the allocated fence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceCreateResponse {
    /// Operation outcome.
    pub status: Status,
    /// Allocated fence id; monotonic per session.
    pub fence_id: u64,
}

impl FenceCreateResponse {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 4 + 8;

    /// Append the encoded response to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.status as u8);
        buf.put_bytes(0, 3);
        buf.put_u64_le(self.fence_id);
    }

    /// Decode a response from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`] or [`WireError::UnknownStatus`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        let status = Status::from_wire(b.get_u8())?;
        b.advance(3);
        Ok(Self {
            status,
            fence_id: b.get_u64_le(),
        })
    }
}

/// FENCE_DESTROY request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceDestroyRequest {
    /// Fence to destroy.
    pub fence_id: u64,
}

impl FenceDestroyRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 8;

    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.fence_id);
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            fence_id: b.get_u64_le(),
        })
    }
}

/// FENCE_WAIT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceWaitRequest {
    /// Fence to wait on.
    pub fence_id: u64,
    /// Timeout in nanoseconds; 0 means infinite on real hardware.
    pub timeout_ns: u64,
}

impl FenceWaitRequest {
    /// Encoded payload size.
    pub const WIRE_SIZE: usize = 16;

    /// Append the encoded request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.fence_id);
        buf.put_u64_le(self.timeout_ns);
    }

    /// Decode a request from the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Truncated`].
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        check_len(bytes, Self::WIRE_SIZE)?;
        let mut b = bytes;
        Ok(Self {
            fence_id: b.get_u64_le(),
            timeout_ns: b.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_is_bit_exact() {
        for cmd in [
            Cmd::Hello,
            Cmd::Goodbye,
            Cmd::Ping,
            Cmd::RegisterBuffer,
            Cmd::UnregisterBuffer,
            Cmd::MatMul,
            Cmd::Sync,
            Cmd::FenceCreate,
            Cmd::FenceDestroy,
            Cmd::FenceWait,
        ] {
            let hdr = Header::new(cmd, 0xDEAD_BEEF, cmd.request_payload_size() as u32);
            let mut buf = BytesMut::new();
            hdr.encode(&mut buf);
            assert_eq!(buf.len(), HEADER_SIZE);
            let back = Header::decode(&buf).unwrap();
            assert_eq!(back, hdr);
            assert_eq!(back.request_cmd().unwrap(), cmd);
        }
    }

    #[test]
    fn header_wire_layout_is_little_endian() {
        let hdr = Header::new(Cmd::MatMul, 7, 112);
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        // "NPME" magic, LE
        assert_eq!(&buf[0..4], &[0x4E, 0x50, 0x4D, 0x45]);
        assert_eq!(buf[4], VERSION_MAJOR);
        assert_eq!(buf[6], 0x30);
        assert_eq!(&buf[8..12], &7u32.to_le_bytes());
        assert_eq!(&buf[12..16], &112u32.to_le_bytes());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut hdr = Header::new(Cmd::Sync, 1, 0);
        hdr.magic = 0x1234_5678;
        assert!(matches!(
            hdr.validate(),
            Err(WireError::BadMagic { found: 0x1234_5678 })
        ));
    }

    #[test]
    fn major_version_mismatch_rejected() {
        let mut hdr = Header::new(Cmd::Hello, 1, HelloRequest::WIRE_SIZE as u32);
        hdr.version_major = VERSION_MAJOR + 1;
        assert!(matches!(
            hdr.validate(),
            Err(WireError::VersionMismatch { .. })
        ));
        // minor differences are fine
        let mut hdr = Header::new(Cmd::Hello, 1, HelloRequest::WIRE_SIZE as u32);
        hdr.version_minor = VERSION_MINOR + 3;
        assert!(hdr.validate().is_ok());
    }

    #[test]
    fn payload_size_must_match_command() {
        let hdr = Header::new(Cmd::MatMul, 3, MatMulRequest::WIRE_SIZE as u32 + 1);
        assert!(matches!(
            hdr.request_cmd(),
            Err(WireError::PayloadSize { cmd: Cmd::MatMul, .. })
        ));
    }

    #[test]
    fn hello_request_pads_and_trims_name() {
        let req = HelloRequest {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            shm_name: "/npm-shm-4242-0".to_owned(),
            shm_size: 1536 * 1024 * 1024,
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HelloRequest::WIRE_SIZE);
        let back = HelloRequest::decode(&buf).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn hello_request_rejects_oversize_name() {
        let req = HelloRequest {
            version_major: 1,
            version_minor: 0,
            shm_name: "x".repeat(MAX_SHM_NAME),
            shm_size: 0,
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            req.encode(&mut buf),
            Err(WireError::ShmNameTooLong(_))
        ));
    }

    #[test]
    fn matmul_request_roundtrip() {
        let req = MatMulRequest {
            a_handle: 1,
            a_offset: 64,
            b_handle: 2,
            b_offset: 0,
            c_handle: 3,
            c_offset: 128,
            m: 2,
            n: 4,
            k: 3,
            lda: 3,
            ldb: 3,
            ldc: 4,
            type_a: 0,
            type_b: 0,
            type_c: 0,
            flags: 0,
        };
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(buf.len(), MatMulRequest::WIRE_SIZE);
        assert_eq!(MatMulRequest::decode(&buf).unwrap(), req);
    }

    #[test]
    fn truncated_payload_is_reported() {
        let err = MatMulResponse::decode(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { need: 20, have: 5 }));
    }

    #[test]
    fn unknown_status_is_reported() {
        let bytes = [0x7Fu8, 0, 0, 0];
        assert!(matches!(
            StatusResponse::decode(&bytes),
            Err(WireError::UnknownStatus(0x7F))
        ));
    }
}
