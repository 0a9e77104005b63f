//! Emulator NPM backend.
//!
//! IPC client for the `npm-emulator` process. Control messages travel
//! over a Unix stream socket; tensor data lives in a client-owned
//! shared-memory arena the server attaches to during the session.
//!
//! Register copies the caller's bytes into the arena and announces the
//! (offset, size) span; matmul sends handles and dimensions, then
//! copies the output span back into the caller's buffer — the host
//! pipeline reads results from its original pointer. The arena uses a
//! bump allocator, so individual slots are never freed; the whole
//! arena dies with the session.
//!
//! Every request is a strict request/response pair, no pipelining. Any
//! transport failure invalidates the session; a new device must be
//! constructed to reconnect.

use crate::device::{BufferHandle, FenceId, MatMulParams, MatMulStats, NpmDevice, SOCKET_ENV};
use crate::error::{NpmError, Result};
use crate::shm::{ShmArena, SHM_ALIGN};
use bytes::BytesMut;
use npm_protocol::{
    Cmd, FenceCreateResponse, FenceDestroyRequest, FenceWaitRequest, Header, HelloRequest,
    HelloResponse, MatMulRequest, MatMulResponse, RegisterBufferRequest, RegisterBufferResponse,
    Sku, Status, StatusResponse, UnregisterBufferRequest, DEFAULT_SOCKET, HEADER_SIZE,
    VERSION_MAJOR, VERSION_MINOR,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default shared-memory arena size: 1.5 GiB, sized for dequantized
/// model weights.
pub const DEFAULT_SHM_SIZE: usize = 1536 * 1024 * 1024;

/// Send/receive timeout on the client socket.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct RemoteBuffer {
    host_ptr: *mut u8,
    shm_offset: usize,
    size: usize,
}

/// IPC backend talking to a running `npm-emulator` process.
#[derive(Debug)]
pub struct EmulatorDevice {
    stream: Option<UnixStream>,
    arena: Option<ShmArena>,
    socket_path: PathBuf,
    seq_id: u32,
    buffers: HashMap<u64, RemoteBuffer>,
    sku: Sku,
    num_engines: u32,
    l1_size: usize,
    l2_size: usize,
}

impl EmulatorDevice {
    /// Connect to an emulator at `socket_path` with the default arena
    /// size.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is unreachable, the arena cannot
    /// be created, or the HELLO handshake fails. All partially acquired
    /// resources are released before returning.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with(socket_path, DEFAULT_SHM_SIZE)
    }

    /// Connect with an explicit shared-memory arena size.
    ///
    /// # Errors
    ///
    /// See [`EmulatorDevice::connect`].
    pub fn connect_with(socket_path: impl AsRef<Path>, shm_size: usize) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        let stream = UnixStream::connect(&socket_path).map_err(|e| {
            NpmError::transport(format!(
                "cannot connect to emulator at {}: {e} (is npm-emulator running?)",
                socket_path.display()
            ))
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let arena = ShmArena::create(shm_size)?;

        let mut dev = Self {
            stream: Some(stream),
            arena: Some(arena),
            socket_path,
            seq_id: 0,
            buffers: HashMap::new(),
            sku: Sku::Emulator,
            num_engines: 0,
            l1_size: 0,
            l2_size: 0,
        };

        if let Err(e) = dev.handshake() {
            // roll back cleanly: close the socket, destroy the arena
            dev.stream = None;
            dev.arena = None;
            return Err(e);
        }

        debug!(
            "emulator session up: sku={} engines={} l1={} l2={}",
            dev.sku, dev.num_engines, dev.l1_size, dev.l2_size
        );
        Ok(dev)
    }

    /// Socket path this device is connected to.
    pub fn socket_path(&self) -> std::path::Display<'_> {
        self.socket_path.display()
    }

    fn handshake(&mut self) -> Result<()> {
        let (shm_name, shm_size) = {
            let arena = self.arena.as_ref().expect("arena exists during handshake");
            (arena.name().to_owned(), arena.size() as u64)
        };

        let req = HelloRequest {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            shm_name,
            shm_size,
        };
        let mut payload = BytesMut::with_capacity(HelloRequest::WIRE_SIZE);
        req.encode(&mut payload)?;

        let rsp = HelloResponse::decode(&self.transact(Cmd::Hello, &payload)?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("HELLO", rsp.status));
        }

        self.sku = Sku::from_wire(rsp.sku).unwrap_or(Sku::Emulator);
        self.num_engines = rsp.num_engines;
        self.l1_size = rsp.l1_size as usize;
        self.l2_size = rsp.l2_size as usize;
        Ok(())
    }

    /// Send one request and receive its response payload.
    ///
    /// Messages are transmitted whole (header then payload); a short
    /// read or write surfaces as a transport error and the caller must
    /// abandon the session.
    fn transact(&mut self, cmd: Cmd, payload: &[u8]) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| NpmError::transport("session is closed"))?;

        debug_assert_eq!(payload.len(), cmd.request_payload_size());

        let seq_id = self.seq_id;
        self.seq_id = self.seq_id.wrapping_add(1);

        let mut msg = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        Header::new(cmd, seq_id, payload.len() as u32).encode(&mut msg);
        msg.extend_from_slice(payload);

        stream
            .write_all(&msg)
            .map_err(|e| NpmError::transport(format!("send {} failed: {e}", cmd.name())))?;

        let mut hdr_bytes = [0u8; HEADER_SIZE];
        stream
            .read_exact(&mut hdr_bytes)
            .map_err(|e| NpmError::transport(format!("recv {} header failed: {e}", cmd.name())))?;
        let hdr = Header::decode(&hdr_bytes)?;
        hdr.validate()?;

        let expected = cmd.response_payload_size();
        if hdr.payload_size as usize != expected {
            return Err(npm_protocol::WireError::PayloadSize {
                cmd,
                got: hdr.payload_size as usize,
                expected,
            }
            .into());
        }

        let mut rsp = vec![0u8; expected];
        stream
            .read_exact(&mut rsp)
            .map_err(|e| NpmError::transport(format!("recv {} payload failed: {e}", cmd.name())))?;
        Ok(rsp)
    }
}

impl NpmDevice for EmulatorDevice {
    fn init(_device_id: u32) -> Result<Self> {
        let socket_path =
            std::env::var(SOCKET_ENV).unwrap_or_else(|_| DEFAULT_SOCKET.to_owned());
        Self::connect(socket_path)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.stream.is_some() {
            match self.transact(Cmd::Goodbye, &[]) {
                Ok(payload) => {
                    let _ = StatusResponse::decode(&payload);
                }
                Err(e) => debug!("GOODBYE failed during shutdown: {e}"),
            }
            self.stream = None;
        }
        self.buffers.clear();
        // dropping the arena unmaps and unlinks the named region
        self.arena = None;
        Ok(())
    }

    fn sku(&self) -> Sku {
        self.sku
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

        let shm_offset = {
            let arena = self
                .arena
                .as_mut()
                .ok_or_else(|| NpmError::transport("session is closed"))?;
            let shm_offset = arena.alloc(size, SHM_ALIGN)?;
            let dst = arena.bytes_mut(shm_offset, size)?;
            // SAFETY: the registration contract guarantees `ptr` points
            // to `size` readable bytes; `dst` is a fresh arena span.
            unsafe { std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), size) };
            shm_offset
        };

        let req = RegisterBufferRequest {
            shm_offset: shm_offset as u64,
            size: size as u64,
            flags: 0,
        };
        let mut payload = BytesMut::with_capacity(RegisterBufferRequest::WIRE_SIZE);
        req.encode(&mut payload);

        let rsp = RegisterBufferResponse::decode(&self.transact(Cmd::RegisterBuffer, &payload)?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("REGISTER_BUFFER", rsp.status));
        }
        let handle = BufferHandle::new(rsp.handle);
        if !handle.is_valid() {
            return Err(NpmError::transport("device issued the invalid handle 0"));
        }

        self.buffers.insert(
            handle.raw(),
            RemoteBuffer {
                host_ptr: ptr,
                shm_offset,
                size,
            },
        );
        Ok(handle)
    }

    fn unregister_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        // the arena slot is not reclaimed (bump allocator); it dies with
        // the session
        self.buffers.remove(&handle.raw());

        let req = UnregisterBufferRequest {
            handle: handle.raw(),
        };
        let mut payload = BytesMut::with_capacity(UnregisterBufferRequest::WIRE_SIZE);
        req.encode(&mut payload);
        let rsp = StatusResponse::decode(&self.transact(Cmd::UnregisterBuffer, &payload)?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("UNREGISTER_BUFFER", rsp.status));
        }
        Ok(())
    }

    unsafe fn update_buffer(
        &mut self,
        handle: BufferHandle,
        ptr: *mut u8,
        size: usize,
    ) -> Result<()> {
        let (shm_offset, registered) = {
            let buf = self
                .buffers
                .get(&handle.raw())
                .ok_or(NpmError::InvalidHandle {
                    handle: handle.raw(),
                })?;
            (buf.shm_offset, buf.size)
        };
        if size > registered {
            return Err(NpmError::invalid_params(format!(
                "update of {size} bytes exceeds registered size {registered}"
            )));
        }

        let arena = self
            .arena
            .as_mut()
            .ok_or_else(|| NpmError::transport("session is closed"))?;
        let dst = arena.bytes_mut(shm_offset, size)?;
        // SAFETY: the update contract guarantees `ptr` points to `size`
        // readable bytes for the duration of this call.
        unsafe { std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), size) };
        // no message: the server reads the refreshed bytes directly on
        // the next dispatch
        Ok(())
    }

    fn matmul(&mut self, params: &MatMulParams) -> Result<MatMulStats> {
        params.validate()?;

        let req = MatMulRequest {
            a_handle: params.a_handle.raw(),
            a_offset: params.a_offset as u64,
            b_handle: params.b_handle.raw(),
            b_offset: params.b_offset as u64,
            c_handle: params.c_handle.raw(),
            c_offset: params.c_offset as u64,
            m: params.m,
            n: params.n,
            k: params.k,
            lda: params.lda,
            ldb: params.ldb,
            ldc: params.ldc,
            type_a: params.type_a.wire(),
            type_b: params.type_b.wire(),
            type_c: params.type_c.wire(),
            flags: 0,
        };
        let mut payload = BytesMut::with_capacity(MatMulRequest::WIRE_SIZE);
        req.encode(&mut payload);

        let rsp = MatMulResponse::decode(&self.transact(Cmd::MatMul, &payload)?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("MATMUL", rsp.status));
        }

        // Sync the output back into the caller's buffer: the host
        // pipeline reads results from the pointer it registered.
        if let Some(buf) = self.buffers.get(&params.c_handle.raw()).copied() {
            let arena = self
                .arena
                .as_ref()
                .ok_or_else(|| NpmError::transport("session is closed"))?;
            let src = arena.bytes(buf.shm_offset, buf.size)?;
            // SAFETY: `host_ptr` was registered with `buf.size` writable
            // bytes and is alive per the registration contract.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), buf.host_ptr, buf.size) };
        }

        Ok(MatMulStats {
            cycles: rsp.cycles,
            dma_bytes: rsp.dma_bytes,
        })
    }

    fn sync(&mut self) -> Result<()> {
        let rsp = StatusResponse::decode(&self.transact(Cmd::Sync, &[])?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("SYNC", rsp.status));
        }
        Ok(())
    }

    fn fence_create(&mut self) -> Result<FenceId> {
        let rsp = FenceCreateResponse::decode(&self.transact(Cmd::FenceCreate, &[])?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("FENCE_CREATE", rsp.status));
        }
        Ok(FenceId::new(rsp.fence_id))
    }

    fn fence_destroy(&mut self, fence: FenceId) -> Result<()> {
        let req = FenceDestroyRequest {
            fence_id: fence.raw(),
        };
        let mut payload = BytesMut::with_capacity(FenceDestroyRequest::WIRE_SIZE);
        req.encode(&mut payload);
        let rsp = StatusResponse::decode(&self.transact(Cmd::FenceDestroy, &payload)?)?;
        if !rsp.status.is_ok() {
            return Err(NpmError::from_status("FENCE_DESTROY", rsp.status));
        }
        Ok(())
    }

    fn fence_wait(&mut self, fence: FenceId, timeout_ns: u64) -> Result<()> {
        let req = FenceWaitRequest {
            fence_id: fence.raw(),
            timeout_ns,
        };
        let mut payload = BytesMut::with_capacity(FenceWaitRequest::WIRE_SIZE);
        req.encode(&mut payload);
        let rsp = StatusResponse::decode(&self.transact(Cmd::FenceWait, &payload)?)?;
        match rsp.status {
            Status::Ok => Ok(()),
            Status::Timeout => Err(NpmError::Timeout { timeout_ns }),
            other => Err(NpmError::from_status("FENCE_WAIT", other)),
        }
    }
}

impl Drop for EmulatorDevice {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
