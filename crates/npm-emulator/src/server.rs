//! Emulator server: accept loop, command dispatch, matmul execution.
//!
//! One client at a time. The session lives from accept to GOODBYE (or
//! disconnect); its state — the attached arena, the handle table, the
//! fence counter — dies with it, so a fresh session starts from handle 1.
//!
//! Matmul runs in one of two modes. With tiling disabled it is the
//! canonical triple loop over the shared-memory operands. With tiling
//! enabled the output is iterated in square tiles sized to fit three
//! FP32 tiles in L1; every tile step stages its A and B tiles through
//! the L2/L1 cache model and charges the DMA model for the misses. The
//! arithmetic still reads the original arena bytes in both modes — the
//! tiers are an accounting device, and outputs are identical to the
//! naive path because the (m, n, k) accumulation order is identical.

use crate::config::EmuConfig;
use crate::dma::{DmaDirection, DmaModel};
use crate::memory::MemoryHierarchy;
use crate::trace::{category, OpEvent, TraceCtx, STATUS_REQUEST};
use bytes::BytesMut;
use npm_device::{NpmError, Result, ShmArena};
use npm_protocol::{
    Cmd, FenceCreateResponse, FenceDestroyRequest, FenceWaitRequest, Header, HelloRequest,
    HelloResponse, MatMulRequest, MatMulResponse, PingRequest, PingResponse,
    RegisterBufferRequest, RegisterBufferResponse, Status, StatusResponse,
    UnregisterBufferRequest, WireError, HEADER_SIZE, VERSION_MAJOR, VERSION_MINOR,
};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on a single payload; anything larger is a protocol
/// violation and tears the session down.
const MAX_PAYLOAD: usize = 64 * 1024;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
struct ServerBuffer {
    shm_offset: u64,
    size: u64,
    #[allow(dead_code)] // advisory placement hint, recorded but not acted on
    flags: u32,
}

/// Per-client session state.
struct Session {
    stream: UnixStream,
    arena: Option<ShmArena>,
    buffers: HashMap<u64, ServerBuffer>,
    next_handle: u64,
    next_fence_id: u64,
    total_matmul_ops: u64,
}

impl Session {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            arena: None,
            buffers: HashMap::new(),
            next_handle: 1,
            next_fence_id: 1,
            total_matmul_ops: 0,
        }
    }
}

/// Pick a square tile dimension T such that three FP32 tiles (A, B and
/// the C accumulator) fit in L1: the largest power of two with
/// `T <= sqrt(l1 / (3 * 4))`, floored at 32.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn tile_dim(l1_size: usize) -> usize {
    let elements = l1_size / std::mem::size_of::<f32>();
    let tile_elements = elements / 3;
    let t = (tile_elements as f64).sqrt() as usize;
    let t = t.max(32);
    let mut pot = 1;
    while pot * 2 <= t {
        pot *= 2;
    }
    pot
}

fn send_response(
    stream: &mut UnixStream,
    cmd: Cmd,
    seq_id: u32,
    encode: impl FnOnce(&mut BytesMut),
) -> Result<()> {
    let payload_size = cmd.response_payload_size();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_size);
    Header::new(cmd, seq_id, payload_size as u32).encode(&mut buf);
    encode(&mut buf);
    debug_assert_eq!(buf.len(), HEADER_SIZE + payload_size);
    stream
        .write_all(&buf)
        .map_err(|e| NpmError::transport(format!("send {} response: {e}", cmd.name())))
}

/// The NPM emulator server.
pub struct EmulatorServer {
    config: EmuConfig,
    listener: UnixListener,
    trace: TraceCtx,
    shutdown: Arc<AtomicBool>,
    num_engines: u32,
    l1_size: usize,
    l2_size: usize,
    memory: MemoryHierarchy,
    dma: DmaModel,
}

impl std::fmt::Debug for EmulatorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorServer")
            .field("sku", &self.config.sku)
            .field("socket", &self.config.socket_path)
            .field("tiling", &self.config.tiling)
            .field("timing", &self.config.timing)
            .finish_non_exhaustive()
    }
}

impl EmulatorServer {
    /// Bind the listen socket and build the device model.
    ///
    /// Any stale socket file is removed before binding. The L2 size is
    /// clamped to the SKU's configurable range.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the trace sink
    /// cannot be opened.
    pub fn bind(config: EmuConfig) -> Result<Self> {
        let sku_cfg = config.sku.config();
        let num_engines = sku_cfg.num_engines;
        let l1_size = sku_cfg.l1_size;
        let l2_size = sku_cfg.clamp_l2(config.l2_size);

        match std::fs::remove_file(&config.socket_path) {
            Ok(()) => debug!("removed stale socket {}", config.socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&config.socket_path)?;
        listener.set_nonblocking(true)?;

        let trace = TraceCtx::new(config.trace_categories, config.trace_file.as_deref(), true)?;

        let memory = MemoryHierarchy::new(num_engines as usize, l1_size, l2_size);
        let dma = DmaModel::new(config.dma);

        Ok(Self {
            config,
            listener,
            trace,
            shutdown: Arc::new(AtomicBool::new(false)),
            num_engines,
            l1_size,
            l2_size,
            memory,
            dma,
        })
    }

    /// The shutdown flag, for registration with a signal handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Request shutdown; honored between messages and between clients.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// The socket path this server listens on.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    fn banner(&self) {
        let cfg = self.config.sku.config();
        info!("NPM hardware emulator v{VERSION_MAJOR}.{VERSION_MINOR}");
        info!(
            "  sku={} engines={} l1={} KiB/engine l2={} MiB shared",
            self.config.sku,
            self.num_engines,
            self.l1_size / 1024,
            self.l2_size / (1024 * 1024),
        );
        if cfg.int4_macs > 0 {
            info!(
                "  macs/cycle int4={} int8={} fp16={}",
                cfg.int4_macs, cfg.int8_macs, cfg.fp16_macs
            );
        }
        info!(
            "  socket={} tiling={} timing={} verbose={}",
            self.config.socket_path.display(),
            self.config.tiling,
            self.config.timing,
            self.config.verbose,
        );
    }

    /// Serve clients until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable listener failures;
    /// per-session failures are logged and the server returns to
    /// accepting.
    pub fn run(&mut self) -> Result<()> {
        self.banner();

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    info!("client connected");
                    // the accepted stream does not inherit the
                    // listener's non-blocking mode, but be explicit
                    stream.set_nonblocking(false)?;
                    let ops = self.serve_client(stream);
                    info!("client disconnected (matmul ops: {ops})");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("accept failed: {e}");
                    return Err(e.into());
                }
            }
        }

        self.trace.flush();
        info!("shutdown requested, exiting");
        Ok(())
    }

    /// Run the request loop for one client. Returns the session's
    /// matmul count.
    fn serve_client(&mut self, stream: UnixStream) -> u64 {
        let mut session = Session::new(stream);

        while !self.shutdown.load(Ordering::SeqCst) {
            let mut hdr_bytes = [0u8; HEADER_SIZE];
            if let Err(e) = session.stream.read_exact(&mut hdr_bytes) {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!("header read failed: {e}");
                }
                break;
            }
            let hdr = match Header::decode(&hdr_bytes) {
                Ok(hdr) => hdr,
                Err(e) => {
                    error!("{e}");
                    break;
                }
            };

            let payload_size = hdr.payload_size as usize;
            if payload_size > MAX_PAYLOAD {
                error!("oversize payload ({payload_size} bytes), closing session");
                break;
            }
            let mut payload = vec![0u8; payload_size];
            if let Err(e) = session.stream.read_exact(&mut payload) {
                debug!("payload read failed: {e}");
                break;
            }

            match hdr.validate() {
                Ok(()) => {}
                Err(WireError::VersionMismatch { peer, ours }) => {
                    warn!("client speaks protocol v{peer}, ours is v{ours}");
                    if hdr.cmd == Cmd::Hello as u8 {
                        let _ = self.respond_version_mismatch(&mut session, &hdr);
                    }
                    break;
                }
                Err(e) => {
                    error!("invalid message header: {e}");
                    break;
                }
            }

            let cmd = match hdr.request_cmd() {
                Ok(cmd) => cmd,
                Err(WireError::UnknownCmd(byte)) => {
                    warn!("unknown command {byte:#04x}, ignoring");
                    continue;
                }
                Err(e) => {
                    error!("{e}");
                    break;
                }
            };

            let result = match cmd {
                Cmd::Hello => self.handle_hello(&mut session, &hdr, &payload),
                Cmd::Goodbye => self.handle_goodbye(&mut session, &hdr),
                Cmd::Ping => self.handle_ping(&mut session, &hdr, &payload),
                Cmd::RegisterBuffer => self.handle_register(&mut session, &hdr, &payload),
                Cmd::UnregisterBuffer => self.handle_unregister(&mut session, &hdr, &payload),
                Cmd::MatMul => self.handle_matmul(&mut session, &hdr, &payload),
                Cmd::Sync => self.handle_sync(&mut session, &hdr),
                Cmd::FenceCreate => self.handle_fence_create(&mut session, &hdr),
                Cmd::FenceDestroy => self.handle_fence_destroy(&mut session, &hdr, &payload),
                Cmd::FenceWait => self.handle_fence_wait(&mut session, &hdr, &payload),
            };
            if let Err(e) = result {
                error!("{} failed: {e}", cmd.name());
                break;
            }
            if cmd == Cmd::Goodbye {
                break;
            }
        }

        self.trace.flush();
        session.total_matmul_ops
    }

    fn respond_version_mismatch(&self, session: &mut Session, hdr: &Header) -> Result<()> {
        let rsp = HelloResponse {
            status: Status::VersionMismatch,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            sku: self.config.sku.wire(),
            num_engines: self.num_engines,
            l1_size: self.l1_size as u64,
            l2_size: self.l2_size as u64,
        };
        send_response(&mut session.stream, Cmd::Hello, hdr.seq_id, |buf| rsp.encode(buf))
    }

    fn handle_hello(&mut self, session: &mut Session, hdr: &Header, payload: &[u8]) -> Result<()> {
        let req = HelloRequest::decode(payload)?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({
                "version": format!("{}.{}", req.version_major, req.version_minor),
                "shm_name": req.shm_name,
                "shm_size": req.shm_size,
            });
            self.trace
                .command(Cmd::Hello, hdr.seq_id, STATUS_REQUEST, Some(&details));
        }
        if self.config.verbose {
            info!(
                "HELLO from client v{}.{}, shm={} size={}",
                req.version_major, req.version_minor, req.shm_name, req.shm_size
            );
        }

        let status = match ShmArena::attach(&req.shm_name, req.shm_size as usize) {
            Ok(arena) => {
                session.arena = Some(arena);
                Status::Ok
            }
            Err(e) => {
                error!("cannot attach client arena {}: {e}", req.shm_name);
                Status::Error
            }
        };

        let rsp = HelloResponse {
            status,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            sku: self.config.sku.wire(),
            num_engines: self.num_engines,
            l1_size: self.l1_size as u64,
            l2_size: self.l2_size as u64,
        };
        send_response(&mut session.stream, Cmd::Hello, hdr.seq_id, |buf| rsp.encode(buf))?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({
                "sku": self.config.sku.name(),
                "engines": self.num_engines,
                "l1_size": self.l1_size,
                "l2_size": self.l2_size,
            });
            self.trace
                .command(Cmd::Hello, hdr.seq_id, status as u8, Some(&details));
        }
        Ok(())
    }

    fn handle_goodbye(&mut self, session: &mut Session, hdr: &Header) -> Result<()> {
        self.trace
            .command(Cmd::Goodbye, hdr.seq_id, STATUS_REQUEST, None);
        if self.config.verbose {
            info!("GOODBYE from client");
        }

        // detach the arena (the client owns and unlinks it) and forget
        // every handle
        session.arena = None;
        session.buffers.clear();

        send_response(&mut session.stream, Cmd::Goodbye, hdr.seq_id, |buf| {
            StatusResponse::OK.encode(buf);
        })?;
        self.trace
            .command(Cmd::Goodbye, hdr.seq_id, Status::Ok as u8, None);
        Ok(())
    }

    fn handle_ping(&mut self, session: &mut Session, hdr: &Header, payload: &[u8]) -> Result<()> {
        let req = PingRequest::decode(payload)?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({
                "echo": format!("{:#018x}", req.echo),
                "timestamp": req.client_ts,
            });
            self.trace
                .command(Cmd::Ping, hdr.seq_id, STATUS_REQUEST, Some(&details));
        }

        #[allow(clippy::cast_possible_truncation)]
        let server_ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);

        let rsp = PingResponse {
            status: Status::Ok,
            client_ts: req.client_ts,
            server_ts,
            echo: req.echo,
        };
        send_response(&mut session.stream, Cmd::Ping, hdr.seq_id, |buf| rsp.encode(buf))?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({
                "client_timestamp": rsp.client_ts,
                "server_timestamp": rsp.server_ts,
                "echo": format!("{:#018x}", rsp.echo),
            });
            self.trace
                .command(Cmd::Ping, hdr.seq_id, Status::Ok as u8, Some(&details));
        }
        Ok(())
    }

    fn handle_register(
        &mut self,
        session: &mut Session,
        hdr: &Header,
        payload: &[u8],
    ) -> Result<()> {
        let req = RegisterBufferRequest::decode(payload)?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({
                "shm_offset": req.shm_offset,
                "size": req.size,
                "flags": format!("{:#x}", req.flags),
            });
            self.trace
                .command(Cmd::RegisterBuffer, hdr.seq_id, STATUS_REQUEST, Some(&details));
        }

        let arena_size = session.arena.as_ref().map(ShmArena::size).unwrap_or(0) as u64;
        let in_bounds = req.size > 0 && req.shm_offset.checked_add(req.size).is_some_and(|end| end <= arena_size);

        let (status, handle) = if session.arena.is_none() {
            (Status::Error, 0)
        } else if in_bounds {
            let handle = session.next_handle;
            session.next_handle += 1;
            session.buffers.insert(
                handle,
                ServerBuffer {
                    shm_offset: req.shm_offset,
                    size: req.size,
                    flags: req.flags,
                },
            );
            if self.config.verbose {
                info!(
                    "REGISTER_BUFFER offset={} size={} -> handle={handle}",
                    req.shm_offset, req.size
                );
            }
            (Status::Ok, handle)
        } else {
            (Status::InvalidParams, 0)
        };

        let rsp = RegisterBufferResponse { status, handle };
        send_response(&mut session.stream, Cmd::RegisterBuffer, hdr.seq_id, |buf| {
            rsp.encode(buf);
        })?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({ "handle": handle });
            self.trace
                .command(Cmd::RegisterBuffer, hdr.seq_id, status as u8, Some(&details));
        }
        Ok(())
    }

    fn handle_unregister(
        &mut self,
        session: &mut Session,
        hdr: &Header,
        payload: &[u8],
    ) -> Result<()> {
        let req = UnregisterBufferRequest::decode(payload)?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({ "handle": req.handle });
            self.trace.command(
                Cmd::UnregisterBuffer,
                hdr.seq_id,
                STATUS_REQUEST,
                Some(&details),
            );
        }

        // silent no-op on an unknown handle
        session.buffers.remove(&req.handle);
        if self.config.verbose {
            info!("UNREGISTER_BUFFER handle={}", req.handle);
        }

        send_response(&mut session.stream, Cmd::UnregisterBuffer, hdr.seq_id, |buf| {
            StatusResponse::OK.encode(buf);
        })?;
        self.trace
            .command(Cmd::UnregisterBuffer, hdr.seq_id, Status::Ok as u8, None);
        Ok(())
    }

    fn handle_sync(&mut self, session: &mut Session, hdr: &Header) -> Result<()> {
        self.trace.command(Cmd::Sync, hdr.seq_id, STATUS_REQUEST, None);
        send_response(&mut session.stream, Cmd::Sync, hdr.seq_id, |buf| {
            StatusResponse::OK.encode(buf);
        })?;
        self.trace.command(Cmd::Sync, hdr.seq_id, Status::Ok as u8, None);
        Ok(())
    }

    fn handle_fence_create(&mut self, session: &mut Session, hdr: &Header) -> Result<()> {
        self.trace
            .command(Cmd::FenceCreate, hdr.seq_id, STATUS_REQUEST, None);

        let fence_id = session.next_fence_id;
        session.next_fence_id += 1;

        let rsp = FenceCreateResponse {
            status: Status::Ok,
            fence_id,
        };
        send_response(&mut session.stream, Cmd::FenceCreate, hdr.seq_id, |buf| {
            rsp.encode(buf);
        })?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({ "fence_id": fence_id });
            self.trace
                .command(Cmd::FenceCreate, hdr.seq_id, Status::Ok as u8, Some(&details));
        }
        Ok(())
    }

    fn handle_fence_destroy(
        &mut self,
        session: &mut Session,
        hdr: &Header,
        payload: &[u8],
    ) -> Result<()> {
        let req = FenceDestroyRequest::decode(payload)?;
        if self.trace.enabled(category::COMMANDS) {
            let details = json!({ "fence_id": req.fence_id });
            self.trace
                .command(Cmd::FenceDestroy, hdr.seq_id, STATUS_REQUEST, Some(&details));
        }
        send_response(&mut session.stream, Cmd::FenceDestroy, hdr.seq_id, |buf| {
            StatusResponse::OK.encode(buf);
        })?;
        self.trace
            .command(Cmd::FenceDestroy, hdr.seq_id, Status::Ok as u8, None);
        Ok(())
    }

    fn handle_fence_wait(
        &mut self,
        session: &mut Session,
        hdr: &Header,
        payload: &[u8],
    ) -> Result<()> {
        let req = FenceWaitRequest::decode(payload)?;
        if self.trace.enabled(category::COMMANDS) {
            let details = json!({ "fence_id": req.fence_id, "timeout_ns": req.timeout_ns });
            self.trace
                .command(Cmd::FenceWait, hdr.seq_id, STATUS_REQUEST, Some(&details));
        }
        // synchronous execution: every prior operation already completed
        send_response(&mut session.stream, Cmd::FenceWait, hdr.seq_id, |buf| {
            StatusResponse::OK.encode(buf);
        })?;
        self.trace
            .command(Cmd::FenceWait, hdr.seq_id, Status::Ok as u8, None);
        Ok(())
    }

    fn handle_matmul(&mut self, session: &mut Session, hdr: &Header, payload: &[u8]) -> Result<()> {
        let req = MatMulRequest::decode(payload)?;

        if self.trace.enabled(category::COMMANDS) {
            let size_of = |h: u64| session.buffers.get(&h).map_or(0, |b| b.size);
            let details = json!({
                "M": req.m, "N": req.n, "K": req.k,
                "a_handle": req.a_handle,
                "b_handle": req.b_handle,
                "c_handle": req.c_handle,
                "a_size": size_of(req.a_handle),
                "b_size": size_of(req.b_handle),
                "c_size": size_of(req.c_handle),
                "destination": "NPM",
            });
            self.trace
                .command(Cmd::MatMul, hdr.seq_id, STATUS_REQUEST, Some(&details));
        }
        if self.config.verbose {
            info!(
                "MATMUL M={} N={} K={} (tiling={}, timing={})",
                req.m, req.n, req.k, self.config.tiling, self.config.timing
            );
        }

        let tile = if self.config.tiling {
            tile_dim(self.l1_size)
        } else {
            0
        };

        if self.trace.enabled(category::OPS) {
            let details = json!({
                "tiling": self.config.tiling,
                "timing": self.config.timing,
                "tile_size": tile,
                "l1_size": self.l1_size,
                "l2_size": self.l2_size,
            });
            self.trace
                .op(OpEvent::MatmulStart, req.m, req.n, req.k, 0, Some(&details));
        }

        let (status, cycles, dma_bytes) = match self.exec_matmul(session, &req, tile) {
            Ok((cycles, dma_bytes)) => {
                session.total_matmul_ops += 1;
                (Status::Ok, cycles, dma_bytes)
            }
            Err(status) => (status, 0, 0),
        };

        let rsp = MatMulResponse {
            status,
            cycles,
            dma_bytes,
        };
        send_response(&mut session.stream, Cmd::MatMul, hdr.seq_id, |buf| rsp.encode(buf))?;

        if self.trace.enabled(category::COMMANDS) {
            let details = json!({ "cycles": cycles, "dma_bytes": dma_bytes });
            self.trace
                .command(Cmd::MatMul, hdr.seq_id, status as u8, Some(&details));
        }
        Ok(())
    }

    /// Execute a matmul, returning `(cycles, dma_bytes)` or the wire
    /// status describing the rejection.
    #[allow(clippy::cast_sign_loss, clippy::too_many_lines)]
    fn exec_matmul(
        &mut self,
        session: &mut Session,
        req: &MatMulRequest,
        tile: usize,
    ) -> std::result::Result<(u64, u64), Status> {
        let (m, n, k) = (req.m, req.n, req.k);
        let (lda, ldb, ldc) = (req.lda, req.ldb, req.ldc);

        if m <= 0 || n <= 0 || k <= 0 || lda < k || ldb < k || ldc < n {
            return Err(Status::InvalidParams);
        }
        if req.type_a != 0 || req.type_b != 0 || req.type_c != 0 {
            // only FP32 operands are executable
            return Err(Status::InvalidParams);
        }

        let arena = session.arena.as_ref().ok_or(Status::InvalidHandle)?;

        let resolve = |handle: u64, offset: u64| -> std::result::Result<(usize, usize), Status> {
            let buf = session.buffers.get(&handle).ok_or(Status::InvalidHandle)?;
            if offset >= buf.size {
                return Err(Status::InvalidHandle);
            }
            Ok(((buf.shm_offset + offset) as usize, (buf.size - offset) as usize))
        };
        let (a_off, a_avail) = resolve(req.a_handle, req.a_offset)?;
        let (b_off, b_avail) = resolve(req.b_handle, req.b_offset)?;
        let (c_off, c_avail) = resolve(req.c_handle, req.c_offset)?;

        let span = |rows: i64, cols: i64, ld: i64| ((rows - 1) * ld + cols) as usize * 4;
        if span(m, k, lda) > a_avail || span(n, k, ldb) > b_avail || span(m, n, ldc) > c_avail {
            return Err(Status::InvalidParams);
        }

        let view = |off: usize| -> std::result::Result<*mut u8, Status> {
            let ptr = arena.ptr_at(off).map_err(|_| Status::InvalidHandle)?.as_ptr();
            if ptr as usize % std::mem::align_of::<f32>() != 0 {
                return Err(Status::InvalidParams);
            }
            Ok(ptr)
        };
        let a_ptr = view(a_off)?;
        let b_ptr = view(b_off)?;
        let c_ptr = view(c_off)?;

        // SAFETY: each span was bounds-checked against its registered
        // buffer and the arena mapping outlives this call. Registered
        // buffers occupy disjoint arena spans (the client's bump
        // allocator never overlaps them), so the mutable C view cannot
        // alias the A/B views; an overlapping registration would be a
        // client contract violation.
        let a = unsafe { std::slice::from_raw_parts(a_ptr.cast::<f32>(), a_avail / 4) };
        let b = unsafe { std::slice::from_raw_parts(b_ptr.cast::<f32>(), b_avail / 4) };
        let c = unsafe { std::slice::from_raw_parts_mut(c_ptr.cast::<f32>(), c_avail / 4) };

        if tile == 0 {
            // naive path: canonical triple loop in FP32
            for mi in 0..m {
                for ni in 0..n {
                    let mut sum = 0.0f32;
                    for ki in 0..k {
                        sum += a[(mi * lda + ki) as usize] * b[(ni * ldb + ki) as usize];
                    }
                    c[(mi * ldc + ni) as usize] = sum;
                }
            }
            return Ok((0, 0));
        }

        // byte views of the operand windows, for cache staging
        let a_bytes = unsafe { std::slice::from_raw_parts(a_ptr.cast_const(), a_avail) };
        let b_bytes = unsafe { std::slice::from_raw_parts(b_ptr.cast_const(), b_avail) };

        let sku_cfg = self.config.sku.config();
        let macs_per_cycle = match sku_cfg.fp32_macs() {
            0 => 2000,
            macs => macs,
        };

        self.dma.reset_stats();
        self.memory.reset();

        let t = tile as i64;
        if self.trace.enabled(category::OPS) {
            let tiles = |dim: i64| (dim + t - 1) / t;
            let details = json!({
                "tile_size": tile,
                "num_m_tiles": tiles(m),
                "num_n_tiles": tiles(n),
                "num_k_tiles": tiles(k),
                "total_tiles": tiles(m) * tiles(n),
                "a_total_bytes": m * k * 4,
                "b_total_bytes": n * k * 4,
                "c_total_bytes": m * n * 4,
            });
            self.trace
                .op(OpEvent::TilingPlan, m, n, k, 0, Some(&details));
        }

        let mut m_tile = 0;
        while m_tile < m {
            let am = t.min(m - m_tile);
            let mut n_tile = 0;
            while n_tile < n {
                let an = t.min(n - n_tile);

                // zero-init the output tile before K accumulation;
                // memory outside the dispatched tiles is never touched
                for mi in 0..am {
                    for ni in 0..an {
                        c[((m_tile + mi) * ldc + n_tile + ni) as usize] = 0.0;
                    }
                }

                let mut k_tile = 0;
                while k_tile < k {
                    let ak = t.min(k - k_tile);

                    let a_tile_offset = ((m_tile * lda + k_tile) * 4) as usize;
                    let a_tile_bytes = (am * ak * 4) as usize;
                    let b_tile_offset = ((n_tile * ldb + k_tile) * 4) as usize;
                    let b_tile_bytes = (an * ak * 4) as usize;

                    let a_hit = !self
                        .stage_tile(req.a_handle, a_tile_offset, a_bytes, a_tile_bytes)?;
                    let b_hit = !self
                        .stage_tile(req.b_handle, b_tile_offset, b_bytes, b_tile_bytes)?;

                    // the FP32 accumulation reads the original arena
                    // bytes; the staged copies are accounting only
                    for mi in 0..am {
                        for ni in 0..an {
                            let mut sum = 0.0f32;
                            for ki in 0..ak {
                                sum += a[((m_tile + mi) * lda + k_tile + ki) as usize]
                                    * b[((n_tile + ni) * ldb + k_tile + ki) as usize];
                            }
                            c[((m_tile + mi) * ldc + n_tile + ni) as usize] += sum;
                        }
                    }

                    let mut compute_cycles = 0;
                    if self.config.timing {
                        let ops = (2 * am * an * ak) as u64;
                        compute_cycles = ops.div_ceil(macs_per_cycle);
                        self.dma.advance_cycles(compute_cycles);
                    }

                    if self.trace.enabled(category::OPS) {
                        let details = json!({
                            "m_off": m_tile, "n_off": n_tile, "k_off": k_tile,
                            "actual_m": am, "actual_n": an, "actual_k": ak,
                            "a_tile_bytes": a_tile_bytes,
                            "b_tile_bytes": b_tile_bytes,
                            "a_l2_hit": a_hit,
                            "b_l2_hit": b_hit,
                        });
                        self.trace
                            .op(OpEvent::MatmulTile, am, an, ak, compute_cycles, Some(&details));
                    }

                    k_tile += t;
                }

                // output tile writeback: L1 -> L2 -> DDR
                let c_tile_bytes = (am * an * 4) as usize;
                self.dma.transfer(DmaDirection::L1ToL2, c_tile_bytes);
                self.trace.dma(
                    DmaDirection::L1ToL2,
                    c_tile_bytes as u64,
                    self.dma.current_cycle(),
                    0,
                );
                self.dma.transfer(DmaDirection::L2ToDdr, c_tile_bytes);
                self.trace.dma(
                    DmaDirection::L2ToDdr,
                    c_tile_bytes as u64,
                    self.dma.current_cycle(),
                    -1,
                );

                n_tile += t;
            }
            m_tile += t;
        }

        let dma_bytes = self.dma.total_bytes();
        let cycles = if self.config.timing {
            self.dma.current_cycle()
        } else {
            0
        };

        if self.trace.enabled(category::OPS) {
            let details = json!({
                "l2_hits": self.memory.l2_hits(),
                "l2_misses": self.memory.l2_misses(),
                "total_dma_bytes": dma_bytes,
                "tile_size": tile,
            });
            self.trace
                .op(OpEvent::MatmulEnd, m, n, k, cycles, Some(&details));
        }
        if self.config.verbose {
            info!(
                "MATMUL tiled: {dma_bytes} bytes DMA, tile={tile}, L2 hits={}, misses={}, cycles={cycles}",
                self.memory.l2_hits(),
                self.memory.l2_misses(),
            );
        }

        Ok((cycles, dma_bytes))
    }

    /// Stage one input tile through L2 into engine 0's L1, charging the
    /// DMA lanes: DDR→L2 only on an L2 miss, L2→L1 always. Returns
    /// whether the L2 access missed.
    fn stage_tile(
        &mut self,
        handle: u64,
        tile_offset: usize,
        operand_bytes: &[u8],
        tile_bytes: usize,
    ) -> std::result::Result<bool, Status> {
        let src = operand_bytes
            .get(tile_offset..tile_offset + tile_bytes)
            .ok_or(Status::InvalidParams)?;

        let staged = self
            .memory
            .stage_to_l2(handle, tile_offset, src)
            .map_err(|_| Status::OutOfMemory)?;
        if staged.is_miss() {
            self.dma.transfer(DmaDirection::DdrToL2, tile_bytes);
            self.trace.dma(
                DmaDirection::DdrToL2,
                tile_bytes as u64,
                self.dma.current_cycle(),
                -1,
            );
        }

        self.memory
            .stage_to_l1(0, handle, tile_offset)
            .map_err(|_| Status::OutOfMemory)?;
        self.dma.transfer(DmaDirection::L2ToL1, tile_bytes);
        self.trace.dma(
            DmaDirection::L2ToL1,
            tile_bytes as u64,
            self.dma.current_cycle(),
            0,
        );

        Ok(staged.is_miss())
    }
}

impl Drop for EmulatorServer {
    fn drop(&mut self) {
        self.trace.flush();
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "cannot remove socket {}: {e}",
                    self.config.socket_path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_dim_fits_three_fp32_tiles_in_l1() {
        // 1 MiB L1: 262144 floats, a third each -> sqrt ~ 295 -> 256
        assert_eq!(tile_dim(1024 * 1024), 256);
        assert_eq!(tile_dim(4 * 1024 * 1024), 512);
        for l1 in [1024 * 1024, 2 * 1024 * 1024, 8 * 1024 * 1024] {
            let t = tile_dim(l1);
            assert!(t.is_power_of_two());
            assert!(3 * t * t * 4 <= l1, "3 tiles of {t}x{t} must fit in {l1}");
        }
    }

    #[test]
    fn tile_dim_floors_at_32() {
        assert_eq!(tile_dim(1024), 32);
        assert_eq!(tile_dim(0), 32);
    }
}
