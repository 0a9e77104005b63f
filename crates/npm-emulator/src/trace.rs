//! Structured JSON trace engine.
//!
//! One JSON object per line, category-filtered, timestamped relative to
//! context creation. Categories are a bitmask so call sites can guard
//! with [`TraceCtx::enabled`] before building event details — a
//! disabled category costs one branch, no formatting, no I/O.
//!
//! Event schema:
//!
//! ```text
//! {"ts":…,"cat":"cmd","type":"MATMUL","seq":42,"status":"OK","details":{…}}
//! {"ts":…,"cat":"dma","type":"DDR_TO_L2","bytes":4096,"cycles":64,"engine":-1}
//! {"ts":…,"cat":"op","type":"MATMUL_END","M":64,"N":128,"K":64,"cycles":8192,"details":{…}}
//! ```

use crate::dma::DmaDirection;
use npm_protocol::Cmd;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::warn;

/// Trace category bit flags.
pub mod category {
    /// No tracing.
    pub const NONE: u32 = 0;
    /// IPC command flow (requests and responses).
    pub const COMMANDS: u32 = 1 << 0;
    /// DMA transfers.
    pub const DMA: u32 = 1 << 1;
    /// Compute operations (matmul start/tile/end, tiling plan).
    pub const OPS: u32 = 1 << 2;
    /// Everything.
    pub const ALL: u32 = u32::MAX;
}

/// Status byte marking a command event as a request rather than a
/// response.
pub const STATUS_REQUEST: u8 = 0xFF;

/// Compute-operation event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpEvent {
    /// A matmul dispatch was accepted.
    MatmulStart,
    /// One tile step of a tiled matmul completed.
    MatmulTile,
    /// A matmul dispatch finished.
    MatmulEnd,
    /// Tiling strategy summary for a dispatch.
    TilingPlan,
}

impl OpEvent {
    /// Trace event name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MatmulStart => "MATMUL_START",
            Self::MatmulTile => "MATMUL_TILE",
            Self::MatmulEnd => "MATMUL_END",
            Self::TilingPlan => "TILING_PLAN",
        }
    }
}

fn status_str(status: u8) -> &'static str {
    if status == STATUS_REQUEST {
        return "REQ";
    }
    match status {
        0 => "OK",
        1 => "ERR_INVALID_CMD",
        2 => "ERR_INVALID_HANDLE",
        3 => "ERR_OUT_OF_MEMORY",
        4 => "ERR_TIMEOUT",
        5 => "ERR_INVALID_SIZE",
        _ => "ERR_UNKNOWN",
    }
}

#[derive(Serialize)]
struct CommandEvent<'a> {
    ts: u64,
    cat: &'static str,
    r#type: &'a str,
    seq: u32,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
}

#[derive(Serialize)]
struct DmaEvent {
    ts: u64,
    cat: &'static str,
    r#type: &'static str,
    bytes: u64,
    cycles: u64,
    engine: i32,
}

#[derive(Serialize)]
#[allow(non_snake_case)]
struct OpEventRecord<'a> {
    ts: u64,
    cat: &'static str,
    r#type: &'static str,
    M: i64,
    N: i64,
    K: i64,
    cycles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
}

/// Category-filtered JSON event sink.
pub struct TraceCtx {
    categories: u32,
    flush_immediate: bool,
    start: Instant,
    sink: RefCell<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for TraceCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCtx")
            .field("categories", &format_args!("{:#x}", self.categories))
            .field("flush_immediate", &self.flush_immediate)
            .finish_non_exhaustive()
    }
}

impl TraceCtx {
    /// Create a context writing to an arbitrary sink.
    pub fn with_sink(categories: u32, sink: Box<dyn Write + Send>, flush_immediate: bool) -> Self {
        Self {
            categories,
            flush_immediate,
            start: Instant::now(),
            sink: RefCell::new(sink),
        }
    }

    /// Create a context writing to `path`, or stdout when `path` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be created.
    pub fn new(
        categories: u32,
        path: Option<&Path>,
        flush_immediate: bool,
    ) -> std::io::Result<Self> {
        let sink: Box<dyn Write + Send> = match path {
            Some(p) => Box::new(std::fs::File::create(p)?),
            None => Box::new(std::io::stdout()),
        };
        Ok(Self::with_sink(categories, sink, flush_immediate))
    }

    /// O(1) category check. Call before building event details.
    #[inline]
    pub const fn enabled(&self, cat: u32) -> bool {
        self.categories & cat != 0
    }

    /// Emit a command event (request when `status` is
    /// [`STATUS_REQUEST`], response otherwise).
    pub fn command(&self, cmd: Cmd, seq: u32, status: u8, details: Option<&Value>) {
        if !self.enabled(category::COMMANDS) {
            return;
        }
        self.emit(&CommandEvent {
            ts: self.rel_ts(),
            cat: "cmd",
            r#type: cmd.name(),
            seq,
            status: status_str(status),
            details,
        });
    }

    /// Emit a DMA transfer event. `engine` is -1 for the system lane.
    pub fn dma(&self, dir: DmaDirection, bytes: u64, cycles: u64, engine: i32) {
        if !self.enabled(category::DMA) {
            return;
        }
        self.emit(&DmaEvent {
            ts: self.rel_ts(),
            cat: "dma",
            r#type: dir.name(),
            bytes,
            cycles,
            engine,
        });
    }

    /// Emit a compute-operation event.
    #[allow(clippy::many_single_char_names)]
    pub fn op(&self, event: OpEvent, m: i64, n: i64, k: i64, cycles: u64, details: Option<&Value>) {
        if !self.enabled(category::OPS) {
            return;
        }
        self.emit(&OpEventRecord {
            ts: self.rel_ts(),
            cat: "op",
            r#type: event.name(),
            M: m,
            N: n,
            K: k,
            cycles,
            details,
        });
    }

    /// Flush the sink.
    pub fn flush(&self) {
        if let Err(e) = self.sink.borrow_mut().flush() {
            warn!("trace flush failed: {e}");
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn rel_ts(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn emit<T: Serialize>(&self, event: &T) {
        let mut sink = self.sink.borrow_mut();
        let result = serde_json::to_writer(&mut *sink, event)
            .map_err(std::io::Error::from)
            .and_then(|()| sink.write_all(b"\n"));
        if let Err(e) = result {
            warn!("trace emit failed: {e}");
            return;
        }
        if self.flush_immediate {
            let _ = sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lines(buf: &SharedBuf) -> Vec<Value> {
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn disabled_category_produces_no_output() {
        let buf = SharedBuf::default();
        let ctx = TraceCtx::with_sink(category::COMMANDS, Box::new(buf.clone()), true);
        assert!(!ctx.enabled(category::DMA));
        ctx.dma(DmaDirection::DdrToL2, 4096, 64, -1);
        ctx.op(OpEvent::MatmulEnd, 8, 8, 8, 100, None);
        assert!(buf.0.lock().unwrap().is_empty());
    }

    #[test]
    fn command_events_carry_seq_and_status() {
        let buf = SharedBuf::default();
        let ctx = TraceCtx::with_sink(category::ALL, Box::new(buf.clone()), true);
        ctx.command(Cmd::MatMul, 42, STATUS_REQUEST, Some(&json!({"M": 2})));
        ctx.command(Cmd::MatMul, 42, 0, None);

        let events = lines(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["cat"], "cmd");
        assert_eq!(events[0]["type"], "MATMUL");
        assert_eq!(events[0]["seq"], 42);
        assert_eq!(events[0]["status"], "REQ");
        assert_eq!(events[0]["details"]["M"], 2);
        assert_eq!(events[1]["status"], "OK");
        assert!(events[1].get("details").is_none());
    }

    #[test]
    fn dma_events_mark_system_lane_with_engine_minus_one() {
        let buf = SharedBuf::default();
        let ctx = TraceCtx::with_sink(category::DMA, Box::new(buf.clone()), false);
        ctx.dma(DmaDirection::DdrToL2, 4096, 64, -1);
        ctx.dma(DmaDirection::L2ToL1, 128, 2, 0);

        let events = lines(&buf);
        assert_eq!(events[0]["type"], "DDR_TO_L2");
        assert_eq!(events[0]["engine"], -1);
        assert_eq!(events[1]["type"], "L2_TO_L1");
        assert_eq!(events[1]["engine"], 0);
    }

    #[test]
    fn op_events_carry_dimensions() {
        let buf = SharedBuf::default();
        let ctx = TraceCtx::with_sink(category::OPS, Box::new(buf.clone()), false);
        ctx.op(
            OpEvent::TilingPlan,
            256,
            512,
            256,
            0,
            Some(&json!({"tile_size": 128})),
        );

        let events = lines(&buf);
        assert_eq!(events[0]["type"], "TILING_PLAN");
        assert_eq!(events[0]["M"], 256);
        assert_eq!(events[0]["N"], 512);
        assert_eq!(events[0]["K"], 256);
        assert_eq!(events[0]["details"]["tile_size"], 128);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let buf = SharedBuf::default();
        let ctx = TraceCtx::with_sink(category::OPS, Box::new(buf.clone()), false);
        for _ in 0..10 {
            ctx.op(OpEvent::MatmulStart, 1, 1, 1, 0, None);
        }
        let ts: Vec<u64> = lines(&buf)
            .iter()
            .map(|e| e["ts"].as_u64().unwrap())
            .collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn status_strings_follow_the_closed_table() {
        assert_eq!(status_str(0xFF), "REQ");
        assert_eq!(status_str(0), "OK");
        assert_eq!(status_str(1), "ERR_INVALID_CMD");
        assert_eq!(status_str(2), "ERR_INVALID_HANDLE");
        assert_eq!(status_str(3), "ERR_OUT_OF_MEMORY");
        assert_eq!(status_str(4), "ERR_TIMEOUT");
        assert_eq!(status_str(5), "ERR_INVALID_SIZE");
        assert_eq!(status_str(99), "ERR_UNKNOWN");
    }
}
