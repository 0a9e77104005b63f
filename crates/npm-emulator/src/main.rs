//! `npm-emulator` — standalone NPM hardware emulator process.
//!
//! ```text
//! USAGE:
//!   npm-emulator [--sku NPM8K] [--l2-size MB] [--tiling] [--timing]
//!                [--socket PATH] [--config FILE]
//!                [--trace-commands] [--trace-dma] [--trace-ops]
//!                [--trace-file PATH] [--verbose]
//! ```
//!
//! Flags override values from `--config` (a `key=value` file), which
//! override the built-in NPM8K defaults.

use anyhow::Context;
use clap::Parser;
use npm_emulator::trace::category;
use npm_emulator::{EmuConfig, EmulatorServer};
use npm_protocol::Sku;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "npm-emulator", about = "NPM hardware emulator", version)]
struct Cli {
    /// Configuration file (key=value lines).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path to listen on.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Device SKU: NPM4K, NPM8K, NPM16K, NPM32K, NPM64K.
    #[arg(long)]
    sku: Option<Sku>,

    /// L2 cache size in MiB (default: SKU default).
    #[arg(long = "l2-size", value_name = "MB")]
    l2_size_mb: Option<usize>,

    /// Enable tiled matmul execution with cache/DMA accounting.
    #[arg(long)]
    tiling: bool,

    /// Enable cycle accounting (implies nothing without --tiling).
    #[arg(long)]
    timing: bool,

    /// Verbose per-command logging.
    #[arg(short, long)]
    verbose: bool,

    /// Trace IPC commands.
    #[arg(long)]
    trace_commands: bool,

    /// Trace DMA transfers.
    #[arg(long)]
    trace_dma: bool,

    /// Trace compute operations.
    #[arg(long)]
    trace_ops: bool,

    /// Trace output file (default: stdout).
    #[arg(long)]
    trace_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EmuConfig::load_file(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?,
        None => EmuConfig::default(),
    };

    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(sku) = cli.sku {
        config.sku = sku;
    }
    if let Some(mb) = cli.l2_size_mb {
        config.l2_size = mb * 1024 * 1024;
    }
    config.tiling |= cli.tiling;
    config.timing |= cli.timing;
    config.verbose |= cli.verbose;
    if cli.trace_commands {
        config.trace_categories |= category::COMMANDS;
    }
    if cli.trace_dma {
        config.trace_categories |= category::DMA;
    }
    if cli.trace_ops {
        config.trace_categories |= category::OPS;
    }
    if let Some(path) = cli.trace_file {
        config.trace_file = Some(path);
    }

    let mut server = EmulatorServer::bind(config).context("cannot start emulator server")?;

    let flag = server.shutdown_flag();
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())
        .context("cannot register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag)
        .context("cannot register SIGTERM handler")?;

    server.run()?;
    Ok(())
}
