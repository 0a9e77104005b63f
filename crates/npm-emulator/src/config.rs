//! Emulator configuration.
//!
//! Defaults match the NPM8K reference setup. A simple `key=value` file
//! (`#` starts a comment) can override any field; CLI flags are merged
//! on top by the binary. Unknown keys warn and are skipped so old
//! config files keep working across versions.

use crate::dma::DmaConfig;
use crate::trace::category;
use npm_protocol::{Sku, DEFAULT_SOCKET};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct EmuConfig {
    /// Device SKU to emulate.
    pub sku: Sku,
    /// L2 size in bytes; 0 selects the SKU default. Clamped to the
    /// SKU's [min, max] range at server startup.
    pub l2_size: usize,
    /// Tiled matmul execution with cache/DMA accounting.
    pub tiling: bool,
    /// Cycle accounting (requires tiling to take effect).
    pub timing: bool,
    /// Chatty per-command logging.
    pub verbose: bool,
    /// Unix socket path to listen on.
    pub socket_path: PathBuf,
    /// DMA bandwidths and clock.
    pub dma: DmaConfig,
    /// Trace category bitmask (see [`crate::trace::category`]).
    pub trace_categories: u32,
    /// Trace output file; `None` means stdout.
    pub trace_file: Option<PathBuf>,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            sku: Sku::Npm8k,
            l2_size: 0,
            tiling: false,
            timing: false,
            verbose: false,
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            dma: DmaConfig::default(),
            trace_categories: category::NONE,
            trace_file: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "yes" | "1" | "on")
}

impl EmuConfig {
    /// Load a config file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read. Malformed
    /// lines and unknown keys warn and are skipped.
    pub fn load_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::default();
        config.apply_str(&text);
        Ok(config)
    }

    /// Apply `key=value` lines over the current values.
    pub fn apply_str(&mut self, text: &str) {
        for (line_num, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("config line {}: missing '='", line_num + 1);
                continue;
            };
            self.apply_key(key.trim(), value.trim(), line_num + 1);
        }
    }

    fn apply_key(&mut self, key: &str, value: &str, line_num: usize) {
        match key {
            "sku" => match value.parse() {
                Ok(sku) => self.sku = sku,
                Err(e) => warn!("config line {line_num}: {e}"),
            },
            "l2_size_mb" => match value.parse::<usize>() {
                Ok(mb) => self.l2_size = mb * 1024 * 1024,
                Err(_) => warn!("config line {line_num}: bad l2_size_mb {value:?}"),
            },
            "tiling" => self.tiling = parse_bool(value),
            "timing" => self.timing = parse_bool(value),
            "verbose" => self.verbose = parse_bool(value),
            "socket" => self.socket_path = PathBuf::from(value),
            "dma_system_bw_gbps" => match value.parse() {
                Ok(bw) => self.dma.system_bw_gbps = bw,
                Err(_) => warn!("config line {line_num}: bad dma_system_bw_gbps {value:?}"),
            },
            "dma_l1_bw_gbps" => match value.parse() {
                Ok(bw) => self.dma.l1_bw_gbps = bw,
                Err(_) => warn!("config line {line_num}: bad dma_l1_bw_gbps {value:?}"),
            },
            "clock_freq_mhz" => match value.parse() {
                Ok(mhz) => self.dma.clock_mhz = mhz,
                Err(_) => warn!("config line {line_num}: bad clock_freq_mhz {value:?}"),
            },
            "trace_commands" => self.set_category(category::COMMANDS, parse_bool(value)),
            "trace_dma" => self.set_category(category::DMA, parse_bool(value)),
            "trace_ops" => self.set_category(category::OPS, parse_bool(value)),
            "trace_file" => {
                self.trace_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            other => warn!("config line {line_num}: unknown key {other:?}"),
        }
    }

    fn set_category(&mut self, bit: u32, enabled: bool) {
        if enabled {
            self.trace_categories |= bit;
        } else {
            self.trace_categories &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_setup() {
        let cfg = EmuConfig::default();
        assert_eq!(cfg.sku, Sku::Npm8k);
        assert_eq!(cfg.l2_size, 0);
        assert!(!cfg.tiling && !cfg.timing && !cfg.verbose);
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/npm-emulator.sock"));
        assert_eq!(cfg.trace_categories, category::NONE);
    }

    #[test]
    fn key_values_override_defaults() {
        let mut cfg = EmuConfig::default();
        cfg.apply_str(
            "# NPM Emulator Configuration\n\
             sku=NPM16K\n\
             l2_size_mb=16\n\
             tiling=true\n\
             timing = yes\n\
             socket=/run/npm.sock\n\
             dma_system_bw_gbps=25.5\n\
             clock_freq_mhz=800\n\
             trace_commands=true\n\
             trace_ops=on\n\
             trace_file=/tmp/npm-trace.json\n",
        );
        assert_eq!(cfg.sku, Sku::Npm16k);
        assert_eq!(cfg.l2_size, 16 * 1024 * 1024);
        assert!(cfg.tiling && cfg.timing);
        assert_eq!(cfg.socket_path, PathBuf::from("/run/npm.sock"));
        assert!((cfg.dma.system_bw_gbps - 25.5).abs() < f64::EPSILON);
        assert_eq!(cfg.dma.clock_mhz, 800);
        assert_eq!(cfg.trace_categories, category::COMMANDS | category::OPS);
        assert_eq!(cfg.trace_file, Some(PathBuf::from("/tmp/npm-trace.json")));
    }

    #[test]
    fn comments_blank_lines_and_unknown_keys_are_skipped() {
        let mut cfg = EmuConfig::default();
        cfg.apply_str("\n  # comment\nnot-a-kv-line\nmystery_key=1\ntiling=true\n");
        assert!(cfg.tiling);
    }

    #[test]
    fn categories_can_be_switched_off_again() {
        let mut cfg = EmuConfig::default();
        cfg.apply_str("trace_dma=true\ntrace_dma=false\n");
        assert_eq!(cfg.trace_categories, category::NONE);
    }
}
