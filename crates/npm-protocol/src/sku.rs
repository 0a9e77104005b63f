//! NPM device SKU table.
//!
//! The SKU ladder doubles MAC throughput at every step while keeping the
//! memory organisation fixed: 1 MiB of L1 per engine and a shared L2
//! that defaults to 8 MiB and is configurable within [1 MiB, 32 MiB].
//! `Mock` and `Emulator` are pseudo-SKUs reported by the software
//! backends; they carry no MAC rating.

use thiserror::Error;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Error for SKU name parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown SKU name: {0:?}")]
pub struct UnknownSku(pub String);

/// NPM device SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Sku {
    /// 1 engine, 16K INT4 MACs/cycle.
    Npm4k = 0,
    /// 1 engine, 32K INT4 MACs/cycle.
    Npm8k = 1,
    /// 2 engines, 64K INT4 MACs/cycle.
    Npm16k = 2,
    /// 4 engines, 128K INT4 MACs/cycle.
    Npm32k = 3,
    /// 8 engines, 256K INT4 MACs/cycle.
    Npm64k = 4,
    /// In-process mock backend (no MAC rating).
    Mock = 5,
    /// Emulator backend (no MAC rating).
    Emulator = 6,
}

/// Per-SKU configuration tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkuConfig {
    /// The SKU this row describes.
    pub sku: Sku,
    /// Number of compute engines.
    pub num_engines: u32,
    /// L1 scratchpad per engine, bytes.
    pub l1_size: usize,
    /// Default shared L2 size, bytes.
    pub l2_size_default: usize,
    /// Minimum configurable L2 size, bytes.
    pub l2_size_min: usize,
    /// Maximum configurable L2 size, bytes.
    pub l2_size_max: usize,
    /// INT4 MACs per cycle per device.
    pub int4_macs: u64,
    /// INT8 MACs per cycle per device.
    pub int8_macs: u64,
    /// FP16 MACs per cycle per device.
    pub fp16_macs: u64,
}

macro_rules! sku_row {
    ($sku:expr, $engines:expr, $int4:expr, $int8:expr, $fp16:expr) => {
        SkuConfig {
            sku: $sku,
            num_engines: $engines,
            l1_size: MIB,
            l2_size_default: 8 * MIB,
            l2_size_min: MIB,
            l2_size_max: 32 * MIB,
            int4_macs: $int4,
            int8_macs: $int8,
            fp16_macs: $fp16,
        }
    };
}

/// The closed SKU table.
pub const SKU_CONFIGS: [SkuConfig; 7] = [
    sku_row!(Sku::Npm4k, 1, 16_000, 4_000, 2_000),
    sku_row!(Sku::Npm8k, 1, 32_000, 8_000, 4_000),
    sku_row!(Sku::Npm16k, 2, 64_000, 16_000, 8_000),
    sku_row!(Sku::Npm32k, 4, 128_000, 32_000, 16_000),
    sku_row!(Sku::Npm64k, 8, 256_000, 64_000, 32_000),
    sku_row!(Sku::Mock, 1, 0, 0, 0),
    sku_row!(Sku::Emulator, 1, 0, 0, 0),
];

impl SkuConfig {
    /// FP32 MACs per cycle, derived as half the FP16 rate.
    pub const fn fp32_macs(&self) -> u64 {
        self.fp16_macs / 2
    }

    /// Clamp a requested L2 size to this SKU's configurable range.
    /// A request of 0 selects the default.
    pub fn clamp_l2(&self, requested: usize) -> usize {
        if requested == 0 {
            self.l2_size_default
        } else {
            requested.clamp(self.l2_size_min, self.l2_size_max)
        }
    }
}

impl Sku {
    /// Look up the configuration row for this SKU.
    pub fn config(self) -> &'static SkuConfig {
        &SKU_CONFIGS[self as usize]
    }

    /// Human-readable SKU name, as printed in traces and banners.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Npm4k => "NPM4K",
            Self::Npm8k => "NPM8K",
            Self::Npm16k => "NPM16K",
            Self::Npm32k => "NPM32K",
            Self::Npm64k => "NPM64K",
            Self::Mock => "Mock",
            Self::Emulator => "Emulator",
        }
    }

    /// Wire encoding used in HELLO responses.
    pub const fn wire(self) -> u32 {
        self as u32
    }

    /// Decode the wire value from a HELLO response.
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Npm4k,
            1 => Self::Npm8k,
            2 => Self::Npm16k,
            3 => Self::Npm32k,
            4 => Self::Npm64k,
            5 => Self::Mock,
            6 => Self::Emulator,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Sku {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Sku {
    type Err = UnknownSku;

    /// Parse a SKU name, case-insensitively. Both the full name
    /// (`NPM16K`) and the bare tier (`16K`) are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        let tier = lower.strip_prefix("npm").unwrap_or(&lower);
        Ok(match tier {
            "4k" => Self::Npm4k,
            "8k" => Self::Npm8k,
            "16k" => Self::Npm16k,
            "32k" => Self::Npm32k,
            "64k" => Self::Npm64k,
            "mock" => Self::Mock,
            "emulator" => Self::Emulator,
            _ => return Err(UnknownSku(trimmed.to_owned())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_internally_consistent() {
        for (i, cfg) in SKU_CONFIGS.iter().enumerate() {
            assert_eq!(cfg.sku as usize, i, "row order must match wire values");
            assert_eq!(cfg.l1_size, MIB);
            assert_eq!(cfg.l2_size_default, 8 * MIB);
            assert!(cfg.l2_size_min <= cfg.l2_size_default);
            assert!(cfg.l2_size_default <= cfg.l2_size_max);
        }
    }

    #[test]
    fn mac_rates_double_up_the_ladder() {
        let hw = &SKU_CONFIGS[..5];
        for pair in hw.windows(2) {
            assert_eq!(pair[1].int4_macs, pair[0].int4_macs * 2);
            assert_eq!(pair[1].int8_macs, pair[0].int8_macs * 2);
            assert_eq!(pair[1].fp16_macs, pair[0].fp16_macs * 2);
        }
        assert_eq!(Sku::Npm4k.config().int4_macs, 16_000);
        assert_eq!(Sku::Npm64k.config().int4_macs, 256_000);
    }

    #[test]
    fn fp32_rate_is_half_fp16() {
        assert_eq!(Sku::Npm8k.config().fp32_macs(), 2_000);
        assert_eq!(Sku::Mock.config().fp32_macs(), 0);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("npm8k".parse::<Sku>().unwrap(), Sku::Npm8k);
        assert_eq!("NPM64K".parse::<Sku>().unwrap(), Sku::Npm64k);
        assert_eq!("16K".parse::<Sku>().unwrap(), Sku::Npm16k);
        assert_eq!("mock".parse::<Sku>().unwrap(), Sku::Mock);
        assert!("npm128k".parse::<Sku>().is_err());
    }

    #[test]
    fn wire_roundtrip() {
        for cfg in &SKU_CONFIGS {
            assert_eq!(Sku::from_wire(cfg.sku.wire()), Some(cfg.sku));
        }
        assert_eq!(Sku::from_wire(99), None);
    }

    #[test]
    fn l2_clamping() {
        let cfg = Sku::Npm8k.config();
        assert_eq!(cfg.clamp_l2(0), 8 * MIB);
        assert_eq!(cfg.clamp_l2(512 * KIB), MIB);
        assert_eq!(cfg.clamp_l2(64 * MIB), 32 * MIB);
        assert_eq!(cfg.clamp_l2(4 * MIB), 4 * MIB);
    }
}
