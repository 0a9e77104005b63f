//! DMA engine model.
//!
//! Two bandwidth lanes move data between memory tiers: the system DMA
//! (DDR↔L2) and the per-engine L1 DMA (L2↔L1). A transfer of B bytes on
//! a lane with bandwidth G GB/s at clock F MHz costs
//! `ceil(B / bytes_per_cycle)` cycles where
//! `bytes_per_cycle = G · 125 / F`, clamped to at least one cycle.
//!
//! The model advances a shared cycle counter and aggregates per-lane
//! statistics; trace emission happens at the call sites so the model
//! stays free of sink plumbing.

/// DMA bandwidth and clock configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DmaConfig {
    /// DDR ↔ L2 bandwidth, GB/s.
    pub system_bw_gbps: f64,
    /// L2 ↔ L1 bandwidth, GB/s.
    pub l1_bw_gbps: f64,
    /// System clock frequency, MHz.
    pub clock_mhz: u64,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            system_bw_gbps: 50.0,
            l1_bw_gbps: 100.0,
            clock_mhz: 1000,
        }
    }
}

/// Direction of a modeled transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// System DMA: DDR → L2.
    DdrToL2,
    /// System DMA: L2 → DDR.
    L2ToDdr,
    /// L1 DMA: L2 → L1.
    L2ToL1,
    /// L1 DMA: L1 → L2.
    L1ToL2,
}

impl DmaDirection {
    /// Trace event name for this direction.
    pub const fn name(self) -> &'static str {
        match self {
            Self::DdrToL2 => "DDR_TO_L2",
            Self::L2ToDdr => "L2_TO_DDR",
            Self::L2ToL1 => "L2_TO_L1",
            Self::L1ToL2 => "L1_TO_L2",
        }
    }

    const fn is_system(self) -> bool {
        matches!(self, Self::DdrToL2 | Self::L2ToDdr)
    }
}

/// Cycle accounting for the two DMA lanes.
#[derive(Debug)]
pub struct DmaModel {
    config: DmaConfig,
    current_cycle: u64,
    total_bytes: u64,
    total_transfer_cycles: u64,
    ddr_l2_bytes: u64,
    l2_l1_bytes: u64,
}

impl DmaModel {
    /// Create a model with the given lane configuration.
    pub fn new(config: DmaConfig) -> Self {
        Self {
            config,
            current_cycle: 0,
            total_bytes: 0,
            total_transfer_cycles: 0,
            ddr_l2_bytes: 0,
            l2_l1_bytes: 0,
        }
    }

    /// Account one transfer and return its cycle cost. The shared cycle
    /// counter advances by the same amount.
    pub fn transfer(&mut self, dir: DmaDirection, bytes: usize) -> u64 {
        let cycles = self.cycles_for(dir, bytes);
        self.current_cycle += cycles;
        self.total_bytes += bytes as u64;
        self.total_transfer_cycles += cycles;
        if dir.is_system() {
            self.ddr_l2_bytes += bytes as u64;
        } else {
            self.l2_l1_bytes += bytes as u64;
        }
        cycles
    }

    /// Advance the shared counter by non-DMA (compute) cycles.
    pub fn advance_cycles(&mut self, cycles: u64) {
        self.current_cycle += cycles;
    }

    /// Current value of the shared cycle counter.
    pub const fn current_cycle(&self) -> u64 {
        self.current_cycle
    }

    /// Total bytes moved across both lanes.
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Total cycles spent in transfers (excludes `advance_cycles`).
    pub const fn total_transfer_cycles(&self) -> u64 {
        self.total_transfer_cycles
    }

    /// Bytes moved on the DDR↔L2 lane.
    pub const fn ddr_l2_bytes(&self) -> u64 {
        self.ddr_l2_bytes
    }

    /// Bytes moved on the L2↔L1 lane.
    pub const fn l2_l1_bytes(&self) -> u64 {
        self.l2_l1_bytes
    }

    /// Lane configuration.
    pub const fn config(&self) -> &DmaConfig {
        &self.config
    }

    /// Zero all counters, including the cycle counter.
    pub fn reset_stats(&mut self) {
        self.current_cycle = 0;
        self.total_bytes = 0;
        self.total_transfer_cycles = 0;
        self.ddr_l2_bytes = 0;
        self.l2_l1_bytes = 0;
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn cycles_for(&self, dir: DmaDirection, bytes: usize) -> u64 {
        let bw_gbps = if dir.is_system() {
            self.config.system_bw_gbps
        } else {
            self.config.l1_bw_gbps
        };
        // GB/s to bytes/cycle: (bw · 1e9 / 8) / (mhz · 1e6) = bw · 125 / mhz
        let bytes_per_cycle = bw_gbps * 125.0 / self.config.clock_mhz as f64;
        let cycles = (bytes as f64 / bytes_per_cycle).ceil() as u64;
        cycles.max(1)
    }
}
