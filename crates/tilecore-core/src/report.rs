//! Per-invocation execution report.

use std::fmt;
use std::time::Duration;

use crate::cluster::CoreId;
use crate::transfer::TransferStats;

/// What a core spent its time on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Issuing and waiting for bulk transfers.
    Transfer,
    /// Arithmetic on scratchpad-resident tiles.
    Compute,
    /// Blocked at a barrier.
    Sync,
}

/// Timing of one core.
#[derive(Debug, Clone, Default)]
pub struct CoreStats {
    pub core: Option<CoreId>,
    pub transfer: Duration,
    pub compute: Duration,
    pub sync: Duration,
    pub checkpoints: u64,
}

impl CoreStats {
    pub fn new(core: CoreId) -> Self {
        Self { core: Some(core), ..Default::default() }
    }

    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        match phase {
            Phase::Transfer => self.transfer += elapsed,
            Phase::Compute => self.compute += elapsed,
            Phase::Sync => self.sync += elapsed,
        }
    }

    pub fn get(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Transfer => self.transfer,
            Phase::Compute => self.compute,
            Phase::Sync => self.sync,
        }
    }
}

/// Summary of a kernel invocation.
#[derive(Debug, Clone, Default)]
pub struct KernelReport {
    pub kernel: &'static str,
    pub clusters: usize,
    pub cores_per_cluster: usize,
    /// Cluster barrier generations, summed over clusters.
    pub barriers: u64,
    pub transfers: TransferStats,
    pub scratchpad_bytes: usize,
    pub elapsed: Duration,
    pub cores: Vec<CoreStats>,
}

impl KernelReport {
    /// Largest time any single core spent in `phase`.
    pub fn max_phase(&self, phase: Phase) -> Duration {
        self.cores.iter().map(|c| c.get(phase)).max().unwrap_or_default()
    }
}

impl fmt::Display for KernelReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} cluster(s) x {} cores, {} bytes scratchpad",
            self.kernel, self.clusters, self.cores_per_cluster, self.scratchpad_bytes
        )?;
        writeln!(
            f,
            "  barriers {}, transfers {} ({} B in, {} B out)",
            self.barriers, self.transfers.transfers, self.transfers.bytes_in, self.transfers.bytes_out
        )?;
        write!(
            f,
            "  elapsed {:.3} ms (max transfer {:.3} ms, max compute {:.3} ms, max sync {:.3} ms)",
            self.elapsed.as_secs_f64() * 1e3,
            self.max_phase(Phase::Transfer).as_secs_f64() * 1e3,
            self.max_phase(Phase::Compute).as_secs_f64() * 1e3,
            self.max_phase(Phase::Sync).as_secs_f64() * 1e3,
        )
    }
}
