//! Cluster runtime: mover and calculator roles on scoped threads.
//!
//! Each cluster runs one mover and `compute_cores` calculators in SPMD
//! fashion. Roles are fixed for the lifetime of a launch. Only the mover
//! context owns a transfer engine and only calculator contexts can reach
//! the scratchpad for compute, so role discipline is enforced by the types
//! handed to each role. Clusters share nothing but the final system-wide
//! barrier.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::barrier::{Checkpoint, ClusterBarrier};
use crate::error::{ensure_nonzero, TileError};
use crate::report::{CoreStats, KernelReport, Phase};
use crate::scratchpad::{Scratchpad, ScratchpadLayout};
use crate::transfer::{TransferEngine, TransferStats};
use crate::Result;

/// Shape of the accelerator: clusters, calculators per cluster, scratchpad size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub n_clusters: usize,
    /// Calculator cores per cluster. Each cluster also has one mover.
    pub compute_cores: usize,
    /// Scratchpad capacity per cluster, in bytes.
    pub scratchpad_bytes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            n_clusters: 1,
            compute_cores: 8,
            scratchpad_bytes: 128 * 1024,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_nonzero("cluster count", self.n_clusters)?;
        ensure_nonzero("compute cores per cluster", self.compute_cores)?;
        ensure_nonzero("scratchpad capacity", self.scratchpad_bytes)?;
        Ok(())
    }

    /// Movers plus calculators in one cluster.
    pub fn cores_per_cluster(&self) -> usize {
        self.compute_cores + 1
    }

    pub fn total_cores(&self) -> usize {
        self.n_clusters * self.cores_per_cluster()
    }
}

/// Fixed role of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreRole {
    Mover,
    /// Calculator with its index within the cluster.
    Calculator(usize),
}

/// Identity of a core in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId {
    pub cluster: usize,
    pub role: CoreRole,
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            CoreRole::Mover => write!(f, "cluster {} mover", self.cluster),
            CoreRole::Calculator(i) => write!(f, "cluster {} calculator {}", self.cluster, i),
        }
    }
}

/// A kernel expressed as the two role programs of a cluster.
///
/// Both programs must reach the same sequence of checkpoints; a mismatch
/// surfaces as [`crate::SyncError`] from [`launch`].
pub trait ClusterKernel: Sync {
    fn name(&self) -> &'static str;

    fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()>;

    fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()>;
}

/// Checkpoint helper both roles go through.
struct Coordinator<'a> {
    core: CoreId,
    barrier: &'a ClusterBarrier,
    stats: CoreStats,
}

impl<'a> Coordinator<'a> {
    fn new(core: CoreId, barrier: &'a ClusterBarrier) -> Self {
        Self { core, barrier, stats: CoreStats::new(core) }
    }

    fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let start = Instant::now();
        tracing::trace!("{} at {}", self.core, checkpoint);
        self.barrier.wait(self.core, checkpoint)?;
        self.stats.add(Phase::Sync, start.elapsed());
        self.stats.checkpoints += 1;
        Ok(())
    }

    fn timed<R>(&mut self, phase: Phase, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let out = f();
        self.stats.add(phase, start.elapsed());
        out
    }
}

/// Execution context of a cluster's mover.
pub struct MoverCtx<'a> {
    coord: Coordinator<'a>,
    dma: TransferEngine<'a>,
    n_clusters: usize,
}

impl<'a> MoverCtx<'a> {
    fn new(core: CoreId, barrier: &'a ClusterBarrier, scratchpad: &'a Scratchpad, n_clusters: usize) -> Self {
        Self {
            coord: Coordinator::new(core, barrier),
            dma: TransferEngine::new(scratchpad),
            n_clusters,
        }
    }

    pub fn core(&self) -> CoreId {
        self.coord.core
    }

    pub fn cluster(&self) -> usize {
        self.coord.core.cluster
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Meet the other cores of the cluster at `checkpoint`.
    pub fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.coord.checkpoint(checkpoint)
    }

    /// Run a batch of transfers, timed as [`Phase::Transfer`].
    pub fn transfer<R>(&mut self, f: impl FnOnce(&mut TransferEngine<'a>) -> Result<R>) -> Result<R> {
        let dma = &mut self.dma;
        self.coord.timed(Phase::Transfer, || f(dma))
    }

    fn finish(self) -> (CoreStats, TransferStats) {
        (self.coord.stats.clone(), self.dma.stats())
    }
}

/// Execution context of one calculator.
pub struct CalculatorCtx<'a> {
    coord: Coordinator<'a>,
    scratchpad: &'a Scratchpad,
    index: usize,
    n_calculators: usize,
    n_clusters: usize,
}

impl<'a> CalculatorCtx<'a> {
    fn new(
        core: CoreId,
        barrier: &'a ClusterBarrier,
        scratchpad: &'a Scratchpad,
        index: usize,
        n_calculators: usize,
        n_clusters: usize,
    ) -> Self {
        Self {
            coord: Coordinator::new(core, barrier),
            scratchpad,
            index,
            n_calculators,
            n_clusters,
        }
    }

    pub fn core(&self) -> CoreId {
        self.coord.core
    }

    pub fn cluster(&self) -> usize {
        self.coord.core.cluster
    }

    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Index of this calculator within its cluster.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn n_calculators(&self) -> usize {
        self.n_calculators
    }

    /// Meet the other cores of the cluster at `checkpoint`.
    pub fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.coord.checkpoint(checkpoint)
    }

    /// Run arithmetic on the scratchpad, timed as [`Phase::Compute`].
    pub fn compute<R>(&mut self, f: impl FnOnce(&'a Scratchpad) -> Result<R>) -> Result<R> {
        let scratchpad = self.scratchpad;
        self.coord.timed(Phase::Compute, || f(scratchpad))
    }

    fn finish(self) -> CoreStats {
        self.coord.stats
    }
}

/// Leaves both barriers when a core's thread ends, including by panic.
struct Departure<'b> {
    core: CoreId,
    cluster: &'b ClusterBarrier,
    system: &'b ClusterBarrier,
}

impl Drop for Departure<'_> {
    fn drop(&mut self) {
        self.cluster.leave(self.core);
        self.system.leave(self.core);
    }
}

struct CoreOutcome {
    stats: CoreStats,
    transfers: TransferStats,
}

fn run_core(
    core: CoreId,
    cluster: &ClusterBarrier,
    system: &ClusterBarrier,
    body: impl FnOnce() -> (Result<()>, CoreStats, TransferStats),
) -> Result<CoreOutcome> {
    let _departure = Departure { core, cluster, system };
    let (result, stats, transfers) = body();
    cluster.leave(core);
    if let Err(e) = &result {
        tracing::debug!("{} stopped: {}", core, e);
    }
    result?;
    system.wait(core, Checkpoint::KernelDone)?;
    Ok(CoreOutcome { stats, transfers })
}

/// Run `kernel` on every cluster described by `config`.
///
/// Each cluster gets its own instance of `layout`. Returns once every core
/// has passed the final system barrier, or with the root-cause error if any
/// core failed.
pub fn launch<K: ClusterKernel>(
    config: &ClusterConfig,
    layout: &ScratchpadLayout,
    kernel: &K,
) -> Result<KernelReport> {
    config.validate()?;
    if layout.used() > config.scratchpad_bytes {
        return Err(TileError::InvalidConfig(format!(
            "layout uses {} bytes but clusters have {} bytes of scratchpad",
            layout.used(),
            config.scratchpad_bytes
        )));
    }

    let n_clusters = config.n_clusters;
    let n_calculators = config.compute_cores;
    let scratchpads: Vec<Scratchpad> = (0..n_clusters).map(|_| Scratchpad::new(layout)).collect();
    let barriers: Vec<ClusterBarrier> =
        (0..n_clusters).map(|_| ClusterBarrier::new(config.cores_per_cluster())).collect();
    let system = ClusterBarrier::new(config.total_cores());

    tracing::info!(
        "launching {} on {} cluster(s) x ({} calculators + 1 mover), scratchpad {}/{} bytes",
        kernel.name(),
        n_clusters,
        n_calculators,
        layout.used(),
        config.scratchpad_bytes
    );

    let start = Instant::now();
    let outcomes: Vec<(CoreId, std::thread::Result<Result<CoreOutcome>>)> = std::thread::scope(|s| {
        let mut handles = Vec::with_capacity(config.total_cores());
        for cluster in 0..n_clusters {
            let scratchpad = &scratchpads[cluster];
            let barrier = &barriers[cluster];
            let system = &system;

            let mover = CoreId { cluster, role: CoreRole::Mover };
            handles.push((
                mover,
                s.spawn(move || {
                    run_core(mover, barrier, system, || {
                        let mut ctx = MoverCtx::new(mover, barrier, scratchpad, n_clusters);
                        let result = kernel.run_mover(&mut ctx);
                        let (stats, transfers) = ctx.finish();
                        (result, stats, transfers)
                    })
                }),
            ));

            for index in 0..n_calculators {
                let core = CoreId { cluster, role: CoreRole::Calculator(index) };
                handles.push((
                    core,
                    s.spawn(move || {
                        run_core(core, barrier, system, || {
                            let mut ctx = CalculatorCtx::new(
                                core,
                                barrier,
                                scratchpad,
                                index,
                                n_calculators,
                                n_clusters,
                            );
                            let result = kernel.run_calculator(&mut ctx);
                            (result, ctx.finish(), TransferStats::default())
                        })
                    }),
                ));
            }
        }
        handles.into_iter().map(|(core, h)| (core, h.join())).collect()
    });
    let elapsed = start.elapsed();

    let mut cores = Vec::with_capacity(outcomes.len());
    let mut transfers = TransferStats::default();
    let mut first_error: Option<TileError> = None;
    for (core, outcome) in outcomes {
        let err = match outcome {
            Ok(Ok(out)) => {
                transfers.merge(&out.transfers);
                cores.push(out.stats);
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => TileError::CorePanicked(core),
        };
        let replace = match &first_error {
            None => true,
            Some(prev) => prev.is_secondary() && !err.is_secondary(),
        };
        if replace {
            first_error = Some(err);
        }
    }
    if let Some(err) = first_error {
        tracing::error!("{} failed: {}", kernel.name(), err);
        return Err(err);
    }

    let report = KernelReport {
        kernel: kernel.name(),
        clusters: n_clusters,
        cores_per_cluster: config.cores_per_cluster(),
        barriers: barriers.iter().map(|b| b.generations()).sum(),
        transfers,
        scratchpad_bytes: layout.used(),
        elapsed,
        cores,
    };
    tracing::debug!("{}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::scratchpad::BufferRole;
    use crate::tensor::DramTensor;
    use crate::tiling::TileDesc;
    use crate::BufferId;

    /// Mover loads a vector, calculators double their element, mover stores.
    struct Doubler {
        buf: BufferId<f32>,
        input: DramTensor<f32>,
        output: DramTensor<f32>,
    }

    impl Doubler {
        fn tile(&self, cluster: usize, len: usize) -> TileDesc {
            TileDesc { offset: cluster * len, width: len, repetitions: 1, pitch: len, elem_bytes: 4 }
        }
    }

    impl ClusterKernel for Doubler {
        fn name(&self) -> &'static str {
            "doubler"
        }

        fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()> {
            let tile = self.tile(ctx.cluster(), self.buf.len());
            ctx.transfer(|dma| {
                dma.load(self.buf, &self.input, &tile)?;
                dma.wait_all();
                Ok(())
            })?;
            ctx.checkpoint(Checkpoint::TileLoaded)?;
            ctx.checkpoint(Checkpoint::OutputFinalized)?;
            ctx.transfer(|dma| {
                dma.store(&self.output, self.buf, &tile)?;
                dma.wait_all();
                Ok(())
            })
        }

        fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()> {
            ctx.checkpoint(Checkpoint::TileLoaded)?;
            let i = ctx.index();
            ctx.compute(|pad| {
                pad.write(self.buf)[i] *= 2.0;
                Ok(())
            })?;
            ctx.checkpoint(Checkpoint::OutputFinalized)
        }
    }

    fn doubler(config: &ClusterConfig) -> (ScratchpadLayout, Doubler) {
        let len = config.compute_cores;
        let total = len * config.n_clusters;
        let mut layout = ScratchpadLayout::new(config.scratchpad_bytes);
        let buf = layout.reserve::<f32>(BufferRole::InputTile, len).unwrap();
        let input = DramTensor::from_vec(&[total], (0..total).map(|i| i as f32).collect()).unwrap();
        let output = DramTensor::zeros(&[total]);
        (layout, Doubler { buf, input, output })
    }

    #[test]
    fn test_launch_runs_all_roles() {
        let config = ClusterConfig { n_clusters: 2, compute_cores: 4, scratchpad_bytes: 1024 };
        let (layout, kernel) = doubler(&config);
        let report = launch(&config, &layout, &kernel).unwrap();

        assert_eq!(kernel.output.to_vec(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
        assert_eq!(report.clusters, 2);
        assert_eq!(report.cores.len(), 10);
        assert_eq!(report.barriers, 4);
        assert_eq!(report.transfers.transfers, 4);
        assert_eq!(report.transfers.bytes_in, 32);
        assert_eq!(report.transfers.bytes_out, 32);
        assert!(report.cores.iter().all(|c| c.checkpoints == 2));
    }

    #[test]
    fn test_invalid_config() {
        let config = ClusterConfig { n_clusters: 1, compute_cores: 0, scratchpad_bytes: 1024 };
        let layout = ScratchpadLayout::new(1024);
        let kernel = doubler(&ClusterConfig::default()).1;
        assert!(matches!(launch(&config, &layout, &kernel), Err(TileError::ZeroDimension { .. })));
    }

    /// Calculators skip the final checkpoint.
    struct Truncated;

    impl ClusterKernel for Truncated {
        fn name(&self) -> &'static str {
            "truncated"
        }

        fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()> {
            ctx.checkpoint(Checkpoint::TileLoaded)?;
            ctx.checkpoint(Checkpoint::OutputFinalized)
        }

        fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()> {
            ctx.checkpoint(Checkpoint::TileLoaded)
        }
    }

    #[test]
    fn test_missing_checkpoint_is_reported() {
        let config = ClusterConfig { n_clusters: 1, compute_cores: 3, scratchpad_bytes: 64 };
        let err = launch(&config, &ScratchpadLayout::new(64), &Truncated).unwrap_err();
        assert!(
            matches!(err, TileError::Sync(SyncError::ParticipantExited { .. })),
            "unexpected error: {err}"
        );
    }

    /// Mover names a different checkpoint than the calculators.
    struct Misordered;

    impl ClusterKernel for Misordered {
        fn name(&self) -> &'static str {
            "misordered"
        }

        fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()> {
            ctx.checkpoint(Checkpoint::KeyValueLoaded)
        }

        fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()> {
            ctx.checkpoint(Checkpoint::ScoresComputed)
        }
    }

    #[test]
    fn test_mismatched_checkpoint_is_reported() {
        let config = ClusterConfig { n_clusters: 1, compute_cores: 2, scratchpad_bytes: 64 };
        let err = launch(&config, &ScratchpadLayout::new(64), &Misordered).unwrap_err();
        assert!(
            matches!(err, TileError::Sync(SyncError::CheckpointMismatch { .. })),
            "unexpected error: {err}"
        );
    }

    struct Panicking;

    impl ClusterKernel for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()> {
            ctx.checkpoint(Checkpoint::TileLoaded)
        }

        fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()> {
            if ctx.index() == 1 {
                panic!("calculator fault");
            }
            ctx.checkpoint(Checkpoint::TileLoaded)
        }
    }

    #[test]
    fn test_panicking_core_does_not_hang() {
        let config = ClusterConfig { n_clusters: 1, compute_cores: 2, scratchpad_bytes: 64 };
        let err = launch(&config, &ScratchpadLayout::new(64), &Panicking).unwrap_err();
        assert!(matches!(
            err,
            TileError::CorePanicked(CoreId { cluster: 0, role: CoreRole::Calculator(1) })
        ));
    }
}
