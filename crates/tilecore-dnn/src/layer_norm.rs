//! LayerNorm over the embedding axis on the cluster runtime.
//!
//! The `batch x seq_len x embeddings` feature map is cut along the sequence
//! axis into `n_tiles` tiles, each holding `seq_len / n_tiles` rows of every
//! batch entry. Clusters own contiguous ranges of tiles. Within a tile,
//! calculator `i` normalizes sequence rows `i, i + P, i + 2P, ...` of every
//! batch entry.

use half::f16;
use serde::{Deserialize, Serialize};

use tilecore_core::error::ensure_multiple;
use tilecore_core::{
    launch, BufferId, BufferRole, CalculatorCtx, Checkpoint, ClusterConfig, ClusterKernel,
    DramTensor, Element, KernelReport, LayerNormTiling, MoverCtx, Precision, Result, RowAssignment,
    RowPartition, Scratchpad, ScratchpadLayout, TileError,
};
use tilecore_kernels::{normalize_row, ReductionStrategy};

fn default_eps() -> f32 {
    1e-5
}

/// Parameters of a LayerNorm layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNormLayer {
    pub batch_size: usize,
    pub seq_len: usize,
    pub embeddings: usize,
    pub n_tiles: usize,
    /// Use the scalar reduction instead of the blocked one.
    #[serde(default, deserialize_with = "tilecore_core::serde_flag::deserialize")]
    pub baseline: bool,
    #[serde(default = "default_eps")]
    pub eps: f32,
    pub dtype: Precision,
}

impl LayerNormLayer {
    fn strategy(&self) -> ReductionStrategy {
        if self.baseline {
            ReductionStrategy::Scalar
        } else {
            ReductionStrategy::Blocked
        }
    }

    /// Check every precondition of running this layer on `cluster`.
    pub fn plan(&self, cluster: &ClusterConfig) -> Result<LayerNormTiling> {
        cluster.validate()?;
        self.dtype.ensure_supported()?;
        let tiling = LayerNormTiling::plan(
            self.batch_size,
            self.seq_len,
            self.embeddings,
            self.n_tiles,
            cluster.n_clusters,
            self.dtype,
        )?;
        RowPartition::validate("rows per tile", tiling.tile_seq_len, cluster.compute_cores)?;
        if !self.baseline {
            ensure_multiple(
                "embedding width",
                self.embeddings,
                ReductionStrategy::block_width(self.dtype),
            )?;
        }
        Ok(tiling)
    }

    /// Scratchpad bytes one cluster needs for this layer.
    pub fn footprint(&self, cluster: &ClusterConfig) -> Result<usize> {
        let tiling = self.plan(cluster)?;
        let mut layout = ScratchpadLayout::new(usize::MAX);
        match self.dtype {
            Precision::FP32 => {
                LayerNormBuffers::<f32>::reserve(&mut layout, &tiling)?;
            }
            Precision::FP16 => {
                LayerNormBuffers::<f16>::reserve(&mut layout, &tiling)?;
            }
            other => return Err(TileError::UnsupportedPrecision(other)),
        }
        Ok(layout.used())
    }

    /// Run on `f32` host data, converting to the layer's precision.
    pub fn run(&self, cluster: &ClusterConfig, input: &[f32]) -> Result<(Vec<f32>, KernelReport)> {
        match self.dtype {
            Precision::FP32 => self.run_as::<f32>(cluster, input),
            Precision::FP16 => self.run_as::<f16>(cluster, input),
            other => Err(TileError::UnsupportedPrecision(other)),
        }
    }

    fn run_as<T: Element>(&self, cluster: &ClusterConfig, input: &[f32]) -> Result<(Vec<f32>, KernelReport)> {
        self.plan(cluster)?;
        let dims = [self.batch_size, self.seq_len, self.embeddings];
        let ifmap = DramTensor::<T>::from_f32(&dims, input)?;
        let ofmap = DramTensor::<T>::zeros(&dims);
        let report = layer_norm(self, cluster, &ifmap, &ofmap)?;
        Ok((ofmap.to_f32_vec(), report))
    }
}

/// Normalize every `embeddings`-wide row of `ifmap` into `ofmap`.
pub fn layer_norm<T: Element>(
    layer: &LayerNormLayer,
    cluster: &ClusterConfig,
    ifmap: &DramTensor<T>,
    ofmap: &DramTensor<T>,
) -> Result<KernelReport> {
    let tiling = layer.plan(cluster)?;
    if layer.dtype != T::PRECISION {
        return Err(TileError::PrecisionMismatch { expected: layer.dtype, got: T::PRECISION });
    }
    let dims = [layer.batch_size, layer.seq_len, layer.embeddings];
    ifmap.expect_dims("input feature map", &dims)?;
    ofmap.expect_dims("output feature map", &dims)?;

    let mut layout = ScratchpadLayout::new(cluster.scratchpad_bytes);
    let bufs = LayerNormBuffers::<T>::reserve(&mut layout, &tiling)?;
    tracing::debug!(
        "layernorm {}x{}x{} in {} tiles of {} rows, eps {} {} ({:?})",
        layer.batch_size,
        layer.seq_len,
        layer.embeddings,
        tiling.n_tiles,
        tiling.tile_seq_len,
        layer.eps,
        layer.dtype,
        layer.strategy()
    );

    let kernel = LayerNorm {
        tiling,
        strategy: layer.strategy(),
        eps: layer.eps,
        bufs,
        ifmap: ifmap.clone(),
        ofmap: ofmap.clone(),
    };
    launch(cluster, &layout, &kernel)
}

#[derive(Debug, Clone, Copy)]
struct LayerNormBuffers<T> {
    input: BufferId<T>,
    output: BufferId<T>,
}

impl<T: Element> LayerNormBuffers<T> {
    fn reserve(layout: &mut ScratchpadLayout, tiling: &LayerNormTiling) -> Result<Self> {
        let input = layout.reserve(BufferRole::InputTile, tiling.tile_len())?;
        let output = layout.reserve(BufferRole::OutputTile, tiling.tile_len())?;
        Ok(Self { input, output })
    }
}

struct LayerNorm<T: Element> {
    tiling: LayerNormTiling,
    strategy: ReductionStrategy,
    eps: f32,
    bufs: LayerNormBuffers<T>,
    ifmap: DramTensor<T>,
    ofmap: DramTensor<T>,
}

impl<T: Element> LayerNorm<T> {
    fn normalize_rows(&self, pad: &Scratchpad, rows: RowAssignment) -> Result<()> {
        let emb = self.tiling.embeddings;
        let input = pad.read(self.bufs.input);
        let mut output = pad.write(self.bufs.output);
        for b in 0..self.tiling.batch_size {
            let batch_base = b * self.tiling.tile_seq_len;
            for s in rows.rows() {
                let at = (batch_base + s) * emb;
                normalize_row(&input[at..at + emb], &mut output[at..at + emb], self.eps, self.strategy);
            }
        }
        Ok(())
    }
}

impl<T: Element> ClusterKernel for LayerNorm<T> {
    fn name(&self) -> &'static str {
        "layernorm"
    }

    fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()> {
        for tile_idx in self.tiling.tiles_for(ctx.cluster()) {
            let tile = self.tiling.tile(tile_idx);
            tracing::debug!("cluster {} tile {}", ctx.cluster(), tile_idx);
            ctx.transfer(|dma| {
                dma.load(self.bufs.input, &self.ifmap, &tile)?;
                dma.wait_all();
                Ok(())
            })?;
            ctx.checkpoint(Checkpoint::TileLoaded)?;
            ctx.checkpoint(Checkpoint::OutputFinalized)?;
            ctx.transfer(|dma| {
                dma.store(&self.ofmap, self.bufs.output, &tile)?;
                dma.wait_all();
                Ok(())
            })?;
        }
        Ok(())
    }

    fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()> {
        let rows = RowPartition::Interleaved.assign(self.tiling.tile_seq_len, ctx.n_calculators(), ctx.index())?;
        for _ in self.tiling.tiles_for(ctx.cluster()) {
            ctx.checkpoint(Checkpoint::TileLoaded)?;
            ctx.compute(|pad| self.normalize_rows(pad, rows))?;
            ctx.checkpoint(Checkpoint::OutputFinalized)?;
        }
        Ok(())
    }
}
