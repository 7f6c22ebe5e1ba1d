//! FlashAttention-2 forward pass on the cluster runtime.
//!
//! Each cluster owns a contiguous range of `B_r`-row query tiles. For every
//! query tile the mover streams all `B_c`-row key/value tiles through the
//! scratchpad while the calculators, each owning `B_r / P` contiguous rows,
//! compute scores, update the online softmax statistics and accumulate the
//! output tile. The output is normalized once after the last column tile and
//! stored by the mover.
//!
//! Scores are the raw dot products `Q K^T`; no `1/sqrt(d)` scaling is
//! applied. Callers that want scaled attention pre-scale `Q`.
//!
//! The optimized path transposes each value tile cooperatively so that the
//! output product streams both operands along the reduction axis.

use half::f16;
use serde::{Deserialize, Serialize};

use tilecore_core::{
    launch, AttentionTiling, BufferId, BufferRole, CalculatorCtx, Checkpoint, ClusterConfig,
    ClusterKernel, DramTensor, Element, KernelReport, MoverCtx, Precision, Result, RowAssignment,
    RowPartition, ScratchpadLayout, TileDesc, TileError,
};
use tilecore_kernels::{
    gemm, normalize_output, rescale_output, transpose_rows, Accumulate, GemmArgs, GemmVariant,
    RowStats,
};

/// Parameters of one attention head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionLayer {
    /// Sequence length.
    #[serde(rename = "N")]
    pub n: usize,
    /// Head dimension.
    pub d: usize,
    /// Query rows per tile.
    #[serde(rename = "B_r")]
    pub b_r: usize,
    /// Key/value rows per tile.
    #[serde(rename = "B_c")]
    pub b_c: usize,
    pub dtype: Precision,
    /// Use the baseline GEMM path instead of the transposed-value path.
    #[serde(default, deserialize_with = "tilecore_core::serde_flag::deserialize")]
    pub baseline: bool,
}

impl AttentionLayer {
    /// Check every precondition of running this layer on `cluster`.
    pub fn plan(&self, cluster: &ClusterConfig) -> Result<AttentionTiling> {
        cluster.validate()?;
        self.dtype.ensure_supported()?;
        let tiling = AttentionTiling::plan(self.n, self.d, self.b_r, self.b_c, cluster.n_clusters, self.dtype)?;
        RowPartition::validate("row block B_r", self.b_r, cluster.compute_cores)?;
        if !self.baseline {
            RowPartition::validate("column block B_c", self.b_c, cluster.compute_cores)?;
        }
        Ok(tiling)
    }

    /// Scratchpad bytes one cluster needs for this layer.
    pub fn footprint(&self, cluster: &ClusterConfig) -> Result<usize> {
        let tiling = self.plan(cluster)?;
        let mut layout = ScratchpadLayout::new(usize::MAX);
        match self.dtype {
            Precision::FP32 => {
                AttentionBuffers::<f32>::reserve(&mut layout, &tiling, !self.baseline)?;
            }
            Precision::FP16 => {
                AttentionBuffers::<f16>::reserve(&mut layout, &tiling, !self.baseline)?;
            }
            other => return Err(TileError::UnsupportedPrecision(other)),
        }
        Ok(layout.used())
    }

    /// Run on `f32` host data, converting to the layer's precision.
    pub fn run(&self, cluster: &ClusterConfig, q: &[f32], k: &[f32], v: &[f32]) -> Result<(Vec<f32>, KernelReport)> {
        match self.dtype {
            Precision::FP32 => self.run_as::<f32>(cluster, q, k, v),
            Precision::FP16 => self.run_as::<f16>(cluster, q, k, v),
            other => Err(TileError::UnsupportedPrecision(other)),
        }
    }

    fn run_as<T: Element>(
        &self,
        cluster: &ClusterConfig,
        q: &[f32],
        k: &[f32],
        v: &[f32],
    ) -> Result<(Vec<f32>, KernelReport)> {
        self.plan(cluster)?;
        let dims = [self.n, self.d];
        let q = DramTensor::<T>::from_f32(&dims, q)?;
        let k = DramTensor::<T>::from_f32(&dims, k)?;
        let v = DramTensor::<T>::from_f32(&dims, v)?;
        let o = DramTensor::<T>::zeros(&dims);
        let report = flash_attention_2(self, cluster, &q, &k, &v, &o)?;
        Ok((o.to_f32_vec(), report))
    }
}

/// Per-row softmax statistics written next to the output.
#[derive(Debug, Clone)]
pub struct AttentionStats {
    /// Maximum score of each query row, `[N]`.
    pub max: DramTensor<f32>,
    /// Sum of `exp(score - max)` over each query row, `[N]`.
    pub sum: DramTensor<f32>,
}

impl AttentionStats {
    pub fn zeros(n: usize) -> Self {
        Self { max: DramTensor::zeros(&[n]), sum: DramTensor::zeros(&[n]) }
    }

    /// Row log-sum-exp of the scores, `max + ln(sum)`.
    pub fn logsumexp(&self) -> Vec<f32> {
        self.max
            .to_vec()
            .into_iter()
            .zip(self.sum.to_vec())
            .map(|(m, l)| m + l.ln())
            .collect()
    }
}

/// `O = softmax(Q K^T) V` for `N x d` tensors.
pub fn flash_attention_2<T: Element>(
    layer: &AttentionLayer,
    cluster: &ClusterConfig,
    q: &DramTensor<T>,
    k: &DramTensor<T>,
    v: &DramTensor<T>,
    o: &DramTensor<T>,
) -> Result<KernelReport> {
    flash_attention_2_with_stats(layer, cluster, q, k, v, o, None)
}

/// [`flash_attention_2`], also storing the final row statistics to `stats`.
pub fn flash_attention_2_with_stats<T: Element>(
    layer: &AttentionLayer,
    cluster: &ClusterConfig,
    q: &DramTensor<T>,
    k: &DramTensor<T>,
    v: &DramTensor<T>,
    o: &DramTensor<T>,
    stats: Option<&AttentionStats>,
) -> Result<KernelReport> {
    let tiling = layer.plan(cluster)?;
    if layer.dtype != T::PRECISION {
        return Err(TileError::PrecisionMismatch { expected: layer.dtype, got: T::PRECISION });
    }
    let dims = [layer.n, layer.d];
    q.expect_dims("query", &dims)?;
    k.expect_dims("key", &dims)?;
    v.expect_dims("value", &dims)?;
    o.expect_dims("output", &dims)?;
    if let Some(stats) = stats {
        stats.max.expect_dims("row max", &[layer.n])?;
        stats.sum.expect_dims("row sum", &[layer.n])?;
    }

    let optimized = !layer.baseline;
    let mut layout = ScratchpadLayout::new(cluster.scratchpad_bytes);
    let bufs = AttentionBuffers::<T>::reserve(&mut layout, &tiling, optimized)?;
    tracing::debug!(
        "flash attention N={} d={} B_r={} B_c={} T_r={} T_c={} {} ({})",
        tiling.n,
        tiling.d,
        tiling.b_r,
        tiling.b_c,
        tiling.t_r,
        tiling.t_c,
        layer.dtype,
        if optimized { "optimized" } else { "baseline" }
    );

    let kernel = FlashAttention2 {
        tiling,
        variant: if optimized { GemmVariant::Optimized } else { GemmVariant::Baseline },
        bufs,
        q: q.clone(),
        k: k.clone(),
        v: v.clone(),
        o: o.clone(),
        stats: stats.cloned(),
    };
    launch(cluster, &layout, &kernel)
}

/// Scratchpad buffers of one cluster, in allocation order.
#[derive(Debug, Clone, Copy)]
struct AttentionBuffers<T> {
    q: BufferId<T>,
    k: BufferId<T>,
    v: BufferId<T>,
    s: BufferId<T>,
    p: BufferId<T>,
    o: BufferId<T>,
    m: BufferId<f32>,
    m_prev: BufferId<f32>,
    l: BufferId<f32>,
    /// Only reserved on the optimized path, once per invocation.
    v_t: Option<BufferId<T>>,
}

impl<T: Element> AttentionBuffers<T> {
    fn reserve(layout: &mut ScratchpadLayout, tiling: &AttentionTiling, optimized: bool) -> Result<Self> {
        let q = layout.reserve(BufferRole::QueryTile, tiling.row_tile_len())?;
        let k = layout.reserve(BufferRole::KeyTile, tiling.column_tile_len())?;
        let v = layout.reserve(BufferRole::ValueTile, tiling.column_tile_len())?;
        let s = layout.reserve(BufferRole::ScoreTile, tiling.score_tile_len())?;
        let p = layout.reserve(BufferRole::ProbabilityTile, tiling.score_tile_len())?;
        let o = layout.reserve(BufferRole::OutputTile, tiling.row_tile_len())?;
        let m = layout.reserve_stats(BufferRole::RowMax, tiling.b_r)?;
        let m_prev = layout.reserve_stats(BufferRole::PrevRowMax, tiling.b_r)?;
        let l = layout.reserve_stats(BufferRole::RowSum, tiling.b_r)?;
        let v_t = if optimized {
            Some(layout.reserve(BufferRole::TransposeScratch, tiling.column_tile_len())?)
        } else {
            None
        };
        Ok(Self { q, k, v, s, p, o, m, m_prev, l, v_t })
    }
}

struct FlashAttention2<T: Element> {
    tiling: AttentionTiling,
    variant: GemmVariant,
    bufs: AttentionBuffers<T>,
    q: DramTensor<T>,
    k: DramTensor<T>,
    v: DramTensor<T>,
    o: DramTensor<T>,
    stats: Option<AttentionStats>,
}

/// What one role does at each step of the attention protocol.
///
/// [`walk`] drives both roles through the same step and checkpoint sequence,
/// so movers and calculators always meet at matching barriers.
trait AttentionSteps {
    fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()>;

    fn load_query(&mut self, _t_r: usize) -> Result<()> {
        Ok(())
    }

    fn reset_stats(&mut self) -> Result<()> {
        Ok(())
    }

    fn load_key_value(&mut self, _t_c: usize) -> Result<()> {
        Ok(())
    }

    fn compute_scores(&mut self) -> Result<()> {
        Ok(())
    }

    fn update_stats(&mut self, _t_c: usize) -> Result<()> {
        Ok(())
    }

    fn accumulate_output(&mut self, _t_c: usize) -> Result<()> {
        Ok(())
    }

    fn finalize_output(&mut self) -> Result<()> {
        Ok(())
    }

    fn store_output(&mut self, _t_r: usize) -> Result<()> {
        Ok(())
    }
}

fn walk(tiling: &AttentionTiling, cluster: usize, role: &mut impl AttentionSteps) -> Result<()> {
    for t_r in tiling.row_tiles_for(cluster) {
        role.load_query(t_r)?;
        role.checkpoint(Checkpoint::TileLoaded)?;
        role.reset_stats()?;
        role.checkpoint(Checkpoint::StatsReset)?;

        for t_c in 0..tiling.t_c {
            role.load_key_value(t_c)?;
            role.checkpoint(Checkpoint::KeyValueLoaded)?;
            role.compute_scores()?;
            role.checkpoint(Checkpoint::ScoresComputed)?;
            role.update_stats(t_c)?;
            role.checkpoint(Checkpoint::StatsUpdated)?;
            role.accumulate_output(t_c)?;
            role.checkpoint(Checkpoint::OutputAccumulated)?;
        }

        role.finalize_output()?;
        role.checkpoint(Checkpoint::OutputFinalized)?;
        role.store_output(t_r)?;
    }
    Ok(())
}

struct MoverSteps<'c, 'a, T: Element> {
    kernel: &'a FlashAttention2<T>,
    ctx: &'c mut MoverCtx<'a>,
}

impl<T: Element> AttentionSteps for MoverSteps<'_, '_, T> {
    fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.ctx.checkpoint(checkpoint)
    }

    fn load_query(&mut self, t_r: usize) -> Result<()> {
        let kernel = self.kernel;
        tracing::debug!("cluster {} row tile {}", self.ctx.cluster(), t_r);
        let tile = kernel.tiling.row_tile(t_r);
        self.ctx.transfer(|dma| {
            dma.load(kernel.bufs.q, &kernel.q, &tile)?;
            dma.wait_all();
            Ok(())
        })
    }

    fn load_key_value(&mut self, t_c: usize) -> Result<()> {
        let kernel = self.kernel;
        let tile = kernel.tiling.column_tile(t_c);
        self.ctx.transfer(|dma| {
            dma.load(kernel.bufs.k, &kernel.k, &tile)?;
            dma.load(kernel.bufs.v, &kernel.v, &tile)?;
            dma.wait_all();
            Ok(())
        })
    }

    fn store_output(&mut self, t_r: usize) -> Result<()> {
        let kernel = self.kernel;
        let tile = kernel.tiling.row_tile(t_r);
        let rows = TileDesc {
            offset: t_r * kernel.tiling.b_r,
            width: kernel.tiling.b_r,
            repetitions: 1,
            pitch: kernel.tiling.b_r,
            elem_bytes: Precision::FP32.size_bytes(),
        };
        self.ctx.transfer(|dma| {
            dma.store(&kernel.o, kernel.bufs.o, &tile)?;
            if let Some(stats) = &kernel.stats {
                dma.store(&stats.max, kernel.bufs.m, &rows)?;
                dma.store(&stats.sum, kernel.bufs.l, &rows)?;
            }
            dma.wait_all();
            Ok(())
        })
    }
}

struct CalculatorSteps<'c, 'a, T: Element> {
    kernel: &'a FlashAttention2<T>,
    ctx: &'c mut CalculatorCtx<'a>,
    /// Query rows of this calculator within a row tile.
    rows: RowAssignment,
    /// Value rows this calculator transposes, on the optimized path.
    value_rows: Option<RowAssignment>,
}

impl<T: Element> AttentionSteps for CalculatorSteps<'_, '_, T> {
    fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.ctx.checkpoint(checkpoint)
    }

    fn reset_stats(&mut self) -> Result<()> {
        let (kernel, rows) = (self.kernel, self.rows);
        self.ctx.compute(|pad| {
            let mut m = pad.write(kernel.bufs.m);
            let mut m_prev = pad.write(kernel.bufs.m_prev);
            let mut l = pad.write(kernel.bufs.l);
            for r in rows.rows() {
                m[r] = RowStats::INIT.max;
                m_prev[r] = RowStats::INIT.prev_max;
                l[r] = RowStats::INIT.sum;
            }
            Ok(())
        })
    }

    fn compute_scores(&mut self) -> Result<()> {
        let (kernel, rows, value_rows) = (self.kernel, self.rows, self.value_rows);
        let AttentionTiling { d, b_c, .. } = kernel.tiling;
        self.ctx.compute(|pad| {
            if let (Some(share), Some(v_t)) = (value_rows, kernel.bufs.v_t) {
                let v = pad.read(kernel.bufs.v);
                let mut v_t = pad.write(v_t);
                transpose_rows(&v, &mut v_t, b_c, d, share.start..share.start + share.count)?;
            }

            // S = Q K^T over this calculator's rows
            let q = pad.read(kernel.bufs.q);
            let k = pad.read(kernel.bufs.k);
            let mut s = pad.write(kernel.bufs.s);
            let args = GemmArgs::new(rows.count, b_c, d).transpose_b();
            gemm(&args, &q[rows.start * d..], &k, &mut s[rows.start * b_c..], kernel.variant)
        })
    }

    fn update_stats(&mut self, t_c: usize) -> Result<()> {
        let (kernel, rows) = (self.kernel, self.rows);
        let AttentionTiling { d, b_c, .. } = kernel.tiling;
        self.ctx.compute(|pad| {
            let s = pad.read(kernel.bufs.s);
            let mut p = pad.write(kernel.bufs.p);
            let mut o = pad.write(kernel.bufs.o);
            let mut m = pad.write(kernel.bufs.m);
            let mut m_prev = pad.write(kernel.bufs.m_prev);
            let mut l = pad.write(kernel.bufs.l);
            for r in rows.rows() {
                let mut stats = RowStats { max: m[r], prev_max: m_prev[r], sum: l[r] };
                let scores = &s[r * b_c..(r + 1) * b_c];
                let shifted = stats.absorb(t_c == 0, scores, &mut p[r * b_c..(r + 1) * b_c]);
                if t_c > 0 {
                    rescale_output(&mut o[r * d..(r + 1) * d], shifted);
                }
                m[r] = stats.max;
                m_prev[r] = stats.prev_max;
                l[r] = stats.sum;
            }
            Ok(())
        })
    }

    fn accumulate_output(&mut self, t_c: usize) -> Result<()> {
        let (kernel, rows) = (self.kernel, self.rows);
        let AttentionTiling { d, b_c, .. } = kernel.tiling;
        let accumulate = if t_c == 0 { Accumulate::Overwrite } else { Accumulate::Add };
        self.ctx.compute(|pad| match kernel.bufs.v_t {
            Some(v_t) => {
                // O += P (V^T)^T
                let p = pad.read(kernel.bufs.p);
                let mut o = pad.write(kernel.bufs.o);
                let v_t = pad.read(v_t);
                let args = GemmArgs::new(rows.count, d, b_c).transpose_b().accumulate(accumulate);
                gemm(&args, &p[rows.start * b_c..], &v_t, &mut o[rows.start * d..], kernel.variant)
            }
            None => {
                // O += P V
                let v = pad.read(kernel.bufs.v);
                let p = pad.read(kernel.bufs.p);
                let mut o = pad.write(kernel.bufs.o);
                let args = GemmArgs::new(rows.count, d, b_c).accumulate(accumulate);
                gemm(&args, &p[rows.start * b_c..], &v, &mut o[rows.start * d..], kernel.variant)
            }
        })
    }

    fn finalize_output(&mut self) -> Result<()> {
        let (kernel, rows) = (self.kernel, self.rows);
        let d = kernel.tiling.d;
        self.ctx.compute(|pad| {
            let mut o = pad.write(kernel.bufs.o);
            let l = pad.read(kernel.bufs.l);
            for r in rows.rows() {
                normalize_output(&mut o[r * d..(r + 1) * d], l[r]);
            }
            Ok(())
        })
    }
}

impl<T: Element> ClusterKernel for FlashAttention2<T> {
    fn name(&self) -> &'static str {
        "flash_attention_2"
    }

    fn run_mover<'a>(&'a self, ctx: &mut MoverCtx<'a>) -> Result<()> {
        let cluster = ctx.cluster();
        walk(&self.tiling, cluster, &mut MoverSteps { kernel: self, ctx })
    }

    fn run_calculator<'a>(&'a self, ctx: &mut CalculatorCtx<'a>) -> Result<()> {
        let (index, n_calculators) = (ctx.index(), ctx.n_calculators());
        let rows = RowPartition::Contiguous.assign(self.tiling.b_r, n_calculators, index)?;
        let value_rows = match self.bufs.v_t {
            Some(_) => Some(RowPartition::Contiguous.assign(self.tiling.b_c, n_calculators, index)?),
            None => None,
        };
        let cluster = ctx.cluster();
        walk(&self.tiling, cluster, &mut CalculatorSteps { kernel: self, ctx, rows, value_rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::AttentionInputs;
    use crate::golden::{attention_reference, max_abs_diff};

    fn layer(n: usize, d: usize, b_r: usize, b_c: usize, baseline: bool) -> AttentionLayer {
        AttentionLayer { n, d, b_r, b_c, dtype: Precision::FP32, baseline }
    }

    fn cluster(n_clusters: usize, compute_cores: usize) -> ClusterConfig {
        ClusterConfig { n_clusters, compute_cores, scratchpad_bytes: 128 * 1024 }
    }

    #[test]
    fn test_matches_reference() {
        let layer = layer(32, 8, 8, 4, false);
        let inputs = AttentionInputs::generate(&layer, 42);
        let (out, report) = layer.run(&cluster(1, 4), &inputs.q, &inputs.k, &inputs.v).unwrap();
        let expected = attention_reference(&inputs.q, &inputs.k, &inputs.v, 32, 8);
        let err = max_abs_diff(&out, &expected);
        assert!(err < 1e-4, "max abs error {err}");
        assert_eq!(report.kernel, "flash_attention_2");
    }

    #[test]
    fn test_barrier_count() {
        // Per row tile: 3 + 4 * T_c generations
        let layer = layer(16, 4, 4, 8, true);
        let inputs = AttentionInputs::generate(&layer, 1);
        let (_, report) = layer.run(&cluster(2, 2), &inputs.q, &inputs.k, &inputs.v).unwrap();
        let (t_r, t_c) = (4u64, 2u64);
        assert_eq!(report.barriers, t_r * (3 + 4 * t_c));
        assert_eq!(report.cores.len(), 2 * 3);
        // Q and O once per row tile, K and V once per column tile per row tile
        assert_eq!(report.transfers.transfers, t_r * (2 + 2 * t_c));
        assert_eq!(report.transfers.bytes_out, 16 * 4 * 4);
    }

    #[test]
    fn test_footprint() {
        let l = layer(64, 16, 16, 8, true);
        let base = l.footprint(&cluster(1, 8)).unwrap();
        // Q, O: 16x16; K, V: 8x16; S, P: 16x8; three 16-entry stats vectors
        assert_eq!(base, 4 * (2 * 256 + 2 * 128 + 2 * 128 + 3 * 16));
        let opt = AttentionLayer { baseline: false, ..l }.footprint(&cluster(1, 8)).unwrap();
        assert_eq!(opt, base + 4 * 128);
    }

    #[test]
    fn test_rejects_indivisible_sequence() {
        let err = layer(30, 4, 8, 4, true).plan(&cluster(1, 4)).unwrap_err();
        assert!(matches!(err, TileError::NotDivisible { value: 30, divisor: 8, .. }));
    }

    #[test]
    fn test_rejects_rows_not_divisible_by_calculators() {
        let err = layer(24, 4, 6, 4, true).plan(&cluster(1, 4)).unwrap_err();
        assert!(matches!(err, TileError::NotDivisible { what: "row block B_r", .. }));

        // The optimized path also splits the value transpose
        assert!(layer(24, 4, 8, 6, true).plan(&cluster(1, 4)).is_ok());
        let err = layer(24, 4, 8, 6, false).plan(&cluster(1, 4)).unwrap_err();
        assert!(matches!(err, TileError::NotDivisible { what: "column block B_c", .. }));
    }

    #[test]
    fn test_rejects_unsupported_precision() {
        let l = AttentionLayer { dtype: Precision::FP64, ..layer(8, 4, 4, 4, true) };
        let x = vec![0.0f32; 32];
        assert!(matches!(
            l.run(&cluster(1, 2), &x, &x, &x),
            Err(TileError::UnsupportedPrecision(Precision::FP64))
        ));
    }

    #[test]
    fn test_rejects_precision_mismatch() {
        let l = AttentionLayer { dtype: Precision::FP16, ..layer(8, 4, 4, 4, true) };
        let t = DramTensor::<f32>::zeros(&[8, 4]);
        let err = flash_attention_2(&l, &cluster(1, 2), &t, &t, &t, &t).unwrap_err();
        assert!(matches!(
            err,
            TileError::PrecisionMismatch { expected: Precision::FP16, got: Precision::FP32 }
        ));
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let l = layer(8, 4, 4, 4, true);
        let t = DramTensor::<f32>::zeros(&[8, 4]);
        let short = DramTensor::<f32>::zeros(&[4, 4]);
        let err = flash_attention_2(&l, &cluster(1, 2), &t, &short, &t, &t).unwrap_err();
        assert!(matches!(err, TileError::ShapeMismatch { tensor: "key", .. }));
    }

    #[test]
    fn test_scratchpad_overflow() {
        let l = layer(256, 64, 64, 64, false);
        let small = ClusterConfig { scratchpad_bytes: 16 * 1024, ..cluster(1, 8) };
        let x = vec![0.0f32; 256 * 64];
        let err = l.run(&small, &x, &x, &x).unwrap_err();
        assert!(matches!(err, TileError::ScratchpadOverflow { capacity: 16384, .. }), "{err}");
    }

    #[test]
    fn test_oversized_layer_is_a_config_error() {
        let l = layer(1 << 40, 1 << 30, 1 << 40, 1 << 40, true);
        assert!(matches!(l.footprint(&cluster(1, 4)), Err(TileError::InvalidConfig(_))));
        assert!(matches!(l.run(&cluster(1, 4), &[], &[], &[]), Err(TileError::InvalidConfig(_))));
    }
}
