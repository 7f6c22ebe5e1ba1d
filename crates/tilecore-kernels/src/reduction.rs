//! Row mean/variance reduction and normalization.
//!
//! Two strategies share one contract: for a row `x` of width `w`,
//! `mean = sum(x) / w`, `variance = sum((x - mean)^2) / w` and the output is
//! `(x - mean) / sqrt(variance + eps)`. They differ only in summation order
//! and so agree up to floating-point rounding.

use tilecore_core::{Element, Precision};

/// Independent accumulator vectors kept in flight by the blocked strategy.
pub const UNROLL: usize = 4;

/// Bytes in one accumulator vector of the blocked strategy.
const VECTOR_BYTES: usize = 8;

/// Summation order of the row reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionStrategy {
    /// Sequential sums; normalization divides by the standard deviation.
    Scalar,
    /// `UNROLL` vectors of partial sums reduced as a tree; normalization
    /// multiplies by the inverse standard deviation.
    Blocked,
}

impl ReductionStrategy {
    /// Elements per accumulator vector at `precision`.
    pub fn lanes(precision: Precision) -> usize {
        (VECTOR_BYTES / precision.size_bytes()).max(1)
    }

    /// Elements consumed per blocked step. Rows whose width is a multiple of
    /// this run without a scalar tail.
    pub fn block_width(precision: Precision) -> usize {
        UNROLL * Self::lanes(precision)
    }
}

/// Mean and (population) variance of a row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean: f32,
    pub variance: f32,
}

impl Moments {
    pub fn inv_std(&self, eps: f32) -> f32 {
        1.0 / (self.variance + eps).sqrt()
    }
}

/// Compute the mean and variance of `row`.
pub fn moments<T: Element>(row: &[T], strategy: ReductionStrategy) -> Moments {
    let width = row.len() as f32;
    match strategy {
        ReductionStrategy::Scalar => {
            let mean = row.iter().map(|x| x.to_f32()).sum::<f32>() / width;
            let variance = row
                .iter()
                .map(|x| {
                    let d = x.to_f32() - mean;
                    d * d
                })
                .sum::<f32>()
                / width;
            Moments { mean, variance }
        }
        ReductionStrategy::Blocked => {
            let block = ReductionStrategy::block_width(T::PRECISION);
            let mean = blocked_sum(row, block, |x| x) / width;
            let variance = blocked_sum(row, block, |x| {
                let d = x - mean;
                d * d
            }) / width;
            Moments { mean, variance }
        }
    }
}

/// Normalize `row` into `out` and return its moments.
pub fn normalize_row<T: Element>(row: &[T], out: &mut [T], eps: f32, strategy: ReductionStrategy) -> Moments {
    debug_assert_eq!(row.len(), out.len());
    let m = moments(row, strategy);
    match strategy {
        ReductionStrategy::Scalar => {
            let std = (m.variance + eps).sqrt();
            for (o, x) in out.iter_mut().zip(row) {
                *o = T::from_f32((x.to_f32() - m.mean) / std);
            }
        }
        ReductionStrategy::Blocked => {
            let inv_std = m.inv_std(eps);
            for (o, x) in out.iter_mut().zip(row) {
                *o = T::from_f32((x.to_f32() - m.mean) * inv_std);
            }
        }
    }
    m
}

/// Sum `f(x)` over `row` with `block` independent partial sums.
fn blocked_sum<T: Element>(row: &[T], block: usize, f: impl Fn(f32) -> f32) -> f32 {
    let mut partials = vec![0.0f32; block];
    let mut chunks = row.chunks_exact(block);
    for chunk in chunks.by_ref() {
        for (acc, x) in partials.iter_mut().zip(chunk) {
            *acc += f(x.to_f32());
        }
    }
    for (acc, x) in partials.iter_mut().zip(chunks.remainder()) {
        *acc += f(x.to_f32());
    }
    tree_sum(&mut partials)
}

/// Pairwise reduction in place.
fn tree_sum(values: &mut [f32]) -> f32 {
    let mut len = values.len();
    if len == 0 {
        return 0.0;
    }
    while len > 1 {
        let half = len / 2;
        for i in 0..half {
            values[i] += values[len - 1 - i];
        }
        len -= half;
    }
    values[0]
}
