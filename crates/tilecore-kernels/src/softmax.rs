//! Online softmax row statistics.
//!
//! A query row sees its scores one column tile at a time. [`RowStats`]
//! keeps the running maximum and normalization sum so that the weighted sum
//! of value rows can be accumulated tile by tile and normalized once at the
//! end, without materializing the full score row and without evaluating
//! `exp` on an unshifted score.
//!
//! When the running maximum grows from `m_old` to `m_new`, everything
//! accumulated so far was scaled by `exp(-m_old)` and must be brought to
//! `exp(-m_new)`: both the sum and the output row are multiplied by
//! `shifted = exp(m_old - m_new)`.
//!
//! Degenerate rows propagate IEEE values. If the first tile of a row is all
//! `-inf`, `exp(-inf - -inf)` is NaN and the whole output row becomes NaN.
//! An all `-inf` tile after a finite one contributes zero.

use tilecore_core::Element;

/// Running statistics of one query row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowStats {
    pub max: f32,
    pub prev_max: f32,
    pub sum: f32,
}

impl RowStats {
    /// State at the start of every row tile.
    pub const INIT: RowStats = RowStats {
        max: f32::NEG_INFINITY,
        prev_max: f32::NEG_INFINITY,
        sum: 0.0,
    };

    /// Absorb one tile of `scores`, writing `exp(score - max)` to `probs`.
    ///
    /// `first` marks the first column tile of the row. Returns the factor the
    /// previously accumulated output row must be multiplied by.
    pub fn absorb<T: Element>(&mut self, first: bool, scores: &[T], probs: &mut [T]) -> f32 {
        debug_assert_eq!(scores.len(), probs.len());
        self.prev_max = self.max;
        let tile_max = scores.iter().map(|s| s.to_f32()).fold(f32::NEG_INFINITY, f32::max);
        self.max = self.prev_max.max(tile_max);

        let mut row_sum = 0.0f32;
        for (p, s) in probs.iter_mut().zip(scores) {
            let e = (s.to_f32() - self.max).exp();
            *p = T::from_f32(e);
            row_sum += e;
        }

        let shifted = (self.prev_max - self.max).exp();
        self.sum = if first { row_sum } else { self.sum * shifted + row_sum };
        shifted
    }
}

/// Bring an accumulated output row to the new running maximum.
pub fn rescale_output<T: Element>(out: &mut [T], shifted: f32) {
    for o in out {
        *o = T::from_f32(o.to_f32() * shifted);
    }
}

/// Divide an output row by its final normalization sum.
pub fn normalize_output<T: Element>(out: &mut [T], sum: f32) {
    for o in out {
        *o = T::from_f32(o.to_f32() / sum);
    }
}
