//! Double-precision golden models.
//!
//! Kernel outputs are checked against these. Inputs are row-major `f32`
//! slices; all arithmetic is done in `f64`.

/// Untiled `softmax(Q K^T) V` for `N x d` operands.
pub fn attention_reference(q: &[f32], k: &[f32], v: &[f32], n: usize, d: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; n * d];
    let mut scores = vec![0.0f64; n];
    for i in 0..n {
        for (j, s) in scores.iter_mut().enumerate() {
            *s = dot(&q[i * d..(i + 1) * d], &k[j * d..(j + 1) * d]);
        }
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0f64;
        let mut acc = vec![0.0f64; d];
        for (j, s) in scores.iter().enumerate() {
            let e = (s - max).exp();
            sum += e;
            for (a, x) in acc.iter_mut().zip(&v[j * d..(j + 1) * d]) {
                *a += e * *x as f64;
            }
        }
        for (o, a) in out[i * d..(i + 1) * d].iter_mut().zip(&acc) {
            *o = (a / sum) as f32;
        }
    }
    out
}

/// Result of the blocked attention recurrence.
#[derive(Debug, Clone)]
pub struct TiledAttention {
    pub output: Vec<f32>,
    /// Final running maximum per query row.
    pub row_max: Vec<f32>,
    /// Final normalization sum per query row, relative to `row_max`.
    pub row_sum: Vec<f32>,
}

/// The online-softmax recurrence over `B_r x B_c` blocks.
///
/// When the running max rises, the accumulated output and sum are multiplied
/// by `exp(prev_max - max)`, so the result equals [`attention_reference`] for
/// every `B_c`.
pub fn attention_tiled_reference(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    n: usize,
    d: usize,
    b_r: usize,
    b_c: usize,
) -> TiledAttention {
    let mut output = vec![0.0f32; n * d];
    let mut row_max = vec![0.0f32; n];
    let mut row_sum = vec![0.0f32; n];

    for t_r in 0..n / b_r {
        for i in t_r * b_r..(t_r + 1) * b_r {
            let q_i = &q[i * d..(i + 1) * d];
            let mut m = f64::NEG_INFINITY;
            let mut l = 0.0f64;
            let mut o = vec![0.0f64; d];
            for t_c in 0..n / b_c {
                let cols = t_c * b_c..(t_c + 1) * b_c;
                let s: Vec<f64> = cols.clone().map(|j| dot(q_i, &k[j * d..(j + 1) * d])).collect();
                let m_prev = m;
                m = s.iter().cloned().fold(m_prev, f64::max);
                let shifted = (m_prev - m).exp();
                let p: Vec<f64> = s.iter().map(|s| (s - m).exp()).collect();
                let tile_sum: f64 = p.iter().sum();
                l = if t_c == 0 { tile_sum } else { l * shifted + tile_sum };
                for x in o.iter_mut() {
                    *x *= if t_c == 0 { 0.0 } else { shifted };
                }
                for (p_j, j) in p.iter().zip(cols) {
                    for (x, vv) in o.iter_mut().zip(&v[j * d..(j + 1) * d]) {
                        *x += p_j * *vv as f64;
                    }
                }
            }
            for (dst, x) in output[i * d..(i + 1) * d].iter_mut().zip(&o) {
                *dst = (x / l) as f32;
            }
            row_max[i] = m as f32;
            row_sum[i] = l as f32;
        }
    }
    TiledAttention { output, row_max, row_sum }
}

/// Normalize each `embeddings`-wide row to zero mean and unit variance.
pub fn layer_norm_reference(x: &[f32], rows: usize, embeddings: usize, eps: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * embeddings];
    for r in 0..rows {
        let row = &x[r * embeddings..(r + 1) * embeddings];
        let width = embeddings as f64;
        let mean = row.iter().map(|&v| v as f64).sum::<f64>() / width;
        let var = row.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / width;
        let std = (var + eps as f64).sqrt();
        for (o, &v) in out[r * embeddings..(r + 1) * embeddings].iter_mut().zip(row) {
            *o = ((v as f64 - mean) / std) as f32;
        }
    }
    out
}

/// Transpose of a row-major `rows x cols` matrix.
pub fn transpose(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = x[r * cols + c];
        }
    }
    out
}

/// Largest elementwise absolute difference.
///
/// Positions where both sides are NaN agree; a NaN on one side only counts
/// as an infinite difference.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| match (x.is_nan(), y.is_nan()) {
            (true, true) => 0.0,
            (false, false) if x == y => 0.0,
            (false, false) => (x - y).abs(),
            _ => f32::INFINITY,
        })
        .fold(0.0f32, f32::max)
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}
