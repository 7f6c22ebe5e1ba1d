//! Dense matrix multiplication on row-major slices.
//!
//! Computes `C = alpha * op(A) * op(B) (+ C)` where `op` optionally
//! transposes. Leading dimensions are explicit so that sub-tiles of a larger
//! buffer can be addressed in place.

use tilecore_core::{Element, Result, TileError};

/// Unroll factor of the optimized dot-product loop.
const DOT_UNROLL: usize = 4;

/// Whether the product overwrites `C` or is added to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulate {
    Overwrite,
    Add,
}

/// Loop nest used for the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmVariant {
    /// Triple loop handling every transpose combination.
    Baseline,
    /// Unrolled dot products over contiguous `k` runs. Requires `op(A) = A`
    /// and `op(B) = B^T`, so both operands stream along `k`.
    Optimized,
}

/// Shape and layout of one GEMM call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmArgs {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Read `A` as `k x m` and transpose.
    pub ta: bool,
    /// Read `B` as `n x k` and transpose.
    pub tb: bool,
    pub alpha: f32,
    pub accumulate: Accumulate,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
}

impl GemmArgs {
    /// Untransposed `m x k` by `k x n` product with packed leading dimensions.
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self {
            m,
            n,
            k,
            ta: false,
            tb: false,
            alpha: 1.0,
            accumulate: Accumulate::Overwrite,
            lda: k,
            ldb: n,
            ldc: n,
        }
    }

    /// Read `B` as a row-major `n x k` matrix.
    pub fn transpose_b(mut self) -> Self {
        self.tb = true;
        self.ldb = self.k;
        self
    }

    /// Read `A` as a row-major `k x m` matrix.
    pub fn transpose_a(mut self) -> Self {
        self.ta = true;
        self.lda = self.m;
        self
    }

    pub fn accumulate(mut self, accumulate: Accumulate) -> Self {
        self.accumulate = accumulate;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn leading_dims(mut self, lda: usize, ldb: usize, ldc: usize) -> Self {
        self.lda = lda;
        self.ldb = ldb;
        self.ldc = ldc;
        self
    }

    fn check(&self, a: usize, b: usize, c: usize) -> Result<()> {
        let (a_rows, a_cols) = if self.ta { (self.k, self.m) } else { (self.m, self.k) };
        let (b_rows, b_cols) = if self.tb { (self.n, self.k) } else { (self.k, self.n) };
        check_operand("A", a_rows, a_cols, self.lda, a)?;
        check_operand("B", b_rows, b_cols, self.ldb, b)?;
        check_operand("C", self.m, self.n, self.ldc, c)
    }
}

fn check_operand(name: &str, rows: usize, cols: usize, ld: usize, len: usize) -> Result<()> {
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    if ld < cols {
        return Err(TileError::InvalidConfig(format!(
            "gemm operand {name}: leading dimension {ld} is smaller than {cols} columns"
        )));
    }
    let needed = (rows - 1) * ld + cols;
    if needed > len {
        return Err(TileError::OutOfBounds(format!(
            "gemm operand {name}: {rows}x{cols} with leading dimension {ld} needs {needed} elements, slice has {len}"
        )));
    }
    Ok(())
}

/// `C = alpha * op(A) * op(B)`, added to `C` when accumulating.
pub fn gemm<T: Element>(args: &GemmArgs, a: &[T], b: &[T], c: &mut [T], variant: GemmVariant) -> Result<()> {
    args.check(a.len(), b.len(), c.len())?;
    match variant {
        GemmVariant::Baseline => gemm_baseline(args, a, b, c),
        GemmVariant::Optimized => {
            if args.ta || !args.tb {
                return Err(TileError::InvalidConfig(format!(
                    "optimized gemm needs ta=false, tb=true (got ta={}, tb={})",
                    args.ta, args.tb
                )));
            }
            gemm_dot(args, a, b, c);
        }
    }
    Ok(())
}

fn gemm_baseline<T: Element>(args: &GemmArgs, a: &[T], b: &[T], c: &mut [T]) {
    let a_at = |i: usize, p: usize| {
        let idx = if args.ta { p * args.lda + i } else { i * args.lda + p };
        a[idx].to_f32()
    };
    let b_at = |p: usize, j: usize| {
        let idx = if args.tb { j * args.ldb + p } else { p * args.ldb + j };
        b[idx].to_f32()
    };
    for i in 0..args.m {
        for j in 0..args.n {
            let mut acc = 0.0f32;
            for p in 0..args.k {
                acc += a_at(i, p) * b_at(p, j);
            }
            store(&mut c[i * args.ldc + j], args, acc);
        }
    }
}

fn gemm_dot<T: Element>(args: &GemmArgs, a: &[T], b: &[T], c: &mut [T]) {
    let k = args.k;
    for i in 0..args.m {
        let a_row = &a[i * args.lda..i * args.lda + k];
        for j in 0..args.n {
            let b_row = &b[j * args.ldb..j * args.ldb + k];
            store(&mut c[i * args.ldc + j], args, dot_unrolled(a_row, b_row));
        }
    }
}

/// Dot product with independent partial sums per unrolled lane.
fn dot_unrolled<T: Element>(a: &[T], b: &[T]) -> f32 {
    let mut acc = [0.0f32; DOT_UNROLL];
    let mut a_chunks = a.chunks_exact(DOT_UNROLL);
    let mut b_chunks = b.chunks_exact(DOT_UNROLL);
    for (ac, bc) in a_chunks.by_ref().zip(b_chunks.by_ref()) {
        for u in 0..DOT_UNROLL {
            acc[u] += ac[u].to_f32() * bc[u].to_f32();
        }
    }
    let mut tail = 0.0f32;
    for (x, y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        tail += x.to_f32() * y.to_f32();
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

#[inline]
fn store<T: Element>(dst: &mut T, args: &GemmArgs, acc: f32) {
    let value = args.alpha * acc;
    *dst = match args.accumulate {
        Accumulate::Overwrite => T::from_f32(value),
        Accumulate::Add => T::from_f32(dst.to_f32() + value),
    };
}
