//! # tilecore-kernels
//!
//! Microkernels the cluster calculators run on scratchpad-resident tiles.
//!
//! Provides:
//! - GEMM with transpose flags, scaling and overwrite/accumulate modes
//!   (baseline loop nest and an unrolled dot-product path)
//! - Matrix transpose, whole or by row range
//! - Online softmax row statistics with output rescaling
//! - Row mean/variance reduction and normalization (scalar and blocked)
//!
//! All kernels work on plain slices of [`tilecore_core::Element`] values and
//! accumulate in `f32`.

pub mod gemm;
pub mod transpose;
pub mod softmax;
pub mod reduction;

pub use gemm::{gemm, Accumulate, GemmArgs, GemmVariant};
pub use reduction::{moments, normalize_row, Moments, ReductionStrategy, UNROLL};
pub use softmax::{normalize_output, rescale_output, RowStats};
pub use transpose::{transpose, transpose_rows};
