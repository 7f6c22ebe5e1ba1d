//! # tilecore
//!
//! Tiled numeric kernels for accelerator clusters with a small on-chip
//! scratchpad, one bulk-transfer mover and several calculator cores.
//!
//! Provides:
//! - Scratchpad arena, tile planner, transfer engine, checked cluster barrier
//! - Collaborator microkernels (GEMM, transpose, row reductions)
//! - FlashAttention-2 and LayerNorm layers with golden models

pub use tilecore_core;
pub use tilecore_dnn;
pub use tilecore_kernels;

pub use tilecore_core::{ClusterConfig, DramTensor, KernelReport, Precision, TileError};
pub use tilecore_dnn::{flash_attention_2, layer_norm, AttentionLayer, LayerNormLayer};
