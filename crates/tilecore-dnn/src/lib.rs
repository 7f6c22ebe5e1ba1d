//! # tilecore-dnn
//!
//! Neural-network layers built on the tilecore cluster runtime.
//!
//! Provides:
//! - FlashAttention-2 forward pass with online softmax over column tiles
//! - LayerNorm over the embedding axis with scalar and blocked reductions
//! - Double-precision golden models for both layers
//! - Seeded input generation

pub mod flash_attention;
pub mod layer_norm;
pub mod golden;
pub mod datagen;

pub use flash_attention::{flash_attention_2, flash_attention_2_with_stats, AttentionLayer, AttentionStats};
pub use layer_norm::{layer_norm, LayerNormLayer};
