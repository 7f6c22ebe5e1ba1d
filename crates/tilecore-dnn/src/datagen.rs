//! Seeded input generation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::flash_attention::AttentionLayer;
use crate::layer_norm::LayerNormLayer;

/// Seed used when none is given.
pub const DEFAULT_SEED: u64 = 42;

/// `len` values drawn uniformly from `[-1, 1)`.
pub fn uniform(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Query, key and value matrices of an attention layer, each `N x d`.
#[derive(Debug, Clone)]
pub struct AttentionInputs {
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
}

impl AttentionInputs {
    pub fn generate(layer: &AttentionLayer, seed: u64) -> Self {
        let len = layer.n * layer.d;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut draw = || (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect::<Vec<_>>();
        let q = draw();
        let k = draw();
        let v = draw();
        Self { q, k, v }
    }
}

/// Input feature map of a LayerNorm layer, `batch x seq_len x embeddings`.
pub fn layer_norm_input(layer: &LayerNormLayer, seed: u64) -> Vec<f32> {
    uniform(layer.batch_size * layer.seq_len * layer.embeddings, seed)
}
