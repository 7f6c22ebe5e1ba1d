//! End-to-end LayerNorm checks.

use tilecore_core::{ClusterConfig, Precision, TileError};
use tilecore_dnn::datagen::layer_norm_input;
use tilecore_dnn::golden::{layer_norm_reference, max_abs_diff};
use tilecore_dnn::LayerNormLayer;

fn layer(batch_size: usize, seq_len: usize, embeddings: usize, n_tiles: usize, baseline: bool) -> LayerNormLayer {
    LayerNormLayer { batch_size, seq_len, embeddings, n_tiles, baseline, eps: 0.0, dtype: Precision::FP32 }
}

fn cluster(n_clusters: usize, compute_cores: usize) -> ClusterConfig {
    ClusterConfig { n_clusters, compute_cores, scratchpad_bytes: 128 * 1024 }
}

#[test]
fn rows_have_zero_mean_unit_variance() {
    let l = layer(2, 64, 32, 8, false);
    let x = layer_norm_input(&l, 42);
    let (out, _) = l.run(&cluster(2, 4), &x).unwrap();
    for (r, row) in out.chunks(32).enumerate() {
        let mean = row.iter().sum::<f32>() / 32.0;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 32.0;
        assert!(mean.abs() < 1e-5, "row {r}: mean {mean}");
        assert!((var - 1.0).abs() < 1e-4, "row {r}: variance {var}");
    }
}

#[test]
fn baseline_and_blocked_agree() {
    let base = LayerNormLayer { eps: 1e-5, ..layer(3, 32, 64, 4, true) };
    let opt = LayerNormLayer { baseline: false, ..base.clone() };
    let x = layer_norm_input(&base, 7);
    let c = cluster(1, 8);
    let (a, _) = base.run(&c, &x).unwrap();
    let (b, _) = opt.run(&c, &x).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-5);
    let expected = layer_norm_reference(&x, 3 * 32, 64, 1e-5);
    assert!(max_abs_diff(&b, &expected) < 1e-4);
}

#[test]
fn constant_rows_without_eps_are_nan() {
    let l = layer(1, 8, 8, 1, false);
    let x = vec![3.0f32; 64];
    let (out, _) = l.run(&cluster(1, 4), &x).unwrap();
    assert!(out.iter().all(|v| v.is_nan()));
}

#[test]
fn half_precision_tracks_single() {
    let l = LayerNormLayer { eps: 1e-5, ..layer(1, 16, 32, 2, false) };
    let h = LayerNormLayer { dtype: Precision::FP16, ..l.clone() };
    let x = layer_norm_input(&l, 1);
    let c = cluster(2, 4);
    let (single, _) = l.run(&c, &x).unwrap();
    let (half, _) = h.run(&c, &x).unwrap();
    assert!(max_abs_diff(&single, &half) < 2e-2);
}

#[test]
fn oversized_tile_is_rejected() {
    let l = layer(4, 256, 128, 2, false);
    let x = vec![0.0f32; 4 * 256 * 128];
    let err = l.run(&cluster(1, 8), &x).unwrap_err();
    assert!(matches!(err, TileError::ScratchpadOverflow { .. }), "{err}");
}
