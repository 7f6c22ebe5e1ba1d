//! Benchmark: baseline vs optimized paths of the attention and layernorm kernels.

use std::time::Instant;

use tilecore::tilecore_dnn::datagen::{self, AttentionInputs};
use tilecore::{AttentionLayer, ClusterConfig, LayerNormLayer, Precision};

fn bench_attention(layer: &AttentionLayer, cluster: &ClusterConfig, inputs: &AttentionInputs, iters: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        let _ = layer.run(cluster, &inputs.q, &inputs.k, &inputs.v).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_layernorm(layer: &LayerNormLayer, cluster: &ClusterConfig, input: &[f32], iters: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        let _ = layer.run(cluster, input).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    let cluster = ClusterConfig::default();
    println!("=== tilecore Kernel Benchmark ===");
    println!(
        "cluster: {} x ({} calculators + 1 mover), {} KiB scratchpad\n",
        cluster.n_clusters,
        cluster.compute_cores,
        cluster.scratchpad_bytes / 1024
    );

    println!("{:<28} {:>14} {:>14} {:>10}", "FlashAttention-2", "Baseline (ms)", "Optimized (ms)", "Speedup");
    println!("{}", "-".repeat(70));
    let shapes: &[(usize, usize, usize, usize)] = &[(64, 16, 16, 16), (128, 32, 32, 32), (256, 64, 32, 32)];
    for &(n, d, b_r, b_c) in shapes {
        for dtype in [Precision::FP32, Precision::FP16] {
            let base = AttentionLayer { n, d, b_r, b_c, dtype, baseline: true };
            let opt = AttentionLayer { baseline: false, ..base.clone() };
            let inputs = AttentionInputs::generate(&base, datagen::DEFAULT_SEED);
            let iters = if n <= 64 { 50 } else if n <= 128 { 10 } else { 3 };

            let base_s = bench_attention(&base, &cluster, &inputs, iters);
            let opt_s = bench_attention(&opt, &cluster, &inputs, iters);
            let label = format!("N={n} d={d} {b_r}x{b_c} {dtype}");
            println!(
                "{:<28} {:>12.3}ms {:>12.3}ms {:>9.2}x",
                label,
                base_s * 1e3,
                opt_s * 1e3,
                base_s / opt_s
            );
        }
    }

    println!("\n{:<28} {:>14} {:>14} {:>10}", "LayerNorm", "Scalar (ms)", "Blocked (ms)", "Speedup");
    println!("{}", "-".repeat(70));
    let shapes: &[(usize, usize, usize, usize)] = &[(1, 64, 64, 4), (4, 128, 128, 8), (8, 256, 64, 32)];
    for &(batch_size, seq_len, embeddings, n_tiles) in shapes {
        let base = LayerNormLayer {
            batch_size,
            seq_len,
            embeddings,
            n_tiles,
            baseline: true,
            eps: 1e-5,
            dtype: Precision::FP32,
        };
        let opt = LayerNormLayer { baseline: false, ..base.clone() };
        let input = datagen::layer_norm_input(&base, datagen::DEFAULT_SEED);
        let iters = 20;

        let base_s = bench_layernorm(&base, &cluster, &input, iters);
        let opt_s = bench_layernorm(&opt, &cluster, &input, iters);
        let label = format!("{batch_size}x{seq_len}x{embeddings} /{n_tiles}");
        println!(
            "{:<28} {:>12.3}ms {:>12.3}ms {:>9.2}x",
            label,
            base_s * 1e3,
            opt_s * 1e3,
            base_s / opt_s
        );
    }
}
