use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;

use tilecore_core::{ClusterConfig, KernelReport, Precision};
use tilecore_dnn::datagen::{self, AttentionInputs};
use tilecore_dnn::golden;
use tilecore_dnn::{AttentionLayer, LayerNormLayer};

const BANNER: &str = r#"
 _   _ _
| |_(_) | ___  ___ ___  _ __ ___
| __| | |/ _ \/ __/ _ \| '__/ _ \
| |_| | |  __/ (_| (_) | | |  __/
 \__|_|_|\___|\___\___/|_|  \___|"#;

#[derive(Parser)]
#[command(
    name = "tilecore",
    about = "Tiled multi-core kernel engine",
    long_about = "Runs FlashAttention-2 and LayerNorm on a simulated cluster of one mover\nand several calculator cores sharing a bounded scratchpad, and checks the\nresult against a double-precision golden model.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ClusterArgs {
    /// Number of clusters
    #[arg(long, default_value = "1")]
    clusters: usize,
    /// Calculator cores per cluster
    #[arg(long, default_value = "8")]
    cores: usize,
    /// Scratchpad capacity per cluster, in bytes
    #[arg(long, default_value = "131072")]
    scratchpad: usize,
    /// Seed of the generated inputs
    #[arg(long, default_value_t = datagen::DEFAULT_SEED)]
    seed: u64,
    /// Write the output tensor as little-endian f32 to this file
    #[arg(long)]
    output: Option<PathBuf>,
}

impl ClusterArgs {
    fn config(&self) -> ClusterConfig {
        ClusterConfig {
            n_clusters: self.clusters,
            compute_cores: self.cores,
            scratchpad_bytes: self.scratchpad,
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the default cluster and supported precisions
    Info,
    /// Run FlashAttention-2 from a JSON parameter file
    Attention {
        /// Parameter file with N, d, B_r, B_c, dtype, baseline
        #[arg(long)]
        params: PathBuf,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Run LayerNorm from a JSON parameter file
    Layernorm {
        /// Parameter file with batch_size, seq_len, embeddings, n_tiles, baseline, eps, dtype
        #[arg(long)]
        params: PathBuf,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Attention { params, cluster } => cmd_attention(&params, &cluster),
        Commands::Layernorm { params, cluster } => cmd_layernorm(&params, &cluster),
    }
}

fn cmd_info() {
    println!("{}", BANNER);
    println!("  v{}\n", env!("CARGO_PKG_VERSION"));

    let config = ClusterConfig::default();
    println!("Default cluster");
    println!("  clusters:    {}", config.n_clusters);
    println!("  movers:      1 per cluster");
    println!("  calculators: {} per cluster", config.compute_cores);
    println!("  scratchpad:  {} KiB per cluster", config.scratchpad_bytes / 1024);

    println!("\nPrecisions");
    for p in [Precision::FP64, Precision::FP32, Precision::FP16, Precision::FP8] {
        let mark = if p.is_supported() { "[x]" } else { "[ ]" };
        println!("  {} {:<5} {} byte(s)", mark, p.to_string(), p.size_bytes());
    }

    println!("\nKernels");
    println!("  attention   FlashAttention-2 forward, online softmax over column tiles");
    println!("  layernorm   row mean/variance normalization, scalar or blocked reduction");
}

fn read_params<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn cmd_attention(params: &Path, args: &ClusterArgs) -> Result<()> {
    let layer: AttentionLayer = read_params(params)?;
    let config = args.config();
    let footprint = layer.footprint(&config).context("invalid attention configuration")?;
    println!(
        "attention N={} d={} B_r={} B_c={} {} ({}), scratchpad {} / {} bytes",
        layer.n,
        layer.d,
        layer.b_r,
        layer.b_c,
        layer.dtype,
        if layer.baseline { "baseline" } else { "optimized" },
        footprint,
        config.scratchpad_bytes
    );

    let inputs = AttentionInputs::generate(&layer, args.seed);
    tracing::info!("generated {} x {} inputs with seed {}", layer.n, layer.d, args.seed);
    let start = Instant::now();
    let (out, report) = layer.run(&config, &inputs.q, &inputs.k, &inputs.v)?;
    let wall = start.elapsed();

    let expected = golden::attention_reference(&inputs.q, &inputs.k, &inputs.v, layer.n, layer.d);
    finish(&out, &expected, tolerance(layer.dtype), &report, wall, args.output.as_deref())
}

fn cmd_layernorm(params: &Path, args: &ClusterArgs) -> Result<()> {
    let layer: LayerNormLayer = read_params(params)?;
    let config = args.config();
    let footprint = layer.footprint(&config).context("invalid layernorm configuration")?;
    println!(
        "layernorm {}x{}x{} in {} tiles, eps {} {} ({}), scratchpad {} / {} bytes",
        layer.batch_size,
        layer.seq_len,
        layer.embeddings,
        layer.n_tiles,
        layer.eps,
        layer.dtype,
        if layer.baseline { "baseline" } else { "optimized" },
        footprint,
        config.scratchpad_bytes
    );

    let input = datagen::layer_norm_input(&layer, args.seed);
    tracing::info!("generated {} inputs with seed {}", input.len(), args.seed);
    let start = Instant::now();
    let (out, report) = layer.run(&config, &input)?;
    let wall = start.elapsed();

    let rows = layer.batch_size * layer.seq_len;
    let expected = golden::layer_norm_reference(&input, rows, layer.embeddings, layer.eps);
    finish(&out, &expected, tolerance(layer.dtype), &report, wall, args.output.as_deref())
}

fn tolerance(precision: Precision) -> f32 {
    match precision {
        Precision::FP16 => 2e-2,
        _ => 1e-4,
    }
}

fn finish(
    out: &[f32],
    expected: &[f32],
    tol: f32,
    report: &KernelReport,
    wall: std::time::Duration,
    output: Option<&Path>,
) -> Result<()> {
    println!("{}", report);
    println!("  wall {:.3} ms", wall.as_secs_f64() * 1e3);

    if let Some(path) = output {
        std::fs::write(path, bytemuck::cast_slice::<f32, u8>(out))
            .with_context(|| format!("writing {}", path.display()))?;
        println!("  wrote {} values to {}", out.len(), path.display());
    }

    let err = golden::max_abs_diff(out, expected);
    println!("  max abs error vs golden: {:.3e} (tolerance {:.0e})", err, tol);
    if err > tol {
        bail!("output differs from golden model by {err}");
    }
    println!("  PASS");
    Ok(())
}
