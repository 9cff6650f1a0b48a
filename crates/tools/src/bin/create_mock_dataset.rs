//! Create a mock dataset blob for smoke runs
//!
//! Each example gets random classes for the four heads. Its features carry a
//! noisy copy of the label layout in the first 16 columns, so the reference
//! model can actually learn something. The remaining columns are pure noise.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use varcall_core::Dataset;
use varcall_core::codec::DEFAULT_BLOCK_ROWS;
use varcall_core::model::{Head, LABEL_WIDTH};

#[derive(Parser, Debug)]
#[command(name = "create_mock_dataset")]
#[command(about = "Write a synthetic, learnable dataset blob")]
struct Cli {
    /// Output path
    #[arg(short, long)]
    output: PathBuf,

    /// Number of examples
    #[arg(long, default_value_t = 1000)]
    total: usize,

    /// Features per example (at least 16)
    #[arg(long, default_value_t = 32)]
    feature_width: usize,

    /// Rows per compressed block
    #[arg(long, default_value_t = DEFAULT_BLOCK_ROWS)]
    block_rows: usize,

    /// Amplitude of the uniform feature noise
    #[arg(long, default_value_t = 0.5)]
    noise: f32,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.feature_width < LABEL_WIDTH {
        bail!("--feature-width must be at least {LABEL_WIDTH}, got {}", cli.feature_width);
    }

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(cli.seed);
    let mut features = Vec::with_capacity(cli.total * cli.feature_width);
    let mut labels = vec![0.0f32; cli.total * LABEL_WIDTH];
    let mut positions = Vec::with_capacity(cli.total);

    for i in 0..cli.total {
        let label = &mut labels[i * LABEL_WIDTH..(i + 1) * LABEL_WIDTH];
        for head in Head::ALL {
            let range = head.label_range();
            label[range.start + rng.random_range(0..head.classes())] = 1.0;
        }
        for j in 0..cli.feature_width {
            let signal = if j < LABEL_WIDTH { label[j] } else { 0.0 };
            features.push(signal + (rng.random::<f32>() * 2.0 - 1.0) * cli.noise);
        }
        positions.push(format!("chr{}:{}", 1 + i % 22, 10_000 + i * 37));
    }

    let dataset = Dataset::from_rows(&features, cli.feature_width, &labels, &positions, cli.block_rows)
        .context("failed to build dataset")?;
    dataset
        .save(&cli.output)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;

    log::info!(
        "Wrote {} examples ({} features each) to {}",
        dataset.total(),
        dataset.feature_width(),
        cli.output.display()
    );
    Ok(())
}
