//! Colorizer training
//!
//! Trains the multi-candidate colorizer on `<data_dir>/images` with the VGG
//! perceptual loss. Expects the pretrained extractor at
//! `<data_dir>/vgg_19.ckpt`.
//!
//! Outputs go to `<output_dir>/<name>/`:
//! - `images/<epoch>_<batch>.jpg` previews
//! - `model.ckpt` latest snapshot
//! - `metrics.csv`

use anyhow::{Context, Result};
use clap::Parser;
use sgru_colorize::{default_experiment_name, run, TrainConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "train_colorizer")]
#[command(about = "Train a multi-hypothesis colorization network", long_about = None)]
struct Cli {
    /// Directory holding vgg_19.ckpt and an images/ folder
    data_dir: PathBuf,

    /// Directory to write the experiment into
    output_dir: PathBuf,

    /// Images per batch
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Number of training epochs
    #[arg(long, default_value_t = 100)]
    epochs: usize,

    /// Continue from the experiment's model.ckpt
    #[arg(long)]
    resume: bool,

    /// Save a preview and snapshot every this many batches
    #[arg(long, default_value_t = 50)]
    save_every: usize,

    /// Image decoding threads
    #[arg(long, default_value_t = 4)]
    num_cpus: usize,

    /// Log every candidate's loss to metrics.csv
    #[arg(long)]
    summarize: bool,

    /// Experiment name (default: timestamp)
    #[arg(long)]
    name: Option<String>,

    /// Training images are resized to this square size
    #[arg(long, default_value_t = 128)]
    image_size: usize,

    /// Width of the colorizer's hidden layers
    #[arg(long, default_value_t = 32)]
    hidden_channels: usize,

    /// Seed for weight init and shuffling
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Adam learning rate
    #[arg(long, default_value_t = 0.0004)]
    learning_rate: f32,

    /// Clip the global gradient norm to this value
    #[arg(long)]
    grad_clip: Option<f32>,
}

impl Cli {
    fn into_config(self) -> TrainConfig {
        let mut config = TrainConfig::new(self.data_dir, self.output_dir);
        config.name = self.name.unwrap_or_else(default_experiment_name);
        config.batch_size = self.batch_size;
        config.epochs = self.epochs;
        config.resume = self.resume;
        config.save_every = self.save_every;
        config.num_workers = self.num_cpus;
        config.summarize = self.summarize;
        config.image_size = self.image_size;
        config.hidden_channels = self.hidden_channels;
        config.seed = self.seed;
        config.learning_rate = self.learning_rate;
        config.grad_clip = self.grad_clip;
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config();

    println!("=== Colorizer Training ===\n");
    println!("Experiment: {}", config.experiment_dir().display());
    println!("  Batch size: {}", config.batch_size);
    println!("  Epochs: {}", config.epochs);
    println!("  Save every: {} batches", config.save_every);
    println!("  Loader threads: {}", config.num_workers);
    println!("  Learning rate: {}\n", config.learning_rate);

    let summary = run(&config).context("training failed")?;

    println!("\n=== Done ===");
    println!("  Steps: {}", summary.steps);
    println!("  Final loss: {:.4}", summary.final_loss);
    println!("  Best loss: {:.4}", summary.best_loss);
    if summary.non_finite_steps > 0 {
        println!("  Non-finite steps: {}", summary.non_finite_steps);
    }
    Ok(())
}
