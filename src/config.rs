//! Training session configuration

use crate::bundle::NUM_CANDIDATES;
use crate::data::LoaderConfig;
use crate::error::{Error, Result};
use crate::features::VggConfig;
use crate::generator::ColorizerConfig;
use crate::optimizer::DEFAULT_LEARNING_RATE;
use std::path::PathBuf;

/// File name of the pretrained extractor weights inside the data directory
pub const PRETRAINED_FILE: &str = "vgg_19.ckpt";

/// File name of the model snapshot inside the experiment directory
pub const CHECKPOINT_FILE: &str = "model.ckpt";

/// Timestamped experiment name, e.g. `sgru-2024-01-31-12-00-00-123456`
pub fn default_experiment_name() -> String {
    chrono::Local::now()
        .format("sgru-%Y-%m-%d-%H-%M-%S-%6f")
        .to_string()
}

/// Every knob of a training session
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Holds `vgg_19.ckpt` and an `images/` folder
    pub data_dir: PathBuf,
    /// Parent of the experiment directory
    pub output_dir: PathBuf,
    /// Experiment directory name under `output_dir`
    pub name: String,
    pub batch_size: usize,
    pub epochs: usize,
    /// Continue from `model.ckpt` if the experiment directory has one
    pub resume: bool,
    /// Visualize and snapshot whenever `batch % save_every == 0`
    pub save_every: usize,
    /// Image decoding threads
    pub num_workers: usize,
    /// Decoded batches allowed to wait
    pub prefetch: usize,
    /// Log every candidate's loss in the metrics file
    pub summarize: bool,
    pub image_size: usize,
    /// Random horizontal flips of training images
    pub flip: bool,
    pub hidden_channels: usize,
    pub num_candidates: usize,
    pub learning_rate: f32,
    /// Global gradient-norm limit (None = no clipping)
    pub grad_clip: Option<f32>,
    pub seed: u64,
    /// Skip the update when the loss is NaN or infinite
    pub skip_non_finite: bool,
    /// Architecture of the frozen extractor
    pub extractor: VggConfig,
}

impl TrainConfig {
    /// Defaults for the given directories, named after the current time
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
            name: default_experiment_name(),
            batch_size: 1,
            epochs: 100,
            resume: false,
            save_every: 50,
            num_workers: 4,
            prefetch: 2,
            summarize: false,
            image_size: 128,
            flip: false,
            hidden_channels: 32,
            num_candidates: NUM_CANDIDATES,
            learning_rate: DEFAULT_LEARNING_RATE,
            grad_clip: None,
            seed: 0,
            skip_non_finite: true,
            extractor: VggConfig::vgg19(),
        }
    }

    /// Small, fast settings for smoke runs
    pub fn tiny(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            epochs: 1,
            save_every: 1,
            num_workers: 2,
            prefetch: 1,
            image_size: 16,
            hidden_channels: 4,
            extractor: VggConfig::tiny(),
            ..Self::new(data_dir, output_dir)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch size", self.batch_size),
            ("epochs", self.epochs),
            ("save_every", self.save_every),
            ("worker count", self.num_workers),
            ("prefetch depth", self.prefetch),
            ("image size", self.image_size),
            ("hidden channels", self.hidden_channels),
            ("candidate count", self.num_candidates),
        ];
        if let Some((what, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{} must be positive", what)));
        }
        if self.name.is_empty() {
            return Err(Error::Config("experiment name must not be empty".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(clip) = self.grad_clip {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(Error::Config(format!(
                    "gradient clip must be positive, got {}",
                    clip
                )));
            }
        }
        self.extractor.validate()?;
        let min_size = self.extractor.min_image_size();
        if self.image_size < min_size {
            return Err(Error::Config(format!(
                "image size {} is too small for the extractor (needs at least {})",
                self.image_size, min_size
            )));
        }
        Ok(())
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.output_dir.join(&self.name)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.experiment_dir().join("images")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.experiment_dir().join(CHECKPOINT_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.experiment_dir().join("metrics.csv")
    }

    pub fn pretrained_path(&self) -> PathBuf {
        self.data_dir.join(PRETRAINED_FILE)
    }

    /// Root of the training images
    pub fn image_root(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// `images/<epoch>_<batch>.jpg`
    pub fn visualization_path(&self, epoch: usize, batch: usize) -> PathBuf {
        self.images_dir().join(format!("{}_{}.jpg", epoch, batch))
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            num_workers: self.num_workers,
            image_size: self.image_size,
            prefetch: self.prefetch,
            flip: self.flip,
            seed: self.seed,
        }
    }

    pub fn colorizer_config(&self) -> ColorizerConfig {
        ColorizerConfig {
            hidden_channels: self.hidden_channels,
            num_candidates: self.num_candidates,
            seed: self.seed,
        }
    }
}
