//! Multi-hypothesis colorization trained with a VGG perceptual loss
//!
//! A generator maps a grayscale image to N candidate colorizations. Every
//! candidate is scored against the ground truth on pixels and on five VGG
//! feature layers (masked by the grayscale input), and the loss blends the
//! best candidate's score with the mean:
//! `0.999 · min + 0.001 · mean`.
//!
//! Modules:
//! - `nn`: NHWC conv / ReLU / pooling / resize kernels with backward passes
//! - `bundle`: image batches and candidate bundles
//! - `features`: frozen VGG feature extractor
//! - `generator`: colorization model
//! - `loss`: perceptual loss engine
//! - `optimizer`: Adam
//! - `data`: worker-pool image loading
//! - `training`: step loop; `trainer`: full session wiring
//! - `visualize`, `checkpoint`, `metrics`: per-step side effects
//! - `config`, `error`

pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod generator;
pub mod loss;
pub mod metrics;
pub mod nn;
pub mod optimizer;
pub mod trainer;
pub mod training;
pub mod visualize;

pub use bundle::{Batch, CandidateBundle, NUM_CANDIDATES, RGB_CHANNELS};
pub use checkpoint::{load_tensor_file, save_tensor_file, ModelCheckpoint, TensorMap, TensorRecord};
pub use config::{default_experiment_name, TrainConfig, CHECKPOINT_FILE, PRETRAINED_FILE};
pub use data::{BatchSource, ImageFolderSource, InMemorySource, LoaderConfig};
pub use error::{Error, Result, VGG19_WEIGHTS_URL};
pub use features::{
    ensure_pretrained, FeatureExtractor, FeatureMap, FeatureMaps, VggConfig, VggExtractor,
};
pub use generator::{ColorizerConfig, ConvColorizer, Generator};
pub use loss::{blend, LossReport, PerceptualLoss, LAYER_WEIGHTS};
pub use metrics::MetricsWriter;
pub use optimizer::{clip_global_norm, Adam, DEFAULT_LEARNING_RATE};
pub use trainer::{run, ExperimentSink};
pub use training::{NoopSink, StepContext, StepOutput, StepSink, TrainingLoop, TrainingSummary};
pub use visualize::{save_visualization, tile_visualization};
