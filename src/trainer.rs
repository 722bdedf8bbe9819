//! Training session wiring
//!
//! [`run`] turns a [`TrainConfig`] into a full run:
//! 1. check the pretrained extractor weights exist (before touching the
//!    output directory or starting any loader thread)
//! 2. build the extractor, loss and generator, restoring a snapshot when
//!    resuming
//! 3. open the image folder and create the experiment directory
//! 4. train, logging metrics every step and writing a preview plus a model
//!    snapshot whenever `batch % save_every == 0`

use crate::bundle::Batch;
use crate::checkpoint::ModelCheckpoint;
use crate::config::TrainConfig;
use crate::data::ImageFolderSource;
use crate::error::{Error, Result};
use crate::features::{ensure_pretrained, VggExtractor};
use crate::generator::{ConvColorizer, Generator};
use crate::loss::PerceptualLoss;
use crate::metrics::MetricsWriter;
use crate::training::{StepContext, StepOutput, StepSink, TrainingLoop, TrainingSummary};
use crate::visualize::save_visualization;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Metrics, previews and snapshots for one experiment directory
pub struct ExperimentSink<'a> {
    config: &'a TrainConfig,
    metrics: MetricsWriter,
    started: Instant,
}

impl<'a> ExperimentSink<'a> {
    /// Expects the experiment directory to exist
    pub fn new(config: &'a TrainConfig) -> Result<Self> {
        let columns = config.summarize.then_some(config.num_candidates);
        Ok(Self {
            config,
            metrics: MetricsWriter::open(&config.metrics_path(), columns)?,
            started: Instant::now(),
        })
    }
}

impl<G: Generator> StepSink<G> for ExperimentSink<'_> {
    fn on_step(
        &mut self,
        ctx: &StepContext,
        batch: &Batch,
        output: &StepOutput,
        generator: &G,
    ) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.metrics
            .write_step(ctx.step, ctx.epoch, ctx.batch, &output.report, elapsed)?;

        if ctx.batch % self.config.save_every == 0 {
            let image_path = self.config.visualization_path(ctx.epoch, ctx.batch);
            save_visualization(&image_path, &output.bundle, &batch.color, &batch.gray)?;

            let checkpoint = ModelCheckpoint {
                epoch: ctx.epoch,
                batch: ctx.batch,
                step: ctx.step,
                tensors: generator.state_dict(),
            };
            let checkpoint_path = self.config.checkpoint_path();
            checkpoint.save(&checkpoint_path)?;
            info!(
                image = %image_path.display(),
                checkpoint = %checkpoint_path.display(),
                "saved preview and snapshot"
            );
        }
        Ok(())
    }
}

/// Restore `generator` from the experiment's snapshot, if there is one
fn resume(config: &TrainConfig, generator: &mut ConvColorizer) -> Result<Option<ModelCheckpoint>> {
    let path = config.checkpoint_path();
    if !path.is_file() {
        info!(path = %path.display(), "no snapshot to resume from, starting fresh");
        return Ok(None);
    }
    let checkpoint = ModelCheckpoint::load(&path)?;
    generator.load_state_dict(&checkpoint.tensors)?;
    info!(
        path = %path.display(),
        epoch = checkpoint.epoch,
        step = checkpoint.step,
        "resumed from snapshot"
    );
    Ok(Some(checkpoint))
}

/// Run a full training session
pub fn run(config: &TrainConfig) -> Result<TrainingSummary> {
    config.validate()?;

    let pretrained = config.pretrained_path();
    ensure_pretrained(&pretrained)?;

    let extractor = Arc::new(VggExtractor::from_checkpoint(
        config.extractor.clone(),
        &pretrained,
        config.seed,
    )?);
    let loss = PerceptualLoss::new(extractor)?;
    let mut generator = ConvColorizer::new(&config.colorizer_config())?;

    let resumed = if config.resume {
        resume(config, &mut generator)?
    } else {
        None
    };

    let mut source = ImageFolderSource::open(&config.image_root(), config.loader_config())?;

    let images_dir = config.images_dir();
    std::fs::create_dir_all(&images_dir).map_err(|e| Error::io(&images_dir, e))?;

    let mut training = TrainingLoop::new(generator, loss, config.learning_rate);
    training.grad_clip = config.grad_clip;
    training.skip_non_finite = config.skip_non_finite;
    let start_epoch = match &resumed {
        Some(checkpoint) => {
            training.iteration = checkpoint.step + 1;
            checkpoint.epoch
        }
        None => 0,
    };

    info!(
        experiment = %config.experiment_dir().display(),
        batch_size = config.batch_size,
        epochs = config.epochs,
        start_epoch,
        learning_rate = config.learning_rate,
        candidates = config.num_candidates,
        "starting training"
    );

    let mut sink = ExperimentSink::new(config)?;
    let summary = training.run_epochs(&mut source, start_epoch, config.epochs, &mut sink)?;

    info!(
        steps = summary.steps,
        final_loss = summary.final_loss,
        best_loss = summary.best_loss,
        non_finite = summary.non_finite_steps,
        "training finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use tempfile::tempdir;

    fn write_dataset(data_dir: &Path, images: u8) {
        let image_dir = data_dir.join("images");
        std::fs::create_dir_all(&image_dir).unwrap();
        for i in 0..images {
            let img = RgbImage::from_fn(20, 20, |x, y| {
                Rgb([(x * 12) as u8, (y * 12) as u8, i.wrapping_mul(70)])
            });
            img.save(image_dir.join(format!("{}.png", i))).unwrap();
        }
        // No tensors: the extractor keeps its seeded initialization
        std::fs::write(data_dir.join("vgg_19.ckpt"), "{}").unwrap();
    }

    fn tiny_config(root: &Path) -> TrainConfig {
        let mut config = TrainConfig::tiny(root.join("data"), root.join("out"));
        config.name = "test".into();
        config.save_every = 2;
        config.num_candidates = 2;
        config
    }

    #[test]
    fn test_missing_pretrained_fails_before_output() {
        let root = tempdir().unwrap();
        let config = tiny_config(root.path());
        std::fs::create_dir_all(config.image_root()).unwrap();

        let err = run(&config).unwrap_err();
        assert!(matches!(err, Error::MissingCheckpoint { .. }));
        assert!(err.to_string().contains("vgg_19.ckpt"));
        assert!(!config.output_dir.exists());
    }

    #[test]
    fn test_end_to_end_run_writes_outputs() {
        let root = tempdir().unwrap();
        let config = tiny_config(root.path());
        write_dataset(&config.data_dir, 3);

        let summary = run(&config).unwrap();
        assert_eq!(summary.steps, 3);
        assert!(summary.final_loss.is_finite());

        assert!(config.visualization_path(0, 0).is_file());
        assert!(!config.visualization_path(0, 1).exists());
        assert!(config.visualization_path(0, 2).is_file());

        let checkpoint = ModelCheckpoint::load(&config.checkpoint_path()).unwrap();
        assert_eq!((checkpoint.epoch, checkpoint.batch, checkpoint.step), (0, 2, 2));

        let metrics = std::fs::read_to_string(config.metrics_path()).unwrap();
        assert_eq!(metrics.lines().count(), 4);
    }

    #[test]
    fn test_resume_continues_from_snapshot() {
        let root = tempdir().unwrap();
        let mut config = tiny_config(root.path());
        write_dataset(&config.data_dir, 2);
        run(&config).unwrap();

        config.resume = true;
        config.epochs = 2;
        let summary = run(&config).unwrap();

        // Restarts the saved epoch (0) and runs through epoch 1
        assert_eq!(summary.steps, 4);
        let checkpoint = ModelCheckpoint::load(&config.checkpoint_path()).unwrap();
        // Step counter continues after the restored step 0
        assert_eq!((checkpoint.epoch, checkpoint.batch, checkpoint.step), (1, 0, 3));

        let metrics = std::fs::read_to_string(config.metrics_path()).unwrap();
        assert_eq!(metrics.lines().count(), 1 + 2 + 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let root = tempdir().unwrap();
        let mut config = tiny_config(root.path());
        config.batch_size = 0;
        assert!(matches!(run(&config), Err(Error::Config(_))));
    }
}
