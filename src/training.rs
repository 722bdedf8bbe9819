//! Training Loop
//!
//! One step per batch:
//! - generator forward: grayscale → bundle of N candidates
//! - perceptual loss and its gradient with respect to the bundle
//! - generator backward, optional global-norm clipping
//! - one Adam update (no gradient accumulation)
//!
//! Side effects between steps (metrics, previews, snapshots) are delegated to
//! a [`StepSink`].

use crate::bundle::{Batch, CandidateBundle};
use crate::data::BatchSource;
use crate::error::Result;
use crate::features::FeatureExtractor;
use crate::generator::Generator;
use crate::loss::{LossReport, PerceptualLoss};
use crate::optimizer::{clip_global_norm, Adam};
use tracing::{debug, info, warn};

/// Position of a step within the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    pub epoch: usize,
    /// Batch index within the epoch
    pub batch: usize,
    /// Global step counter
    pub step: usize,
}

/// Everything one step produced
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub report: LossReport,
    /// Candidates generated before the update
    pub bundle: CandidateBundle,
    /// Whether the optimizer update ran
    pub applied: bool,
}

/// Receives every finished step
pub trait StepSink<G> {
    fn on_step(
        &mut self,
        ctx: &StepContext,
        batch: &Batch,
        output: &StepOutput,
        generator: &G,
    ) -> Result<()>;
}

/// Sink that ignores every step
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl<G> StepSink<G> for NoopSink {
    fn on_step(&mut self, _: &StepContext, _: &Batch, _: &StepOutput, _: &G) -> Result<()> {
        Ok(())
    }
}

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub steps: usize,
    pub final_loss: f64,
    /// Lowest finite loss seen
    pub best_loss: f64,
    pub non_finite_steps: usize,
    pub losses: Vec<f64>,
}

impl TrainingSummary {
    fn new() -> Self {
        Self {
            steps: 0,
            final_loss: f64::INFINITY,
            best_loss: f64::INFINITY,
            non_finite_steps: 0,
            losses: Vec::new(),
        }
    }

    fn record(&mut self, report: &LossReport) {
        self.steps += 1;
        self.final_loss = report.loss;
        self.losses.push(report.loss);
        if report.is_finite() {
            self.best_loss = self.best_loss.min(report.loss);
        } else {
            self.non_finite_steps += 1;
        }
    }
}

/// Generator, loss and optimizer for one training run
pub struct TrainingLoop<G: Generator, E: FeatureExtractor> {
    /// The model being trained
    pub generator: G,
    pub loss: PerceptualLoss<E>,
    pub optimizer: Adam,
    /// Global gradient-norm limit
    pub grad_clip: Option<f32>,
    /// Leave the parameters untouched when the loss is NaN or infinite
    pub skip_non_finite: bool,
    /// Steps taken so far
    pub iteration: usize,
}

impl<G: Generator, E: FeatureExtractor> TrainingLoop<G, E> {
    pub fn new(generator: G, loss: PerceptualLoss<E>, learning_rate: f32) -> Self {
        Self {
            generator,
            loss,
            optimizer: Adam::new(learning_rate),
            grad_clip: None,
            skip_non_finite: true,
            iteration: 0,
        }
    }

    /// Forward, loss, backward and one update on a single batch
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let (bundle, tape) = self.generator.forward(&batch.gray)?;
        let (report, grad) = self
            .loss
            .compute_loss_and_grad(&bundle, &batch.color, &batch.gray)?;

        let applied = if !report.is_finite() && self.skip_non_finite {
            false
        } else {
            let mut grads = self.generator.backward(&tape, &grad)?;
            if let Some(max_norm) = self.grad_clip {
                let norm = clip_global_norm(&mut grads, max_norm);
                debug!(norm, max_norm, "gradient norm");
            }
            self.optimizer.step(self.generator.parameters_mut(), &grads)?;
            true
        };

        self.iteration += 1;
        Ok(StepOutput {
            report,
            bundle,
            applied,
        })
    }

    /// Train on `epochs - start_epoch` passes over `source`
    ///
    /// Every epoch pulls `source.num_batches()` batches.
    pub fn run_epochs<S, K>(
        &mut self,
        source: &mut S,
        start_epoch: usize,
        epochs: usize,
        sink: &mut K,
    ) -> Result<TrainingSummary>
    where
        S: BatchSource + ?Sized,
        K: StepSink<G> + ?Sized,
    {
        let num_batches = source.num_batches();
        let mut summary = TrainingSummary::new();

        for epoch in start_epoch..epochs {
            for batch_num in 0..num_batches {
                let batch = source.next_batch()?;
                let ctx = StepContext {
                    epoch,
                    batch: batch_num,
                    step: self.iteration,
                };
                let output = self.train_step(&batch)?;
                let report = &output.report;

                if report.is_finite() {
                    info!(
                        epoch,
                        batch = batch_num,
                        loss = report.loss,
                        loss_min = report.loss_min,
                        loss_mean = report.loss_mean,
                        "step"
                    );
                } else {
                    warn!(
                        epoch,
                        batch = batch_num,
                        loss = report.loss,
                        applied = output.applied,
                        "non-finite loss"
                    );
                }

                summary.record(report);
                sink.on_step(&ctx, &batch, &output, &self.generator)?;
            }
        }

        Ok(summary)
    }
}
