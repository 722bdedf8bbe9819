//! Perceptual loss over a bundle of candidate colorizations
//!
//! Each candidate is compared with the ground truth at every layer the
//! feature extractor reports (raw pixels first, then increasingly deep
//! activations):
//!
//! ```text
//! L_i = Σ_layers  w_l · Σ mask_l · |φ_l(candidate_i) − φ_l(truth)|
//! ```
//!
//! where `mask_l` is the grayscale input bilinearly resampled to the layer's
//! resolution. The per-candidate losses are then blended as
//! `0.999 · min_i L_i + 0.001 · mean_i L_i`: the best hypothesis carries
//! almost all of the signal while the mean term keeps every candidate
//! receiving some gradient.
//!
//! No normalization by image size is applied, so loss values scale with the
//! number of pixels.

use crate::bundle::CandidateBundle;
use crate::error::{Error, Result};
use crate::features::{FeatureExtractor, FeatureMaps};
use crate::nn::resize_bilinear;
use ndarray::{Array4, Axis, Zip};
use rayon::prelude::*;
use std::sync::Arc;

/// Per-layer weights: input pixels, then conv1_2 .. conv5_2
pub const LAYER_WEIGHTS: [f32; 6] = [0.88, 0.79, 0.63, 0.51, 0.39, 1.07];

/// Share of the best candidate's loss in the blended loss
pub const MIN_WEIGHT: f64 = 0.999;

/// Share of the mean candidate loss in the blended loss
pub const MEAN_WEIGHT: f64 = 0.001;

/// Scalars produced by one loss evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct LossReport {
    /// Blended loss
    pub loss: f64,
    pub loss_min: f64,
    pub loss_mean: f64,
    /// Loss of every candidate, in bundle order
    pub candidate_losses: Vec<f64>,
    /// Index of the (first) lowest-loss candidate
    pub best_candidate: usize,
}

impl LossReport {
    pub fn from_candidate_losses(candidate_losses: Vec<f64>) -> Self {
        let (loss, loss_min, loss_mean) = blend(&candidate_losses);
        let best_candidate = candidate_losses
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, &l)| match best {
                Some((_, b)) if b <= l => best,
                _ => Some((i, l)),
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        Self {
            loss,
            loss_min,
            loss_mean,
            candidate_losses,
            best_candidate,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
    }
}

/// Blend per-candidate losses into `(loss, min, mean)`
///
/// Any NaN input makes all three NaN.
pub fn blend(losses: &[f64]) -> (f64, f64, f64) {
    if losses.is_empty() || losses.iter().any(|l| l.is_nan()) {
        return (f64::NAN, f64::NAN, f64::NAN);
    }
    let min = losses.iter().copied().fold(f64::INFINITY, f64::min);
    let mean = losses.iter().sum::<f64>() / losses.len() as f64;
    (MIN_WEIGHT * min + MEAN_WEIGHT * mean, min, mean)
}

/// d(blended loss) / d(candidate loss), for every candidate
///
/// Candidates tied for the minimum share the min term equally.
pub fn blend_coefficients(losses: &[f64]) -> Vec<f64> {
    if losses.is_empty() {
        return Vec::new();
    }
    let (_, min, _) = blend(losses);
    let mean_share = MEAN_WEIGHT / losses.len() as f64;
    let ties = losses.iter().filter(|&&l| l == min).count();

    losses
        .iter()
        .map(|&l| {
            if ties > 0 && l == min {
                MIN_WEIGHT / ties as f64 + mean_share
            } else {
                mean_share
            }
        })
        .collect()
}

fn broadcast_mask<'a>(
    mask: &'a Array4<f32>,
    like: &Array4<f32>,
) -> Result<ndarray::ArrayView4<'a, f32>> {
    mask.broadcast(like.raw_dim()).ok_or_else(|| {
        Error::Shape(format!(
            "mask {:?} cannot cover activation {:?}",
            mask.dim(),
            like.dim()
        ))
    })
}

/// `weight · Σ mask · |fake − real|` over batch, space and channels
pub fn layer_loss(
    fake: &Array4<f32>,
    real: &Array4<f32>,
    mask: &Array4<f32>,
    weight: f32,
) -> Result<f64> {
    if fake.dim() != real.dim() {
        return Err(Error::Shape(format!(
            "candidate activation {:?} does not match ground truth {:?}",
            fake.dim(),
            real.dim()
        )));
    }
    let mask = broadcast_mask(mask, fake)?;
    let sum = Zip::from(fake)
        .and(real)
        .and(&mask)
        .fold(0.0f64, |acc, &f, &r, &m| acc + (m * (f - r).abs()) as f64);
    Ok(weight as f64 * sum)
}

/// Gradient of `scale · weight · Σ mask · |fake − real|` with respect to `fake`
///
/// Uses `sign(0) = 0`; the mask is treated as a constant.
pub fn layer_grad(
    fake: &Array4<f32>,
    real: &Array4<f32>,
    mask: &Array4<f32>,
    weight: f32,
    scale: f32,
) -> Result<Array4<f32>> {
    let mask = broadcast_mask(mask, fake)?;
    let factor = weight * scale;
    Ok(Zip::from(fake)
        .and(real)
        .and(&mask)
        .map_collect(|&f, &r, &m| {
            let diff = f - r;
            let sign = if diff > 0.0 {
                1.0
            } else if diff < 0.0 {
                -1.0
            } else {
                0.0
            };
            factor * m * sign
        }))
}

/// Perceptual loss engine bound to one frozen extractor
pub struct PerceptualLoss<E: FeatureExtractor> {
    extractor: Arc<E>,
    weights: Vec<f32>,
}

impl<E: FeatureExtractor> PerceptualLoss<E> {
    /// Use the default [`LAYER_WEIGHTS`]; the extractor must report six layers
    pub fn new(extractor: Arc<E>) -> Result<Self> {
        Self::with_weights(extractor, LAYER_WEIGHTS.to_vec())
    }

    pub fn with_weights(extractor: Arc<E>, weights: Vec<f32>) -> Result<Self> {
        let layers = extractor.layer_names();
        if weights.len() != layers.len() {
            return Err(Error::Config(format!(
                "{} loss weights given for {} feature layers",
                weights.len(),
                layers.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Config(
                "loss weights must be finite and non-negative".into(),
            ));
        }
        Ok(Self { extractor, weights })
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn extractor(&self) -> &Arc<E> {
        &self.extractor
    }

    fn check_inputs(
        bundle: &CandidateBundle,
        real: &Array4<f32>,
        gray: &Array4<f32>,
    ) -> Result<()> {
        let (b, h, w, _) = bundle.dim();
        if real.dim() != (b, h, w, 3) {
            return Err(Error::Shape(format!(
                "ground truth {:?} does not match bundle {:?}",
                real.dim(),
                bundle.dim()
            )));
        }
        if gray.dim() != (b, h, w, 1) {
            return Err(Error::Shape(format!(
                "grayscale mask {:?} does not match bundle {:?}",
                gray.dim(),
                bundle.dim()
            )));
        }
        Ok(())
    }

    /// Grayscale mask resampled to every layer's resolution
    fn layer_masks(gray: &Array4<f32>, real_maps: &FeatureMaps) -> Vec<Array4<f32>> {
        real_maps
            .iter()
            .map(|m| {
                let (_, h, w, _) = m.activation.dim();
                resize_bilinear(gray, h, w)
            })
            .collect()
    }

    fn candidate_loss(
        &self,
        fake_maps: &FeatureMaps,
        real_maps: &FeatureMaps,
        masks: &[Array4<f32>],
    ) -> Result<f64> {
        if fake_maps.len() != real_maps.len() {
            return Err(Error::Shape(format!(
                "candidate produced {} feature maps, ground truth {}",
                fake_maps.len(),
                real_maps.len()
            )));
        }
        fake_maps
            .iter()
            .zip(real_maps.iter())
            .zip(masks.iter().zip(self.weights.iter()))
            .map(|((fake, real), (mask, &weight))| {
                layer_loss(&fake.activation, &real.activation, mask, weight)
            })
            .sum()
    }

    /// Score every candidate against the ground truth and blend
    pub fn compute_loss(
        &self,
        bundle: &CandidateBundle,
        real: &Array4<f32>,
        gray: &Array4<f32>,
    ) -> Result<LossReport> {
        Self::check_inputs(bundle, real, gray)?;

        // Ground-truth features are shared by every candidate
        let real_maps = self.extractor.extract(real)?;
        let masks = Self::layer_masks(gray, &real_maps);

        let losses = (0..bundle.len())
            .into_par_iter()
            .map(|i| {
                let fake = bundle.candidate(i).to_owned();
                let fake_maps = self.extractor.extract(&fake)?;
                self.candidate_loss(&fake_maps, &real_maps, &masks)
            })
            .collect::<Result<Vec<f64>>>()?;

        Ok(LossReport::from_candidate_losses(losses))
    }

    /// Loss plus its gradient with respect to the whole bundle
    ///
    /// The returned tensor has the bundle's shape; candidate `i`'s slice is
    /// scaled by its blend coefficient.
    pub fn compute_loss_and_grad(
        &self,
        bundle: &CandidateBundle,
        real: &Array4<f32>,
        gray: &Array4<f32>,
    ) -> Result<(LossReport, Array4<f32>)> {
        Self::check_inputs(bundle, real, gray)?;

        let real_maps = self.extractor.extract(real)?;
        let masks = Self::layer_masks(gray, &real_maps);

        let forward = (0..bundle.len())
            .into_par_iter()
            .map(|i| {
                let fake = bundle.candidate(i).to_owned();
                let (fake_maps, tape) = self.extractor.extract_with_tape(&fake)?;
                let loss = self.candidate_loss(&fake_maps, &real_maps, &masks)?;
                Ok((loss, fake_maps, tape))
            })
            .collect::<Result<Vec<_>>>()?;

        let losses: Vec<f64> = forward.iter().map(|(loss, _, _)| *loss).collect();
        let coefficients = blend_coefficients(&losses);
        let report = LossReport::from_candidate_losses(losses);

        let candidate_grads = forward
            .into_par_iter()
            .zip(coefficients.into_par_iter())
            .map(|((_, fake_maps, tape), coefficient)| {
                let layer_grads = fake_maps
                    .iter()
                    .zip(real_maps.iter())
                    .zip(masks.iter().zip(self.weights.iter()))
                    .map(|((fake, real), (mask, &weight))| {
                        layer_grad(
                            &fake.activation,
                            &real.activation,
                            mask,
                            weight,
                            coefficient as f32,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.extractor.backward(&tape, &layer_grads)
            })
            .collect::<Result<Vec<_>>>()?;

        let views: Vec<_> = candidate_grads.iter().map(|g| g.view()).collect();
        let grad = ndarray::concatenate(Axis(3), &views)?;
        Ok((report, grad))
    }
}
