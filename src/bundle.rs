//! Image batches and candidate bundles
//!
//! All images are NHWC `f32` tensors in [0, 1]: grayscale batches carry one
//! channel, color batches three. A candidate bundle stacks N color
//! hypotheses for the same grayscale input along the channel axis, candidate
//! `i` occupying channels `3i..3i + 3`.

use crate::error::{Error, Result};
use ndarray::{s, Array4, ArrayView4, Axis};

/// Number of color hypotheses produced per grayscale input
pub const NUM_CANDIDATES: usize = 9;

/// Channels per color image
pub const RGB_CHANNELS: usize = 3;

/// One training batch: grayscale input with its color ground truth
#[derive(Debug, Clone)]
pub struct Batch {
    /// [batch, height, width, 1]
    pub gray: Array4<f32>,
    /// [batch, height, width, 3]
    pub color: Array4<f32>,
}

impl Batch {
    /// Pair a grayscale batch with its ground truth, checking the two line up
    pub fn new(gray: Array4<f32>, color: Array4<f32>) -> Result<Self> {
        let (gb, gh, gw, gc) = gray.dim();
        let (cb, ch, cw, cc) = color.dim();
        if gc != 1 || cc != RGB_CHANNELS {
            return Err(Error::Shape(format!(
                "expected 1 grayscale and 3 color channels, got {} and {}",
                gc, cc
            )));
        }
        if (gb, gh, gw) != (cb, ch, cw) {
            return Err(Error::Shape(format!(
                "grayscale batch {:?} does not match color batch {:?}",
                (gb, gh, gw),
                (cb, ch, cw)
            )));
        }
        Ok(Self { gray, color })
    }

    pub fn batch_size(&self) -> usize {
        self.gray.len_of(Axis(0))
    }
}

/// N color candidates concatenated along the channel axis
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBundle {
    data: Array4<f32>,
}

impl CandidateBundle {
    /// Wrap a [batch, height, width, 3N] tensor
    pub fn new(data: Array4<f32>) -> Result<Self> {
        let channels = data.len_of(Axis(3));
        if channels == 0 || channels % RGB_CHANNELS != 0 {
            return Err(Error::Shape(format!(
                "candidate bundle needs a positive multiple of 3 channels, got {}",
                channels
            )));
        }
        Ok(Self { data })
    }

    /// Concatenate 3-channel candidates back into one bundle
    pub fn from_candidates(candidates: &[Array4<f32>]) -> Result<Self> {
        if let Some(bad) = candidates.iter().find(|c| c.len_of(Axis(3)) != RGB_CHANNELS) {
            return Err(Error::Shape(format!(
                "candidates must have 3 channels, got {}",
                bad.len_of(Axis(3))
            )));
        }
        let views: Vec<_> = candidates.iter().map(|c| c.view()).collect();
        Self::new(ndarray::concatenate(Axis(3), &views)?)
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.data.len_of(Axis(3)) / RGB_CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View of candidate `i` as a [batch, height, width, 3] tensor
    pub fn candidate(&self, i: usize) -> ArrayView4<'_, f32> {
        debug_assert!(i < self.len(), "candidate {} out of range ({})", i, self.len());
        self.data
            .slice(s![.., .., .., i * RGB_CHANNELS..(i + 1) * RGB_CHANNELS])
    }

    /// Copy every candidate out of the bundle, in order
    pub fn split(&self) -> Vec<Array4<f32>> {
        (0..self.len()).map(|i| self.candidate(i).to_owned()).collect()
    }

    /// (batch, height, width, channels)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }
}
