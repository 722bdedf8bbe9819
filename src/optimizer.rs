//! Optimizers for training the colorizer

use crate::error::{Error, Result};
use ndarray::{ArrayD, ArrayViewMutD, Zip};

/// Default learning rate for colorizer training
pub const DEFAULT_LEARNING_RATE: f32 = 0.0004;

/// Adam optimizer over a fixed list of parameter tensors
///
/// With a non-zero `weight_decay` this becomes AdamW (decay applied directly
/// to the parameters, not through the gradient).
#[derive(Debug, Clone)]
pub struct Adam {
    /// Learning rate
    pub lr: f32,
    /// Beta1 for momentum
    pub beta1: f32,
    /// Beta2 for variance
    pub beta2: f32,
    /// Epsilon for numerical stability
    pub epsilon: f32,
    /// Decoupled weight decay
    pub weight_decay: f32,
    /// First moment estimates, one per parameter tensor
    m: Vec<ArrayD<f32>>,
    /// Second moment estimates
    v: Vec<ArrayD<f32>>,
    /// Time step
    t: usize,
}

impl Adam {
    /// Plain Adam with the usual defaults
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// Number of updates applied so far
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Update parameters given gradients
    ///
    /// `params` and `grads` must line up one-to-one and keep the same shapes
    /// across calls. Gradient clipping, if any, should be done before calling
    /// this method with [`clip_global_norm`].
    pub fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: &[ArrayD<f32>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(Error::Shape(format!(
                "optimizer got {} parameters but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        if let Some((i, (p, g))) = params
            .iter()
            .zip(grads.iter())
            .enumerate()
            .find(|(_, (p, g))| p.shape() != g.shape())
        {
            return Err(Error::Shape(format!(
                "parameter {} has shape {:?} but its gradient is {:?}",
                i,
                p.shape(),
                g.shape()
            )));
        }

        if self.m.is_empty() {
            self.m = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.v = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
        } else if self.m.len() != grads.len()
            || self.m.iter().zip(grads.iter()).any(|(m, g)| m.shape() != g.shape())
        {
            return Err(Error::Shape(
                "optimizer state does not match the parameter list".into(),
            ));
        }

        self.t += 1;
        let (beta1, beta2, eps, lr, wd) = (
            self.beta1,
            self.beta2,
            self.epsilon,
            self.lr,
            self.weight_decay,
        );
        let bias1 = 1.0 - beta1.powi(self.t as i32);
        let bias2 = 1.0 - beta2.powi(self.t as i32);

        for (((mut param, grad), m), v) in params
            .into_iter()
            .zip(grads.iter())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            Zip::from(&mut param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    // Update biased first moment estimate
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    // Update biased second raw moment estimate
                    *v = beta2 * *v + (1.0 - beta2) * g * g;

                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;

                    if wd != 0.0 {
                        *p *= 1.0 - lr * wd;
                    }
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }

        Ok(())
    }
}

/// Scale all gradients so their joint L2 norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_global_norm(grads: &mut [ArrayD<f32>], max_norm: f32) -> f32 {
    let norm = grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32;

    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for g in grads.iter_mut() {
            g.mapv_inplace(|x| x * scale);
        }
    }
    norm
}
