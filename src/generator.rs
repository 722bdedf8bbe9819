//! Colorization generator
//!
//! The training loop only relies on the [`Generator`] contract: one
//! grayscale batch in, a bundle of N color candidates out with the same
//! spatial size, plus a backward pass that yields one gradient per
//! parameter tensor.

use crate::bundle::{CandidateBundle, NUM_CANDIDATES, RGB_CHANNELS};
use crate::checkpoint::TensorMap;
use crate::error::{Error, Result};
use crate::nn::{relu_backward, relu_inplace, Conv2d};
use ndarray::{Array4, ArrayD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Grayscale → N color hypotheses
pub trait Generator: Send {
    /// Intermediate state the backward pass needs
    type Tape;

    fn num_candidates(&self) -> usize;

    /// [batch, height, width, 1] → bundle of [batch, height, width, 3N]
    fn forward(&self, gray: &Array4<f32>) -> Result<(CandidateBundle, Self::Tape)>;

    /// Gradients aligned with [`parameters_mut`](Self::parameters_mut)
    fn backward(&self, tape: &Self::Tape, grad: &Array4<f32>) -> Result<Vec<ArrayD<f32>>>;

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;

    fn state_dict(&self) -> TensorMap;

    fn load_state_dict(&mut self, tensors: &TensorMap) -> Result<()>;
}

/// Size and seed of a [`ConvColorizer`]
#[derive(Debug, Clone, PartialEq)]
pub struct ColorizerConfig {
    pub hidden_channels: usize,
    pub num_candidates: usize,
    pub seed: u64,
}

impl Default for ColorizerConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 32,
            num_candidates: NUM_CANDIDATES,
            seed: 0,
        }
    }
}

const LAYER_NAMES: [&str; 3] = ["colorizer/conv1", "colorizer/conv2", "colorizer/rgb"];

/// Three 3×3 conv layers with a luminance skip
///
/// `out = conv_rgb(relu(conv2(relu(conv1(gray))))) + gray`, the grayscale
/// value added to every output channel so an untrained model starts from
/// the black-and-white image.
#[derive(Debug, Clone)]
pub struct ConvColorizer {
    num_candidates: usize,
    layers: [Conv2d; 3],
}

/// Saved activations of one colorizer forward pass
#[derive(Debug, Clone)]
pub struct ColorizerTape {
    gray: Array4<f32>,
    hidden1: Array4<f32>,
    hidden2: Array4<f32>,
}

impl ConvColorizer {
    pub fn new(config: &ColorizerConfig) -> Result<Self> {
        if config.hidden_channels == 0 || config.num_candidates == 0 {
            return Err(Error::Config(
                "colorizer needs at least one hidden channel and one candidate".into(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let hidden = config.hidden_channels;
        let out = RGB_CHANNELS * config.num_candidates;
        Ok(Self {
            num_candidates: config.num_candidates,
            layers: [
                Conv2d::he_uniform(3, 1, hidden, &mut rng),
                Conv2d::he_uniform(3, hidden, hidden, &mut rng),
                Conv2d::he_uniform(3, hidden, out, &mut rng),
            ],
        })
    }
}

impl Generator for ConvColorizer {
    type Tape = ColorizerTape;

    fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    fn forward(&self, gray: &Array4<f32>) -> Result<(CandidateBundle, ColorizerTape)> {
        if gray.len_of(Axis(3)) != 1 {
            return Err(Error::Shape(format!(
                "colorizer expects single-channel input, got {} channels",
                gray.len_of(Axis(3))
            )));
        }

        let [conv1, conv2, rgb] = &self.layers;
        let mut hidden1 = conv1.forward(gray)?;
        relu_inplace(&mut hidden1);
        let mut hidden2 = conv2.forward(&hidden1)?;
        relu_inplace(&mut hidden2);
        let mut out = rgb.forward(&hidden2)?;
        out += gray;

        let tape = ColorizerTape {
            gray: gray.clone(),
            hidden1,
            hidden2,
        };
        Ok((CandidateBundle::new(out)?, tape))
    }

    fn backward(&self, tape: &ColorizerTape, grad: &Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let [conv1, conv2, rgb] = &self.layers;

        let (rgb_grads, d_hidden2) = rgb.backward(&tape.hidden2, grad, true)?;
        let d_hidden2 = d_hidden2.ok_or_else(|| Error::Shape("missing hidden gradient".into()))?;
        let d_hidden2 = relu_backward(&d_hidden2, &tape.hidden2);

        let (conv2_grads, d_hidden1) = conv2.backward(&tape.hidden1, &d_hidden2, true)?;
        let d_hidden1 = d_hidden1.ok_or_else(|| Error::Shape("missing hidden gradient".into()))?;
        let d_hidden1 = relu_backward(&d_hidden1, &tape.hidden1);

        let (conv1_grads, _) = conv1.backward(&tape.gray, &d_hidden1, false)?;

        Ok([conv1_grads, conv2_grads, rgb_grads]
            .into_iter()
            .flat_map(|g| [g.weight.into_dyn(), g.bias.into_dyn()])
            .collect())
    }

    fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut params = Vec::with_capacity(2 * self.layers.len());
        for layer in self.layers.iter_mut() {
            let Conv2d { weight, bias, .. } = layer;
            params.push(weight.view_mut().into_dyn());
            params.push(bias.view_mut().into_dyn());
        }
        params
    }

    fn state_dict(&self) -> TensorMap {
        let mut tensors = TensorMap::new();
        for (name, layer) in LAYER_NAMES.iter().zip(self.layers.iter()) {
            tensors.insert(format!("{}/weights", name), layer.weight_record());
            tensors.insert(format!("{}/biases", name), layer.bias_record());
        }
        tensors
    }

    fn load_state_dict(&mut self, tensors: &TensorMap) -> Result<()> {
        for (name, layer) in LAYER_NAMES.iter().zip(self.layers.iter_mut()) {
            let key = format!("{}/weights", name);
            let weights = tensors
                .get(&key)
                .ok_or_else(|| Error::Checkpoint(format!("missing tensor {}", key)))?;
            layer.load_weight_record(weights)?;

            let key = format!("{}/biases", name);
            let biases = tensors
                .get(&key)
                .ok_or_else(|| Error::Checkpoint(format!("missing tensor {}", key)))?;
            layer.load_bias_record(biases)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;

    fn small_config(seed: u64) -> ColorizerConfig {
        ColorizerConfig {
            hidden_channels: 4,
            num_candidates: NUM_CANDIDATES,
            seed,
        }
    }

    fn random_gray(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn(shape, |_| rng.random_range(0.0..1.0))
    }

    fn inner(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f64 {
        a.iter().zip(b.iter()).map(|(&x, &y)| x as f64 * y as f64).sum()
    }

    #[test]
    fn test_output_contract() {
        let model = ConvColorizer::new(&small_config(0)).unwrap();
        let (bundle, _) = model.forward(&random_gray((2, 8, 6, 1), 1)).unwrap();
        assert_eq!(bundle.dim(), (2, 8, 6, 3 * NUM_CANDIDATES));
        assert_eq!(bundle.len(), model.num_candidates());
    }

    #[test]
    fn test_rejects_color_input() {
        let model = ConvColorizer::new(&small_config(0)).unwrap();
        assert!(model.forward(&Array4::zeros((1, 4, 4, 3))).is_err());
    }

    #[test]
    fn test_zero_weights_pass_gray_through() {
        let mut model = ConvColorizer::new(&small_config(0)).unwrap();
        for mut p in model.parameters_mut() {
            p.fill(0.0);
        }
        let gray = random_gray((1, 5, 5, 1), 2);
        let (bundle, _) = model.forward(&gray).unwrap();
        for ((n, y, x, _), &v) in bundle.as_array().indexed_iter() {
            assert_relative_eq!(v, gray[[n, y, x, 0]]);
        }
    }

    #[test]
    fn test_parameter_gradients_satisfy_euler_identity() {
        // With zero biases the residual branch is positively homogeneous of
        // degree 1 in each layer's weights: <dL/dW, W> == <G, out - gray>.
        let mut model = ConvColorizer::new(&small_config(3)).unwrap();
        let gray = random_gray((2, 6, 6, 1), 4);
        let (bundle, tape) = model.forward(&gray).unwrap();
        let upstream = random_gray(bundle.dim(), 5);

        let mut residual = bundle.as_array().clone();
        residual -= &gray;
        let target: f64 = residual
            .iter()
            .zip(upstream.iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum();

        let grads = model.backward(&tape, &upstream).unwrap();
        let params: Vec<ArrayD<f32>> = model.parameters_mut().iter().map(|p| p.to_owned()).collect();
        assert_eq!(grads.len(), params.len());

        for layer in 0..3 {
            let w = 2 * layer;
            assert_eq!(grads[w].shape(), params[w].shape());
            assert_relative_eq!(inner(&grads[w], &params[w]), target, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_bias_gradient_of_output_layer_sums_upstream() {
        let model = ConvColorizer::new(&small_config(6)).unwrap();
        let gray = random_gray((2, 4, 4, 1), 7);
        let (bundle, tape) = model.forward(&gray).unwrap();
        let upstream = Array4::from_elem(bundle.dim(), 1.0f32);

        let grads = model.backward(&tape, &upstream).unwrap();
        // 2 samples × 16 pixels of unit gradient per output channel
        assert!(grads[5].iter().all(|&g| (g - 32.0).abs() < 1e-4));
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let source = ConvColorizer::new(&small_config(8)).unwrap();
        let mut target = ConvColorizer::new(&small_config(9)).unwrap();
        target.load_state_dict(&source.state_dict()).unwrap();

        let gray = random_gray((1, 4, 4, 1), 10);
        let (a, _) = source.forward(&gray).unwrap();
        let (b, _) = target.forward(&gray).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_state_dict_requires_every_tensor() {
        let source = ConvColorizer::new(&small_config(8)).unwrap();
        let mut tensors = source.state_dict();
        tensors.remove("colorizer/rgb/biases");

        let mut target = ConvColorizer::new(&small_config(9)).unwrap();
        assert!(matches!(
            target.load_state_dict(&tensors),
            Err(Error::Checkpoint(_))
        ));
    }
}
