//! Frozen perceptual feature extractor
//!
//! A VGG-style stack of 3×3 conv + ReLU blocks separated by 2×2 max pooling.
//! The extractor reports the raw input as pseudo-layer `"input"` followed by
//! one tapped activation per block (by default the second conv of each
//! block, i.e. `conv1_2 .. conv5_2` of VGG-19).
//!
//! Parameters are loaded once and never updated. The extractor is shared
//! behind an `Arc` and holds no per-call state, so candidates can be scored
//! in parallel.

use crate::checkpoint::{load_tensor_file, TensorMap};
use crate::error::{Error, Result, VGG19_WEIGHTS_URL};
use crate::nn::{max_pool2, max_pool2_backward, relu_backward, relu_inplace, Conv2d};
use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Name of the raw-pixel pseudo-layer
pub const INPUT_LAYER: &str = "input";

/// ImageNet channel means (RGB order) subtracted after scaling to [0, 255]
pub const VGG_MEAN_RGB: [f32; 3] = [123.68, 116.779, 103.939];

/// One named activation
#[derive(Debug, Clone)]
pub struct FeatureMap {
    pub name: String,
    pub activation: Array4<f32>,
}

/// Ordered feature maps, first entry is always the input image
#[derive(Debug, Clone, Default)]
pub struct FeatureMaps {
    maps: Vec<FeatureMap>,
}

impl FeatureMaps {
    pub fn push(&mut self, name: impl Into<String>, activation: Array4<f32>) {
        self.maps.push(FeatureMap {
            name: name.into(),
            activation,
        });
    }

    pub fn get(&self, name: &str) -> Option<&Array4<f32>> {
        self.maps
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.activation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureMap> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.maps.iter().map(|m| m.name.as_str()).collect()
    }
}

/// Maps an image batch to a fixed, ordered set of named feature maps
pub trait FeatureExtractor: Send + Sync {
    /// Intermediate state the backward pass needs
    type Tape: Send;

    /// Layer names in output order, starting with [`INPUT_LAYER`]
    fn layer_names(&self) -> Vec<String>;

    /// Forward pass that keeps what `backward` needs
    fn extract_with_tape(&self, image: &Array4<f32>) -> Result<(FeatureMaps, Self::Tape)>;

    fn extract(&self, image: &Array4<f32>) -> Result<FeatureMaps> {
        Ok(self.extract_with_tape(image)?.0)
    }

    /// Pull per-layer gradients back to the input image
    ///
    /// `grads` is aligned with [`layer_names`](Self::layer_names) and each entry
    /// has the shape of the corresponding feature map.
    fn backward(&self, tape: &Self::Tape, grads: &[Array4<f32>]) -> Result<Array4<f32>>;
}

/// One stage of convolutions at a fixed resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VggBlock {
    pub convs: usize,
    pub channels: usize,
}

/// Architecture of the frozen extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VggConfig {
    /// Variable scope prefix used for checkpoint keys and layer names
    pub scope: String,
    pub blocks: Vec<VggBlock>,
    /// 1-based conv index tapped in every block
    pub tap: usize,
    /// Scale to [0, 255] and subtract the ImageNet mean before the first conv;
    /// off by default, the convs then see the raw [0, 1] image
    pub normalize: bool,
}

impl Default for VggConfig {
    fn default() -> Self {
        Self::vgg19()
    }
}

impl VggConfig {
    /// VGG-19 tapped at conv1_2 .. conv5_2
    pub fn vgg19() -> Self {
        let blocks = [(2, 64), (2, 128), (4, 256), (4, 512), (4, 512)]
            .into_iter()
            .map(|(convs, channels)| VggBlock { convs, channels })
            .collect();
        Self {
            scope: "vgg_19".to_string(),
            blocks,
            tap: 2,
            normalize: false,
        }
    }

    /// Same topology with a handful of channels, for fast experiments and tests
    pub fn tiny() -> Self {
        let blocks = [(2, 4), (2, 4), (2, 6), (2, 6), (2, 8)]
            .into_iter()
            .map(|(convs, channels)| VggBlock { convs, channels })
            .collect();
        Self {
            scope: "vgg_19".to_string(),
            blocks,
            tap: 2,
            normalize: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocks.is_empty() {
            return Err(Error::Config("extractor needs at least one block".into()));
        }
        if self.tap == 0 {
            return Err(Error::Config("extractor tap index is 1-based".into()));
        }
        if let Some((b, block)) = self
            .blocks
            .iter()
            .enumerate()
            .find(|(_, block)| block.convs < self.tap || block.channels == 0)
        {
            return Err(Error::Config(format!(
                "block {} has {} convs with {} channels, cannot tap conv {}",
                b + 1,
                block.convs,
                block.channels,
                self.tap
            )));
        }
        Ok(())
    }

    /// Smallest image side that survives every pooling stage
    pub fn min_image_size(&self) -> usize {
        1 << self.blocks.len().saturating_sub(1)
    }

    fn conv_name(&self, block: usize, conv: usize) -> String {
        format!(
            "{scope}/conv{b}/conv{b}_{c}",
            scope = self.scope,
            b = block + 1,
            c = conv + 1
        )
    }

    /// Output layer names: `"input"` then one tap per block
    pub fn layer_names(&self) -> Vec<String> {
        std::iter::once(INPUT_LAYER.to_string())
            .chain((0..self.blocks.len()).map(|b| self.conv_name(b, self.tap - 1)))
            .collect()
    }
}

/// Fail fast when the pretrained weights are not on disk
pub fn ensure_pretrained(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::MissingCheckpoint {
            path: path.to_path_buf(),
            url: VGG19_WEIGHTS_URL,
        })
    }
}

/// Outcome of restoring extractor weights
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Convolutions whose weights and biases came from the checkpoint
    pub restored: usize,
    /// Convolutions absent from the checkpoint, left at their initialization
    pub missing: Vec<String>,
    /// Checkpoint tensors nothing consumed
    pub unused: usize,
}

/// Saved activations of one forward pass
#[derive(Debug, Clone)]
pub struct VggTape {
    image_dim: (usize, usize, usize, usize),
    /// Post-ReLU output of every computed conv, per block
    activations: Vec<Vec<Array4<f32>>>,
}

/// Frozen VGG-style extractor
#[derive(Debug, Clone)]
pub struct VggExtractor {
    config: VggConfig,
    blocks: Vec<Vec<Conv2d>>,
}

impl VggExtractor {
    /// Build with seeded He-uniform weights
    pub fn new(config: VggConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut in_channels = 3;
        let mut blocks = Vec::with_capacity(config.blocks.len());
        for block in &config.blocks {
            let mut convs = Vec::with_capacity(block.convs);
            for _ in 0..block.convs {
                convs.push(Conv2d::he_uniform(3, in_channels, block.channels, &mut rng));
                in_channels = block.channels;
            }
            blocks.push(convs);
        }
        Ok(Self { config, blocks })
    }

    /// Build and restore weights from a pretrained tensor file
    ///
    /// Variables missing from the file keep their seeded initialization.
    pub fn from_checkpoint(config: VggConfig, path: &Path, seed: u64) -> Result<Self> {
        ensure_pretrained(path)?;
        let mut extractor = Self::new(config, seed)?;
        let tensors = load_tensor_file(path)?;
        let report = extractor.load_weights(&tensors)?;
        info!(
            path = %path.display(),
            restored = report.restored,
            missing = report.missing.len(),
            "loaded feature extractor weights"
        );
        if !report.missing.is_empty() {
            debug!(missing = ?report.missing, "extractor variables left at initialization");
        }
        Ok(extractor)
    }

    /// Overwrite every conv found in `tensors`; shape mismatches are errors
    pub fn load_weights(&mut self, tensors: &TensorMap) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut consumed = 0;

        for (b, block) in self.blocks.iter_mut().enumerate() {
            for (i, conv) in block.iter_mut().enumerate() {
                let name = self.config.conv_name(b, i);
                let weights = tensors.get(&format!("{}/weights", name));
                let biases = tensors.get(&format!("{}/biases", name));
                match (weights, biases) {
                    (None, None) => report.missing.push(name),
                    (weights, biases) => {
                        if let Some(w) = weights {
                            conv.load_weight_record(w)?;
                            consumed += 1;
                        }
                        if let Some(bias) = biases {
                            conv.load_bias_record(bias)?;
                            consumed += 1;
                        }
                        report.restored += 1;
                    }
                }
            }
        }

        report.unused = tensors.len() - consumed;
        Ok(report)
    }

    pub fn config(&self) -> &VggConfig {
        &self.config
    }

    fn preprocess(&self, image: &Array4<f32>) -> Result<Array4<f32>> {
        let channels = image.len_of(Axis(3));
        if channels != 3 {
            return Err(Error::Shape(format!(
                "feature extractor expects RGB input, got {} channels",
                channels
            )));
        }
        if !self.config.normalize {
            return Ok(image.clone());
        }
        let mut x = image.mapv(|v| v * 255.0);
        for (c, &mean) in VGG_MEAN_RGB.iter().enumerate() {
            x.index_axis_mut(Axis(3), c).mapv_inplace(|v| v - mean);
        }
        Ok(x)
    }

    /// Convs evaluated in block `b`: the last block stops at its tap
    fn convs_computed(&self, b: usize) -> usize {
        if b + 1 == self.blocks.len() {
            self.config.tap
        } else {
            self.blocks[b].len()
        }
    }
}

impl FeatureExtractor for VggExtractor {
    type Tape = VggTape;

    fn layer_names(&self) -> Vec<String> {
        self.config.layer_names()
    }

    fn extract_with_tape(&self, image: &Array4<f32>) -> Result<(FeatureMaps, VggTape)> {
        let normalized = self.preprocess(image)?;
        let mut activations: Vec<Vec<Array4<f32>>> = Vec::with_capacity(self.blocks.len());

        for (b, block) in self.blocks.iter().enumerate() {
            let block_input = match activations.last().and_then(|acts| acts.last()) {
                Some(prev) => max_pool2(prev),
                None => normalized.clone(),
            };

            let mut acts: Vec<Array4<f32>> = Vec::with_capacity(block.len());
            for conv in &block[..self.convs_computed(b)] {
                let src = acts.last().unwrap_or(&block_input);
                let mut y = conv.forward(src)?;
                relu_inplace(&mut y);
                acts.push(y);
            }
            activations.push(acts);
        }

        let mut maps = FeatureMaps::default();
        maps.push(INPUT_LAYER, image.clone());
        for (b, acts) in activations.iter().enumerate() {
            let tap = self.config.tap - 1;
            maps.push(self.config.conv_name(b, tap), acts[tap].clone());
        }

        let tape = VggTape {
            image_dim: image.dim(),
            activations,
        };
        Ok((maps, tape))
    }

    fn backward(&self, tape: &VggTape, grads: &[Array4<f32>]) -> Result<Array4<f32>> {
        let expected_layers = self.blocks.len() + 1;
        if grads.len() != expected_layers {
            return Err(Error::Shape(format!(
                "expected {} layer gradients, got {}",
                expected_layers,
                grads.len()
            )));
        }
        if grads[0].dim() != tape.image_dim {
            return Err(Error::Shape(format!(
                "input gradient {:?} does not match image {:?}",
                grads[0].dim(),
                tape.image_dim
            )));
        }

        let tap = self.config.tap - 1;
        let mut running: Option<Array4<f32>> = None;

        for b in (0..self.blocks.len()).rev() {
            let acts = &tape.activations[b];
            let layer_grad = &grads[b + 1];
            if layer_grad.dim() != acts[tap].dim() {
                return Err(Error::Shape(format!(
                    "gradient for {} has shape {:?}, activation is {:?}",
                    self.config.conv_name(b, tap),
                    layer_grad.dim(),
                    acts[tap].dim()
                )));
            }

            for i in (0..acts.len()).rev() {
                if i == tap {
                    running = Some(match running.take() {
                        Some(g) => g + layer_grad,
                        None => layer_grad.clone(),
                    });
                }
                if let Some(g) = running.take() {
                    let g = relu_backward(&g, &acts[i]);
                    running = Some(self.blocks[b][i].backward_input(&g)?);
                }
            }

            if b > 0 {
                if let Some(g) = running.take() {
                    let pooled_from = &tape.activations[b - 1][tape.activations[b - 1].len() - 1];
                    running = Some(max_pool2_backward(pooled_from, &g));
                }
            }
        }

        let mut dx = running.unwrap_or_else(|| Array4::zeros(tape.image_dim));
        if self.config.normalize {
            dx.mapv_inplace(|v| v * 255.0);
        }
        Ok(dx + &grads[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{save_tensor_file, TensorRecord};
    use approx::assert_relative_eq;
    use rand::Rng;
    use tempfile::tempdir;

    fn random_image(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn(shape, |_| rng.random_range(0.0..1.0))
    }

    #[test]
    fn test_vgg19_layer_names() {
        assert_eq!(
            VggConfig::vgg19().layer_names(),
            vec![
                "input",
                "vgg_19/conv1/conv1_2",
                "vgg_19/conv2/conv2_2",
                "vgg_19/conv3/conv3_2",
                "vgg_19/conv4/conv4_2",
                "vgg_19/conv5/conv5_2",
            ]
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(VggConfig::vgg19().validate().is_ok());
        let mut bad = VggConfig::tiny();
        bad.tap = 3;
        assert!(bad.validate().is_err());
        bad.tap = 0;
        assert!(bad.validate().is_err());
        assert_eq!(VggConfig::tiny().min_image_size(), 16);
    }

    #[test]
    fn test_feature_map_shapes() {
        let extractor = VggExtractor::new(VggConfig::tiny(), 0).unwrap();
        let maps = extractor.extract(&random_image((2, 16, 16, 3), 1)).unwrap();

        assert_eq!(maps.len(), 6);
        assert_eq!(maps.names(), extractor.layer_names());
        let dims: Vec<_> = maps.iter().map(|m| m.activation.dim()).collect();
        assert_eq!(
            dims,
            vec![
                (2, 16, 16, 3),
                (2, 16, 16, 4),
                (2, 8, 8, 4),
                (2, 4, 4, 6),
                (2, 2, 2, 6),
                (2, 1, 1, 8),
            ]
        );
        assert_eq!(maps.get("input").unwrap().dim(), (2, 16, 16, 3));
    }

    #[test]
    fn test_extract_is_stateless() {
        let extractor = VggExtractor::new(VggConfig::tiny(), 3).unwrap();
        let image = random_image((1, 16, 16, 3), 4);
        let a = extractor.extract(&image).unwrap();
        let b = extractor.extract(&image).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.activation, y.activation);
        }
    }

    #[test]
    fn test_rejects_non_rgb_input() {
        let extractor = VggExtractor::new(VggConfig::tiny(), 0).unwrap();
        assert!(extractor.extract(&Array4::zeros((1, 16, 16, 1))).is_err());
    }

    #[test]
    fn test_backward_matches_piecewise_linear_identity() {
        // Without normalization and with zero biases every map is positively
        // homogeneous, so sum_k <g_k, f_k(x)> == <J^T g, x>.
        let mut config = VggConfig::tiny();
        config.normalize = false;
        let extractor = VggExtractor::new(config, 5).unwrap();
        let image = random_image((2, 16, 16, 3), 6);

        let (maps, tape) = extractor.extract_with_tape(&image).unwrap();
        let grads: Vec<Array4<f32>> = maps
            .iter()
            .enumerate()
            .map(|(k, m)| random_image(m.activation.dim(), 100 + k as u64))
            .collect();

        let lhs: f64 = maps
            .iter()
            .zip(grads.iter())
            .map(|(m, g)| {
                m.activation
                    .iter()
                    .zip(g.iter())
                    .map(|(&a, &b)| a as f64 * b as f64)
                    .sum::<f64>()
            })
            .sum();

        let dx = extractor.backward(&tape, &grads).unwrap();
        assert_eq!(dx.dim(), image.dim());
        let rhs: f64 = dx
            .iter()
            .zip(image.iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum();

        assert_relative_eq!(lhs, rhs, max_relative = 1e-3);
    }

    #[test]
    fn test_backward_input_layer_only_is_identity() {
        let extractor = VggExtractor::new(VggConfig::tiny(), 7).unwrap();
        let image = random_image((1, 16, 16, 3), 8);
        let (maps, tape) = extractor.extract_with_tape(&image).unwrap();

        let mut grads: Vec<Array4<f32>> = maps
            .iter()
            .map(|m| Array4::zeros(m.activation.dim()))
            .collect();
        grads[0].fill(0.5);

        let dx = extractor.backward(&tape, &grads).unwrap();
        assert!(dx.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_default_feeds_raw_image_to_first_conv() {
        assert!(!VggConfig::vgg19().normalize);
        assert!(!VggConfig::tiny().normalize);

        // conv1_1 copies the red channel: center tap, in 0 -> out 0
        let mut extractor = VggExtractor::new(VggConfig::tiny(), 2).unwrap();
        let first = &mut extractor.blocks[0][0];
        first.weight.fill(0.0);
        first.bias.fill(0.0);
        first.weight[[4 * 3, 0]] = 1.0;

        let image = random_image((1, 16, 16, 3), 3);
        let (_, tape) = extractor.extract_with_tape(&image).unwrap();
        let conv1_1 = &tape.activations[0][0];
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(conv1_1[[0, y, x, 0]], image[[0, y, x, 0]]);
                assert_eq!(conv1_1[[0, y, x, 1]], 0.0);
            }
        }

        // Opt-in normalization scales and centers before conv1_1
        extractor.config.normalize = true;
        let (_, tape) = extractor.extract_with_tape(&image).unwrap();
        let expected = (image[[0, 5, 7, 0]] * 255.0 - VGG_MEAN_RGB[0]).max(0.0);
        assert_relative_eq!(tape.activations[0][0][[0, 5, 7, 0]], expected, epsilon = 1e-3);
    }

    #[test]
    fn test_backward_rejects_misaligned_grads() {
        let extractor = VggExtractor::new(VggConfig::tiny(), 7).unwrap();
        let (_, tape) = extractor
            .extract_with_tape(&random_image((1, 16, 16, 3), 8))
            .unwrap();
        assert!(extractor.backward(&tape, &[Array4::zeros((1, 16, 16, 3))]).is_err());
    }

    #[test]
    fn test_load_weights_ignores_missing() {
        let mut extractor = VggExtractor::new(VggConfig::tiny(), 9).unwrap();
        let mut tensors = TensorMap::new();
        tensors.insert(
            "vgg_19/conv1/conv1_1/weights".into(),
            TensorRecord {
                shape: vec![3, 3, 3, 4],
                data: vec![0.0; 108],
            },
        );
        tensors.insert(
            "vgg_19/conv1/conv1_1/biases".into(),
            TensorRecord {
                shape: vec![4],
                data: vec![0.0; 4],
            },
        );
        tensors.insert(
            "vgg_19/fc8/weights".into(),
            TensorRecord {
                shape: vec![1],
                data: vec![0.0],
            },
        );

        let report = extractor.load_weights(&tensors).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.missing.len(), 9);
        assert_eq!(report.unused, 1);

        // conv1_1 now outputs zeros, and relu(conv1_2(0)) is zero with zero biases
        let maps = extractor.extract(&random_image((1, 16, 16, 3), 10)).unwrap();
        let conv1_2 = maps.get("vgg_19/conv1/conv1_2").unwrap();
        assert!(conv1_2.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_load_weights_rejects_bad_shape() {
        let mut extractor = VggExtractor::new(VggConfig::tiny(), 9).unwrap();
        let mut tensors = TensorMap::new();
        tensors.insert(
            "vgg_19/conv2/conv2_1/weights".into(),
            TensorRecord {
                shape: vec![3, 3, 3, 4],
                data: vec![0.0; 108],
            },
        );
        assert!(matches!(
            extractor.load_weights(&tensors),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_from_checkpoint_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vgg_19.ckpt");
        let err = VggExtractor::from_checkpoint(VggConfig::tiny(), &path, 0).unwrap_err();
        assert!(matches!(err, Error::MissingCheckpoint { .. }));
        assert!(err.to_string().contains("vgg_19.ckpt"));
    }

    #[test]
    fn test_from_checkpoint_empty_file_keeps_init() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vgg_19.ckpt");
        save_tensor_file(&path, &TensorMap::new()).unwrap();

        let loaded = VggExtractor::from_checkpoint(VggConfig::tiny(), &path, 11).unwrap();
        let fresh = VggExtractor::new(VggConfig::tiny(), 11).unwrap();
        let image = random_image((1, 16, 16, 3), 12);
        let a = loaded.extract(&image).unwrap();
        let b = fresh.extract(&image).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.activation, y.activation);
        }
    }
}
