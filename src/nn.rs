//! NHWC tensor kernels with hand-written backward passes
//!
//! Convolutions run as im2col + matmul per sample, with samples processed in
//! parallel with rayon. Only the pieces the colorizer and the frozen feature
//! extractor need are here: SAME-padded stride-1 convolution, ReLU,
//! 2×2 max pooling and bilinear resampling.

use crate::checkpoint::TensorRecord;
use crate::error::{Error, Result};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Zip};
use rand::Rng;
use rayon::prelude::*;

/// Stride-1 convolution with SAME zero padding
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Square kernel size (odd)
    pub kernel: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    /// Weights flattened to [kernel * kernel * in, out], row-major over (kh, kw, in)
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Parameter gradients of one convolution
#[derive(Debug, Clone)]
pub struct ConvGrads {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Conv2d {
    /// Create a convolution with all-zero parameters
    pub fn zeros(kernel: usize, in_channels: usize, out_channels: usize) -> Self {
        debug_assert!(kernel % 2 == 1, "kernel size must be odd");
        Self {
            kernel,
            in_channels,
            out_channels,
            weight: Array2::zeros((kernel * kernel * in_channels, out_channels)),
            bias: Array1::zeros(out_channels),
        }
    }

    /// He-uniform initialization, zero bias
    pub fn he_uniform<R: Rng>(
        kernel: usize,
        in_channels: usize,
        out_channels: usize,
        rng: &mut R,
    ) -> Self {
        let mut conv = Self::zeros(kernel, in_channels, out_channels);
        let fan_in = kernel * kernel * in_channels;
        let limit = (6.0 / fan_in as f32).sqrt();
        conv.weight.mapv_inplace(|_| rng.random_range(-limit..limit));
        conv
    }

    fn check_input(&self, channels: usize) -> Result<()> {
        if channels != self.in_channels {
            return Err(Error::Shape(format!(
                "convolution expects {} input channels, got {}",
                self.in_channels, channels
            )));
        }
        Ok(())
    }

    /// Forward pass over a [batch, height, width, in] tensor
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (batch, _, _, channels) = x.dim();
        self.check_input(channels)?;

        let outputs = (0..batch)
            .into_par_iter()
            .map(|n| self.forward_sample(x.index_axis(Axis(0), n)))
            .collect::<Result<Vec<_>>>()?;

        stack_samples(&outputs)
    }

    fn forward_sample(&self, x: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (h, w, _) = x.dim();
        let col = im2col(x, self.kernel);
        let mut out = col.dot(&self.weight);
        out += &self.bias;
        Ok(out.into_shape_with_order((h, w, self.out_channels))?)
    }

    /// Gradient with respect to the input only (frozen layers)
    pub fn backward_input(&self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let (batch, _, _, channels) = grad.dim();
        if channels != self.out_channels {
            return Err(Error::Shape(format!(
                "convolution gradient has {} channels, expected {}",
                channels, self.out_channels
            )));
        }

        let outputs = (0..batch)
            .into_par_iter()
            .map(|n| {
                let g = grad.index_axis(Axis(0), n);
                let (h, w, _) = g.dim();
                let g2 = flatten_pixels(g)?;
                let dcol = g2.dot(&self.weight.t());
                Ok(col2im(dcol.view(), h, w, self.in_channels, self.kernel))
            })
            .collect::<Result<Vec<_>>>()?;

        stack_samples(&outputs)
    }

    /// Full backward pass: parameter gradients, plus the input gradient when requested
    ///
    /// `x` must be the input the forward pass saw.
    pub fn backward(
        &self,
        x: &Array4<f32>,
        grad: &Array4<f32>,
        want_input_grad: bool,
    ) -> Result<(ConvGrads, Option<Array4<f32>>)> {
        let (batch, h, w, channels) = x.dim();
        self.check_input(channels)?;
        if grad.dim() != (batch, h, w, self.out_channels) {
            return Err(Error::Shape(format!(
                "convolution gradient shape {:?} does not match output {:?}",
                grad.dim(),
                (batch, h, w, self.out_channels)
            )));
        }

        let per_sample = (0..batch)
            .into_par_iter()
            .map(|n| {
                let col = im2col(x.index_axis(Axis(0), n), self.kernel);
                let g2 = flatten_pixels(grad.index_axis(Axis(0), n))?;
                let dw = col.t().dot(&g2);
                let db = g2.sum_axis(Axis(0));
                let dx = want_input_grad.then(|| {
                    let dcol = g2.dot(&self.weight.t());
                    col2im(dcol.view(), h, w, self.in_channels, self.kernel)
                });
                Ok((dw, db, dx))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut grads = ConvGrads {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.out_channels),
        };
        let mut input_grads = Vec::with_capacity(batch);
        for (dw, db, dx) in per_sample {
            grads.weight += &dw;
            grads.bias += &db;
            if let Some(dx) = dx {
                input_grads.push(dx);
            }
        }

        let input_grad = if want_input_grad {
            Some(stack_samples(&input_grads)?)
        } else {
            None
        };
        Ok((grads, input_grad))
    }

    /// Weights as a TF-layout [kh, kw, in, out] record
    pub fn weight_record(&self) -> TensorRecord {
        TensorRecord {
            shape: vec![self.kernel, self.kernel, self.in_channels, self.out_channels],
            data: self.weight.iter().copied().collect(),
        }
    }

    pub fn bias_record(&self) -> TensorRecord {
        TensorRecord::from_array(&self.bias)
    }

    /// Overwrite weights from a [kh, kw, in, out] record
    pub fn load_weight_record(&mut self, record: &TensorRecord) -> Result<()> {
        let expected = [self.kernel, self.kernel, self.in_channels, self.out_channels];
        record.check_shape(&expected)?;
        self.weight = Array2::from_shape_vec(self.weight.raw_dim(), record.data.clone())?;
        Ok(())
    }

    pub fn load_bias_record(&mut self, record: &TensorRecord) -> Result<()> {
        record.check_shape(&[self.out_channels])?;
        self.bias = Array1::from_vec(record.data.clone());
        Ok(())
    }
}

/// Unfold k×k zero-padded neighbourhoods into rows: [h * w, k * k * c]
fn im2col(x: ArrayView3<f32>, kernel: usize) -> Array2<f32> {
    let (h, w, c) = x.dim();
    let pad = (kernel / 2) as isize;
    let mut col = Array2::zeros((h * w, kernel * kernel * c));

    for y in 0..h {
        for xx in 0..w {
            let mut row = col.row_mut(y * w + xx);
            for dy in 0..kernel {
                let sy = y as isize + dy as isize - pad;
                if sy < 0 || sy >= h as isize {
                    continue;
                }
                for dx in 0..kernel {
                    let sx = xx as isize + dx as isize - pad;
                    if sx < 0 || sx >= w as isize {
                        continue;
                    }
                    let start = (dy * kernel + dx) * c;
                    row.slice_mut(s![start..start + c])
                        .assign(&x.slice(s![sy as usize, sx as usize, ..]));
                }
            }
        }
    }

    col
}

/// Adjoint of `im2col`: scatter-add rows back into an [h, w, c] image
fn col2im(dcol: ArrayView2<f32>, h: usize, w: usize, c: usize, kernel: usize) -> Array3<f32> {
    let pad = (kernel / 2) as isize;
    let mut dx = Array3::zeros((h, w, c));

    for y in 0..h {
        for xx in 0..w {
            let row = dcol.row(y * w + xx);
            for dy in 0..kernel {
                let sy = y as isize + dy as isize - pad;
                if sy < 0 || sy >= h as isize {
                    continue;
                }
                for dx_ in 0..kernel {
                    let sx = xx as isize + dx_ as isize - pad;
                    if sx < 0 || sx >= w as isize {
                        continue;
                    }
                    let start = (dy * kernel + dx_) * c;
                    let mut cell = dx.slice_mut(s![sy as usize, sx as usize, ..]);
                    cell += &row.slice(s![start..start + c]);
                }
            }
        }
    }

    dx
}

fn flatten_pixels(a: ArrayView3<f32>) -> Result<Array2<f32>> {
    let (h, w, c) = a.dim();
    Ok(Array2::from_shape_vec((h * w, c), a.iter().copied().collect())?)
}

fn stack_samples(samples: &[Array3<f32>]) -> Result<Array4<f32>> {
    let views: Vec<_> = samples.iter().map(|s| s.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// In-place ReLU
pub fn relu_inplace(x: &mut Array4<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// ReLU backward, given the post-activation output
pub fn relu_backward(grad: &Array4<f32>, output: &Array4<f32>) -> Array4<f32> {
    Zip::from(grad)
        .and(output)
        .map_collect(|&g, &y| if y > 0.0 { g } else { 0.0 })
}

/// 2×2 max pooling with stride 2 (VALID: odd trailing rows/cols are dropped)
pub fn max_pool2(x: &Array4<f32>) -> Array4<f32> {
    let (batch, h, w, c) = x.dim();
    Array4::from_shape_fn((batch, h / 2, w / 2, c), |(n, y, xx, ch)| {
        let (y0, x0) = (2 * y, 2 * xx);
        x[[n, y0, x0, ch]]
            .max(x[[n, y0, x0 + 1, ch]])
            .max(x[[n, y0 + 1, x0, ch]])
            .max(x[[n, y0 + 1, x0 + 1, ch]])
    })
}

/// Route pooled gradients back to the first maximum of each window
pub fn max_pool2_backward(x: &Array4<f32>, grad: &Array4<f32>) -> Array4<f32> {
    let mut dx = Array4::zeros(x.raw_dim());

    for ((n, y, xx, ch), &g) in grad.indexed_iter() {
        let (y0, x0) = (2 * y, 2 * xx);
        let mut best = (y0, x0);
        let mut best_value = x[[n, y0, x0, ch]];
        for (oy, ox) in [(0, 1), (1, 0), (1, 1)] {
            let v = x[[n, y0 + oy, x0 + ox, ch]];
            if v > best_value {
                best_value = v;
                best = (y0 + oy, x0 + ox);
            }
        }
        dx[[n, best.0, best.1, ch]] += g;
    }

    dx
}

/// Bilinear resampling to (out_h, out_w)
///
/// Matches the legacy `align_corners = false` convention: output pixel `i`
/// samples input coordinate `i * in / out`, clamped at the far edge.
pub fn resize_bilinear(x: &Array4<f32>, out_h: usize, out_w: usize) -> Array4<f32> {
    let (batch, h, w, c) = x.dim();
    if (h, w) == (out_h, out_w) {
        return x.clone();
    }
    if h == 0 || w == 0 {
        return Array4::zeros((batch, out_h, out_w, c));
    }

    let scale_y = h as f32 / out_h as f32;
    let scale_x = w as f32 / out_w as f32;

    Array4::from_shape_fn((batch, out_h, out_w, c), |(n, y, xx, ch)| {
        let fy = y as f32 * scale_y;
        let y0 = (fy.floor() as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let ly = fy - y0 as f32;

        let fx = xx as f32 * scale_x;
        let x0 = (fx.floor() as usize).min(w - 1);
        let x1 = (x0 + 1).min(w - 1);
        let lx = fx - x0 as f32;

        let top = x[[n, y0, x0, ch]] * (1.0 - lx) + x[[n, y0, x1, ch]] * lx;
        let bottom = x[[n, y1, x0, ch]] * (1.0 - lx) + x[[n, y1, x1, ch]] * lx;
        top * (1.0 - ly) + bottom * ly
    })
}
