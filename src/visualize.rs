//! Side-by-side previews of a training step
//!
//! One row per sample: `[gray | truth | c0 | c1 | ... ]`, rows stacked
//! top to bottom.

use crate::bundle::CandidateBundle;
use crate::error::{Error, Result};
use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayView3, Axis};
use std::path::Path;

/// [0, 1] float to byte, truncating
fn to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0) as u8
}

/// Copy one [height, width, channels] image into the tile at column `col`
fn blit(img: &mut RgbImage, src: ArrayView3<'_, f32>, row: usize, col: usize) {
    let (h, w, channels) = src.dim();
    for y in 0..h {
        for x in 0..w {
            let pixel = if channels == 1 {
                let v = to_byte(src[[y, x, 0]]);
                Rgb([v, v, v])
            } else {
                Rgb([
                    to_byte(src[[y, x, 0]]),
                    to_byte(src[[y, x, 1]]),
                    to_byte(src[[y, x, 2]]),
                ])
            };
            img.put_pixel((col * w + x) as u32, (row * h + y) as u32, pixel);
        }
    }
}

/// Tile a step's inputs and outputs into one `B·H × (2+N)·W` image
pub fn tile_visualization(
    bundle: &CandidateBundle,
    real: &Array4<f32>,
    gray: &Array4<f32>,
) -> Result<RgbImage> {
    let (b, h, w, _) = bundle.dim();
    if real.dim() != (b, h, w, 3) || gray.dim() != (b, h, w, 1) {
        return Err(Error::Shape(format!(
            "cannot tile bundle {:?} with truth {:?} and gray {:?}",
            bundle.dim(),
            real.dim(),
            gray.dim()
        )));
    }

    let n = bundle.len();
    let mut img = RgbImage::new(((2 + n) * w) as u32, (b * h) as u32);
    let candidates = bundle.split();

    for sample in 0..b {
        blit(&mut img, gray.index_axis(Axis(0), sample), sample, 0);
        blit(&mut img, real.index_axis(Axis(0), sample), sample, 1);
        for (i, candidate) in candidates.iter().enumerate() {
            blit(&mut img, candidate.index_axis(Axis(0), sample), sample, 2 + i);
        }
    }
    Ok(img)
}

/// Tile and write to `path`; the format follows the extension
pub fn save_visualization(
    path: &Path,
    bundle: &CandidateBundle,
    real: &Array4<f32>,
    gray: &Array4<f32>,
) -> Result<()> {
    let img = tile_visualization(bundle, real, gray)?;
    img.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::NUM_CANDIDATES;
    use tempfile::tempdir;

    #[test]
    fn test_tile_dimensions() {
        let (b, h, w) = (2, 5, 7);
        let bundle = CandidateBundle::new(Array4::zeros((b, h, w, 3 * NUM_CANDIDATES))).unwrap();
        let img = tile_visualization(&bundle, &Array4::zeros((b, h, w, 3)), &Array4::zeros((b, h, w, 1))).unwrap();
        assert_eq!(img.height(), (b * h) as u32);
        assert_eq!(img.width(), ((2 + NUM_CANDIDATES) * w) as u32);
    }

    #[test]
    fn test_tile_layout_and_clipping() {
        let mut data = Array4::zeros((2, 2, 2, 6));
        // Sample 1, candidate 1: out-of-range values clip to 255 and 0
        data[[1, 0, 0, 3]] = 1.7;
        data[[1, 0, 0, 4]] = -0.3;
        data[[1, 0, 0, 5]] = 0.5;
        let bundle = CandidateBundle::new(data).unwrap();
        let real = Array4::from_elem((2, 2, 2, 3), 1.0f32);
        let gray = Array4::from_elem((2, 2, 2, 1), 0.25f32);

        let img = tile_visualization(&bundle, &real, &gray).unwrap();
        assert_eq!(img.get_pixel(1, 3), &Rgb([63, 63, 63]));
        assert_eq!(img.get_pixel(2, 0), &Rgb([255, 255, 255]));
        assert_eq!(img.get_pixel(6, 2), &Rgb([255, 0, 127]));
        assert_eq!(img.get_pixel(4, 2), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_tile_rejects_mismatched_inputs() {
        let bundle = CandidateBundle::new(Array4::zeros((1, 4, 4, 6))).unwrap();
        assert!(tile_visualization(&bundle, &Array4::zeros((1, 4, 3, 3)), &Array4::zeros((1, 4, 4, 1))).is_err());
    }

    #[test]
    fn test_save_visualization_writes_jpeg() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0_0.jpg");
        let bundle = CandidateBundle::new(Array4::from_elem((1, 8, 8, 6), 0.5f32)).unwrap();
        save_visualization(&path, &bundle, &Array4::zeros((1, 8, 8, 3)), &Array4::zeros((1, 8, 8, 1))).unwrap();

        let reread = image::open(&path).unwrap();
        assert_eq!((reread.width(), reread.height()), (32, 8));
    }
}
