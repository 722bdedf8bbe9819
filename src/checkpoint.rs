//! Tensor snapshots on disk
//!
//! Both the pretrained feature-extractor weights and the colorizer snapshots
//! are stored as JSON maps from tensor name to a row-major `{shape, data}`
//! record. Convolution weights use the [kh, kw, in, out] layout.

use crate::error::{Error, Result};
use ndarray::{Array, ArrayD, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A single named tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Tensors keyed by variable name
pub type TensorMap = BTreeMap<String, TensorRecord>;

impl TensorRecord {
    /// Snapshot an array in logical (row-major) order
    pub fn from_array<D: Dimension>(array: &Array<f32, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    /// Fail unless the record has exactly this shape and a matching element count
    pub fn check_shape(&self, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(Error::Checkpoint(format!(
                "tensor shape {:?} does not match expected {:?}",
                self.shape, expected
            )));
        }
        let len: usize = expected.iter().product();
        if self.data.len() != len {
            return Err(Error::Checkpoint(format!(
                "tensor of shape {:?} holds {} values, expected {}",
                self.shape,
                self.data.len(),
                len
            )));
        }
        Ok(())
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())?)
    }
}

/// Read a tensor map from a JSON file
pub fn load_tensor_file(path: &Path) -> Result<TensorMap> {
    let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(serde_json::from_str(&json)?)
}

/// Write a tensor map as JSON
pub fn save_tensor_file(path: &Path, tensors: &TensorMap) -> Result<()> {
    let json = serde_json::to_string(tensors)?;
    std::fs::write(path, json).map_err(|e| Error::io(path, e))
}

/// Latest snapshot of the colorizer's learned parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    /// Epoch the snapshot was taken in
    pub epoch: usize,
    /// Batch index within that epoch
    pub batch: usize,
    /// Global step count
    pub step: usize,
    pub tensors: TensorMap,
}

impl ModelCheckpoint {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Save to file, replacing any previous snapshot
    ///
    /// The snapshot is written next to the target and renamed over it, so an
    /// interrupted write never leaves a truncated checkpoint behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let tmp = path.with_extension("ckpt.tmp");
        std::fs::write(&tmp, json).map_err(|e| Error::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
    }

    /// Load from file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn sample_checkpoint(step: usize, value: f32) -> ModelCheckpoint {
        let mut tensors = TensorMap::new();
        tensors.insert(
            "conv1/weights".to_string(),
            TensorRecord::from_array(&Array2::from_elem((2, 3), value)),
        );
        ModelCheckpoint {
            epoch: 1,
            batch: step % 10,
            step,
            tensors,
        }
    }

    #[test]
    fn test_record_from_array_is_row_major() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let record = TensorRecord::from_array(&a.t().to_owned());
        assert_eq!(record.shape, vec![2, 2]);
        assert_eq!(record.data, vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(record.to_array().unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn test_check_shape() {
        let record = TensorRecord {
            shape: vec![2, 3],
            data: vec![0.0; 6],
        };
        assert!(record.check_shape(&[2, 3]).is_ok());
        assert!(record.check_shape(&[3, 2]).is_err());

        let short = TensorRecord {
            shape: vec![2, 3],
            data: vec![0.0; 5],
        };
        assert!(short.check_shape(&[2, 3]).is_err());
    }

    #[test]
    fn test_checkpoint_overwrites_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.ckpt");

        sample_checkpoint(1, 0.5).save(&path).unwrap();
        let second = sample_checkpoint(51, -2.0);
        second.save(&path).unwrap();

        let loaded = ModelCheckpoint::load(&path).unwrap();
        assert_eq!(loaded, second);
        assert!(!path.with_extension("ckpt.tmp").exists());
    }

    #[test]
    fn test_tensor_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let tensors = sample_checkpoint(0, 1.5).tensors;

        save_tensor_file(&path, &tensors).unwrap();
        assert_eq!(load_tensor_file(&path).unwrap(), tensors);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = ModelCheckpoint::load(&dir.path().join("nope.ckpt")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
