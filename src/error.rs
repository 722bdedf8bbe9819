//! Error types for colorizer training

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Where the pretrained VGG-19 weights can be downloaded from
pub const VGG19_WEIGHTS_URL: &str = "http://download.tensorflow.org/models/vgg_19_2016_08_28.tar.gz";

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// The frozen feature extractor has no weights on disk
    #[error(
        "pretrained checkpoint not found at {}: download VGG-19 weights from {url}, \
         convert them to the JSON tensor format and save them to the root of your data_dir",
        .path.display()
    )]
    MissingCheckpoint { path: PathBuf, url: &'static str },

    /// Filesystem error tied to a specific path
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Image encode/decode error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Failed to decode one sample of the dataset
    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tensor shape mismatch
    #[error("shape error: {0}")]
    Shape(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The image directory holds no usable images
    #[error("no images found under {}", .0.display())]
    EmptyDataset(PathBuf),

    /// Every loader worker has exited
    #[error("batch loader workers disconnected")]
    WorkersDisconnected,

    /// Malformed checkpoint contents
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Shape(e.to_string())
    }
}
