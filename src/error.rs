//! Error taxonomy for the network core
//!
//! Every fallible operation in the crate returns [`Result`]. None of the errors
//! are retried internally; each one is terminal for the operation that raised it.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the network, its codec, the normalizer and the backend.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Fewer than two layers, or a layer with zero neurons.
    #[error("invalid topology {layers:?}: {reason}")]
    InvalidTopology { layers: Vec<usize>, reason: String },

    /// A vector or matrix did not have the length the topology requires.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The dataset location could not be read or yielded no samples.
    #[error("dataset at {path} is unavailable: {reason}")]
    DatasetUnavailable { path: PathBuf, reason: String },

    /// The accelerator context was invalidated (device removed or disposed).
    #[error("accelerator '{device}' was lost")]
    AcceleratorLost { device: String },

    /// The network currently holds no accelerator context.
    #[error("no accelerator is bound to the network")]
    NoAccelerator,

    /// A parameter file stores a different layer-size sequence.
    #[error("topology mismatch: file stores {stored:?}, network expects {expected:?}")]
    TopologyMismatch {
        stored: Vec<usize>,
        expected: Vec<usize>,
    },

    /// A parameter file is truncated, padded or declares nonsensical sizes.
    #[error("corrupt parameter file: {0}")]
    CorruptFile(String),

    /// The pixel layout of a raw image buffer is not understood.
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// The image holds a different number of pixels than the input layer.
    #[error("image has {actual} pixels, input layer expects {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    /// A training configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    pub(crate) fn dimension(context: &'static str, expected: usize, actual: usize) -> Self {
        NetworkError::DimensionMismatch {
            context,
            expected,
            actual,
        }
    }

    pub(crate) fn dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        NetworkError::DatasetUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
