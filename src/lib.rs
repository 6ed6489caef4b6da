//! Digit Recognition Library
//!
//! A fully-connected feed-forward classifier for 28×28 digit images. The
//! network trains with mini-batch gradient descent on a compute backend and
//! serves single-image inference.
//!
//! # Modules
//!
//! - `backend`: compute backend contract and the rayon-based CPU device
//! - `topology`: layer-size sequences
//! - `store`: the host-side Parameter Store
//! - `forward`: the Forward Engine
//! - `training`: the Training Engine, cancellation and reports
//! - `codec`: the binary parameter file
//! - `normalize`: raw pixel buffers to input vectors
//! - `dataset`: IDX and image-folder datasets
//! - `config`: training configuration
//! - `network`: the `Network` facade tying everything together

#[cfg(feature = "blas")]
extern crate blas_src;

pub mod backend;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod error;
pub mod forward;
pub mod layers;
pub mod network;
pub mod normalize;
pub mod store;
pub mod topology;
pub mod training;
pub mod utils;

pub use config::{load_config, TrainingConfig};
pub use dataset::{Dataset, Sample};
pub use error::{NetworkError, Result};
pub use forward::{Evaluation, ForwardMode, ForwardPass};
pub use network::{Network, TrainingJob};
pub use normalize::{InputNormalizer, Polarity};
pub use store::ParameterStore;
pub use topology::{Topology, CLASS_COUNT, DIGIT_TOPOLOGY, INPUT_SIZE};
pub use training::{CancellationToken, EpochSummary, TrainingReport};
