//! Shared utilities: random number generation and scalar activation helpers.

pub mod activations;
pub mod rng;

pub use activations::{argmax, cross_entropy, sigmoid, sigmoid_derivative, softmax_into};
pub use rng::SimpleRng;
