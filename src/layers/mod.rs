//! Layer parameter containers.
//!
//! The network is strictly fully connected, so the only layer type is
//! [`DenseLayer`].

pub mod dense;

pub use dense::DenseLayer;
