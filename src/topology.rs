//! Network topology: the ordered sequence of layer sizes.

use crate::error::{NetworkError, Result};
use std::fmt;

/// Layer sizes of the digit classifier shipped with the application.
pub const DIGIT_TOPOLOGY: [usize; 5] = [784, 512, 128, 32, 10];

/// Pixels in a 28×28 digit image.
pub const INPUT_SIZE: usize = 784;

/// Number of digit classes.
pub const CLASS_COUNT: usize = 10;

/// Validated layer-size sequence. Layer 0 is the input, the last layer the output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    layers: Vec<usize>,
}

impl Topology {
    /// Validate and wrap a layer-size sequence.
    ///
    /// Fails with [`NetworkError::InvalidTopology`] for fewer than two layers or
    /// any layer without neurons.
    pub fn new(layers: &[usize]) -> Result<Self> {
        if layers.len() < 2 {
            return Err(NetworkError::InvalidTopology {
                layers: layers.to_vec(),
                reason: "at least an input and an output layer are required".into(),
            });
        }
        if let Some(index) = layers.iter().position(|&n| n == 0) {
            return Err(NetworkError::InvalidTopology {
                layers: layers.to_vec(),
                reason: format!("layer {} has no neurons", index),
            });
        }
        Ok(Self {
            layers: layers.to_vec(),
        })
    }

    /// The canonical `784-512-128-32-10` digit topology.
    pub fn digits() -> Self {
        Self {
            layers: DIGIT_TOPOLOGY.to_vec(),
        }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.layers
    }

    /// Total layer count, input layer included.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Always false; a topology has at least two layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn input_size(&self) -> usize {
        self.layers[0]
    }

    pub fn output_size(&self) -> usize {
        self.layers[self.layers.len() - 1]
    }

    /// Number of layers that carry parameters (every layer but the input).
    pub fn parameter_layers(&self) -> usize {
        self.layers.len() - 1
    }

    /// `(outputs, inputs)` of parameter layer `index` (0-based over non-input layers).
    pub fn layer_shape(&self, index: usize) -> (usize, usize) {
        (self.layers[index + 1], self.layers[index])
    }

    /// Widest layer, used to size shared scratch buffers.
    pub fn max_width(&self) -> usize {
        self.layers.iter().copied().max().unwrap_or(0)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.layers.iter().map(|n| n.to_string()).collect();
        write!(f, "{}", parts.join("-"))
    }
}
