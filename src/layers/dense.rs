//! Dense (fully connected) layer parameters
//!
//! A DenseLayer holds the weights and biases of one non-input layer:
//! `z = W·a_prev + b`, where W has one row per output neuron.

use crate::error::{NetworkError, Result};
use crate::utils::SimpleRng;

/// Weights and biases of one fully connected layer.
///
/// # Fields
///
/// * `input_size` - Neurons in the previous layer
/// * `output_size` - Neurons in this layer
/// * `weights` - Row-major matrix (output_size × input_size)
/// * `biases` - Bias vector (output_size)
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLayer {
    input_size: usize,
    output_size: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl DenseLayer {
    /// Create a DenseLayer with Xavier initialization.
    ///
    /// Weights are sampled from the uniform distribution [-limit, limit] where
    /// limit = sqrt(6 / (input_size + output_size)). Biases start at zero.
    ///
    /// # Example
    ///
    /// ```
    /// use digit_recognition::layers::DenseLayer;
    /// use digit_recognition::utils::SimpleRng;
    ///
    /// let mut rng = SimpleRng::new(42);
    /// let layer = DenseLayer::new(784, 512, &mut rng);
    /// assert_eq!(layer.weights().len(), 784 * 512);
    /// ```
    pub fn new(input_size: usize, output_size: usize, rng: &mut SimpleRng) -> Self {
        let limit = (6.0f32 / (input_size + output_size) as f32).sqrt();
        let weights = (0..input_size * output_size)
            .map(|_| rng.uniform(-limit, limit))
            .collect();

        Self {
            input_size,
            output_size,
            weights,
            biases: vec![0.0f32; output_size],
        }
    }

    /// Layer with every weight and bias set to zero.
    pub fn zeroed(input_size: usize, output_size: usize) -> Self {
        Self {
            input_size,
            output_size,
            weights: vec![0.0f32; input_size * output_size],
            biases: vec![0.0f32; output_size],
        }
    }

    /// Wrap existing parameters, checking their lengths.
    pub fn from_parts(
        input_size: usize,
        output_size: usize,
        weights: Vec<f32>,
        biases: Vec<f32>,
    ) -> Result<Self> {
        if weights.len() != input_size * output_size {
            return Err(NetworkError::dimension(
                "layer weights",
                input_size * output_size,
                weights.len(),
            ));
        }
        if biases.len() != output_size {
            return Err(NetworkError::dimension(
                "layer biases",
                output_size,
                biases.len(),
            ));
        }
        Ok(Self {
            input_size,
            output_size,
            weights,
            biases,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Add `weight_delta` and `bias_delta` element-wise.
    pub fn apply_delta(&mut self, weight_delta: &[f32], bias_delta: &[f32]) -> Result<()> {
        if weight_delta.len() != self.weights.len() {
            return Err(NetworkError::dimension(
                "weight delta",
                self.weights.len(),
                weight_delta.len(),
            ));
        }
        if bias_delta.len() != self.biases.len() {
            return Err(NetworkError::dimension(
                "bias delta",
                self.biases.len(),
                bias_delta.len(),
            ));
        }
        for (w, d) in self.weights.iter_mut().zip(weight_delta) {
            *w += d;
        }
        for (b, d) in self.biases.iter_mut().zip(bias_delta) {
            *b += d;
        }
        Ok(())
    }

    /// input_size × output_size weights plus output_size biases.
    pub fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}
