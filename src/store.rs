//! Parameter Store: the weights and biases of every non-input layer.
//!
//! The store is the host-side source of truth. It is created from a topology,
//! mutated only by training ([`ParameterStore::update`]) or by loading, and read
//! by the forward pass and the codec.

use crate::error::{NetworkError, Result};
use crate::layers::DenseLayer;
use crate::topology::Topology;
use crate::utils::SimpleRng;

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterStore {
    topology: Topology,
    layers: Vec<DenseLayer>,
}

impl ParameterStore {
    /// Allocate Xavier-initialized weights and zero biases for every layer.
    pub fn create(layers: &[usize], rng: &mut SimpleRng) -> Result<Self> {
        let topology = Topology::new(layers)?;
        let layers = (0..topology.parameter_layers())
            .map(|index| {
                let (outputs, inputs) = topology.layer_shape(index);
                DenseLayer::new(inputs, outputs, rng)
            })
            .collect();
        Ok(Self { topology, layers })
    }

    /// Store with every weight and bias set to zero.
    pub fn zeroed(layers: &[usize]) -> Result<Self> {
        let topology = Topology::new(layers)?;
        let layers = (0..topology.parameter_layers())
            .map(|index| {
                let (outputs, inputs) = topology.layer_shape(index);
                DenseLayer::zeroed(inputs, outputs)
            })
            .collect();
        Ok(Self { topology, layers })
    }

    /// Assemble a store from layers whose shapes must chain along `topology`.
    pub(crate) fn from_layers(topology: Topology, layers: Vec<DenseLayer>) -> Result<Self> {
        if layers.len() != topology.parameter_layers() {
            return Err(NetworkError::dimension(
                "parameter layers",
                topology.parameter_layers(),
                layers.len(),
            ));
        }
        for (index, layer) in layers.iter().enumerate() {
            let (outputs, inputs) = topology.layer_shape(index);
            if layer.output_size() != outputs || layer.input_size() != inputs {
                return Err(NetworkError::dimension(
                    "layer shape",
                    outputs * inputs,
                    layer.output_size() * layer.input_size(),
                ));
            }
        }
        Ok(Self { topology, layers })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    /// Read access to `(weights, biases)` of parameter layer `index`.
    pub fn get(&self, index: usize) -> Result<(&[f32], &[f32])> {
        let layer = self.layer(index)?;
        Ok((layer.weights(), layer.biases()))
    }

    pub fn layer(&self, index: usize) -> Result<&DenseLayer> {
        self.layers
            .get(index)
            .ok_or_else(|| NetworkError::dimension("layer index", self.layers.len(), index))
    }

    /// Add `weight_delta` and `bias_delta` to parameter layer `index` in place.
    pub fn update(&mut self, index: usize, weight_delta: &[f32], bias_delta: &[f32]) -> Result<()> {
        let count = self.layers.len();
        self.layers
            .get_mut(index)
            .ok_or_else(|| NetworkError::dimension("layer index", count, index))?
            .apply_delta(weight_delta, bias_delta)
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(DenseLayer::parameter_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_shapes_follow_topology() {
        let store = ParameterStore::create(&[784, 256, 10], &mut SimpleRng::new(1)).unwrap();
        assert_eq!(store.layers().len(), 2);

        let (w0, b0) = store.get(0).unwrap();
        assert_eq!(w0.len(), 256 * 784);
        assert_eq!(b0.len(), 256);

        let (w1, b1) = store.get(1).unwrap();
        assert_eq!(w1.len(), 10 * 256);
        assert_eq!(b1.len(), 10);
        assert_eq!(store.parameter_count(), 256 * 784 + 256 + 10 * 256 + 10);
    }

    #[test]
    fn test_create_rejects_invalid_topology() {
        let err = ParameterStore::create(&[10], &mut SimpleRng::new(1)).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidTopology { .. }));
    }

    #[test]
    fn test_update_is_additive() {
        let mut store = ParameterStore::zeroed(&[2, 1]).unwrap();
        store.update(0, &[0.5, 0.25], &[1.0]).unwrap();
        store.update(0, &[0.5, 0.25], &[1.0]).unwrap();
        let (w, b) = store.get(0).unwrap();
        assert_eq!(w, &[1.0, 0.5]);
        assert_eq!(b, &[2.0]);
    }

    #[test]
    fn test_get_out_of_range() {
        let store = ParameterStore::zeroed(&[2, 1]).unwrap();
        assert!(store.get(1).is_err());
    }
}
