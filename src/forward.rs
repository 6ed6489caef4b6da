//! Forward Engine
//!
//! Runs a batch of inputs through every layer on the accelerator:
//! `z = a_prev·Wᵀ + b`, then sigmoid for hidden layers and softmax for the
//! output layer. In [`ForwardMode::Training`] every `z` and `a` is retained for
//! the backward pass; in [`ForwardMode::Inference`] the layers share a single
//! scratch buffer for `z`.

use crate::backend::{Accelerator, GemmShape};
use crate::dataset::Sample;
use crate::error::{NetworkError, Result};
use crate::layers::DenseLayer;
use crate::store::ParameterStore;
use crate::topology::Topology;
use crate::utils::{argmax, cross_entropy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Inference,
    Training,
}

/// Device copy of one layer's parameters.
pub struct DeviceLayer<B> {
    pub(crate) weights: B,
    pub(crate) biases: B,
}

/// Device mirror of a [`ParameterStore`].
pub struct DeviceParameters<B> {
    pub(crate) layers: Vec<DeviceLayer<B>>,
}

impl<B> DeviceParameters<B> {
    /// Allocate device buffers and copy every layer of `store` into them.
    pub fn upload<A>(acc: &mut A, store: &ParameterStore) -> Result<Self>
    where
        A: Accelerator<Buffer = B>,
    {
        let mut layers = Vec::with_capacity(store.layers().len());
        for layer in store.layers() {
            let mut weights = acc.alloc(layer.weights().len())?;
            acc.upload(&mut weights, layer.weights())?;
            let mut biases = acc.alloc(layer.biases().len())?;
            acc.upload(&mut biases, layer.biases())?;
            layers.push(DeviceLayer { weights, biases });
        }
        acc.synchronize()?;
        Ok(Self { layers })
    }

    /// Copy every layer back into a new store laid out along `topology`.
    ///
    /// Nothing is returned unless every layer downloads.
    pub fn download<A>(&self, acc: &mut A, topology: &Topology) -> Result<ParameterStore>
    where
        A: Accelerator<Buffer = B>,
    {
        acc.synchronize()?;
        let mut layers = Vec::with_capacity(self.layers.len());
        for (index, layer) in self.layers.iter().enumerate() {
            let (outputs, inputs) = topology.layer_shape(index);
            let mut weights = vec![0.0f32; outputs * inputs];
            acc.download(&layer.weights, &mut weights)?;
            let mut biases = vec![0.0f32; outputs];
            acc.download(&layer.biases, &mut biases)?;
            layers.push(DenseLayer::from_parts(inputs, outputs, weights, biases)?);
        }
        ParameterStore::from_layers(topology.clone(), layers)
    }
}

/// Per-layer activations of one forward pass, downloaded to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerActivation {
    /// Pre-activation `W·a_prev + b`.
    pub z: Vec<f32>,
    /// Activation: sigmoid for hidden layers, softmax for the output layer.
    pub a: Vec<f32>,
}

/// Result of a single-input forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardPass {
    /// Class probabilities of the output layer.
    pub output: Vec<f32>,
    /// One entry per non-input layer in training mode; empty in inference mode.
    pub layers: Vec<LayerActivation>,
}

/// Device buffers for a batch of up to `capacity` rows.
pub struct Activations<B> {
    pub(crate) mode: ForwardMode,
    pub(crate) capacity: usize,
    pub(crate) input: B,
    pub(crate) zs: Vec<B>,
    pub(crate) outputs: Vec<B>,
}

impl<B> Activations<B> {
    pub fn allocate<A>(
        acc: &mut A,
        topology: &Topology,
        capacity: usize,
        mode: ForwardMode,
    ) -> Result<Self>
    where
        A: Accelerator<Buffer = B>,
    {
        let input = acc.alloc(capacity * topology.input_size())?;
        let widths = &topology.sizes()[1..];

        let zs = match mode {
            ForwardMode::Training => widths
                .iter()
                .map(|&n| acc.alloc(capacity * n))
                .collect::<Result<Vec<_>>>()?,
            ForwardMode::Inference => vec![acc.alloc(capacity * topology.max_width())?],
        };
        let outputs = widths
            .iter()
            .map(|&n| acc.alloc(capacity * n))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mode,
            capacity,
            input,
            zs,
            outputs,
        })
    }

    /// Output-layer buffer (softmax probabilities).
    pub(crate) fn output(&self) -> &B {
        &self.outputs[self.outputs.len() - 1]
    }
}

/// Run the first `rows` inputs already uploaded into `acts.input` through the network.
pub fn forward_batch<A: Accelerator>(
    acc: &mut A,
    params: &DeviceParameters<A::Buffer>,
    topology: &Topology,
    acts: &mut Activations<A::Buffer>,
    rows: usize,
) -> Result<()> {
    if rows > acts.capacity {
        return Err(NetworkError::dimension("batch rows", acts.capacity, rows));
    }
    let last = topology.parameter_layers() - 1;

    for (index, layer) in params.layers.iter().enumerate() {
        let (outputs, inputs) = topology.layer_shape(index);
        let (done, rest) = acts.outputs.split_at_mut(index);
        let prev = if index == 0 {
            &acts.input
        } else {
            &done[index - 1]
        };
        let out = &mut rest[0];
        let z = match acts.mode {
            ForwardMode::Training => &mut acts.zs[index],
            ForwardMode::Inference => &mut acts.zs[0],
        };

        let shape = GemmShape::new(rows, outputs, inputs).transpose_b();
        acc.gemm(shape, prev, &layer.weights, z)?;
        acc.add_row_bias(z, &layer.biases, rows, outputs)?;

        if index == last {
            acc.softmax_rows(z, out, rows, outputs)?;
        } else {
            acc.sigmoid(z, out, rows * outputs)?;
        }
    }
    Ok(())
}

/// Average loss and accuracy of a network over a labelled set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub average_loss: f32,
    pub accuracy: f32,
    pub samples: usize,
}

/// Batched inference over `samples`, accumulating cross-entropy and hits.
pub(crate) fn evaluate<A: Accelerator>(
    acc: &mut A,
    params: &DeviceParameters<A::Buffer>,
    topology: &Topology,
    samples: &[Sample],
    batch_size: usize,
) -> Result<Evaluation> {
    let batch_size = batch_size.max(1).min(samples.len().max(1));
    let (input_size, output_size) = (topology.input_size(), topology.output_size());
    let mut acts = Activations::allocate(acc, topology, batch_size, ForwardMode::Inference)?;
    let mut inputs = vec![0.0f32; batch_size * input_size];
    let mut probabilities = vec![0.0f32; batch_size * output_size];

    let mut total_loss = 0.0f32;
    let mut correct = 0usize;
    for batch in samples.chunks(batch_size) {
        let rows = batch.len();
        for (sample, dst) in batch.iter().zip(inputs.chunks_exact_mut(input_size)) {
            if sample.input.len() != input_size {
                return Err(NetworkError::dimension(
                    "sample input",
                    input_size,
                    sample.input.len(),
                ));
            }
            dst.copy_from_slice(&sample.input);
        }

        acc.upload(&mut acts.input, &inputs[..rows * input_size])?;
        forward_batch(acc, params, topology, &mut acts, rows)?;
        acc.synchronize()?;
        acc.download(acts.output(), &mut probabilities[..rows * output_size])?;

        for (sample, row) in batch.iter().zip(probabilities.chunks_exact(output_size)) {
            let label = sample.label as usize;
            if label >= output_size {
                return Err(NetworkError::dimension("label", output_size, label));
            }
            total_loss += cross_entropy(row, label);
            if argmax(row) == label {
                correct += 1;
            }
        }
    }

    let count = samples.len().max(1) as f32;
    Ok(Evaluation {
        average_loss: total_loss / count,
        accuracy: correct as f32 / count,
        samples: samples.len(),
    })
}
